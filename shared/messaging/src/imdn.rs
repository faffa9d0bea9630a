//! RFC 5438 `message/imdn+xml` disposition notifications.

use chrono::{DateTime, FixedOffset, SecondsFormat};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::uri::SipUri;
use crate::{xml_escape, MessageId, MessagingError, Result};

pub const NAMESPACE: &str = "urn:ietf:params:xml:ns:imdn";
const DOCUMENT: &str = "imdn";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Delivery,
    Display,
}

impl NotificationKind {
    fn element(&self) -> &'static str {
        match self {
            NotificationKind::Delivery => "delivery-notification",
            NotificationKind::Display => "display-notification",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Delivered,
    Displayed,
    Failed,
    Forbidden,
    Error,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Delivered => "delivered",
            NotificationStatus::Displayed => "displayed",
            NotificationStatus::Failed => "failed",
            NotificationStatus::Forbidden => "forbidden",
            NotificationStatus::Error => "error",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "delivered" => Some(NotificationStatus::Delivered),
            "displayed" => Some(NotificationStatus::Displayed),
            "failed" => Some(NotificationStatus::Failed),
            "forbidden" => Some(NotificationStatus::Forbidden),
            "error" => Some(NotificationStatus::Error),
            _ => None,
        }
    }

    /// `delivered` travels as a delivery notification; the other statuses we send
    /// are display notifications.
    pub fn kind(&self) -> NotificationKind {
        match self {
            NotificationStatus::Delivered | NotificationStatus::Failed => NotificationKind::Delivery,
            _ => NotificationKind::Display,
        }
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImdnDocument {
    pub message_id: MessageId,
    pub datetime: DateTime<FixedOffset>,
    pub recipient_uri: Option<SipUri>,
    pub kind: NotificationKind,
    pub status: NotificationStatus,
}

impl ImdnDocument {
    pub fn new(
        message_id: MessageId,
        datetime: DateTime<FixedOffset>,
        recipient_uri: Option<SipUri>,
        status: NotificationStatus,
    ) -> Self {
        Self {
            message_id,
            datetime,
            recipient_uri,
            kind: status.kind(),
            status,
        }
    }

    pub fn to_xml(&self) -> String {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        xml.push_str(&format!("<imdn xmlns=\"{}\">\n", NAMESPACE));
        xml.push_str(&format!(
            "  <message-id>{}</message-id>\n",
            xml_escape(self.message_id.as_str())
        ));
        xml.push_str(&format!(
            "  <datetime>{}</datetime>\n",
            self.datetime.to_rfc3339_opts(SecondsFormat::AutoSi, true)
        ));
        if let Some(uri) = &self.recipient_uri {
            xml.push_str(&format!(
                "  <recipient-uri>{}</recipient-uri>\n",
                xml_escape(&uri.to_string())
            ));
        }
        xml.push_str(&format!(
            "  <{kind}><status><{status}/></status></{kind}>\n",
            kind = self.kind.element(),
            status = self.status.as_str()
        ));
        xml.push_str("</imdn>\n");
        xml
    }

    pub fn parse(body: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(body)
            .map_err(|e| MessagingError::InvalidXml(format!("not utf-8: {}", e)))?;
        let doc = roxmltree::Document::parse(text)
            .map_err(|e| MessagingError::InvalidXml(e.to_string()))?;
        let root = doc.root_element();
        if root.tag_name().name() != DOCUMENT || root.tag_name().namespace() != Some(NAMESPACE) {
            return Err(invalid(format!("unexpected root element {:?}", root.tag_name())));
        }

        let child = |name: &str| {
            root.children()
                .find(|n| n.is_element() && n.tag_name().name() == name)
        };
        let child_text = |name: &str| child(name).and_then(|n| n.text()).map(str::trim);

        let message_id = child_text("message-id")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| invalid("missing message-id".to_string()))?;
        let datetime = child_text("datetime")
            .ok_or_else(|| invalid("missing datetime".to_string()))
            .and_then(|v| {
                DateTime::parse_from_rfc3339(v).map_err(|_| invalid(format!("bad datetime {}", v)))
            })?;
        let recipient_uri = child_text("recipient-uri").and_then(|v| SipUri::parse(v).ok());

        let (kind, notification) = [NotificationKind::Delivery, NotificationKind::Display]
            .into_iter()
            .find_map(|kind| child(kind.element()).map(|node| (kind, node)))
            .ok_or_else(|| invalid("no notification element".to_string()))?;
        let status = notification
            .children()
            .find(|n| n.is_element() && n.tag_name().name() == "status")
            .and_then(|s| s.children().find(|n| n.is_element()))
            .and_then(|n| NotificationStatus::parse(n.tag_name().name()))
            .ok_or_else(|| invalid("missing or unknown status".to_string()))?;

        Ok(Self {
            message_id: MessageId::from(message_id),
            datetime,
            recipient_uri,
            kind,
            status,
        })
    }
}

fn invalid(reason: String) -> MessagingError {
    MessagingError::InvalidDocument {
        document: DOCUMENT,
        reason,
    }
}
