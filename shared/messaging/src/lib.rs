//! Message model and the instant-messaging payloads carried inside SIP MESSAGE requests.

pub mod cpim;
pub mod imdn;
pub mod iscomposing;
pub mod uri;

pub use cpim::{CpimCodec, CpimHeader, CpimNamespace, CpimParseError, CpimPayload};
pub use imdn::{ImdnDocument, NotificationKind, NotificationStatus};
pub use iscomposing::{ComposingState, IsComposingDocument};
pub use uri::{ChatIdentity, Scheme, SipUri};

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Well-known MIME types handled by the messaging core.
pub mod content_types {
    pub const TEXT_PLAIN: &str = "text/plain";
    pub const TEXT_HTML: &str = "text/html";
    pub const CPIM: &str = "message/cpim";
    pub const IMDN: &str = "message/imdn+xml";
    pub const IS_COMPOSING: &str = "application/im-iscomposing+xml";
    pub const PGP_PUBLIC_KEY: &str = "text/pgp-public-key";
    pub const PGP_PRIVATE_KEY: &str = "text/pgp-private-key";

    /// Composing indications and notifications: never reported as pending/succeeded/failed
    /// and never allowed to create a session on their own.
    pub fn is_ephemeral(content_type: &str) -> bool {
        content_type.eq_ignore_ascii_case(IS_COMPOSING) || content_type.eq_ignore_ascii_case(IMDN)
    }

    /// Key exchange bodies share the ephemeral rules for user-facing events.
    pub fn is_key_material(content_type: &str) -> bool {
        content_type.eq_ignore_ascii_case(PGP_PUBLIC_KEY)
            || content_type.eq_ignore_ascii_case(PGP_PRIVATE_KEY)
    }

    /// Whether a `Disposition-Notification` may be requested for this content type.
    pub fn accepts_disposition(content_type: &str) -> bool {
        !is_ephemeral(content_type) && !is_key_material(content_type)
    }

    pub fn is_text(content_type: &str) -> bool {
        content_type
            .get(..5)
            .map(|p| p.eq_ignore_ascii_case("text/"))
            .unwrap_or(false)
    }
}

/// Identifier correlating a message with its delivery and display notifications.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Disposition {
    PositiveDelivery,
    NegativeDelivery,
    Display,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::PositiveDelivery => "positive-delivery",
            Disposition::NegativeDelivery => "negative-delivery",
            Disposition::Display => "display",
        }
    }

    /// Parses a `Disposition-Notification` header value; unknown tokens are skipped.
    pub fn parse_list(value: &str) -> Vec<Disposition> {
        value
            .split(',')
            .filter_map(|item| match item.trim().to_ascii_lowercase().as_str() {
                "positive-delivery" => Some(Disposition::PositiveDelivery),
                "negative-delivery" => Some(Disposition::NegativeDelivery),
                "display" => Some(Disposition::Display),
                _ => None,
            })
            .collect()
    }

    pub fn format_list(items: &[Disposition]) -> String {
        items
            .iter()
            .map(Disposition::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// A chat message as seen by observers, either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub content: Vec<u8>,
    pub content_type: String,
    pub sender: Option<ChatIdentity>,
    pub recipients: Vec<ChatIdentity>,
    pub timestamp: DateTime<FixedOffset>,
    pub disposition: Option<Vec<Disposition>>,
    pub is_secure: bool,
    pub direction: Direction,
}

impl Message {
    pub fn new(content: impl Into<Vec<u8>>, content_type: &str, direction: Direction) -> Self {
        Self {
            id: MessageId::new(),
            content: content.into(),
            content_type: content_type.to_ascii_lowercase(),
            sender: None,
            recipients: Vec::new(),
            timestamp: Utc::now().fixed_offset(),
            disposition: None,
            is_secure: false,
            direction,
        }
    }

    pub fn with_id(mut self, id: Option<MessageId>) -> Self {
        if let Some(id) = id {
            self.id = id;
        }
        self
    }

    pub fn with_timestamp(mut self, timestamp: Option<DateTime<FixedOffset>>) -> Self {
        if let Some(timestamp) = timestamp {
            self.timestamp = timestamp;
        }
        self
    }

    /// The body as UTF-8 text, if it is valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.content).ok()
    }

    pub fn wants(&self, disposition: Disposition) -> bool {
        self.disposition
            .as_ref()
            .map(|d| d.contains(&disposition))
            .unwrap_or(false)
    }
}

/// Messaging-specific errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessagingError {
    #[error("invalid SIP URI: {0}")]
    InvalidUri(String),
    #[error("malformed XML body: {0}")]
    InvalidXml(String),
    #[error("invalid {document} document: {reason}")]
    InvalidDocument {
        document: &'static str,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, MessagingError>;

/// Minimal XML text escaping for generated documents.
pub(crate) fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_defaults() {
        let message = Message::new("hello", "Text/Plain", Direction::Outgoing);
        assert_eq!(message.content_type, "text/plain");
        assert_eq!(message.text(), Some("hello"));
        assert!(!message.is_secure);
        assert!(!message.id.as_str().is_empty());
    }

    #[test]
    fn explicit_id_is_kept() {
        let message = Message::new("hi", content_types::TEXT_PLAIN, Direction::Outgoing)
            .with_id(Some(MessageId::from("abc")));
        assert_eq!(message.id.as_str(), "abc");
    }

    #[test]
    fn disposition_list_parsing() {
        let parsed = Disposition::parse_list("positive-delivery, Display, unknown");
        assert_eq!(parsed, vec![Disposition::PositiveDelivery, Disposition::Display]);
        assert_eq!(Disposition::format_list(&parsed), "positive-delivery, display");
    }

    #[test]
    fn content_type_classes() {
        assert!(content_types::is_ephemeral("application/im-iscomposing+xml"));
        assert!(content_types::is_ephemeral("message/imdn+xml"));
        assert!(!content_types::accepts_disposition("text/pgp-public-key"));
        assert!(content_types::accepts_disposition("text/plain"));
        assert!(content_types::is_text("TEXT/html"));
        assert!(!content_types::is_text("message/cpim"));
    }

    #[test]
    fn escaped_text_reads_back_through_the_parser() {
        let raw = r#"<tag attr="x"> & 'quoted' </tag>"#;
        let xml = format!(
            "<root attr=\"{}\">{}</root>",
            xml_escape(raw),
            xml_escape(raw)
        );
        let doc = roxmltree::Document::parse(&xml).unwrap();
        let root = doc.root_element();
        assert_eq!(root.text(), Some(raw));
        assert_eq!(root.attribute("attr"), Some(raw));
    }

    #[test]
    fn message_serializes_with_kebab_dispositions() {
        let mut message = Message::new("x", content_types::TEXT_PLAIN, Direction::Incoming);
        message.disposition = Some(vec![Disposition::PositiveDelivery]);
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["disposition"][0], "positive-delivery");
        assert_eq!(json["direction"], "incoming");
    }
}
