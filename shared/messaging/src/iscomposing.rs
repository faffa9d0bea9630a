//! RFC 3994 `application/im-iscomposing+xml` documents.

use chrono::{DateTime, FixedOffset, SecondsFormat};
use serde::{Deserialize, Serialize};

use crate::{xml_escape, MessagingError, Result};

pub const NAMESPACE: &str = "urn:ietf:params:xml:ns:im-iscomposing";
pub const DEFAULT_REFRESH: u32 = 120;
const DOCUMENT: &str = "isComposing";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComposingState {
    Active,
    Idle,
}

impl ComposingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComposingState::Active => "active",
            ComposingState::Idle => "idle",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IsComposingDocument {
    pub state: ComposingState,
    pub refresh: Option<u32>,
    pub content_type: Option<String>,
    pub last_active: Option<DateTime<FixedOffset>>,
}

impl IsComposingDocument {
    pub fn new(state: ComposingState) -> Self {
        Self {
            state,
            refresh: None,
            content_type: Some("text".to_string()),
            last_active: None,
        }
    }

    /// Seconds until the indication lapses if nothing else arrives.
    pub fn effective_refresh(&self) -> u32 {
        self.refresh.unwrap_or(DEFAULT_REFRESH)
    }

    pub fn to_xml(&self) -> String {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        xml.push_str(&format!("<isComposing xmlns=\"{}\">\n", NAMESPACE));
        xml.push_str(&format!("  <state>{}</state>\n", self.state.as_str()));
        if let Some(last_active) = &self.last_active {
            xml.push_str(&format!(
                "  <lastactive>{}</lastactive>\n",
                last_active.to_rfc3339_opts(SecondsFormat::AutoSi, true)
            ));
        }
        if let Some(content_type) = &self.content_type {
            xml.push_str(&format!(
                "  <contenttype>{}</contenttype>\n",
                xml_escape(content_type)
            ));
        }
        if let Some(refresh) = self.refresh {
            xml.push_str(&format!("  <refresh>{}</refresh>\n", refresh));
        }
        xml.push_str("</isComposing>\n");
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

        let child_text = |name: &str| {
            root.children()
                .find(|n| n.is_element() && n.tag_name().name() == name)
                .and_then(|n| n.text())
                .map(str::trim)
        };

        let state = match child_text("state") {
            Some("active") => ComposingState::Active,
            Some("idle") => ComposingState::Idle,
            Some(other) => return Err(invalid(format!("unknown state {}", other))),
            None => return Err(invalid("missing state".to_string())),
        };
        let refresh = child_text("refresh")
            .map(|r| r.parse::<u32>().map_err(|_| invalid(format!("bad refresh {}", r))))
            .transpose()?;
        let last_active = child_text("lastactive")
            .map(|v| {
                DateTime::parse_from_rfc3339(v).map_err(|_| invalid(format!("bad lastactive {}", v)))
            })
            .transpose()?;
        let content_type = child_text("contenttype").map(str::to_owned);

        Ok(Self {
            state,
            refresh,
            content_type,
            last_active,
        })
    }
}

fn invalid(reason: String) -> MessagingError {
    MessagingError::InvalidDocument {
        document: DOCUMENT,
        reason,
    }
}
