//! RFC 3862 `message/cpim` envelopes.
//!
//! The envelope has a block of message headers, a blank line, the content headers, a
//! blank line and the raw body. Namespaced headers (`imdn.Message-ID`) need a matching
//! `NS:` declaration. The encoder emits the declarations ahead of the headers that use them.

use chrono::{DateTime, FixedOffset, SecondsFormat};

use crate::uri::ChatIdentity;
use crate::{content_types, Disposition};

pub const IMDN_NAMESPACE: &str = "urn:ietf:params:imdn";
const IMDN_PREFIX: &str = "imdn";
const CRLF: &str = "\r\n";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CpimNamespace {
    pub uri: String,
    pub prefix: String,
}

impl CpimNamespace {
    pub fn new(uri: &str, prefix: &str) -> Self {
        Self {
            uri: uri.to_string(),
            prefix: prefix.to_string(),
        }
    }

    pub fn imdn() -> Self {
        Self::new(IMDN_NAMESPACE, IMDN_PREFIX)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpimHeader {
    pub name: String,
    pub namespace: Option<CpimNamespace>,
    pub value: String,
}

impl CpimHeader {
    pub fn new(name: &str, namespace: Option<CpimNamespace>, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            namespace,
            value: value.into(),
        }
    }

    pub fn imdn(name: &str, value: impl Into<String>) -> Self {
        Self::new(name, Some(CpimNamespace::imdn()), value)
    }

    fn is(&self, namespace_uri: &str, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
            && self.namespace.as_ref().map(|n| n.uri.as_str()) == Some(namespace_uri)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CpimPayload {
    pub content: Vec<u8>,
    pub content_type: String,
    pub charset: Option<String>,
    pub sender: Option<ChatIdentity>,
    pub recipients: Vec<ChatIdentity>,
    pub timestamp: Option<DateTime<FixedOffset>>,
    pub additional_headers: Vec<CpimHeader>,
}

impl CpimPayload {
    pub fn new(content: impl Into<Vec<u8>>, content_type: &str) -> Self {
        let charset = content_types::is_text(content_type).then(|| "utf-8".to_string());
        Self {
            content: content.into(),
            content_type: content_type.to_string(),
            charset,
            sender: None,
            recipients: Vec::new(),
            timestamp: None,
            additional_headers: Vec::new(),
        }
    }

    pub fn header(&self, namespace_uri: &str, name: &str) -> Option<&str> {
        self.additional_headers
            .iter()
            .find(|h| h.is(namespace_uri, name))
            .map(|h| h.value.as_str())
    }

    pub fn message_id(&self) -> Option<&str> {
        self.header(IMDN_NAMESPACE, "Message-ID")
    }

    pub fn disposition(&self) -> Option<Vec<Disposition>> {
        self.header(IMDN_NAMESPACE, "Disposition-Notification")
            .map(Disposition::parse_list)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CpimParseError {
    #[error("missing blank line after {0} headers")]
    MissingSeparator(&'static str),
    #[error("missing Content-Type header")]
    MissingContentType,
    #[error("header block is not valid UTF-8")]
    InvalidEncoding,
    #[error("malformed header line: {0}")]
    InvalidHeader(String),
    #[error("header uses undeclared namespace prefix: {0}")]
    UndeclaredNamespace(String),
    #[error("invalid identity in {header} header: {value}")]
    InvalidIdentity { header: &'static str, value: String },
    #[error("invalid DateTime: {0}")]
    InvalidDateTime(String),
}

pub struct CpimCodec;

impl CpimCodec {
    /// Serializes the payload, returning the body and its outer content type.
    pub fn encode(payload: &CpimPayload) -> (Vec<u8>, &'static str) {
        let mut head = String::new();

        if let Some(sender) = &payload.sender {
            push_header(&mut head, "From", &sender.to_string());
        }
        for recipient in &payload.recipients {
            push_header(&mut head, "To", &recipient.to_string());
        }
        if let Some(timestamp) = &payload.timestamp {
            push_header(
                &mut head,
                "DateTime",
                &timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            );
        }

        let mut declared: Vec<&CpimNamespace> = Vec::new();
        for namespace in payload.additional_headers.iter().filter_map(|h| h.namespace.as_ref()) {
            if !declared.iter().any(|d| d.prefix == namespace.prefix) {
                declared.push(namespace);
            }
        }
        for namespace in &declared {
            let value = if namespace.prefix.is_empty() {
                format!("<{}>", namespace.uri)
            } else {
                format!("{} <{}>", namespace.prefix, namespace.uri)
            };
            push_header(&mut head, "NS", &value);
        }

        for header in &payload.additional_headers {
            match &header.namespace {
                Some(ns) if !ns.prefix.is_empty() => {
                    let name = format!("{}.{}", ns.prefix, header.name);
                    push_header(&mut head, &name, &header.value);
                }
                _ => push_header(&mut head, &header.name, &header.value),
            }
        }

        head.push_str(CRLF);
        let content_type = match &payload.charset {
            Some(charset) => format!("{}; charset={}", payload.content_type, charset),
            None => payload.content_type.clone(),
        };
        push_header(&mut head, "Content-Type", &content_type);
        head.push_str(CRLF);

        let mut out = head.into_bytes();
        out.extend_from_slice(&payload.content);
        (out, content_types::CPIM)
    }

    pub fn decode(data: &[u8]) -> Result<CpimPayload, CpimParseError> {
        let (message_block, rest) =
            split_block(data).ok_or(CpimParseError::MissingSeparator("message"))?;
        let (content_block, body) =
            split_block(rest).ok_or(CpimParseError::MissingSeparator("content"))?;

        let message_headers = parse_block(message_block)?;
        let content_headers = parse_block(content_block)?;

        let mut namespaces: Vec<CpimNamespace> = Vec::new();
        for (name, value) in &message_headers {
            if name.eq_ignore_ascii_case("NS") {
                namespaces.push(parse_namespace(value)?);
            }
        }

        let mut payload = CpimPayload {
            content: body.to_vec(),
            content_type: String::new(),
            charset: None,
            sender: None,
            recipients: Vec::new(),
            timestamp: None,
            additional_headers: Vec::new(),
        };

        for (name, value) in message_headers {
            if let Some((prefix, local)) = name.split_once('.') {
                let namespace = namespaces
                    .iter()
                    .find(|n| n.prefix == prefix)
                    .cloned()
                    .ok_or_else(|| CpimParseError::UndeclaredNamespace(prefix.to_string()))?;
                payload
                    .additional_headers
                    .push(CpimHeader::new(local, Some(namespace), value));
                continue;
            }

            match name.to_ascii_lowercase().as_str() {
                "ns" => {}
                "from" => {
                    let identity = ChatIdentity::parse(&value).map_err(|_| {
                        CpimParseError::InvalidIdentity { header: "From", value: value.clone() }
                    })?;
                    payload.sender = Some(identity);
                }
                "to" => {
                    let identity = ChatIdentity::parse(&value).map_err(|_| {
                        CpimParseError::InvalidIdentity { header: "To", value: value.clone() }
                    })?;
                    payload.recipients.push(identity);
                }
                "datetime" => {
                    let timestamp = DateTime::parse_from_rfc3339(&value)
                        .map_err(|_| CpimParseError::InvalidDateTime(value.clone()))?;
                    payload.timestamp = Some(timestamp);
                }
                _ => {
                    // Headers in the default namespace, if one was declared.
                    let namespace = namespaces.iter().find(|n| n.prefix.is_empty()).cloned();
                    payload
                        .additional_headers
                        .push(CpimHeader::new(&name, namespace, value));
                }
            }
        }

        let content_type = content_headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("Content-Type"))
            .map(|(_, value)| value.as_str())
            .ok_or(CpimParseError::MissingContentType)?;
        let mut parts = content_type.split(';');
        payload.content_type = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
        if payload.content_type.is_empty() {
            return Err(CpimParseError::MissingContentType);
        }
        payload.charset = parts
            .filter_map(|p| p.split_once('='))
            .find(|(k, _)| k.trim().eq_ignore_ascii_case("charset"))
            .map(|(_, v)| v.trim().trim_matches('"').to_string());

        Ok(payload)
    }
}

fn push_header(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    out.push_str(value);
    out.push_str(CRLF);
}

/// Splits at the first empty line, accepting CRLF or bare LF line endings.
fn split_block(data: &[u8]) -> Option<(&[u8], &[u8])> {
    let mut start = 0;
    loop {
        let end = start + data[start..].iter().position(|b| *b == b'\n')?;
        let line = &data[start..end];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            return Some((&data[..start], &data[end + 1..]));
        }
        start = end + 1;
    }
}

fn parse_block(block: &[u8]) -> Result<Vec<(String, String)>, CpimParseError> {
    let text = std::str::from_utf8(block).map_err(|_| CpimParseError::InvalidEncoding)?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| CpimParseError::InvalidHeader(line.to_string()))?;
            let name = name.trim();
            if name.is_empty() || name.contains(char::is_whitespace) {
                return Err(CpimParseError::InvalidHeader(line.to_string()));
            }
            Ok((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

fn parse_namespace(value: &str) -> Result<CpimNamespace, CpimParseError> {
    let open = value
        .find('<')
        .ok_or_else(|| CpimParseError::InvalidHeader(format!("NS: {}", value)))?;
    let uri = value[open + 1..]
        .strip_suffix('>')
        .ok_or_else(|| CpimParseError::InvalidHeader(format!("NS: {}", value)))?;
    Ok(CpimNamespace::new(uri.trim(), value[..open].trim()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uri::SipUri;

    fn alice() -> ChatIdentity {
        ChatIdentity::new(SipUri::parse("sip:a@example.com").unwrap(), Some("Alice".into()))
    }

    fn bob() -> ChatIdentity {
        ChatIdentity::new(SipUri::parse("sip:b@example.com").unwrap(), None)
    }

    #[test]
    fn encodes_canonical_layout() {
        let mut payload = CpimPayload::new("hi", "text/plain");
        payload.sender = Some(alice());
        payload.recipients = vec![bob()];
        payload.timestamp = Some(DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap());
        payload.additional_headers = vec![
            CpimHeader::imdn("Message-ID", "abc"),
            CpimHeader::imdn("Disposition-Notification", "positive-delivery, display"),
        ];

        let (bytes, content_type) = CpimCodec::encode(&payload);
        assert_eq!(content_type, "message/cpim");
        let expected = "From: \"Alice\" <sip:a@example.com>\r\n\
                        To: <sip:b@example.com>\r\n\
                        DateTime: 2024-01-01T00:00:00Z\r\n\
                        NS: imdn <urn:ietf:params:imdn>\r\n\
                        imdn.Message-ID: abc\r\n\
                        imdn.Disposition-Notification: positive-delivery, display\r\n\
                        \r\n\
                        Content-Type: text/plain; charset=utf-8\r\n\
                        \r\n\
                        hi";
        assert_eq!(String::from_utf8(bytes).unwrap(), expected);
    }

    #[test]
    fn decode_restores_encoded_payload() {
        let mut payload = CpimPayload::new("line one\r\n\r\nline three", "text/html");
        payload.sender = Some(alice());
        payload.recipients = vec![bob(), alice()];
        payload.timestamp =
            Some(DateTime::parse_from_rfc3339("2024-05-06T07:08:09.250+02:00").unwrap());
        payload.additional_headers = vec![
            CpimHeader::imdn("Message-ID", "4c1f"),
            CpimHeader::new("Key", Some(CpimNamespace::new("urn:example", "ex")), "v"),
        ];

        let (bytes, _) = CpimCodec::encode(&payload);
        let decoded = CpimCodec::decode(&bytes).unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(decoded.message_id(), Some("4c1f"));
    }

    #[test]
    fn decode_accepts_bare_newlines_and_reads_disposition() {
        let raw = b"From: <sip:a@example.com>\n\
                    NS: imdn <urn:ietf:params:imdn>\n\
                    imdn.Message-ID: xyz\n\
                    imdn.Disposition-Notification: positive-delivery\n\
                    \n\
                    Content-Type: text/plain\n\
                    \n\
                    body";
        let decoded = CpimCodec::decode(raw).unwrap();
        assert_eq!(decoded.content, b"body");
        assert_eq!(decoded.content_type, "text/plain");
        assert_eq!(decoded.charset, None);
        assert_eq!(decoded.timestamp, None);
        assert_eq!(decoded.disposition(), Some(vec![Disposition::PositiveDelivery]));
    }

    #[test]
    fn decode_rejects_malformed_input() {
        assert_eq!(
            CpimCodec::decode(b"From: <sip:a@example.com>\r\n"),
            Err(CpimParseError::MissingSeparator("message"))
        );
        assert_eq!(
            CpimCodec::decode(b"To: <sip:b@example.com>\r\n\r\nContent-ID: x\r\n\r\nbody"),
            Err(CpimParseError::MissingContentType)
        );
        assert_eq!(
            CpimCodec::decode(b"imdn.Message-ID: 1\r\n\r\nContent-Type: text/plain\r\n\r\n"),
            Err(CpimParseError::UndeclaredNamespace("imdn".into()))
        );
        assert!(matches!(
            CpimCodec::decode(b"DateTime: yesterday\r\n\r\nContent-Type: text/plain\r\n\r\n"),
            Err(CpimParseError::InvalidDateTime(_))
        ));
        assert!(matches!(
            CpimCodec::decode(b"garbage line\r\n\r\nContent-Type: text/plain\r\n\r\n"),
            Err(CpimParseError::InvalidHeader(_))
        ));
    }
}
