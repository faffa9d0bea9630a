//! SIP URIs and the `"Name" <sip:user@host>` identities carried in From/To and CPIM headers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{MessagingError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Sip,
    Sips,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Sip => f.write_str("sip"),
            Scheme::Sips => f.write_str("sips"),
        }
    }
}

/// A parsed `sip:` / `sips:` URI.
///
/// Equality compares every component, including parameters. Use [`SipUri::bare`]
/// when the URI is a lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SipUri {
    pub scheme: Scheme,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub parameters: Vec<(String, Option<String>)>,
}

impl SipUri {
    pub fn new(user: Option<&str>, host: &str) -> Self {
        Self {
            scheme: Scheme::Sip,
            user: user.map(str::to_owned),
            host: host.to_ascii_lowercase(),
            port: None,
            parameters: Vec::new(),
        }
    }

    pub fn parse(input: &str) -> Result<Self> {
        let raw = input.trim();
        let raw = raw
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
            .unwrap_or(raw);

        let (scheme, rest) = if let Some(rest) = strip_prefix_ignore_case(raw, "sips:") {
            (Scheme::Sips, rest)
        } else if let Some(rest) = strip_prefix_ignore_case(raw, "sip:") {
            (Scheme::Sip, rest)
        } else {
            return Err(MessagingError::InvalidUri(input.to_string()));
        };

        let mut segments = rest.split(';');
        let address = segments.next().unwrap_or_default();
        let parameters = segments
            .filter(|s| !s.is_empty())
            .map(|p| match p.split_once('=') {
                Some((k, v)) => (k.to_string(), Some(v.to_string())),
                None => (p.to_string(), None),
            })
            .collect();

        let (user, hostport) = match address.rsplit_once('@') {
            Some((user, hostport)) if !user.is_empty() => (Some(user.to_string()), hostport),
            Some(_) => return Err(MessagingError::InvalidUri(input.to_string())),
            None => (None, address),
        };

        let (host, port) = split_host_port(hostport)
            .ok_or_else(|| MessagingError::InvalidUri(input.to_string()))?;

        Ok(Self {
            scheme,
            user,
            host: host.to_ascii_lowercase(),
            port,
            parameters,
        })
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_deref())
    }

    /// `sip:user@host` without port or parameters.
    pub fn bare(&self) -> SipUri {
        SipUri {
            scheme: Scheme::Sip,
            user: self.user.clone(),
            host: self.host.clone(),
            port: None,
            parameters: Vec::new(),
        }
    }

    /// `user@host`, or just `host` for user-less URIs.
    pub fn address(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    /// The GRUU-style instance id advertised by the remote endpoint, if any.
    pub fn instance_id(&self) -> Option<&str> {
        let value = self.parameter("instance_id").or_else(|| self.parameter("gr"))?;
        let value = value.trim_matches('"');
        let value = value.strip_prefix("urn:uuid:").unwrap_or(value);
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }
}

fn strip_prefix_ignore_case<'a>(input: &'a str, prefix: &str) -> Option<&'a str> {
    match input.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => Some(&input[prefix.len()..]),
        _ => None,
    }
}

fn split_host_port(hostport: &str) -> Option<(&str, Option<u16>)> {
    if hostport.is_empty() {
        return None;
    }
    if let Some(rest) = hostport.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(p.parse().ok()?),
            None if tail.is_empty() => None,
            None => return None,
        };
        return Some((host, port));
    }
    match hostport.split_once(':') {
        Some((host, port)) if !host.is_empty() => Some((host, Some(port.parse().ok()?))),
        Some(_) => None,
        None => Some((hostport, None)),
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (key, value) in &self.parameters {
            match value {
                Some(value) => write!(f, ";{}={}", key, value)?,
                None => write!(f, ";{}", key)?,
            }
        }
        Ok(())
    }
}

impl FromStr for SipUri {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SipUri {
    type Error = MessagingError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<SipUri> for String {
    fn from(uri: SipUri) -> Self {
        uri.to_string()
    }
}

/// A SIP URI with an optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatIdentity {
    pub uri: SipUri,
    pub display_name: Option<String>,
}

impl ChatIdentity {
    pub fn new(uri: SipUri, display_name: Option<String>) -> Self {
        Self {
            uri,
            display_name: display_name.filter(|n| !n.is_empty()),
        }
    }

    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let Some(open) = input.find('<') else {
            return Ok(Self::new(SipUri::parse(input)?, None));
        };
        let close = input[open..]
            .find('>')
            .map(|i| i + open)
            .ok_or_else(|| MessagingError::InvalidUri(input.to_string()))?;
        let uri = SipUri::parse(&input[open + 1..close])?;

        let name = input[..open].trim();
        let display_name = if let Some(quoted) = name.strip_prefix('"').and_then(|n| n.strip_suffix('"')) {
            Some(unescape_quoted(quoted))
        } else if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        };
        Ok(Self::new(uri, display_name))
    }
}

fn unescape_quoted(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

impl From<SipUri> for ChatIdentity {
    fn from(uri: SipUri) -> Self {
        Self::new(uri, None)
    }
}

impl fmt::Display for ChatIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display_name {
            Some(name) => {
                let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
                write!(f, "\"{}\" <{}>", escaped, self.uri)
            }
            None => write!(f, "<{}>", self.uri),
        }
    }
}

impl FromStr for ChatIdentity {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_uri() {
        let uri = SipUri::parse("sips:Alice@Example.COM:5061;transport=tls;lr").unwrap();
        assert_eq!(uri.scheme, Scheme::Sips);
        assert_eq!(uri.user.as_deref(), Some("Alice"));
        assert_eq!(uri.host, "example.com");
        assert_eq!(uri.port, Some(5061));
        assert_eq!(uri.parameter("transport"), Some("tls"));
        assert_eq!(uri.to_string(), "sips:Alice@example.com:5061;transport=tls;lr");
    }

    #[test]
    fn bare_strips_port_and_parameters() {
        let uri: SipUri = "<sip:b@example.com:5060;transport=tcp>".parse().unwrap();
        assert_eq!(uri.bare().to_string(), "sip:b@example.com");
        assert_eq!(uri.address(), "b@example.com");
    }

    #[test]
    fn ipv6_host_round_trips() {
        let uri = SipUri::parse("sip:[2001:db8::1]:5070").unwrap();
        assert_eq!(uri.host, "2001:db8::1");
        assert_eq!(uri.port, Some(5070));
        assert_eq!(uri.to_string(), "sip:[2001:db8::1]:5070");
    }

    #[test]
    fn instance_id_drops_urn_prefix() {
        let uri = SipUri::parse("sip:b@example.com;instance_id=urn:uuid:1234-abcd").unwrap();
        assert_eq!(uri.instance_id(), Some("1234-abcd"));
        assert_eq!(SipUri::parse("sip:b@example.com").unwrap().instance_id(), None);
    }

    #[test]
    fn rejects_non_sip() {
        assert!(SipUri::parse("mailto:a@example.com").is_err());
        assert!(SipUri::parse("sip:@example.com").is_err());
        assert!(SipUri::parse("sip:a@example.com:port").is_err());
    }

    #[test]
    fn identity_forms() {
        let quoted = ChatIdentity::parse("\"Alice \\\"A\\\"\" <sip:a@example.com>").unwrap();
        assert_eq!(quoted.display_name.as_deref(), Some("Alice \"A\""));
        assert_eq!(quoted.to_string(), "\"Alice \\\"A\\\"\" <sip:a@example.com>");

        let token = ChatIdentity::parse("Bob <sip:b@example.com>").unwrap();
        assert_eq!(token.display_name.as_deref(), Some("Bob"));

        let bare = ChatIdentity::parse("sip:c@example.com").unwrap();
        assert_eq!(bare.display_name, None);
        assert_eq!(bare.to_string(), "<sip:c@example.com>");
    }
}
