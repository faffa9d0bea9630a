//! Seams to the SIP stack and the DNS resolver.
//!
//! The messaging core never opens sockets. It hands finished requests to a
//! [`SipMessageTransport`] and receives inbound MESSAGE requests through an [`InboundSink`].

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sipchat_messaging::{ChatIdentity, SipUri};
use tokio::sync::mpsc;

use crate::accounts::Credentials;

pub const X_REPLICATED_MESSAGE: &str = "X-Replicated-Message";

/// A next hop produced by the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub uri: SipUri,
    pub transport: String,
}

impl Route {
    pub fn new(uri: SipUri, transport: &str) -> Self {
        Self {
            uri,
            transport: transport.to_ascii_lowercase(),
        }
    }
}

/// An outbound SIP MESSAGE, ready for the transaction layer.
#[derive(Debug, Clone)]
pub struct SipMessageRequest {
    pub from: ChatIdentity,
    pub to: ChatIdentity,
    pub request_uri: SipUri,
    pub route: Route,
    pub content_type: String,
    pub body: Vec<u8>,
    pub credentials: Option<Credentials>,
    pub extra_headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SipResponse {
    pub code: u16,
    pub reason: String,
}

/// Final failure of a MESSAGE transaction. `code` is absent for local errors such
/// as a transport timeout.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct SipFailure {
    pub code: Option<u16>,
    pub reason: String,
}

impl SipFailure {
    pub fn new(code: Option<u16>, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

pub trait SipMessageTransport: Send + Sync + 'static {
    /// Start a MESSAGE transaction.
    ///
    /// The request is handed to the transaction layer before this returns, so requests
    /// leave in call order. The returned future resolves with the final response.
    fn send(&self, request: SipMessageRequest) -> BoxFuture<'static, Result<SipResponse, SipFailure>>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct LookupError(pub String);

#[async_trait]
pub trait DnsResolver: Send + Sync + 'static {
    async fn lookup_sip_proxy(
        &self,
        uri: &SipUri,
        transports: &[String],
        tls_name: Option<&str>,
    ) -> Result<Vec<Route>, LookupError>;
}

/// An inbound MESSAGE request as delivered by the SIP stack.
#[derive(Debug, Clone)]
pub struct IncomingSipMessage {
    pub request_uri: SipUri,
    pub from: ChatIdentity,
    pub to: ChatIdentity,
    pub content_type: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl IncomingSipMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_replicated(&self) -> bool {
        self.header(X_REPLICATED_MESSAGE).is_some()
    }

    /// The media type without parameters, lowercased.
    pub fn media_type(&self) -> String {
        self.content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
    }
}

/// Where the SIP stack delivers inbound MESSAGE requests. Cloneable and callable
/// from any thread.
#[derive(Debug, Clone)]
pub struct InboundSink {
    tx: mpsc::UnboundedSender<IncomingSipMessage>,
}

impl InboundSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<IncomingSipMessage>) -> Self {
        Self { tx }
    }

    /// Queue a request for dispatch. Returns false once the registry has shut down.
    pub fn deliver(&self, message: IncomingSipMessage) -> bool {
        self.tx.send(message).is_ok()
    }
}
