//! Classification and routing of inbound SIP MESSAGE requests.

use chrono::Utc;
use sipchat_messaging::{
    content_types, ChatIdentity, CpimCodec, CpimParseError, CpimPayload, Direction, ImdnDocument,
    IsComposingDocument, Message, MessageId, MessagingError, SipUri,
};
use tracing::debug;

use crate::accounts::AccountManager;
use crate::transport::IncomingSipMessage;

/// Storage hook for messages echoed from the user's other endpoints.
pub trait ReplicatedMessageHandler: Send + Sync {
    fn on_replicated_message(&self, account: &str, message: &Message);
}

/// An inbound body, before classification.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingBody {
    Cpim(CpimPayload),
    Raw { content_type: String, body: Vec<u8> },
}

impl IncomingBody {
    pub fn parse(request: &IncomingSipMessage) -> Result<Self, CpimParseError> {
        let content_type = request.media_type();
        if content_type == content_types::CPIM {
            CpimCodec::decode(&request.body).map(IncomingBody::Cpim)
        } else {
            Ok(IncomingBody::Raw {
                content_type,
                body: request.body.clone(),
            })
        }
    }

    pub fn content_type(&self) -> &str {
        match self {
            IncomingBody::Cpim(payload) => &payload.content_type,
            IncomingBody::Raw { content_type, .. } => content_type,
        }
    }

    pub fn content(&self) -> &[u8] {
        match self {
            IncomingBody::Cpim(payload) => &payload.content,
            IncomingBody::Raw { body, .. } => body,
        }
    }

    /// The message as observers see it. Identity and time come from CPIM when present.
    fn into_message(self, request: &IncomingSipMessage) -> Message {
        match self {
            IncomingBody::Cpim(payload) => {
                let id = payload.message_id().map(MessageId::from);
                let disposition = payload.disposition();
                let mut message = Message::new(payload.content, &payload.content_type, Direction::Incoming)
                    .with_id(id)
                    .with_timestamp(payload.timestamp);
                message.sender = payload.sender.or_else(|| Some(request.from.clone()));
                message.recipients = if payload.recipients.is_empty() {
                    vec![request.to.clone()]
                } else {
                    payload.recipients
                };
                message.disposition = disposition;
                message
            }
            IncomingBody::Raw { content_type, body } => {
                let mut message = Message::new(body, &content_type, Direction::Incoming)
                    .with_timestamp(Some(Utc::now().fixed_offset()));
                message.sender = Some(request.from.clone());
                message.recipients = vec![request.to.clone()];
                message
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoutedKind {
    Composing(IsComposingDocument),
    Notification(ImdnDocument),
    Content(Message),
    /// Sent by another endpoint of the same account; `Routed::peer` is its recipient.
    Replicated(Message),
}

impl RoutedKind {
    /// Ephemeral traffic never creates a session on its own.
    pub fn may_create_session(&self) -> bool {
        matches!(self, RoutedKind::Content(_))
    }
}

/// An inbound message resolved to its account and conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct Routed {
    pub account_id: String,
    pub peer: SipUri,
    pub peer_instance_id: Option<String>,
    pub sender: ChatIdentity,
    pub kind: RoutedKind,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejected {
    #[error("no account for {0}")]
    UnknownAccount(String),
    #[error("malformed CPIM envelope: {0}")]
    Cpim(#[from] CpimParseError),
    #[error("malformed document: {0}")]
    Document(#[from] MessagingError),
}

pub struct IncomingDispatcher;

impl IncomingDispatcher {
    pub fn route(accounts: &AccountManager, request: IncomingSipMessage) -> Result<Routed, Rejected> {
        let account = accounts
            .find_account(&request.request_uri)
            .ok_or_else(|| Rejected::UnknownAccount(request.request_uri.to_string()))?;
        let account_id = account.id.clone();

        let body = IncomingBody::parse(&request)?;

        if request.is_replicated() {
            debug!(account = %account_id, "replicated message");
            return Ok(Routed {
                account_id,
                peer: request.to.uri.bare(),
                peer_instance_id: None,
                sender: request.from.clone(),
                kind: RoutedKind::Replicated(body.into_message(&request)),
            });
        }

        let sender = match &body {
            IncomingBody::Cpim(payload) => payload.sender.clone().unwrap_or_else(|| request.from.clone()),
            IncomingBody::Raw { .. } => request.from.clone(),
        };
        let content_type = body.content_type().to_string();
        let kind = if content_type == content_types::IS_COMPOSING {
            RoutedKind::Composing(IsComposingDocument::parse(body.content())?)
        } else if content_type == content_types::IMDN {
            RoutedKind::Notification(ImdnDocument::parse(body.content())?)
        } else {
            RoutedKind::Content(body.into_message(&request))
        };

        Ok(Routed {
            account_id,
            peer: request.from.uri.bare(),
            peer_instance_id: request.from.uri.instance_id().map(str::to_owned),
            sender,
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountIdentity;
    use crate::transport::X_REPLICATED_MESSAGE;
    use sipchat_messaging::{ComposingState, CpimHeader, NotificationStatus};

    fn accounts() -> AccountManager {
        let mut manager = AccountManager::new();
        manager.add(AccountIdentity::new(
            SipUri::parse("sip:bob@example.com").unwrap(),
            Some("Bob"),
        ));
        manager
    }

    fn request(content_type: &str, body: Vec<u8>) -> IncomingSipMessage {
        IncomingSipMessage {
            request_uri: SipUri::parse("sip:bob@example.com").unwrap(),
            from: ChatIdentity::parse("\"Alice\" <sip:alice@example.com;gr=urn:uuid:1234>").unwrap(),
            to: ChatIdentity::parse("<sip:bob@example.com>").unwrap(),
            content_type: content_type.to_string(),
            headers: Vec::new(),
            body,
        }
    }

    #[test]
    fn unknown_account_is_rejected() {
        let mut message = request("text/plain", b"hi".to_vec());
        message.request_uri = SipUri::parse("sip:carol@example.com").unwrap();
        assert_eq!(
            IncomingDispatcher::route(&accounts(), message),
            Err(Rejected::UnknownAccount("sip:carol@example.com".to_string()))
        );
    }

    #[test]
    fn raw_text_becomes_content() {
        let routed = IncomingDispatcher::route(&accounts(), request("text/plain; charset=utf-8", b"hello".to_vec()))
            .unwrap();
        assert_eq!(routed.account_id, "bob@example.com");
        assert_eq!(routed.peer, SipUri::parse("sip:alice@example.com").unwrap());
        assert_eq!(routed.peer_instance_id.as_deref(), Some("1234"));
        let RoutedKind::Content(message) = routed.kind else {
            panic!("expected content");
        };
        assert_eq!(message.text(), Some("hello"));
        assert_eq!(message.content_type, "text/plain");
        assert!(!message.is_secure);
    }

    #[test]
    fn cpim_supplies_id_and_disposition() {
        let mut payload = CpimPayload::new("hi", "text/plain");
        payload.additional_headers.push(CpimHeader::imdn("Message-ID", "abc"));
        payload
            .additional_headers
            .push(CpimHeader::imdn("Disposition-Notification", "positive-delivery, display"));
        let (body, content_type) = CpimCodec::encode(&payload);

        let routed = IncomingDispatcher::route(&accounts(), request(content_type, body)).unwrap();
        assert!(routed.kind.may_create_session());
        let RoutedKind::Content(message) = routed.kind else {
            panic!("expected content");
        };
        assert_eq!(message.id.as_str(), "abc");
        assert!(message.wants(sipchat_messaging::Disposition::PositiveDelivery));
        assert_eq!(message.sender.map(|s| s.uri.address()).as_deref(), Some("alice@example.com"));
    }

    #[test]
    fn malformed_cpim_is_rejected() {
        let result = IncomingDispatcher::route(&accounts(), request("message/cpim", b"garbage".to_vec()));
        assert!(matches!(result, Err(Rejected::Cpim(_))));
    }

    #[test]
    fn composing_and_notifications_are_classified() {
        let composing = IsComposingDocument::new(ComposingState::Active).to_xml();
        let routed = IncomingDispatcher::route(
            &accounts(),
            request("application/im-iscomposing+xml", composing.into_bytes()),
        )
        .unwrap();
        assert!(!routed.kind.may_create_session());
        assert!(matches!(routed.kind, RoutedKind::Composing(ref doc) if doc.state == ComposingState::Active));

        let imdn = ImdnDocument::new(
            MessageId::from("abc"),
            Utc::now().fixed_offset(),
            None,
            NotificationStatus::Delivered,
        )
        .to_xml();
        let routed =
            IncomingDispatcher::route(&accounts(), request("message/imdn+xml", imdn.into_bytes())).unwrap();
        let RoutedKind::Notification(doc) = routed.kind else {
            panic!("expected notification");
        };
        assert_eq!(doc.message_id.as_str(), "abc");
        assert_eq!(doc.status, NotificationStatus::Delivered);
    }

    #[test]
    fn replicated_messages_route_to_the_recipient() {
        let mut message = request("text/plain", b"sent elsewhere".to_vec());
        message.from = ChatIdentity::parse("<sip:bob@example.com>").unwrap();
        message.to = ChatIdentity::parse("<sip:alice@example.com>").unwrap();
        message
            .headers
            .push((X_REPLICATED_MESSAGE.to_string(), "yes".to_string()));
        let routed = IncomingDispatcher::route(&accounts(), message).unwrap();
        assert_eq!(routed.peer, SipUri::parse("sip:alice@example.com").unwrap());
        assert!(matches!(routed.kind, RoutedKind::Replicated(_)));
        assert!(!routed.kind.may_create_session());
    }
}
