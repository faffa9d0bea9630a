//! A single outbound send: route selection and envelope construction.

use chrono::{DateTime, FixedOffset, Utc};
use sipchat_messaging::{
    content_types, ChatIdentity, CpimCodec, CpimHeader, CpimPayload, Direction, Disposition,
    Message, MessageId, NotificationStatus, SipUri,
};

use crate::accounts::AccountIdentity;
use crate::events::SessionKey;
use crate::transport::{Route, SipMessageRequest};

/// Dispositions requested on every deliverable message.
pub const REQUESTED_DISPOSITIONS: [Disposition; 2] =
    [Disposition::PositiveDelivery, Disposition::Display];

/// What an outbound message is, which decides the events it produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingKind {
    /// User content; reported as pending, succeeded or failed.
    Content,
    Composing,
    Imdn {
        id: MessageId,
        status: NotificationStatus,
    },
    /// A protocol message produced by the OTR engine.
    Inject,
    PublicKey,
}

#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub session: SessionKey,
    pub id: MessageId,
    pub content: Vec<u8>,
    pub content_type: String,
    pub timestamp: DateTime<FixedOffset>,
    pub kind: OutgoingKind,
}

impl OutgoingMessage {
    pub fn new(
        session: SessionKey,
        content: impl Into<Vec<u8>>,
        content_type: &str,
        kind: OutgoingKind,
    ) -> Self {
        Self {
            session,
            id: MessageId::new(),
            content: content.into(),
            content_type: content_type.to_ascii_lowercase(),
            timestamp: Utc::now().fixed_offset(),
            kind,
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

    /// Only user content surfaces pending/succeeded/failed events.
    pub fn reports_status(&self) -> bool {
        self.kind == OutgoingKind::Content && content_types::accepts_disposition(&self.content_type)
    }

    /// Whether this message asks the peer for delivery and display notifications.
    pub fn requests_disposition(&self, account: &AccountIdentity) -> bool {
        account.message_settings.use_cpim
            && account.message_settings.enable_imdn
            && self.kind == OutgoingKind::Content
            && content_types::accepts_disposition(&self.content_type)
    }

    /// The message as observers see it, carrying the cleartext content.
    pub fn to_message(&self, account: &AccountIdentity) -> Message {
        let mut message = Message::new(self.content.clone(), &self.content_type, Direction::Outgoing)
            .with_id(Some(self.id.clone()))
            .with_timestamp(Some(self.timestamp));
        message.sender = Some(account.identity());
        message.recipients = vec![ChatIdentity::from(self.session.peer.clone())];
        if self.requests_disposition(account) {
            message.disposition = Some(REQUESTED_DISPOSITIONS.to_vec());
        }
        message
    }

    /// Build the SIP request carrying `payload`, the possibly encrypted content.
    pub fn build_request(
        &self,
        account: &AccountIdentity,
        route: &Route,
        payload: Vec<u8>,
    ) -> SipMessageRequest {
        let peer = ChatIdentity::from(self.session.peer.clone());
        let (content_type, body) = if account.message_settings.use_cpim {
            let mut cpim = CpimPayload::new(payload, &self.content_type);
            cpim.sender = Some(account.identity());
            cpim.recipients = vec![peer.clone()];
            cpim.timestamp = Some(self.timestamp);
            cpim.additional_headers
                .push(CpimHeader::imdn("Message-ID", self.id.as_str()));
            if self.requests_disposition(account) {
                cpim.additional_headers.push(CpimHeader::imdn(
                    "Disposition-Notification",
                    Disposition::format_list(&REQUESTED_DISPOSITIONS),
                ));
            }
            let (body, content_type) = CpimCodec::encode(&cpim);
            (content_type.to_string(), body)
        } else {
            (self.content_type.clone(), payload)
        };

        SipMessageRequest {
            from: account.identity(),
            to: peer,
            request_uri: self.session.peer.clone(),
            route: route.clone(),
            content_type,
            body,
            credentials: account.credentials.clone(),
            extra_headers: Vec::new(),
        }
    }
}

/// The URI handed to the resolver: the outbound proxy, else the account's domain when
/// it always routes through its own proxy, else the peer itself.
pub fn lookup_uri(account: &AccountIdentity, peer: &SipUri) -> SipUri {
    if let Some(proxy) = &account.outbound_proxy {
        return proxy.clone();
    }
    if account.always_use_my_proxy {
        return SipUri::new(None, account.domain());
    }
    peer.clone()
}
