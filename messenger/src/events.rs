//! Events published on the registry's observer bus.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use sipchat_crypto_core::{OtrState, PgpKeyPair, SmpStatus};
use sipchat_messaging::{ChatIdentity, ComposingState, Message, MessageId, NotificationStatus, SipUri};

use crate::transport::SipResponse;

/// Identifies one conversation: a local account and the bare URI of the peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub account: String,
    pub peer: SipUri,
}

impl SessionKey {
    pub fn new(account: impl Into<String>, peer: &SipUri) -> Self {
        Self {
            account: account.into(),
            peer: peer.bare(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.account, self.peer)
    }
}

#[derive(Debug, Clone)]
pub enum MessagingEvent {
    SessionCreated {
        session: SessionKey,
    },
    MessageIsPending {
        session: SessionKey,
        message: Message,
        id: MessageId,
    },
    MessageDidEncrypt {
        session: SessionKey,
        id: MessageId,
    },
    MessageDidSucceed {
        session: SessionKey,
        id: MessageId,
        response: SipResponse,
    },
    MessageDidFail {
        session: SessionKey,
        id: MessageId,
        code: Option<u16>,
        reason: String,
    },
    MessageReceived {
        session: SessionKey,
        message: Message,
    },
    GotComposingIndication {
        session: SessionKey,
        state: ComposingState,
        refresh: u32,
        content_type: Option<String>,
        last_active: Option<DateTime<FixedOffset>>,
        sender: ChatIdentity,
    },
    GotDispositionNotification {
        session: SessionKey,
        id: MessageId,
        status: NotificationStatus,
    },
    DispositionNotificationSent {
        session: SessionKey,
        id: MessageId,
        status: NotificationStatus,
    },
    PgpMessageDidDecrypt {
        session: SessionKey,
        message: Message,
        account: String,
    },
    PgpMessageDidNotDecrypt {
        session: SessionKey,
        message: Message,
        error: String,
    },
    PgpFileDidEncrypt {
        session: SessionKey,
        filename: PathBuf,
    },
    PgpFileDidDecrypt {
        session: SessionKey,
        filename: PathBuf,
        account: String,
        must_open: bool,
        id: Option<MessageId>,
    },
    PgpFileDidNotDecrypt {
        session: SessionKey,
        filename: PathBuf,
        error: String,
    },
    KeysGenerated {
        account: String,
        private_key: PgpKeyPair,
        public_key: PgpKeyPair,
    },
    StreamPgpKeysDidLoad {
        session: SessionKey,
    },
    OtrStateChanged {
        session: SessionKey,
        state: OtrState,
    },
    OtrSmpStatusChanged {
        session: SessionKey,
        status: SmpStatus,
    },
    PrivateKeyImportRequested {
        session: SessionKey,
        body: Vec<u8>,
    },
}

impl MessagingEvent {
    /// The conversation this event concerns; `None` for account-wide events.
    pub fn session(&self) -> Option<&SessionKey> {
        match self {
            MessagingEvent::KeysGenerated { .. } => None,
            MessagingEvent::SessionCreated { session }
            | MessagingEvent::MessageIsPending { session, .. }
            | MessagingEvent::MessageDidEncrypt { session, .. }
            | MessagingEvent::MessageDidSucceed { session, .. }
            | MessagingEvent::MessageDidFail { session, .. }
            | MessagingEvent::MessageReceived { session, .. }
            | MessagingEvent::GotComposingIndication { session, .. }
            | MessagingEvent::GotDispositionNotification { session, .. }
            | MessagingEvent::DispositionNotificationSent { session, .. }
            | MessagingEvent::PgpMessageDidDecrypt { session, .. }
            | MessagingEvent::PgpMessageDidNotDecrypt { session, .. }
            | MessagingEvent::PgpFileDidEncrypt { session, .. }
            | MessagingEvent::PgpFileDidDecrypt { session, .. }
            | MessagingEvent::PgpFileDidNotDecrypt { session, .. }
            | MessagingEvent::StreamPgpKeysDidLoad { session }
            | MessagingEvent::OtrStateChanged { session, .. }
            | MessagingEvent::OtrSmpStatusChanged { session, .. }
            | MessagingEvent::PrivateKeyImportRequested { session, .. } => Some(session),
        }
    }

    pub fn account(&self) -> &str {
        match self {
            MessagingEvent::KeysGenerated { account, .. } => account,
            other => other
                .session()
                .map(|s| s.account.as_str())
                .unwrap_or_default(),
        }
    }

    /// The id of the message this event reports on, if any.
    pub fn message_id(&self) -> Option<&MessageId> {
        match self {
            MessagingEvent::MessageIsPending { id, .. }
            | MessagingEvent::MessageDidEncrypt { id, .. }
            | MessagingEvent::MessageDidSucceed { id, .. }
            | MessagingEvent::MessageDidFail { id, .. }
            | MessagingEvent::GotDispositionNotification { id, .. }
            | MessagingEvent::DispositionNotificationSent { id, .. } => Some(id),
            MessagingEvent::MessageReceived { message, .. }
            | MessagingEvent::PgpMessageDidDecrypt { message, .. }
            | MessagingEvent::PgpMessageDidNotDecrypt { message, .. } => Some(&message.id),
            MessagingEvent::PgpFileDidDecrypt { id, .. } => id.as_ref(),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MessagingEvent::SessionCreated { .. } => "SessionCreated",
            MessagingEvent::MessageIsPending { .. } => "MessageIsPending",
            MessagingEvent::MessageDidEncrypt { .. } => "MessageDidEncrypt",
            MessagingEvent::MessageDidSucceed { .. } => "MessageDidSucceed",
            MessagingEvent::MessageDidFail { .. } => "MessageDidFail",
            MessagingEvent::MessageReceived { .. } => "MessageReceived",
            MessagingEvent::GotComposingIndication { .. } => "GotComposingIndication",
            MessagingEvent::GotDispositionNotification { .. } => "GotDispositionNotification",
            MessagingEvent::DispositionNotificationSent { .. } => "DispositionNotificationSent",
            MessagingEvent::PgpMessageDidDecrypt { .. } => "PgpMessageDidDecrypt",
            MessagingEvent::PgpMessageDidNotDecrypt { .. } => "PgpMessageDidNotDecrypt",
            MessagingEvent::PgpFileDidEncrypt { .. } => "PgpFileDidEncrypt",
            MessagingEvent::PgpFileDidDecrypt { .. } => "PgpFileDidDecrypt",
            MessagingEvent::PgpFileDidNotDecrypt { .. } => "PgpFileDidNotDecrypt",
            MessagingEvent::KeysGenerated { .. } => "KeysGenerated",
            MessagingEvent::StreamPgpKeysDidLoad { .. } => "StreamPgpKeysDidLoad",
            MessagingEvent::OtrStateChanged { .. } => "OtrStateChanged",
            MessagingEvent::OtrSmpStatusChanged { .. } => "OtrSmpStatusChanged",
            MessagingEvent::PrivateKeyImportRequested { .. } => "PrivateKeyImportRequested",
        }
    }
}
