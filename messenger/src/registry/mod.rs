//! Process-wide entry point for messaging.
//!
//! [`SessionRegistry`] is a cheap, cloneable handle. All session state lives in a single
//! network task that serialises commands from handles, inbound SIP requests and
//! completions from the crypto and file workers. Observers subscribe to the event bus.

mod runtime;
mod session;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use sipchat_crypto_core::{Fingerprint, KeyStore, OtrState, SmpStatus};
use sipchat_messaging::{ComposingState, MessageId, NotificationStatus, SipUri};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::accounts::AccountIdentity;
use crate::config::MessengerConfig;
use crate::events::{MessagingEvent, SessionKey};
use crate::incoming::ReplicatedMessageHandler;
use crate::stream::{NativeOtr, OtrFactory};
use crate::transport::{DnsResolver, InboundSink, SipMessageTransport};
use crate::{MessengerError, Result};
use runtime::NetworkRuntime;

const COMMAND_CAPACITY: usize = 64;

/// A content message to send.
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    pub account: String,
    pub peer: SipUri,
    pub content: Vec<u8>,
    pub content_type: String,
    pub id: Option<MessageId>,
    pub timestamp: Option<DateTime<FixedOffset>>,
}

impl OutgoingRequest {
    pub fn new(account: &str, peer: &SipUri, content: impl Into<Vec<u8>>, content_type: &str) -> Self {
        Self {
            account: account.to_string(),
            peer: peer.clone(),
            content: content.into(),
            content_type: content_type.to_string(),
            id: None,
            timestamp: None,
        }
    }

    pub fn text(account: &str, peer: &SipUri, text: &str) -> Self {
        Self::new(account, peer, text, sipchat_messaging::content_types::TEXT_PLAIN)
    }

    pub fn with_id(mut self, id: impl Into<MessageId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<FixedOffset>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Snapshot of a conversation's encryption state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session: SessionKey,
    pub can_encrypt: bool,
    pub can_decrypt: bool,
    pub can_decrypt_with_others: bool,
    pub otr_state: OtrState,
    pub smp_status: SmpStatus,
    pub local_fingerprint: Option<Fingerprint>,
    pub peer_fingerprint: Option<Fingerprint>,
    pub peer_verified: bool,
    pub peer_is_composing: bool,
}

/// A private key packaged for transfer to another device.
#[derive(Clone)]
pub struct ExportedKey {
    /// Six digits the user types on the receiving device.
    pub pin: String,
    /// `text/pgp-private-key` body, encrypted to the PIN.
    pub body: Vec<u8>,
}

impl fmt::Debug for ExportedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportedKey")
            .field("pin", &"<redacted>")
            .field("body_len", &self.body.len())
            .finish()
    }
}

pub(crate) type Responder<T> = oneshot::Sender<Result<T>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SmpAction {
    Start,
    Respond,
    Abort,
}

pub(crate) enum Command {
    AddAccount {
        account: AccountIdentity,
        responder: Responder<()>,
    },
    RemoveAccount {
        account_id: String,
        responder: Responder<bool>,
    },
    SendMessage {
        request: OutgoingRequest,
        responder: Responder<MessageId>,
    },
    SendComposing {
        session: SessionKey,
        state: ComposingState,
        refresh: Option<u32>,
        last_active: Option<DateTime<FixedOffset>>,
        responder: Responder<()>,
    },
    SendImdn {
        session: SessionKey,
        id: MessageId,
        timestamp: DateTime<FixedOffset>,
        status: NotificationStatus,
        responder: Responder<()>,
    },
    EnablePgp {
        session: SessionKey,
        responder: Responder<()>,
    },
    EnableOtr {
        session: SessionKey,
        responder: Responder<()>,
    },
    DisableOtr {
        session: SessionKey,
        responder: Responder<()>,
    },
    Smp {
        session: SessionKey,
        action: SmpAction,
        secret: Vec<u8>,
        responder: Responder<()>,
    },
    GenerateKeys {
        account_id: String,
        responder: Responder<()>,
    },
    ExportPrivateKey {
        account_id: String,
        responder: Responder<ExportedKey>,
    },
    ImportPrivateKey {
        account_id: String,
        body: Vec<u8>,
        pin: String,
        responder: Responder<()>,
    },
    EncryptFile {
        session: SessionKey,
        path: PathBuf,
        responder: Responder<()>,
    },
    DecryptFile {
        session: SessionKey,
        path: PathBuf,
        must_open: bool,
        id: Option<MessageId>,
        responder: Responder<()>,
    },
    SessionInfo {
        session: SessionKey,
        responder: Responder<SessionInfo>,
    },
    Shutdown(oneshot::Sender<()>),
}

struct RegistryInner {
    command_tx: mpsc::Sender<Command>,
    inbound: InboundSink,
    event_tx: broadcast::Sender<MessagingEvent>,
    keys: Arc<KeyStore>,
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

pub struct SessionRegistryBuilder {
    config: MessengerConfig,
    transport: Arc<dyn SipMessageTransport>,
    resolver: Arc<dyn DnsResolver>,
    otr_factory: Arc<dyn OtrFactory>,
    replication: Option<Arc<dyn ReplicatedMessageHandler>>,
    accounts: Vec<AccountIdentity>,
}

impl SessionRegistryBuilder {
    pub fn otr_factory(mut self, factory: Arc<dyn OtrFactory>) -> Self {
        self.otr_factory = factory;
        self
    }

    pub fn replication_handler(mut self, handler: Arc<dyn ReplicatedMessageHandler>) -> Self {
        self.replication = Some(handler);
        self
    }

    pub fn account(mut self, account: AccountIdentity) -> Self {
        self.accounts.push(account);
        self
    }

    /// Spawn the network task. Must be called within a tokio runtime.
    pub fn start(self) -> SessionRegistry {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (event_tx, _rx) = broadcast::channel(self.config.event_capacity.max(1));
        let keys = Arc::new(KeyStore::new(&self.config.keys_dir));

        let runtime = NetworkRuntime::new(runtime::Parts {
            config: self.config,
            accounts: self.accounts,
            keys: keys.clone(),
            transport: self.transport,
            resolver: self.resolver,
            otr_factory: self.otr_factory,
            replication: self.replication,
            command_rx,
            inbound_rx,
            event_tx: event_tx.clone(),
        });
        tokio::spawn(async move { runtime.run().await });

        SessionRegistry {
            inner: Arc::new(RegistryInner {
                command_tx,
                inbound: InboundSink::new(inbound_tx),
                event_tx,
                keys,
            }),
        }
    }
}

impl SessionRegistry {
    pub fn builder(
        config: MessengerConfig,
        transport: Arc<dyn SipMessageTransport>,
        resolver: Arc<dyn DnsResolver>,
    ) -> SessionRegistryBuilder {
        SessionRegistryBuilder {
            config,
            transport,
            resolver,
            otr_factory: Arc::new(NativeOtr),
            replication: None,
            accounts: Vec::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MessagingEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Where the SIP stack should deliver inbound MESSAGE requests.
    pub fn inbound_sink(&self) -> InboundSink {
        self.inner.inbound.clone()
    }

    pub fn key_store(&self) -> &Arc<KeyStore> {
        &self.inner.keys
    }

    /// Register an account. Resolves once its OTR identity has been read or created.
    pub async fn add_account(&self, account: AccountIdentity) -> Result<()> {
        self.request(|responder| Command::AddAccount { account, responder })
            .await
    }

    /// Drop an account and every session it owns. Returns false if it was unknown.
    pub async fn remove_account(&self, account_id: &str) -> Result<bool> {
        let account_id = account_id.to_string();
        self.request(|responder| Command::RemoveAccount {
            account_id,
            responder,
        })
        .await
    }

    /// Queue a message; the returned id tags every later event about it.
    pub async fn send_message(&self, request: OutgoingRequest) -> Result<MessageId> {
        self.request(|responder| Command::SendMessage { request, responder })
            .await
    }

    pub async fn send_composing_indication(
        &self,
        account: &str,
        peer: &SipUri,
        state: ComposingState,
        refresh: Option<u32>,
        last_active: Option<DateTime<FixedOffset>>,
    ) -> Result<()> {
        let session = SessionKey::new(account, peer);
        self.request(|responder| Command::SendComposing {
            session,
            state,
            refresh,
            last_active,
            responder,
        })
        .await
    }

    pub async fn send_imdn(
        &self,
        account: &str,
        peer: &SipUri,
        id: MessageId,
        timestamp: DateTime<FixedOffset>,
        status: NotificationStatus,
    ) -> Result<()> {
        let session = SessionKey::new(account, peer);
        self.request(|responder| Command::SendImdn {
            session,
            id,
            timestamp,
            status,
            responder,
        })
        .await
    }

    /// Load PGP keys for the conversation, generating the account's pair if missing.
    pub async fn enable_pgp(&self, account: &str, peer: &SipUri) -> Result<()> {
        let session = SessionKey::new(account, peer);
        self.request(|responder| Command::EnablePgp { session, responder })
            .await
    }

    pub async fn enable_otr(&self, account: &str, peer: &SipUri) -> Result<()> {
        let session = SessionKey::new(account, peer);
        self.request(|responder| Command::EnableOtr { session, responder })
            .await
    }

    pub async fn disable_otr(&self, account: &str, peer: &SipUri) -> Result<()> {
        let session = SessionKey::new(account, peer);
        self.request(|responder| Command::DisableOtr { session, responder })
            .await
    }

    pub async fn smp_start(&self, account: &str, peer: &SipUri, secret: &[u8]) -> Result<()> {
        self.smp(account, peer, SmpAction::Start, secret).await
    }

    pub async fn smp_respond(&self, account: &str, peer: &SipUri, secret: &[u8]) -> Result<()> {
        self.smp(account, peer, SmpAction::Respond, secret).await
    }

    pub async fn smp_abort(&self, account: &str, peer: &SipUri) -> Result<()> {
        self.smp(account, peer, SmpAction::Abort, b"").await
    }

    /// Generate and store a key pair for the account. Resolves once it is on disk.
    pub async fn generate_keys(&self, account_id: &str) -> Result<()> {
        let account_id = account_id.to_string();
        self.request(|responder| Command::GenerateKeys {
            account_id,
            responder,
        })
        .await
    }

    pub async fn export_private_key(&self, account_id: &str) -> Result<ExportedKey> {
        let account_id = account_id.to_string();
        self.request(|responder| Command::ExportPrivateKey {
            account_id,
            responder,
        })
        .await
    }

    pub async fn import_private_key(&self, account_id: &str, body: &[u8], pin: &str) -> Result<()> {
        let account_id = account_id.to_string();
        let body = body.to_vec();
        let pin = pin.to_string();
        self.request(|responder| Command::ImportPrivateKey {
            account_id,
            body,
            pin,
            responder,
        })
        .await
    }

    /// Encrypt a file for the peer; `PgpFileDidEncrypt` reports the `.asc` output.
    pub async fn encrypt_file(&self, account: &str, peer: &SipUri, path: impl Into<PathBuf>) -> Result<()> {
        let session = SessionKey::new(account, peer);
        let path = path.into();
        self.request(|responder| Command::EncryptFile {
            session,
            path,
            responder,
        })
        .await
    }

    pub async fn decrypt_file(
        &self,
        account: &str,
        peer: &SipUri,
        path: impl Into<PathBuf>,
        must_open: bool,
        id: Option<MessageId>,
    ) -> Result<()> {
        let session = SessionKey::new(account, peer);
        let path = path.into();
        self.request(|responder| Command::DecryptFile {
            session,
            path,
            must_open,
            id,
            responder,
        })
        .await
    }

    pub async fn session_info(&self, account: &str, peer: &SipUri) -> Result<SessionInfo> {
        let session = SessionKey::new(account, peer);
        self.request(|responder| Command::SessionInfo { session, responder })
            .await
    }

    pub async fn peer_is_composing(&self, account: &str, peer: &SipUri) -> Result<bool> {
        Ok(self.session_info(account, peer).await?.peer_is_composing)
    }

    pub async fn shutdown(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.inner
            .command_tx
            .send(Command::Shutdown(done_tx))
            .await
            .map_err(|e| MessengerError::RuntimeGone(format!("failed to send shutdown: {e}")))?;
        done_rx
            .await
            .map_err(|e| MessengerError::RuntimeGone(format!("shutdown channel error: {e}")))
    }

    async fn smp(&self, account: &str, peer: &SipUri, action: SmpAction, secret: &[u8]) -> Result<()> {
        let session = SessionKey::new(account, peer);
        let secret = secret.to_vec();
        self.request(|responder| Command::Smp {
            session,
            action,
            secret,
            responder,
        })
        .await
    }

    async fn request<T>(&self, build: impl FnOnce(Responder<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .command_tx
            .send(build(tx))
            .await
            .map_err(|e| MessengerError::RuntimeGone(format!("failed to send command: {e}")))?;
        rx.await
            .map_err(|e| MessengerError::RuntimeGone(format!("command channel error: {e}")))?
    }
}
