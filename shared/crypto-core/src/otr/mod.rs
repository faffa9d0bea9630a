//! OTR-style interactive encryption negotiated in-band.
//!
//! A session starts in [`OtrState::Plaintext`]. `start()` sends the query marker and moves
//! to [`OtrState::AwaitingKey`]; the four-message AKE ends in [`OtrState::Encrypted`]. Any
//! fatal protocol error, or a disconnect from the peer, leaves the session in
//! [`OtrState::Finished`] until `stop()` resets it.
//!
//! Protocol messages that are not user content are handed to an [`OtrHost`] through
//! `inject`, in the order they are produced.

mod context;
mod smp;
mod wire;

pub use context::OtrContext;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::Fingerprint;

/// Query marker sent by `start()`.
pub const QUERY_MESSAGE: &str = "?OTRv3?";
/// Prefix of every encoded protocol message.
pub const MESSAGE_PREFIX: &str = "?OTR:";
/// Prefix of an OTR error report.
pub const ERROR_PREFIX: &str = "?OTR Error:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtrState {
    Plaintext,
    AwaitingKey,
    Encrypted,
    Finished,
}

impl fmt::Display for OtrState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OtrState::Plaintext => "plaintext",
            OtrState::AwaitingKey => "awaiting-key",
            OtrState::Encrypted => "encrypted",
            OtrState::Finished => "finished",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmpStatus {
    Unavailable,
    InProgress,
    Succeeded,
    Failed,
}

/// What `handle_input` made of an inbound body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputOutcome {
    /// User content recovered from an encrypted data message.
    Decrypted(Vec<u8>),
    /// Protocol housekeeping; nothing to show.
    Ignore,
    /// Cleartext arrived where ciphertext was expected.
    Unencrypted(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OtrError {
    #[error("unreadable encrypted message: {0}")]
    EncryptedMessage(String),
    #[error("the OTR session was finished")]
    Finished,
    #[error("OTR handshake still in progress")]
    HandshakeInProgress,
    #[error("OTR session is not encrypted")]
    NotEncrypted,
    #[error("content type {0} cannot be sent over OTR")]
    UnsupportedContentType(String),
    #[error("OTR protocol error: {0}")]
    Protocol(String),
}

/// Receives protocol messages the engine wants on the wire.
pub trait OtrHost: Send + Sync {
    fn inject(&self, message: &str);
}

/// An [`OtrHost`] that buffers injected messages until the owner drains them.
#[derive(Debug, Clone, Default)]
pub struct InjectQueue(Arc<Mutex<VecDeque<String>>>);

impl InjectQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<String> {
        self.0.lock().drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

impl OtrHost for InjectQueue {
    fn inject(&self, message: &str) {
        self.0.lock().push_back(message.to_string());
    }
}

/// Long-term identity key used to authenticate the AKE.
#[derive(Clone)]
pub struct OtrIdentity {
    signing: SigningKey,
}

impl OtrIdentity {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    pub fn seed(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_public_key(&self.public_key())
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing
    }
}

impl fmt::Debug for OtrIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OtrIdentity")
            .field("fingerprint", &self.fingerprint().to_string())
            .finish()
    }
}

/// The integration contract between a message stream and an OTR implementation.
pub trait OtrSession: Send {
    /// Process an inbound body.
    fn handle_input(&mut self, body: &[u8], content_type: &str) -> Result<InputOutcome, OtrError>;

    /// Wrap outbound content. Returns the input unchanged while in plaintext.
    fn handle_output(&mut self, content: &[u8], content_type: &str) -> Result<Vec<u8>, OtrError>;

    /// Send the query marker and wait for the peer's key exchange.
    fn start(&mut self);

    /// End the session, notifying the peer when encrypted, and return to plaintext.
    fn stop(&mut self);

    fn smp_start(&mut self, secret: &[u8]) -> Result<(), OtrError>;

    fn smp_respond(&mut self, secret: &[u8]) -> Result<(), OtrError>;

    fn smp_abort(&mut self);

    fn state(&self) -> OtrState;

    fn smp_status(&self) -> SmpStatus;

    fn local_fingerprint(&self) -> Fingerprint;

    fn peer_fingerprint(&self) -> Option<Fingerprint>;

    fn peer_verified(&self) -> bool;
}
