pub mod accounts;
pub mod config;
pub mod events;
pub mod incoming;
pub mod outgoing;
pub mod registry;
pub mod stream;
pub mod transport;
pub mod workers;

#[cfg(feature = "testing")]
pub mod testing;

pub use accounts::{AccountIdentity, AccountManager, Credentials, MessageSettings};
pub use config::MessengerConfig;
pub use events::{MessagingEvent, SessionKey};
pub use incoming::{IncomingDispatcher, ReplicatedMessageHandler};
pub use outgoing::OutgoingMessage;
pub use registry::{ExportedKey, OutgoingRequest, SessionInfo, SessionRegistry};
pub use stream::MessageStream;
pub use transport::{
    DnsResolver, InboundSink, IncomingSipMessage, Route, SipFailure, SipMessageRequest,
    SipMessageTransport, SipResponse,
};

use sipchat_crypto_core::{CryptoError, OtrError};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

pub type Result<T> = std::result::Result<T, MessengerError>;

#[derive(Debug, thiserror::Error)]
pub enum MessengerError {
    #[error("unknown account: {0}")]
    UnknownAccount(String),
    #[error("no session between {account} and {peer}")]
    UnknownSession { account: String, peer: String },
    #[error("OTR session downgraded by the peer; message not sent")]
    SecurityDowngrade,
    #[error(transparent)]
    Otr(#[from] OtrError),
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("messaging runtime unavailable: {0}")]
    RuntimeGone(String),
}

impl From<CryptoError> for MessengerError {
    fn from(err: CryptoError) -> Self {
        MessengerError::Crypto(err.to_string())
    }
}

pub fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
