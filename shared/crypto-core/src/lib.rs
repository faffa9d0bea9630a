//! Cryptographic core for SipChat.
//!
//! [`keystore`] owns the on-disk key layout. [`pgp`] wraps Sequoia for message and
//! file encryption. [`otr`] implements the interactive OTR-style session protocol
//! negotiated in-band over SIP MESSAGE.

pub mod keystore;
pub mod otr;
pub mod pgp;

pub use keystore::{KeyOwner, KeyStore};
pub use otr::{OtrError, OtrSession, OtrState, SmpStatus};
pub use pgp::{KeyAlgorithm, PgpEngine, PgpKeyPair};

use sha2::{Digest, Sha256};
use std::fmt::{self, Display};

/// Result type exposed by crypto-core APIs.
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors returned by the crypto core.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("payload is not an OpenPGP message")]
    NotPgpMessage,
    #[error("certificate {0} has no usable encryption key")]
    NoEncryptionKey(String),
    #[error("no private key available for decryption")]
    NoPrivateKey,
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("internal error: {0}")]
    Internal(String),
}

impl CryptoError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        CryptoError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// A key fingerprint: 40 upper-case hex digits, displayed in groups of four.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Accepts hex with or without grouping whitespace.
    pub fn from_hex(hex: &str) -> Result<Self> {
        let compact: String = hex.chars().filter(|c| !c.is_whitespace()).collect();
        if compact.len() != 40 || !compact.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CryptoError::InvalidInput(format!("not a fingerprint: {}", hex)));
        }
        Ok(Self(compact.to_ascii_uppercase()))
    }

    /// SHA-256 of the public key bytes, truncated to 160 bits.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = Sha256::digest(public_key);
        Self(hex::encode_upper(&digest[..20]))
    }

    /// The compact hex form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, chunk) in self.0.as_bytes().chunks(4).enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            // Always ASCII hex.
            f.write_str(std::str::from_utf8(chunk).map_err(|_| fmt::Error)?)?;
        }
        Ok(())
    }
}
