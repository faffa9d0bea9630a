//! On-disk key layout and the in-memory key cache.
//!
//! ```text
//! <root>/private/<account_id>.privkey   own secret key (armored TSK)
//! <root>/private/<account_id>.pubkey    own public key
//! <root>/private/<account_id>.otrkey    OTR identity seed (hex)
//! <root>/<peer_id>.pubkey               known peer public keys
//! ```
//!
//! Every write goes through [`write_atomic`], so readers never observe a partial key.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::otr::OtrIdentity;
use crate::pgp::{KeyAlgorithm, PgpKeyPair};
use crate::{CryptoError, Result};

const PRIVATE_DIR: &str = "private";

/// An account that may own a private key, as seen by fallback decryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyOwner {
    pub account_id: String,
    pub enabled: bool,
}

impl KeyOwner {
    pub fn new(account_id: impl Into<String>, enabled: bool) -> Self {
        Self {
            account_id: account_id.into(),
            enabled,
        }
    }
}

/// Key files keyed by path. `None` records a confirmed absence so repeated lookups for
/// unknown peers stay off the disk until [`KeyStore::reload`].
pub struct KeyStore {
    root: PathBuf,
    cache: Mutex<HashMap<PathBuf, Option<PgpKeyPair>>>,
}

impl KeyStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn private_key_path(&self, account_id: &str) -> PathBuf {
        self.root
            .join(PRIVATE_DIR)
            .join(format!("{}.privkey", sanitize_id(account_id)))
    }

    pub fn own_public_key_path(&self, account_id: &str) -> PathBuf {
        self.root
            .join(PRIVATE_DIR)
            .join(format!("{}.pubkey", sanitize_id(account_id)))
    }

    pub fn peer_key_path(&self, peer_id: &str) -> PathBuf {
        self.root.join(format!("{}.pubkey", sanitize_id(peer_id)))
    }

    pub fn otr_identity_path(&self, account_id: &str) -> PathBuf {
        self.root
            .join(PRIVATE_DIR)
            .join(format!("{}.otrkey", sanitize_id(account_id)))
    }

    /// Generate a key pair without touching the disk. CPU bound; RSA-4096 takes seconds.
    pub fn create_keypair(
        display_name: Option<&str>,
        account_id: &str,
        algorithm: KeyAlgorithm,
    ) -> Result<PgpKeyPair> {
        PgpKeyPair::generate(display_name, account_id, algorithm)
    }

    /// Persist `pair` as the account's private and public key and refresh the cache.
    pub fn store_keypair(&self, account_id: &str, pair: &PgpKeyPair) -> Result<()> {
        let secret = pair.export_secret_key()?;
        let public = pair.export_public_key()?;
        let private_path = self.private_key_path(account_id);
        let public_path = self.own_public_key_path(account_id);

        write_atomic(&private_path, secret.as_bytes())?;
        write_atomic(&public_path, public.as_bytes())?;

        let mut cache = self.cache.lock();
        cache.insert(private_path, Some(pair.clone()));
        cache.insert(public_path, Some(pair.public_only()));
        info!(account = %account_id, fingerprint = %pair.fingerprint(), "stored key pair");
        Ok(())
    }

    pub fn generate_keypair(
        &self,
        display_name: Option<&str>,
        account_id: &str,
        algorithm: KeyAlgorithm,
    ) -> Result<PgpKeyPair> {
        let pair = Self::create_keypair(display_name, account_id, algorithm)?;
        self.store_keypair(account_id, &pair)?;
        Ok(pair)
    }

    pub fn load_private(&self, account_id: &str) -> Option<PgpKeyPair> {
        self.load(&self.private_key_path(account_id))
            .filter(PgpKeyPair::has_secret)
    }

    pub fn load_own_public(&self, account_id: &str) -> Option<PgpKeyPair> {
        self.load(&self.own_public_key_path(account_id))
            .or_else(|| self.load_private(account_id).map(|pair| pair.public_only()))
    }

    /// Peer key lookup: the instance id when known, then the bare address.
    pub fn load_public(&self, instance_id: Option<&str>, address: &str) -> Option<PgpKeyPair> {
        instance_id
            .filter(|id| !id.is_empty())
            .and_then(|id| self.load(&self.peer_key_path(id)))
            .or_else(|| self.load(&self.peer_key_path(address)))
    }

    /// Validate and store a peer public key. Secret material, if any was sent, is dropped.
    pub fn save_public(&self, peer_id: &str, armored: &[u8]) -> Result<PgpKeyPair> {
        let key = PgpKeyPair::from_bytes(armored)?.public_only();
        let path = self.peer_key_path(peer_id);
        write_atomic(&path, key.export_public_key()?.as_bytes())?;
        self.cache.lock().insert(path, Some(key.clone()));
        debug!(peer = %peer_id, fingerprint = %key.fingerprint(), "saved peer public key");
        Ok(key)
    }

    /// Private keys of every other enabled account, in the order given.
    pub fn other_private_keys<'a>(
        &self,
        current_account: &str,
        owners: impl IntoIterator<Item = &'a KeyOwner>,
    ) -> Vec<(String, PgpKeyPair)> {
        owners
            .into_iter()
            .filter(|owner| owner.enabled && owner.account_id != current_account)
            .filter_map(|owner| {
                self.load_private(&owner.account_id)
                    .map(|pair| (owner.account_id.clone(), pair))
            })
            .collect()
    }

    /// Forget everything cached; the next lookup rereads the disk.
    pub fn reload(&self) {
        self.cache.lock().clear();
    }

    /// The account's long-term OTR identity, created on first use.
    pub fn load_or_create_otr_identity(&self, account_id: &str) -> Result<OtrIdentity> {
        let path = self.otr_identity_path(account_id);
        match fs::read_to_string(&path) {
            Ok(mut text) => {
                let parsed = parse_seed(text.trim());
                text.zeroize();
                match parsed {
                    Some(mut seed) => {
                        let identity = OtrIdentity::from_seed(&seed);
                        seed.zeroize();
                        return Ok(identity);
                    }
                    None => warn!(path = %path.display(), "malformed OTR identity, replacing"),
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(CryptoError::io(&path, err)),
        }

        let identity = OtrIdentity::generate();
        let mut encoded = hex::encode(identity.seed());
        let written = write_atomic(&path, encoded.as_bytes());
        encoded.zeroize();
        written?;
        info!(account = %account_id, fingerprint = %identity.fingerprint(), "created OTR identity");
        Ok(identity)
    }

    fn load(&self, path: &Path) -> Option<PgpKeyPair> {
        if let Some(cached) = self.cache.lock().get(path) {
            return cached.clone();
        }

        let loaded = match fs::read(path) {
            Ok(bytes) => match PgpKeyPair::from_bytes(&bytes) {
                Ok(pair) => Some(pair),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "ignoring malformed key file");
                    None
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cannot read key file");
                None
            }
        };
        self.cache.lock().insert(path.to_path_buf(), loaded.clone());
        loaded
    }
}

/// File name component for an account or peer id.
pub fn sanitize_id(id: &str) -> String {
    id.replace('/', "_")
}

/// Write through a temporary file in the target directory, then rename over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| CryptoError::InvalidInput(format!("no parent directory: {}", path.display())))?;
    fs::create_dir_all(dir).map_err(|e| CryptoError::io(dir, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| CryptoError::io(dir, e))?;
    tmp.write_all(bytes).map_err(|e| CryptoError::io(path, e))?;
    tmp.as_file().sync_all().map_err(|e| CryptoError::io(path, e))?;
    tmp.persist(path).map_err(|e| CryptoError::io(path, e.error))?;
    Ok(())
}

fn parse_seed(text: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(text).ok()?;
    bytes.try_into().ok()
}
