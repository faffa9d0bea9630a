//! OpenPGP message and file encryption using Sequoia PGP.

use sequoia_openpgp as openpgp;
use openpgp::cert::{CertBuilder, CipherSuite};
use openpgp::crypto::{Password, SessionKey};
use openpgp::packet::signature::SignatureBuilder;
use openpgp::packet::{UserID, PKESK, SKESK};
use openpgp::parse::stream::*;
use openpgp::parse::Parse;
use openpgp::policy::{Policy, StandardPolicy};
use openpgp::serialize::stream::*;
use openpgp::serialize::Serialize;
use openpgp::types::{
    CompressionAlgorithm, HashAlgorithm, KeyFlags, SignatureType, SymmetricAlgorithm,
};
use openpgp::{Cert, KeyHandle};
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::{CryptoError, Fingerprint, Result};

/// Thread-safe static policy instance.
static POLICY: StandardPolicy<'static> = StandardPolicy::new();

fn policy() -> &'static dyn Policy {
    &POLICY
}

/// Comment placed in generated user ids.
pub const KEY_COMMENT: &str = "SipChat client";

const ARMOR_BEGIN: &str = "-----BEGIN PGP MESSAGE-----";
const ARMOR_END: &str = "-----END PGP MESSAGE-----";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    #[default]
    Rsa4096,
    Cv25519,
}

impl KeyAlgorithm {
    fn cipher_suite(self) -> CipherSuite {
        match self {
            KeyAlgorithm::Rsa4096 => CipherSuite::RSA4k,
            KeyAlgorithm::Cv25519 => CipherSuite::Cv25519,
        }
    }
}

/// PGP certificate wrapper; may or may not carry secret key material.
#[derive(Clone)]
pub struct PgpKeyPair {
    cert: Cert,
}

impl fmt::Debug for PgpKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgpKeyPair")
            .field("fingerprint", &self.fingerprint().to_string())
            .field("secret", &self.has_secret())
            .finish()
    }
}

impl PartialEq for PgpKeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.cert.fingerprint() == other.cert.fingerprint()
    }
}

impl PgpKeyPair {
    /// Generate a messaging key for `address` (`user@host`).
    ///
    /// The primary key certifies and signs; one subkey of the same algorithm carries both
    /// communications and storage encryption. The user id binding advertises SHA-512,
    /// AES-256 and no compression.
    pub fn generate(
        display_name: Option<&str>,
        address: &str,
        algorithm: KeyAlgorithm,
    ) -> Result<Self> {
        let userid = UserID::from_address(display_name, Some(KEY_COMMENT), address).or_else(|_| {
            let name = display_name.unwrap_or(address);
            Ok::<_, CryptoError>(UserID::from(format!("{} ({}) <{}>", name, KEY_COMMENT, address)))
        })?;

        let preferences = SignatureBuilder::new(SignatureType::PositiveCertification)
            .set_preferred_hash_algorithms(vec![HashAlgorithm::SHA512])
            .and_then(|b| b.set_preferred_symmetric_algorithms(vec![SymmetricAlgorithm::AES256]))
            .and_then(|b| {
                b.set_preferred_compression_algorithms(vec![CompressionAlgorithm::Uncompressed])
            })
            .map_err(|e| CryptoError::Internal(format!("key preferences failed: {}", e)))?;

        let (cert, _revocation) = CertBuilder::new()
            .set_cipher_suite(algorithm.cipher_suite())
            .set_primary_key_flags(KeyFlags::empty().set_certification().set_signing())
            .add_userid_with(userid, preferences)
            .map_err(|e| CryptoError::Internal(format!("user id binding failed: {}", e)))?
            .add_subkey(
                KeyFlags::empty()
                    .set_transport_encryption()
                    .set_storage_encryption(),
                None,
                None,
            )
            .generate()
            .map_err(|e| CryptoError::Internal(format!("key generation failed: {}", e)))?;
        Ok(Self { cert })
    }

    /// Parse an armored or binary certificate, with or without secret material.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let cert = Cert::from_bytes(data)
            .map_err(|e| CryptoError::InvalidKey(format!("failed to parse cert: {}", e)))?;
        Ok(Self { cert })
    }

    /// Export public key in ASCII-armored format.
    pub fn export_public_key(&self) -> Result<String> {
        let mut buf = Vec::new();
        let mut writer = openpgp::armor::Writer::new(&mut buf, openpgp::armor::Kind::PublicKey)
            .map_err(|e| CryptoError::Internal(format!("armor writer failed: {}", e)))?;
        self.cert.serialize(&mut writer)
            .map_err(|e| CryptoError::Internal(format!("cert serialization failed: {}", e)))?;
        writer.finalize()
            .map_err(|e| CryptoError::Internal(format!("armor finalize failed: {}", e)))?;
        String::from_utf8(buf)
            .map_err(|e| CryptoError::Internal(format!("utf8 conversion failed: {}", e)))
    }

    /// Export secret key in ASCII-armored format.
    pub fn export_secret_key(&self) -> Result<String> {
        if !self.has_secret() {
            return Err(CryptoError::NoPrivateKey);
        }
        let mut buf = Vec::new();
        let mut writer = openpgp::armor::Writer::new(&mut buf, openpgp::armor::Kind::SecretKey)
            .map_err(|e| CryptoError::Internal(format!("armor writer failed: {}", e)))?;
        self.cert.as_tsk().serialize(&mut writer)
            .map_err(|e| CryptoError::Internal(format!("tsk serialization failed: {}", e)))?;
        writer.finalize()
            .map_err(|e| CryptoError::Internal(format!("armor finalize failed: {}", e)))?;
        String::from_utf8(buf)
            .map_err(|e| CryptoError::Internal(format!("utf8 conversion failed: {}", e)))
    }

    /// The same certificate with all secret key material removed.
    pub fn public_only(&self) -> Self {
        Self {
            cert: self.cert.clone().strip_secret_key_material(),
        }
    }

    pub fn has_secret(&self) -> bool {
        self.cert.is_tsk()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint(self.cert.fingerprint().to_hex())
    }

    /// Access the underlying certificate.
    pub fn cert(&self) -> &Cert {
        &self.cert
    }
}

/// Successful decryption and the account whose key opened the message.
#[derive(Debug, Clone)]
pub struct PgpDecrypted {
    pub plaintext: Vec<u8>,
    pub account: String,
}

/// Output of [`PgpEngine::encrypt_file`].
#[derive(Debug, Clone)]
pub struct EncryptedFile {
    pub ciphertext: Vec<u8>,
    pub output_path: PathBuf,
}

/// Output of [`PgpEngine::decrypt_file`]. The caller writes `plaintext` to `output_path`
/// and removes the ciphertext once that write succeeded.
#[derive(Debug, Clone)]
pub struct DecryptedFile {
    pub plaintext: Vec<u8>,
    pub output_path: PathBuf,
    pub account: String,
}

/// Stateless OpenPGP operations. Everything here is CPU bound and belongs on a
/// blocking worker.
pub struct PgpEngine;

impl PgpEngine {
    /// Cheap textual check used to classify inbound bodies.
    pub fn looks_encrypted(body: &[u8]) -> bool {
        match std::str::from_utf8(body) {
            Ok(text) => text.contains(ARMOR_BEGIN) && text.contains(ARMOR_END),
            Err(_) => false,
        }
    }

    /// Whether the payload parses as an OpenPGP message (armored or binary).
    pub fn is_pgp_message(body: &[u8]) -> bool {
        openpgp::Message::from_bytes(body).is_ok()
    }

    /// Encrypt to both our own and the peer's certificate under one AES-256 session key,
    /// uncompressed, ASCII armored.
    pub fn encrypt(plaintext: &[u8], my_public: &PgpKeyPair, peer_public: &PgpKeyPair) -> Result<Vec<u8>> {
        Self::encrypt_literal(plaintext, &[my_public, peer_public], None)
    }

    /// Try each candidate private key in order and report which account matched.
    pub fn decrypt(ciphertext: &[u8], candidates: &[(String, PgpKeyPair)]) -> Result<PgpDecrypted> {
        if !Self::is_pgp_message(ciphertext) {
            return Err(CryptoError::NotPgpMessage);
        }
        if candidates.is_empty() {
            return Err(CryptoError::NoPrivateKey);
        }

        let mut last_error = None;
        for (account, key) in candidates {
            match Self::decrypt_with_cert(key.cert(), ciphertext) {
                Ok(plaintext) => {
                    return Ok(PgpDecrypted {
                        plaintext,
                        account: account.clone(),
                    })
                }
                Err(e) => {
                    tracing::debug!(%account, error = %e, "candidate key did not decrypt");
                    last_error = Some(e);
                }
            }
        }
        Err(CryptoError::DecryptionFailed(
            last_error.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    /// Encrypt a file's contents; the result is destined for `<path>.asc`.
    pub fn encrypt_file(path: &Path, my_public: &PgpKeyPair, peer_public: &PgpKeyPair) -> Result<EncryptedFile> {
        let contents = std::fs::read(path).map_err(|e| CryptoError::io(path, e))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| CryptoError::InvalidInput(format!("{} has no file name", path.display())))?;
        let ciphertext = Self::encrypt_literal(&contents, &[my_public, peer_public], Some(&name))?;

        let mut output = path.as_os_str().to_owned();
        output.push(".asc");
        Ok(EncryptedFile {
            ciphertext,
            output_path: PathBuf::from(output),
        })
    }

    /// Decrypt an `.asc` file. The plaintext always lands at the ciphertext stem,
    /// whatever name the literal packet carries.
    pub fn decrypt_file(path: &Path, candidates: &[(String, PgpKeyPair)]) -> Result<DecryptedFile> {
        let output_path = match path.extension() {
            Some(ext) if ext.eq_ignore_ascii_case("asc") => path.with_extension(""),
            _ => {
                return Err(CryptoError::InvalidInput(format!(
                    "{} is not an .asc file",
                    path.display()
                )))
            }
        };
        let ciphertext = std::fs::read(path).map_err(|e| CryptoError::io(path, e))?;
        let decrypted = Self::decrypt(&ciphertext, candidates)?;
        Ok(DecryptedFile {
            plaintext: decrypted.plaintext,
            output_path,
            account: decrypted.account,
        })
    }

    /// Symmetric encryption under a password, used for private-key transfer.
    pub fn encrypt_with_password(plaintext: &[u8], password: &str) -> Result<Vec<u8>> {
        let mut sink = Vec::new();
        let message = Message::new(&mut sink);
        let message = Armorer::new(message).build()
            .map_err(|e| CryptoError::Internal(format!("armorer build failed: {}", e)))?;
        let message = Encryptor2::with_passwords(message, Some(Password::from(password)))
            .symmetric_algo(SymmetricAlgorithm::AES256)
            .build()
            .map_err(|e| CryptoError::Internal(format!("encryptor build failed: {}", e)))?;
        let mut message = LiteralWriter::new(message)
            .build()
            .map_err(|e| CryptoError::Internal(format!("literal writer build failed: {}", e)))?;

        message.write_all(plaintext)
            .map_err(|e| CryptoError::Internal(format!("write failed: {}", e)))?;
        message.finalize()
            .map_err(|e| CryptoError::Internal(format!("finalize failed: {}", e)))?;
        Ok(sink)
    }

    pub fn decrypt_with_password(ciphertext: &[u8], password: &str) -> Result<Vec<u8>> {
        struct Helper {
            password: Password,
        }

        impl DecryptionHelper for Helper {
            fn decrypt<D>(
                &mut self,
                _pkesks: &[PKESK],
                skesks: &[SKESK],
                _sym_algo: Option<SymmetricAlgorithm>,
                mut decrypt: D,
            ) -> openpgp::Result<Option<openpgp::Fingerprint>>
            where
                D: FnMut(SymmetricAlgorithm, &SessionKey) -> bool,
            {
                for skesk in skesks {
                    if let Ok((algo, session_key)) = skesk.decrypt(&self.password) {
                        if decrypt(algo, &session_key) {
                            return Ok(None);
                        }
                    }
                }
                Err(openpgp::Error::InvalidOperation("wrong password".to_string()).into())
            }
        }

        impl VerificationHelper for Helper {
            fn get_certs(&mut self, _ids: &[KeyHandle]) -> openpgp::Result<Vec<Cert>> {
                Ok(Vec::new())
            }

            fn check(&mut self, _structure: MessageStructure) -> openpgp::Result<()> {
                Ok(())
            }
        }

        if !Self::is_pgp_message(ciphertext) {
            return Err(CryptoError::NotPgpMessage);
        }
        let helper = Helper {
            password: Password::from(password),
        };
        Self::run_decryptor(ciphertext, helper)
    }

    fn encrypt_literal(plaintext: &[u8], recipients: &[&PgpKeyPair], filename: Option<&str>) -> Result<Vec<u8>> {
        let mut keys = Vec::new();
        for pair in recipients {
            let before = keys.len();
            keys.extend(
                pair.cert()
                    .keys()
                    .with_policy(policy(), None)
                    .supported()
                    .alive()
                    .revoked(false)
                    .for_transport_encryption()
                    .map(|ka| ka.key()),
            );
            if keys.len() == before {
                return Err(CryptoError::NoEncryptionKey(pair.fingerprint().to_string()));
            }
        }

        let mut sink = Vec::new();
        let message = Message::new(&mut sink);
        let message = Armorer::new(message).build()
            .map_err(|e| CryptoError::Internal(format!("armorer build failed: {}", e)))?;
        // One session key is generated for all recipients and zeroed when dropped.
        let message = Encryptor2::for_recipients(message, keys)
            .symmetric_algo(SymmetricAlgorithm::AES256)
            .build()
            .map_err(|e| CryptoError::Internal(format!("encryptor build failed: {}", e)))?;
        let mut literal = LiteralWriter::new(message);
        if let Some(name) = filename {
            literal = literal
                .filename(name)
                .map_err(|e| CryptoError::Internal(format!("literal filename rejected: {}", e)))?;
        }
        let mut message = literal
            .build()
            .map_err(|e| CryptoError::Internal(format!("literal writer build failed: {}", e)))?;

        message.write_all(plaintext)
            .map_err(|e| CryptoError::Internal(format!("write failed: {}", e)))?;
        message.finalize()
            .map_err(|e| CryptoError::Internal(format!("finalize failed: {}", e)))?;

        Ok(sink)
    }

    fn decrypt_with_cert(cert: &Cert, ciphertext: &[u8]) -> Result<Vec<u8>> {
        struct Helper<'a> {
            cert: &'a Cert,
            policy: &'static dyn Policy,
        }

        impl<'a> DecryptionHelper for Helper<'a> {
            fn decrypt<D>(
                &mut self,
                pkesks: &[PKESK],
                _skesks: &[SKESK],
                sym_algo: Option<SymmetricAlgorithm>,
                mut decrypt: D,
            ) -> openpgp::Result<Option<openpgp::Fingerprint>>
            where
                D: FnMut(SymmetricAlgorithm, &SessionKey) -> bool,
            {
                let keys: Vec<_> = self.cert.keys()
                    .with_policy(self.policy, None)
                    .supported()
                    .revoked(false)
                    .for_transport_encryption()
                    .for_storage_encryption()
                    .secret()
                    .collect();

                for pkesk in pkesks {
                    for key in &keys {
                        let mut keypair = key.key().clone().into_keypair()
                            .map_err(|e| openpgp::Error::InvalidOperation(format!("keypair failed: {}", e)))?;

                        if let Some((algo, session_key)) = pkesk.decrypt(&mut keypair, sym_algo) {
                            if decrypt(algo, &session_key) {
                                return Ok(Some(key.fingerprint()));
                            }
                        }
                    }
                }

                Err(openpgp::Error::InvalidOperation("no matching secret key".to_string()).into())
            }
        }

        impl<'a> VerificationHelper for Helper<'a> {
            fn get_certs(&mut self, _ids: &[KeyHandle]) -> openpgp::Result<Vec<Cert>> {
                Ok(vec![self.cert.clone()])
            }

            fn check(&mut self, _structure: MessageStructure) -> openpgp::Result<()> {
                Ok(())
            }
        }

        if !cert.is_tsk() {
            return Err(CryptoError::NoPrivateKey);
        }
        Self::run_decryptor(ciphertext, Helper { cert, policy: policy() })
    }

    fn run_decryptor<H>(ciphertext: &[u8], helper: H) -> Result<Vec<u8>>
    where
        H: DecryptionHelper + VerificationHelper,
    {
        let mut plaintext = Vec::new();
        let mut decryptor = DecryptorBuilder::from_reader(io::Cursor::new(ciphertext))
            .map_err(|e| CryptoError::DecryptionFailed(format!("decryptor build failed: {}", e)))?
            .with_policy(policy(), None, helper)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;

        io::copy(&mut decryptor, &mut plaintext)
            .map_err(|e| CryptoError::DecryptionFailed(format!("copy failed: {}", e)))?;

        Ok(plaintext)
    }
}
