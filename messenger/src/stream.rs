//! Per-peer encryption facade.
//!
//! A [`MessageStream`] holds the PGP keys relevant to one conversation and, once OTR is
//! used, the conversation's OTR context. It decides how each outbound body is protected
//! and filters inbound bodies through OTR. Protocol messages the OTR engine wants on the
//! wire accumulate in an inject queue that the owner drains after every call.

use std::sync::Arc;

use sipchat_crypto_core::otr::{InjectQueue, InputOutcome, OtrContext, OtrHost, OtrIdentity, MESSAGE_PREFIX};
use sipchat_crypto_core::{
    Fingerprint, KeyOwner, KeyStore, OtrError, OtrSession, OtrState, PgpKeyPair, SmpStatus,
};
use tracing::{debug, info, warn};

use crate::events::SessionKey;
use crate::{MessengerError, Result};

/// Builds the OTR session for a stream.
pub trait OtrFactory: Send + Sync {
    fn create(&self, identity: OtrIdentity, host: Arc<dyn OtrHost>) -> Box<dyn OtrSession>;
}

/// The built-in OTR engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeOtr;

impl OtrFactory for NativeOtr {
    fn create(&self, identity: OtrIdentity, host: Arc<dyn OtrHost>) -> Box<dyn OtrSession> {
        Box::new(OtrContext::new(identity, host))
    }
}

/// Changes the owner should publish as events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSignal {
    PgpKeysLoaded,
    OtrStateChanged(OtrState),
    SmpStatusChanged(SmpStatus),
}

/// How an outbound body is to be protected.
#[derive(Debug, Clone)]
pub enum Encryption {
    Cleartext,
    /// Wire form produced by the OTR engine.
    Otr(Vec<u8>),
    /// Encrypt to both keys on the crypto pool.
    Pgp {
        my_public: PgpKeyPair,
        peer_public: PgpKeyPair,
    },
}

/// Result of passing an inbound body through OTR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckedInput {
    Deliver { content: Vec<u8>, is_secure: bool },
    Drop,
}

pub struct MessageStream {
    session: SessionKey,
    peer_instance_id: Option<String>,
    keys: Arc<KeyStore>,
    private_key: Option<PgpKeyPair>,
    public_key: Option<PgpKeyPair>,
    remote_key: Option<PgpKeyPair>,
    other_keys: Vec<(String, PgpKeyPair)>,
    otr: Option<Box<dyn OtrSession>>,
    otr_identity: Option<OtrIdentity>,
    otr_factory: Arc<dyn OtrFactory>,
    injects: InjectQueue,
    observed: (OtrState, SmpStatus),
    signals: Vec<StreamSignal>,
}

impl MessageStream {
    pub fn new(
        session: SessionKey,
        peer_instance_id: Option<String>,
        keys: Arc<KeyStore>,
        otr_factory: Arc<dyn OtrFactory>,
    ) -> Self {
        Self {
            session,
            peer_instance_id,
            keys,
            private_key: None,
            public_key: None,
            remote_key: None,
            other_keys: Vec::new(),
            otr: None,
            otr_identity: None,
            otr_factory,
            injects: InjectQueue::new(),
            observed: (OtrState::Plaintext, SmpStatus::Unavailable),
            signals: Vec::new(),
        }
    }

    pub fn session(&self) -> &SessionKey {
        &self.session
    }

    pub fn peer_instance_id(&self) -> Option<&str> {
        self.peer_instance_id.as_deref()
    }

    pub fn set_peer_instance_id(&mut self, instance_id: Option<String>) {
        if instance_id.is_some() {
            self.peer_instance_id = instance_id;
        }
    }

    /// The account's long-term OTR key, loaded off the network task. OTR cannot start
    /// without it.
    pub fn set_otr_identity(&mut self, identity: OtrIdentity) {
        self.otr_identity = Some(identity);
    }

    /// The file id the peer's public key is stored under.
    pub fn peer_key_id(&self) -> String {
        self.peer_instance_id
            .clone()
            .unwrap_or_else(|| self.session.peer.address())
    }

    /// Load the account's key pair, the peer's public key and the fallback keys.
    pub fn enable_pgp(&mut self, owners: &[KeyOwner]) {
        let account = self.session.account.as_str();
        self.private_key = self.keys.load_private(account);
        self.public_key = self.keys.load_own_public(account);
        self.remote_key = self
            .keys
            .load_public(self.peer_instance_id.as_deref(), &self.session.peer.address());
        self.other_keys = self.keys.other_private_keys(account, owners);
        debug!(
            session = %self.session,
            can_encrypt = self.can_encrypt(),
            can_decrypt = self.can_decrypt(),
            fallbacks = self.other_keys.len(),
            "pgp keys loaded"
        );
        self.signals.push(StreamSignal::PgpKeysLoaded);
    }

    pub fn can_encrypt(&self) -> bool {
        self.public_key.is_some() && self.remote_key.is_some()
    }

    pub fn can_decrypt(&self) -> bool {
        self.private_key.is_some()
    }

    pub fn can_decrypt_with_others(&self) -> bool {
        !self.other_keys.is_empty()
    }

    pub fn public_key(&self) -> Option<&PgpKeyPair> {
        self.public_key.as_ref()
    }

    pub fn remote_key(&self) -> Option<&PgpKeyPair> {
        self.remote_key.as_ref()
    }

    /// Decryption candidates: this account first, then the fallback accounts.
    pub fn pgp_candidates(&self) -> Vec<(String, PgpKeyPair)> {
        self.private_key
            .iter()
            .map(|key| (self.session.account.clone(), key.clone()))
            .chain(self.other_keys.iter().cloned())
            .collect()
    }

    /// True once the OTR handshake completed.
    pub fn encryption_active(&self) -> bool {
        self.otr_state() == OtrState::Encrypted
    }

    pub fn enable_otr(&mut self) -> Result<()> {
        self.ensure_otr()?.start();
        self.observe();
        Ok(())
    }

    /// Stop OTR, telling the peer when a session was up. The context stays for reuse.
    pub fn disable_otr(&mut self) {
        if let Some(otr) = self.otr.as_mut() {
            otr.stop();
        }
        self.observe();
    }

    pub fn otr_state(&self) -> OtrState {
        self.otr
            .as_ref()
            .map(|otr| otr.state())
            .unwrap_or(OtrState::Plaintext)
    }

    pub fn smp_status(&self) -> SmpStatus {
        self.otr
            .as_ref()
            .map(|otr| otr.smp_status())
            .unwrap_or(SmpStatus::Unavailable)
    }

    pub fn local_fingerprint(&self) -> Option<Fingerprint> {
        self.otr.as_ref().map(|otr| otr.local_fingerprint())
    }

    pub fn peer_fingerprint(&self) -> Option<Fingerprint> {
        self.otr.as_ref().and_then(|otr| otr.peer_fingerprint())
    }

    pub fn peer_verified(&self) -> bool {
        self.otr.as_ref().map(|otr| otr.peer_verified()).unwrap_or(false)
    }

    pub fn smp_start(&mut self, secret: &[u8]) -> Result<()> {
        let result = self.active_otr()?.smp_start(secret);
        self.observe();
        result.map_err(MessengerError::from)
    }

    pub fn smp_respond(&mut self, secret: &[u8]) -> Result<()> {
        let result = self.active_otr()?.smp_respond(secret);
        self.observe();
        result.map_err(MessengerError::from)
    }

    pub fn smp_abort(&mut self) {
        if let Some(otr) = self.otr.as_mut() {
            otr.smp_abort();
        }
        self.observe();
    }

    /// Choose the protection for an outbound body.
    ///
    /// A running OTR session always wins. If the engine hands back anything but an OTR
    /// message the session was downgraded: OTR is stopped and the send is refused.
    pub fn encrypt(&mut self, content: &[u8], content_type: &str, pgp_enabled: bool) -> Result<Encryption> {
        if let Some(otr) = self.otr.as_mut() {
            if otr.state() != OtrState::Plaintext {
                let outcome = otr.handle_output(content, content_type);
                let result = match outcome {
                    Ok(wire) if wire.starts_with(MESSAGE_PREFIX.as_bytes()) => Ok(Encryption::Otr(wire)),
                    Ok(_) => {
                        warn!(session = %self.session, "otr engine returned cleartext, stopping otr");
                        self.disable_otr();
                        Err(MessengerError::SecurityDowngrade)
                    }
                    Err(OtrError::Finished) => {
                        self.observe();
                        self.disable_otr();
                        Err(MessengerError::Otr(OtrError::Finished))
                    }
                    Err(err) => Err(err.into()),
                };
                self.observe();
                return result;
            }
        }

        if pgp_enabled {
            if let (Some(my_public), Some(peer_public)) = (&self.public_key, &self.remote_key) {
                return Ok(Encryption::Pgp {
                    my_public: my_public.clone(),
                    peer_public: peer_public.clone(),
                });
            }
        }
        Ok(Encryption::Cleartext)
    }

    /// Filter an inbound body through OTR.
    pub fn check_otr(&mut self, body: &[u8], content_type: &str) -> CheckedInput {
        if self.otr.is_none() {
            if !body.starts_with(b"?OTR") {
                return CheckedInput::Deliver {
                    content: body.to_vec(),
                    is_secure: false,
                };
            }
            if let Err(err) = self.ensure_otr() {
                warn!(session = %self.session, %err, "cannot create otr context");
                return CheckedInput::Drop;
            }
        }
        let Some(otr) = self.otr.as_mut() else {
            return CheckedInput::Drop;
        };

        let outcome = otr.handle_input(body, content_type);
        let was_encrypted = self.observed.0 == OtrState::Encrypted;
        self.observe();
        match outcome {
            Ok(InputOutcome::Decrypted(content)) => CheckedInput::Deliver {
                content,
                is_secure: true,
            },
            Ok(InputOutcome::Ignore) => CheckedInput::Drop,
            Ok(InputOutcome::Unencrypted(content)) => {
                if was_encrypted {
                    warn!(session = %self.session, "cleartext received inside an otr session");
                }
                CheckedInput::Deliver {
                    content,
                    is_secure: false,
                }
            }
            Err(OtrError::Finished) => {
                info!(session = %self.session, "peer finished the otr session");
                self.disable_otr();
                CheckedInput::Drop
            }
            Err(err) => {
                warn!(session = %self.session, %err, "dropping otr message");
                CheckedInput::Drop
            }
        }
    }

    pub fn drain_injects(&self) -> Vec<String> {
        self.injects.drain()
    }

    pub fn drain_signals(&mut self) -> Vec<StreamSignal> {
        std::mem::take(&mut self.signals)
    }

    fn ensure_otr(&mut self) -> Result<&mut Box<dyn OtrSession>> {
        let otr = match self.otr.take() {
            Some(otr) => otr,
            None => {
                let identity = self.otr_identity.clone().ok_or_else(|| {
                    MessengerError::Crypto(format!(
                        "otr identity for {} is not loaded",
                        self.session.account
                    ))
                })?;
                let host: Arc<dyn OtrHost> = Arc::new(self.injects.clone());
                debug!(session = %self.session, "created otr context");
                self.otr_factory.create(identity, host)
            }
        };
        Ok(self.otr.insert(otr))
    }

    fn active_otr(&mut self) -> Result<&mut Box<dyn OtrSession>> {
        self.otr
            .as_mut()
            .ok_or(MessengerError::Otr(OtrError::NotEncrypted))
    }

    fn observe(&mut self) {
        let current = (self.otr_state(), self.smp_status());
        if current.0 != self.observed.0 {
            info!(session = %self.session, from = %self.observed.0, to = %current.0, "otr state changed");
            self.signals.push(StreamSignal::OtrStateChanged(current.0));
        }
        if current.1 != self.observed.1 {
            debug!(session = %self.session, status = ?current.1, "smp status changed");
            self.signals.push(StreamSignal::SmpStatusChanged(current.1));
        }
        self.observed = current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipchat_crypto_core::KeyAlgorithm;
    use sipchat_messaging::SipUri;
    use tempfile::TempDir;

    struct Side {
        _dir: TempDir,
        keys: Arc<KeyStore>,
        stream: MessageStream,
    }

    fn side(account: &str, peer: &str) -> Side {
        let dir = TempDir::new().unwrap();
        let keys = Arc::new(KeyStore::new(dir.path()));
        let session = SessionKey::new(account, &SipUri::parse(peer).unwrap());
        let mut stream = MessageStream::new(session, None, keys.clone(), Arc::new(NativeOtr));
        stream.set_otr_identity(OtrIdentity::generate());
        Side {
            _dir: dir,
            keys,
            stream,
        }
    }

    fn pair() -> (Side, Side) {
        (
            side("alice@example.com", "sip:bob@example.com"),
            side("bob@example.com", "sip:alice@example.com"),
        )
    }

    fn pump(a: &mut MessageStream, b: &mut MessageStream) {
        for _ in 0..10 {
            let from_a = a.drain_injects();
            let from_b = b.drain_injects();
            if from_a.is_empty() && from_b.is_empty() {
                return;
            }
            for message in from_a {
                b.check_otr(message.as_bytes(), "text/plain");
            }
            for message in from_b {
                a.check_otr(message.as_bytes(), "text/plain");
            }
        }
    }

    fn handshake() -> (Side, Side) {
        let (mut alice, mut bob) = pair();
        alice.stream.enable_otr().unwrap();
        pump(&mut alice.stream, &mut bob.stream);
        assert_eq!(alice.stream.otr_state(), OtrState::Encrypted);
        assert_eq!(bob.stream.otr_state(), OtrState::Encrypted);
        (alice, bob)
    }

    #[test]
    fn cleartext_without_keys_or_otr() {
        let (mut alice, _) = pair();
        assert!(matches!(
            alice.stream.encrypt(b"hi", "text/plain", true).unwrap(),
            Encryption::Cleartext
        ));
        assert_eq!(
            alice.stream.check_otr(b"hello", "text/plain"),
            CheckedInput::Deliver {
                content: b"hello".to_vec(),
                is_secure: false
            }
        );
    }

    #[test]
    fn pgp_needs_both_public_keys() {
        let (mut alice, bob) = pair();
        alice
            .keys
            .generate_keypair(None, "alice@example.com", KeyAlgorithm::Cv25519)
            .unwrap();
        alice.stream.enable_pgp(&[]);
        assert!(alice.stream.can_decrypt());
        assert!(!alice.stream.can_encrypt());

        let bob_key = bob
            .keys
            .generate_keypair(None, "bob@example.com", KeyAlgorithm::Cv25519)
            .unwrap();
        alice
            .keys
            .save_public("bob@example.com", bob_key.export_public_key().unwrap().as_bytes())
            .unwrap();
        alice.stream.enable_pgp(&[]);
        assert!(alice.stream.can_encrypt());
        assert_eq!(alice.stream.drain_signals().len(), 2);

        assert!(matches!(
            alice.stream.encrypt(b"hi", "text/plain", true).unwrap(),
            Encryption::Pgp { .. }
        ));
        assert!(matches!(
            alice.stream.encrypt(b"hi", "text/plain", false).unwrap(),
            Encryption::Cleartext
        ));
    }

    #[test]
    fn fallback_keys_follow_the_own_key() {
        let (mut alice, _) = pair();
        alice
            .keys
            .generate_keypair(None, "alice@example.com", KeyAlgorithm::Cv25519)
            .unwrap();
        alice
            .keys
            .generate_keypair(None, "old@example.com", KeyAlgorithm::Cv25519)
            .unwrap();
        let owners = vec![
            KeyOwner::new("alice@example.com", true),
            KeyOwner::new("old@example.com", true),
        ];
        alice.stream.enable_pgp(&owners);
        assert!(alice.stream.can_decrypt_with_others());
        let accounts: Vec<String> = alice
            .stream
            .pgp_candidates()
            .into_iter()
            .map(|(account, _)| account)
            .collect();
        assert_eq!(accounts, vec!["alice@example.com", "old@example.com"]);
    }

    #[test]
    fn otr_handshake_and_encrypted_exchange() {
        let (mut alice, mut bob) = handshake();
        let signals = alice.stream.drain_signals();
        assert!(signals.contains(&StreamSignal::OtrStateChanged(OtrState::Encrypted)));

        let Encryption::Otr(wire) = alice.stream.encrypt(b"ping", "text/plain", false).unwrap() else {
            panic!("expected otr output");
        };
        assert!(wire.starts_with(b"?OTR:"));
        assert!(!String::from_utf8_lossy(&wire).contains("ping"));
        assert_eq!(
            bob.stream.check_otr(&wire, "text/plain"),
            CheckedInput::Deliver {
                content: b"ping".to_vec(),
                is_secure: true
            }
        );
        assert!(alice.stream.local_fingerprint().is_some());
        assert_eq!(alice.stream.peer_fingerprint(), bob.stream.local_fingerprint());
    }

    #[test]
    fn sending_during_the_handshake_is_refused() {
        let (mut alice, _) = pair();
        alice.stream.enable_otr().unwrap();
        assert_eq!(alice.stream.otr_state(), OtrState::AwaitingKey);
        assert!(matches!(
            alice.stream.encrypt(b"early", "text/plain", false),
            Err(MessengerError::Otr(OtrError::HandshakeInProgress))
        ));
    }

    #[test]
    fn peer_disable_returns_both_sides_to_plaintext() {
        let (mut alice, mut bob) = handshake();
        bob.stream.disable_otr();
        assert_eq!(bob.stream.otr_state(), OtrState::Plaintext);
        pump(&mut bob.stream, &mut alice.stream);
        assert_eq!(alice.stream.otr_state(), OtrState::Plaintext);
        let signals = alice.stream.drain_signals();
        assert!(signals.contains(&StreamSignal::OtrStateChanged(OtrState::Finished)));
        assert!(matches!(
            alice.stream.encrypt(b"again", "text/plain", false).unwrap(),
            Encryption::Cleartext
        ));
    }

    struct Downgraded;

    impl OtrSession for Downgraded {
        fn handle_input(&mut self, body: &[u8], _: &str) -> std::result::Result<InputOutcome, OtrError> {
            Ok(InputOutcome::Unencrypted(body.to_vec()))
        }
        fn handle_output(&mut self, content: &[u8], _: &str) -> std::result::Result<Vec<u8>, OtrError> {
            Ok(content.to_vec())
        }
        fn start(&mut self) {}
        fn stop(&mut self) {}
        fn smp_start(&mut self, _: &[u8]) -> std::result::Result<(), OtrError> {
            Ok(())
        }
        fn smp_respond(&mut self, _: &[u8]) -> std::result::Result<(), OtrError> {
            Ok(())
        }
        fn smp_abort(&mut self) {}
        fn state(&self) -> OtrState {
            OtrState::Encrypted
        }
        fn smp_status(&self) -> SmpStatus {
            SmpStatus::Unavailable
        }
        fn local_fingerprint(&self) -> Fingerprint {
            Fingerprint::from_public_key(b"local")
        }
        fn peer_fingerprint(&self) -> Option<Fingerprint> {
            None
        }
        fn peer_verified(&self) -> bool {
            false
        }
    }

    struct DowngradedFactory;

    impl OtrFactory for DowngradedFactory {
        fn create(&self, _: OtrIdentity, _: Arc<dyn OtrHost>) -> Box<dyn OtrSession> {
            Box::new(Downgraded)
        }
    }

    #[test]
    fn downgrade_is_refused() {
        let dir = TempDir::new().unwrap();
        let keys = Arc::new(KeyStore::new(dir.path()));
        let session = SessionKey::new("alice@example.com", &SipUri::parse("sip:bob@example.com").unwrap());
        let mut stream = MessageStream::new(session, None, keys, Arc::new(DowngradedFactory));
        stream.set_otr_identity(OtrIdentity::generate());
        stream.enable_otr().unwrap();
        assert!(matches!(
            stream.encrypt(b"boom", "text/plain", false),
            Err(MessengerError::SecurityDowngrade)
        ));
    }

    #[test]
    fn otr_waits_for_the_identity_and_never_touches_disk() {
        let dir = TempDir::new().unwrap();
        let keys = Arc::new(KeyStore::new(dir.path()));
        let session = SessionKey::new("alice@example.com", &SipUri::parse("sip:bob@example.com").unwrap());
        let mut stream = MessageStream::new(session, None, keys.clone(), Arc::new(NativeOtr));

        assert!(matches!(stream.enable_otr(), Err(MessengerError::Crypto(_))));
        assert_eq!(stream.check_otr(b"?OTRv3?", "text/plain"), CheckedInput::Drop);
        assert_eq!(stream.otr_state(), OtrState::Plaintext);
        assert!(!keys.otr_identity_path("alice@example.com").exists());

        let identity = OtrIdentity::generate();
        let fingerprint = identity.fingerprint();
        stream.set_otr_identity(identity);
        stream.enable_otr().unwrap();
        assert_eq!(stream.local_fingerprint(), Some(fingerprint));
        assert!(!keys.otr_identity_path("alice@example.com").exists());
    }

    #[test]
    fn peer_key_id_prefers_the_instance_id() {
        let (mut alice, _) = pair();
        assert_eq!(alice.stream.peer_key_id(), "bob@example.com");
        alice.stream.set_peer_instance_id(Some("abc-123".to_string()));
        alice.stream.set_peer_instance_id(None);
        assert_eq!(alice.stream.peer_key_id(), "abc-123");
    }
}
