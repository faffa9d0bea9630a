use std::collections::HashMap;
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use ed25519_dalek::{Signature, Signer, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use tracing::{debug, info, warn};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use super::smp::{Smp, SmpBinding};
use super::wire::{
    self, DataMessage, Frame, Incoming, Tlv, TLV_DISCONNECTED, TLV_SMP1, TLV_SMP2, TLV_SMP3,
    TLV_SMP4, TLV_SMP_ABORT,
};
use super::{
    InputOutcome, OtrError, OtrHost, OtrIdentity, OtrSession, OtrState, SmpStatus, QUERY_MESSAGE,
};
use crate::Fingerprint;

const NONCE_LEN: usize = 12;
const SEALED_IDENTITY_LEN: usize = 32 + 64;

/// Progress of the authenticated key exchange.
enum Ake {
    Idle,
    /// Query sent; the peer answers with a DH-Key.
    QuerySent,
    /// DH-Key sent; the peer answers with a Reveal-Signature.
    DhKeySent { secret: StaticSecret, public: PublicKey },
    /// Reveal-Signature sent; the peer answers with a Signature.
    RevealSent {
        secret: StaticSecret,
        public: PublicKey,
        their_public: PublicKey,
        keys: AkeKeys,
    },
}

struct AkeKeys {
    ssid: [u8; 8],
    initiator: Zeroizing<[u8; 32]>,
    responder: Zeroizing<[u8; 32]>,
}

impl AkeKeys {
    fn derive(secret: &StaticSecret, their_public: &PublicKey) -> Result<Self, OtrError> {
        let shared = secret.diffie_hellman(their_public);
        if !shared.was_contributory() {
            return Err(OtrError::Protocol("non-contributory key exchange".to_string()));
        }
        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut keys = Self {
            ssid: [0u8; 8],
            initiator: Zeroizing::new([0u8; 32]),
            responder: Zeroizing::new([0u8; 32]),
        };
        hk.expand(b"sipchat-otr ssid", &mut keys.ssid)
            .and_then(|_| hk.expand(b"sipchat-otr ake-a", &mut keys.initiator[..]))
            .and_then(|_| hk.expand(b"sipchat-otr ake-b", &mut keys.responder[..]))
            .map_err(|e| OtrError::Protocol(format!("key derivation failed: {}", e)))?;
        Ok(keys)
    }
}

struct DhKeyPair {
    id: u32,
    secret: StaticSecret,
    public: PublicKey,
}

impl DhKeyPair {
    fn fresh(id: u32) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { id, secret, public }
    }
}

/// Key material of an established session. Both sides keep their current and previous
/// DH keys so messages in flight across a rotation still decrypt.
struct DataSession {
    our_current: DhKeyPair,
    our_previous: DhKeyPair,
    their_current: (u32, PublicKey),
    their_previous: Option<(u32, PublicKey)>,
    send_counter: u64,
    /// Highest counter accepted per (their keyid, our keyid).
    received: HashMap<(u32, u32), u64>,
    ssid: [u8; 8],
    peer_identity: [u8; 32],
}

impl DataSession {
    fn new(
        ake_secret: StaticSecret,
        ake_public: PublicKey,
        their_public: PublicKey,
        ssid: [u8; 8],
        peer_identity: [u8; 32],
    ) -> Self {
        Self {
            our_current: DhKeyPair::fresh(2),
            our_previous: DhKeyPair {
                id: 1,
                secret: ake_secret,
                public: ake_public,
            },
            their_current: (1, their_public),
            their_previous: None,
            send_counter: 0,
            received: HashMap::new(),
            ssid,
            peer_identity,
        }
    }

    fn our_key(&self, id: u32) -> Option<&DhKeyPair> {
        [&self.our_current, &self.our_previous]
            .into_iter()
            .find(|k| k.id == id)
    }

    fn their_key(&self, id: u32) -> Option<&PublicKey> {
        std::iter::once(&self.their_current)
            .chain(self.their_previous.as_ref())
            .find(|(kid, _)| *kid == id)
            .map(|(_, key)| key)
    }

    fn seal(&mut self, plaintext: &[u8]) -> Result<DataMessage, OtrError> {
        self.send_counter += 1;
        let their = self.their_current.1;
        let mut message = DataMessage {
            flags: 0,
            sender_keyid: self.our_previous.id,
            recipient_keyid: self.their_current.0,
            next_dh: self.our_current.public.to_bytes(),
            counter: self.send_counter,
            ciphertext: Vec::new(),
        };
        let key = message_key(&self.our_previous, &their, Direction::Sending)?;
        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|e| OtrError::Protocol(format!("cipher init failed: {}", e)))?;
        let aad = message.header();
        message.ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&counter_nonce(message.counter)),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| OtrError::Protocol("encryption failed".to_string()))?;
        Ok(message)
    }

    /// Open a data message. Fails with `Ok(Err(..))` for recoverable rejections (unknown
    /// keys, replays) and `Err(..)` when authentication failed.
    fn open(&mut self, message: &DataMessage) -> Result<Result<Vec<u8>, String>, OtrError> {
        let Some(their) = self.their_key(message.sender_keyid).copied() else {
            return Ok(Err(format!("unknown sender key {}", message.sender_keyid)));
        };
        let Some(ours) = self.our_key(message.recipient_keyid) else {
            return Ok(Err(format!("unknown recipient key {}", message.recipient_keyid)));
        };
        let pair = (message.sender_keyid, message.recipient_keyid);
        if message.counter <= self.received.get(&pair).copied().unwrap_or(0) {
            return Ok(Err(format!("counter {} replayed", message.counter)));
        }

        let key = message_key(ours, &their, Direction::Receiving)?;
        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|e| OtrError::Protocol(format!("cipher init failed: {}", e)))?;
        let aad = message.header();
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&counter_nonce(message.counter)),
                Payload {
                    msg: &message.ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| OtrError::EncryptedMessage("message authentication failed".to_string()))?;

        self.received.insert(pair, message.counter);
        self.rotate(message);
        Ok(Ok(plaintext))
    }

    fn rotate(&mut self, message: &DataMessage) {
        if message.recipient_keyid == self.our_current.id {
            let next = DhKeyPair::fresh(self.our_current.id + 1);
            self.our_previous = std::mem::replace(&mut self.our_current, next);
        }
        if message.sender_keyid == self.their_current.0 {
            let next = (self.their_current.0 + 1, PublicKey::from(message.next_dh));
            self.their_previous = Some(std::mem::replace(&mut self.their_current, next));
        }
        let our_floor = self.our_previous.id;
        let their_floor = self
            .their_previous
            .map_or(self.their_current.0, |(id, _)| id);
        self.received
            .retain(|(theirs, ours), _| *theirs >= their_floor && *ours >= our_floor);
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Sending,
    Receiving,
}

/// Each direction of a key pair gets its own key: the side whose public key sorts
/// higher sends under "high".
fn message_key(
    ours: &DhKeyPair,
    theirs: &PublicKey,
    direction: Direction,
) -> Result<Zeroizing<[u8; 32]>, OtrError> {
    let shared = ours.secret.diffie_hellman(theirs);
    if !shared.was_contributory() {
        return Err(OtrError::EncryptedMessage("non-contributory key".to_string()));
    }
    let we_are_high = ours.public.as_bytes() > theirs.as_bytes();
    let sender_is_high = match direction {
        Direction::Sending => we_are_high,
        Direction::Receiving => !we_are_high,
    };
    let info: &[u8] = if sender_is_high {
        b"sipchat-otr data high"
    } else {
        b"sipchat-otr data low"
    };
    let mut key = Zeroizing::new([0u8; 32]);
    Hkdf::<Sha256>::new(None, shared.as_bytes())
        .expand(info, &mut key[..])
        .map_err(|e| OtrError::Protocol(format!("key derivation failed: {}", e)))?;
    Ok(key)
}

fn counter_nonce(counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

fn seal_identity(key: &[u8; 32], identity: &[u8; 32], signature: &Signature) -> Result<Vec<u8>, OtrError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| OtrError::Protocol(format!("cipher init failed: {}", e)))?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let mut plaintext = Vec::with_capacity(SEALED_IDENTITY_LEN);
    plaintext.extend_from_slice(identity);
    plaintext.extend_from_slice(&signature.to_bytes());
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
        .map_err(|_| OtrError::Protocol("sealing identity failed".to_string()))?;
    let mut sealed = nonce.to_vec();
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

fn open_identity(key: &[u8; 32], sealed: &[u8]) -> Result<(VerifyingKey, Signature), OtrError> {
    let failed = || OtrError::Protocol("peer authentication failed".to_string());
    if sealed.len() < NONCE_LEN {
        return Err(failed());
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| failed())?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| failed())?;
    if plaintext.len() != SEALED_IDENTITY_LEN {
        return Err(failed());
    }
    let identity: [u8; 32] = plaintext[..32].try_into().map_err(|_| failed())?;
    let signature: [u8; 64] = plaintext[32..].try_into().map_err(|_| failed())?;
    let verifying = VerifyingKey::from_bytes(&identity).map_err(|_| failed())?;
    Ok((verifying, Signature::from_bytes(&signature)))
}

/// What an identity signature covers: role tag, own ephemeral, peer ephemeral, identity.
fn signed_transcript(role: u8, ours: &PublicKey, theirs: &PublicKey, identity: &[u8; 32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 32 * 3);
    out.push(role);
    out.extend_from_slice(ours.as_bytes());
    out.extend_from_slice(theirs.as_bytes());
    out.extend_from_slice(identity);
    out
}

/// One OTR conversation with one peer.
pub struct OtrContext {
    identity: OtrIdentity,
    host: Arc<dyn OtrHost>,
    state: OtrState,
    ake: Ake,
    session: Option<DataSession>,
    smp: Smp,
    peer_fingerprint: Option<Fingerprint>,
    peer_verified: bool,
}

impl OtrContext {
    pub fn new(identity: OtrIdentity, host: Arc<dyn OtrHost>) -> Self {
        Self {
            identity,
            host,
            state: OtrState::Plaintext,
            ake: Ake::Idle,
            session: None,
            smp: Smp::new(),
            peer_fingerprint: None,
            peer_verified: false,
        }
    }

    fn inject_frame(&self, frame: Frame) {
        self.host.inject(&frame.to_message());
    }

    fn set_state(&mut self, state: OtrState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "otr state change");
            self.state = state;
        }
    }

    fn reset(&mut self) {
        self.ake = Ake::Idle;
        self.session = None;
        self.smp.reset();
        self.peer_verified = false;
    }

    fn finish(&mut self) {
        self.reset();
        self.set_state(OtrState::Finished);
    }

    fn handshake_started(&mut self) {
        if self.state != OtrState::Encrypted {
            self.set_state(OtrState::AwaitingKey);
        }
    }

    fn send_dh_key(&mut self) {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        self.inject_frame(Frame::DhKey {
            public: public.to_bytes(),
        });
        self.ake = Ake::DhKeySent { secret, public };
        self.handshake_started();
    }

    fn handle_query(&mut self) -> Result<InputOutcome, OtrError> {
        debug!("otr query received");
        self.send_dh_key();
        Ok(InputOutcome::Ignore)
    }

    fn handle_dh_key(&mut self, their: [u8; 32]) -> Result<InputOutcome, OtrError> {
        let their_public = PublicKey::from(their);
        let (secret, public) = match std::mem::replace(&mut self.ake, Ake::Idle) {
            Ake::DhKeySent { secret, public } => {
                // Both sides sent DH-Key: the lower key becomes the initiator.
                if public.as_bytes() > their_public.as_bytes() {
                    self.ake = Ake::DhKeySent { secret, public };
                    return Ok(InputOutcome::Ignore);
                }
                (secret, public)
            }
            Ake::RevealSent {
                secret,
                public,
                their_public: pending,
                keys,
            } => {
                self.ake = Ake::RevealSent {
                    secret,
                    public,
                    their_public: pending,
                    keys,
                };
                return Ok(InputOutcome::Ignore);
            }
            Ake::Idle | Ake::QuerySent => {
                let secret = StaticSecret::random_from_rng(OsRng);
                let public = PublicKey::from(&secret);
                (secret, public)
            }
        };

        let keys = match AkeKeys::derive(&secret, &their_public) {
            Ok(keys) => keys,
            Err(err) => return self.authentication_failed(err),
        };
        let own_identity = self.identity.public_key();
        let signature = self
            .identity
            .signing_key()
            .sign(&signed_transcript(b'A', &public, &their_public, &own_identity));
        let sealed = seal_identity(&keys.initiator, &own_identity, &signature)?;
        self.inject_frame(Frame::RevealSignature {
            public: public.to_bytes(),
            sealed,
        });
        self.ake = Ake::RevealSent {
            secret,
            public,
            their_public,
            keys,
        };
        self.handshake_started();
        Ok(InputOutcome::Ignore)
    }

    fn handle_reveal_signature(
        &mut self,
        their: [u8; 32],
        sealed: &[u8],
    ) -> Result<InputOutcome, OtrError> {
        let Ake::DhKeySent { .. } = self.ake else {
            debug!("ignoring unexpected reveal-signature");
            return Ok(InputOutcome::Ignore);
        };
        let Ake::DhKeySent { secret, public } = std::mem::replace(&mut self.ake, Ake::Idle) else {
            return Ok(InputOutcome::Ignore);
        };
        let their_public = PublicKey::from(their);
        let keys = match AkeKeys::derive(&secret, &their_public) {
            Ok(keys) => keys,
            Err(err) => return self.authentication_failed(err),
        };
        let (peer, signature) = match open_identity(&keys.initiator, sealed) {
            Ok(opened) => opened,
            Err(err) => return self.authentication_failed(err),
        };
        let transcript = signed_transcript(b'A', &their_public, &public, peer.as_bytes());
        if peer.verify(&transcript, &signature).is_err() {
            return self.authentication_failed(OtrError::Protocol(
                "peer signature invalid".to_string(),
            ));
        }

        let own_identity = self.identity.public_key();
        let own_signature = self
            .identity
            .signing_key()
            .sign(&signed_transcript(b'B', &public, &their_public, &own_identity));
        let reply = seal_identity(&keys.responder, &own_identity, &own_signature)?;
        self.inject_frame(Frame::Signature { sealed: reply });
        self.established(secret, public, their_public, keys.ssid, peer.to_bytes());
        Ok(InputOutcome::Ignore)
    }

    fn handle_signature(&mut self, sealed: &[u8]) -> Result<InputOutcome, OtrError> {
        let Ake::RevealSent { .. } = self.ake else {
            debug!("ignoring unexpected signature");
            return Ok(InputOutcome::Ignore);
        };
        let Ake::RevealSent {
            secret,
            public,
            their_public,
            keys,
        } = std::mem::replace(&mut self.ake, Ake::Idle)
        else {
            return Ok(InputOutcome::Ignore);
        };
        let (peer, signature) = match open_identity(&keys.responder, sealed) {
            Ok(opened) => opened,
            Err(err) => return self.authentication_failed(err),
        };
        let transcript = signed_transcript(b'B', &their_public, &public, peer.as_bytes());
        if peer.verify(&transcript, &signature).is_err() {
            return self.authentication_failed(OtrError::Protocol(
                "peer signature invalid".to_string(),
            ));
        }
        self.established(secret, public, their_public, keys.ssid, peer.to_bytes());
        Ok(InputOutcome::Ignore)
    }

    fn authentication_failed(&mut self, err: OtrError) -> Result<InputOutcome, OtrError> {
        warn!(error = %err, "otr key exchange failed");
        self.finish();
        Err(err)
    }

    fn established(
        &mut self,
        secret: StaticSecret,
        public: PublicKey,
        their_public: PublicKey,
        ssid: [u8; 8],
        peer_identity: [u8; 32],
    ) {
        let fingerprint = Fingerprint::from_public_key(&peer_identity);
        if self.peer_fingerprint.as_ref() != Some(&fingerprint) {
            self.peer_verified = false;
        }
        info!(peer = %fingerprint, "otr session encrypted");
        self.peer_fingerprint = Some(fingerprint);
        self.session = Some(DataSession::new(
            secret,
            public,
            their_public,
            ssid,
            peer_identity,
        ));
        self.smp.reset();
        self.set_state(OtrState::Encrypted);
    }

    fn handle_data(&mut self, message: &DataMessage) -> Result<InputOutcome, OtrError> {
        match self.state {
            OtrState::Finished => return Err(OtrError::Finished),
            OtrState::Encrypted => {}
            _ => {
                return Err(OtrError::EncryptedMessage(
                    "no encrypted session with this peer".to_string(),
                ))
            }
        }
        let Some(session) = self.session.as_mut() else {
            return Err(OtrError::NotEncrypted);
        };
        let plaintext = match session.open(message) {
            Ok(Ok(plaintext)) => plaintext,
            Ok(Err(reason)) => return Err(OtrError::EncryptedMessage(reason)),
            Err(err) => {
                warn!(error = %err, "otr data message rejected");
                self.finish();
                return Err(err);
            }
        };

        let Some((body, tlvs)) = wire::decode_plaintext(&plaintext) else {
            return Err(OtrError::EncryptedMessage("malformed TLV section".to_string()));
        };

        for tlv in &tlvs {
            match tlv.kind {
                TLV_DISCONNECTED => {
                    info!("peer ended the otr session");
                    self.finish();
                    return Err(OtrError::Finished);
                }
                TLV_SMP1 | TLV_SMP2 | TLV_SMP3 | TLV_SMP4 | TLV_SMP_ABORT => self.handle_smp(tlv)?,
                other => debug!(kind = other, "ignoring unknown tlv"),
            }
        }

        if body.is_empty() {
            Ok(InputOutcome::Ignore)
        } else {
            Ok(InputOutcome::Decrypted(body))
        }
    }

    fn handle_smp(&mut self, tlv: &Tlv) -> Result<(), OtrError> {
        let outcome = self.smp.handle(tlv);
        if let Some(verified) = outcome.verified {
            self.peer_verified = verified;
            info!(verified, "smp finished");
        }
        if let Some(reply) = outcome.reply {
            self.send_tlvs(b"", &[reply])?;
        }
        Ok(())
    }

    fn send_tlvs(&mut self, body: &[u8], tlvs: &[Tlv]) -> Result<(), OtrError> {
        let session = self.session.as_mut().ok_or(OtrError::NotEncrypted)?;
        let message = session.seal(&wire::encode_plaintext(body, tlvs))?;
        self.inject_frame(Frame::Data(message));
        Ok(())
    }

    /// Fingerprints of the SMP initiator and responder plus the session id.
    fn smp_parties(&self, we_start: bool) -> Result<([u8; 32], [u8; 32], [u8; 8]), OtrError> {
        let session = self.session.as_ref().ok_or(OtrError::NotEncrypted)?;
        let ours = self.identity.public_key();
        let theirs = session.peer_identity;
        let (initiator, responder) = if we_start { (ours, theirs) } else { (theirs, ours) };
        Ok((initiator, responder, session.ssid))
    }
}

impl OtrSession for OtrContext {
    fn handle_input(&mut self, body: &[u8], _content_type: &str) -> Result<InputOutcome, OtrError> {
        let Ok(text) = std::str::from_utf8(body) else {
            return Ok(InputOutcome::Unencrypted(body.to_vec()));
        };
        match wire::classify(text) {
            Incoming::Plain => Ok(InputOutcome::Unencrypted(body.to_vec())),
            Incoming::Query => self.handle_query(),
            Incoming::Error(reason) => Err(OtrError::Protocol(reason)),
            Incoming::Unreadable => {
                debug!("ignoring unreadable otr message");
                Ok(InputOutcome::Ignore)
            }
            Incoming::Frame(Frame::DhKey { public }) => self.handle_dh_key(public),
            Incoming::Frame(Frame::RevealSignature { public, sealed }) => {
                self.handle_reveal_signature(public, &sealed)
            }
            Incoming::Frame(Frame::Signature { sealed }) => self.handle_signature(&sealed),
            Incoming::Frame(Frame::Data(message)) => self.handle_data(&message),
        }
    }

    fn handle_output(&mut self, content: &[u8], content_type: &str) -> Result<Vec<u8>, OtrError> {
        match self.state {
            OtrState::Plaintext => Ok(content.to_vec()),
            OtrState::AwaitingKey => Err(OtrError::HandshakeInProgress),
            OtrState::Finished => Err(OtrError::Finished),
            OtrState::Encrypted => {
                if !content_type.to_ascii_lowercase().starts_with("text/") {
                    return Err(OtrError::UnsupportedContentType(content_type.to_string()));
                }
                let session = self.session.as_mut().ok_or(OtrError::NotEncrypted)?;
                let message = session.seal(&wire::encode_plaintext(content, &[]))?;
                Ok(Frame::Data(message).to_message().into_bytes())
            }
        }
    }

    fn start(&mut self) {
        if self.state == OtrState::Finished {
            self.reset();
        }
        info!(state = %self.state, "starting otr");
        self.host.inject(QUERY_MESSAGE);
        self.ake = Ake::QuerySent;
        self.handshake_started();
    }

    fn stop(&mut self) {
        if self.state == OtrState::Encrypted {
            if let Err(err) = self.send_tlvs(b"", &[Tlv::new(TLV_DISCONNECTED, Vec::new())]) {
                warn!(error = %err, "could not notify peer of otr disconnect");
            }
        }
        self.reset();
        self.set_state(OtrState::Plaintext);
    }

    fn smp_start(&mut self, secret: &[u8]) -> Result<(), OtrError> {
        if self.state != OtrState::Encrypted {
            return Err(OtrError::NotEncrypted);
        }
        let (initiator, responder, ssid) = self.smp_parties(true)?;
        let tlv = self.smp.start(
            secret,
            &SmpBinding {
                initiator: &initiator,
                responder: &responder,
                ssid: &ssid,
            },
        );
        self.send_tlvs(b"", &[tlv])
    }

    fn smp_respond(&mut self, secret: &[u8]) -> Result<(), OtrError> {
        if self.state != OtrState::Encrypted {
            return Err(OtrError::NotEncrypted);
        }
        let (initiator, responder, ssid) = self.smp_parties(false)?;
        let tlv = self.smp.respond(
            secret,
            &SmpBinding {
                initiator: &initiator,
                responder: &responder,
                ssid: &ssid,
            },
        )?;
        self.send_tlvs(b"", &[tlv])
    }

    fn smp_abort(&mut self) {
        if let Some(tlv) = self.smp.abort() {
            if let Err(err) = self.send_tlvs(b"", &[tlv]) {
                debug!(error = %err, "smp abort not delivered");
            }
        }
    }

    fn state(&self) -> OtrState {
        self.state
    }

    fn smp_status(&self) -> SmpStatus {
        if self.state == OtrState::Encrypted {
            self.smp.status()
        } else {
            SmpStatus::Unavailable
        }
    }

    fn local_fingerprint(&self) -> Fingerprint {
        self.identity.fingerprint()
    }

    fn peer_fingerprint(&self) -> Option<Fingerprint> {
        self.peer_fingerprint.clone()
    }

    fn peer_verified(&self) -> bool {
        self.peer_verified
    }
}
