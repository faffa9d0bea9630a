//! Socialist Millionaires' Protocol over Ristretto255.
//!
//! Both sides learn whether they hold the same secret without revealing it:
//!
//! ```text
//! SMP1  A -> B  g2a, g3a
//! SMP2  B -> A  g2b, g3b, Pb, Qb          g2, g3 agreed; Pb = g3^r, Qb = g^r g2^y
//! SMP3  A -> B  Pa, Qa, Ra                Ra = (Qa/Qb)^a3
//! SMP4  B -> A  Rb                        Rb = (Qa/Qb)^b3
//! ```
//!
//! Each side then checks `(Qa/Qb)^(a3 b3) == Pa/Pb`, which holds exactly when `x == y`.
//! The exchange runs inside the authenticated data channel, so it carries no
//! zero-knowledge proofs of its own.

use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::wire::{self, Tlv, TLV_SMP1, TLV_SMP2, TLV_SMP3, TLV_SMP4, TLV_SMP_ABORT};
use super::{OtrError, SmpStatus};

const SECRET_DOMAIN: &[u8] = b"sipchat-otr-smp";

/// Identifies the run so both sides hash the secret identically.
pub(super) struct SmpBinding<'a> {
    pub initiator: &'a [u8; 32],
    pub responder: &'a [u8; 32],
    pub ssid: &'a [u8; 8],
}

enum Step {
    Idle,
    /// Initiator, waiting for SMP2.
    ExpectTwo { x: Scalar, a2: Scalar, a3: Scalar },
    /// Responder, SMP1 received, waiting for the local user's secret.
    AwaitingSecret { g2a: RistrettoPoint, g3a: RistrettoPoint },
    /// Responder, waiting for SMP3.
    ExpectThree {
        b3: Scalar,
        pb: RistrettoPoint,
        qb: RistrettoPoint,
    },
    /// Initiator, waiting for SMP4.
    ExpectFour {
        a3: Scalar,
        pa_pb: RistrettoPoint,
        qa_qb: RistrettoPoint,
    },
}

pub(super) struct Smp {
    step: Step,
    status: SmpStatus,
}

/// Result of feeding an SMP TLV into the state machine.
pub(super) struct SmpOutcome {
    pub reply: Option<Tlv>,
    pub verified: Option<bool>,
}

impl SmpOutcome {
    fn reply(tlv: Tlv) -> Self {
        Self {
            reply: Some(tlv),
            verified: None,
        }
    }

    fn none() -> Self {
        Self {
            reply: None,
            verified: None,
        }
    }
}

impl Smp {
    pub fn new() -> Self {
        Self {
            step: Step::Idle,
            status: SmpStatus::Unavailable,
        }
    }

    pub fn status(&self) -> SmpStatus {
        self.status
    }

    pub fn awaiting_secret(&self) -> bool {
        matches!(self.step, Step::AwaitingSecret { .. })
    }

    pub fn reset(&mut self) {
        self.step = Step::Idle;
        self.status = SmpStatus::Unavailable;
    }

    /// Begin a run as initiator; returns the SMP1 TLV.
    pub fn start(&mut self, secret: &[u8], binding: &SmpBinding<'_>) -> Tlv {
        let x = secret_scalar(secret, binding);
        let a2 = random_scalar();
        let a3 = random_scalar();
        let g2a = RISTRETTO_BASEPOINT_POINT * a2;
        let g3a = RISTRETTO_BASEPOINT_POINT * a3;
        self.step = Step::ExpectTwo { x, a2, a3 };
        self.status = SmpStatus::InProgress;
        Tlv::new(TLV_SMP1, encode(&[g2a, g3a]))
    }

    /// Answer a pending SMP1 with the local secret; returns the SMP2 TLV.
    pub fn respond(&mut self, secret: &[u8], binding: &SmpBinding<'_>) -> Result<Tlv, OtrError> {
        let Step::AwaitingSecret { g2a, g3a } = self.step else {
            return Err(OtrError::Protocol("no SMP request to answer".to_string()));
        };
        let y = secret_scalar(secret, binding);
        let b2 = random_scalar();
        let b3 = random_scalar();
        let r = random_scalar();
        let g2 = g2a * b2;
        let g3 = g3a * b3;
        let pb = g3 * r;
        let qb = RISTRETTO_BASEPOINT_POINT * r + g2 * y;
        self.step = Step::ExpectThree { b3, pb, qb };
        Ok(Tlv::new(
            TLV_SMP2,
            encode(&[
                RISTRETTO_BASEPOINT_POINT * b2,
                RISTRETTO_BASEPOINT_POINT * b3,
                pb,
                qb,
            ]),
        ))
    }

    /// Abort the current run. Returns the TLV to send when a run was in progress.
    pub fn abort(&mut self) -> Option<Tlv> {
        let active = !matches!(self.step, Step::Idle);
        self.step = Step::Idle;
        if active {
            self.status = SmpStatus::Failed;
            Some(Tlv::new(TLV_SMP_ABORT, Vec::new()))
        } else {
            None
        }
    }

    /// Feed one SMP TLV from the peer.
    pub fn handle(&mut self, tlv: &Tlv) -> SmpOutcome {
        match (tlv.kind, std::mem::replace(&mut self.step, Step::Idle)) {
            (TLV_SMP_ABORT, _) => {
                self.status = SmpStatus::Failed;
                SmpOutcome::none()
            }
            (TLV_SMP1, _) => match decode::<2>(&tlv.value) {
                Some([g2a, g3a]) => {
                    // A new request replaces whatever run was in flight.
                    self.step = Step::AwaitingSecret { g2a, g3a };
                    self.status = SmpStatus::InProgress;
                    SmpOutcome::none()
                }
                None => self.fail(),
            },
            (TLV_SMP2, Step::ExpectTwo { x, a2, a3 }) => {
                let Some([g2b, g3b, pb, qb]) = decode::<4>(&tlv.value) else {
                    return self.fail();
                };
                let g2 = g2b * a2;
                let g3 = g3b * a3;
                let s = random_scalar();
                let pa = g3 * s;
                let qa = RISTRETTO_BASEPOINT_POINT * s + g2 * x;
                let qa_qb = qa - qb;
                let ra = qa_qb * a3;
                self.step = Step::ExpectFour {
                    a3,
                    pa_pb: pa - pb,
                    qa_qb,
                };
                SmpOutcome::reply(Tlv::new(TLV_SMP3, encode(&[pa, qa, ra])))
            }
            (TLV_SMP3, Step::ExpectThree { b3, pb, qb }) => {
                let Some([pa, qa, ra]) = decode::<3>(&tlv.value) else {
                    return self.fail();
                };
                let rb = (qa - qb) * b3;
                let verified = ra * b3 == pa - pb;
                self.finish(verified);
                SmpOutcome {
                    reply: Some(Tlv::new(TLV_SMP4, encode(&[rb]))),
                    verified: Some(verified),
                }
            }
            (TLV_SMP4, Step::ExpectFour { a3, pa_pb, qa_qb }) => {
                let Some([rb]) = decode::<1>(&tlv.value) else {
                    return self.fail();
                };
                let verified = rb * a3 == pa_pb && qa_qb != RistrettoPoint::identity();
                self.finish(verified);
                SmpOutcome {
                    reply: None,
                    verified: Some(verified),
                }
            }
            _ => self.fail(),
        }
    }

    fn finish(&mut self, verified: bool) {
        self.step = Step::Idle;
        self.status = if verified {
            SmpStatus::Succeeded
        } else {
            SmpStatus::Failed
        };
    }

    fn fail(&mut self) -> SmpOutcome {
        self.step = Step::Idle;
        self.status = SmpStatus::Failed;
        SmpOutcome {
            reply: Some(Tlv::new(TLV_SMP_ABORT, Vec::new())),
            verified: Some(false),
        }
    }
}

fn secret_scalar(secret: &[u8], binding: &SmpBinding<'_>) -> Scalar {
    let mut hasher = Sha256::new();
    hasher.update(SECRET_DOMAIN);
    hasher.update(binding.initiator);
    hasher.update(binding.responder);
    hasher.update(binding.ssid);
    hasher.update(secret);
    Scalar::from_bytes_mod_order(hasher.finalize().into())
}

fn random_scalar() -> Scalar {
    let mut wide = [0u8; 64];
    OsRng.fill_bytes(&mut wide);
    Scalar::from_bytes_mod_order_wide(&wide)
}

fn encode(points: &[RistrettoPoint]) -> Vec<u8> {
    let compressed: Vec<[u8; 32]> = points.iter().map(|p| p.compress().to_bytes()).collect();
    wire::encode_points(&compressed)
}

/// Decode `N` points, rejecting invalid encodings and the identity.
fn decode<const N: usize>(value: &[u8]) -> Option<[RistrettoPoint; N]> {
    let raw = wire::decode_points::<N>(value)?;
    let mut out = [RistrettoPoint::identity(); N];
    for (slot, bytes) in out.iter_mut().zip(raw) {
        let point = CompressedRistretto(bytes).decompress()?;
        if point == RistrettoPoint::identity() {
            return None;
        }
        *slot = point;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: [u8; 32] = [1u8; 32];
    const BOB: [u8; 32] = [2u8; 32];
    const SSID: [u8; 8] = [9u8; 8];

    fn binding() -> SmpBinding<'static> {
        SmpBinding {
            initiator: &ALICE,
            responder: &BOB,
            ssid: &SSID,
        }
    }

    fn run(alice_secret: &[u8], bob_secret: &[u8]) -> (Smp, Smp) {
        let mut alice = Smp::new();
        let mut bob = Smp::new();

        let smp1 = alice.start(alice_secret, &binding());
        assert!(bob.handle(&smp1).reply.is_none());
        assert!(bob.awaiting_secret());
        let smp2 = bob.respond(bob_secret, &binding()).unwrap();
        let smp3 = alice.handle(&smp2).reply.unwrap();
        let smp4 = bob.handle(&smp3).reply.unwrap();
        assert!(alice.handle(&smp4).reply.is_none());
        (alice, bob)
    }

    #[test]
    fn matching_secrets_succeed() {
        let (alice, bob) = run(b"blue", b"blue");
        assert_eq!(alice.status(), SmpStatus::Succeeded);
        assert_eq!(bob.status(), SmpStatus::Succeeded);
    }

    #[test]
    fn different_secrets_fail() {
        let (alice, bob) = run(b"blue", b"green");
        assert_eq!(alice.status(), SmpStatus::Failed);
        assert_eq!(bob.status(), SmpStatus::Failed);
    }

    #[test]
    fn out_of_order_step_aborts() {
        let mut bob = Smp::new();
        let outcome = bob.handle(&Tlv::new(TLV_SMP3, vec![0u8; 96]));
        assert_eq!(outcome.reply.map(|t| t.kind), Some(TLV_SMP_ABORT));
        assert_eq!(bob.status(), SmpStatus::Failed);
    }

    #[test]
    fn respond_without_request_is_an_error() {
        let mut bob = Smp::new();
        assert!(bob.respond(b"x", &binding()).is_err());
    }

    #[test]
    fn abort_only_reports_active_runs() {
        let mut alice = Smp::new();
        assert!(alice.abort().is_none());
        alice.start(b"s", &binding());
        assert_eq!(alice.abort().map(|t| t.kind), Some(TLV_SMP_ABORT));
        assert_eq!(alice.status(), SmpStatus::Failed);
    }
}
