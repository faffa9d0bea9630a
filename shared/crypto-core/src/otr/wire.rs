//! Encoding of OTR protocol messages and the TLVs carried inside data messages.
//!
//! Every frame starts with `[version][type]`. Data frames then carry
//! `[flags u8][sender keyid u32][recipient keyid u32][next dh 32][counter u64]`, which is
//! also the AEAD associated data, followed by a length-prefixed ciphertext.

use base64::{engine::general_purpose::STANDARD, Engine};

use super::{ERROR_PREFIX, MESSAGE_PREFIX};

pub(super) const PROTOCOL_VERSION: u8 = 3;

const TYPE_DH_KEY: u8 = 0x02;
const TYPE_DATA: u8 = 0x03;
const TYPE_REVEAL_SIGNATURE: u8 = 0x0a;
const TYPE_SIGNATURE: u8 = 0x12;

pub(super) const DATA_HEADER_LEN: usize = 2 + 1 + 4 + 4 + 32 + 8;

pub(super) const TLV_PADDING: u16 = 0;
pub(super) const TLV_DISCONNECTED: u16 = 1;
pub(super) const TLV_SMP1: u16 = 2;
pub(super) const TLV_SMP2: u16 = 3;
pub(super) const TLV_SMP3: u16 = 4;
pub(super) const TLV_SMP4: u16 = 5;
pub(super) const TLV_SMP_ABORT: u16 = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct DataMessage {
    pub flags: u8,
    pub sender_keyid: u32,
    pub recipient_keyid: u32,
    pub next_dh: [u8; 32],
    pub counter: u64,
    pub ciphertext: Vec<u8>,
}

impl DataMessage {
    pub fn header(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(DATA_HEADER_LEN);
        out.push(PROTOCOL_VERSION);
        out.push(TYPE_DATA);
        out.push(self.flags);
        out.extend_from_slice(&self.sender_keyid.to_be_bytes());
        out.extend_from_slice(&self.recipient_keyid.to_be_bytes());
        out.extend_from_slice(&self.next_dh);
        out.extend_from_slice(&self.counter.to_be_bytes());
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Frame {
    DhKey { public: [u8; 32] },
    RevealSignature { public: [u8; 32], sealed: Vec<u8> },
    Signature { sealed: Vec<u8> },
    Data(DataMessage),
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::DhKey { public } => {
                let mut out = vec![PROTOCOL_VERSION, TYPE_DH_KEY];
                out.extend_from_slice(public);
                out
            }
            Frame::RevealSignature { public, sealed } => {
                let mut out = vec![PROTOCOL_VERSION, TYPE_REVEAL_SIGNATURE];
                out.extend_from_slice(public);
                put_bytes(&mut out, sealed);
                out
            }
            Frame::Signature { sealed } => {
                let mut out = vec![PROTOCOL_VERSION, TYPE_SIGNATURE];
                put_bytes(&mut out, sealed);
                out
            }
            Frame::Data(data) => {
                let mut out = data.header();
                put_bytes(&mut out, &data.ciphertext);
                out
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut reader = Reader::new(bytes);
        if reader.u8()? != PROTOCOL_VERSION {
            return None;
        }
        let frame = match reader.u8()? {
            TYPE_DH_KEY => Frame::DhKey {
                public: reader.array()?,
            },
            TYPE_REVEAL_SIGNATURE => Frame::RevealSignature {
                public: reader.array()?,
                sealed: reader.bytes()?,
            },
            TYPE_SIGNATURE => Frame::Signature {
                sealed: reader.bytes()?,
            },
            TYPE_DATA => Frame::Data(DataMessage {
                flags: reader.u8()?,
                sender_keyid: reader.u32()?,
                recipient_keyid: reader.u32()?,
                next_dh: reader.array()?,
                counter: reader.u64()?,
                ciphertext: reader.bytes()?,
            }),
            _ => return None,
        };
        reader.finished().then_some(frame)
    }

    /// `?OTR:<base64>.`
    pub fn to_message(&self) -> String {
        format!("{}{}.", MESSAGE_PREFIX, STANDARD.encode(self.encode()))
    }
}

/// Classification of an inbound text body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Incoming {
    Plain,
    Query,
    Error(String),
    Frame(Frame),
    /// Starts like an OTR message but could not be decoded.
    Unreadable,
}

pub(super) fn classify(text: &str) -> Incoming {
    let text = text.trim();
    if let Some(rest) = text.strip_prefix(ERROR_PREFIX) {
        return Incoming::Error(rest.trim().to_string());
    }
    if let Some(rest) = text.strip_prefix(MESSAGE_PREFIX) {
        let encoded = rest.strip_suffix('.').unwrap_or(rest);
        return STANDARD
            .decode(encoded)
            .ok()
            .and_then(|bytes| Frame::decode(&bytes))
            .map_or(Incoming::Unreadable, Incoming::Frame);
    }
    if let Some(rest) = text.strip_prefix("?OTRv") {
        // `?OTRv23?` advertises every listed version.
        return match rest.split_once('?') {
            Some((versions, _)) if versions.contains('3') => Incoming::Query,
            _ => Incoming::Unreadable,
        };
    }
    if text.starts_with("?OTR") {
        return Incoming::Unreadable;
    }
    Incoming::Plain
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Tlv {
    pub kind: u16,
    pub value: Vec<u8>,
}

impl Tlv {
    pub fn new(kind: u16, value: Vec<u8>) -> Self {
        Self { kind, value }
    }
}

/// `len(body) || body || 0x00 || TLVs`. The length prefix lets bodies carry NUL bytes.
pub(super) fn encode_plaintext(body: &[u8], tlvs: &[Tlv]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 5);
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out.push(0);
    for tlv in tlvs {
        out.extend_from_slice(&tlv.kind.to_be_bytes());
        out.extend_from_slice(&(tlv.value.len() as u16).to_be_bytes());
        out.extend_from_slice(&tlv.value);
    }
    out
}

pub(super) fn decode_plaintext(plaintext: &[u8]) -> Option<(Vec<u8>, Vec<Tlv>)> {
    let mut reader = Reader::new(plaintext);
    let body = reader.bytes()?;
    if reader.u8()? != 0 {
        return None;
    }
    let mut tlvs = Vec::new();
    while !reader.finished() {
        let kind = reader.u16()?;
        let len = reader.u16()? as usize;
        let value = reader.take(len)?.to_vec();
        if kind != TLV_PADDING {
            tlvs.push(Tlv::new(kind, value));
        }
    }
    Some((body, tlvs))
}

/// A sequence of 32-byte values, as used by the SMP TLVs.
pub(super) fn encode_points(points: &[[u8; 32]]) -> Vec<u8> {
    points.iter().flatten().copied().collect()
}

pub(super) fn decode_points<const N: usize>(value: &[u8]) -> Option<[[u8; 32]; N]> {
    if value.len() != N * 32 {
        return None;
    }
    let mut out = [[0u8; 32]; N];
    for (slot, chunk) in out.iter_mut().zip(value.chunks_exact(32)) {
        slot.copy_from_slice(chunk);
    }
    Some(out)
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.buf.len() < len {
            return None;
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Some(head)
    }

    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.take(N)?.try_into().ok()
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.array().map(u16::from_be_bytes)
    }

    fn u32(&mut self) -> Option<u32> {
        self.array().map(u32::from_be_bytes)
    }

    fn u64(&mut self) -> Option<u64> {
        self.array().map(u64::from_be_bytes)
    }

    fn bytes(&mut self) -> Option<Vec<u8>> {
        let len = self.u32()? as usize;
        self.take(len).map(<[u8]>::to_vec)
    }

    fn finished(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_survives_the_wire() {
        let frame = Frame::Data(DataMessage {
            flags: 0,
            sender_keyid: 7,
            recipient_keyid: 9,
            next_dh: [4u8; 32],
            counter: 42,
            ciphertext: b"sealed".to_vec(),
        });
        let message = frame.to_message();
        assert!(message.starts_with("?OTR:"));
        assert!(message.ends_with('.'));
        assert_eq!(classify(&message), Incoming::Frame(frame));
    }

    #[test]
    fn data_header_is_fixed_size() {
        let data = DataMessage {
            flags: 0,
            sender_keyid: 1,
            recipient_keyid: 1,
            next_dh: [0u8; 32],
            counter: 1,
            ciphertext: Vec::new(),
        };
        assert_eq!(data.header().len(), DATA_HEADER_LEN);
    }

    #[test]
    fn classifies_queries_errors_and_plain_text() {
        assert_eq!(classify("?OTRv3?"), Incoming::Query);
        assert_eq!(classify("?OTRv23? Bob wants to talk"), Incoming::Query);
        assert_eq!(classify("?OTRv2?"), Incoming::Unreadable);
        assert_eq!(classify("?OTR:!!!."), Incoming::Unreadable);
        assert_eq!(
            classify("?OTR Error: bad mac"),
            Incoming::Error("bad mac".to_string())
        );
        assert_eq!(classify("hello"), Incoming::Plain);
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = Frame::DhKey { public: [1u8; 32] }.encode();
        bytes.push(0);
        assert_eq!(Frame::decode(&bytes), None);
    }

    #[test]
    fn tlvs_follow_the_body() {
        let tlvs = vec![
            Tlv::new(TLV_SMP1, vec![1, 2, 3]),
            Tlv::new(TLV_DISCONNECTED, Vec::new()),
        ];
        let plaintext = encode_plaintext(b"hi", &tlvs);
        assert_eq!(decode_plaintext(&plaintext), Some((b"hi".to_vec(), tlvs)));
        assert_eq!(
            decode_plaintext(&encode_plaintext(b"plain", &[])),
            Some((b"plain".to_vec(), Vec::new()))
        );
        assert_eq!(decode_plaintext(&[0, 0, 0, 1, b'x', 0, 0, 1, 0]), None);
        assert_eq!(decode_plaintext(&[0, 0, 0, 1, b'x', 7]), None);
    }

    #[test]
    fn bodies_may_contain_nul() {
        let tlvs = vec![Tlv::new(TLV_DISCONNECTED, Vec::new())];
        assert_eq!(
            decode_plaintext(&encode_plaintext(b"a\0b", &[])),
            Some((b"a\0b".to_vec(), Vec::new()))
        );
        assert_eq!(
            decode_plaintext(&encode_plaintext(b"\0\0", &tlvs)),
            Some((b"\0\0".to_vec(), tlvs))
        );
    }

    #[test]
    fn padding_tlvs_are_dropped() {
        let plaintext = encode_plaintext(b"", &[Tlv::new(TLV_PADDING, vec![0; 8])]);
        assert_eq!(decode_plaintext(&plaintext), Some((Vec::new(), Vec::new())));
    }
}
