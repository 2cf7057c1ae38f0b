//! Binary envelope framing — what the relay stores and forwards.
//!
//! The relay is a dumb store: it sees opaque framed bytes plus the routing
//! metadata of the HTTP call. All multi-byte integers are little-endian;
//! variable fields carry a u32 length prefix.
//!
//! DM envelope:
//!   version:u8=1 | kind:u8=1 | session_hint:16B | flags:u8
//!   [prekey header, if flag bit 0]
//!   ratchet_pub:32B | pn:u32 | n:u32
//!   ciphertext: u32 len + bytes | tag:16B
//!
//! PreKey header (first message of a pairwise session):
//!   identity_pub:32B | ephemeral_pub:32B | signed_prekey_id:u32
//!   | one_time_prekey_id:u32 (0 = none)
//!
//! Group envelope:
//!   version:u8=1 | kind:u8=2 | session_id:16B | message_index:u32
//!   | ciphertext: u32 len + bytes | tag:16B | signature:64B

use efsec_crypto::megolm::GroupMessage;
use efsec_crypto::ratchet::{RatchetHeader, RatchetMessage};

use crate::error::ProtoError;

pub const WIRE_VERSION: u8 = 1;
const KIND_DM: u8 = 1;
const KIND_GROUP: u8 = 2;
const FLAG_PREKEY: u8 = 0b0000_0001;

/// Carried by the first envelope of a pairwise session so the responder
/// can mirror X3DH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyHeader {
    pub identity_pub: [u8; 32],
    pub ephemeral_pub: [u8; 32],
    pub signed_prekey_id: u32,
    /// `None` when the bundle had no one-time key (id 0 on the wire).
    pub one_time_prekey_id: Option<u32>,
}

/// A framed pairwise message.
#[derive(Debug, Clone)]
pub struct DmEnvelope {
    /// Stable per-session routing hint; no cryptographic meaning.
    pub session_hint: [u8; 16],
    pub prekey: Option<PreKeyHeader>,
    pub header: RatchetHeader,
    pub ciphertext: Vec<u8>,
    pub tag: [u8; 16],
}

/// A framed group message.
#[derive(Debug, Clone)]
pub struct GroupEnvelope {
    pub message: GroupMessage,
}

/// Any envelope the relay can carry.
#[derive(Debug, Clone)]
pub enum Envelope {
    Dm(DmEnvelope),
    Group(GroupEnvelope),
}

impl DmEnvelope {
    pub fn new(session_hint: [u8; 16], prekey: Option<PreKeyHeader>, msg: RatchetMessage) -> Self {
        Self {
            session_hint,
            prekey,
            header: msg.header,
            ciphertext: msg.ciphertext,
            tag: msg.tag,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.ciphertext.len());
        out.push(WIRE_VERSION);
        out.push(KIND_DM);
        out.extend_from_slice(&self.session_hint);
        out.push(if self.prekey.is_some() { FLAG_PREKEY } else { 0 });
        if let Some(ref pk) = self.prekey {
            out.extend_from_slice(&pk.identity_pub);
            out.extend_from_slice(&pk.ephemeral_pub);
            out.extend_from_slice(&pk.signed_prekey_id.to_le_bytes());
            out.extend_from_slice(&pk.one_time_prekey_id.unwrap_or(0).to_le_bytes());
        }
        out.extend_from_slice(&self.header.ratchet_pub);
        out.extend_from_slice(&self.header.pn.to_le_bytes());
        out.extend_from_slice(&self.header.n.to_le_bytes());
        out.extend_from_slice(&(self.ciphertext.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }
}

impl GroupEnvelope {
    pub fn encode(&self) -> Vec<u8> {
        let m = &self.message;
        let mut out = Vec::with_capacity(112 + m.ciphertext.len());
        out.push(WIRE_VERSION);
        out.push(KIND_GROUP);
        out.extend_from_slice(&m.session_id);
        out.extend_from_slice(&m.index.to_le_bytes());
        out.extend_from_slice(&(m.ciphertext.len() as u32).to_le_bytes());
        out.extend_from_slice(&m.ciphertext);
        out.extend_from_slice(&m.tag);
        out.extend_from_slice(&m.signature);
        out
    }
}

impl Envelope {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Envelope::Dm(e) => e.encode(),
            Envelope::Group(e) => e.encode(),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtoError> {
        let mut r = Reader::new(bytes);
        let version = r.u8()?;
        if version != WIRE_VERSION {
            return Err(ProtoError::UnknownVersion(version));
        }
        match r.u8()? {
            KIND_DM => {
                let session_hint = r.array::<16>()?;
                let flags = r.u8()?;
                let prekey = if flags & FLAG_PREKEY != 0 {
                    let identity_pub = r.array::<32>()?;
                    let ephemeral_pub = r.array::<32>()?;
                    let signed_prekey_id = r.u32()?;
                    let otk = r.u32()?;
                    Some(PreKeyHeader {
                        identity_pub,
                        ephemeral_pub,
                        signed_prekey_id,
                        one_time_prekey_id: (otk != 0).then_some(otk),
                    })
                } else {
                    None
                };
                let ratchet_pub = r.array::<32>()?;
                let pn = r.u32()?;
                let n = r.u32()?;
                let ciphertext = r.bytes()?;
                let tag = r.array::<16>()?;
                r.finish()?;
                Ok(Envelope::Dm(DmEnvelope {
                    session_hint,
                    prekey,
                    header: RatchetHeader { ratchet_pub, pn, n },
                    ciphertext,
                    tag,
                }))
            }
            KIND_GROUP => {
                let session_id = r.array::<16>()?;
                let index = r.u32()?;
                let ciphertext = r.bytes()?;
                let tag = r.array::<16>()?;
                let signature = r.array::<64>()?;
                r.finish()?;
                Ok(Envelope::Group(GroupEnvelope {
                    message: GroupMessage { session_id, index, ciphertext, tag, signature },
                }))
            }
            kind => Err(ProtoError::MalformedEnvelope(format!("unknown kind {kind}"))),
        }
    }
}

// ── Cursor ───────────────────────────────────────────────────────────────────

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtoError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.bytes.len())
            .ok_or_else(|| ProtoError::MalformedEnvelope("truncated".into()))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ProtoError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, ProtoError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes(b.try_into().expect("4-byte slice")))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtoError> {
        let b = self.take(N)?;
        Ok(b.try_into().expect("sized slice"))
    }

    fn bytes(&mut self) -> Result<Vec<u8>, ProtoError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn finish(&self) -> Result<(), ProtoError> {
        if self.pos != self.bytes.len() {
            return Err(ProtoError::MalformedEnvelope(format!(
                "{} trailing bytes",
                self.bytes.len() - self.pos
            )));
        }
        Ok(())
    }
}
