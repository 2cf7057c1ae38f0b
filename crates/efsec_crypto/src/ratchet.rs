//! Double Ratchet sessions.
//!
//! Reference: Signal Double Ratchet spec
//! <https://signal.org/docs/specifications/doubleratchet/>
//!
//! State separation:
//!   RK  — root key, updated on every DH ratchet step
//!   CKs — sending chain key, updated per message sent
//!   CKr — receiving chain key, updated per message received
//!   MK  — message key, derived from a CK, used once, then deleted
//!
//! The initiator seeds its sending chain immediately from DH(DHR_A, SPK_B);
//! the responder installs its signed prekey as the first ratchet keypair so
//! that step lines up, and grows a receiving chain when the first message
//! arrives.
//!
//! Out-of-order delivery is absorbed by a bounded skipped-key cache keyed
//! by (ratchet_pub, n). A single chain advance may skip at most `MAX_SKIP`
//! messages; the cache holds at most `MAX_SKIPPED_CACHE` keys per session,
//! evicting oldest-first. An evicted index later decrypts as
//! `UnrecoverableKey`; a consumed one as `DuplicateOrTooOld`.
//!
//! Every decrypt runs against a scratch copy of the state and replaces the
//! session only on success, so a failed envelope never moves the ratchet.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::aead;
use crate::error::CryptoError;
use crate::kdf;

/// Maximum messages a single chain advance may skip.
pub const MAX_SKIP: u32 = 1000;
/// Total skipped message keys retained per session.
pub const MAX_SKIPPED_CACHE: usize = 2000;
/// Prior receiving-chain ratchet keys remembered for replay classification.
const MAX_PREVIOUS_CHAINS: usize = 8;

/// Sent in clear alongside every ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetHeader {
    /// Sender's current DH ratchet public key.
    pub ratchet_pub: [u8; 32],
    /// Length of the sender's previous sending chain.
    pub pn: u32,
    /// Message number within the current sending chain.
    pub n: u32,
}

impl RatchetHeader {
    /// Deterministic encoding, prefixed to the associated data.
    pub fn encode(&self) -> [u8; 40] {
        let mut out = [0u8; 40];
        out[..32].copy_from_slice(&self.ratchet_pub);
        out[32..36].copy_from_slice(&self.pn.to_le_bytes());
        out[36..40].copy_from_slice(&self.n.to_le_bytes());
        out
    }
}

/// One ratcheted message as produced by `encrypt`.
#[derive(Debug, Clone)]
pub struct RatchetMessage {
    pub header: RatchetHeader,
    pub ciphertext: Vec<u8>,
    pub tag: [u8; 16],
}

#[derive(Clone, Serialize, Deserialize)]
struct SkippedKey {
    ratchet_pub: [u8; 32],
    n: u32,
    mk: [u8; 32],
}

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct SkippedKeyId {
    ratchet_pub: [u8; 32],
    n: u32,
}

/// Complete Double Ratchet session state. Serialized (vault-encrypted)
/// into the keystore after every state-advancing operation.
#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetSession {
    root_key: [u8; 32],

    // Sending side
    dh_secret: [u8; 32],
    dh_pub: [u8; 32],
    send_chain: Option<[u8; 32]>,
    send_n: u32,
    prev_send_n: u32,

    // Receiving side
    peer_ratchet_pub: Option<[u8; 32]>,
    recv_chain: Option<[u8; 32]>,
    recv_n: u32,
    /// Ratchet keys of receiving chains already ratcheted past.
    previous_peer_pubs: Vec<[u8; 32]>,

    // Out-of-order bookkeeping
    skipped: Vec<SkippedKey>,
    evicted: Vec<SkippedKeyId>,

    /// IK_initiator || IK_responder, fixed per session; bound into the AAD
    /// of every message.
    #[serde(with = "crate::serde_b64::array64")]
    associated_data: [u8; 64],
}

impl Drop for RatchetSession {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.dh_secret.zeroize();
        if let Some(ref mut ck) = self.send_chain {
            ck.zeroize();
        }
        if let Some(ref mut ck) = self.recv_chain {
            ck.zeroize();
        }
        for entry in &mut self.skipped {
            entry.mk.zeroize();
        }
    }
}

impl RatchetSession {
    /// Initiator construction, straight after X3DH.
    ///
    /// Generates the first ratchet keypair and immediately performs the
    /// sending-side DH step against the responder's signed prekey.
    pub fn init_initiator(
        shared_key: [u8; 32],
        peer_signed_prekey_pub: &[u8; 32],
        associated_data: [u8; 64],
    ) -> Result<Self, CryptoError> {
        let dh = StaticSecret::random_from_rng(OsRng);
        let dh_pub = X25519Public::from(&dh);
        let dh_out = dh.diffie_hellman(&X25519Public::from(*peer_signed_prekey_pub));
        let (root_key, send_ck) = kdf::root_step(&shared_key, dh_out.as_bytes())?;

        Ok(Self {
            root_key,
            dh_secret: dh.to_bytes(),
            dh_pub: *dh_pub.as_bytes(),
            send_chain: Some(send_ck),
            send_n: 0,
            prev_send_n: 0,
            peer_ratchet_pub: Some(*peer_signed_prekey_pub),
            recv_chain: None,
            recv_n: 0,
            previous_peer_pubs: Vec::new(),
            skipped: Vec::new(),
            evicted: Vec::new(),
            associated_data,
        })
    }

    /// Responder construction, after mirroring X3DH from a prekey header.
    ///
    /// The signed prekey becomes the current ratchet keypair so the
    /// initiator's first DH step matches. Chains grow on first receive.
    pub fn init_responder(
        shared_key: [u8; 32],
        my_signed_prekey_secret: &StaticSecret,
        associated_data: [u8; 64],
    ) -> Self {
        let dh_pub = X25519Public::from(my_signed_prekey_secret);
        Self {
            root_key: shared_key,
            dh_secret: my_signed_prekey_secret.to_bytes(),
            dh_pub: *dh_pub.as_bytes(),
            send_chain: None,
            send_n: 0,
            prev_send_n: 0,
            peer_ratchet_pub: None,
            recv_chain: None,
            recv_n: 0,
            previous_peer_pubs: Vec::new(),
            skipped: Vec::new(),
            evicted: Vec::new(),
            associated_data,
        }
    }

    pub fn our_ratchet_pub(&self) -> [u8; 32] {
        self.dh_pub
    }

    /// True once any message from the peer has moved the receiving side —
    /// the point where an initiator stops attaching the prekey prefix.
    pub fn has_received(&self) -> bool {
        self.recv_chain.is_some()
    }

    pub fn send_index(&self) -> u32 {
        self.send_n
    }

    pub fn skipped_key_count(&self) -> usize {
        self.skipped.len()
    }

    // ── Encrypt ──────────────────────────────────────────────────────────

    /// Step the sending chain and encrypt one message.
    ///
    /// The caller must persist the session before releasing the ciphertext;
    /// the prior chain key is overwritten before this function returns.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<RatchetMessage, CryptoError> {
        let mut ck = self
            .send_chain
            .ok_or_else(|| CryptoError::KeyDerivation("sending chain not initialised".into()))?;
        let (mut mk, next_ck) = kdf::chain_step(&ck);

        let header = RatchetHeader {
            ratchet_pub: self.dh_pub,
            pn: self.prev_send_n,
            n: self.send_n,
        };

        let material = kdf::message_key_material(&mk)?;
        let aad = self.aad_for(&header);
        let (ciphertext, tag) = aead::encrypt_detached(&material.key, &material.nonce, &aad, plaintext)?;

        self.send_chain = Some(next_ck);
        self.send_n += 1;
        ck.zeroize();
        mk.zeroize();

        Ok(RatchetMessage { header, ciphertext, tag })
    }

    // ── Decrypt ──────────────────────────────────────────────────────────

    /// Decrypt one message, advancing the ratchet as needed.
    ///
    /// Runs on a scratch copy; `self` is replaced only when the AEAD opens.
    pub fn decrypt(
        &mut self,
        header: &RatchetHeader,
        ciphertext: &[u8],
        tag: &[u8; 16],
    ) -> Result<Vec<u8>, CryptoError> {
        let mut work = self.clone();
        let plaintext = work.decrypt_inner(header, ciphertext, tag)?;
        *self = work;
        Ok(plaintext)
    }

    fn decrypt_inner(
        &mut self,
        header: &RatchetHeader,
        ciphertext: &[u8],
        tag: &[u8; 16],
    ) -> Result<Vec<u8>, CryptoError> {
        // Skipped key first: covers out-of-order delivery on any chain.
        if let Some(idx) = self
            .skipped
            .iter()
            .position(|k| k.ratchet_pub == header.ratchet_pub && k.n == header.n)
        {
            let mut entry = self.skipped.remove(idx);
            let result = self.open(&entry.mk, header, ciphertext, tag);
            entry.mk.zeroize();
            return result;
        }

        if self
            .evicted
            .iter()
            .any(|k| k.ratchet_pub == header.ratchet_pub && k.n == header.n)
        {
            return Err(CryptoError::UnrecoverableKey);
        }

        let is_current = self.peer_ratchet_pub == Some(header.ratchet_pub);
        if !is_current {
            if self.previous_peer_pubs.contains(&header.ratchet_pub) {
                // Old chain, key already consumed.
                return Err(CryptoError::DuplicateOrTooOld);
            }
            self.dh_ratchet(header)?;
        } else if header.n < self.recv_n {
            return Err(CryptoError::DuplicateOrTooOld);
        }

        self.skip_to(header.n)?;

        let mut ck = self
            .recv_chain
            .ok_or_else(|| CryptoError::KeyDerivation("receiving chain not initialised".into()))?;
        let (mut mk, next_ck) = kdf::chain_step(&ck);
        self.recv_chain = Some(next_ck);
        self.recv_n += 1;
        ck.zeroize();

        let result = self.open(&mk, header, ciphertext, tag);
        mk.zeroize();
        result
    }

    fn open(
        &self,
        mk: &[u8; 32],
        header: &RatchetHeader,
        ciphertext: &[u8],
        tag: &[u8; 16],
    ) -> Result<Vec<u8>, CryptoError> {
        let material = kdf::message_key_material(mk)?;
        let aad = self.aad_for(header);
        let plaintext = aead::decrypt_detached(&material.key, &material.nonce, &aad, ciphertext, tag)?;
        Ok(plaintext.to_vec())
    }

    fn aad_for(&self, header: &RatchetHeader) -> Vec<u8> {
        let mut aad = Vec::with_capacity(40 + 64);
        aad.extend_from_slice(&header.encode());
        aad.extend_from_slice(&self.associated_data);
        aad
    }

    /// A new peer ratchet key arrived: close out the old receiving chain
    /// (caching up to `pn`), then perform the receive- and send-side root
    /// steps with a fresh keypair.
    fn dh_ratchet(&mut self, header: &RatchetHeader) -> Result<(), CryptoError> {
        if let Some(prev_pub) = self.peer_ratchet_pub {
            if self.recv_chain.is_some() {
                self.skip_to(header.pn)?;
            }
            self.remember_previous_chain(prev_pub);
        }

        self.peer_ratchet_pub = Some(header.ratchet_pub);
        let peer_pub = X25519Public::from(header.ratchet_pub);

        let dh_recv = StaticSecret::from(self.dh_secret).diffie_hellman(&peer_pub);
        let (rk, recv_ck) = kdf::root_step(&self.root_key, dh_recv.as_bytes())?;
        self.root_key = rk;
        self.recv_chain = Some(recv_ck);
        self.recv_n = 0;

        self.prev_send_n = self.send_n;
        self.send_n = 0;
        let new_dh = StaticSecret::random_from_rng(OsRng);
        self.dh_pub = *X25519Public::from(&new_dh).as_bytes();
        let dh_send = new_dh.diffie_hellman(&peer_pub);
        let (rk, send_ck) = kdf::root_step(&self.root_key, dh_send.as_bytes())?;
        self.root_key = rk;
        self.send_chain = Some(send_ck);
        self.dh_secret = new_dh.to_bytes();

        Ok(())
    }

    fn remember_previous_chain(&mut self, prev_pub: [u8; 32]) {
        self.previous_peer_pubs.push(prev_pub);
        if self.previous_peer_pubs.len() > MAX_PREVIOUS_CHAINS {
            self.previous_peer_pubs.remove(0);
        }
    }

    /// Advance the receiving chain to `until`, caching the message keys
    /// passed over.
    fn skip_to(&mut self, until: u32) -> Result<(), CryptoError> {
        if until <= self.recv_n {
            return Ok(());
        }
        let Some(mut ck) = self.recv_chain else {
            return Err(CryptoError::KeyDerivation("receiving chain not initialised".into()));
        };

        let skipped = until - self.recv_n;
        if skipped > MAX_SKIP {
            return Err(CryptoError::SkipOverflow { skipped, max: MAX_SKIP });
        }

        let chain_pub = self
            .peer_ratchet_pub
            .ok_or_else(|| CryptoError::KeyDerivation("no peer ratchet key".into()))?;

        while self.recv_n < until {
            let (mk, next_ck) = kdf::chain_step(&ck);
            ck = next_ck;
            self.skipped.push(SkippedKey { ratchet_pub: chain_pub, n: self.recv_n, mk });
            self.recv_n += 1;
        }
        self.recv_chain = Some(ck);

        while self.skipped.len() > MAX_SKIPPED_CACHE {
            let mut evicted = self.skipped.remove(0);
            self.evicted.push(SkippedKeyId {
                ratchet_pub: evicted.ratchet_pub,
                n: evicted.n,
            });
            evicted.mk.zeroize();
            if self.evicted.len() > MAX_SKIPPED_CACHE {
                self.evicted.remove(0);
            }
        }

        Ok(())
    }
}
