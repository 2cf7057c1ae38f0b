//! Megolm-style group sessions.
//!
//! One outbound session per (sender, group): a one-way HMAC chain plus an
//! Ed25519 signing keypair. Every message carries its chain index and a
//! signature, so any member holding the public half can authenticate the
//! sender without pairwise state.
//!
//!   session_id  = SHA-256(chain_key_0 || sig_pub)[..16]
//!   key material for index i = HKDF(chain_key_i, "", "efsec-megolm-mk", 80)
//!   chain_key_{i+1} = HMAC(chain_key_i, 0x01)
//!   signature over SHA-256(ciphertext || tag || session_id || index)
//!
//! The chain is shared with members at its *current* index (inside a
//! pairwise-encrypted envelope), so a late joiner cannot read backwards.
//! Inbound sessions only ever advance; passed-over message keys go into a
//! bounded cache so moderate reordering and duplicate envelopes decrypt,
//! while an evicted index fails with `UnrecoverableKey`.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::aead;
use crate::error::CryptoError;
use crate::identity::IdentityKeyPair;
use crate::kdf;

/// Inbound message-key cache bound.
pub const MAX_CACHED_KEYS: usize = 100;

/// One group message as it rides inside a group envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMessage {
    pub session_id: [u8; 16],
    pub index: u32,
    pub ciphertext: Vec<u8>,
    pub tag: [u8; 16],
    #[serde(with = "crate::serde_b64::array64")]
    pub signature: [u8; 64],
}

/// Chain state shared with a member over a pairwise session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSessionExport {
    pub session_id: [u8; 16],
    pub message_index: u32,
    pub chain_key: [u8; 32],
    pub sig_pub: [u8; 32],
}

fn signing_digest(ciphertext: &[u8], tag: &[u8; 16], session_id: &[u8; 16], index: u32) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(ciphertext);
    h.update(tag);
    h.update(session_id);
    h.update(index.to_le_bytes());
    h.finalize().into()
}

fn message_aad(session_id: &[u8; 16], index: u32) -> [u8; 20] {
    let mut aad = [0u8; 20];
    aad[..16].copy_from_slice(session_id);
    aad[16..].copy_from_slice(&index.to_le_bytes());
    aad
}

// ── Outbound ─────────────────────────────────────────────────────────────────

/// Sender-side group session.
#[derive(Clone, Serialize, Deserialize)]
pub struct OutboundGroupSession {
    session_id: [u8; 16],
    chain_key: [u8; 32],
    message_index: u32,
    signing_secret: [u8; 32],
    sig_pub: [u8; 32],
}

impl Drop for OutboundGroupSession {
    fn drop(&mut self) {
        self.chain_key.zeroize();
        self.signing_secret.zeroize();
    }
}

impl OutboundGroupSession {
    pub fn new() -> Self {
        let mut chain_key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut chain_key);
        let signing = IdentityKeyPair::generate();
        let sig_pub = signing.public.0;

        let mut h = Sha256::new();
        h.update(chain_key);
        h.update(sig_pub);
        let digest: [u8; 32] = h.finalize().into();
        let mut session_id = [0u8; 16];
        session_id.copy_from_slice(&digest[..16]);

        Self {
            session_id,
            chain_key,
            message_index: 0,
            signing_secret: *signing.secret_bytes(),
            sig_pub,
        }
    }

    pub fn session_id(&self) -> [u8; 16] {
        self.session_id
    }

    pub fn message_index(&self) -> u32 {
        self.message_index
    }

    /// Encrypt, sign and ratchet forward. The caller persists the session
    /// before the message leaves the device.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<GroupMessage, CryptoError> {
        let material = kdf::megolm_key_material(&self.chain_key)?;
        let aad = message_aad(&self.session_id, self.message_index);
        let (ciphertext, tag) = aead::encrypt_detached(&material.key, &material.nonce, &aad, plaintext)?;

        let signing = IdentityKeyPair::from_bytes(&self.signing_secret)?;
        let signature = signing.sign(&signing_digest(&ciphertext, &tag, &self.session_id, self.message_index));

        let message = GroupMessage {
            session_id: self.session_id,
            index: self.message_index,
            ciphertext,
            tag,
            signature,
        };

        let mut old = self.chain_key;
        self.chain_key = kdf::megolm_advance(&self.chain_key);
        old.zeroize();
        self.message_index += 1;

        Ok(message)
    }

    /// Share the chain at its current index. Messages older than the
    /// export stay unreadable to the recipient.
    pub fn export(&self) -> GroupSessionExport {
        GroupSessionExport {
            session_id: self.session_id,
            message_index: self.message_index,
            chain_key: self.chain_key,
            sig_pub: self.sig_pub,
        }
    }
}

impl Default for OutboundGroupSession {
    fn default() -> Self {
        Self::new()
    }
}

// ── Inbound ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CachedKey {
    index: u32,
    key: [u8; 32],
    nonce: [u8; 12],
}

/// Receiver-side group session, keyed by (sender, session_id) in the
/// keystore.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InboundGroupSession {
    session_id: [u8; 16],
    sig_pub: [u8; 32],
    first_known_index: u32,
    chain_key: [u8; 32],
    current_index: u32,
    cache: Vec<CachedKey>,
}

impl Drop for InboundGroupSession {
    fn drop(&mut self) {
        self.chain_key.zeroize();
        for entry in &mut self.cache {
            entry.key.zeroize();
        }
    }
}

impl InboundGroupSession {
    pub fn from_export(export: &GroupSessionExport) -> Self {
        Self {
            session_id: export.session_id,
            sig_pub: export.sig_pub,
            first_known_index: export.message_index,
            chain_key: export.chain_key,
            current_index: export.message_index,
            cache: Vec::new(),
        }
    }

    pub fn session_id(&self) -> [u8; 16] {
        self.session_id
    }

    pub fn first_known_index(&self) -> u32 {
        self.first_known_index
    }

    /// Decrypt one group message. Signature is checked before any chain
    /// work; a failed message never advances the session.
    pub fn decrypt(&mut self, message: &GroupMessage) -> Result<Vec<u8>, CryptoError> {
        let mut work = self.clone();
        let plaintext = work.decrypt_inner(message)?;
        *self = work;
        Ok(plaintext)
    }

    fn decrypt_inner(&mut self, message: &GroupMessage) -> Result<Vec<u8>, CryptoError> {
        if message.session_id != self.session_id {
            return Err(CryptoError::InvalidKey("group message for another session".into()));
        }

        IdentityKeyPair::verify(
            &self.sig_pub,
            &signing_digest(&message.ciphertext, &message.tag, &message.session_id, message.index),
            &message.signature,
        )?;

        if message.index < self.first_known_index {
            return Err(CryptoError::UnknownMessageIndex { index: message.index });
        }

        let (key, nonce) = if message.index >= self.current_index {
            self.advance_to(message.index)?
        } else if let Some(entry) = self.cache.iter().find(|c| c.index == message.index) {
            // Duplicate envelopes are idempotent: the key stays cached and
            // the AEAD only opens byte-identical ciphertext.
            (entry.key, entry.nonce)
        } else {
            return Err(CryptoError::UnrecoverableKey);
        };

        let aad = message_aad(&self.session_id, message.index);
        let plaintext = aead::decrypt_detached(&key, &nonce, &aad, &message.ciphertext, &message.tag)?;
        Ok(plaintext.to_vec())
    }

    /// Ratchet forward to `index`, caching the material of every index
    /// passed (including `index` itself, for duplicate delivery).
    fn advance_to(&mut self, index: u32) -> Result<([u8; 32], [u8; 12]), CryptoError> {
        let mut result = None;
        while self.current_index <= index {
            let material = kdf::megolm_key_material(&self.chain_key)?;
            self.insert_cached(CachedKey {
                index: self.current_index,
                key: material.key,
                nonce: material.nonce,
            });
            if self.current_index == index {
                result = Some((material.key, material.nonce));
            }
            let mut old = self.chain_key;
            self.chain_key = kdf::megolm_advance(&self.chain_key);
            old.zeroize();
            self.current_index += 1;
        }
        result.ok_or(CryptoError::UnknownMessageIndex { index })
    }

    fn insert_cached(&mut self, entry: CachedKey) {
        self.cache.push(entry);
        while self.cache.len() > MAX_CACHED_KEYS {
            let mut evicted = self.cache.remove(0);
            evicted.key.zeroize();
        }
    }
}
