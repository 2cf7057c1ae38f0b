//! Prekey account: the client-side key inventory behind a published bundle.
//!
//! Holds the long-term identity, the current (and one prior) signed prekey,
//! and the pool of one-time prekey secrets. Key ids are allocated from 1
//! upwards; id 0 is reserved to mean "absent" on the wire.
//!
//! Lifecycle:
//!   - signed prekey rotated on a timer; the prior secret is retained so
//!     in-flight session initiations against the old bundle still resolve
//!   - one-time secrets are deleted on first consumption; a second
//!     consumption of the same id reports `UnknownPreKey` so duplicate
//!     prekey envelopes fail cleanly instead of re-deriving

use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::identity::IdentityKeyPair;

/// Default one-time prekey batch size for bundle publication.
pub const ONE_TIME_BATCH: usize = 50;

/// A signed prekey with its secret half.
#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SignedPreKey {
    #[zeroize(skip)]
    pub key_id: u32,
    secret: [u8; 32],
    #[zeroize(skip)]
    pub public: [u8; 32],
    #[zeroize(skip)]
    #[serde(with = "crate::serde_b64::array64")]
    pub signature: [u8; 64],
}

impl SignedPreKey {
    fn generate(key_id: u32, identity: &IdentityKeyPair) -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = X25519Public::from(&secret);
        let signature = identity.sign(public.as_bytes());
        Self { key_id, secret: secret.to_bytes(), public: *public.as_bytes(), signature }
    }

    pub fn dh_secret(&self) -> StaticSecret {
        StaticSecret::from(self.secret)
    }
}

/// A one-time prekey secret, deleted after first use.
#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct OneTimePreKey {
    #[zeroize(skip)]
    pub key_id: u32,
    secret: [u8; 32],
    #[zeroize(skip)]
    pub public: [u8; 32],
}

impl OneTimePreKey {
    fn generate(key_id: u32) -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = X25519Public::from(&secret);
        Self { key_id, secret: secret.to_bytes(), public: *public.as_bytes() }
    }

    pub fn dh_secret(&self) -> StaticSecret {
        StaticSecret::from(self.secret)
    }
}

/// Public half of a signed prekey, as served in bundles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPreKeyPublic {
    pub key_id: u32,
    pub public: [u8; 32],
    #[serde(with = "crate::serde_b64::array64")]
    pub signature: [u8; 64],
}

/// Everything a client uploads so peers can initiate sessions asynchronously.
#[derive(Debug, Clone)]
pub struct PublicBundle {
    pub identity_pub: [u8; 32],
    pub signed_prekey: SignedPreKeyPublic,
    pub one_time: Vec<(u32, [u8; 32])>,
}

/// The full client key inventory. Persisted (vault-encrypted) by the keystore.
#[derive(Serialize, Deserialize)]
pub struct Account {
    identity_secret: [u8; 32],
    pub signed_prekey: SignedPreKey,
    pub prior_signed_prekey: Option<SignedPreKey>,
    one_time: Vec<OneTimePreKey>,
    next_key_id: u32,
}

impl Drop for Account {
    fn drop(&mut self) {
        self.identity_secret.zeroize();
    }
}

impl Account {
    /// Generate a fresh account: identity keypair, first signed prekey,
    /// empty one-time pool.
    pub fn new() -> Self {
        let identity = IdentityKeyPair::generate();
        let signed_prekey = SignedPreKey::generate(1, &identity);
        Self {
            identity_secret: *identity.secret_bytes(),
            signed_prekey,
            prior_signed_prekey: None,
            one_time: Vec::new(),
            next_key_id: 2,
        }
    }

    pub fn identity(&self) -> IdentityKeyPair {
        IdentityKeyPair::from_bytes(&self.identity_secret).expect("stored identity key is 32 bytes")
    }

    /// Serialize the public bundle, topping the one-time pool up to
    /// `ONE_TIME_BATCH` fresh keys whose publics ride along.
    pub fn publish_bundle(&mut self) -> PublicBundle {
        let fresh = self.replenish_one_time_keys(ONE_TIME_BATCH);
        PublicBundle {
            identity_pub: self.identity().public.0,
            signed_prekey: SignedPreKeyPublic {
                key_id: self.signed_prekey.key_id,
                public: self.signed_prekey.public,
                signature: self.signed_prekey.signature,
            },
            one_time: fresh,
        }
    }

    /// Generate and sign a new signed prekey; the prior one is retained
    /// until the rotation grace window ends.
    pub fn rotate_signed_prekey(&mut self) -> SignedPreKeyPublic {
        let key_id = self.next_key_id;
        self.next_key_id += 1;
        let fresh = SignedPreKey::generate(key_id, &self.identity());
        let prior = std::mem::replace(&mut self.signed_prekey, fresh);
        self.prior_signed_prekey = Some(prior);
        SignedPreKeyPublic {
            key_id: self.signed_prekey.key_id,
            public: self.signed_prekey.public,
            signature: self.signed_prekey.signature,
        }
    }

    /// Drop the retained prior signed prekey (grace window elapsed).
    pub fn discard_prior_signed_prekey(&mut self) {
        self.prior_signed_prekey = None;
    }

    /// Resolve a signed prekey secret by id (current or prior).
    pub fn signed_prekey_secret(&self, key_id: u32) -> Result<StaticSecret, CryptoError> {
        if self.signed_prekey.key_id == key_id {
            return Ok(self.signed_prekey.dh_secret());
        }
        if let Some(ref prior) = self.prior_signed_prekey {
            if prior.key_id == key_id {
                return Ok(prior.dh_secret());
            }
        }
        Err(CryptoError::UnknownPreKey)
    }

    /// Generate `n` one-time prekeys; returns the publics for upload.
    pub fn replenish_one_time_keys(&mut self, n: usize) -> Vec<(u32, [u8; 32])> {
        let mut publics = Vec::with_capacity(n);
        for _ in 0..n {
            let key_id = self.next_key_id;
            self.next_key_id += 1;
            let otk = OneTimePreKey::generate(key_id);
            publics.push((key_id, otk.public));
            self.one_time.push(otk);
        }
        publics
    }

    /// Number of one-time secrets still held locally.
    pub fn one_time_remaining(&self) -> usize {
        self.one_time.len()
    }

    /// Remove and return a one-time prekey secret. The first inbound
    /// prekey envelope referencing the id consumes it; any later
    /// reference fails with `UnknownPreKey`.
    pub fn consume_one_time_private(&mut self, key_id: u32) -> Result<StaticSecret, CryptoError> {
        let idx = self
            .one_time
            .iter()
            .position(|k| k.key_id == key_id)
            .ok_or(CryptoError::UnknownPreKey)?;
        let otk = self.one_time.remove(idx);
        Ok(otk.dh_secret())
    }
}

impl Default for Account {
    fn default() -> Self {
        Self::new()
    }
}

/// Decomposed account state, as the keystore persists it: the identity
/// secret and id counter in the singleton row, prekeys in their own maps.
pub struct AccountParts {
    pub identity_secret: [u8; 32],
    pub signed_prekey: SignedPreKey,
    pub prior_signed_prekey: Option<SignedPreKey>,
    pub one_time: Vec<OneTimePreKey>,
    pub next_key_id: u32,
}

impl Account {
    pub fn to_parts(&self) -> AccountParts {
        AccountParts {
            identity_secret: self.identity_secret,
            signed_prekey: self.signed_prekey.clone(),
            prior_signed_prekey: self.prior_signed_prekey.clone(),
            one_time: self.one_time.clone(),
            next_key_id: self.next_key_id,
        }
    }

    pub fn from_parts(parts: AccountParts) -> Self {
        Self {
            identity_secret: parts.identity_secret,
            signed_prekey: parts.signed_prekey,
            prior_signed_prekey: parts.prior_signed_prekey,
            one_time: parts.one_time,
            next_key_id: parts.next_key_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeyPair;

    #[test]
    fn bundle_carries_valid_spk_signature() {
        let mut account = Account::new();
        let bundle = account.publish_bundle();
        assert!(IdentityKeyPair::verify(
            &bundle.identity_pub,
            &bundle.signed_prekey.public,
            &bundle.signed_prekey.signature,
        )
        .is_ok());
        assert_eq!(bundle.one_time.len(), ONE_TIME_BATCH);
    }

    #[test]
    fn one_time_consumption_is_single_use() {
        let mut account = Account::new();
        let publics = account.replenish_one_time_keys(3);
        let (key_id, public) = publics[1];

        let secret = account.consume_one_time_private(key_id).unwrap();
        assert_eq!(X25519Public::from(&secret).as_bytes(), &public);
        assert_eq!(account.one_time_remaining(), 2);

        assert!(matches!(
            account.consume_one_time_private(key_id),
            Err(CryptoError::UnknownPreKey)
        ));
    }

    #[test]
    fn rotation_retains_prior_until_discarded() {
        let mut account = Account::new();
        let old_id = account.signed_prekey.key_id;
        let rotated = account.rotate_signed_prekey();
        assert_ne!(rotated.key_id, old_id);

        // Both the new and the prior secret resolve.
        assert!(account.signed_prekey_secret(rotated.key_id).is_ok());
        assert!(account.signed_prekey_secret(old_id).is_ok());

        account.discard_prior_signed_prekey();
        assert!(matches!(
            account.signed_prekey_secret(old_id),
            Err(CryptoError::UnknownPreKey)
        ));
    }

    #[test]
    fn key_ids_never_repeat() {
        let mut account = Account::new();
        let mut seen = std::collections::HashSet::new();
        seen.insert(account.signed_prekey.key_id);
        for (id, _) in account.replenish_one_time_keys(10) {
            assert!(seen.insert(id));
        }
        let rotated = account.rotate_signed_prekey();
        assert!(seen.insert(rotated.key_id));
    }
}
