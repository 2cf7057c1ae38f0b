//! Vault: the in-memory key that encrypts keystore state at rest.
//!
//! Private material never reaches SQLite in the clear; every value is
//! XChaCha20-Poly1305-encrypted under the vault key. The key is derived
//! from a passphrase (Argon2id) or supplied directly (e.g. from an OS
//! keyring), lives only in memory, and is zeroized on lock.

use std::sync::Arc;
use tokio::sync::RwLock;
use zeroize::ZeroizeOnDrop;

use efsec_crypto::kdf::{generate_salt, vault_key_from_password};

use crate::error::StoreError;

#[derive(ZeroizeOnDrop)]
struct VaultInner {
    key: [u8; 32],
}

/// Thread-safe vault handle. Cheap to clone.
#[derive(Clone)]
pub struct Vault {
    inner: Arc<RwLock<Option<VaultInner>>>,
}

impl Vault {
    pub fn new() -> Self {
        Self { inner: Arc::new(RwLock::new(None)) }
    }

    /// Derive the vault key from a passphrase and unlock.
    pub async fn unlock(&self, password: &[u8], salt: &[u8; 16]) -> Result<(), StoreError> {
        let key = vault_key_from_password(password, salt)?;
        let mut guard = self.inner.write().await;
        *guard = Some(VaultInner { key: key.0 });
        Ok(())
    }

    /// Unlock with an externally-held 32-byte key.
    pub async fn unlock_with_key(&self, key: [u8; 32]) {
        let mut guard = self.inner.write().await;
        *guard = Some(VaultInner { key });
    }

    /// Lock the vault; the key is zeroized.
    pub async fn lock(&self) {
        let mut guard = self.inner.write().await;
        *guard = None;
    }

    pub async fn is_locked(&self) -> bool {
        self.inner.read().await.is_none()
    }

    /// Run an encrypt/decrypt closure against the unlocked key.
    pub async fn with_key<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&[u8; 32]) -> Result<R, StoreError>,
    {
        let guard = self.inner.read().await;
        match guard.as_ref() {
            Some(inner) => f(&inner.key),
            None => Err(StoreError::VaultLocked),
        }
    }
}

impl Default for Vault {
    fn default() -> Self {
        Self::new()
    }
}

/// Fresh salt for a new keystore. Persist it next to the database.
pub fn new_vault_salt() -> [u8; 16] {
    generate_salt()
}
