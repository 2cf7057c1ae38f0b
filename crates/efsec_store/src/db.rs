//! Keystore database handle.
//!
//! SQLite via sqlx. WAL journal mode and foreign-key enforcement are set
//! at connection time, not inside a migration — SQLite refuses to change
//! `journal_mode` inside a transaction and sqlx wraps every migration in
//! one.

use std::path::Path;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use efsec_crypto::aead;

use crate::error::StoreError;
use crate::vault::Vault;

const VALUE_AAD: &[u8] = b"efsec-store-v1";

/// Central keystore handle. Cheap to clone (pool and vault are Arcs).
#[derive(Clone)]
pub struct Store {
    pub(crate) pool: SqlitePool,
    pub(crate) vault: Vault,
}

impl Store {
    /// Open (or create) the keystore at `db_path` and run migrations.
    pub async fn open(db_path: &Path, vault: Vault) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(pool, vault).await
    }

    /// In-memory keystore, for tests and ephemeral sessions.
    pub async fn open_in_memory(vault: Vault) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::migrate(pool, vault).await
    }

    async fn migrate(pool: SqlitePool, vault: Vault) -> Result<Self, StoreError> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        Ok(Self { pool, vault })
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    /// Encrypt a value with the vault key for storage.
    pub(crate) async fn encrypt_value(&self, plaintext: &[u8]) -> Result<String, StoreError> {
        self.vault
            .with_key(|key| {
                let ct = aead::vault_encrypt(key, plaintext, VALUE_AAD)?;
                Ok(URL_SAFE_NO_PAD.encode(ct))
            })
            .await
    }

    /// Decrypt a vault-encrypted stored value.
    pub(crate) async fn decrypt_value(&self, stored: &str) -> Result<Vec<u8>, StoreError> {
        let ct = URL_SAFE_NO_PAD
            .decode(stored)
            .map_err(|e| StoreError::Conflict(format!("corrupt stored value: {e}")))?;
        self.vault
            .with_key(|key| {
                let pt = aead::vault_decrypt(key, &ct, VALUE_AAD)?;
                Ok(pt.to_vec())
            })
            .await
    }
}
