use thiserror::Error;

use efsec_crypto::CryptoError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("keystore I/O failure: {0}")]
    Io(#[from] sqlx::Error),

    #[error("keystore conflict: {0}")]
    Conflict(String),

    #[error("keystore vault is locked")]
    VaultLocked,

    #[error("migration failed: {0}")]
    Migration(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}
