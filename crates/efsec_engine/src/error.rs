use thiserror::Error;

use efsec_crypto::CryptoError;
use efsec_proto::ProtoError;
use efsec_store::StoreError;

use crate::transport::TransportError;

/// Coordinator-level failures. Crypto failures are per-message and never
/// tear a session down; keystore failures abort the in-flight operation
/// with state unchanged.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("no session established with {0}")]
    UnknownSession(String),

    #[error("keystore belongs to a different user")]
    AccountMismatch,
}

impl EngineError {
    /// True when retrying the same envelope can never succeed; the
    /// coordinator acks such envelopes so the queue drains.
    pub fn is_permanent(&self) -> bool {
        match self {
            EngineError::Crypto(_) | EngineError::Proto(_) | EngineError::UnknownSession(_) => true,
            EngineError::Store(_) | EngineError::Transport(_) | EngineError::AccountMismatch => false,
        }
    }
}
