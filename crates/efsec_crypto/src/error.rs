use thiserror::Error;

/// Crypto-layer failures, tagged with stable kinds.
///
/// Variants never carry key bytes or plaintext; callers may surface the
/// message to the application layer as-is.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("signature verification failed")]
    BadSignature,

    #[error("AEAD authentication failed")]
    AeadAuth,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("one-time prekey unknown or already consumed")]
    UnknownPreKey,

    #[error("message is a duplicate or predates the receiving chain")]
    DuplicateOrTooOld,

    #[error("skipped-message window exceeded ({skipped} > {max})")]
    SkipOverflow { skipped: u32, max: u32 },

    #[error("message key no longer recoverable (evicted from cache)")]
    UnrecoverableKey,

    #[error("message index {index} predates this inbound session")]
    UnknownMessageIndex { index: u32 },

    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}
