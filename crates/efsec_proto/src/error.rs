use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("unknown envelope version {0}")]
    UnknownVersion(u8),

    #[error("invalid padding: {0}")]
    InvalidPadding(String),

    #[error("invalid key encoding: {0}")]
    InvalidKey(String),

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
