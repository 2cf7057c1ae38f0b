//! API request/response types shared between the client engine and the
//! coordination server. These map directly to JSON bodies on the wire;
//! key material rides base64url-encoded.
//!
//! The authenticated principal is never part of a body — the server takes
//! it from the transport credential only.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use efsec_crypto::account::PublicBundle;
use efsec_crypto::x3dh::PeerBundle;

use crate::error::ProtoError;

fn b64(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

fn b64_array<const N: usize>(s: &str, what: &str) -> Result<[u8; N], ProtoError> {
    let bytes = URL_SAFE_NO_PAD.decode(s)?;
    bytes
        .try_into()
        .map_err(|_| ProtoError::InvalidKey(format!("{what} must be {N} bytes")))
}

// ── SKR ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPreKeyDto {
    pub key_id: u32,
    /// X25519 public (base64)
    pub public: String,
    /// Ed25519 signature over the raw public bytes (base64)
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimeKeyDto {
    pub key_id: u32,
    /// X25519 public (base64)
    pub public: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadBundleRequest {
    pub device_id: String,
    /// Ed25519 identity public key (base64)
    pub identity_pub: String,
    pub signed_prekey: SignedPreKeyDto,
    pub one_time_keys: Vec<OneTimeKeyDto>,
}

impl UploadBundleRequest {
    pub fn from_bundle(device_id: &str, bundle: &PublicBundle) -> Self {
        Self {
            device_id: device_id.to_string(),
            identity_pub: b64(&bundle.identity_pub),
            signed_prekey: SignedPreKeyDto {
                key_id: bundle.signed_prekey.key_id,
                public: b64(&bundle.signed_prekey.public),
                signature: b64(&bundle.signed_prekey.signature),
            },
            one_time_keys: bundle
                .one_time
                .iter()
                .map(|(key_id, public)| OneTimeKeyDto { key_id: *key_id, public: b64(public) })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReplenishRequest {
    pub one_time_keys: Vec<OneTimeKeyDto>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeyStatusResponse {
    pub remaining_one_time: i64,
}

/// A claimed bundle: fetching one consumes the one-time key it carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleResponse {
    pub user_id: String,
    pub device_id: String,
    pub identity_pub: String,
    pub signed_prekey: SignedPreKeyDto,
    pub one_time_key: Option<OneTimeKeyDto>,
}

impl BundleResponse {
    /// Decode into the crypto-layer bundle the initiator consumes.
    pub fn to_peer_bundle(&self) -> Result<PeerBundle, ProtoError> {
        let one_time = match &self.one_time_key {
            Some(k) => Some((k.key_id, b64_array::<32>(&k.public, "one-time key")?)),
            None => None,
        };
        Ok(PeerBundle {
            identity_pub: b64_array::<32>(&self.identity_pub, "identity key")?,
            signed_prekey_id: self.signed_prekey.key_id,
            signed_prekey_pub: b64_array::<32>(&self.signed_prekey.public, "signed prekey")?,
            signed_prekey_sig: b64_array::<64>(&self.signed_prekey.signature, "signature")?,
            one_time,
        })
    }
}

// ── SGR ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateGroupRequest {
    pub group_id: String,
    pub members: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JoinGroupRequest {
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupInfoResponse {
    pub group_id: String,
    pub created_by: String,
    pub key_version: u32,
    pub members: Vec<String>,
}

// ── ECR ──────────────────────────────────────────────────────────────────────

/// Relay-level classification; drives retention only, the body stays opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeClass {
    Dm,
    Group,
    KeyDist,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendEnvelopeRequest {
    pub recipients: Vec<String>,
    pub class: EnvelopeClass,
    /// Framed envelope bytes (base64)
    pub payload: String,
}

impl SendEnvelopeRequest {
    pub fn new(recipients: Vec<String>, class: EnvelopeClass, payload: &[u8]) -> Self {
        Self { recipients, class, payload: b64(payload) }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendEnvelopeResponse {
    pub envelope_id: Uuid,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEnvelopeDto {
    pub envelope_id: Uuid,
    pub sender: String,
    pub class: EnvelopeClass,
    /// Framed envelope bytes (base64)
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

impl StoredEnvelopeDto {
    pub fn payload_bytes(&self) -> Result<Vec<u8>, ProtoError> {
        Ok(URL_SAFE_NO_PAD.decode(&self.payload)?)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListEnvelopesResponse {
    pub envelopes: Vec<StoredEnvelopeDto>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AckRequest {
    pub envelope_ids: Vec<Uuid>,
}

/// Pushed to connected clients when an envelope lands in their queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEvent {
    pub recipient: String,
    pub envelope_id: Uuid,
    pub class: EnvelopeClass,
}

/// Pushed to group members when the key version bumps (rekey-on-leave).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRekeyEvent {
    pub group_id: String,
    pub key_version: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}
