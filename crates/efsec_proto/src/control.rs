//! Inner payloads carried inside pairwise ciphertext.
//!
//! After the ratchet opens a DM envelope, the plaintext (once unpadded) is
//! one of these. Chat bodies go to the application; key_request /
//! key_distribution are control traffic the coordinator consumes to move
//! Megolm chain state between members.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

use efsec_crypto::megolm::GroupSessionExport;

use crate::error::ProtoError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InnerPayload {
    /// Application plaintext.
    Chat {
        #[serde(with = "b64_bytes")]
        body: Vec<u8>,
    },
    /// Receiver lacks an inbound session for (sender, session_id).
    KeyRequest {
        group_id: String,
        #[serde(with = "b64_array16")]
        session_id: [u8; 16],
    },
    /// Megolm chain state at the sender's current index.
    KeyDistribution {
        group_id: String,
        #[serde(with = "b64_array16")]
        session_id: [u8; 16],
        #[serde(with = "b64_array32")]
        chain_key: [u8; 32],
        #[serde(with = "b64_array32")]
        sig_pub: [u8; 32],
        first_known_index: u32,
    },
}

impl InnerPayload {
    pub fn key_distribution(group_id: &str, export: &GroupSessionExport) -> Self {
        InnerPayload::KeyDistribution {
            group_id: group_id.to_string(),
            session_id: export.session_id,
            chain_key: export.chain_key,
            sig_pub: export.sig_pub,
            first_known_index: export.message_index,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtoError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Rebuild a `GroupSessionExport` from a key_distribution payload.
pub fn export_from_distribution(payload: &InnerPayload) -> Option<(String, GroupSessionExport)> {
    match payload {
        InnerPayload::KeyDistribution {
            group_id,
            session_id,
            chain_key,
            sig_pub,
            first_known_index,
        } => Some((
            group_id.clone(),
            GroupSessionExport {
                session_id: *session_id,
                message_index: *first_known_index,
                chain_key: *chain_key,
                sig_pub: *sig_pub,
            },
        )),
        _ => None,
    }
}

// ── base64 serde helpers ─────────────────────────────────────────────────────

mod b64_bytes {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        URL_SAFE_NO_PAD.decode(&s).map_err(serde::de::Error::custom)
    }
}

macro_rules! b64_array_mod {
    ($name:ident, $n:literal) => {
        mod $name {
            use super::*;
            use serde::{Deserializer, Serializer};

            pub fn serialize<S: Serializer>(bytes: &[u8; $n], s: S) -> Result<S::Ok, S::Error> {
                s.serialize_str(&URL_SAFE_NO_PAD.encode(bytes))
            }

            pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; $n], D::Error> {
                let s = String::deserialize(d)?;
                let bytes = URL_SAFE_NO_PAD.decode(&s).map_err(serde::de::Error::custom)?;
                bytes
                    .try_into()
                    .map_err(|_| serde::de::Error::custom(concat!("expected ", $n, " bytes")))
            }
        }
    };
}

b64_array_mod!(b64_array16, 16);
b64_array_mod!(b64_array32, 32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_roundtrip() {
        let payload = InnerPayload::Chat { body: b"hello".to_vec() };
        let decoded = InnerPayload::decode(&payload.encode().unwrap()).unwrap();
        let InnerPayload::Chat { body } = decoded else { panic!("expected chat") };
        assert_eq!(body, b"hello");
    }

    #[test]
    fn distribution_roundtrips_to_export() {
        let export = GroupSessionExport {
            session_id: [1u8; 16],
            message_index: 5,
            chain_key: [2u8; 32],
            sig_pub: [3u8; 32],
        };
        let payload = InnerPayload::key_distribution("room-1", &export);
        let decoded = InnerPayload::decode(&payload.encode().unwrap()).unwrap();
        let (group_id, rebuilt) = export_from_distribution(&decoded).unwrap();
        assert_eq!(group_id, "room-1");
        assert_eq!(rebuilt.session_id, export.session_id);
        assert_eq!(rebuilt.message_index, 5);
        assert_eq!(rebuilt.chain_key, export.chain_key);
        assert_eq!(rebuilt.sig_pub, export.sig_pub);
    }

    #[test]
    fn wire_kind_tags_are_stable() {
        let payload = InnerPayload::KeyRequest { group_id: "g".into(), session_id: [0u8; 16] };
        let json: serde_json::Value =
            serde_json::from_slice(&payload.encode().unwrap()).unwrap();
        assert_eq!(json["kind"], "key_request");
    }
}
