//! Serde adapters for byte arrays past serde's built-in 32-element impls.
//! Encoded as base64url, which also keeps signatures readable in stored
//! JSON state.

pub mod array64 {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 64], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 64], D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = URL_SAFE_NO_PAD.decode(&text).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 64 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Signed {
        #[serde(with = "super::array64")]
        sig: [u8; 64],
    }

    #[test]
    fn roundtrip() {
        let value = Signed { sig: [0xAB; 64] };
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(serde_json::from_str::<Signed>(&json).unwrap(), value);
    }

    #[test]
    fn rejects_wrong_length() {
        let short = serde_json::json!({ "sig": "AAAA" });
        assert!(serde_json::from_value::<Signed>(short).is_err());
    }
}
