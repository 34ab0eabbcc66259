//! Base64 helpers for moving opaque byte sequences through text formats.
//!
//! Every persisted key and every encrypted item is a `(nonce, ciphertext)`
//! pair of raw bytes. Collaborators speak JSON, so these helpers are the one
//! place where bytes become strings and back.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::{Error, Result};

/// Encode bytes as padded standard base64.
pub fn encode(bytes: impl AsRef<[u8]>) -> String {
    STANDARD.encode(bytes)
}

/// Decode padded standard base64 into bytes.
///
/// # Errors
/// - Returns `InvalidInput` if the string is not valid base64
pub fn decode(encoded: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::InvalidInput(format!("Invalid base64: {}", e)))
}

/// Decode base64 into a fixed-size array.
///
/// # Errors
/// - Returns `InvalidInput` if decoding fails or the length differs from `N`
pub fn decode_array<const N: usize>(encoded: &str) -> Result<[u8; N]> {
    let bytes = decode(encoded)?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        Error::InvalidInput(format!(
            "Invalid length: expected {} bytes, got {}",
            N,
            bytes.len()
        ))
    })
}

/// Serde adapter serializing `Vec<u8>` fields as base64 strings.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Record {
///     #[serde(with = "snapvault_common::codec::base64_bytes")]
///     nonce: Vec<u8>,
/// }
/// ```
pub mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(bytes: &T, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]>,
        S: Serializer,
    {
        serializer.serialize_str(&super::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        super::decode(&encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Wrapped {
        #[serde(with = "base64_bytes")]
        nonce: Vec<u8>,
    }

    #[test]
    fn test_known_vector() {
        assert_eq!(encode(b"snap"), "c25hcA==");
        assert_eq!(decode("c25hcA==").unwrap(), b"snap");
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(encode([]), "");
        assert!(decode("").unwrap().is_empty());
    }

    #[test]
    fn test_invalid_base64_rejected() {
        assert!(matches!(decode("not base64!"), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_decode_array_length_mismatch() {
        let encoded = encode([7u8; 12]);
        assert!(decode_array::<12>(&encoded).is_ok());
        assert!(matches!(
            decode_array::<24>(&encoded),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_serde_adapter_uses_strings() {
        let value = Wrapped { nonce: vec![1, 2, 3] };
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"{"nonce":"AQID"}"#);
        let parsed: Wrapped = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, value);
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
            prop_assert_eq!(decode(&encode(&bytes)).unwrap(), bytes);
        }
    }
}
