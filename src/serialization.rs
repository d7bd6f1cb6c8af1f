//! Deterministic encodings used on the storage boundary.
//!
//! - JSON (`serialize`/`deserialize`) for post commands written to feeds.
//!   Field order is fixed by struct definition and no map types are used,
//!   so equal values always produce equal strings.
//! - CBOR for chapter payloads before encryption.
//! - bincode for signed envelopes and feed digests.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CBOR encode error: {0}")]
    CborEncode(String),
    #[error("CBOR decode error: {0}")]
    CborDecode(String),
    #[error("Bincode error: {0}")]
    Bincode(String),
    #[error("invalid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

pub type Result<T> = std::result::Result<T, SerializationError>;

/// Serialize a value to its canonical JSON string.
pub fn serialize<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Deserialize a value from its canonical JSON string.
pub fn deserialize<T: DeserializeOwned>(s: &str) -> Result<T> {
    Ok(serde_json::from_str(s)?)
}

/// Deserialize canonical JSON stored as raw bytes.
pub fn deserialize_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    deserialize(std::str::from_utf8(bytes)?)
}

// ---------------------------------------------------------------------------
// CBOR helpers
// ---------------------------------------------------------------------------

/// CBOR-encode a value to bytes.
pub fn cbor_encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| SerializationError::CborEncode(e.to_string()))?;
    Ok(buf)
}

/// CBOR-decode a value from bytes.
pub fn cbor_decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| SerializationError::CborDecode(e.to_string()))
}

// ---------------------------------------------------------------------------
// bincode helpers
// ---------------------------------------------------------------------------

pub fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| SerializationError::Bincode(e.to_string()))
}

pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| SerializationError::Bincode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Sample {
        version: u32,
        text: String,
        epoch: Option<(u64, u8)>,
    }

    fn sample() -> Sample {
        Sample {
            version: 1,
            text: "hello".into(),
            epoch: Some((1700000000, 3)),
        }
    }

    #[test]
    fn test_serialize_is_deterministic() {
        assert_eq!(serialize(&sample()).unwrap(), serialize(&sample()).unwrap());
        assert_eq!(
            serialize(&sample()).unwrap(),
            r#"{"version":1,"text":"hello","epoch":[1700000000,3]}"#
        );
    }

    #[test]
    fn test_deserialize_rejects_malformed() {
        let err = deserialize::<Sample>("{\"version\":").unwrap_err();
        assert!(matches!(err, SerializationError::Json(_)));
    }

    #[test]
    fn test_deserialize_bytes_rejects_invalid_utf8() {
        let err = deserialize_bytes::<Sample>(&[0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, SerializationError::Utf8(_)));
    }

    #[test]
    fn test_cbor_decode_rejects_truncated() {
        let bytes = cbor_encode(&sample()).unwrap();
        let err = cbor_decode::<Sample>(&bytes[..bytes.len() / 2]).unwrap_err();
        assert!(matches!(err, SerializationError::CborDecode(_)));
    }

    #[test]
    fn test_bincode_roundtrip() {
        let bytes = to_bytes(&sample()).unwrap();
        assert_eq!(from_bytes::<Sample>(&bytes).unwrap(), sample());
    }
}
