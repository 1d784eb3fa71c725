//! # Serialization Formats
//!
//! Message codecs referenced by method descriptors. A descriptor names one
//! format for its requests and one for its responses; both peers use the
//! descriptor to agree on the encoding of every message of a call.
//!
//! ## Formats
//! - **Bincode**: binary compact format (default, fastest)
//! - **JSON**: human-readable, handy when debugging captured traffic
//! - **MessagePack**: compact binary with a self-describing layout
//!
//! ## Usage
//! ```rust
//! use secure_rpc::core::serialization::SerializationFormat;
//!
//! let bytes = SerializationFormat::Json.encode(&vec![1u8, 2, 3]).unwrap();
//! let back: Vec<u8> = SerializationFormat::Json.decode(&bytes).unwrap();
//! assert_eq!(back, vec![1, 2, 3]);
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Supported serialization formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    /// Binary compact format (default, fastest)
    #[default]
    Bincode,
    /// Human-readable JSON format (debugging, interop)
    Json,
    /// Compact binary format (MessagePack, efficient)
    MessagePack,
}

impl SerializationFormat {
    /// Get human-readable name
    pub fn name(self) -> &'static str {
        match self {
            SerializationFormat::Bincode => "Bincode",
            SerializationFormat::Json => "JSON",
            SerializationFormat::MessagePack => "MessagePack",
        }
    }

    /// Serialize a message with this format
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            SerializationFormat::Bincode => {
                bincode::serialize(value).map_err(|e| ProtocolError::SerializeError(e.to_string()))
            }
            SerializationFormat::Json => {
                serde_json::to_vec(value).map_err(|e| ProtocolError::SerializeError(e.to_string()))
            }
            SerializationFormat::MessagePack => {
                rmp_serde::to_vec(value).map_err(|e| ProtocolError::SerializeError(e.to_string()))
            }
        }
    }

    /// Deserialize a message with this format
    pub fn decode<T: DeserializeOwned>(self, data: &[u8]) -> Result<T> {
        match self {
            SerializationFormat::Bincode => bincode::deserialize(data)
                .map_err(|e| ProtocolError::DeserializeError(e.to_string())),
            SerializationFormat::Json => serde_json::from_slice(data)
                .map_err(|e| ProtocolError::DeserializeError(e.to_string())),
            SerializationFormat::MessagePack => rmp_serde::from_slice(data)
                .map_err(|e| ProtocolError::DeserializeError(e.to_string())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Greeting {
        name: String,
        count: u32,
    }

    #[test]
    fn test_format_names() {
        assert_eq!(SerializationFormat::Bincode.name(), "Bincode");
        assert_eq!(SerializationFormat::Json.name(), "JSON");
        assert_eq!(SerializationFormat::MessagePack.name(), "MessagePack");
    }

    #[test]
    fn test_default_format() {
        assert_eq!(SerializationFormat::default(), SerializationFormat::Bincode);
    }

    #[test]
    fn test_every_format_decodes_its_own_output() {
        let msg = Greeting {
            name: "John".into(),
            count: 3,
        };
        for format in [
            SerializationFormat::Bincode,
            SerializationFormat::Json,
            SerializationFormat::MessagePack,
        ] {
            let bytes = format.encode(&msg).expect("encode");
            let back: Greeting = format.decode(&bytes).expect("decode");
            assert_eq!(back, msg, "{} mismatch", format.name());
        }
    }

    #[test]
    fn test_json_is_readable() {
        let bytes = SerializationFormat::Json
            .encode(&Greeting {
                name: "Doe".into(),
                count: 1,
            })
            .expect("encode");
        assert_eq!(
            String::from_utf8(bytes).expect("utf8"),
            r#"{"name":"Doe","count":1}"#
        );
    }

    #[test]
    fn test_mismatched_format_is_a_decode_error() {
        let bytes = SerializationFormat::Json.encode(&42u32).expect("encode");
        let result: Result<Greeting> = SerializationFormat::Bincode.decode(&bytes);
        assert!(matches!(result, Err(ProtocolError::DeserializeError(_))));
    }
}
