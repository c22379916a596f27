//! MsgPack codec using `rmp-serde`.
//!
//! Every structured blob that travels inside a framelet body (headers,
//! config, protocol errors, error records) goes through this codec, as do
//! user payloads in [`MethodRegistry`](crate::handler::MethodRegistry).
//!
//! **Always `to_vec_named`, never `to_vec`**: struct-as-map keeps the blobs
//! self-describing, so peers can evolve record fields independently.
//!
//! # Example
//!
//! ```
//! use epoxy_core::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Ping {
//!     seq: u32,
//! }
//!
//! let msg = Ping { seq: 7 };
//! let encoded = MsgPackCodec::encode(&msg).unwrap();
//! let decoded: Ping = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use crate::error::Result;

/// MessagePack codec for structured data.
///
/// Uses `rmp_serde::to_vec_named` so structs serialize as maps (with field
/// names) rather than positional arrays.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct TestRecord {
        id: u64,
        name: String,
    }

    #[test]
    fn test_encode_decode_struct() {
        let original = TestRecord {
            id: 42,
            name: "echo".to_string(),
        };

        let encoded = MsgPackCodec::encode(&original).unwrap();
        let decoded: TestRecord = MsgPackCodec::decode(&encoded).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_struct_encodes_as_map() {
        // Map format starts with 0x8X (fixmap); array format would be 0x9X.
        let record = TestRecord {
            id: 1,
            name: "x".to_string(),
        };
        let encoded = MsgPackCodec::encode(&record).unwrap();
        assert_eq!(
            encoded[0] & 0xF0,
            0x80,
            "Expected map format (0x8X), got {:02X}",
            encoded[0]
        );
    }

    #[test]
    fn test_empty_struct() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Empty {}

        let encoded = MsgPackCodec::encode(&Empty {}).unwrap();
        let decoded: Empty = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, Empty {});
    }

    #[test]
    fn test_decode_error_on_invalid_data() {
        let invalid = b"not valid msgpack";
        let result: Result<TestRecord> = MsgPackCodec::decode(invalid);
        assert!(result.is_err());
    }
}
