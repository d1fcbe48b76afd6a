//! Value encoding across the cache boundary.
//!
//! Both tiers store opaque bytes. The codec is chosen once per cache instance
//! and every typed read/write goes through it, so the concrete value type is
//! known at the call site.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CacheResult;

/// Serialization format for cached values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    /// JSON via `serde_json` (interoperable with non-Rust readers of the remote tier).
    #[default]
    Json,
    /// MessagePack via `rmp-serde` with named struct fields.
    MessagePack,
}

impl Codec {
    /// Encode a value into bytes.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> CacheResult<Vec<u8>> {
        match self {
            Codec::Json => Ok(serde_json::to_vec(value)?),
            Codec::MessagePack => Ok(rmp_serde::to_vec_named(value)?),
        }
    }

    /// Decode bytes into a value.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> CacheResult<T> {
        match self {
            Codec::Json => Ok(serde_json::from_slice(bytes)?),
            Codec::MessagePack => Ok(rmp_serde::from_slice(bytes)?),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Codec::Json => "json",
            Codec::MessagePack => "msgpack",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct TaskSummary {
        id: u64,
        title: String,
        done: bool,
    }

    #[test]
    fn test_msgpack_preserves_struct_fields() {
        let task = TaskSummary {
            id: 7,
            title: "write report".into(),
            done: false,
        };
        let bytes = Codec::MessagePack.encode(&task).unwrap();
        let decoded: TaskSummary = Codec::MessagePack.decode(&bytes).unwrap();
        assert_eq!(decoded, task);
    }

    #[test]
    fn test_json_is_plain_text() {
        let bytes = Codec::Json.encode(&json!({"v": 1})).unwrap();
        assert_eq!(bytes, br#"{"v":1}"#);
    }

    #[test]
    fn test_decode_failure_is_serialization_error() {
        let err = Codec::Json.decode::<TaskSummary>(b"not json").unwrap_err();
        assert!(matches!(err, crate::CacheError::Serialization { .. }));
    }
}
