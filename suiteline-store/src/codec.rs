//! Record encoding: JSON, LZ4-compressed with a prepended length.
//!
//! JSON keeps the stored record self-describing (`id`, `version` and the
//! soft-delete flags travel with the data); LZ4 block mode keeps the cost
//! low for the repetitive payloads typical of log lines.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{StoreError, StoreResult};

/// Encode a record for storage.
pub fn encode<T: Serialize>(record: &T) -> StoreResult<Vec<u8>> {
    let json = serde_json::to_vec(record)?;
    Ok(lz4_flex::compress_prepend_size(&json))
}

/// Decode a stored record.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    let json = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    Ok(serde_json::from_slice(&json)?)
}

/// The record as a JSON value, as carried on change events.
pub fn to_payload<T: Serialize>(record: &T) -> StoreResult<Value> {
    Ok(serde_json::to_value(record)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LogLevel, LogLine};
    use crate::entity::Meta;
    use chrono::Utc;

    #[test]
    fn test_decode_restores_log_line() {
        let line = LogLine {
            meta: Meta {
                id: "l1".into(),
                version: 4,
                ..Meta::default()
            },
            case_id: "c1".into(),
            seq: 9,
            level: LogLevel::Warn,
            trace: String::new(),
            message: "retrying".into(),
            timestamp: Utc::now(),
        };
        let bytes = encode(&line).unwrap();
        let back: LogLine = decode(&bytes).unwrap();
        assert_eq!(back, line);
    }

    #[test]
    fn test_repetitive_payload_compresses() {
        let message = "connection refused; retrying in 5s ".repeat(200);
        let bytes = encode(&serde_json::json!({ "message": message })).unwrap();
        assert!(bytes.len() * 4 < message.len());
    }

    #[test]
    fn test_decode_garbage_is_error() {
        let result: StoreResult<Value> = decode(&[0xFF, 0xFE, 0xFD]);
        assert!(matches!(result, Err(StoreError::Compression(_))));
    }
}
