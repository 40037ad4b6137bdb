//! Cache keys.
//!
//! Two calls that differ only in object key order, hex letter case or whitespace map to the same
//! key.

use alloy::hex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Computes the cache key of a call: `sha256(method ∥ 0x00 ∥ canonical(params))`, hex encoded.
pub fn cache_key(method: &str, params: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonicalize(params).to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Returns `value` with object keys sorted and `0x` strings lower-cased.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut entries: Vec<_> = object.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key.clone(), canonicalize(value)))
                    .collect::<Map<_, _>>(),
            )
        }
        Value::Array(values) => Value::Array(values.iter().map(canonicalize).collect()),
        Value::String(s) if s.starts_with("0x") || s.starts_with("0X") => {
            Value::String(s.to_ascii_lowercase())
        }
        value => value.clone(),
    }
}
