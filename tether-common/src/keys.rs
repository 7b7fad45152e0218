//! Deterministic identities for operations.
//!
//! Two calls that are logically identical (same kind, same operation text, same variables
//! regardless of object key order) always derive the same key. Keys stay human readable so
//! cache entries can be invalidated by pattern.
use serde_json::{Map, Value};
use tiny_keccak::{Hasher, Keccak};

use crate::dto::OperationKind;

const SUBSCRIPTION_ID_PREFIX: &str = "sub-";
const SUBSCRIPTION_ID_BYTES: usize = 16;

/// Returns a copy of `value` in which every object has its keys sorted.
///
/// `null` variables are treated as an empty object.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Null => Value::Object(Map::new()),
        other => sort_keys(other),
    }
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), sort_keys(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Canonical JSON text of `value`.
pub fn canonical_json(value: &Value) -> String {
    canonicalize(value).to_string()
}

/// Key identifying an operation for caching and deduplication.
///
/// Format: `<kind>:<operation text>:<canonical variables>`.
pub fn operation_key(kind: OperationKind, operation: &str, variables: &Value) -> String {
    format!("{}:{}:{}", kind, operation.trim(), canonical_json(variables))
}

/// Stable identifier of a subscription, derived from the operation text and its variables.
pub fn subscription_id(operation: &str, variables: &Value) -> String {
    let key = operation_key(OperationKind::Subscription, operation, variables);
    let mut hasher = Keccak::v256();
    let mut digest = [0u8; 32];
    hasher.update(key.as_bytes());
    hasher.finalize(&mut digest);
    format!("{SUBSCRIPTION_ID_PREFIX}{}", hex::encode(&digest[..SUBSCRIPTION_ID_BYTES]))
}
