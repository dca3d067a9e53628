//! Canonical JSON hashing for step-result cache keys
//!
//! Object keys are sorted so logically equal inputs hash identically
//! regardless of construction order. Array order is preserved. Numbers use
//! serde_json's default rendering (no NaN/Inf in workflow payloads).

use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Render a JSON value in canonical form: sorted object keys, no whitespace
pub fn to_canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => serde_json::to_string(s).unwrap_or_default(),
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(to_canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        Value::Object(map) => {
            let sorted: BTreeMap<&String, String> = map
                .iter()
                .map(|(k, v)| (k, to_canonical_json(v)))
                .collect();
            let rendered: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| {
                    format!("{}:{}", serde_json::to_string(k).unwrap_or_default(), v)
                })
                .collect();
            format!("{{{}}}", rendered.join(","))
        }
    }
}

/// SHA-256 over the canonical rendering; absent input hashes as `null`
pub fn hash_input(input: Option<&Value>) -> String {
    let canonical = match input {
        Some(value) => to_canonical_json(value),
        None => "null".to_string(),
    };
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)
}
