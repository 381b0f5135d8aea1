// src/core/fingerprint.rs

//! Deterministic stringification and hashing helpers shared by the Bloom
//! filter, the dedup hash set and the quorum checker.
//!
//! A fingerprint is the compact JSON encoding of a value with all object
//! keys sorted recursively, so that semantically equal configurations map to
//! byte-identical strings across restarts and machines.

use murmur3::murmur3_x64_128;
use serde_json::{Map, Value};
use std::io::Cursor;

/// Serializes `value` with object keys sorted recursively.
pub fn stable_stringify(value: &Value) -> String {
    sort_keys(value).to_string()
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k.clone(), sort_keys(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Hashes a byte string to get a single 64-bit value (low half of murmur3 x64-128).
pub fn hash64(data: &[u8]) -> u64 {
    murmur3_x64_128(&mut Cursor::new(data), 0).unwrap() as u64
}

/// Hashes a byte string down to 32 bits, the width `PersistedHashes` stores.
pub fn hash32(data: &[u8]) -> u32 {
    hash64(data) as u32
}

/// Fingerprint of a JSON value: stable stringification followed by `hash64`.
pub fn fingerprint64(value: &Value) -> u64 {
    hash64(stable_stringify(value).as_bytes())
}
