// src/core/patterns/doublefetch.rs

//! Doublefetch request construction from pattern data.
//!
//! Pattern files are downloaded content, so everything that reaches the
//! fetch layer is whitelisted: only the known config keys survive, and
//! prototype-walking key names are discarded wherever they appear.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys forwarded verbatim from the pattern's doublefetch section.
const FORWARDED_KEYS: [&str; 3] = ["headers", "steps", "emptyHtml"];

/// Key names never allowed in forwarded config objects.
const DANGEROUS_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

/// A fully sanitized request for the cookie-free second fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoublefetchRequest {
    pub url: String,
    #[serde(flatten)]
    pub config: Value,
}

impl DoublefetchRequest {
    pub fn new(url: impl Into<String>, raw_config: &Value) -> Self {
        Self {
            url: url.into(),
            config: forward_config(raw_config),
        }
    }

    /// `true` when the pattern asks to skip body download entirely.
    pub fn wants_empty_html(&self) -> bool {
        self.config
            .get("emptyHtml")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn follow_redirects(&self) -> bool {
        self.config
            .get("redirect")
            .and_then(Value::as_str)
            .is_some_and(|mode| mode == "follow")
    }

    pub fn headers(&self) -> Option<&Map<String, Value>> {
        self.config.get("headers").and_then(Value::as_object)
    }
}

/// Builds the forwarded config: known keys only, `followRedirects: true`
/// translated to `redirect: "follow"`, applied recursively under `onError`.
pub fn forward_config(raw: &Value) -> Value {
    let Some(source) = raw.as_object() else {
        return Value::Object(Map::new());
    };
    let mut forwarded = Map::new();
    for (key, value) in source {
        if DANGEROUS_KEYS.contains(&key.as_str()) {
            continue;
        }
        if FORWARDED_KEYS.contains(&key.as_str()) {
            forwarded.insert(key.clone(), scrub(value));
        } else if key == "followRedirects" {
            if value.as_bool() == Some(true) {
                forwarded.insert("redirect".to_string(), Value::String("follow".to_string()));
            }
        } else if key == "onError" {
            forwarded.insert("onError".to_string(), forward_config(value));
        }
        // Everything else is dropped.
    }
    Value::Object(forwarded)
}

/// Removes dangerous key names recursively without otherwise altering the value.
fn scrub(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !DANGEROUS_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), scrub(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(scrub).collect()),
        other => other.clone(),
    }
}
