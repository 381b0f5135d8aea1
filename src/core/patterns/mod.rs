// src/core/patterns/mod.rs

//! Versioned, stateless redaction rulesets.
//!
//! A ruleset maps message types to `{input, output, doublefetch, _meta}`
//! sections. Callers always receive an immutable snapshot (`Arc`), so a
//! concurrent update can never mutate rules mid-evaluation. A ruleset that
//! requires a newer DSL than this engine compiles is rejected as a whole;
//! a ruleset that does not parse is rejected as corrupted. Both rejections
//! are sticky until the next successful update.

pub mod doublefetch;
pub mod transforms;

pub use doublefetch::DoublefetchRequest;
pub use transforms::run_pipeline;

use crate::core::errors::PageVeilError;
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use strum_macros::Display;
use tracing::{info, warn};

/// The transform DSL version this engine implements.
pub const DSL_VERSION: u32 = 1;

/// One extracted field: the context key it starts from plus its pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldRule {
    pub from: String,
    #[serde(default)]
    pub transform: Vec<Vec<Value>>,
    /// Optional fields may resolve to null without dropping the message.
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputRule {
    #[serde(default)]
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleMeta {
    #[serde(default, rename = "minVersion")]
    pub min_version: Option<u32>,
}

/// The per-message-type rule sections.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MsgTypeRule {
    #[serde(default)]
    pub input: IndexMap<String, FieldRule>,
    #[serde(default)]
    pub output: OutputRule,
    #[serde(default)]
    pub doublefetch: Option<Value>,
    #[serde(default, rename = "_meta")]
    pub meta: RuleMeta,
}

impl MsgTypeRule {
    /// Runs every input pipeline against `context` and assembles the output
    /// payload. A required field resolving to null drops the whole message;
    /// a failing transform propagates as an error, which callers also treat
    /// as "no message".
    pub fn evaluate(
        &self,
        context: &serde_json::Map<String, Value>,
    ) -> Result<Option<serde_json::Map<String, Value>>, PageVeilError> {
        let mut fields = serde_json::Map::new();
        for (name, field_rule) in &self.input {
            let initial = context.get(&field_rule.from).cloned().unwrap_or(Value::Null);
            let resolved = transforms::run_pipeline(initial, &field_rule.transform)?;
            if resolved.is_null() && !field_rule.optional {
                return Ok(None);
            }
            fields.insert(name.clone(), resolved);
        }

        let mut payload = serde_json::Map::new();
        if self.output.fields.is_empty() {
            payload = fields;
        } else {
            for name in &self.output.fields {
                payload.insert(name.clone(), fields.get(name).cloned().unwrap_or(Value::Null));
            }
        }
        Ok(Some(payload))
    }
}

/// An immutable, successfully parsed ruleset.
#[derive(Debug, Default)]
pub struct LoadedRules {
    /// Content version of the pattern file, forwarded in message envelopes.
    pub version: u64,
    pub rules: IndexMap<String, MsgTypeRule>,
}

impl LoadedRules {
    pub fn rule(&self, msg_type: &str) -> Option<&MsgTypeRule> {
        self.rules.get(msg_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleSetStatus {
    NotLoadedYet,
    RejectedEngineTooOld,
    RejectedCorrupted,
    Loaded,
}

enum RuleSetState {
    NotLoadedYet,
    RejectedEngineTooOld,
    RejectedCorrupted,
    Loaded(Arc<LoadedRules>),
}

/// The active ruleset holder.
pub struct Patterns {
    state: parking_lot::RwLock<RuleSetState>,
}

impl Default for Patterns {
    fn default() -> Self {
        Self {
            state: parking_lot::RwLock::new(RuleSetState::NotLoadedYet),
        }
    }
}

impl Patterns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> RuleSetStatus {
        match *self.state.read() {
            RuleSetState::NotLoadedYet => RuleSetStatus::NotLoadedYet,
            RuleSetState::RejectedEngineTooOld => RuleSetStatus::RejectedEngineTooOld,
            RuleSetState::RejectedCorrupted => RuleSetStatus::RejectedCorrupted,
            RuleSetState::Loaded(_) => RuleSetStatus::Loaded,
        }
    }

    /// The current snapshot, if a ruleset is loaded. The snapshot is never
    /// mutated; updates swap in a fresh one.
    pub fn snapshot(&self) -> Option<Arc<LoadedRules>> {
        match &*self.state.read() {
            RuleSetState::Loaded(rules) => Some(Arc::clone(rules)),
            _ => None,
        }
    }

    /// Parses and installs a ruleset. Invalid input replaces the state with
    /// the matching rejection marker; the previous snapshot is discarded
    /// either way, since serving stale rules against new content is worse
    /// than serving none.
    pub fn update_patterns(&self, raw: Value) -> RuleSetStatus {
        match Self::parse(raw) {
            Ok(rules) => {
                info!(
                    "patterns loaded: version {}, {} message types",
                    rules.version,
                    rules.rules.len()
                );
                *self.state.write() = RuleSetState::Loaded(Arc::new(rules));
                RuleSetStatus::Loaded
            }
            Err(ParseRejection::EngineTooOld { required }) => {
                warn!(
                    "patterns require DSL version {required}, engine has {DSL_VERSION}; rejecting"
                );
                *self.state.write() = RuleSetState::RejectedEngineTooOld;
                RuleSetStatus::RejectedEngineTooOld
            }
            Err(ParseRejection::Corrupted(reason)) => {
                warn!("patterns rejected as corrupted: {reason}");
                *self.state.write() = RuleSetState::RejectedCorrupted;
                RuleSetStatus::RejectedCorrupted
            }
        }
    }

    fn parse(raw: Value) -> Result<LoadedRules, ParseRejection> {
        let Value::Object(map) = raw else {
            return Err(ParseRejection::Corrupted(
                "ruleset root is not an object".to_string(),
            ));
        };

        // A top-level `_meta` section versions the whole file.
        let mut version = 0u64;
        if let Some(meta) = map.get("_meta") {
            if let Some(required) = meta.get("minVersion").and_then(Value::as_u64) {
                if required as u32 > DSL_VERSION {
                    return Err(ParseRejection::EngineTooOld {
                        required: required as u32,
                    });
                }
            }
            version = meta.get("version").and_then(Value::as_u64).unwrap_or(0);
        }

        let mut rules = IndexMap::new();
        for (msg_type, rule_value) in map {
            if msg_type == "_meta" {
                continue;
            }
            let rule: MsgTypeRule = serde_json::from_value(rule_value).map_err(|e| {
                ParseRejection::Corrupted(format!("rule '{msg_type}' does not parse: {e}"))
            })?;
            if let Some(required) = rule.meta.min_version
                && required > DSL_VERSION
            {
                warn!(
                    "rule '{msg_type}' requires DSL version {required}; skipping just this rule"
                );
                continue;
            }
            rules.insert(msg_type, rule);
        }
        Ok(LoadedRules { version, rules })
    }

    /// Builds the doublefetch request for a message type, or `None` when the
    /// ruleset is not loaded, the type is unknown, or the rule has no
    /// doublefetch section.
    pub fn create_doublefetch_request(
        &self,
        msg_type: &str,
        url: &str,
    ) -> Option<DoublefetchRequest> {
        let snapshot = self.snapshot()?;
        let rule = snapshot.rule(msg_type)?;
        let config = rule.doublefetch.as_ref()?;
        Some(DoublefetchRequest::new(url, config))
    }
}

enum ParseRejection {
    EngineTooOld { required: u32 },
    Corrupted(String),
}

/// Downloads pattern files and swaps them into the active holder. A failed
/// download or parse leaves the previous snapshot untouched.
pub struct PatternsUpdater {
    patterns: Arc<Patterns>,
    http: reqwest::Client,
    patterns_url: String,
}

impl PatternsUpdater {
    pub fn new(patterns: Arc<Patterns>, http: reqwest::Client, patterns_url: String) -> Self {
        Self {
            patterns,
            http,
            patterns_url,
        }
    }

    pub async fn update(&self) -> Result<RuleSetStatus, PageVeilError> {
        let response = self
            .http
            .get(&self.patterns_url)
            .send()
            .await?
            .error_for_status()?;
        let raw: Value = response.json().await?;
        Ok(self.patterns.update_patterns(raw))
    }
}
