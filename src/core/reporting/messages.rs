// src/core/reporting/messages.rs

//! Message envelopes and the outer collaborator contracts for sending them.

use crate::core::clock::TrustedClock;
use crate::core::errors::PageVeilError;
use crate::core::random::RandomSource;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

/// Placeholder for everything that may not be reported.
pub const REDACTED: &str = "--";

/// The single-shot, best-effort transport. Errors are opaque.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: Value) -> Result<(), PageVeilError>;
}

/// Supplies the country the client reports from.
#[async_trait]
pub trait CountryProvider: Send + Sync {
    async fn current_country(&self) -> Result<String, PageVeilError>;
}

/// Assembles outgoing messages with the shared envelope:
/// `{action, ver, "anti-duplicates", ts, ctry, payload}`.
pub struct MessageFactory {
    trusted_clock: Arc<dyn TrustedClock>,
    random: Arc<dyn RandomSource>,
    allowed_country_codes: Vec<String>,
}

impl MessageFactory {
    pub fn new(
        trusted_clock: Arc<dyn TrustedClock>,
        random: Arc<dyn RandomSource>,
        allowed_country_codes: Vec<String>,
    ) -> Self {
        Self {
            trusted_clock,
            random,
            allowed_country_codes,
        }
    }

    /// Countries outside the allowed population are reported as `"--"`:
    /// a small country code is itself identifying.
    pub fn sanitize_country(&self, raw: &str) -> String {
        let candidate = raw.trim().to_lowercase();
        if self.allowed_country_codes.iter().any(|c| *c == candidate) {
            candidate
        } else {
            REDACTED.to_string()
        }
    }

    pub fn day_timestamp(&self) -> String {
        self.trusted_clock.time_as_yyyymmdd()
    }

    pub fn hour_timestamp(&self) -> String {
        self.trusted_clock.time_as_yyyymmddhh()
    }

    pub fn build(&self, action: &str, ver: u64, ctry: &str, ts: &str, payload: Value) -> Value {
        json!({
            "action": action,
            "ver": ver,
            "anti-duplicates": self.random.next_u32(),
            "ts": ts,
            "ctry": ctry,
            "payload": payload,
        })
    }
}
