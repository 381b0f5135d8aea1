// src/core/reporting/alive.rs

//! The alive signal: a coarse periodic health ping.
//!
//! The interesting privacy problem is the browser configuration attached to
//! it. A rare configuration (exotic OS + locale + version) identifies a
//! user, so the configuration is only reported once the quorum confirms
//! that enough other clients share the same fingerprint. Without consent,
//! every field degrades to `"--"`, not just the rare one: the combination
//! is what identifies.

use crate::config::BrowserInfo;
use crate::core::errors::PageVeilError;
use crate::core::patterns::Patterns;
use crate::core::quorum::QuorumChecker;
use crate::core::reporting::messages::{MessageFactory, REDACTED};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

pub struct AliveCheck {
    quorum: Arc<QuorumChecker>,
    factory: Arc<MessageFactory>,
    patterns: Arc<Patterns>,
    browser: BrowserInfo,
}

impl AliveCheck {
    pub fn new(
        quorum: Arc<QuorumChecker>,
        factory: Arc<MessageFactory>,
        patterns: Arc<Patterns>,
        browser: BrowserInfo,
    ) -> Self {
        Self {
            quorum,
            factory,
            patterns,
            browser,
        }
    }

    /// Builds the alive message for the given (already sanitized) country
    /// and trusted hour. The quorum ballot is the full configuration
    /// including the country; the same ballot is voted on at most once, so
    /// repeated alive messages within one config cost one increment total.
    pub async fn generate_message(
        &self,
        ctry: &str,
        hour: &str,
    ) -> Result<Value, PageVeilError> {
        let ballot = json!({
            "browser": self.browser.browser,
            "version": self.browser.version,
            "os": self.browser.os,
            "language": self.browser.language,
            "ctry": ctry,
        });
        let consent = self.quorum.check(&ballot).await?;

        let payload = if consent {
            json!({
                "browser": self.browser.browser,
                "version": self.browser.version,
                "os": self.browser.os,
                "language": self.browser.language,
                "ctry": ctry,
                "t": hour,
            })
        } else {
            debug!("alive config lacks quorum; sending a fully redacted payload");
            json!({
                "browser": REDACTED,
                "version": REDACTED,
                "os": REDACTED,
                "language": REDACTED,
                "ctry": REDACTED,
                "t": hour,
            })
        };

        let ver = self.patterns.snapshot().map(|s| s.version).unwrap_or(0);
        let envelope_ctry = if consent { ctry } else { REDACTED };
        Ok(self
            .factory
            .build("alive", ver, envelope_ctry, hour, payload))
    }
}
