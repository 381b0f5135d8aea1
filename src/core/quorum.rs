// src/core/quorum.rs

//! Population-level anonymity gate.
//!
//! A record is only released once enough independent clients voted for the
//! same fingerprint. This client's obligations are narrow but strict: vote
//! at most once per fingerprint, and never let a static configuration creep
//! over the threshold through repeated self-votes. Both are enforced by
//! caching the protocol state in session storage keyed by the deterministic
//! stringification of the ballot.

use crate::core::errors::PageVeilError;
use crate::core::fingerprint::stable_stringify;
use crate::core::storage::session::SessionStorageWrapper;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

/// The remote quorum service contract. State is intentionally remote-only.
#[async_trait]
pub trait QuorumService: Send + Sync {
    async fn send_quorum_increment(&self, text: &str) -> Result<(), PageVeilError>;
    async fn check_quorum_consent(&self, text: &str) -> Result<bool, PageVeilError>;
}

pub struct QuorumChecker {
    service: Arc<dyn QuorumService>,
    cache: Arc<SessionStorageWrapper>,
}

impl QuorumChecker {
    pub fn new(service: Arc<dyn QuorumService>, cache: Arc<SessionStorageWrapper>) -> Self {
        Self { service, cache }
    }

    fn cache_key(text: &str) -> String {
        format!("quorum::{text}")
    }

    /// Votes for and checks the ballot's fingerprint. The increment is sent
    /// at most once per fingerprint across restarts: a `pending` record is
    /// committed before the increment goes out, so a crash between the two
    /// steps skips straight to the consent check on retry.
    pub async fn check(&self, ballot: &Value) -> Result<bool, PageVeilError> {
        self.check_text(&stable_stringify(ballot)).await
    }

    pub async fn check_text(&self, text: &str) -> Result<bool, PageVeilError> {
        let key = Self::cache_key(text);
        let mut increment_needed = true;
        if let Some(record) = self.cache.get(&key) {
            if let Some(consent) = record.get("consent").and_then(Value::as_bool) {
                debug!("quorum outcome served from cache");
                return Ok(consent);
            }
            if record.get("pending").and_then(Value::as_bool) == Some(true) {
                // The increment may or may not have reached the service;
                // not voting again is the safe side of at-most-once.
                increment_needed = false;
            }
        }

        if increment_needed {
            self.cache.set(key.clone(), json!({ "pending": true }));
            self.cache.flush().await?;
            self.service.send_quorum_increment(text).await?;
        }

        let consent = self.service.check_quorum_consent(text).await?;
        self.cache.set(key, json!({ "consent": consent }));
        self.cache.flush().await?;
        Ok(consent)
    }
}
