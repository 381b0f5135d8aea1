// src/core/pagedb/approver.rs

//! Admission control for new pages.
//!
//! A page URL may only enter the aggregation store when (a) it is not in
//! its per-URL cooldown window and (b) it has never been marked private.
//! Cooldowns live in `PersistedHashes` keyed by a 32-bit hash of the URL;
//! private markings live in the rotating Bloom filter. URLs currently being
//! written to the filter sit in a bounded in-memory buffer so the marking
//! is visible while the storage write is in flight.

use crate::core::clock::time_to_next_utc_midnight_ms;
use crate::core::errors::PageVeilError;
use crate::core::fingerprint::hash32;
use crate::core::random::RandomSource;
use crate::core::storage::bloom::BloomFilter;
use crate::core::storage::hashes::PersistedHashes;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error};

/// Upper bound on URLs awaiting their Bloom filter write.
pub const PRIVATE_PAGES_WRITE_BUFFER_LIMIT: usize = 1000;

/// Minimum cooldown: at least until the next UTC midnight, never less than 14 hours.
const MIN_PAGE_COOLDOWN_MS: u64 = 14 * 60 * 60 * 1000;

/// Uniform jitter added on top, so cooldown expirations do not align.
const PAGE_COOLDOWN_JITTER_MS: u64 = 2 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Accepted,
    Rejected(&'static str),
}

impl ApprovalDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ApprovalDecision::Accepted)
    }
}

pub struct NewPageApprover {
    hashes: Arc<PersistedHashes>,
    bloom: Arc<BloomFilter>,
    random: Arc<dyn RandomSource>,
    write_buffer: parking_lot::Mutex<HashSet<String>>,
}

impl NewPageApprover {
    pub fn new(
        hashes: Arc<PersistedHashes>,
        bloom: Arc<BloomFilter>,
        random: Arc<dyn RandomSource>,
    ) -> Self {
        Self {
            hashes,
            bloom,
            random,
            write_buffer: parking_lot::Mutex::new(HashSet::new()),
        }
    }

    /// Decides whether a page may be tracked. Acceptance immediately starts
    /// the URL's cooldown, so a second sighting before the cooldown expires
    /// is rejected even if the page never completes.
    pub async fn allow_creation(
        &self,
        url: &str,
        now_ms: u64,
    ) -> Result<ApprovalDecision, PageVeilError> {
        let hash = hash32(url.as_bytes());
        if self.hashes.has(hash) {
            return Ok(ApprovalDecision::Rejected("page is in cooldown"));
        }
        if self.write_buffer.lock().contains(url) {
            return Ok(ApprovalDecision::Rejected("page is marked private"));
        }
        if self.bloom.might_contain(url, true).await? {
            return Ok(ApprovalDecision::Rejected("page is marked private"));
        }

        let expire_at = self.determine_end_of_page_cooldown(now_ms);
        self.hashes.add(hash, expire_at);
        self.hashes.flush().await?;
        debug!("approved page, cooldown until {expire_at}: {url}");
        Ok(ApprovalDecision::Accepted)
    }

    /// `ceil(now + max(timeToNextUTCMidnight, 14h) + uniform(0, 2h))`.
    pub fn determine_end_of_page_cooldown(&self, now_ms: u64) -> u64 {
        let base = time_to_next_utc_midnight_ms(now_ms).max(MIN_PAGE_COOLDOWN_MS);
        let jitter = self.random.uniform(0.0, PAGE_COOLDOWN_JITTER_MS as f64);
        (now_ms as f64 + base as f64 + jitter).ceil() as u64
    }

    /// Permanently marks a URL private. The write buffer keeps the marking
    /// visible while the Bloom filter write is in flight; on overflow the
    /// buffer is reset, trading a transient admission gap for boundedness.
    pub async fn mark_private(&self, url: &str) -> Result<(), PageVeilError> {
        {
            let mut buffer = self.write_buffer.lock();
            if buffer.len() >= PRIVATE_PAGES_WRITE_BUFFER_LIMIT {
                error!(
                    "private pages write buffer overflowed ({} entries); resetting it",
                    buffer.len()
                );
                buffer.clear();
            }
            buffer.insert(url.to_string());
        }
        let result = self.bloom.add(url).await;
        self.write_buffer.lock().remove(url);
        result
    }

    /// Membership check across the buffer and the filter.
    pub async fn is_marked_private(&self, url: &str) -> Result<bool, PageVeilError> {
        if self.write_buffer.lock().contains(url) {
            return Ok(true);
        }
        self.bloom.might_contain(url, false).await
    }
}
