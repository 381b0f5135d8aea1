// src/core/pagedb/mod.rs

//! The page aggregation store.
//!
//! PageDB holds candidate pages between first sighting and expiry-driven
//! promotion. Entries are lazily loaded (`url -> None` until first read),
//! mutations run inside a single-writer region, and persisted writes are
//! batched through the dirty set. The expiration index stays sorted by
//! creation time, so expiry only ever inspects the head.

pub mod approver;
pub mod page;

pub use approver::{ApprovalDecision, NewPageApprover, PRIVATE_PAGES_WRITE_BUFFER_LIMIT};
pub use page::{Aggregator, PageEntry, PageStatus, SearchInfo, merge_pages, normalize_url};

use crate::core::SelfCheckResult;
use crate::core::clock::{Clock, ONE_DAY_MS};
use crate::core::errors::PageVeilError;
use crate::core::storage::kv::KeyValueStore;
use futures::future::try_join_all;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

/// Stored key count above which the whole store is wiped on restore.
pub const MAX_ALLOWED_MAPPINGS: usize = 2000;

/// Emergency cleanup deletes in batches of this size.
const CLEANUP_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone)]
struct ExpirationEntry {
    url: String,
    created_at: u64,
}

#[derive(Default)]
struct PageDbState {
    /// `url -> entry`; `None` until the persisted value is first needed.
    aggregated: HashMap<String, Option<PageEntry>>,
    urls_to_keys: HashMap<String, String>,
    dirty: HashSet<String>,
    /// Sorted ascending by `created_at`.
    expiration: Vec<ExpirationEntry>,
}

#[derive(Debug, Clone, Copy)]
pub struct AcquireOptions {
    pub min_page_cooldown_in_ms: u64,
    pub force_expiration: bool,
    pub max_entries_to_check: usize,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            min_page_cooldown_in_ms: 30 * 60 * 1000,
            force_expiration: false,
            max_entries_to_check: 50,
        }
    }
}

pub struct PageDb {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    approver: Arc<NewPageApprover>,
    /// Single-writer region: every mutating operation, storage awaits
    /// included, runs under this lock.
    state: AsyncMutex<PageDbState>,
}

impl PageDb {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        approver: Arc<NewPageApprover>,
    ) -> Self {
        Self {
            store,
            clock,
            approver,
            state: AsyncMutex::new(PageDbState::default()),
        }
    }

    fn storage_key(created_at: u64, url: &str) -> String {
        format!("{created_at}:{url}")
    }

    /// Rebuilds the in-memory indexes from storage. Corrupted keys, keys
    /// from the future and duplicate URLs are deleted; values stay lazy.
    pub async fn restore(&self) -> Result<(), PageVeilError> {
        let keys = self.store.keys().await?;
        if keys.len() > MAX_ALLOWED_MAPPINGS {
            return self.emergency_cleanup(keys).await;
        }

        let now = self.clock.now_ms();
        let mut state = self.state.lock().await;
        for key in keys {
            let Some((created_str, url)) = key.split_once(':') else {
                warn!("page store: deleting malformed key '{key}'");
                self.store.delete(&key).await?;
                continue;
            };
            let Ok(created_at) = created_str.parse::<u64>() else {
                warn!("page store: deleting key with bad timestamp '{key}'");
                self.store.delete(&key).await?;
                continue;
            };
            if created_at > now + ONE_DAY_MS {
                warn!("page store: deleting key from the future '{key}' (clock jump)");
                self.store.delete(&key).await?;
                continue;
            }
            if let Some(existing) = state.urls_to_keys.get(url).cloned() {
                // URL uniqueness across keys: keep the newer record.
                let existing_created = existing
                    .split_once(':')
                    .and_then(|(c, _)| c.parse::<u64>().ok())
                    .unwrap_or(0);
                if created_at <= existing_created {
                    self.store.delete(&key).await?;
                    continue;
                }
                self.store.delete(&existing).await?;
                state.expiration.retain(|e| e.url != url);
            }
            state.urls_to_keys.insert(url.to_string(), key.clone());
            state.aggregated.insert(url.to_string(), None);
            state.expiration.push(ExpirationEntry {
                url: url.to_string(),
                created_at,
            });
        }
        state.expiration.sort_by_key(|e| e.created_at);
        Ok(())
    }

    async fn emergency_cleanup(&self, keys: Vec<String>) -> Result<(), PageVeilError> {
        warn!(
            "page store holds {} keys, above the {MAX_ALLOWED_MAPPINGS} limit; clearing it",
            keys.len()
        );
        for chunk in keys.chunks(CLEANUP_BATCH_SIZE) {
            try_join_all(chunk.iter().map(|key| self.store.delete(key))).await?;
        }
        let mut state = self.state.lock().await;
        *state = PageDbState::default();
        Ok(())
    }

    /// Fetches the persisted value for a lazily indexed URL.
    async fn load_entry(
        &self,
        state: &mut PageDbState,
        url: &str,
    ) -> Result<(), PageVeilError> {
        if !matches!(state.aggregated.get(url), Some(None)) {
            return Ok(());
        }
        let Some(key) = state.urls_to_keys.get(url) else {
            return Ok(());
        };
        let loaded = match self.store.get(key).await? {
            Some(value) => match serde_json::from_value::<PageEntry>(value) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("page store: dropping unreadable entry for '{url}': {e}");
                    None
                }
            },
            None => None,
        };
        if let Some(entry) = loaded {
            state.aggregated.insert(url.to_string(), Some(entry));
        }
        Ok(())
    }

    /// Ingests the currently open pages. Unseen URLs go through the
    /// approver; tracked URLs are merged when they are the active tab or
    /// carry a newer observation.
    pub async fn update_pages(
        &self,
        open_pages: Vec<PageEntry>,
        active_url: Option<&str>,
    ) -> Result<(), PageVeilError> {
        let now = self.clock.now_ms();
        let active = active_url.map(normalize_url);
        let mut state = self.state.lock().await;

        // Duplicates within the same snapshot (several tabs on one URL) are
        // folded before they touch the store.
        let mut grouped: IndexMap<String, Vec<PageEntry>> = IndexMap::new();
        for mut page in open_pages {
            page.url = normalize_url(&page.url);
            grouped.entry(page.url.clone()).or_default().push(page);
        }

        for (url, group) in grouped {
            let Some(mut incoming) = merge_pages(group) else {
                continue;
            };

            if state.urls_to_keys.contains_key(&url) {
                self.load_entry(&mut state, &url).await?;
                let Some(Some(stored)) = state.aggregated.get(&url) else {
                    continue;
                };
                let is_active = active.as_deref() == Some(url.as_str());
                let is_newer = incoming.last_updated_at > stored.last_updated_at;
                if !is_active && !is_newer {
                    continue;
                }
                let merged = merge_pages(vec![stored.clone(), incoming]);
                if let Some(merged) = merged {
                    state.aggregated.insert(url.clone(), Some(merged));
                    state.dirty.insert(url);
                }
            } else {
                match self.approver.allow_creation(&url, now).await? {
                    ApprovalDecision::Rejected(reason) => {
                        debug!("not tracking '{url}': {reason}");
                    }
                    ApprovalDecision::Accepted => {
                        if incoming.aggregator.first_seen_at == 0 {
                            incoming.aggregator.first_seen_at = now;
                        }
                        incoming.aggregator.last_seen_at =
                            incoming.aggregator.last_seen_at.max(now);
                        incoming.aggregator.last_written_at = None;
                        let key = Self::storage_key(now, &url);
                        state.urls_to_keys.insert(url.clone(), key);
                        state.aggregated.insert(url.clone(), Some(incoming));
                        let position = state
                            .expiration
                            .iter()
                            .position(|e| e.created_at > now)
                            .unwrap_or(state.expiration.len());
                        state.expiration.insert(
                            position,
                            ExpirationEntry {
                                url: url.clone(),
                                created_at: now,
                            },
                        );
                        state.dirty.insert(url);
                    }
                }
            }
        }

        self.flush_locked(&mut state).await
    }

    /// Writes every dirty entry. `last_written_at` moves forward only on a
    /// successful write, which keeps flushes monotonic; a storage error
    /// leaves the remaining entries dirty for the next flush.
    async fn flush_locked(&self, state: &mut PageDbState) -> Result<(), PageVeilError> {
        let now = self.clock.now_ms();
        let urls: Vec<String> = state.dirty.iter().cloned().collect();
        for url in urls {
            let Some(key) = state.urls_to_keys.get(&url).cloned() else {
                state.dirty.remove(&url);
                continue;
            };
            let Some(Some(entry)) = state.aggregated.get_mut(&url) else {
                state.dirty.remove(&url);
                continue;
            };
            entry.aggregator.last_written_at = Some(now);
            let value = serde_json::to_value(&*entry)?;
            if let Err(e) = self.store.set(&key, value).await {
                entry.aggregator.last_written_at = None;
                return Err(e);
            }
            state.dirty.remove(&url);
        }
        Ok(())
    }

    /// Flushes outside of an ingest, for hosts that want an explicit sync point.
    pub async fn flush(&self) -> Result<(), PageVeilError> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state).await
    }

    /// Pops pages whose cooldown has elapsed. Consumed pages are always
    /// removed from memory and storage; only complete, indexable, non-SERP
    /// pages are returned as promoted. Unindexable pages and SERPs are
    /// marked private forever on the way out.
    pub async fn acquire_expired_pages(
        &self,
        opts: AcquireOptions,
    ) -> Result<Vec<PageEntry>, PageVeilError> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock().await;
        let mut promoted = Vec::new();
        let mut checked = 0usize;

        while checked < opts.max_entries_to_check {
            let Some(head) = state.expiration.first().cloned() else {
                break;
            };
            let is_expired = opts.force_expiration
                || now >= head.created_at.saturating_add(opts.min_page_cooldown_in_ms);
            if !is_expired {
                break;
            }
            checked += 1;
            state.expiration.remove(0);
            let url = head.url;
            let key = state.urls_to_keys.remove(&url);
            let cached = state.aggregated.remove(&url).flatten();
            state.dirty.remove(&url);
            let Some(key) = key else {
                continue;
            };

            let entry = match cached {
                Some(entry) => Some(entry),
                None => match self.store.get(&key).await? {
                    Some(value) => serde_json::from_value::<PageEntry>(value)
                        .map_err(|e| {
                            warn!("page store: unreadable entry at expiry for '{url}': {e}");
                            e
                        })
                        .ok(),
                    None => None,
                },
            };

            if let Err(e) = self.store.delete(&key).await {
                warn!("page store: failed to delete consumed key '{key}': {e}");
            }

            let Some(entry) = entry else {
                continue;
            };
            if entry.pre_doublefetch.is_none() || entry.status != PageStatus::Complete {
                debug!("dropping incomplete page at expiry: {url}");
                continue;
            }
            if entry.is_noindex() {
                debug!("marking noindex page private: {url}");
                if let Err(e) = self.approver.mark_private(&url).await {
                    warn!("failed to mark '{url}' private: {e}");
                }
                continue;
            }
            if entry.is_search_results_page() {
                debug!("marking SERP private: {url}");
                if let Err(e) = self.approver.mark_private(&url).await {
                    warn!("failed to mark '{url}' private: {e}");
                }
                continue;
            }
            promoted.push(entry);
        }
        Ok(promoted)
    }

    pub async fn tracked_page_count(&self) -> usize {
        self.state.lock().await.urls_to_keys.len()
    }

    /// Index consistency: the three structures must agree on the tracked
    /// URL set, and the expiration sequence must be sorted.
    pub async fn self_checks(&self) -> SelfCheckResult {
        let mut result = SelfCheckResult::default();
        let state = self.state.lock().await;
        let aggregated: HashSet<&String> = state.aggregated.keys().collect();
        let mapped: HashSet<&String> = state.urls_to_keys.keys().collect();
        let expiring: HashSet<&String> = state.expiration.iter().map(|e| &e.url).collect();
        if aggregated != mapped {
            result.error("aggregated pages and key mapping disagree");
        }
        if aggregated != expiring {
            result.error("aggregated pages and expiration index disagree");
        }
        if state.expiration.windows(2).any(|w| w[0].created_at > w[1].created_at) {
            result.error("expiration index is not sorted by creation time");
        }
        for url in &state.dirty {
            if !state.urls_to_keys.contains_key(url) {
                result.error(format!("dirty url '{url}' is not tracked"));
            }
        }
        result
    }
}
