// src/core/storage/session.rs

//! A crash-safe, batched cache over a sandboxed session key-value API.
//!
//! The session API may be unavailable (private windows, stripped-down
//! hosts); the wrapper then degrades to a purely in-memory map with the same
//! surface. Writes are debounced: the first dirty marking starts a 300 ms
//! hard deadline, and every further change pushes a 50 ms debounce window,
//! whichever fires first triggers the flush. A failed flush restores the
//! removal set and marks every cached key dirty, forcing a full resync on
//! the next attempt.

use crate::core::SelfCheckResult;
use crate::core::errors::PageVeilError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Debounce window after the most recent change.
pub const MIN_FLUSH_INTERVAL_MS: u64 = 50;
/// Hard deadline measured from the first dirty marking.
pub const HARD_FLUSH_INTERVAL_MS: u64 = 300;
/// Pending changes older than this without a scheduled flush fail self-checks.
const STALE_PENDING_MS: u64 = 5000;

/// The sandboxed session storage contract. Eventual consistency, opaque
/// quota errors.
#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn session_get(&self, prefix: &str) -> Result<HashMap<String, Value>, PageVeilError>;
    async fn session_set(&self, entries: HashMap<String, Value>) -> Result<(), PageVeilError>;
    async fn session_remove(&self, keys: &[String]) -> Result<(), PageVeilError>;
}

#[derive(Default)]
struct SessionState {
    cache: HashMap<String, Value>,
    added: HashSet<String>,
    removed: HashSet<String>,
    first_dirty_at: Option<Instant>,
    last_change_at: Option<Instant>,
    flush_scheduled: bool,
}

impl SessionState {
    fn mark_changed(&mut self, now: Instant) {
        self.first_dirty_at.get_or_insert(now);
        self.last_change_at = Some(now);
    }

    fn has_pending(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

/// Batched, crash-safe key-value cache with a namespaced key prefix.
pub struct SessionStorageWrapper {
    api: Option<Arc<dyn SessionApi>>,
    namespace: String,
    state: parking_lot::Mutex<SessionState>,
    flush_lock: AsyncMutex<()>,
    active: AtomicBool,
}

impl SessionStorageWrapper {
    /// `api = None` selects the in-memory fallback.
    pub fn new(api: Option<Arc<dyn SessionApi>>, namespace: &str, version: u32) -> Self {
        Self {
            api,
            namespace: format!("{namespace}::v{version}::"),
            state: parking_lot::Mutex::new(SessionState::default()),
            flush_lock: AsyncMutex::new(()),
            active: AtomicBool::new(false),
        }
    }

    /// Loads every namespaced key from the session area into the cache.
    pub async fn init(&self) -> Result<(), PageVeilError> {
        if let Some(api) = &self.api {
            let entries = api.session_get(&self.namespace).await?;
            let mut state = self.state.lock();
            state.cache.clear();
            for (key, value) in entries {
                if let Some(bare) = key.strip_prefix(&self.namespace) {
                    state.cache.insert(bare.to_string(), value);
                }
            }
        }
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.lock().cache.get(key).cloned()
    }

    pub fn set(self: &Arc<Self>, key: impl Into<String>, value: Value) {
        let key = key.into();
        {
            let mut state = self.state.lock();
            state.cache.insert(key.clone(), value);
            state.removed.remove(&key);
            state.added.insert(key);
            state.mark_changed(Instant::now());
        }
        self.schedule_flush();
    }

    pub fn remove(self: &Arc<Self>, key: &str) {
        {
            let mut state = self.state.lock();
            state.cache.remove(key);
            state.added.remove(key);
            state.removed.insert(key.to_string());
            state.mark_changed(Instant::now());
        }
        self.schedule_flush();
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().cache.keys().cloned().collect()
    }

    /// Arms the debounce timer unless one is already pending. The spawned
    /// task re-sleeps until both the debounce window and the hard deadline
    /// allow the flush, then runs it once.
    fn schedule_flush(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.flush_scheduled || !state.has_pending() {
                return;
            }
            state.flush_scheduled = true;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let wait = {
                    let state = this.state.lock();
                    let now = Instant::now();
                    let debounce = state
                        .last_change_at
                        .map(|t| t + Duration::from_millis(MIN_FLUSH_INTERVAL_MS));
                    let deadline = state
                        .first_dirty_at
                        .map(|t| t + Duration::from_millis(HARD_FLUSH_INTERVAL_MS));
                    let due = match (debounce, deadline) {
                        (Some(d), Some(h)) => d.min(h),
                        (Some(d), None) => d,
                        (None, Some(h)) => h,
                        (None, None) => now,
                    };
                    if due <= now {
                        None
                    } else {
                        Some(due - now)
                    }
                };
                match wait {
                    Some(duration) => tokio::time::sleep(duration).await,
                    None => break,
                }
            }
            this.state.lock().flush_scheduled = false;
            if this.active.load(Ordering::SeqCst) {
                if let Err(e) = this.flush().await {
                    warn!("session flush failed, will resync: {e}");
                }
            }
        });
    }

    /// Writes pending additions and removals through the session API. On
    /// failure the pending sets are restored and every cached key is marked
    /// dirty so the next flush performs a full resync.
    pub async fn flush(self: &Arc<Self>) -> Result<(), PageVeilError> {
        let _guard = self.flush_lock.lock().await;
        let (to_set, to_remove) = {
            let mut state = self.state.lock();
            if !state.has_pending() {
                return Ok(());
            }
            let to_set: HashMap<String, Value> = state
                .added
                .iter()
                .filter_map(|k| {
                    state
                        .cache
                        .get(k)
                        .map(|v| (format!("{}{}", self.namespace, k), v.clone()))
                })
                .collect();
            let to_remove: Vec<String> = state
                .removed
                .iter()
                .map(|k| format!("{}{}", self.namespace, k))
                .collect();
            state.added.clear();
            state.removed.clear();
            state.first_dirty_at = None;
            state.last_change_at = None;
            (to_set, to_remove)
        };

        let Some(api) = &self.api else {
            // In-memory fallback: the cache itself is the storage.
            return Ok(());
        };

        let result = async {
            if !to_set.is_empty() {
                api.session_set(to_set).await?;
            }
            if !to_remove.is_empty() {
                api.session_remove(&to_remove).await?;
            }
            Ok::<(), PageVeilError>(())
        }
        .await;

        if let Err(e) = result {
            let mut state = self.state.lock();
            for key in &to_remove {
                if let Some(bare) = key.strip_prefix(&self.namespace) {
                    state.removed.insert(bare.to_string());
                }
            }
            let present: Vec<String> = state.cache.keys().cloned().collect();
            for key in present {
                state.added.insert(key);
            }
            state.mark_changed(Instant::now());
            drop(state);
            self.schedule_flush();
            return Err(e);
        }
        debug!("session flush committed");
        Ok(())
    }

    /// Final flush and deactivation. Late timer callbacks become no-ops.
    pub async fn unload(self: &Arc<Self>) {
        if let Err(e) = self.flush().await {
            warn!("final session flush failed: {e}");
        }
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn self_checks(&self) -> SelfCheckResult {
        let mut result = SelfCheckResult::default();
        let state = self.state.lock();
        if state.has_pending()
            && !state.flush_scheduled
            && state
                .first_dirty_at
                .is_some_and(|t| t.elapsed() > Duration::from_millis(STALE_PENDING_MS))
        {
            result.error("changes pending for more than 5s without a scheduled flush");
        }
        for key in state.added.intersection(&state.removed) {
            result.error(format!("key '{key}' is marked both added and removed"));
        }
        for key in &state.added {
            if !state.cache.contains_key(key) {
                result.error(format!("added key '{key}' is missing from the cache"));
            }
        }
        for key in &state.removed {
            if state.cache.contains_key(key) {
                result.error(format!("removed key '{key}' is still present in the cache"));
            }
        }
        result
    }
}
