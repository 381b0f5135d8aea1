// src/core/storage/hashes.rs

//! A persisted set of 32-bit hashes with per-entry expiry, used for
//! cooldown bookkeeping. The whole set lives in one storage blob
//! (`[{h, expireAt}, …]`); flushes are serialized through a single-writer
//! region and writes are batched by marking the set dirty.

use crate::core::clock::Clock;
use crate::core::errors::PageVeilError;
use crate::core::storage::kv::KeyValueStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedHashEntry {
    h: u32,
    #[serde(rename = "expireAt")]
    expire_at: u64,
}

/// A TTL'd hashed-string set with batched, serialized persistence.
pub struct PersistedHashes {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    storage_key: String,
    /// Entries whose `expire_at` lies further than this beyond `now` are
    /// treated as clock-jump artifacts and swept.
    max_ttl_ms: u64,
    entries: parking_lot::Mutex<HashMap<u32, u64>>,
    dirty: AtomicBool,
    flush_lock: AsyncMutex<()>,
}

impl PersistedHashes {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        storage_key: impl Into<String>,
        max_ttl_ms: u64,
    ) -> Self {
        Self {
            store,
            clock,
            storage_key: storage_key.into(),
            max_ttl_ms,
            entries: parking_lot::Mutex::new(HashMap::new()),
            dirty: AtomicBool::new(false),
            flush_lock: AsyncMutex::new(()),
        }
    }

    /// Loads the persisted blob, dropping records that do not parse and
    /// sweeping anything already expired or outside the clock-jump window.
    pub async fn open(&self) -> Result<(), PageVeilError> {
        let raw = self.store.get(&self.storage_key).await?;
        let mut loaded: HashMap<u32, u64> = HashMap::new();
        if let Some(value) = raw {
            match serde_json::from_value::<Vec<Value>>(value) {
                Ok(items) => {
                    for item in items {
                        match serde_json::from_value::<PersistedHashEntry>(item) {
                            Ok(entry) => {
                                loaded.insert(entry.h, entry.expire_at);
                            }
                            Err(e) => {
                                warn!(
                                    "persisted hashes '{}': dropping unreadable entry: {e}",
                                    self.storage_key
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        "persisted hashes '{}': blob is not a list, starting empty: {e}",
                        self.storage_key
                    );
                }
            }
        }
        *self.entries.lock() = loaded;
        self.sweep();
        Ok(())
    }

    /// Inserts a hash with its expiry. Returns whether it was newly
    /// inserted; an existing entry keeps its original expiry.
    pub fn add(&self, hash: u32, expire_at: u64) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(&hash) {
            return false;
        }
        entries.insert(hash, expire_at);
        drop(entries);
        self.dirty.store(true, Ordering::SeqCst);
        true
    }

    pub fn has(&self, hash: u32) -> bool {
        self.entries.lock().contains_key(&hash)
    }

    pub fn delete(&self, hash: u32) -> bool {
        let removed = self.entries.lock().remove(&hash).is_some();
        if removed {
            self.dirty.store(true, Ordering::SeqCst);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Removes entries that have expired, plus entries whose expiry lies
    /// beyond the clock-jump window.
    pub fn sweep(&self) {
        let now = self.clock.now_ms();
        let horizon = now.saturating_add(self.max_ttl_ms);
        let mut removed = 0usize;
        {
            let mut entries = self.entries.lock();
            entries.retain(|_, &mut expire_at| {
                let keep = now < expire_at && expire_at <= horizon;
                if !keep {
                    removed += 1;
                }
                keep
            });
        }
        if removed > 0 {
            debug!(
                "persisted hashes '{}': swept {removed} entries",
                self.storage_key
            );
            self.dirty.store(true, Ordering::SeqCst);
        }
    }

    /// Persists the set if it changed since the last flush. Concurrent
    /// callers are serialized; a storage failure leaves the dirty flag set
    /// so the next flush retries.
    pub async fn flush(&self) -> Result<(), PageVeilError> {
        let _guard = self.flush_lock.lock().await;
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let blob: Vec<PersistedHashEntry> = self
            .entries
            .lock()
            .iter()
            .map(|(&h, &expire_at)| PersistedHashEntry { h, expire_at })
            .collect();
        let value = serde_json::to_value(blob)?;
        if let Err(e) = self.store.set(&self.storage_key, value).await {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }
}
