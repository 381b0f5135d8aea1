// src/core/storage/bitarray.rs

//! A bit-array split into fixed-size shards stored in a key-value database
//! under a common prefix. Shards are loaded lazily and writes are coalesced:
//! mutations only mark shards dirty, `flush` persists every dirty shard.

use crate::core::SelfCheckResult;
use crate::core::errors::PageVeilError;
use crate::core::storage::kv::KeyValueStore;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// Default shard size: 4096 bits per shard, 512 bytes, 1024 hex chars.
pub const DEFAULT_SHARD_BITS: u64 = 4096;

#[derive(Default)]
struct BitState {
    /// Shard index -> shard bytes. Only shards that were read or written live here.
    shards: HashMap<u64, Vec<u8>>,
    /// Shards mutated since the last successful flush.
    dirty: HashSet<u64>,
}

/// A persisted, sharded bit-array.
pub struct PersistedBitarray {
    store: Arc<dyn KeyValueStore>,
    key_prefix: String,
    total_bits: u64,
    shard_bits: u64,
    inner: Mutex<BitState>,
}

impl PersistedBitarray {
    /// Creates a view over the shards stored under `key_prefix`. Nothing is
    /// read until a bit is first touched.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        key_prefix: impl Into<String>,
        total_bits: u64,
        shard_bits: u64,
    ) -> Result<Self, PageVeilError> {
        if total_bits == 0 {
            return Err(PageVeilError::InvalidConfig(
                "bitarray needs at least one bit".to_string(),
            ));
        }
        if shard_bits == 0 || shard_bits % 8 != 0 {
            return Err(PageVeilError::InvalidConfig(format!(
                "shard size must be a positive multiple of 8 bits, got {shard_bits}"
            )));
        }
        Ok(Self {
            store,
            key_prefix: key_prefix.into(),
            total_bits,
            shard_bits,
            inner: Mutex::new(BitState::default()),
        })
    }

    pub fn total_bits(&self) -> u64 {
        self.total_bits
    }

    pub fn shard_count(&self) -> u64 {
        self.total_bits.div_ceil(self.shard_bits)
    }

    fn shard_key(&self, shard: u64) -> String {
        format!("{}|{}", self.key_prefix, shard)
    }

    fn shard_byte_len(&self) -> usize {
        (self.shard_bits / 8) as usize
    }

    fn locate(&self, index: u64) -> Result<(u64, usize, u8), PageVeilError> {
        if index >= self.total_bits {
            return Err(PageVeilError::Internal(format!(
                "bit index {index} out of range (total {})",
                self.total_bits
            )));
        }
        let shard = index / self.shard_bits;
        let offset = index % self.shard_bits;
        Ok((shard, (offset / 8) as usize, (offset % 8) as u8))
    }

    /// Ensures the shard is present in memory, reading it from the store if
    /// necessary. Absent or undecodable shards start zeroed; a bad payload is
    /// logged rather than propagated, matching the restore policy of
    /// dropping corrupted records.
    async fn ensure_shard(&self, shard: u64) -> Result<(), PageVeilError> {
        if self.inner.lock().shards.contains_key(&shard) {
            return Ok(());
        }
        let loaded = match self.store.get(&self.shard_key(shard)).await? {
            Some(Value::String(encoded)) => match hex::decode(&encoded) {
                Ok(bytes) if bytes.len() == self.shard_byte_len() => bytes,
                Ok(bytes) => {
                    warn!(
                        "bitarray shard {} has unexpected length {}; resetting it",
                        self.shard_key(shard),
                        bytes.len()
                    );
                    vec![0u8; self.shard_byte_len()]
                }
                Err(e) => {
                    warn!(
                        "bitarray shard {} is not valid hex ({e}); resetting it",
                        self.shard_key(shard)
                    );
                    vec![0u8; self.shard_byte_len()]
                }
            },
            Some(_) => {
                warn!(
                    "bitarray shard {} holds a non-string value; resetting it",
                    self.shard_key(shard)
                );
                vec![0u8; self.shard_byte_len()]
            }
            None => vec![0u8; self.shard_byte_len()],
        };
        self.inner.lock().shards.entry(shard).or_insert(loaded);
        Ok(())
    }

    /// Sets a single bit. The write is buffered until `flush`.
    pub async fn set(&self, index: u64) -> Result<(), PageVeilError> {
        self.set_many(&[index]).await
    }

    /// Sets a batch of bits, loading each touched shard at most once.
    pub async fn set_many(&self, indices: &[u64]) -> Result<(), PageVeilError> {
        let mut by_shard: HashMap<u64, Vec<(usize, u8)>> = HashMap::new();
        for &index in indices {
            let (shard, byte, bit) = self.locate(index)?;
            by_shard.entry(shard).or_default().push((byte, bit));
        }
        for &shard in by_shard.keys() {
            self.ensure_shard(shard).await?;
        }
        let mut state = self.inner.lock();
        for (shard, bits) in by_shard {
            let bytes = state
                .shards
                .get_mut(&shard)
                .ok_or_else(|| PageVeilError::Internal("shard vanished after load".into()))?;
            let mut changed = false;
            for (byte, bit) in bits {
                if bytes[byte] & (1 << bit) == 0 {
                    bytes[byte] |= 1 << bit;
                    changed = true;
                }
            }
            if changed {
                state.dirty.insert(shard);
            }
        }
        Ok(())
    }

    /// Tests a single bit.
    pub async fn test(&self, index: u64) -> Result<bool, PageVeilError> {
        Ok(self.test_many(&[index]).await?.into_iter().all(|b| b))
    }

    /// Tests a batch of bits, returning one flag per input index.
    pub async fn test_many(&self, indices: &[u64]) -> Result<Vec<bool>, PageVeilError> {
        let mut located = Vec::with_capacity(indices.len());
        for &index in indices {
            located.push(self.locate(index)?);
        }
        for &(shard, _, _) in &located {
            self.ensure_shard(shard).await?;
        }
        let state = self.inner.lock();
        Ok(located
            .into_iter()
            .map(|(shard, byte, bit)| {
                state
                    .shards
                    .get(&shard)
                    .is_some_and(|bytes| bytes[byte] & (1 << bit) != 0)
            })
            .collect())
    }

    /// Persists every dirty shard. On a storage error the dirty set is kept
    /// so the next flush retries the remaining shards.
    pub async fn flush(&self) -> Result<(), PageVeilError> {
        let pending: Vec<(u64, String)> = {
            let state = self.inner.lock();
            state
                .dirty
                .iter()
                .filter_map(|shard| {
                    state
                        .shards
                        .get(shard)
                        .map(|bytes| (*shard, hex::encode(bytes)))
                })
                .collect()
        };
        for (shard, encoded) in pending {
            self.store
                .set(&self.shard_key(shard), Value::String(encoded))
                .await?;
            self.inner.lock().dirty.remove(&shard);
        }
        Ok(())
    }

    /// Deletes every shard key belonging to this bit-array.
    pub async fn destroy(&self) -> Result<(), PageVeilError> {
        for shard in 0..self.shard_count() {
            self.store.delete(&self.shard_key(shard)).await?;
        }
        let mut state = self.inner.lock();
        state.shards.clear();
        state.dirty.clear();
        Ok(())
    }

    pub fn self_checks(&self) -> SelfCheckResult {
        let mut result = SelfCheckResult::default();
        let state = self.inner.lock();
        for (shard, bytes) in &state.shards {
            if *shard >= self.shard_count() {
                result.error(format!("loaded shard {shard} is out of range"));
            }
            if bytes.len() != self.shard_byte_len() {
                result.error(format!(
                    "shard {shard} has {} bytes, expected {}",
                    bytes.len(),
                    self.shard_byte_len()
                ));
            }
        }
        for shard in &state.dirty {
            if !state.shards.contains_key(shard) {
                result.error(format!("dirty shard {shard} is not loaded"));
            }
        }
        if !state.dirty.is_empty() {
            result.warn(format!("{} shard(s) awaiting flush", state.dirty.len()));
        }
        result
    }
}
