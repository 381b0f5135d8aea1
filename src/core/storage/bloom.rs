// src/core/storage/bloom.rs

//! A rotating one-hashing Bloom filter (OHBF) over persisted bit-arrays.
//!
//! One 64-bit hash of the key is reduced against K partitions; partition `i`
//! contributes the bit `sum(partitions[0..i]) + (hash % partitions[i])`. The
//! partition sizes must be pairwise coprime for the one-hashing construction
//! to approximate K independent hash functions.
//!
//! The active filter is the union of up to `max_generations` co-existing
//! generations, each a bit-array bound to its creation timestamp. Rotation
//! appends a fresh generation and evicts the oldest, which bounds the false
//! positive rate while keeping entries alive for
//! `rotation_interval * max_generations`.

use crate::core::SelfCheckResult;
use crate::core::errors::PageVeilError;
use crate::core::fingerprint::hash64;
use crate::core::storage::bitarray::{DEFAULT_SHARD_BITS, PersistedBitarray};
use crate::core::storage::kv::KeyValueStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Version tag embedded in every persisted key. Bumping it invalidates all
/// previously written generations on the next `ready` pass.
pub const BLOOM_FORMAT_VERSION: u32 = 2;

/// Static configuration of a rotating Bloom filter.
#[derive(Debug, Clone)]
pub struct BloomFilterConfig {
    /// Name component of the persisted keys. Must not contain `|`.
    pub name: String,
    /// Partition sizes in bits. All positive, ideally pairwise coprime.
    pub partitions: Vec<u32>,
    /// How many generations co-exist. `1` with a zero interval disables rotation.
    pub max_generations: usize,
    /// Age at which the newest generation is considered stale and a new one is appended.
    pub rotation_interval_ms: u64,
    /// Bits per persisted shard.
    pub shard_bits: u64,
}

impl BloomFilterConfig {
    pub fn new(name: impl Into<String>, partitions: Vec<u32>) -> Self {
        Self {
            name: name.into(),
            partitions,
            max_generations: 1,
            rotation_interval_ms: 0,
            shard_bits: DEFAULT_SHARD_BITS,
        }
    }

    pub fn with_rotation(mut self, max_generations: usize, rotation_interval_ms: u64) -> Self {
        self.max_generations = max_generations;
        self.rotation_interval_ms = rotation_interval_ms;
        self
    }

    fn total_bits(&self) -> u64 {
        self.partitions.iter().map(|&p| p as u64).sum()
    }

    fn validate(&self) -> Result<(), PageVeilError> {
        if self.name.contains('|') {
            return Err(PageVeilError::BloomConfig(format!(
                "name '{}' must not contain '|'",
                self.name
            )));
        }
        if self.partitions.is_empty() {
            return Err(PageVeilError::BloomConfig(
                "at least one partition is required".to_string(),
            ));
        }
        if self.partitions.iter().any(|&p| p == 0) {
            return Err(PageVeilError::BloomConfig(
                "partition sizes must be positive".to_string(),
            ));
        }
        if self.max_generations == 0 {
            return Err(PageVeilError::BloomConfig(
                "max_generations must be at least 1".to_string(),
            ));
        }
        if !pairwise_coprime(&self.partitions) {
            warn!(
                "bloom filter '{}': partition sizes {:?} are not pairwise coprime; \
                 the false positive rate will be worse than configured",
                self.name, self.partitions
            );
        }
        Ok(())
    }

    /// `true` when this config describes the single-generation, never-rotating mode.
    fn rotation_disabled(&self) -> bool {
        self.max_generations == 1 && self.rotation_interval_ms == 0
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn pairwise_coprime(partitions: &[u32]) -> bool {
    for (i, &a) in partitions.iter().enumerate() {
        for &b in &partitions[i + 1..] {
            if gcd(a as u64, b as u64) != 1 {
                return false;
            }
        }
    }
    true
}

struct Generation {
    creation_epoch_ms: u64,
    bits: PersistedBitarray,
}

/// Key triage result for `ready`.
enum KeyClass {
    Valid { generation: u64 },
    ObsoleteVersion,
    Corrupted,
    Unknown,
}

/// A rotating one-hashing Bloom filter persisted in a key-value store.
pub struct BloomFilter {
    store: Arc<dyn KeyValueStore>,
    config: BloomFilterConfig,
    /// Generations sorted by creation timestamp, newest last. Guarded by an
    /// async mutex: rotation and membership updates span storage awaits.
    generations: Mutex<Vec<Generation>>,
}

impl BloomFilter {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        config: BloomFilterConfig,
    ) -> Result<Self, PageVeilError> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            generations: Mutex::new(Vec::new()),
        })
    }

    fn name_prefix(&self) -> String {
        format!("bf|{}|", self.config.name)
    }

    fn generation_prefix(&self, creation_epoch_ms: u64) -> String {
        format!(
            "bf|{}|v{}|{}",
            self.config.name, BLOOM_FORMAT_VERSION, creation_epoch_ms
        )
    }

    fn classify(&self, key: &str) -> KeyClass {
        // Expected shape: bf|<name>|v<version>|<generation>|<shard>
        let parts: Vec<&str> = key.split('|').collect();
        if parts.len() != 5 || parts[0] != "bf" || parts[1] != self.config.name {
            return KeyClass::Unknown;
        }
        let version = match parts[2].strip_prefix('v').and_then(|v| v.parse::<u32>().ok()) {
            Some(v) => v,
            None => return KeyClass::Corrupted,
        };
        if version != BLOOM_FORMAT_VERSION {
            return KeyClass::ObsoleteVersion;
        }
        match (parts[3].parse::<u64>(), parts[4].parse::<u64>()) {
            (Ok(generation), Ok(_)) => KeyClass::Valid { generation },
            _ => KeyClass::Corrupted,
        }
    }

    fn open_generation(&self, creation_epoch_ms: u64) -> Result<Generation, PageVeilError> {
        let bits = PersistedBitarray::new(
            Arc::clone(&self.store),
            self.generation_prefix(creation_epoch_ms),
            self.config.total_bits(),
            self.config.shard_bits,
        )?;
        Ok(Generation {
            creation_epoch_ms,
            bits,
        })
    }

    /// Discovers persisted generations, drops everything invalid or out of
    /// its time window, appends a fresh generation when due, and trims to
    /// `max_generations`. Must run before `add`/`might_contain`.
    pub async fn ready(&self, now_ms: u64) -> Result<(), PageVeilError> {
        let prefix = self.name_prefix();
        let all_keys = self.store.keys().await?;
        let mut valid: BTreeMap<u64, Vec<String>> = BTreeMap::new();

        for key in all_keys {
            if !key.starts_with(&prefix) {
                continue;
            }
            match self.classify(&key) {
                KeyClass::Valid { generation } => {
                    valid.entry(generation).or_default().push(key);
                }
                KeyClass::ObsoleteVersion => {
                    debug!("bloom '{}': deleting obsolete-version key {key}", self.config.name);
                    self.store.delete(&key).await?;
                }
                KeyClass::Corrupted => {
                    debug!("bloom '{}': deleting corrupted key {key}", self.config.name);
                    self.store.delete(&key).await?;
                }
                KeyClass::Unknown => {
                    warn!(
                        "bloom '{}': deleting key of unknown shape under our prefix: {key}",
                        self.config.name
                    );
                    self.store.delete(&key).await?;
                }
            }
        }

        // Generations created in the future beyond twice the rotation
        // interval can only come from a clock jump; drop them.
        let future_cutoff = now_ms.saturating_add(2 * self.config.rotation_interval_ms);
        // Generations older than the full retention window have nothing left
        // to contribute. Only applies when more than one generation co-exists.
        let expiry_cutoff = if self.config.max_generations > 1 {
            now_ms.saturating_sub(
                self.config.rotation_interval_ms * self.config.max_generations as u64,
            )
        } else {
            0
        };

        let mut kept: Vec<u64> = Vec::new();
        for (generation, keys) in valid {
            let too_new = generation > future_cutoff;
            let too_old = self.config.max_generations > 1 && generation < expiry_cutoff;
            if too_new || too_old {
                if too_new {
                    warn!(
                        "bloom '{}': discarding future generation {generation} (clock jump)",
                        self.config.name
                    );
                }
                for key in keys {
                    self.store.delete(&key).await?;
                }
            } else {
                kept.push(generation);
            }
        }
        kept.sort_unstable();

        let needs_fresh = match kept.last() {
            None => true,
            Some(&newest) => {
                !self.config.rotation_disabled()
                    && now_ms.saturating_sub(newest) >= self.config.rotation_interval_ms
            }
        };
        if needs_fresh {
            info!(
                "bloom '{}': appending generation at {now_ms} ({} existing)",
                self.config.name,
                kept.len()
            );
            kept.push(now_ms);
        }

        // Trim to the newest max_generations, deleting evicted bit-arrays.
        while kept.len() > self.config.max_generations {
            let evicted = kept.remove(0);
            debug!("bloom '{}': evicting generation {evicted}", self.config.name);
            self.open_generation(evicted)?.bits.destroy().await?;
        }

        let mut generations = self.generations.lock().await;
        generations.clear();
        for ts in kept {
            generations.push(self.open_generation(ts)?);
        }
        Ok(())
    }

    /// Bit positions for `value` under the one-hashing construction.
    fn indices(&self, value: &str) -> Vec<u64> {
        let hash = hash64(value.as_bytes());
        let mut offset = 0u64;
        let mut indices = Vec::with_capacity(self.config.partitions.len());
        for &partition in &self.config.partitions {
            indices.push(offset + hash % partition as u64);
            offset += partition as u64;
        }
        indices
    }

    /// Inserts `value` into the newest generation.
    pub async fn add(&self, value: &str) -> Result<(), PageVeilError> {
        let indices = self.indices(value);
        let generations = self.generations.lock().await;
        let newest = generations.last().ok_or_else(|| {
            PageVeilError::InvalidState("bloom filter used before ready()".to_string())
        })?;
        newest.bits.set_many(&indices).await?;
        newest.bits.flush().await
    }

    /// Tests membership from the newest generation to the oldest. When
    /// `update_ttl_if_found` is set and the hit was in an older generation,
    /// the value is re-inserted into the newest one so it survives the next
    /// rotation.
    pub async fn might_contain(
        &self,
        value: &str,
        update_ttl_if_found: bool,
    ) -> Result<bool, PageVeilError> {
        let indices = self.indices(value);
        let generations = self.generations.lock().await;
        for (position, generation) in generations.iter().rev().enumerate() {
            let hits = generation.bits.test_many(&indices).await?;
            if hits.into_iter().all(|b| b) {
                let found_in_newest = position == 0;
                if update_ttl_if_found && !found_in_newest {
                    if let Some(newest) = generations.last() {
                        newest.bits.set_many(&indices).await?;
                        newest.bits.flush().await?;
                    }
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn self_checks(&self) -> SelfCheckResult {
        let mut result = SelfCheckResult::default();
        let generations = self.generations.lock().await;
        if generations.is_empty() {
            result.error("no generation loaded; ready() has not run");
        }
        if generations.len() > self.config.max_generations {
            result.error(format!(
                "{} generations loaded, limit is {}",
                generations.len(),
                self.config.max_generations
            ));
        }
        let mut previous = 0u64;
        for generation in generations.iter() {
            if generation.creation_epoch_ms < previous {
                result.error("generations are not sorted by creation time");
            }
            previous = generation.creation_epoch_ms;
            result.merge(generation.bits.self_checks());
        }
        if !pairwise_coprime(&self.config.partitions) {
            result.warn("partition sizes are not pairwise coprime");
        }
        result
    }
}
