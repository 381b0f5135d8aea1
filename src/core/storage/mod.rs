// src/core/storage/mod.rs

//! Persistence primitives: the external key-value contract, the sharded
//! bit-array and rotating Bloom filter, the TTL'd hash set, and the
//! crash-safe session cache.

pub mod bitarray;
pub mod bloom;
pub mod hashes;
pub mod kv;
pub mod session;

pub use bitarray::PersistedBitarray;
pub use bloom::{BloomFilter, BloomFilterConfig};
pub use hashes::PersistedHashes;
pub use kv::{KeyValueStore, MemoryKvStore, PrefixedKvStore};
pub use session::{SessionApi, SessionStorageWrapper};
