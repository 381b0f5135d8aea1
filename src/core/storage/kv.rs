// src/core/storage/kv.rs

//! The external key-value storage contract and two in-process
//! implementations: a plain in-memory store (tests, ephemeral hosts) and a
//! prefix-scoped view used to hand each component its own keyspace slice.

use crate::core::errors::PageVeilError;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// An async key-value map. Values are restricted to tree-shaped JSON-like
/// data; binary payloads must be encoded (the bit-array shards use hex).
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, PageVeilError>;
    async fn set(&self, key: &str, value: Value) -> Result<(), PageVeilError>;
    async fn keys(&self) -> Result<Vec<String>, PageVeilError>;
    async fn delete(&self, key: &str) -> Result<(), PageVeilError>;
}

/// A simple in-memory store.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, PageVeilError> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), PageVeilError> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, PageVeilError> {
        Ok(self.entries.read().keys().cloned().collect())
    }

    async fn delete(&self, key: &str) -> Result<(), PageVeilError> {
        self.entries.write().remove(key);
        Ok(())
    }
}

/// A view over an inner store that prepends a fixed prefix to every key.
/// Components sharing one physical store each get a disjoint keyspace.
pub struct PrefixedKvStore {
    inner: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl PrefixedKvStore {
    pub fn new(inner: Arc<dyn KeyValueStore>, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    fn scoped(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl KeyValueStore for PrefixedKvStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, PageVeilError> {
        self.inner.get(&self.scoped(key)).await
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), PageVeilError> {
        self.inner.set(&self.scoped(key), value).await
    }

    async fn keys(&self) -> Result<Vec<String>, PageVeilError> {
        Ok(self
            .inner
            .keys()
            .await?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), PageVeilError> {
        self.inner.delete(&self.scoped(key)).await
    }
}
