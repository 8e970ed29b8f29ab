//! Destination for merged record sets.
//!
//! The aggregator hands every successful result to a [`RecordStore`] keyed by
//! `(query fingerprint, logical api)`. Lookup and eviction policy belong to the
//! store implementation.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::record::Record;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey {
    pub fingerprint: String,
    pub api: String,
}

impl StoreKey {
    pub fn new(fingerprint: impl Into<String>, api: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            api: api.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store is full ({capacity} live entries)")]
    Full { capacity: usize },
}

pub trait RecordStore: Send + Sync {
    fn store<'a>(
        &'a self,
        key: StoreKey,
        records: &'a [Record],
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;
}

#[derive(Debug, Clone)]
struct StoredRecords {
    records: Vec<Record>,
    expires_at: Instant,
}

#[derive(Debug)]
struct StoreInner {
    map: HashMap<StoreKey, StoredRecords>,
    default_ttl: Duration,
    capacity: Option<usize>,
}

/// Thread-safe in-memory store with a per-entry TTL and an optional cap on
/// live entries.
#[derive(Debug, Clone)]
pub struct MemoryRecordStore {
    inner: Arc<tokio::sync::RwLock<StoreInner>>,
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl MemoryRecordStore {
    pub fn new(default_ttl: Duration) -> Self {
        Self::build(default_ttl, None)
    }

    /// Store refusing new keys once `capacity` unexpired entries are held.
    pub fn with_capacity(default_ttl: Duration, capacity: usize) -> Self {
        Self::build(default_ttl, Some(capacity))
    }

    fn build(default_ttl: Duration, capacity: Option<usize>) -> Self {
        Self {
            inner: Arc::new(tokio::sync::RwLock::new(StoreInner {
                map: HashMap::new(),
                default_ttl,
                capacity,
            })),
        }
    }

    /// Records stored under `key`, unless absent or expired.
    pub async fn get(&self, key: &StoreKey) -> Option<Vec<Record>> {
        let store = self.inner.read().await;
        store
            .map
            .get(key)
            .filter(|entry| Instant::now() <= entry.expires_at)
            .map(|entry| entry.records.clone())
    }

    /// Inserts or replaces `key`. Expired entries are dropped to make room
    /// before a full store refuses a new key.
    pub async fn put(&self, key: StoreKey, records: Vec<Record>) -> Result<(), StoreError> {
        let mut store = self.inner.write().await;
        if store.default_ttl == Duration::ZERO {
            return Ok(());
        }
        let now = Instant::now();
        if let Some(capacity) = store.capacity {
            if !store.map.contains_key(&key) && store.map.len() >= capacity {
                store.map.retain(|_, entry| entry.expires_at > now);
                if store.map.len() >= capacity {
                    return Err(StoreError::Full { capacity });
                }
            }
        }
        let expires_at = now + store.default_ttl;
        store.map.insert(key, StoredRecords { records, expires_at });
        Ok(())
    }

    pub async fn clear_expired(&self) {
        let mut store = self.inner.write().await;
        let now = Instant::now();
        store.map.retain(|_, entry| entry.expires_at > now);
    }

    /// Number of entries, including expired ones not yet cleared.
    pub async fn len(&self) -> usize {
        self.inner.read().await.map.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl RecordStore for MemoryRecordStore {
    fn store<'a>(
        &'a self,
        key: StoreKey,
        records: &'a [Record],
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(self.put(key, records.to_vec()))
    }
}
