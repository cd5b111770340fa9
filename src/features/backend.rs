//! Feature store backends
//!
//! Tier 1 is a volatile key-value store with TTL semantics (a remote cache
//! in production, in-process here). Tier 2 is the tabular source of record.
//! Both are reached only through these traits.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::FeatureStoreError;
use crate::features::{FeatureKey, FeatureRow};
use crate::schema::FeatureValue;

/// Volatile KV tier with GET/SET/DEL and TTL.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, FeatureStoreError>;

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, FeatureStoreError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), FeatureStoreError>;

    async fn del(&self, key: &str) -> Result<(), FeatureStoreError>;
}

/// Durable tabular tier queryable by primary key.
#[async_trait]
pub trait TableBackend: Send + Sync {
    /// Point-in-time batch read; one result slot per input key, in order.
    async fn query(&self, keys: &[FeatureKey]) -> Result<Vec<Option<FeatureRow>>, FeatureStoreError>;

    /// Insert or replace a row, bumping its version. Returns the stored row.
    async fn upsert(
        &self,
        key: &FeatureKey,
        values: BTreeMap<String, FeatureValue>,
    ) -> Result<FeatureRow, FeatureStoreError>;
}

struct KvEntry {
    value: Vec<u8>,
    inserted_at: Instant,
    ttl: Duration,
    last_used: u64,
}

/// In-process KV tier with TTL, a max-entries bound and LRU eviction.
pub struct MemoryKv {
    entries: Mutex<HashMap<String, KvEntry>>,
    capacity: usize,
    clock: AtomicU64,
}

impl MemoryKv {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
            clock: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("kv lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, FeatureStoreError> {
        let mut entries = self.entries.lock().expect("kv lock poisoned");
        match entries.get_mut(key) {
            Some(entry) if entry.inserted_at.elapsed() < entry.ttl => {
                entry.last_used = self.tick();
                Ok(Some(entry.value.clone()))
            }
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, FeatureStoreError> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), FeatureStoreError> {
        if self.capacity == 0 {
            return Ok(());
        }
        let mut entries = self.entries.lock().expect("kv lock poisoned");
        if !entries.contains_key(key) && entries.len() >= self.capacity {
            let lru = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            if let Some(lru_key) = lru {
                entries.remove(&lru_key);
            }
        }
        entries.insert(
            key.to_string(),
            KvEntry {
                value,
                inserted_at: Instant::now(),
                ttl,
                last_used: self.tick(),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), FeatureStoreError> {
        self.entries.lock().expect("kv lock poisoned").remove(key);
        Ok(())
    }
}

/// In-process tabular tier. Rows carry a monotonic version per key.
#[derive(Default)]
pub struct MemoryTable {
    rows: Mutex<HashMap<FeatureKey, FeatureRow>>,

    /// Remaining queries that fail before recovering, for retry tests.
    fail_next: AtomicU64,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u64) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    fn check_injected_failure(&self) -> Result<(), FeatureStoreError> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .fail_next
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(FeatureStoreError::Backend("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl TableBackend for MemoryTable {
    async fn query(&self, keys: &[FeatureKey]) -> Result<Vec<Option<FeatureRow>>, FeatureStoreError> {
        self.check_injected_failure()?;
        let rows = self.rows.lock().expect("table lock poisoned");
        Ok(keys.iter().map(|key| rows.get(key).cloned()).collect())
    }

    async fn upsert(
        &self,
        key: &FeatureKey,
        values: BTreeMap<String, FeatureValue>,
    ) -> Result<FeatureRow, FeatureStoreError> {
        self.check_injected_failure()?;
        let mut rows = self.rows.lock().expect("table lock poisoned");
        let version = rows.get(key).map(|row| row.version + 1).unwrap_or(1);
        let row = FeatureRow {
            key: key.clone(),
            values,
            version,
            fetched_at: Utc::now(),
        };
        rows.insert(key.clone(), row.clone());
        Ok(row)
    }
}
