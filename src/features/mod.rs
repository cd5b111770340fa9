//! Feature store client
//!
//! Two-tier read-through cache: a volatile KV tier in front of the tabular
//! source of record. Reads populate Tier 1, writes go through Tier 2 first.

pub mod backend;

pub use backend::{KvBackend, MemoryKv, MemoryTable, TableBackend};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FeatureStoreError;
use crate::schema::FeatureValue;
use crate::telemetry::Metrics;

/// Identifies one row in the feature store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeatureKey {
    pub entity_id: String,
    pub group: String,
}

impl FeatureKey {
    pub fn new(entity_id: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            group: group.into(),
        }
    }

    /// Tier-1 cache key.
    fn cache_key(&self) -> String {
        format!("features:{}:{}", self.group, self.entity_id)
    }
}

/// One stored feature row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub key: FeatureKey,
    pub values: BTreeMap<String, FeatureValue>,
    pub version: u64,
    pub fetched_at: DateTime<Utc>,
}

/// High-level client over both tiers.
pub struct FeatureStoreClient {
    tier1: Arc<dyn KvBackend>,
    tier2: Arc<dyn TableBackend>,
    ttl: Duration,
    metrics: Metrics,
}

impl FeatureStoreClient {
    pub fn new(
        tier1: Arc<dyn KvBackend>,
        tier2: Arc<dyn TableBackend>,
        ttl: Duration,
        metrics: Metrics,
    ) -> Self {
        Self {
            tier1,
            tier2,
            ttl,
            metrics,
        }
    }

    /// Read one row: Tier 1 first, then Tier 2, populating Tier 1 on a hit.
    pub async fn get(&self, key: &FeatureKey) -> Result<Option<FeatureRow>, FeatureStoreError> {
        let mut results = self.get_batch(std::slice::from_ref(key)).await?;
        Ok(results.pop().and_then(|(_, row)| row))
    }

    /// Batch read preserving input-key order in the response.
    ///
    /// Duplicate keys are coalesced into a single lookup; the miss set goes
    /// to Tier 2 in one query, so rows in a batch reflect one point-in-time
    /// snapshot of the table.
    pub async fn get_batch(
        &self,
        keys: &[FeatureKey],
    ) -> Result<Vec<(FeatureKey, Option<FeatureRow>)>, FeatureStoreError> {
        let mut unique: Vec<FeatureKey> = Vec::new();
        for key in keys {
            if !unique.contains(key) {
                unique.push(key.clone());
            }
        }

        let cache_keys: Vec<String> = unique.iter().map(|k| k.cache_key()).collect();
        let cached = self.tier1.mget(&cache_keys).await?;

        let mut resolved: BTreeMap<String, Option<FeatureRow>> = BTreeMap::new();
        let mut misses: Vec<FeatureKey> = Vec::new();
        for (key, bytes) in unique.iter().zip(cached) {
            match bytes.map(|b| decode_row(&b)) {
                Some(Ok(row)) => {
                    self.metrics.feature_cache_hits.inc();
                    resolved.insert(key.cache_key(), Some(row));
                }
                Some(Err(err)) => {
                    // Undecodable cache bytes fall back to the table.
                    tracing::warn!(key = %key.cache_key(), error = %err, "dropping corrupt tier-1 entry");
                    self.tier1.del(&key.cache_key()).await?;
                    self.metrics.feature_cache_misses.inc();
                    misses.push(key.clone());
                }
                None => {
                    self.metrics.feature_cache_misses.inc();
                    misses.push(key.clone());
                }
            }
        }

        if !misses.is_empty() {
            let rows = self.tier2.query(&misses).await?;
            for (key, row) in misses.iter().zip(rows) {
                if let Some(row) = &row {
                    self.populate_tier1(row).await?;
                }
                resolved.insert(key.cache_key(), row);
            }
        }

        Ok(keys
            .iter()
            .map(|key| {
                let row = resolved.get(&key.cache_key()).cloned().flatten();
                (key.clone(), row)
            })
            .collect())
    }

    /// Write-through: Tier 2 first, then Tier 1 with the observed version.
    /// A Tier-2 failure leaves Tier 1 untouched.
    pub async fn put(
        &self,
        key: &FeatureKey,
        values: BTreeMap<String, FeatureValue>,
    ) -> Result<FeatureRow, FeatureStoreError> {
        let row = self.tier2.upsert(key, values).await?;
        self.populate_tier1(&row).await?;
        Ok(row)
    }

    /// Connectivity probe for health reporting. Queries Tier 2 with a
    /// sentinel key; the row does not need to exist.
    pub async fn probe(&self) -> bool {
        let key = FeatureKey::new("__health__", "probe");
        self.tier2.query(std::slice::from_ref(&key)).await.is_ok()
    }

    /// Write a row into Tier 1 unless a higher version is already cached.
    async fn populate_tier1(&self, row: &FeatureRow) -> Result<(), FeatureStoreError> {
        let cache_key = row.key.cache_key();
        if let Some(bytes) = self.tier1.get(&cache_key).await? {
            if let Ok(existing) = decode_row(&bytes) {
                if existing.version > row.version {
                    return Ok(());
                }
            }
        }
        self.tier1.set(&cache_key, encode_row(row)?, self.ttl).await
    }
}

fn encode_row(row: &FeatureRow) -> Result<Vec<u8>, FeatureStoreError> {
    serde_json::to_vec(row).map_err(|e| FeatureStoreError::Decode(e.to_string()))
}

fn decode_row(bytes: &[u8]) -> Result<FeatureRow, FeatureStoreError> {
    serde_json::from_slice(bytes).map_err(|e| FeatureStoreError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> (FeatureStoreClient, Arc<MemoryKv>, Arc<MemoryTable>) {
        let tier1 = Arc::new(MemoryKv::new(64));
        let tier2 = Arc::new(MemoryTable::new());
        let client = FeatureStoreClient::new(
            tier1.clone(),
            tier2.clone(),
            Duration::from_secs(3600),
            Metrics::new(),
        );
        (client, tier1, tier2)
    }

    fn values(pairs: &[(&str, f64)]) -> BTreeMap<String, FeatureValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), FeatureValue::Float(*v)))
            .collect()
    }

    #[tokio::test]
    async fn read_through_populates_tier1() {
        let (client, tier1, tier2) = client();
        let key = FeatureKey::new("user-1", "txn");
        tier2.upsert(&key, values(&[("x", 1.0)])).await.unwrap();
        assert!(tier1.is_empty());

        let row = client.get(&key).await.unwrap().unwrap();
        assert_eq!(row.values, values(&[("x", 1.0)]));
        assert_eq!(tier1.len(), 1);

        // Second read is served by Tier 1 even if the table goes away.
        tier2.fail_next(1);
        assert!(client.get(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn get_batch_preserves_order_and_coalesces() {
        let (client, _, tier2) = client();
        let a = FeatureKey::new("a", "g");
        let b = FeatureKey::new("b", "g");
        let missing = FeatureKey::new("ghost", "g");
        tier2.upsert(&a, values(&[("x", 1.0)])).await.unwrap();
        tier2.upsert(&b, values(&[("x", 2.0)])).await.unwrap();

        let input = vec![b.clone(), missing.clone(), a.clone(), b.clone()];
        let out = client.get_batch(&input).await.unwrap();

        assert_eq!(out.len(), 4);
        for (i, (key, _)) in out.iter().enumerate() {
            assert_eq!(*key, input[i]);
        }
        assert_eq!(out[0].1.as_ref().unwrap().values, values(&[("x", 2.0)]));
        assert!(out[1].1.is_none());
        assert_eq!(out[2].1.as_ref().unwrap().values, values(&[("x", 1.0)]));
        assert_eq!(out[3].1.as_ref().unwrap().values, values(&[("x", 2.0)]));
    }

    #[tokio::test]
    async fn put_is_write_through() {
        let (client, tier1, _) = client();
        let key = FeatureKey::new("user-1", "txn");
        let row = client.put(&key, values(&[("x", 5.0)])).await.unwrap();
        assert_eq!(row.version, 1);
        assert_eq!(tier1.len(), 1);
        assert_eq!(client.get(&key).await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn tier2_failure_leaves_tier1_untouched() {
        let (client, tier1, tier2) = client();
        let key = FeatureKey::new("user-1", "txn");
        tier2.fail_next(1);
        assert!(client.put(&key, values(&[("x", 1.0)])).await.is_err());
        assert!(tier1.is_empty());
    }

    #[tokio::test]
    async fn higher_cached_version_wins() {
        let (client, _, tier2) = client();
        let key = FeatureKey::new("user-1", "txn");
        // Two writes bump the table to version 2 and cache version 2.
        client.put(&key, values(&[("x", 1.0)])).await.unwrap();
        client.put(&key, values(&[("x", 2.0)])).await.unwrap();

        // An attempt to repopulate with the stale version-1 row is a no-op.
        let stale = FeatureRow {
            key: key.clone(),
            values: values(&[("x", 1.0)]),
            version: 1,
            fetched_at: Utc::now(),
        };
        client.populate_tier1(&stale).await.unwrap();
        assert_eq!(client.get(&key).await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn corrupt_tier1_entry_falls_back_to_table() {
        let (client, tier1, tier2) = client();
        let key = FeatureKey::new("user-1", "txn");
        tier2.upsert(&key, values(&[("x", 9.0)])).await.unwrap();
        tier1
            .set(&key.cache_key(), b"not json".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        let row = client.get(&key).await.unwrap().unwrap();
        assert_eq!(row.values, values(&[("x", 9.0)]));
    }
}
