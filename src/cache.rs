//! Prediction cache
//!
//! Bounded TTL cache keyed by a canonical fingerprint of the request.
//! Lookups share a read lock; mutation takes the write lock only for the
//! map operation itself. Entries are immutable once inserted.

use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use rustc_hash::FxHasher;

use crate::schema::FeatureValue;
use crate::telemetry::Metrics;

/// Stable cache key over `(model_name, model_version, normalized features)`.
///
/// Normalization sorts fields by name, renders floats to 6 significant
/// digits, and writes booleans as 0/1. Equality is on the full canonical
/// string, so the precomputed hash only accelerates map lookups.
#[derive(Debug, Clone)]
pub struct FingerprintKey {
    model_name: String,
    canonical: String,
    hash: u64,
}

impl FingerprintKey {
    pub fn new(
        model_name: &str,
        model_version: u64,
        features: &BTreeMap<String, FeatureValue>,
    ) -> Self {
        let mut canonical = format!("{model_name}\n{model_version}\n");
        for (name, value) in features {
            canonical.push_str(name);
            canonical.push('=');
            canonical.push_str(&canonical_value(value));
            canonical.push('\n');
        }
        let mut hasher = FxHasher::default();
        canonical.hash(&mut hasher);
        let hash = hasher.finish();
        Self {
            model_name: model_name.to_string(),
            canonical,
            hash,
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Canonical byte form, exposed for tests and debugging.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }
}

impl PartialEq for FingerprintKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for FingerprintKey {}

impl Hash for FingerprintKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

fn canonical_value(value: &FeatureValue) -> String {
    match value {
        FeatureValue::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        FeatureValue::Int(i) => i.to_string(),
        // 6 significant digits: one leading digit plus five after the point.
        FeatureValue::Float(f) => format!("{f:.5e}"),
        // Escape the separators so crafted strings cannot forge another
        // map's canonical form.
        FeatureValue::Str(s) => s.replace('\\', "\\\\").replace('\n', "\\n"),
    }
}

/// The cacheable portion of a prediction outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedPrediction {
    pub prediction: f64,
    pub probabilities: Option<Vec<f64>>,
    pub model_name: String,
    pub model_version: u64,
}

struct CacheEntry {
    value: CachedPrediction,
    inserted_at: Instant,
    last_used: AtomicU64,
}

/// Bounded TTL + LRU cache of prediction outcomes.
pub struct PredictionCache {
    entries: RwLock<HashMap<FingerprintKey, Arc<CacheEntry>>>,
    capacity: usize,
    ttl: Duration,
    clock: AtomicU64,
    metrics: Metrics,
}

impl PredictionCache {
    pub fn new(capacity: usize, ttl: Duration, metrics: Metrics) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity,
            ttl,
            clock: AtomicU64::new(0),
            metrics,
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up a fingerprint. Expired entries are removed and count as a miss.
    pub fn get(&self, key: &FingerprintKey) -> Option<CachedPrediction> {
        let now = Instant::now();
        {
            let entries = self.entries.read().expect("cache lock poisoned");
            if let Some(entry) = entries.get(key) {
                if now.duration_since(entry.inserted_at) < self.ttl {
                    entry.last_used.store(self.tick(), Ordering::Relaxed);
                    self.metrics.prediction_cache_hits.inc();
                    return Some(entry.value.clone());
                }
            } else {
                self.metrics.prediction_cache_misses.inc();
                return None;
            }
        }
        // Expired: drop it under the write lock, then report a miss.
        let mut entries = self.entries.write().expect("cache lock poisoned");
        if let Some(entry) = entries.get(key) {
            if now.duration_since(entry.inserted_at) >= self.ttl {
                entries.remove(key);
            }
        }
        self.metrics.prediction_cache_misses.inc();
        None
    }

    /// Insert a fresh entry, evicting the least recently used at capacity.
    pub fn insert(&self, key: FingerprintKey, value: CachedPrediction) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.write().expect("cache lock poisoned");
        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            let lru = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used.load(Ordering::Relaxed))
                .map(|(k, _)| k.clone());
            if let Some(lru_key) = lru {
                entries.remove(&lru_key);
            }
        }
        entries.insert(
            key,
            Arc::new(CacheEntry {
                value,
                inserted_at: Instant::now(),
                last_used: AtomicU64::new(self.tick()),
            }),
        );
    }

    /// Drop every entry whose fingerprint references `model_name`.
    ///
    /// Sequenced before the manager publishes the successor handle.
    pub fn invalidate_model(&self, model_name: &str) {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        entries.retain(|key, _| key.model_name() != model_name);
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(pairs: &[(&str, FeatureValue)]) -> BTreeMap<String, FeatureValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn outcome(model: &str, version: u64, prediction: f64) -> CachedPrediction {
        CachedPrediction {
            prediction,
            probabilities: None,
            model_name: model.to_string(),
            model_version: version,
        }
    }

    fn key(model: &str, version: u64, n: i64) -> FingerprintKey {
        FingerprintKey::new(model, version, &features(&[("x", FeatureValue::Int(n))]))
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let map = features(&[
            ("amount", FeatureValue::Float(150.0)),
            ("is_weekend", FeatureValue::Bool(true)),
            ("hour", FeatureValue::Int(23)),
        ]);
        let a = FingerprintKey::new("fraud", 1, &map);
        let b = FingerprintKey::new("fraud", 1, &map);
        assert_eq!(a, b);
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn fingerprint_varies_with_version_and_values() {
        let map = features(&[("x", FeatureValue::Float(1.0))]);
        let v1 = FingerprintKey::new("m", 1, &map);
        let v2 = FingerprintKey::new("m", 2, &map);
        assert_ne!(v1, v2);

        let other = features(&[("x", FeatureValue::Float(2.0))]);
        assert_ne!(v1, FingerprintKey::new("m", 1, &other));
    }

    #[test]
    fn bool_and_int_forms_are_distinct_from_floats() {
        let as_bool = features(&[("flag", FeatureValue::Bool(true))]);
        let as_int = features(&[("flag", FeatureValue::Int(1))]);
        // Both normalize to "1": a client sending 1 or true hits the same entry.
        assert_eq!(
            FingerprintKey::new("m", 1, &as_bool),
            FingerprintKey::new("m", 1, &as_int)
        );
    }

    #[test]
    fn float_normalization_is_six_significant_digits() {
        let a = features(&[("x", FeatureValue::Float(0.123456789))]);
        let b = features(&[("x", FeatureValue::Float(0.123456701))]);
        assert_eq!(
            FingerprintKey::new("m", 1, &a),
            FingerprintKey::new("m", 1, &b)
        );
        let c = features(&[("x", FeatureValue::Float(0.123457))]);
        let d = features(&[("x", FeatureValue::Float(0.123458))]);
        assert_ne!(
            FingerprintKey::new("m", 1, &c),
            FingerprintKey::new("m", 1, &d)
        );
    }

    #[test]
    fn hit_within_ttl_miss_after() {
        let cache = PredictionCache::new(8, Duration::from_millis(40), Metrics::new());
        let k = key("m", 1, 1);
        cache.insert(k.clone(), outcome("m", 1, 0.5));
        assert!(cache.get(&k).is_some());
        std::thread::sleep(Duration::from_millis(60));
        assert!(cache.get(&k).is_none());
        // The expired entry is gone, not just hidden.
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_evicts_exactly_the_lru() {
        let cache = PredictionCache::new(3, Duration::from_secs(60), Metrics::new());
        for n in 0..3 {
            cache.insert(key("m", 1, n), outcome("m", 1, n as f64));
        }
        // Touch 0 and 2 so 1 becomes least recently used.
        cache.get(&key("m", 1, 0));
        cache.get(&key("m", 1, 2));
        cache.insert(key("m", 1, 3), outcome("m", 1, 3.0));

        assert_eq!(cache.len(), 3);
        assert!(cache.get(&key("m", 1, 1)).is_none());
        assert!(cache.get(&key("m", 1, 0)).is_some());
        assert!(cache.get(&key("m", 1, 2)).is_some());
        assert!(cache.get(&key("m", 1, 3)).is_some());
    }

    #[test]
    fn invalidation_is_scoped_to_the_model_name() {
        let cache = PredictionCache::new(8, Duration::from_secs(60), Metrics::new());
        cache.insert(key("fraud", 1, 1), outcome("fraud", 1, 0.1));
        cache.insert(key("churn", 1, 1), outcome("churn", 1, 0.2));
        cache.invalidate_model("fraud");
        assert!(cache.get(&key("fraud", 1, 1)).is_none());
        assert!(cache.get(&key("churn", 1, 1)).is_some());
    }

    #[test]
    fn reinsert_refreshes_ttl_without_eviction() {
        let cache = PredictionCache::new(1, Duration::from_secs(60), Metrics::new());
        let k = key("m", 1, 1);
        cache.insert(k.clone(), outcome("m", 1, 1.0));
        cache.insert(k.clone(), outcome("m", 1, 2.0));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&k).unwrap().prediction, 2.0);
    }
}
