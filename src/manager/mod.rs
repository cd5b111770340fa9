//! Model manager
//!
//! Owns the `name -> current handle` map and the set of in-flight loads.
//! Loads for different names run in parallel; a per-name token serializes
//! loads for the same name. Publication is a single map-entry swap under a
//! narrow write lock, so readers only ever observe a fully built handle.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache::PredictionCache;
use crate::config::PreloadSpec;
use crate::error::{LoadError, RegistryError};
use crate::loader::{self, ModelHandle};
use crate::registry::{self, RegistryClient, Stage, VersionSelector};
use crate::telemetry::Metrics;

/// A retired handle kept alive for in-flight readers.
struct DrainingHandle {
    handle: Arc<ModelHandle>,
    retire_deadline: Instant,
}

/// Row returned by `list()` and the `/models` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    pub name: String,
    pub version: String,
    pub stage: Stage,
    pub loaded_at: DateTime<Utc>,
    pub load_duration_ms: u64,
}

pub struct ModelManager {
    registry: Arc<dyn RegistryClient>,
    current: RwLock<HashMap<String, Arc<ModelHandle>>>,
    draining: Mutex<Vec<DrainingHandle>>,
    in_flight: Mutex<HashSet<(String, u64)>>,
    load_tokens: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    drain_window: Duration,
    cache: Arc<PredictionCache>,
    metrics: Metrics,
    loads_succeeded: AtomicU64,
    loads_failed: AtomicU64,
}

impl ModelManager {
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        cache: Arc<PredictionCache>,
        drain_window: Duration,
        metrics: Metrics,
    ) -> Self {
        Self {
            registry,
            current: RwLock::new(HashMap::new()),
            draining: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashSet::new()),
            load_tokens: Mutex::new(HashMap::new()),
            drain_window,
            cache,
            metrics,
            loads_succeeded: AtomicU64::new(0),
            loads_failed: AtomicU64::new(0),
        }
    }

    /// Currently published handle for a name.
    ///
    /// The read guard is held only long enough to clone the `Arc`; the
    /// caller keeps a stable snapshot for its whole request.
    pub fn current(&self, name: &str) -> Option<Arc<ModelHandle>> {
        self.current
            .read()
            .expect("manager lock poisoned")
            .get(name)
            .cloned()
    }

    /// Find a specific loaded version, including handles still draining.
    pub fn find_version(&self, name: &str, version: u64) -> Option<Arc<ModelHandle>> {
        if let Some(handle) = self.current(name) {
            if handle.version == version {
                return Some(handle);
            }
        }
        let now = Instant::now();
        self.draining
            .lock()
            .expect("manager lock poisoned")
            .iter()
            .find(|d| {
                d.handle.name == name && d.handle.version == version && d.retire_deadline > now
            })
            .map(|d| Arc::clone(&d.handle))
    }

    /// Whether at least one model is published. Drives readiness.
    pub fn any_loaded(&self) -> bool {
        !self.current.read().expect("manager lock poisoned").is_empty()
    }

    /// Summaries of every published handle, sorted by name.
    pub fn list(&self) -> Vec<ModelSummary> {
        let mut out: Vec<ModelSummary> = self
            .current
            .read()
            .expect("manager lock poisoned")
            .values()
            .map(|h| ModelSummary {
                name: h.name.clone(),
                version: h.version.to_string(),
                stage: h.stage,
                loaded_at: h.loaded_at,
                load_duration_ms: h.load_duration.as_millis() as u64,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Published version of a name, if any.
    pub fn current_version(&self, name: &str) -> Option<u64> {
        self.current(name).map(|h| h.version)
    }

    /// Lifetime load counters `(succeeded, failed)`.
    pub fn load_counts(&self) -> (u64, u64) {
        (
            self.loads_succeeded.load(Ordering::Relaxed),
            self.loads_failed.load(Ordering::Relaxed),
        )
    }

    /// Submit a load intent. Idempotent and non-blocking: if the version is
    /// already current or a load for `(name, version)` is in flight, this
    /// returns without work.
    pub fn submit_load(self: &Arc<Self>, name: &str, version: u64) {
        if self.current_version(name) == Some(version) {
            return;
        }
        {
            let mut in_flight = self.in_flight.lock().expect("manager lock poisoned");
            if !in_flight.insert((name.to_string(), version)) {
                return;
            }
        }
        let manager = Arc::clone(self);
        let name = name.to_string();
        tokio::spawn(async move {
            if let Err(err) = manager.load(&name, version).await {
                tracing::error!(model = %name, version, error = %err, "model load failed");
            }
            manager
                .in_flight
                .lock()
                .expect("manager lock poisoned")
                .remove(&(name.clone(), version));
        });
    }

    /// Load and publish one `(name, version)`, serialized per name.
    ///
    /// Loads are never cancelled by request deadlines; they run to
    /// completion or their own retry limit.
    pub async fn load(&self, name: &str, version: u64) -> Result<Arc<ModelHandle>, LoadError> {
        let token = self.token_for(name);
        let _serialized = token.lock().await;

        // Re-check after acquiring the token: a competing load may have
        // published this exact version while we waited.
        if let Some(handle) = self.current(name) {
            if handle.version == version {
                return Ok(handle);
            }
        }

        // Rollback fast-path: a handle for this exact version may still be
        // draining. Republishing it keeps one handle per (name, version)
        // and skips the artifact fetch entirely.
        if let Some(handle) = self.find_version(name, version) {
            {
                let mut draining = self.draining.lock().expect("manager lock poisoned");
                draining.retain(|d| !(d.handle.name == name && d.handle.version == version));
            }
            self.publish(Arc::clone(&handle));
            self.loads_succeeded.fetch_add(1, Ordering::Relaxed);
            self.metrics
                .record_load(name, &version.to_string(), "success", Duration::ZERO);
            tracing::info!(model = name, version, "republished draining handle");
            return Ok(handle);
        }

        let started = Instant::now();
        let result = self.fetch_and_build(name, version, started).await;
        match result {
            Ok(handle) => {
                let handle = Arc::new(handle);
                self.publish(Arc::clone(&handle));
                self.loads_succeeded.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_load(
                    name,
                    &version.to_string(),
                    "success",
                    started.elapsed(),
                );
                tracing::info!(
                    model = name,
                    version,
                    load_ms = started.elapsed().as_millis() as u64,
                    "model published"
                );
                Ok(handle)
            }
            Err(err) => {
                self.loads_failed.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .record_load(name, &version.to_string(), "error", started.elapsed());
                Err(err)
            }
        }
    }

    async fn fetch_and_build(
        &self,
        name: &str,
        version: u64,
        started: Instant,
    ) -> Result<ModelHandle, LoadError> {
        let versions =
            registry::with_retry("list_versions", || self.registry.list_versions(name)).await?;
        let stage = versions
            .iter()
            .find(|v| v.id == version)
            .map(|v| v.stage)
            .unwrap_or(Stage::None);

        let payload = registry::with_retry("fetch_artifact", || {
            self.registry.fetch_artifact(name, version)
        })
        .await?;

        loader::load_artifact(name, version, stage, payload, started.elapsed())
    }

    /// Atomically swap in a new handle and retire its predecessor.
    fn publish(&self, handle: Arc<ModelHandle>) {
        assert!(
            handle.schema.input_arity() == handle.predictor.input_arity(),
            "publishing a handle whose schema and predictor disagree"
        );
        let name = handle.name.clone();

        // Invalidation is sequenced before the swap so no lookup can pair a
        // stale entry with the successor handle.
        self.cache.invalidate_model(&name);

        let old = {
            let mut current = self.current.write().expect("manager lock poisoned");
            current.insert(name, handle)
        };
        if let Some(old) = old {
            let mut draining = self.draining.lock().expect("manager lock poisoned");
            draining.push(DrainingHandle {
                handle: old,
                retire_deadline: Instant::now() + self.drain_window,
            });
        }
    }

    /// Drop retired handles whose drain window has elapsed. In-flight
    /// requests still holding the `Arc` keep the memory alive until they
    /// finish.
    pub fn prune_draining(&self) {
        let now = Instant::now();
        self.draining
            .lock()
            .expect("manager lock poisoned")
            .retain(|d| d.retire_deadline > now);
    }

    /// Resolve a preload/reload selector to a concrete version id.
    pub async fn resolve_selector(
        &self,
        name: &str,
        selector: &VersionSelector,
    ) -> Result<u64, RegistryError> {
        match selector {
            VersionSelector::Version(v) => Ok(*v),
            VersionSelector::Alias(alias) => {
                match self.registry.resolve_alias(name, alias).await {
                    Ok(version) => Ok(version.id),
                    Err(RegistryError::AliasNotFound { .. }) if alias == "production" => {
                        // No alias set: fall back to the stage label.
                        let versions = self.registry.list_versions(name).await?;
                        registry::production_version(&versions)
                            .map(|v| v.id)
                            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Load the configured models at startup, bounded by the warmup deadline.
    ///
    /// Preload failures are logged, not fatal; the poller retries on its
    /// next tick.
    pub async fn preload(&self, specs: &[PreloadSpec], warmup_deadline: Duration) {
        let warmup = async {
            for spec in specs {
                match self.resolve_selector(&spec.name, &spec.selector).await {
                    Ok(version) => match self.load(&spec.name, version).await {
                        Ok(handle) => {
                            tracing::info!(model = %spec.name, version = handle.version, "preloaded model")
                        }
                        Err(err) => {
                            tracing::warn!(model = %spec.name, error = %err, "failed to preload model")
                        }
                    },
                    Err(err) => {
                        tracing::warn!(model = %spec.name, error = %err, "failed to resolve preload selector")
                    }
                }
            }
        };
        if tokio::time::timeout(warmup_deadline, warmup).await.is_err() {
            tracing::warn!(
                deadline_s = warmup_deadline.as_secs(),
                "warmup deadline elapsed before preload finished"
            );
        }
    }

    fn token_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut tokens = self.load_tokens.lock().expect("manager lock poisoned");
        Arc::clone(
            tokens
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryRegistry;
    use crate::schema::{FieldDtype, InputSchema, SchemaField};

    fn schema(n: usize) -> InputSchema {
        InputSchema {
            fields: (0..n)
                .map(|i| SchemaField {
                    name: format!("f{i}"),
                    dtype: FieldDtype::F64,
                    required: true,
                    default: None,
                    transform: None,
                })
                .collect(),
        }
    }

    fn artifact(weights: &[f64]) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "predictor": {"kind": "linear", "weights": weights, "intercept": 0.0}
        }))
        .unwrap()
    }

    fn manager_with(registry: Arc<InMemoryRegistry>) -> Arc<ModelManager> {
        let metrics = Metrics::new();
        let cache = Arc::new(PredictionCache::new(
            128,
            Duration::from_secs(300),
            metrics.clone(),
        ));
        Arc::new(ModelManager::new(
            registry,
            cache,
            Duration::from_secs(30),
            metrics,
        ))
    }

    fn seed(registry: &InMemoryRegistry, name: &str, version: u64) {
        registry.register(
            name,
            version,
            Stage::Production,
            artifact(&[1.0, 2.0]),
            Some(schema(2)),
        );
    }

    #[tokio::test]
    async fn load_publishes_a_handle() {
        let registry = Arc::new(InMemoryRegistry::new());
        seed(&registry, "fraud", 1);
        let manager = manager_with(registry);

        let handle = manager.load("fraud", 1).await.unwrap();
        assert_eq!(handle.version, 1);
        assert_eq!(manager.current_version("fraud"), Some(1));
        assert!(manager.any_loaded());
        assert_eq!(manager.load_counts(), (1, 0));
    }

    #[tokio::test]
    async fn failed_load_keeps_existing_handle() {
        let registry = Arc::new(InMemoryRegistry::new());
        seed(&registry, "fraud", 1);
        registry.register("fraud", 2, Stage::Production, b"garbage".to_vec(), None);
        let manager = manager_with(registry);

        manager.load("fraud", 1).await.unwrap();
        assert!(manager.load("fraud", 2).await.is_err());
        assert_eq!(manager.current_version("fraud"), Some(1));
        assert_eq!(manager.load_counts(), (1, 1));
    }

    #[tokio::test]
    async fn swap_retires_the_old_handle_into_draining() {
        let registry = Arc::new(InMemoryRegistry::new());
        seed(&registry, "fraud", 1);
        seed(&registry, "fraud", 2);
        let manager = manager_with(registry);

        let v1 = manager.load("fraud", 1).await.unwrap();
        manager.load("fraud", 2).await.unwrap();

        assert_eq!(manager.current_version("fraud"), Some(2));
        // The retired handle is still reachable by exact version.
        let drained = manager.find_version("fraud", 1).unwrap();
        assert_eq!(drained.version, 1);
        assert!(Arc::ptr_eq(&v1, &drained));
    }

    #[tokio::test]
    async fn rollback_republishes_the_draining_handle() {
        let registry = Arc::new(InMemoryRegistry::new());
        seed(&registry, "fraud", 1);
        seed(&registry, "fraud", 2);
        let manager = manager_with(registry);

        let v1 = manager.load("fraud", 1).await.unwrap();
        manager.load("fraud", 2).await.unwrap();
        let rolled_back = manager.load("fraud", 1).await.unwrap();

        assert_eq!(manager.current_version("fraud"), Some(1));
        // The same handle instance came back, no second instantiation.
        assert!(Arc::ptr_eq(&v1, &rolled_back));
        // Version 2 is draining now and still reachable by exact version.
        assert!(manager.find_version("fraud", 2).is_some());
    }

    #[tokio::test]
    async fn load_is_a_noop_when_version_is_current() {
        let registry = Arc::new(InMemoryRegistry::new());
        seed(&registry, "fraud", 1);
        let manager = manager_with(registry);

        let first = manager.load("fraud", 1).await.unwrap();
        let second = manager.load("fraud", 1).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.load_counts(), (1, 0));
    }

    #[tokio::test]
    async fn concurrent_loads_of_one_version_produce_one_handle() {
        let registry = Arc::new(InMemoryRegistry::new());
        seed(&registry, "fraud", 1);
        let manager = manager_with(registry);

        let a = {
            let m = Arc::clone(&manager);
            tokio::spawn(async move { m.load("fraud", 1).await.unwrap() })
        };
        let b = {
            let m = Arc::clone(&manager);
            tokio::spawn(async move { m.load("fraud", 1).await.unwrap() })
        };
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        // One load did the work, the other joined the published handle.
        assert_eq!(manager.load_counts(), (1, 0));
    }

    #[tokio::test]
    async fn submit_load_deduplicates_in_flight_intents() {
        let registry = Arc::new(InMemoryRegistry::new());
        seed(&registry, "fraud", 1);
        let manager = manager_with(registry);

        for _ in 0..8 {
            manager.submit_load("fraud", 1);
        }
        // Wait for the spawned load to land.
        for _ in 0..100 {
            if manager.current_version("fraud") == Some(1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.current_version("fraud"), Some(1));
        assert_eq!(manager.load_counts(), (1, 0));
    }

    #[tokio::test]
    async fn prune_draining_respects_the_window() {
        let registry = Arc::new(InMemoryRegistry::new());
        seed(&registry, "fraud", 1);
        seed(&registry, "fraud", 2);
        let metrics = Metrics::new();
        let cache = Arc::new(PredictionCache::new(
            128,
            Duration::from_secs(300),
            metrics.clone(),
        ));
        let manager = Arc::new(ModelManager::new(
            registry,
            cache,
            Duration::from_millis(30),
            metrics,
        ));

        manager.load("fraud", 1).await.unwrap();
        manager.load("fraud", 2).await.unwrap();
        assert!(manager.find_version("fraud", 1).is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        manager.prune_draining();
        assert!(manager.find_version("fraud", 1).is_none());
    }

    #[tokio::test]
    async fn resolve_selector_prefers_alias_then_stage() {
        let registry = Arc::new(InMemoryRegistry::new());
        seed(&registry, "fraud", 1);
        seed(&registry, "fraud", 3);
        let manager = manager_with(Arc::clone(&registry));

        // No alias: highest production-stage version wins.
        let resolved = manager
            .resolve_selector("fraud", &VersionSelector::Alias("production".into()))
            .await
            .unwrap();
        assert_eq!(resolved, 3);

        // Alias pins the older version.
        registry.set_alias("fraud", "production", 1);
        let resolved = manager
            .resolve_selector("fraud", &VersionSelector::Alias("production".into()))
            .await
            .unwrap();
        assert_eq!(resolved, 1);

        let resolved = manager
            .resolve_selector("fraud", &VersionSelector::Version(7))
            .await
            .unwrap();
        assert_eq!(resolved, 7);
    }
}
