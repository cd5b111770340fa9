//! Registry poller
//!
//! One background task per server. Each tick reconciles the desired
//! production version of every tracked model against what the manager has
//! published, submitting load intents for the differences. Ticks are
//! jittered and non-reentrant; a slow reconcile delays the next tick
//! instead of overlapping it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

use crate::error::RegistryError;
use crate::manager::ModelManager;
use crate::registry::{self, RegistryClient};

/// Snapshot served by `GET /models/updates/status`.
#[derive(Debug, Clone, Serialize)]
pub struct PollerStatus {
    pub tracking_models: Vec<String>,
    pub current_versions: HashMap<String, u64>,
    pub last_check: HashMap<String, DateTime<Utc>>,
    pub update_count: u64,
    pub failed_updates: u64,
    pub check_interval_seconds: u64,
}

/// State shared between the poller task and the status endpoint.
#[derive(Default)]
pub struct PollerState {
    last_check: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl PollerState {
    fn mark_checked(&self, model: &str) {
        self.last_check
            .lock()
            .expect("poller lock poisoned")
            .insert(model.to_string(), Utc::now());
    }

    fn last_checks(&self) -> HashMap<String, DateTime<Utc>> {
        self.last_check.lock().expect("poller lock poisoned").clone()
    }
}

pub struct RegistryPoller {
    registry: Arc<dyn RegistryClient>,
    manager: Arc<ModelManager>,
    tracked: Vec<String>,
    interval: Duration,
    jitter_fraction: f64,
    state: Arc<PollerState>,
}

impl RegistryPoller {
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        manager: Arc<ModelManager>,
        tracked: Vec<String>,
        interval: Duration,
        jitter_fraction: f64,
    ) -> Self {
        Self {
            registry,
            manager,
            tracked,
            interval,
            jitter_fraction,
            state: Arc::new(PollerState::default()),
        }
    }

    pub fn state(&self) -> Arc<PollerState> {
        Arc::clone(&self.state)
    }

    /// Build the status snapshot for the HTTP surface.
    pub fn status(
        state: &PollerState,
        manager: &ModelManager,
        tracked: &[String],
        interval: Duration,
    ) -> PollerStatus {
        let (update_count, failed_updates) = manager.load_counts();
        let current_versions = tracked
            .iter()
            .filter_map(|name| manager.current_version(name).map(|v| (name.clone(), v)))
            .collect();
        PollerStatus {
            tracking_models: tracked.to_vec(),
            current_versions,
            last_check: state.last_checks(),
            update_count,
            failed_updates,
            check_interval_seconds: interval.as_secs(),
        }
    }

    /// Run until the owning task is aborted at shutdown.
    pub async fn run(self) {
        tracing::info!(
            models = ?self.tracked,
            interval_s = self.interval.as_secs(),
            "registry poller started"
        );
        loop {
            self.tick().await;
            tokio::time::sleep(self.jittered_interval()).await;
        }
    }

    /// One reconciliation pass over every tracked model.
    pub async fn tick(&self) {
        self.manager.prune_draining();
        for name in &self.tracked {
            match self.desired_version(name).await {
                Ok(Some(desired)) => {
                    let current = self.manager.current_version(name);
                    if current != Some(desired) {
                        tracing::info!(
                            model = %name,
                            current = ?current,
                            desired,
                            "new model version detected"
                        );
                        self.manager.submit_load(name, desired);
                    }
                }
                Ok(None) => {
                    tracing::debug!(model = %name, "no production version in registry");
                }
                Err(err) => {
                    tracing::warn!(model = %name, error = %err, "registry check failed");
                }
            }
            self.state.mark_checked(name);
        }
    }

    /// Desired version: the `production` alias when set, otherwise the
    /// highest-numbered version with stage `production`.
    async fn desired_version(&self, name: &str) -> Result<Option<u64>, RegistryError> {
        match registry::with_retry("resolve_alias", || {
            self.registry.resolve_alias(name, "production")
        })
        .await
        {
            Ok(version) => Ok(Some(version.id)),
            Err(RegistryError::AliasNotFound { .. }) => {
                let versions =
                    registry::with_retry("list_versions", || self.registry.list_versions(name))
                        .await?;
                Ok(registry::production_version(&versions).map(|v| v.id))
            }
            Err(err) => Err(err),
        }
    }

    fn jittered_interval(&self) -> Duration {
        if self.jitter_fraction == 0.0 {
            return self.interval;
        }
        let spread = self.jitter_fraction;
        let factor = 1.0 + rand::thread_rng().gen_range(-spread..=spread);
        self.interval.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PredictionCache;
    use crate::registry::{InMemoryRegistry, Stage};
    use crate::schema::{FieldDtype, InputSchema, SchemaField};
    use crate::telemetry::Metrics;

    fn schema() -> InputSchema {
        InputSchema {
            fields: vec![SchemaField {
                name: "x".into(),
                dtype: FieldDtype::F64,
                required: true,
                default: None,
                transform: None,
            }],
        }
    }

    fn artifact() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "predictor": {"kind": "linear", "weights": [1.0], "intercept": 0.0}
        }))
        .unwrap()
    }

    fn build(registry: Arc<InMemoryRegistry>) -> (RegistryPoller, Arc<ModelManager>) {
        let metrics = Metrics::new();
        let cache = Arc::new(PredictionCache::new(
            16,
            Duration::from_secs(300),
            metrics.clone(),
        ));
        let manager = Arc::new(ModelManager::new(
            Arc::clone(&registry) as Arc<dyn RegistryClient>,
            cache,
            Duration::from_secs(30),
            metrics,
        ));
        let poller = RegistryPoller::new(
            registry,
            Arc::clone(&manager),
            vec!["fraud".into()],
            Duration::from_secs(60),
            0.1,
        );
        (poller, manager)
    }

    async fn wait_for_version(manager: &ModelManager, name: &str, version: u64) {
        for _ in 0..200 {
            if manager.current_version(name) == Some(version) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{name} never reached version {version}");
    }

    #[tokio::test]
    async fn tick_loads_the_production_version() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.register("fraud", 1, Stage::Production, artifact(), Some(schema()));
        let (poller, manager) = build(registry);

        poller.tick().await;
        wait_for_version(&manager, "fraud", 1).await;
    }

    #[tokio::test]
    async fn tick_follows_alias_moves() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.register("fraud", 1, Stage::Production, artifact(), Some(schema()));
        registry.register("fraud", 2, Stage::Staging, artifact(), Some(schema()));
        registry.set_alias("fraud", "production", 1);
        let (poller, manager) = build(Arc::clone(&registry));

        poller.tick().await;
        wait_for_version(&manager, "fraud", 1).await;

        registry.set_alias("fraud", "production", 2);
        poller.tick().await;
        wait_for_version(&manager, "fraud", 2).await;
    }

    #[tokio::test(start_paused = true)]
    async fn tick_survives_registry_outage() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.register("fraud", 1, Stage::Production, artifact(), Some(schema()));
        let (poller, manager) = build(Arc::clone(&registry));

        poller.tick().await;
        wait_for_version(&manager, "fraud", 1).await;

        // Every retry attempt in the next tick fails; current state persists.
        registry.fail_next(100);
        poller.tick().await;
        assert_eq!(manager.current_version("fraud"), Some(1));
        registry.fail_next(0);
    }

    #[tokio::test]
    async fn highest_production_version_wins_without_alias() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.register("fraud", 1, Stage::Production, artifact(), Some(schema()));
        registry.register("fraud", 4, Stage::Production, artifact(), Some(schema()));
        registry.register("fraud", 9, Stage::Archived, artifact(), Some(schema()));
        let (poller, manager) = build(registry);

        poller.tick().await;
        wait_for_version(&manager, "fraud", 4).await;
    }

    #[test]
    fn jitter_stays_within_the_configured_fraction() {
        let registry = Arc::new(InMemoryRegistry::new());
        let metrics = Metrics::new();
        let cache = Arc::new(PredictionCache::new(
            16,
            Duration::from_secs(300),
            metrics.clone(),
        ));
        let manager = Arc::new(ModelManager::new(
            Arc::clone(&registry) as Arc<dyn RegistryClient>,
            cache,
            Duration::from_secs(30),
            metrics,
        ));
        let poller = RegistryPoller::new(
            registry,
            manager,
            vec![],
            Duration::from_secs(60),
            0.1,
        );
        for _ in 0..100 {
            let d = poller.jittered_interval();
            assert!(d >= Duration::from_secs(54));
            assert!(d <= Duration::from_secs(66));
        }
    }
}
