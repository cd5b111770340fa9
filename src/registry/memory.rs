//! In-memory registry
//!
//! Backs tests and local demos. Artifacts are registered up front; alias
//! moves and injected transient failures drive the poller and retry paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::RegistryError;
use crate::registry::{ArtifactPayload, RegistryClient, Stage, Version};
use crate::schema::InputSchema;

#[derive(Debug, Clone)]
struct StoredVersion {
    stage: Stage,
    artifact: Vec<u8>,
    schema: Option<InputSchema>,
}

#[derive(Debug, Default)]
struct ModelRecord {
    versions: HashMap<u64, StoredVersion>,
    aliases: HashMap<String, u64>,
}

/// Registry held entirely in process.
#[derive(Default)]
pub struct InMemoryRegistry {
    models: RwLock<HashMap<String, ModelRecord>>,

    /// Remaining calls that fail with a transient error before recovering.
    fail_next: AtomicU32,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an artifact for `(model, version)`, replacing any existing one.
    pub fn register(
        &self,
        model: &str,
        version: u64,
        stage: Stage,
        artifact: Vec<u8>,
        schema: Option<InputSchema>,
    ) {
        let mut models = self.models.write().expect("registry lock poisoned");
        let record = models.entry(model.to_string()).or_default();
        record.versions.insert(
            version,
            StoredVersion {
                stage,
                artifact,
                schema,
            },
        );
    }

    /// Point an alias at a version. The version must exist.
    pub fn set_alias(&self, model: &str, alias: &str, version: u64) {
        let mut models = self.models.write().expect("registry lock poisoned");
        let record = models.entry(model.to_string()).or_default();
        assert!(
            record.versions.contains_key(&version),
            "alias target {model}:{version} is not registered"
        );
        record.aliases.insert(alias.to_string(), version);
    }

    /// Change the stage label of a version.
    pub fn set_stage(&self, model: &str, version: u64, stage: Stage) {
        let mut models = self.models.write().expect("registry lock poisoned");
        if let Some(stored) = models
            .get_mut(model)
            .and_then(|r| r.versions.get_mut(&version))
        {
            stored.stage = stage;
        }
    }

    /// Make the next `n` calls fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    fn check_injected_failure(&self) -> Result<(), RegistryError> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .fail_next
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(RegistryError::Transient("injected failure".into()));
        }
        Ok(())
    }

    fn version_of(&self, record: &ModelRecord, id: u64) -> Version {
        let stage = record
            .versions
            .get(&id)
            .map(|v| v.stage)
            .unwrap_or(Stage::None);
        let aliases = record
            .aliases
            .iter()
            .filter(|(_, target)| **target == id)
            .map(|(name, _)| name.clone())
            .collect();
        Version { id, stage, aliases }
    }
}

#[async_trait]
impl RegistryClient for InMemoryRegistry {
    async fn list_versions(&self, model: &str) -> Result<Vec<Version>, RegistryError> {
        self.check_injected_failure()?;
        let models = self.models.read().expect("registry lock poisoned");
        let record = models
            .get(model)
            .ok_or_else(|| RegistryError::NotFound(model.to_string()))?;
        let mut versions: Vec<Version> = record
            .versions
            .keys()
            .map(|id| self.version_of(record, *id))
            .collect();
        versions.sort_by_key(|v| v.id);
        Ok(versions)
    }

    async fn resolve_alias(&self, model: &str, alias: &str) -> Result<Version, RegistryError> {
        self.check_injected_failure()?;
        let models = self.models.read().expect("registry lock poisoned");
        let record = models
            .get(model)
            .ok_or_else(|| RegistryError::NotFound(model.to_string()))?;
        let id = record
            .aliases
            .get(alias)
            .ok_or_else(|| RegistryError::AliasNotFound {
                model: model.to_string(),
                alias: alias.to_string(),
            })?;
        Ok(self.version_of(record, *id))
    }

    async fn fetch_artifact(
        &self,
        model: &str,
        version: u64,
    ) -> Result<ArtifactPayload, RegistryError> {
        self.check_injected_failure()?;
        let models = self.models.read().expect("registry lock poisoned");
        let stored = models
            .get(model)
            .and_then(|r| r.versions.get(&version))
            .ok_or_else(|| RegistryError::NotFound(format!("{model}:{version}")))?;
        Ok(ArtifactPayload {
            bytes: stored.artifact.clone(),
            schema: stored.schema.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn alias_resolution_and_listing() {
        let registry = InMemoryRegistry::new();
        registry.register("fraud", 1, Stage::Production, b"v1".to_vec(), None);
        registry.register("fraud", 2, Stage::Staging, b"v2".to_vec(), None);
        registry.set_alias("fraud", "production", 1);

        let versions = registry.list_versions("fraud").await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].id, 1);

        let resolved = registry.resolve_alias("fraud", "production").await.unwrap();
        assert_eq!(resolved.id, 1);
        assert!(resolved.aliases.contains(&"production".to_string()));
    }

    #[tokio::test]
    async fn unknown_model_is_not_found() {
        let registry = InMemoryRegistry::new();
        assert!(matches!(
            registry.list_versions("ghost").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn injected_failures_are_transient_and_bounded() {
        let registry = InMemoryRegistry::new();
        registry.register("m", 1, Stage::Production, vec![], None);
        registry.fail_next(1);
        assert!(matches!(
            registry.list_versions("m").await,
            Err(RegistryError::Transient(_))
        ));
        assert!(registry.list_versions("m").await.is_ok());
    }
}
