//! Model registry client
//!
//! The registry itself is an external system; the core consumes it through
//! [`RegistryClient`]. Implementations exist per backend (the in-memory one
//! here serves tests and demos); the server never hard-codes a specific
//! registry.

mod memory;

pub use memory::InMemoryRegistry;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::schema::InputSchema;

/// Registry-assigned lifecycle label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Staging,
    Production,
    Archived,
    None,
}

/// One registered version of a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    pub id: u64,
    pub stage: Stage,

    /// Named pointers such as "production".
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// How a desired version is specified: a numeric id or a named alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSelector {
    Version(u64),
    Alias(String),
}

impl std::str::FromStr for VersionSelector {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.parse::<u64>() {
            Ok(id) => VersionSelector::Version(id),
            Err(_) => VersionSelector::Alias(s.to_string()),
        })
    }
}

impl std::fmt::Display for VersionSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionSelector::Version(id) => write!(f, "{id}"),
            VersionSelector::Alias(alias) => f.write_str(alias),
        }
    }
}

/// A downloaded artifact plus the registry-adjacent schema descriptor.
///
/// The schema may instead be embedded in the artifact bytes; the loader
/// accepts either source and cross-checks when both are present.
#[derive(Debug, Clone)]
pub struct ArtifactPayload {
    pub bytes: Vec<u8>,
    pub schema: Option<InputSchema>,
}

/// Read-only registry surface the core depends on.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// All registered versions of a model.
    async fn list_versions(&self, model: &str) -> Result<Vec<Version>, RegistryError>;

    /// Resolve a named alias to a version.
    async fn resolve_alias(&self, model: &str, alias: &str) -> Result<Version, RegistryError>;

    /// Download artifact bytes and the adjacent schema descriptor.
    async fn fetch_artifact(
        &self,
        model: &str,
        version: u64,
    ) -> Result<ArtifactPayload, RegistryError>;
}

/// Backoff schedule for transient registry failures: 0.5s, 1s, 2s, 4s, 8s.
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const MAX_ATTEMPTS: u32 = 5;

/// Run a registry call with capped exponential backoff.
///
/// Only transient errors retry; `NotFound` and schema errors are terminal
/// for the cycle and surface immediately.
pub async fn with_retry<T, F, Fut>(op_name: &str, mut op: F) -> Result<T, RegistryError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, RegistryError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                let delay = BACKOFF_BASE * 2u32.pow(attempt);
                tracing::warn!(
                    op = op_name,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient registry failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Pick the desired production version from a version list.
///
/// Highest numeric id with stage `production` wins; returns `None` when no
/// version is in production.
pub fn production_version(versions: &[Version]) -> Option<&Version> {
    versions
        .iter()
        .filter(|v| v.stage == Stage::Production)
        .max_by_key(|v| v.id)
}
