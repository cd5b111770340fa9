//! Prediction pipeline
//!
//! The end-to-end request path: validate, resolve a model handle, consult
//! the prediction cache, fetch supplementary features, assemble the vector,
//! invoke the predictor and record telemetry. Requests run concurrently;
//! the only shared mutable state touched is the two caches.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::{CachedPrediction, FingerprintKey, PredictionCache};
use crate::error::{PredictError, ValidationError};
use crate::features::{FeatureKey, FeatureStoreClient};
use crate::loader::ModelHandle;
use crate::manager::ModelManager;
use crate::schema::FeatureValue;
use crate::telemetry::Metrics;

/// A single prediction request.
#[derive(Debug, Clone, Deserialize)]
pub struct PredictionRequest {
    pub model_name: String,

    /// "latest" (or absent) for the current handle, or an exact numeric
    /// version which may still be draining.
    #[serde(default)]
    pub model_version: Option<String>,

    pub features: BTreeMap<String, FeatureValue>,

    #[serde(default = "default_return_probabilities")]
    pub return_probabilities: bool,

    /// Minted when the client does not supply one.
    #[serde(default)]
    pub request_id: Option<Uuid>,

    /// Enables supplementary feature retrieval from the feature store.
    #[serde(default)]
    pub entity_id: Option<String>,

    /// Feature group for supplementary retrieval; defaults to the model name.
    #[serde(default)]
    pub feature_group: Option<String>,
}

fn default_return_probabilities() -> bool {
    true
}

/// A completed prediction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub prediction: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probabilities: Option<Vec<f64>>,
    pub model_name: String,
    pub model_version: String,
    pub latency_ms: f64,
    pub cache_hit: bool,
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

/// How a model version was requested.
enum Selector {
    Latest,
    Exact(u64),
}

impl Selector {
    fn parse(raw: Option<&str>) -> Result<Self, ValidationError> {
        match raw {
            None | Some("latest") => Ok(Selector::Latest),
            Some(raw) => raw
                .parse::<u64>()
                .map(Selector::Exact)
                .map_err(|_| ValidationError::BadVersionSelector(raw.to_string())),
        }
    }

    fn label(&self) -> String {
        match self {
            Selector::Latest => "latest".to_string(),
            Selector::Exact(v) => v.to_string(),
        }
    }
}

pub struct PredictionPipeline {
    manager: Arc<ModelManager>,
    features: Arc<FeatureStoreClient>,
    cache: Arc<PredictionCache>,
    metrics: Metrics,
}

impl PredictionPipeline {
    pub fn new(
        manager: Arc<ModelManager>,
        features: Arc<FeatureStoreClient>,
        cache: Arc<PredictionCache>,
        metrics: Metrics,
    ) -> Self {
        Self {
            manager,
            features,
            cache,
            metrics,
        }
    }

    /// Run one request through the full pipeline.
    ///
    /// Exactly one `ml_predictions_total` increment happens per call,
    /// whatever the outcome. Timeouts are recorded by the HTTP layer, which
    /// owns the deadline.
    pub async fn predict(
        &self,
        request: PredictionRequest,
    ) -> Result<PredictionResponse, PredictError> {
        let started = Instant::now();
        let version_label = request
            .model_version
            .clone()
            .unwrap_or_else(|| "latest".to_string());

        match self.predict_inner(&request, started).await {
            Ok(response) => {
                let status = if response.cache_hit { "cache_hit" } else { "success" };
                self.metrics.record_prediction(
                    &request.model_name,
                    &response.model_version,
                    status,
                    started.elapsed(),
                );
                Ok(response)
            }
            Err(err) => {
                self.metrics.record_prediction(
                    &request.model_name,
                    &version_label,
                    err.status_label(),
                    started.elapsed(),
                );
                Err(err)
            }
        }
    }

    async fn predict_inner(
        &self,
        request: &PredictionRequest,
        started: Instant,
    ) -> Result<PredictionResponse, PredictError> {
        if request.model_name.is_empty() {
            return Err(ValidationError::EmptyModelName.into());
        }
        if request.features.is_empty() {
            return Err(ValidationError::EmptyFeatures.into());
        }
        let selector = Selector::parse(request.model_version.as_deref())?;

        // One handle per request, chosen here and held to the end.
        let handle = self.resolve(&request.model_name, &selector)?;

        let mut features = request.features.clone();
        check_types(&handle, &features)?;
        handle.schema.apply_defaults(&mut features);

        // Missing-field rejection is deferred when the feature store can
        // still supply values for this entity.
        if request.entity_id.is_none() {
            reject_missing(&handle, &features)?;
        }

        let fingerprint =
            FingerprintKey::new(&handle.name, handle.version, &features);
        if let Some(cached) = self.cache.get(&fingerprint) {
            return Ok(self.response_from(&cached, request, started, true));
        }

        if let Some(entity_id) = &request.entity_id {
            self.merge_supplementary(entity_id, request, &handle, &mut features)
                .await?;
            reject_missing(&handle, &features)?;
        }

        let vector = handle.schema.assemble(&features)?;
        let prediction = handle.predictor.predict(&vector)?;
        // Probabilities are derived from the same inference, so both forms
        // are computed and cached regardless of what this caller asked for.
        let probabilities = if handle.predictor.supports_probabilities() {
            Some(handle.predictor.predict_proba(&vector)?)
        } else {
            None
        };

        let cached = CachedPrediction {
            prediction,
            probabilities,
            model_name: handle.name.clone(),
            model_version: handle.version,
        };
        self.cache.insert(fingerprint, cached.clone());

        Ok(self.response_from(&cached, request, started, false))
    }

    fn resolve(
        &self,
        name: &str,
        selector: &Selector,
    ) -> Result<Arc<ModelHandle>, PredictError> {
        let handle = match selector {
            Selector::Latest => self.manager.current(name),
            Selector::Exact(version) => self.manager.find_version(name, *version),
        };
        handle.ok_or_else(|| PredictError::ModelNotReady {
            name: name.to_string(),
            selector: selector.label(),
        })
    }

    /// Fetch the entity's stored features and merge them under the request
    /// values. One inline retry; a second failure only surfaces when the
    /// request still needs the values.
    async fn merge_supplementary(
        &self,
        entity_id: &str,
        request: &PredictionRequest,
        handle: &ModelHandle,
        features: &mut BTreeMap<String, FeatureValue>,
    ) -> Result<(), PredictError> {
        let group = request
            .feature_group
            .clone()
            .unwrap_or_else(|| handle.name.clone());
        let key = FeatureKey::new(entity_id, group);

        let row = match self.features.get(&key).await {
            Ok(row) => Ok(row),
            Err(first) => {
                tracing::warn!(entity_id, error = %first, "feature fetch failed, retrying once");
                self.features.get(&key).await
            }
        };

        match row {
            Ok(Some(row)) => {
                for (name, value) in row.values {
                    // Request values win; only schema fields merge in.
                    if handle.schema.field(&name).is_some() {
                        features.entry(name).or_insert(value);
                    }
                }
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => {
                if missing_fields(handle, features).is_empty() {
                    tracing::warn!(entity_id, error = %err, "ignoring feature store failure, request is complete");
                    Ok(())
                } else {
                    Err(err.into())
                }
            }
        }
    }

    fn response_from(
        &self,
        cached: &CachedPrediction,
        request: &PredictionRequest,
        started: Instant,
        cache_hit: bool,
    ) -> PredictionResponse {
        PredictionResponse {
            prediction: cached.prediction,
            probabilities: if request.return_probabilities {
                cached.probabilities.clone()
            } else {
                None
            },
            model_name: cached.model_name.clone(),
            model_version: cached.model_version.to_string(),
            latency_ms: started.elapsed().as_secs_f64() * 1000.0,
            cache_hit,
            request_id: request.request_id.unwrap_or_else(Uuid::new_v4),
            timestamp: Utc::now(),
        }
    }
}

/// Reject unknown fields and dtype mismatches. Missing fields are checked
/// separately so supplementary retrieval can fill them first.
fn check_types(
    handle: &ModelHandle,
    features: &BTreeMap<String, FeatureValue>,
) -> Result<(), ValidationError> {
    for (name, value) in features {
        match handle.schema.field(name) {
            None => return Err(ValidationError::UnknownFeature(name.clone())),
            Some(field) => {
                if !field.dtype.accepts(value) {
                    return Err(ValidationError::TypeMismatch {
                        field: name.clone(),
                        expected: field.dtype.name(),
                        got: value.type_name(),
                    });
                }
            }
        }
    }
    Ok(())
}

fn missing_fields(
    handle: &ModelHandle,
    features: &BTreeMap<String, FeatureValue>,
) -> Vec<String> {
    handle
        .schema
        .fields
        .iter()
        .filter(|f| {
            f.required
                && !features.contains_key(&f.name)
                && f.default.is_none()
                && !matches!(&f.transform, Some(t) if t.imputes_missing())
        })
        .map(|f| f.name.clone())
        .collect()
}

fn reject_missing(
    handle: &ModelHandle,
    features: &BTreeMap<String, FeatureValue>,
) -> Result<(), ValidationError> {
    match missing_fields(handle, features).into_iter().next() {
        Some(field) => Err(ValidationError::MissingFeature(field)),
        None => Ok(()),
    }
}
