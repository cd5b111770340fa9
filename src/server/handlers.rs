//! HTTP request handlers

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Json, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::config::Config;
use crate::error::PredictError;
use crate::features::FeatureStoreClient;
use crate::manager::{ModelManager, ModelSummary};
use crate::pipeline::{PredictionPipeline, PredictionRequest, PredictionResponse};
use crate::poller::{PollerState, RegistryPoller};
use crate::registry::{RegistryClient, VersionSelector};
use crate::schema::FeatureValue;
use crate::telemetry::Metrics;

/// Instances processed concurrently within one batch request.
const BATCH_CONCURRENCY: usize = 8;

/// Upper bound on instances per batch request.
const MAX_BATCH_SIZE: usize = 1000;

/// Shared application state
pub struct AppState {
    pub pipeline: PredictionPipeline,
    pub manager: Arc<ModelManager>,
    pub registry: Arc<dyn RegistryClient>,
    pub features: Arc<FeatureStoreClient>,
    pub metrics: Metrics,
    pub config: Config,
    pub poller_state: Arc<PollerState>,
    pub tracked: Vec<String>,

    /// Admission control: permits mirror the pending-request queue bound.
    pub admission: Semaphore,

    /// An empty preload list means readiness does not wait for a model.
    pub preload_empty: bool,
}

/// Liveness. Always 200 while the process is up; dependency state is
/// reported in the body, not the status code.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let registry_check = match state.tracked.first() {
        Some(name) => {
            let probe = tokio::time::timeout(
                std::time::Duration::from_millis(500),
                state.registry.list_versions(name),
            )
            .await;
            match probe {
                Ok(Ok(_)) => "healthy",
                Ok(Err(_)) | Err(_) => "unhealthy",
            }
        }
        None => "unavailable",
    };

    let feature_store_check = match tokio::time::timeout(
        std::time::Duration::from_millis(500),
        state.features.probe(),
    )
    .await
    {
        Ok(true) => "healthy",
        Ok(false) | Err(_) => "unhealthy",
    };

    let status = if registry_check == "unhealthy" || feature_store_check == "unhealthy" {
        "degraded"
    } else {
        "healthy"
    };

    Json(HealthResponse {
        status: status.to_string(),
        timestamp: Utc::now(),
        checks: HealthChecks {
            api: "healthy".to_string(),
            registry: registry_check.to_string(),
            feature_store: feature_store_check.to_string(),
        },
    })
}

/// Readiness: 200 only once a model is published, unless nothing was
/// configured to preload.
pub async fn ready(State(state): State<Arc<AppState>>) -> Response {
    if state.manager.any_loaded() || state.preload_empty {
        (StatusCode::OK, Json(ReadyResponse { ready: true })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::RETRY_AFTER, "1")],
            Json(ReadyResponse { ready: false }),
        )
            .into_response()
    }
}

/// Single prediction endpoint
pub async fn predict(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PredictionRequest>,
) -> Response {
    let _permit = match state.admission.try_acquire() {
        Ok(permit) => permit,
        Err(_) => return queue_full_response(),
    };
    run_single(&state, request).await
}

async fn run_single(state: &AppState, request: PredictionRequest) -> Response {
    let started = Instant::now();
    let model_name = request.model_name.clone();
    let version_label = request
        .model_version
        .clone()
        .unwrap_or_else(|| "latest".to_string());

    match tokio::time::timeout(state.config.request_timeout(), state.pipeline.predict(request))
        .await
    {
        Ok(Ok(response)) => {
            let request_id = response.request_id.to_string();
            (
                StatusCode::OK,
                [(header::HeaderName::from_static("x-request-id"), request_id)],
                Json(response),
            )
                .into_response()
        }
        Ok(Err(err)) => error_response(err),
        Err(_) => {
            // The pipeline future was dropped before recording anything.
            state.metrics.record_prediction(
                &model_name,
                &version_label,
                "timeout",
                started.elapsed(),
            );
            error_response(PredictError::Timeout)
        }
    }
}

/// Batch prediction endpoint
///
/// Instances run through a bounded worker pool; results come back in
/// request order and per-item failures do not abort the batch.
pub async fn predict_batch(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BatchPredictionRequest>,
) -> Response {
    let _permit = match state.admission.try_acquire() {
        Ok(permit) => permit,
        Err(_) => return queue_full_response(),
    };

    let BatchPredictionRequest {
        model_name,
        model_version,
        instances,
        return_probabilities,
    } = request;

    if instances.is_empty() {
        return error_response(PredictError::Validation(
            crate::error::ValidationError::EmptyFeatures,
        ));
    }
    if instances.len() > MAX_BATCH_SIZE {
        return error_response(PredictError::Validation(
            crate::error::ValidationError::BatchTooLarge {
                got: instances.len(),
                max: MAX_BATCH_SIZE,
            },
        ));
    }

    let results: Vec<BatchItem> = futures::stream::iter(instances.into_iter().map(
        |features| {
            let item = PredictionRequest {
                model_name: model_name.clone(),
                model_version: model_version.clone(),
                features,
                return_probabilities,
                request_id: None,
                entity_id: None,
                feature_group: None,
            };
            let state = Arc::clone(&state);
            async move {
                let started = Instant::now();
                let model_name = item.model_name.clone();
                let version_label = item
                    .model_version
                    .clone()
                    .unwrap_or_else(|| "latest".to_string());
                match tokio::time::timeout(
                    state.config.request_timeout(),
                    state.pipeline.predict(item),
                )
                .await
                {
                    Ok(Ok(response)) => BatchItem::Ok(Box::new(response)),
                    Ok(Err(err)) => BatchItem::Err(BatchItemError::from(&err)),
                    Err(_) => {
                        state.metrics.record_prediction(
                            &model_name,
                            &version_label,
                            "timeout",
                            started.elapsed(),
                        );
                        BatchItem::Err(BatchItemError::from(&PredictError::Timeout))
                    }
                }
            }
        },
    ))
    .buffered(BATCH_CONCURRENCY)
    .collect()
    .await;

    (
        StatusCode::OK,
        Json(BatchPredictionResponse {
            batch_size: results.len(),
            results,
        }),
    )
        .into_response()
}

/// List currently published models
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<Vec<ModelSummary>> {
    Json(state.manager.list())
}

/// Enqueue load intents; returns 202 immediately.
pub async fn reload_models(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ReloadRequest>,
) -> impl IntoResponse {
    let targets: Vec<(String, VersionSelector)> = match request.name {
        Some(name) => {
            let selector = request
                .version
                .as_deref()
                .map(|raw| raw.parse().expect("selector parse is infallible"))
                .unwrap_or_else(|| VersionSelector::Alias("production".into()));
            vec![(name, selector)]
        }
        None => state
            .tracked
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    VersionSelector::Alias("production".to_string()),
                )
            })
            .collect(),
    };

    for (name, selector) in &targets {
        let manager = Arc::clone(&state.manager);
        let name = name.clone();
        let selector = selector.clone();
        tokio::spawn(async move {
            match manager.resolve_selector(&name, &selector).await {
                Ok(version) => manager.submit_load(&name, version),
                Err(err) => {
                    tracing::warn!(model = %name, selector = %selector, error = %err, "reload resolution failed")
                }
            }
        });
    }

    (
        StatusCode::ACCEPTED,
        Json(ReloadResponse {
            accepted: targets.iter().map(|(name, _)| name.clone()).collect(),
            timestamp: Utc::now(),
        }),
    )
}

/// Poller status surface
pub async fn update_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(RegistryPoller::status(
        &state.poller_state,
        &state.manager,
        &state.tracked,
        state.config.poller_interval(),
    ))
}

/// Prometheus scrape endpoint
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.gather(),
    )
}

fn queue_full_response() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, "1")],
        Json(ErrorResponse {
            error: "queue_full".to_string(),
            message: "request queue is full, retry shortly".to_string(),
            timestamp: Utc::now(),
            request_id: None,
        }),
    )
        .into_response()
}

/// Map pipeline errors onto status codes and the error wire shape.
fn error_response(err: PredictError) -> Response {
    let status = match &err {
        PredictError::Validation(_) => StatusCode::BAD_REQUEST,
        PredictError::ModelNotReady { .. } => StatusCode::SERVICE_UNAVAILABLE,
        PredictError::FeatureStore(_) => StatusCode::BAD_GATEWAY,
        PredictError::Predictor(_) => StatusCode::INTERNAL_SERVER_ERROR,
        PredictError::Timeout => StatusCode::GATEWAY_TIMEOUT,
    };
    let body = Json(ErrorResponse {
        error: err.status_label().to_string(),
        message: err.to_string(),
        timestamp: Utc::now(),
        request_id: None,
    });
    if status == StatusCode::SERVICE_UNAVAILABLE {
        (status, [(header::RETRY_AFTER, "5")], body).into_response()
    } else {
        (status, body).into_response()
    }
}

// Request/Response types

#[derive(Debug, Deserialize)]
pub struct BatchPredictionRequest {
    pub model_name: String,

    #[serde(default)]
    pub model_version: Option<String>,

    pub instances: Vec<std::collections::BTreeMap<String, FeatureValue>>,

    #[serde(default = "default_true")]
    pub return_probabilities: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum BatchItem {
    Ok(Box<PredictionResponse>),
    Err(BatchItemError),
}

#[derive(Debug, Serialize)]
pub struct BatchItemError {
    pub error: String,
    pub message: String,
}

impl From<&PredictError> for BatchItemError {
    fn from(err: &PredictError) -> Self {
        Self {
            error: err.status_label().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BatchPredictionResponse {
    pub results: Vec<BatchItem>,
    pub batch_size: usize,
}

#[derive(Debug, Deserialize)]
pub struct ReloadRequest {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReloadResponse {
    pub accepted: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub checks: HealthChecks,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub api: String,
    pub registry: String,
    pub feature_store: String,
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
}
