//! Route definitions

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use super::handlers::{
    health, list_models, metrics, predict, predict_batch, ready, reload_models, update_status,
    AppState,
};

/// Create the API router
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Health and readiness
        .route("/health", get(health))
        .route("/ready", get(ready))
        // Prediction endpoints
        .route("/predict", post(predict))
        .route("/predict/batch", post(predict_batch))
        // Model management
        .route("/models", get(list_models))
        .route("/models/reload", post(reload_models))
        .route("/models/updates/status", get(update_status))
        // Telemetry scrape
        .route("/metrics", get(metrics))
}
