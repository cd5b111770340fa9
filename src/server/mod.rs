//! HTTP server assembly
//!
//! Wires the manager, pipeline, poller and telemetry into one axum
//! application and runs it with graceful shutdown.

mod handlers;
mod routes;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::cache::PredictionCache;
use crate::config::Config;
use crate::error::ConfigError;
use crate::features::{FeatureStoreClient, KvBackend, TableBackend};
use crate::manager::ModelManager;
use crate::pipeline::PredictionPipeline;
use crate::poller::RegistryPoller;
use crate::registry::RegistryClient;
use crate::telemetry::Metrics;

pub use handlers::AppState;
pub use routes::api_routes;

/// Build the shared state and the (not yet spawned) poller.
pub fn build_state(
    config: Config,
    registry: Arc<dyn RegistryClient>,
    tier1: Arc<dyn KvBackend>,
    tier2: Arc<dyn TableBackend>,
) -> Result<(Arc<AppState>, RegistryPoller), ConfigError> {
    config.validate()?;
    let preload = config.preload_specs()?;
    let tracked: Vec<String> = preload.iter().map(|s| s.name.clone()).collect();

    let metrics = Metrics::new();
    let prediction_cache = Arc::new(PredictionCache::new(
        config.prediction_cache_capacity,
        config.prediction_cache_ttl(),
        metrics.clone(),
    ));
    let manager = Arc::new(ModelManager::new(
        Arc::clone(&registry),
        Arc::clone(&prediction_cache),
        config.drain_window(),
        metrics.clone(),
    ));
    let features = Arc::new(FeatureStoreClient::new(
        tier1,
        tier2,
        config.feature_cache_ttl(),
        metrics.clone(),
    ));
    let pipeline = PredictionPipeline::new(
        Arc::clone(&manager),
        Arc::clone(&features),
        prediction_cache,
        metrics.clone(),
    );

    let poller = RegistryPoller::new(
        Arc::clone(&registry),
        Arc::clone(&manager),
        tracked.clone(),
        config.poller_interval(),
        config.poller_jitter_fraction,
    );

    let state = Arc::new(AppState {
        pipeline,
        manager,
        registry,
        features,
        metrics,
        admission: Semaphore::new(config.request_queue_capacity),
        preload_empty: preload.is_empty(),
        poller_state: poller.state(),
        tracked,
        config,
    });
    Ok((state, poller))
}

/// Assemble the router with middleware.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(api_routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the server until a termination signal, then drain.
pub async fn run(
    config: Config,
    registry: Arc<dyn RegistryClient>,
    tier1: Arc<dyn KvBackend>,
    tier2: Arc<dyn TableBackend>,
) -> Result<()> {
    let addr = config.listen_addr()?;
    let shutdown_deadline = config.shutdown_deadline();
    let warmup_deadline = config.warmup_deadline();
    let preload = config.preload_specs()?;

    let (state, poller) = build_state(config, registry, tier1, tier2)?;

    state.manager.preload(&preload, warmup_deadline).await;
    let poller_handle = tokio::spawn(poller.run());

    let app = router(Arc::clone(&state));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!("server listening on http://{}", addr);
    tracing::info!("API endpoints:");
    tracing::info!("  POST /predict - Single prediction");
    tracing::info!("  POST /predict/batch - Batch prediction");
    tracing::info!("  GET  /models - List published models");
    tracing::info!("  POST /models/reload - Submit load intents");
    tracing::info!("  GET  /health /ready /metrics");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("termination signal received, draining in-flight requests");
        let _ = shutdown_tx.send(true);
    });

    let mut drain_rx = shutdown_rx.clone();
    let graceful = axum::serve(listener, app).with_graceful_shutdown({
        let mut rx = shutdown_rx;
        async move {
            let _ = rx.wait_for(|fired| *fired).await;
        }
    });

    let deadline = async move {
        let _ = drain_rx.wait_for(|fired| *fired).await;
        tokio::time::sleep(shutdown_deadline).await;
    };

    tokio::select! {
        result = graceful => result.context("server error")?,
        _ = deadline => {
            tracing::warn!(
                deadline_s = shutdown_deadline.as_secs(),
                "shutdown deadline elapsed, aborting remaining requests"
            );
        }
    }

    poller_handle.abort();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
