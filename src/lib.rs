//! mlserve - Real-time ML inference server
//!
//! A long-lived serving process that tracks a remote model registry,
//! hot-swaps model artifacts without dropping in-flight requests, caches
//! recent predictions and serves a low-latency prediction API.
//!
//! # Architecture
//!
//! - **registry**: read-only client surface over the external model registry
//! - **loader**: turns downloaded artifacts into validated model handles
//! - **manager**: owns the live handle set and performs atomic swaps
//! - **poller**: reconciles desired vs. published versions in the background
//! - **features**: two-tier read-through feature store client
//! - **pipeline**: the request path from validation to telemetry
//! - **server**: axum HTTP front end with back-pressure and readiness
//!
//! # Example
//!
//! ```bash
//! # Serve with a preloaded model tracked in production
//! MLSERVE_PRELOAD_MODELS=fraud_detector:production mlserve --listen-addr 0.0.0.0:8080
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod features;
pub mod loader;
pub mod manager;
pub mod pipeline;
pub mod poller;
pub mod predictor;
pub mod registry;
pub mod schema;
pub mod server;
pub mod telemetry;
pub mod transform;

// Re-export key types
pub use cache::{FingerprintKey, PredictionCache};
pub use config::Config;
pub use features::{FeatureKey, FeatureRow, FeatureStoreClient};
pub use loader::ModelHandle;
pub use manager::ModelManager;
pub use pipeline::{PredictionPipeline, PredictionRequest, PredictionResponse};
pub use predictor::Predictor;
pub use registry::{InMemoryRegistry, RegistryClient, Stage, Version};
pub use schema::{FeatureValue, InputSchema};
pub use telemetry::Metrics;
