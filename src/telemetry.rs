//! Prometheus telemetry
//!
//! Instrument names are contracts with the outside world; label cardinality
//! stays bounded because model names/versions are finite and status labels
//! come from the fixed taxonomy in [`crate::error::PredictError`].

use std::sync::Arc;
use std::time::Duration;

use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, IntCounter, Opts, Registry};

/// Latency buckets for the prediction path, 5ms to 10s.
const PREDICTION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

/// Coarser buckets for model loads, which include artifact download.
const LOAD_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// All server instruments behind one shared registry.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    pub predictions_total: CounterVec,
    pub prediction_duration: HistogramVec,
    pub model_loads_total: CounterVec,
    pub model_load_duration: HistogramVec,
    pub current_model_version: GaugeVec,
    pub feature_cache_hits: IntCounter,
    pub feature_cache_misses: IntCounter,
    pub prediction_cache_hits: IntCounter,
    pub prediction_cache_misses: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let predictions_total = CounterVec::new(
            Opts::new("ml_predictions_total", "Total predictions made"),
            &["model_name", "model_version", "status"],
        )
        .expect("failed to create predictions_total counter");

        let prediction_duration = HistogramVec::new(
            HistogramOpts::new(
                "ml_prediction_duration_seconds",
                "Prediction latency in seconds",
            )
            .buckets(PREDICTION_BUCKETS.to_vec()),
            &["model_name", "model_version"],
        )
        .expect("failed to create prediction_duration histogram");

        let model_loads_total = CounterVec::new(
            Opts::new("ml_model_loads_total", "Total model loads"),
            &["model_name", "model_version", "status"],
        )
        .expect("failed to create model_loads_total counter");

        let model_load_duration = HistogramVec::new(
            HistogramOpts::new(
                "ml_model_load_duration_seconds",
                "Model load duration in seconds",
            )
            .buckets(LOAD_BUCKETS.to_vec()),
            &["model_name", "model_version"],
        )
        .expect("failed to create model_load_duration histogram");

        let current_model_version = GaugeVec::new(
            Opts::new(
                "ml_current_model_version",
                "Currently published model version",
            ),
            &["model_name"],
        )
        .expect("failed to create current_model_version gauge");

        let feature_cache_hits = IntCounter::new(
            "ml_feature_cache_hits_total",
            "Feature cache Tier-1 hits",
        )
        .expect("failed to create feature_cache_hits counter");

        let feature_cache_misses = IntCounter::new(
            "ml_feature_cache_misses_total",
            "Feature cache Tier-1 misses",
        )
        .expect("failed to create feature_cache_misses counter");

        let prediction_cache_hits = IntCounter::new(
            "ml_prediction_cache_hits_total",
            "Prediction cache hits",
        )
        .expect("failed to create prediction_cache_hits counter");

        let prediction_cache_misses = IntCounter::new(
            "ml_prediction_cache_misses_total",
            "Prediction cache misses",
        )
        .expect("failed to create prediction_cache_misses counter");

        for collector in [
            Box::new(predictions_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(prediction_duration.clone()),
            Box::new(model_loads_total.clone()),
            Box::new(model_load_duration.clone()),
            Box::new(current_model_version.clone()),
            Box::new(feature_cache_hits.clone()),
            Box::new(feature_cache_misses.clone()),
            Box::new(prediction_cache_hits.clone()),
            Box::new(prediction_cache_misses.clone()),
        ] {
            registry
                .register(collector)
                .expect("failed to register collector");
        }

        Self {
            registry: Arc::new(registry),
            predictions_total,
            prediction_duration,
            model_loads_total,
            model_load_duration,
            current_model_version,
            feature_cache_hits,
            feature_cache_misses,
            prediction_cache_hits,
            prediction_cache_misses,
        }
    }

    /// Record one completed prediction request.
    pub fn record_prediction(&self, model: &str, version: &str, status: &str, latency: Duration) {
        self.predictions_total
            .with_label_values(&[model, version, status])
            .inc();
        if status == "success" || status == "cache_hit" {
            self.prediction_duration
                .with_label_values(&[model, version])
                .observe(latency.as_secs_f64());
        }
    }

    /// Record the outcome of a model load.
    pub fn record_load(&self, model: &str, version: &str, status: &str, duration: Duration) {
        self.model_loads_total
            .with_label_values(&[model, version, status])
            .inc();
        if status == "success" {
            self.model_load_duration
                .with_label_values(&[model, version])
                .observe(duration.as_secs_f64());
            self.current_model_version
                .with_label_values(&[model])
                .set(version.parse::<f64>().unwrap_or(0.0));
        }
    }

    /// Prometheus text exposition of every registered instrument.
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
