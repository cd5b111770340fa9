//! Error taxonomy
//!
//! Every component boundary returns typed errors; the HTTP layer maps them
//! to status codes and telemetry labels. Panics are reserved for programmer
//! error (e.g. publishing a handle that failed validation).

use thiserror::Error;

/// Errors from the model registry client.
#[derive(Debug, Error, Clone)]
pub enum RegistryError {
    /// Model or version does not exist. Terminal for the current cycle.
    #[error("model not found: {0}")]
    NotFound(String),

    /// Alias does not resolve for the model.
    #[error("alias '{alias}' not found for model '{model}'")]
    AliasNotFound { model: String, alias: String },

    /// Timeouts, 5xx and similar. Retryable with capped backoff.
    #[error("transient registry failure: {0}")]
    Transient(String),

    /// Schema descriptor missing or unreadable. Terminal for the cycle.
    #[error("registry schema error: {0}")]
    Schema(String),
}

impl RegistryError {
    /// Whether the retry loop should attempt again.
    pub fn is_transient(&self) -> bool {
        matches!(self, RegistryError::Transient(_))
    }
}

/// Errors while materializing an artifact into a predictor.
///
/// Load failures never take down the process and never touch the currently
/// published handle; the next poll tick retries.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("malformed artifact: {0}")]
    Malformed(String),

    #[error("artifact declares no input schema")]
    MissingSchema,

    #[error("schema arity {schema} does not match predictor arity {predictor}")]
    ArityMismatch { schema: usize, predictor: usize },

    #[error("embedded schema disagrees with registry schema: {0}")]
    SchemaConflict(String),

    #[error("smoke validation failed: {0}")]
    Validation(String),
}

/// Request-level schema violations. Returned as 400.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("missing required feature '{0}'")]
    MissingFeature(String),

    #[error("unknown feature '{0}'")]
    UnknownFeature(String),

    #[error("feature '{field}' has type {got}, expected {expected}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        got: &'static str,
    },

    #[error("model name must be nonempty")]
    EmptyModelName,

    #[error("model version '{0}' is neither 'latest' nor a numeric version")]
    BadVersionSelector(String),

    #[error("features object must be nonempty")]
    EmptyFeatures,

    #[error("batch of {got} instances exceeds the {max} instance limit")]
    BatchTooLarge { got: usize, max: usize },
}

/// Errors against the feature store tiers.
#[derive(Debug, Error, Clone)]
pub enum FeatureStoreError {
    #[error("feature store backend failure: {0}")]
    Backend(String),

    #[error("failed to decode cached feature row: {0}")]
    Decode(String),
}

/// Inference failures. Non-retryable.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PredictorError {
    #[error("input vector has {got} features, predictor expects {expected}")]
    ArityMismatch { expected: usize, got: usize },

    #[error("malformed predictor: {0}")]
    Malformed(String),

    #[error("predictor does not support probabilities")]
    ProbabilitiesUnsupported,

    #[error("prediction produced a non-finite value")]
    NonFinite,
}

/// End-to-end prediction pipeline errors.
#[derive(Debug, Error)]
pub enum PredictError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("model '{name}' {selector} is not loaded")]
    ModelNotReady { name: String, selector: String },

    #[error(transparent)]
    FeatureStore(#[from] FeatureStoreError),

    #[error(transparent)]
    Predictor(#[from] PredictorError),

    #[error("request deadline exceeded")]
    Timeout,
}

impl PredictError {
    /// Telemetry status label. The taxonomy is fixed; labels stay bounded.
    pub fn status_label(&self) -> &'static str {
        match self {
            PredictError::Validation(_) => "validation_error",
            PredictError::ModelNotReady { .. } => "model_not_ready",
            PredictError::FeatureStore(_) => "feature_store_error",
            PredictError::Predictor(_) => "predictor_error",
            PredictError::Timeout => "timeout",
        }
    }
}

/// Startup configuration errors. Fatal: the process exits non-zero.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("malformed preload entry '{0}', expected name:version or name:alias")]
    BadPreloadEntry(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_labels_match_taxonomy() {
        let cases: Vec<(PredictError, &str)> = vec![
            (
                PredictError::Validation(ValidationError::EmptyModelName),
                "validation_error",
            ),
            (
                PredictError::ModelNotReady {
                    name: "m".into(),
                    selector: "latest".into(),
                },
                "model_not_ready",
            ),
            (
                PredictError::FeatureStore(FeatureStoreError::Backend("down".into())),
                "feature_store_error",
            ),
            (
                PredictError::Predictor(PredictorError::NonFinite),
                "predictor_error",
            ),
            (PredictError::Timeout, "timeout"),
        ];
        for (err, label) in cases {
            assert_eq!(err.status_label(), label);
        }
    }

    #[test]
    fn transient_detection() {
        assert!(RegistryError::Transient("502".into()).is_transient());
        assert!(!RegistryError::NotFound("m".into()).is_transient());
    }
}
