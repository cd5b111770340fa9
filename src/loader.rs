//! Artifact loader
//!
//! Materializes downloaded artifact bytes into a validated [`ModelHandle`].
//! Any failure aborts the whole load; nothing is ever partially published.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::LoadError;
use crate::predictor::{Predictor, PredictorSpec};
use crate::registry::{ArtifactPayload, Stage};
use crate::schema::InputSchema;

/// Immutable binding of a model name and version to a predictor.
///
/// Shared by every concurrent request via `Arc`; a retired handle stays
/// valid until the drain window elapses and the last reader drops it.
#[derive(Debug)]
pub struct ModelHandle {
    pub name: String,
    pub version: u64,
    pub stage: Stage,
    pub loaded_at: DateTime<Utc>,
    pub load_duration: Duration,
    pub schema: InputSchema,
    pub predictor: Predictor,
}

/// Wire format of an artifact: the predictor spec plus an optional embedded
/// schema descriptor.
#[derive(Debug, Deserialize)]
struct ArtifactDocument {
    predictor: PredictorSpec,
    #[serde(default)]
    schema: Option<InputSchema>,
}

/// Decode, validate and assemble a handle from a downloaded artifact.
///
/// The schema may be embedded in the artifact or supplied by the registry;
/// when both are present they must agree. The finished predictor is smoke
/// tested on the all-zeros vector before the handle exists at all.
pub fn load_artifact(
    name: &str,
    version: u64,
    stage: Stage,
    payload: ArtifactPayload,
    load_duration: Duration,
) -> Result<ModelHandle, LoadError> {
    let document: ArtifactDocument =
        serde_json::from_slice(&payload.bytes).map_err(|e| LoadError::Malformed(e.to_string()))?;

    let schema = match (document.schema, payload.schema) {
        (Some(embedded), Some(adjacent)) => {
            if embedded != adjacent {
                return Err(LoadError::SchemaConflict(format!(
                    "embedded {} fields, registry {} fields",
                    embedded.field_count(),
                    adjacent.field_count()
                )));
            }
            embedded
        }
        (Some(embedded), None) => embedded,
        (None, Some(adjacent)) => adjacent,
        (None, None) => return Err(LoadError::MissingSchema),
    };

    let predictor =
        Predictor::from_spec(document.predictor).map_err(|e| LoadError::Malformed(e.to_string()))?;

    if schema.input_arity() != predictor.input_arity() {
        return Err(LoadError::ArityMismatch {
            schema: schema.input_arity(),
            predictor: predictor.input_arity(),
        });
    }

    // Canonical smoke test: a predictor that cannot score zeros is refused.
    let zeros = vec![0.0; predictor.input_arity()];
    predictor
        .predict(&zeros)
        .map_err(|e| LoadError::Validation(e.to_string()))?;
    if predictor.supports_probabilities() {
        predictor
            .predict_proba(&zeros)
            .map_err(|e| LoadError::Validation(e.to_string()))?;
    }

    Ok(ModelHandle {
        name: name.to_string(),
        version,
        stage,
        loaded_at: Utc::now(),
        load_duration,
        schema,
        predictor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDtype, SchemaField};

    fn two_field_schema() -> InputSchema {
        InputSchema {
            fields: vec![
                SchemaField {
                    name: "a".into(),
                    dtype: FieldDtype::F64,
                    required: true,
                    default: None,
                    transform: None,
                },
                SchemaField {
                    name: "b".into(),
                    dtype: FieldDtype::F64,
                    required: true,
                    default: None,
                    transform: None,
                },
            ],
        }
    }

    fn linear_artifact(weights: usize, schema: Option<&InputSchema>) -> Vec<u8> {
        let mut doc = serde_json::json!({
            "predictor": {
                "kind": "linear",
                "weights": vec![1.0; weights],
                "intercept": 0.0
            }
        });
        if let Some(schema) = schema {
            doc["schema"] = serde_json::to_value(schema).unwrap();
        }
        serde_json::to_vec(&doc).unwrap()
    }

    #[test]
    fn loads_with_embedded_schema() {
        let schema = two_field_schema();
        let payload = ArtifactPayload {
            bytes: linear_artifact(2, Some(&schema)),
            schema: None,
        };
        let handle =
            load_artifact("m", 1, Stage::Production, payload, Duration::from_millis(5)).unwrap();
        assert_eq!(handle.version, 1);
        assert_eq!(handle.schema, schema);
        assert_eq!(handle.predictor.input_arity(), 2);
    }

    #[test]
    fn loads_with_registry_schema() {
        let payload = ArtifactPayload {
            bytes: linear_artifact(2, None),
            schema: Some(two_field_schema()),
        };
        assert!(load_artifact("m", 1, Stage::Production, payload, Duration::ZERO).is_ok());
    }

    #[test]
    fn missing_schema_is_a_load_error() {
        let payload = ArtifactPayload {
            bytes: linear_artifact(2, None),
            schema: None,
        };
        assert!(matches!(
            load_artifact("m", 1, Stage::Production, payload, Duration::ZERO),
            Err(LoadError::MissingSchema)
        ));
    }

    #[test]
    fn conflicting_schemas_abort_the_load() {
        let mut other = two_field_schema();
        other.fields.pop();
        let payload = ArtifactPayload {
            bytes: linear_artifact(2, Some(&two_field_schema())),
            schema: Some(other),
        };
        assert!(matches!(
            load_artifact("m", 1, Stage::Production, payload, Duration::ZERO),
            Err(LoadError::SchemaConflict(_))
        ));
    }

    #[test]
    fn arity_mismatch_aborts_the_load() {
        let payload = ArtifactPayload {
            bytes: linear_artifact(3, None),
            schema: Some(two_field_schema()),
        };
        assert!(matches!(
            load_artifact("m", 1, Stage::Production, payload, Duration::ZERO),
            Err(LoadError::ArityMismatch {
                schema: 2,
                predictor: 3
            })
        ));
    }

    #[test]
    fn garbage_bytes_are_malformed() {
        let payload = ArtifactPayload {
            bytes: b"definitely not json".to_vec(),
            schema: Some(two_field_schema()),
        };
        assert!(matches!(
            load_artifact("m", 1, Stage::Production, payload, Duration::ZERO),
            Err(LoadError::Malformed(_))
        ));
    }
}
