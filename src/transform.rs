//! Feature transforms
//!
//! Transforms are declared per schema field and applied lazily while
//! assembling the numeric vector. They are data-in/data-out; nothing here
//! holds state.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema::FeatureValue;

/// Why a transform could not produce output for a value.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransformError {
    #[error("value is missing and the transform does not impute")]
    Missing,

    #[error("value is not numeric")]
    NotNumeric,

    #[error("'{0}' is not one of the declared classes")]
    UnknownClass(String),
}

/// A named transform as it appears in a schema descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransformSpec {
    /// (x - mean) / std_dev. A zero std_dev passes x - mean through.
    Standardize { mean: f64, std_dev: f64 },

    /// Clamp into [lo, hi].
    MinMaxClip { lo: f64, hi: f64 },

    /// Substitute a fixed value when the field is missing.
    ImputeDefault { value: f64 },

    /// Expand a categorical value into one slot per class.
    OneHot { classes: Vec<String> },
}

impl TransformSpec {
    /// Vector slots produced per value.
    pub fn output_width(&self) -> usize {
        match self {
            TransformSpec::OneHot { classes } => classes.len(),
            _ => 1,
        }
    }

    /// Whether a missing input still yields output.
    pub fn imputes_missing(&self) -> bool {
        matches!(self, TransformSpec::ImputeDefault { .. })
    }

    /// Apply to an optional value, producing `output_width()` slots.
    pub fn apply(&self, value: Option<&FeatureValue>) -> Result<Vec<f64>, TransformError> {
        match self {
            TransformSpec::Standardize { mean, std_dev } => {
                let x = numeric(value)?;
                let scaled = if *std_dev == 0.0 {
                    x - mean
                } else {
                    (x - mean) / std_dev
                };
                Ok(vec![scaled])
            }
            TransformSpec::MinMaxClip { lo, hi } => {
                // max-then-min never panics, even on an inverted range.
                let x = numeric(value)?;
                Ok(vec![x.max(*lo).min(*hi)])
            }
            TransformSpec::ImputeDefault { value: default } => match value {
                Some(v) => Ok(vec![v.as_f64().ok_or(TransformError::NotNumeric)?]),
                None => Ok(vec![*default]),
            },
            TransformSpec::OneHot { classes } => {
                let v = value.ok_or(TransformError::Missing)?;
                let label = match v {
                    FeatureValue::Str(s) => s.as_str(),
                    _ => return Err(TransformError::NotNumeric),
                };
                let mut slots = vec![0.0; classes.len()];
                let idx = classes
                    .iter()
                    .position(|c| c == label)
                    .ok_or_else(|| TransformError::UnknownClass(label.to_string()))?;
                slots[idx] = 1.0;
                Ok(slots)
            }
        }
    }
}

fn numeric(value: Option<&FeatureValue>) -> Result<f64, TransformError> {
    value
        .ok_or(TransformError::Missing)?
        .as_f64()
        .ok_or(TransformError::NotNumeric)
}
