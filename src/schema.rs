//! Input schemas and feature values
//!
//! A schema is an ordered field list that drives request validation and
//! feature-vector assembly. The order is the order the predictor consumes;
//! one-hot fields expand to one slot per class.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::transform::TransformSpec;

/// A single feature value as it travels through the request path.
///
/// Variant order matters for untagged deserialization: JSON booleans bind
/// before integers, integral numbers before floats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl FeatureValue {
    /// Numeric view. Booleans map to 0/1; strings have no numeric view.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FeatureValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            FeatureValue::Int(i) => Some(*i as f64),
            FeatureValue::Float(f) => Some(*f),
            FeatureValue::Str(_) => None,
        }
    }

    /// Type name used in validation errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            FeatureValue::Bool(_) => "bool",
            FeatureValue::Int(_) => "int",
            FeatureValue::Float(_) => "float",
            FeatureValue::Str(_) => "string",
        }
    }
}

/// Declared type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldDtype {
    F64,
    I64,
    Bool,
    Categorical,
}

impl FieldDtype {
    pub fn name(&self) -> &'static str {
        match self {
            FieldDtype::F64 => "f64",
            FieldDtype::I64 => "i64",
            FieldDtype::Bool => "bool",
            FieldDtype::Categorical => "categorical",
        }
    }

    /// Whether a concrete value satisfies this dtype.
    ///
    /// Numeric fields accept narrower numeric forms (ints where floats are
    /// declared, 0/1 ints where bools are declared) since JSON clients
    /// rarely distinguish them.
    pub fn accepts(&self, value: &FeatureValue) -> bool {
        match (self, value) {
            (FieldDtype::F64, FeatureValue::Float(_))
            | (FieldDtype::F64, FeatureValue::Int(_))
            | (FieldDtype::F64, FeatureValue::Bool(_)) => true,
            (FieldDtype::I64, FeatureValue::Int(_)) => true,
            (FieldDtype::Bool, FeatureValue::Bool(_)) => true,
            (FieldDtype::Bool, FeatureValue::Int(i)) => *i == 0 || *i == 1,
            (FieldDtype::Categorical, FeatureValue::Str(_)) => true,
            _ => false,
        }
    }
}

/// One field of an input schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    pub dtype: FieldDtype,

    /// Required fields must be supplied by the request or carry a default.
    /// Optional fields need a default or an impute transform to assemble.
    #[serde(default = "default_required")]
    pub required: bool,

    /// Substituted when the request omits the field.
    #[serde(default)]
    pub default: Option<FeatureValue>,

    /// Applied when assembling the numeric vector.
    #[serde(default)]
    pub transform: Option<TransformSpec>,
}

fn default_required() -> bool {
    true
}

impl SchemaField {
    /// Number of vector slots this field occupies.
    pub fn width(&self) -> usize {
        match &self.transform {
            Some(t) => t.output_width(),
            None => 1,
        }
    }

    fn fills_from_transform(&self) -> bool {
        matches!(&self.transform, Some(t) if t.imputes_missing())
    }
}

/// Ordered input schema for a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    pub fields: Vec<SchemaField>,
}

impl InputSchema {
    /// Number of declared fields.
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Total width of the assembled vector, after one-hot expansion.
    pub fn input_arity(&self) -> usize {
        self.fields.iter().map(|f| f.width()).sum()
    }

    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Validate a feature map against the schema.
    ///
    /// Unknown fields are rejected, missing fields without a declared
    /// default are rejected, present values must satisfy the dtype.
    pub fn validate(&self, features: &BTreeMap<String, FeatureValue>) -> Result<(), ValidationError> {
        for name in features.keys() {
            if self.field(name).is_none() {
                return Err(ValidationError::UnknownFeature(name.clone()));
            }
        }
        for field in &self.fields {
            match features.get(&field.name) {
                Some(value) => {
                    if !field.dtype.accepts(value) {
                        return Err(ValidationError::TypeMismatch {
                            field: field.name.clone(),
                            expected: field.dtype.name(),
                            got: value.type_name(),
                        });
                    }
                }
                None => {
                    if field.required && field.default.is_none() && !field.fills_from_transform() {
                        return Err(ValidationError::MissingFeature(field.name.clone()));
                    }
                }
            }
        }
        Ok(())
    }

    /// Fill declared defaults into a validated feature map.
    pub fn apply_defaults(&self, features: &mut BTreeMap<String, FeatureValue>) {
        for field in &self.fields {
            if !features.contains_key(&field.name) {
                if let Some(default) = &field.default {
                    features.insert(field.name.clone(), default.clone());
                }
            }
        }
    }

    /// Assemble the numeric vector in schema order.
    ///
    /// The map must already be validated; remaining gaps are filled by
    /// impute transforms. Categorical fields must carry a one-hot
    /// transform to become numeric.
    pub fn assemble(
        &self,
        features: &BTreeMap<String, FeatureValue>,
    ) -> Result<Vec<f64>, ValidationError> {
        let mut vector = Vec::with_capacity(self.input_arity());
        for field in &self.fields {
            let value = features.get(&field.name).or(field.default.as_ref());
            match &field.transform {
                Some(transform) => {
                    let slots = transform.apply(value).map_err(|e| match e {
                        crate::transform::TransformError::Missing => {
                            ValidationError::MissingFeature(field.name.clone())
                        }
                        _ => ValidationError::TypeMismatch {
                            field: field.name.clone(),
                            expected: field.dtype.name(),
                            got: value.map(|v| v.type_name()).unwrap_or("missing"),
                        },
                    })?;
                    vector.extend_from_slice(&slots);
                }
                None => {
                    let value =
                        value.ok_or_else(|| ValidationError::MissingFeature(field.name.clone()))?;
                    let numeric = value.as_f64().ok_or_else(|| ValidationError::TypeMismatch {
                        field: field.name.clone(),
                        expected: field.dtype.name(),
                        got: value.type_name(),
                    })?;
                    vector.push(numeric);
                }
            }
        }
        Ok(vector)
    }
}
