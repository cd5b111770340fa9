//! Predictors
//!
//! A predictor is the in-process inference object produced by the artifact
//! loader. The set of variants is closed; unknown artifact kinds are load
//! errors, never runtime discovery.

mod tree;

pub use tree::{Tree, TreeNode};

use serde::{Deserialize, Serialize};

use crate::error::PredictorError;

/// Closed set of supported model families.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PredictorSpec {
    Linear(LinearSpec),
    TreeEnsemble(TreeEnsembleSpec),
    BoostedEnsemble(BoostedEnsembleSpec),
}

/// Linear / logistic model weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearSpec {
    pub weights: Vec<f64>,
    pub intercept: f64,

    /// Classification models run a logistic link and expose probabilities.
    #[serde(default)]
    pub classification: bool,
}

/// Averaged ensemble of decision trees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeEnsembleSpec {
    pub n_features: usize,
    pub trees: Vec<Tree>,

    /// Present when leaves carry class distributions.
    #[serde(default)]
    pub n_classes: Option<usize>,
}

/// Gradient-boosted ensemble with a logistic or identity link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoostedEnsembleSpec {
    pub n_features: usize,
    pub trees: Vec<Tree>,
    pub learning_rate: f64,

    #[serde(default)]
    pub base_score: f64,

    #[serde(default)]
    pub objective: Objective,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    #[default]
    Regression,
    BinaryLogistic,
}

/// An immutable, validated inference object.
///
/// Construction goes through [`Predictor::from_spec`], which checks the
/// structural invariants once so the hot path never re-validates trees.
#[derive(Debug)]
pub enum Predictor {
    Linear(LinearSpec),
    TreeEnsemble(TreeEnsembleSpec),
    BoostedEnsemble(BoostedEnsembleSpec),
}

impl Predictor {
    /// Build a predictor from its decoded spec, verifying tree structure
    /// and feature references.
    pub fn from_spec(spec: PredictorSpec) -> Result<Self, PredictorError> {
        match spec {
            PredictorSpec::Linear(linear) => {
                if linear.weights.is_empty() {
                    return Err(PredictorError::Malformed(
                        "linear model has no weights".into(),
                    ));
                }
                Ok(Predictor::Linear(linear))
            }
            PredictorSpec::TreeEnsemble(ensemble) => {
                if ensemble.trees.is_empty() {
                    return Err(PredictorError::Malformed("ensemble has no trees".into()));
                }
                for tree in &ensemble.trees {
                    tree.check(ensemble.n_features, ensemble.n_classes)?;
                }
                Ok(Predictor::TreeEnsemble(ensemble))
            }
            PredictorSpec::BoostedEnsemble(ensemble) => {
                if ensemble.trees.is_empty() {
                    return Err(PredictorError::Malformed("ensemble has no trees".into()));
                }
                for tree in &ensemble.trees {
                    tree.check(ensemble.n_features, None)?;
                }
                Ok(Predictor::BoostedEnsemble(ensemble))
            }
        }
    }

    /// Number of input features the model consumes.
    pub fn input_arity(&self) -> usize {
        match self {
            Predictor::Linear(m) => m.weights.len(),
            Predictor::TreeEnsemble(m) => m.n_features,
            Predictor::BoostedEnsemble(m) => m.n_features,
        }
    }

    /// Whether `predict_proba` is available.
    pub fn supports_probabilities(&self) -> bool {
        match self {
            Predictor::Linear(m) => m.classification,
            Predictor::TreeEnsemble(m) => m.n_classes.is_some(),
            Predictor::BoostedEnsemble(m) => m.objective == Objective::BinaryLogistic,
        }
    }

    /// Check an input vector against the expected arity.
    pub fn validate(&self, vector: &[f64]) -> Result<(), PredictorError> {
        if vector.len() != self.input_arity() {
            return Err(PredictorError::ArityMismatch {
                expected: self.input_arity(),
                got: vector.len(),
            });
        }
        Ok(())
    }

    /// Run inference, returning a scalar prediction.
    ///
    /// Classification models return the predicted class index as a float.
    pub fn predict(&self, vector: &[f64]) -> Result<f64, PredictorError> {
        self.validate(vector)?;
        let out = match self {
            Predictor::Linear(m) => {
                let raw = dot(&m.weights, vector) + m.intercept;
                if m.classification {
                    if sigmoid(raw) >= 0.5 {
                        1.0
                    } else {
                        0.0
                    }
                } else {
                    raw
                }
            }
            Predictor::TreeEnsemble(m) => {
                if m.n_classes.is_some() {
                    let probs = self.predict_proba(vector)?;
                    argmax(&probs) as f64
                } else {
                    let mut sum = 0.0;
                    for tree in &m.trees {
                        sum += tree.eval(vector)?;
                    }
                    sum / m.trees.len() as f64
                }
            }
            Predictor::BoostedEnsemble(m) => {
                let raw = self.boosted_margin(m, vector)?;
                match m.objective {
                    Objective::Regression => raw,
                    Objective::BinaryLogistic => {
                        if sigmoid(raw) >= 0.5 {
                            1.0
                        } else {
                            0.0
                        }
                    }
                }
            }
        };
        if !out.is_finite() {
            return Err(PredictorError::NonFinite);
        }
        Ok(out)
    }

    /// Class probabilities, when the capability flag advertises them.
    pub fn predict_proba(&self, vector: &[f64]) -> Result<Vec<f64>, PredictorError> {
        self.validate(vector)?;
        match self {
            Predictor::Linear(m) => {
                if !m.classification {
                    return Err(PredictorError::ProbabilitiesUnsupported);
                }
                let p = sigmoid(dot(&m.weights, vector) + m.intercept);
                finite_probs(vec![1.0 - p, p])
            }
            Predictor::TreeEnsemble(m) => {
                let n_classes = m
                    .n_classes
                    .ok_or(PredictorError::ProbabilitiesUnsupported)?;
                let mut acc = vec![0.0; n_classes];
                for tree in &m.trees {
                    let dist = tree.eval_distribution(vector, n_classes)?;
                    for (slot, p) in acc.iter_mut().zip(dist) {
                        *slot += p;
                    }
                }
                for slot in &mut acc {
                    *slot /= m.trees.len() as f64;
                }
                finite_probs(acc)
            }
            Predictor::BoostedEnsemble(m) => {
                if m.objective != Objective::BinaryLogistic {
                    return Err(PredictorError::ProbabilitiesUnsupported);
                }
                let p = sigmoid(self.boosted_margin(m, vector)?);
                finite_probs(vec![1.0 - p, p])
            }
        }
    }

    fn boosted_margin(
        &self,
        m: &BoostedEnsembleSpec,
        vector: &[f64],
    ) -> Result<f64, PredictorError> {
        let mut margin = m.base_score;
        for tree in &m.trees {
            margin += m.learning_rate * tree.eval(vector)?;
        }
        Ok(margin)
    }
}

fn dot(weights: &[f64], vector: &[f64]) -> f64 {
    weights.iter().zip(vector).map(|(w, x)| w * x).sum()
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

fn finite_probs(probs: Vec<f64>) -> Result<Vec<f64>, PredictorError> {
    if probs.iter().any(|p| !p.is_finite()) {
        return Err(PredictorError::NonFinite);
    }
    Ok(probs)
}
