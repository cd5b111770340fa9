//! Decision tree evaluation
//!
//! Trees are stored as flat node arrays with index links. Structure is
//! verified once at load; evaluation still guards indices so a corrupted
//! artifact surfaces as an error instead of a panic.

use serde::{Deserialize, Serialize};

use crate::error::PredictorError;

/// A node in a flat tree array. Index 0 is the root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        value: f64,
        /// Per-class probabilities for classification ensembles.
        #[serde(default)]
        distribution: Option<Vec<f64>>,
    },
}

/// A single decision tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<TreeNode>,
}

impl Tree {
    /// Structural checks run at load time.
    ///
    /// Verifies child links and feature indices are in range, and when
    /// `n_classes` is set, that every leaf carries a distribution of that
    /// width.
    pub fn check(&self, n_features: usize, n_classes: Option<usize>) -> Result<(), PredictorError> {
        if self.nodes.is_empty() {
            return Err(PredictorError::Malformed("tree has no nodes".into()));
        }
        for (idx, node) in self.nodes.iter().enumerate() {
            match node {
                TreeNode::Split {
                    feature,
                    left,
                    right,
                    ..
                } => {
                    if *feature >= n_features {
                        return Err(PredictorError::Malformed(format!(
                            "node {idx} splits on feature {feature}, model has {n_features}"
                        )));
                    }
                    if *left >= self.nodes.len() || *right >= self.nodes.len() {
                        return Err(PredictorError::Malformed(format!(
                            "node {idx} links past the end of the node array"
                        )));
                    }
                    if *left <= idx || *right <= idx {
                        // Forward-only links rule out cycles.
                        return Err(PredictorError::Malformed(format!(
                            "node {idx} links backwards"
                        )));
                    }
                }
                TreeNode::Leaf { distribution, .. } => {
                    if let Some(expected) = n_classes {
                        match distribution {
                            Some(dist) if dist.len() == expected => {}
                            Some(dist) => {
                                return Err(PredictorError::Malformed(format!(
                                    "leaf {idx} has {} classes, expected {expected}",
                                    dist.len()
                                )))
                            }
                            None => {
                                return Err(PredictorError::Malformed(format!(
                                    "leaf {idx} is missing a class distribution"
                                )))
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Walk the tree and return the leaf value.
    pub fn eval(&self, vector: &[f64]) -> Result<f64, PredictorError> {
        match self.walk(vector)? {
            TreeNode::Leaf { value, .. } => Ok(*value),
            TreeNode::Split { .. } => unreachable!("walk stops at leaves"),
        }
    }

    /// Walk the tree and return the leaf class distribution.
    pub fn eval_distribution(
        &self,
        vector: &[f64],
        n_classes: usize,
    ) -> Result<Vec<f64>, PredictorError> {
        match self.walk(vector)? {
            TreeNode::Leaf {
                distribution: Some(dist),
                ..
            } if dist.len() == n_classes => Ok(dist.clone()),
            _ => Err(PredictorError::Malformed(
                "leaf reached without a class distribution".into(),
            )),
        }
    }

    fn walk(&self, vector: &[f64]) -> Result<&TreeNode, PredictorError> {
        let mut idx = 0;
        loop {
            let node = self
                .nodes
                .get(idx)
                .ok_or_else(|| PredictorError::Malformed(format!("missing node {idx}")))?;
            match node {
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let x = vector.get(*feature).ok_or(PredictorError::ArityMismatch {
                        expected: feature + 1,
                        got: vector.len(),
                    })?;
                    idx = if *x <= *threshold { *left } else { *right };
                }
                TreeNode::Leaf { .. } => return Ok(node),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn depth_two() -> Tree {
        Tree {
            nodes: vec![
                TreeNode::Split {
                    feature: 0,
                    threshold: 0.0,
                    left: 1,
                    right: 2,
                },
                TreeNode::Leaf {
                    value: -1.0,
                    distribution: None,
                },
                TreeNode::Split {
                    feature: 1,
                    threshold: 5.0,
                    left: 3,
                    right: 4,
                },
                TreeNode::Leaf {
                    value: 1.0,
                    distribution: None,
                },
                TreeNode::Leaf {
                    value: 2.0,
                    distribution: None,
                },
            ],
        }
    }

    #[test]
    fn eval_follows_thresholds() {
        let tree = depth_two();
        tree.check(2, None).unwrap();
        assert_eq!(tree.eval(&[-1.0, 0.0]).unwrap(), -1.0);
        assert_eq!(tree.eval(&[1.0, 3.0]).unwrap(), 1.0);
        assert_eq!(tree.eval(&[1.0, 7.0]).unwrap(), 2.0);
    }

    #[test]
    fn boundary_goes_left() {
        let tree = depth_two();
        assert_eq!(tree.eval(&[0.0, 0.0]).unwrap(), -1.0);
    }

    #[test]
    fn check_rejects_backward_links() {
        let tree = Tree {
            nodes: vec![
                TreeNode::Split {
                    feature: 0,
                    threshold: 0.0,
                    left: 0,
                    right: 1,
                },
                TreeNode::Leaf {
                    value: 0.0,
                    distribution: None,
                },
            ],
        };
        assert!(tree.check(1, None).is_err());
    }

    #[test]
    fn check_requires_distributions_for_classifiers() {
        let tree = Tree {
            nodes: vec![TreeNode::Leaf {
                value: 0.0,
                distribution: None,
            }],
        };
        assert!(tree.check(1, Some(2)).is_err());
        let tree = Tree {
            nodes: vec![TreeNode::Leaf {
                value: 0.0,
                distribution: Some(vec![0.3, 0.7]),
            }],
        };
        tree.check(1, Some(2)).unwrap();
    }
}
