use kiln_core::OptimizerDefinition;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OptimizerStateError {
    #[error("optimizer kind mismatch: cannot restore {got} moments into a {expected} optimizer")]
    KindMismatch {
        expected: &'static str,
        got: &'static str,
    },

    #[error("moment buffer shape mismatch: expected {expected} values, got {got}")]
    ShapeMismatch { expected: usize, got: usize },
}

/// Persisted optimizer moment buffers, written into checkpoints and into the
/// separate per-model optimizer-state artifact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OptimizerMoments {
    Sgd {
        velocity: Vec<f32>,
    },
    AdamW {
        m: Vec<f32>,
        v: Vec<f32>,
        updates: u64,
    },
}

impl OptimizerMoments {
    fn kind(&self) -> &'static str {
        match self {
            OptimizerMoments::Sgd { .. } => "sgd",
            OptimizerMoments::AdamW { .. } => "adamw",
        }
    }
}

enum Rule {
    Sgd {
        momentum: f32,
        nesterov: bool,
        weight_decay: f32,
        velocity: Vec<f32>,
    },
    AdamW {
        betas: [f32; 2],
        eps: f32,
        weight_decay: f32,
        m: Vec<f32>,
        v: Vec<f32>,
        updates: u64,
    },
}

/// A built update rule with parameter-shaped moment buffers.
pub struct Optimizer {
    rule: Rule,
}

impl Optimizer {
    pub fn new(definition: OptimizerDefinition, num_parameters: usize) -> Self {
        let rule = match definition {
            OptimizerDefinition::Sgd {
                momentum,
                nesterov,
                weight_decay,
            } => Rule::Sgd {
                momentum,
                nesterov,
                weight_decay,
                velocity: vec![0.0; num_parameters],
            },
            OptimizerDefinition::AdamW {
                betas,
                eps,
                weight_decay,
            } => Rule::AdamW {
                betas,
                eps,
                weight_decay,
                m: vec![0.0; num_parameters],
                v: vec![0.0; num_parameters],
                updates: 0,
            },
        };
        Self { rule }
    }

    /// One in-place update of `params` from unscaled gradients.
    pub fn apply(&mut self, params: &mut [f32], grads: &[f32], lr: f64) {
        let lr = lr as f32;
        match &mut self.rule {
            Rule::Sgd {
                momentum,
                nesterov,
                weight_decay,
                velocity,
            } => {
                for ((p, &g), v) in params.iter_mut().zip(grads).zip(velocity.iter_mut()) {
                    let g = g + *weight_decay * *p;
                    *v = *momentum * *v + g;
                    let update = if *nesterov { g + *momentum * *v } else { *v };
                    *p -= lr * update;
                }
            }
            Rule::AdamW {
                betas: [beta1, beta2],
                eps,
                weight_decay,
                m,
                v,
                updates,
            } => {
                *updates += 1;
                let bias1 = 1.0 - beta1.powi(*updates as i32);
                let bias2 = 1.0 - beta2.powi(*updates as i32);
                for ((p, &g), (m, v)) in params
                    .iter_mut()
                    .zip(grads)
                    .zip(m.iter_mut().zip(v.iter_mut()))
                {
                    *m = *beta1 * *m + (1.0 - *beta1) * g;
                    *v = *beta2 * *v + (1.0 - *beta2) * g * g;
                    let m_hat = *m / bias1;
                    let v_hat = *v / bias2;
                    *p -= lr * (m_hat / (v_hat.sqrt() + *eps) + *weight_decay * *p);
                }
            }
        }
    }

    pub fn moments(&self) -> OptimizerMoments {
        match &self.rule {
            Rule::Sgd { velocity, .. } => OptimizerMoments::Sgd {
                velocity: velocity.clone(),
            },
            Rule::AdamW { m, v, updates, .. } => OptimizerMoments::AdamW {
                m: m.clone(),
                v: v.clone(),
                updates: *updates,
            },
        }
    }

    /// Restore moment buffers from a checkpoint. A kind or shape mismatch
    /// means the state belongs to a different run and is fatal.
    pub fn load_moments(&mut self, moments: OptimizerMoments) -> Result<(), OptimizerStateError> {
        match (&mut self.rule, moments) {
            (Rule::Sgd { velocity, .. }, OptimizerMoments::Sgd { velocity: loaded }) => {
                if loaded.len() != velocity.len() {
                    return Err(OptimizerStateError::ShapeMismatch {
                        expected: velocity.len(),
                        got: loaded.len(),
                    });
                }
                *velocity = loaded;
                Ok(())
            }
            (
                Rule::AdamW { m, v, updates, .. },
                OptimizerMoments::AdamW {
                    m: loaded_m,
                    v: loaded_v,
                    updates: loaded_updates,
                },
            ) => {
                if loaded_m.len() != m.len() || loaded_v.len() != v.len() {
                    return Err(OptimizerStateError::ShapeMismatch {
                        expected: m.len(),
                        got: loaded_m.len(),
                    });
                }
                *m = loaded_m;
                *v = loaded_v;
                *updates = loaded_updates;
                Ok(())
            }
            (rule, loaded) => Err(OptimizerStateError::KindMismatch {
                expected: match rule {
                    Rule::Sgd { .. } => "sgd",
                    Rule::AdamW { .. } => "adamw",
                },
                got: loaded.kind(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sgd(momentum: f32) -> OptimizerDefinition {
        OptimizerDefinition::Sgd {
            momentum,
            nesterov: false,
            weight_decay: 0.0,
        }
    }

    #[test]
    fn test_sgd_moves_against_gradient() {
        let mut optimizer = Optimizer::new(sgd(0.0), 2);
        let mut params = vec![1.0, -1.0];
        optimizer.apply(&mut params, &[0.5, -0.5], 0.1);
        assert!((params[0] - 0.95).abs() < 1e-6);
        assert!((params[1] + 0.95).abs() < 1e-6);
    }

    #[test]
    fn test_sgd_momentum_accumulates() {
        let mut optimizer = Optimizer::new(sgd(0.9), 1);
        let mut params = vec![0.0];
        optimizer.apply(&mut params, &[1.0], 1.0);
        assert!((params[0] + 1.0).abs() < 1e-6);
        // Second identical gradient: velocity = 0.9 * 1.0 + 1.0 = 1.9.
        optimizer.apply(&mut params, &[1.0], 1.0);
        assert!((params[0] + 2.9).abs() < 1e-6);
    }

    #[test]
    fn test_adamw_first_step_is_lr_sized() {
        let mut optimizer = Optimizer::new(OptimizerDefinition::default(), 1);
        let mut params = vec![0.0];
        optimizer.apply(&mut params, &[0.3], 0.01);
        // With bias correction the first update has magnitude ~lr regardless
        // of gradient scale.
        assert!((params[0] + 0.01).abs() < 1e-4);
    }

    #[test]
    fn test_moments_round_trip() {
        let mut optimizer = Optimizer::new(OptimizerDefinition::default(), 3);
        let mut params = vec![0.1, 0.2, 0.3];
        optimizer.apply(&mut params, &[1.0, 2.0, 3.0], 0.01);
        let moments = optimizer.moments();

        let mut restored = Optimizer::new(OptimizerDefinition::default(), 3);
        restored.load_moments(moments.clone()).unwrap();
        assert_eq!(restored.moments(), moments);
    }

    #[test]
    fn test_kind_mismatch_is_fatal() {
        let mut optimizer = Optimizer::new(sgd(0.9), 2);
        let moments = Optimizer::new(OptimizerDefinition::default(), 2).moments();
        assert!(matches!(
            optimizer.load_moments(moments),
            Err(OptimizerStateError::KindMismatch { .. })
        ));
    }

    #[test]
    fn test_shape_mismatch_is_fatal() {
        let mut optimizer = Optimizer::new(sgd(0.9), 2);
        let moments = OptimizerMoments::Sgd {
            velocity: vec![0.0; 5],
        };
        assert!(matches!(
            optimizer.load_moments(moments),
            Err(OptimizerStateError::ShapeMismatch {
                expected: 2,
                got: 5
            })
        ));
    }
}
