use anyhow::Result;
use kiln_data::Batch;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("parameter count mismatch: model has {expected} parameters, got {got}")]
    ParameterCountMismatch { expected: usize, got: usize },
}

/// Result of one forward/backward pass.
///
/// `loss` is the unscaled value; `gradients` carry the loss-scale factor the
/// caller passed in and are unscaled by the optimizer wrapper once the
/// accumulation window completes.
#[derive(Clone, Debug)]
pub struct Backward {
    pub loss: f64,
    pub gradients: Vec<f32>,
}

/// The model collaborator boundary.
///
/// The orchestration core never touches tensors or autograd; parameters and
/// gradients cross this boundary as flat f32 buffers, and whatever runtime
/// sits behind the trait owns the math.
pub trait Model: Send {
    fn num_parameters(&self) -> usize;

    fn parameters(&self) -> Vec<f32>;

    fn set_parameters(&mut self, params: &[f32]) -> Result<(), ModelError>;

    /// Forward and backward on one micro-batch. The loss is multiplied by
    /// `loss_scale` before backprop, so the returned gradients are scaled.
    fn forward_backward(&mut self, batch: &Batch, loss_scale: f64) -> Result<Backward>;
}

/// Validation collaborator: produces one scalar metric for a model.
pub trait Evaluator {
    fn name(&self) -> &str;

    fn evaluate(&mut self, model: &mut dyn Model) -> Result<f64>;
}
