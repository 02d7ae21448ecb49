use anyhow::{bail, Result};
use kiln_data::Batch;

use crate::model::{Backward, Model, ModelError};

/// Deterministic linear model with analytic mean-squared-error gradients.
///
/// Stands in for a real network in tests and smoke runs: same inputs always
/// produce the same parameters, losses, and gradients, which the resumption
/// tests rely on. `poison_next_batch` forces a non-finite gradient on the
/// next micro-batch to exercise the overflow path.
pub struct DummyModel {
    weights: Vec<f32>,
    input_width: usize,
    target_width: usize,
    poison_next: bool,
}

impl DummyModel {
    pub fn new(input_width: usize, target_width: usize) -> Self {
        let count = target_width * input_width + target_width;
        // Small deterministic spread; no RNG so runs are reproducible.
        let weights = (0..count)
            .map(|k| 0.01 * ((k % 7) as f32 - 3.0))
            .collect();
        Self {
            weights,
            input_width,
            target_width,
            poison_next: false,
        }
    }

    /// Make the next forward/backward return non-finite gradients.
    pub fn poison_next_batch(&mut self) {
        self.poison_next = true;
    }
}

impl Model for DummyModel {
    fn num_parameters(&self) -> usize {
        self.weights.len()
    }

    fn parameters(&self) -> Vec<f32> {
        self.weights.clone()
    }

    fn set_parameters(&mut self, params: &[f32]) -> Result<(), ModelError> {
        if params.len() != self.weights.len() {
            return Err(ModelError::ParameterCountMismatch {
                expected: self.weights.len(),
                got: params.len(),
            });
        }
        self.weights.copy_from_slice(params);
        Ok(())
    }

    fn forward_backward(&mut self, batch: &Batch, loss_scale: f64) -> Result<Backward> {
        if batch.is_empty() {
            bail!("cannot train on an empty batch");
        }
        let (inputs, outputs) = (self.input_width, self.target_width);
        let bias_offset = outputs * inputs;
        let mut grads = vec![0.0f32; self.weights.len()];
        let mut loss = 0.0f64;

        for sample in &batch.samples {
            if sample.input.len() != inputs || sample.target.len() != outputs {
                bail!(
                    "sample shape ({}, {}) does not match model shape ({inputs}, {outputs})",
                    sample.input.len(),
                    sample.target.len()
                );
            }
            for j in 0..outputs {
                let mut pred = self.weights[bias_offset + j];
                for i in 0..inputs {
                    pred += self.weights[j * inputs + i] * sample.input[i];
                }
                let residual = pred - sample.target[j];
                loss += (residual as f64) * (residual as f64);
                for i in 0..inputs {
                    grads[j * inputs + i] += 2.0 * residual * sample.input[i];
                }
                grads[bias_offset + j] += 2.0 * residual;
            }
        }

        let denom = (batch.len() * outputs) as f64;
        loss /= denom;
        let grad_scale = (loss_scale / denom) as f32;
        for g in grads.iter_mut() {
            *g *= grad_scale;
        }

        if self.poison_next {
            self.poison_next = false;
            grads.fill(f32::NAN);
        }

        Ok(Backward {
            loss,
            gradients: grads,
        })
    }
}
