use anyhow::{bail, Context, Result};
use kiln_core::{LearningRateSchedule, TrainingRunConfig};
use kiln_data::Batch;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::ema::EmaShapeError;
use crate::loss_scale::{LossScaleState, LossScaler};
use crate::model::Model;
use crate::optimizer::{Optimizer, OptimizerMoments, OptimizerStateError};
use crate::EmaShadow;

/// What one micro-batch call did.
#[derive(Clone, Debug, PartialEq)]
pub enum StepOutcome {
    /// Collected another micro-batch; the global step was not touched.
    Accumulating { collected: u32 },
    /// An optimizer update was applied. `step` is the new global step count,
    /// `lr` the rate the update used (evaluated at the pre-increment step),
    /// `loss` the mean unscaled loss over the accumulation window.
    Applied { step: u64, loss: f64, lr: f64 },
    /// The window overflowed and was discarded; the global step, optimizer
    /// moments, and EMA shadow are all unchanged.
    SkippedOverflow { loss_scale: f64 },
}

/// Persisted wrapper state: everything needed to continue the step sequence
/// exactly where a checkpoint left off.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepperSnapshot {
    pub global_step: u64,
    pub moments: OptimizerMoments,
    pub loss_scale: LossScaleState,
    pub ema: Option<Vec<f32>>,
}

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error(transparent)]
    Optimizer(#[from] OptimizerStateError),

    #[error(transparent)]
    Ema(#[from] EmaShapeError),

    #[error("checkpoint carries an EMA shadow but this run has EMA disabled")]
    UnexpectedEma,
}

/// The resumable optimizer wrapper.
///
/// Owns the global step counter: the count of successfully applied optimizer
/// updates, not batches seen. It drives each accumulation window through
/// accumulate → overflow check → clip → apply → increment → EMA. The learning
/// rate is always taken from the schedule at the current (pre-increment)
/// step, which is what makes re-evaluation from a restored step gap-free.
pub struct TrainStepper {
    global_step: u64,
    schedule: LearningRateSchedule,
    optimizer: Optimizer,
    scaler: LossScaler,
    ema: Option<EmaShadow>,
    clip_value: Option<f32>,
    accumulation_steps: u32,
    drop_overflow_update: bool,

    accumulated: Vec<f32>,
    collected: u32,
    loss_sum: f64,
    overflow_steps: u64,
}

impl TrainStepper {
    pub fn new(config: &TrainingRunConfig, schedule: LearningRateSchedule, model: &dyn Model) -> Self {
        let num_parameters = model.num_parameters();
        Self {
            global_step: 0,
            schedule,
            optimizer: Optimizer::new(config.optimizer, num_parameters),
            scaler: LossScaler::new(config.loss_scale),
            ema: config
                .ema
                .then(|| EmaShadow::new(config.ema_decay, &model.parameters())),
            clip_value: config.clip_grad.then_some(config.clip_value),
            accumulation_steps: config.gradient_accumulation_steps.max(1),
            drop_overflow_update: config.drop_overflow_update,
            accumulated: vec![0.0; num_parameters],
            collected: 0,
            loss_sum: 0.0,
            overflow_steps: 0,
        }
    }

    /// Feed one micro-batch through the state machine.
    pub fn step(&mut self, model: &mut dyn Model, batch: &Batch) -> Result<StepOutcome> {
        let backward = model
            .forward_backward(batch, self.scaler.scale())
            .context("forward/backward failed")?;
        if backward.gradients.len() != self.accumulated.len() {
            bail!(
                "gradient count mismatch: expected {}, got {}",
                self.accumulated.len(),
                backward.gradients.len()
            );
        }

        for (acc, &grad) in self.accumulated.iter_mut().zip(&backward.gradients) {
            *acc += grad;
        }
        self.loss_sum += backward.loss;
        self.collected += 1;

        if self.collected < self.accumulation_steps {
            return Ok(StepOutcome::Accumulating {
                collected: self.collected,
            });
        }

        // Window complete: unscale and average the accumulated gradients.
        let divisor = (self.scaler.scale() * self.collected as f64) as f32;
        let mut grads: Vec<f32> = self.accumulated.iter().map(|&g| g / divisor).collect();
        let loss = self.loss_sum / self.collected as f64;
        self.reset_window();

        let overflowed = grads.iter().any(|g| !g.is_finite());
        if overflowed && (self.scaler.is_dynamic() || self.drop_overflow_update) {
            self.overflow_steps += 1;
            self.scaler.on_overflow();
            trace!(
                step = self.global_step,
                loss_scale = self.scaler.scale(),
                "skipping overflowed update"
            );
            return Ok(StepOutcome::SkippedOverflow {
                loss_scale: self.scaler.scale(),
            });
        }

        let lr = self.schedule.lr_at(self.global_step);
        if let Some(clip) = self.clip_value {
            clip_by_global_norm(&mut grads, clip);
        }

        let mut params = model.parameters();
        self.optimizer.apply(&mut params, &grads, lr);
        model
            .set_parameters(&params)
            .context("failed to write updated parameters back to the model")?;
        self.global_step += 1;
        self.scaler.on_applied();
        if let Some(ema) = &mut self.ema {
            ema.update(&params);
        }

        Ok(StepOutcome::Applied {
            step: self.global_step,
            loss,
            lr,
        })
    }

    fn reset_window(&mut self) {
        self.accumulated.fill(0.0);
        self.collected = 0;
        self.loss_sum = 0.0;
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    pub fn overflow_steps(&self) -> u64 {
        self.overflow_steps
    }

    pub fn loss_scale(&self) -> f64 {
        self.scaler.scale()
    }

    pub fn ema_shadow(&self) -> Option<&[f32]> {
        self.ema.as_ref().map(|ema| ema.shadow())
    }

    pub fn snapshot(&self) -> StepperSnapshot {
        StepperSnapshot {
            global_step: self.global_step,
            moments: self.optimizer.moments(),
            loss_scale: self.scaler.state(),
            ema: self.ema.as_ref().map(|ema| ema.shadow().to_vec()),
        }
    }

    /// Restore from a checkpoint. The restored global step is used for the
    /// very next schedule evaluation, with no gap or replay; any half-filled
    /// accumulation window is discarded.
    pub fn restore(&mut self, snapshot: StepperSnapshot) -> Result<(), RestoreError> {
        self.optimizer.load_moments(snapshot.moments)?;
        match (&mut self.ema, snapshot.ema) {
            (Some(ema), Some(shadow)) => ema.restore(shadow)?,
            (None, Some(_)) => return Err(RestoreError::UnexpectedEma),
            // A run that enables EMA over a pre-EMA checkpoint starts the
            // shadow fresh from the current parameters.
            (_, None) => {}
        }
        self.scaler.restore(snapshot.loss_scale);
        self.global_step = snapshot.global_step;
        self.reset_window();
        Ok(())
    }

    /// Restore only the optimizer moments, from the separate per-model
    /// optimizer-state artifact.
    pub fn restore_moments(&mut self, moments: OptimizerMoments) -> Result<(), RestoreError> {
        self.optimizer.load_moments(moments)?;
        Ok(())
    }
}

fn clip_by_global_norm(grads: &mut [f32], clip_value: f32) {
    let norm = grads
        .iter()
        .map(|&g| g as f64 * g as f64)
        .sum::<f64>()
        .sqrt() as f32;
    if norm > clip_value {
        let scale = clip_value / norm;
        for g in grads.iter_mut() {
            *g *= scale;
        }
    }
}
