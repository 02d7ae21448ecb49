use serde::{Deserialize, Serialize};

use crate::config::TrainingRunConfig;

/// Decay applied after warmup. Strategies are mutually exclusive and selected
/// by name in the run configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecayStrategy {
    Constant,
    /// Decay by `decay_rate` every `decay_epochs` epoch boundaries.
    Step { decay_epochs: u32, decay_rate: f64 },
    /// Decay by `decay_rate` at each named epoch milestone.
    MultiStep {
        milestones: Vec<u32>,
        decay_rate: f64,
    },
    /// Decay by `decay_rate` every epoch.
    Exponential { decay_rate: f64 },
    Cosine,
    /// Cosine annealing with warm restarts: `num_cycles` cycles, each
    /// starting from the previous amplitude scaled by `cycle_decay`.
    CosineRestarts { num_cycles: u32, cycle_decay: f64 },
}

/// A pure function from optimizer step to learning rate.
///
/// Built once from the run configuration and the per-epoch batch count, then
/// only ever queried. After a resume the schedule is re-evaluated from the
/// restored step rather than replayed, so `lr_at` must depend on nothing but
/// its argument.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LearningRateSchedule {
    base_lr: f64,
    min_lr: f64,
    warmup_steps: u64,
    warmup_factor: f64,
    decay: DecayStrategy,
    total_steps: u64,
    steps_per_epoch: u64,
}

impl LearningRateSchedule {
    pub fn new(
        base_lr: f64,
        min_lr: f64,
        warmup_epochs: u32,
        warmup_factor: f64,
        decay: DecayStrategy,
        num_epochs: u32,
        steps_per_epoch: u64,
    ) -> Self {
        let steps_per_epoch = steps_per_epoch.max(1);
        Self {
            base_lr,
            min_lr,
            warmup_steps: warmup_epochs as u64 * steps_per_epoch,
            warmup_factor,
            decay,
            total_steps: num_epochs as u64 * steps_per_epoch,
            steps_per_epoch,
        }
    }

    pub fn from_config(config: &TrainingRunConfig, steps_per_epoch: u64) -> Self {
        Self::new(
            config.lr,
            config.min_lr,
            config.warmup_epochs,
            config.warmup_factor,
            config.decay.clone(),
            config.epoch_size,
            steps_per_epoch,
        )
    }

    /// The learning rate for the given global optimizer step.
    pub fn lr_at(&self, step: u64) -> f64 {
        if step < self.warmup_steps {
            let start = self.warmup_factor * self.base_lr;
            let progress = step as f64 / self.warmup_steps as f64;
            return start + (self.base_lr - start) * progress;
        }

        let decay_step = step - self.warmup_steps;
        let decay_total = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        let epoch = step / self.steps_per_epoch;

        let lr = match &self.decay {
            DecayStrategy::Constant => self.base_lr,
            DecayStrategy::Step {
                decay_epochs,
                decay_rate,
            } => {
                let decayed_epochs = decay_step / self.steps_per_epoch;
                let times = decayed_epochs / (*decay_epochs).max(1) as u64;
                self.base_lr * decay_rate.powi(times as i32)
            }
            DecayStrategy::MultiStep {
                milestones,
                decay_rate,
            } => {
                let passed = milestones.iter().filter(|&&m| (m as u64) <= epoch).count();
                self.base_lr * decay_rate.powi(passed as i32)
            }
            DecayStrategy::Exponential { decay_rate } => {
                let decayed_epochs = decay_step / self.steps_per_epoch;
                self.base_lr * decay_rate.powi(decayed_epochs as i32)
            }
            DecayStrategy::Cosine => {
                let progress = (decay_step as f64 / decay_total as f64).min(1.0);
                cosine(self.base_lr, self.min_lr, progress)
            }
            DecayStrategy::CosineRestarts {
                num_cycles,
                cycle_decay,
            } => {
                let num_cycles = (*num_cycles).max(1) as u64;
                let cycle_len = (decay_total / num_cycles).max(1);
                let cycle = (decay_step / cycle_len).min(num_cycles - 1);
                let within = decay_step - cycle * cycle_len;
                let progress = (within as f64 / cycle_len as f64).min(1.0);
                let amplitude = self.base_lr * cycle_decay.powi(cycle as i32);
                cosine(amplitude.max(self.min_lr), self.min_lr, progress)
            }
        };
        lr.max(self.min_lr)
    }

    pub fn total_steps(&self) -> u64 {
        self.total_steps
    }
}

fn cosine(peak: f64, floor: f64, progress: f64) -> f64 {
    floor + 0.5 * (peak - floor) * (1.0 + (std::f64::consts::PI * progress).cos())
}
