use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schedule::DecayStrategy;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckpointPolicy {
    /// Save unconditionally every `ckpt_save_interval` epochs.
    #[default]
    Interval,
    /// Save only when the validation metric improves on the best so far.
    TopK,
    /// Save every epoch, evicting the oldest beyond `keep_checkpoint_max`.
    LatestK,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetricDirection {
    #[default]
    HigherIsBetter,
    LowerIsBetter,
}

impl MetricDirection {
    pub fn improves(&self, candidate: f64, best: f64) -> bool {
        match self {
            MetricDirection::HigherIsBetter => candidate > best,
            MetricDirection::LowerIsBetter => candidate < best,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OptimizerDefinition {
    Sgd {
        momentum: f32,
        nesterov: bool,
        weight_decay: f32,
    },
    AdamW {
        betas: [f32; 2],
        eps: f32,
        weight_decay: f32,
    },
}

impl Default for OptimizerDefinition {
    fn default() -> Self {
        OptimizerDefinition::AdamW {
            betas: [0.9, 0.999],
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LossScaleSpec {
    Fixed {
        scale: f64,
    },
    Dynamic {
        init_scale: f64,
        backoff_factor: f64,
        growth_factor: f64,
        growth_interval: u32,
    },
}

impl Default for LossScaleSpec {
    fn default() -> Self {
        LossScaleSpec::Fixed { scale: 1.0 }
    }
}

impl LossScaleSpec {
    pub fn dynamic(init_scale: f64) -> Self {
        LossScaleSpec::Dynamic {
            init_scale,
            backoff_factor: 2.0,
            growth_factor: 2.0,
            growth_interval: 2000,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("ckpt_save_policy is top-k, but validation is disabled; enable val_while_train")]
    TopKRequiresValidation,

    #[error("gradient_accumulation_steps must be at least 1")]
    ZeroAccumulation,

    #[error("keep_checkpoint_max must be at least 1 when checkpointing is enabled")]
    ZeroKeepCheckpointMax,

    #[error("epoch_size must be at least 1")]
    ZeroEpochs,

    #[error("batch_size must be at least 1")]
    ZeroBatchSize,

    #[error("val_interval must be at least 1 when validation is enabled")]
    ZeroValInterval,

    #[error("warmup spans {warmup_epochs} epochs but the run only has {epoch_size}")]
    WarmupExceedsSchedule { warmup_epochs: u32, epoch_size: u32 },

    #[error("ema_decay must lie in (0, 1), got {0}")]
    BadEmaDecay(f64),
}

/// Immutable snapshot of everything a training run needs to know, built once
/// from parsed arguments and validated before the first step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainingRunConfig {
    pub model_name: String,
    /// Number of epochs to train.
    pub epoch_size: u32,
    pub batch_size: usize,
    pub seed: u64,
    pub distribute: bool,

    pub lr: f64,
    pub min_lr: f64,
    pub warmup_epochs: u32,
    pub warmup_factor: f64,
    pub decay: DecayStrategy,

    pub optimizer: OptimizerDefinition,
    pub loss_scale: LossScaleSpec,
    pub drop_overflow_update: bool,
    pub gradient_accumulation_steps: u32,

    pub ema: bool,
    pub ema_decay: f64,
    pub clip_grad: bool,
    pub clip_value: f32,

    pub ckpt_save_policy: CheckpointPolicy,
    pub ckpt_save_interval: u32,
    pub keep_checkpoint_max: usize,
    pub ckpt_save_dir: PathBuf,
    /// Checkpoint to resume from, if any.
    pub ckpt_path: Option<PathBuf>,
    /// Also restore optimizer moments from the separate per-model blob.
    pub resume_opt: bool,

    pub val_while_train: bool,
    pub val_interval: u32,
    pub metric_direction: MetricDirection,

    pub log_interval: u32,
    pub summary_dir: Option<PathBuf>,
}

impl TrainingRunConfig {
    /// Checks every startup precondition. Called once, before any training
    /// step runs; failures here are fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ckpt_save_policy == CheckpointPolicy::TopK && !self.val_while_train {
            return Err(ConfigError::TopKRequiresValidation);
        }
        if self.gradient_accumulation_steps == 0 {
            return Err(ConfigError::ZeroAccumulation);
        }
        if self.keep_checkpoint_max == 0 {
            return Err(ConfigError::ZeroKeepCheckpointMax);
        }
        if self.epoch_size == 0 {
            return Err(ConfigError::ZeroEpochs);
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.val_while_train && self.val_interval == 0 {
            return Err(ConfigError::ZeroValInterval);
        }
        if self.warmup_epochs > self.epoch_size {
            return Err(ConfigError::WarmupExceedsSchedule {
                warmup_epochs: self.warmup_epochs,
                epoch_size: self.epoch_size,
            });
        }
        if self.ema && !(self.ema_decay > 0.0 && self.ema_decay < 1.0) {
            return Err(ConfigError::BadEmaDecay(self.ema_decay));
        }
        Ok(())
    }
}

impl Default for TrainingRunConfig {
    fn default() -> Self {
        Self {
            model_name: "model".to_string(),
            epoch_size: 1,
            batch_size: 32,
            seed: 42,
            distribute: false,
            lr: 1e-3,
            min_lr: 0.0,
            warmup_epochs: 0,
            warmup_factor: 0.0,
            decay: DecayStrategy::Constant,
            optimizer: OptimizerDefinition::default(),
            loss_scale: LossScaleSpec::default(),
            drop_overflow_update: false,
            gradient_accumulation_steps: 1,
            ema: false,
            ema_decay: 0.9995,
            clip_grad: false,
            clip_value: 1.0,
            ckpt_save_policy: CheckpointPolicy::Interval,
            ckpt_save_interval: 1,
            keep_checkpoint_max: 10,
            ckpt_save_dir: PathBuf::from("./ckpt"),
            ckpt_path: None,
            resume_opt: false,
            val_while_train: false,
            val_interval: 1,
            metric_direction: MetricDirection::HigherIsBetter,
            log_interval: 100,
            summary_dir: None,
        }
    }
}
