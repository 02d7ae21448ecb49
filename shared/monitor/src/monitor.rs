use std::path::Path;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use kiln_core::{DistributedContext, TrainingRunConfig};
use kiln_data::{SampleSource, ShardedBatchSource};
use kiln_modeling::{Evaluator, Model, StepOutcome, TrainStepper};
use tracing::{debug, info};

use crate::checkpoint::{
    load_checkpoint, CheckpointMetadata, CheckpointRecord, CheckpointStore, TrainingCheckpoint,
};
use crate::summary::{now_ms, EpochRecord, StepRecord, SummaryWriter};

#[derive(Clone, Debug)]
pub struct TrainReport {
    pub final_step: u64,
    pub epochs_run: u32,
    pub overflow_steps: u64,
    pub best_metric: Option<f64>,
    pub saved_checkpoints: Vec<CheckpointRecord>,
}

/// The orchestration core: sequences epochs and steps, decides checkpoint and
/// validation timing, and owns the retention set and best-record tracking.
///
/// Exactly one writer exists per run: the checkpoint store and summary sink
/// are only constructed on the coordinating rank, so every other rank
/// observes the same epoch/step sequence without touching persistent state.
pub struct StateMonitor {
    config: TrainingRunConfig,
    context: DistributedContext,
    store: Option<CheckpointStore>,
    summary: SummaryWriter,
    start_epoch: u32,
}

impl StateMonitor {
    /// Validates the configuration and prepares coordinator-side state.
    /// Configuration errors surface here, before any training step runs.
    pub fn new(config: TrainingRunConfig, context: DistributedContext) -> Result<Self> {
        config.validate()?;
        let coordinator = context.is_coordinator();
        let store = if coordinator {
            Some(CheckpointStore::new(&config)?)
        } else {
            None
        };
        let summary = match (&config.summary_dir, coordinator) {
            (Some(dir), true) => SummaryWriter::new(dir.join("summary.jsonl"))
                .with_context(|| format!("failed to open summary sink in {}", dir.display()))?,
            _ => SummaryWriter::disabled(),
        };
        Ok(Self {
            config,
            context,
            store,
            summary,
            start_epoch: 0,
        })
    }

    /// Restore a prior run: parameters into the model, counters and moments
    /// into the stepper, and the starting epoch into this monitor. Any
    /// mismatch (wrong model, wrong parameter count, foreign optimizer
    /// state) is fatal here, at load time.
    pub fn resume(
        &mut self,
        path: &Path,
        model: &mut dyn Model,
        stepper: &mut TrainStepper,
    ) -> Result<CheckpointMetadata> {
        let checkpoint = load_checkpoint(path, &self.config.model_name)?;
        model.set_parameters(&checkpoint.parameters)?;
        stepper.restore(checkpoint.stepper)?;
        self.start_epoch = checkpoint.metadata.epoch;
        info!(
            epoch = checkpoint.metadata.epoch,
            step = checkpoint.metadata.step,
            "resumed from checkpoint {}",
            path.display()
        );
        Ok(checkpoint.metadata)
    }

    pub fn start_epoch(&self) -> u32 {
        self.start_epoch
    }

    /// Run the training loop: epochs `start_epoch + 1 ..= epoch_size`, each
    /// walking this rank's shard through the stepper, with validation and
    /// checkpointing applied at epoch boundaries.
    pub fn train<S: SampleSource>(
        &mut self,
        model: &mut dyn Model,
        stepper: &mut TrainStepper,
        data: &ShardedBatchSource<S>,
        mut evaluator: Option<&mut dyn Evaluator>,
    ) -> Result<TrainReport> {
        let coordinator = self.context.is_coordinator();
        if self.config.val_while_train && coordinator && evaluator.is_none() {
            bail!("validation is enabled but no evaluator was provided");
        }

        let mut epochs_run = 0;
        for epoch in (self.start_epoch + 1)..=self.config.epoch_size {
            let epoch_started = Instant::now();
            let mut loss_sum = 0.0;
            let mut applied_steps = 0u64;

            for batch in data.epoch(epoch) {
                let batch = batch?;
                match stepper.step(model, &batch)? {
                    StepOutcome::Applied { step, loss, lr } => {
                        loss_sum += loss;
                        applied_steps += 1;
                        if coordinator && step % self.config.log_interval.max(1) as u64 == 0 {
                            info!(
                                "epoch: {}, step: {}, loss: {:.4}, lr: {:.6e}, overflows: {}",
                                epoch,
                                step,
                                loss,
                                lr,
                                stepper.overflow_steps()
                            );
                            self.summary.record_step(StepRecord {
                                step,
                                epoch,
                                loss,
                                lr,
                                loss_scale: stepper.loss_scale(),
                                overflow_steps: stepper.overflow_steps(),
                                timestamp_ms: now_ms(),
                            })?;
                        }
                    }
                    StepOutcome::SkippedOverflow { loss_scale } => {
                        debug!(
                            epoch,
                            loss_scale, "overflowed update skipped, continuing"
                        );
                    }
                    StepOutcome::Accumulating { .. } => {}
                }
            }
            epochs_run += 1;

            let mean_loss = if applied_steps > 0 {
                loss_sum / applied_steps as f64
            } else {
                f64::NAN
            };

            let validation_due =
                self.config.val_while_train && epoch % self.config.val_interval == 0;
            let mut metric = None;
            if validation_due && coordinator {
                if let Some(evaluator) = evaluator.as_deref_mut() {
                    let value = evaluator.evaluate(model)?;
                    info!(
                        "epoch: {}, {}: {:.6}",
                        epoch,
                        evaluator.name(),
                        value
                    );
                    metric = Some(value);
                }
            }

            if let Some(store) = &mut self.store {
                let checkpoint = TrainingCheckpoint::new(
                    &self.config,
                    epoch,
                    model.parameters(),
                    stepper.snapshot(),
                    metric,
                );
                let improved = match metric {
                    Some(value) => store.observe_validation(&checkpoint, value)?,
                    None => false,
                };
                if store.maybe_save(&checkpoint, improved)?.is_some() {
                    store.save_optimizer_state(&checkpoint.stepper.moments)?;
                }
                self.summary.record_epoch(EpochRecord {
                    epoch,
                    final_step: stepper.global_step(),
                    mean_loss,
                    validation_metric: metric,
                    duration_ms: epoch_started.elapsed().as_millis() as u64,
                    timestamp_ms: now_ms(),
                })?;
                info!(
                    "epoch {} done: step: {}, mean loss: {:.4}, overflows: {}, duration: {:.2}s",
                    epoch,
                    stepper.global_step(),
                    mean_loss,
                    stepper.overflow_steps(),
                    epoch_started.elapsed().as_secs_f32()
                );
            }
        }

        Ok(TrainReport {
            final_step: stepper.global_step(),
            epochs_run,
            overflow_steps: stepper.overflow_steps(),
            best_metric: self.store.as_ref().and_then(|s| s.best_metric()),
            saved_checkpoints: self
                .store
                .as_ref()
                .map(|s| s.records().to_vec())
                .unwrap_or_default(),
        })
    }
}
