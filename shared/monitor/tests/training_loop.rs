use std::path::Path;

use anyhow::Result;
use kiln_core::{
    CheckpointPolicy, DecayStrategy, DistributedContext, LearningRateSchedule, LossScaleSpec,
    OptimizerDefinition, Shuffle, TrainingRunConfig,
};
use kiln_data::{InMemorySource, Sample, ShardedBatchSource};
use kiln_modeling::{DummyModel, Evaluator, Model, TrainStepper};
use kiln_monitor::{load_checkpoint, StateMonitor};

fn source(n: usize) -> InMemorySource {
    InMemorySource::new(
        (0..n)
            .map(|i| Sample {
                input: vec![(i as f32).sin(), (i as f32).cos()],
                target: vec![(i % 5) as f32 / 5.0],
            })
            .collect(),
    )
}

fn base_config(dir: &Path) -> TrainingRunConfig {
    TrainingRunConfig {
        model_name: "tiny-net".to_string(),
        epoch_size: 3,
        batch_size: 2,
        lr: 0.05,
        min_lr: 1e-4,
        warmup_epochs: 1,
        warmup_factor: 0.1,
        decay: DecayStrategy::Cosine,
        optimizer: OptimizerDefinition::Sgd {
            momentum: 0.9,
            nesterov: false,
            weight_decay: 0.0,
        },
        ckpt_save_dir: dir.to_path_buf(),
        ckpt_save_interval: 1,
        keep_checkpoint_max: 10,
        seed: 11,
        ..Default::default()
    }
}

struct Run {
    model: DummyModel,
    stepper: TrainStepper,
    monitor: StateMonitor,
    data: ShardedBatchSource<InMemorySource>,
    config: TrainingRunConfig,
}

fn build_run(config: TrainingRunConfig, samples: usize) -> Result<Run> {
    let context = DistributedContext::single_process();
    let data = ShardedBatchSource::new(
        source(samples),
        &context,
        config.batch_size,
        Shuffle::seeded(config.seed),
    );
    let model = DummyModel::new(2, 1);
    let schedule = LearningRateSchedule::from_config(&config, data.num_batches());
    let stepper = TrainStepper::new(&config, schedule, &model);
    let monitor = StateMonitor::new(config.clone(), context)?;
    Ok(Run {
        model,
        stepper,
        monitor,
        data,
        config,
    })
}

#[test]
fn test_three_epochs_interval_one_yields_three_checkpoints() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut run = build_run(base_config(dir.path()), 12)?;
    let report = run
        .monitor
        .train(&mut run.model, &mut run.stepper, &run.data, None)?;

    // 12 samples / batch 2 = 6 batches per epoch, 3 epochs, no overflow.
    assert_eq!(run.data.num_batches(), 6);
    assert_eq!(report.final_step, 18);
    assert_eq!(report.epochs_run, 3);
    assert_eq!(report.saved_checkpoints.len(), 3);
    for (record, epoch) in report.saved_checkpoints.iter().zip(1u32..) {
        assert_eq!(record.epoch, epoch);
        assert_eq!(record.step, epoch as u64 * 6);
        assert!(record.path.exists());
    }
    Ok(())
}

#[test]
fn test_resuming_from_a_checkpoint_reproduces_the_uninterrupted_run() -> Result<()> {
    let reference_dir = tempfile::tempdir()?;
    let mut reference = build_run(base_config(reference_dir.path()), 12)?;
    let reference_report =
        reference
            .monitor
            .train(&mut reference.model, &mut reference.stepper, &reference.data, None)?;

    // Resume a fresh process image from the epoch-2 checkpoint and finish
    // epoch 3 in a separate directory.
    let epoch2 = reference_report
        .saved_checkpoints
        .iter()
        .find(|r| r.epoch == 2)
        .unwrap()
        .path
        .clone();

    let resumed_dir = tempfile::tempdir()?;
    let mut resumed = build_run(base_config(resumed_dir.path()), 12)?;
    let metadata = resumed
        .monitor
        .resume(&epoch2, &mut resumed.model, &mut resumed.stepper)?;
    assert_eq!(metadata.epoch, 2);
    assert_eq!(resumed.stepper.global_step(), 12);

    let resumed_report =
        resumed
            .monitor
            .train(&mut resumed.model, &mut resumed.stepper, &resumed.data, None)?;

    // The continued run walks steps 13..=18 and lands bit-identical to the
    // uninterrupted one.
    assert_eq!(resumed_report.final_step, reference_report.final_step);
    assert_eq!(resumed_report.epochs_run, 1);
    assert_eq!(resumed.model.parameters(), reference.model.parameters());

    let reference_final = load_checkpoint(
        &reference_report.saved_checkpoints[2].path,
        &reference.config.model_name,
    )?;
    let resumed_final = load_checkpoint(
        &resumed_report.saved_checkpoints[0].path,
        &resumed.config.model_name,
    )?;
    assert_eq!(reference_final.parameters, resumed_final.parameters);
    assert_eq!(
        reference_final.stepper.global_step,
        resumed_final.stepper.global_step
    );
    Ok(())
}

struct ScriptedEvaluator {
    metrics: Vec<f64>,
    cursor: usize,
}

impl Evaluator for ScriptedEvaluator {
    fn name(&self) -> &str {
        "scripted"
    }

    fn evaluate(&mut self, _model: &mut dyn Model) -> Result<f64> {
        let value = self.metrics[self.cursor.min(self.metrics.len() - 1)];
        self.cursor += 1;
        Ok(value)
    }
}

#[test]
fn test_top_k_saves_only_improvements_and_tracks_best() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = TrainingRunConfig {
        ckpt_save_policy: CheckpointPolicy::TopK,
        val_while_train: true,
        val_interval: 1,
        ..base_config(dir.path())
    };
    let mut run = build_run(config, 12)?;
    let mut evaluator = ScriptedEvaluator {
        metrics: vec![0.5, 0.7, 0.6],
        cursor: 0,
    };
    let report = run.monitor.train(
        &mut run.model,
        &mut run.stepper,
        &run.data,
        Some(&mut evaluator),
    )?;

    // Improvements at epochs 1 and 2; epoch 3 regressed and was not saved.
    let epochs: Vec<u32> = report.saved_checkpoints.iter().map(|r| r.epoch).collect();
    assert_eq!(epochs, vec![1, 2]);
    assert_eq!(report.best_metric, Some(0.7));
    assert!(dir.path().join("tiny-net_best.ckpt").exists());

    let best = load_checkpoint(&dir.path().join("tiny-net_best.ckpt"), "tiny-net")?;
    assert_eq!(best.metadata.epoch, 2);
    assert_eq!(best.metadata.validation_metric, Some(0.7));
    Ok(())
}

#[test]
fn test_latest_k_evicts_oldest_beyond_keep_max() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = TrainingRunConfig {
        ckpt_save_policy: CheckpointPolicy::LatestK,
        epoch_size: 5,
        keep_checkpoint_max: 2,
        ..base_config(dir.path())
    };
    let mut run = build_run(config, 12)?;
    let report = run
        .monitor
        .train(&mut run.model, &mut run.stepper, &run.data, None)?;

    let epochs: Vec<u32> = report.saved_checkpoints.iter().map(|r| r.epoch).collect();
    assert_eq!(epochs, vec![4, 5]);
    assert!(!dir.path().join("tiny-net-1_6.ckpt").exists());
    Ok(())
}

#[test]
fn test_overflow_is_counted_and_skipped_not_fatal() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = TrainingRunConfig {
        epoch_size: 1,
        loss_scale: LossScaleSpec::dynamic(1024.0),
        ..base_config(dir.path())
    };
    let mut run = build_run(config, 12)?;
    run.model.poison_next_batch();
    let report = run
        .monitor
        .train(&mut run.model, &mut run.stepper, &run.data, None)?;

    // One of the 6 windows overflowed: skipped, counted, never fatal.
    assert_eq!(report.overflow_steps, 1);
    assert_eq!(report.final_step, 5);
    Ok(())
}

#[test]
fn test_top_k_without_validation_fails_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrainingRunConfig {
        ckpt_save_policy: CheckpointPolicy::TopK,
        val_while_train: false,
        ..base_config(dir.path())
    };
    assert!(build_run(config, 12).is_err());
}
