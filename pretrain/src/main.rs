use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use kiln_core::{
    AllReduce, CheckpointPolicy, DecayStrategy, DistributedContext, LearningRateSchedule,
    LossScaleSpec, MetricDirection, NoopReduce, OptimizerDefinition, Shuffle, ThreadGroupReduce,
    TrainingRunConfig,
};
use kiln_data::{BinFileSource, LengthKnownSampleSource, ShardedBatchSource};
use kiln_modeling::{DummyModel, Evaluator, TrainStepper};
use kiln_monitor::{load_optimizer_moments, resume_metadata, MeanLossEvaluator, StateMonitor};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum LogOutput {
    Console,
    Json,
    None,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SchedulerArg {
    Constant,
    Step,
    MultiStep,
    Exponential,
    Cosine,
    CosineRestarts,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OptimizerArg {
    Sgd,
    Adamw,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LossScaleArg {
    Fixed,
    Dynamic,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PolicyArg {
    Interval,
    TopK,
    LatestK,
}

impl From<PolicyArg> for CheckpointPolicy {
    fn from(value: PolicyArg) -> Self {
        match value {
            PolicyArg::Interval => CheckpointPolicy::Interval,
            PolicyArg::TopK => CheckpointPolicy::TopK,
            PolicyArg::LatestK => CheckpointPolicy::LatestK,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum MetricDirectionArg {
    HigherIsBetter,
    LowerIsBetter,
}

impl From<MetricDirectionArg> for MetricDirection {
    fn from(value: MetricDirectionArg) -> Self {
        match value {
            MetricDirectionArg::HigherIsBetter => MetricDirection::HigherIsBetter,
            MetricDirectionArg::LowerIsBetter => MetricDirection::LowerIsBetter,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(about = "Resumable, distributed-consistent model pre-training")]
struct Args {
    #[arg(long, env, default_value = "linear")]
    model_name: String,

    /// Directory of little-endian f32 .bin training records.
    #[arg(long, env)]
    data_dir: PathBuf,

    /// Directory of validation records; required when --val-while-train.
    #[arg(long, env)]
    val_data_dir: Option<PathBuf>,

    /// f32 values per sample input.
    #[arg(long, env, default_value_t = 16)]
    input_width: usize,

    /// f32 values per sample target.
    #[arg(long, env, default_value_t = 1)]
    target_width: usize,

    #[arg(long, env, default_value_t = 10)]
    epoch_size: u32,

    #[arg(long, env, default_value_t = 32)]
    batch_size: usize,

    #[arg(long, env, default_value_t = 42)]
    seed: u64,

    /// Run `num_workers` data-parallel workers (local worker threads, one
    /// model replica and one disjoint shard each).
    #[arg(long, env, default_value_t = false)]
    distribute: bool,

    #[arg(long, env, default_value_t = 2)]
    num_workers: usize,

    #[arg(long, env, default_value_t = 1e-3)]
    lr: f64,

    #[arg(long, env, default_value_t = 1e-6)]
    min_lr: f64,

    #[arg(long, env, default_value_t = 0)]
    warmup_epochs: u32,

    #[arg(long, env, default_value_t = 0.0)]
    warmup_factor: f64,

    #[arg(long, env, value_enum, default_value_t = SchedulerArg::Cosine)]
    scheduler: SchedulerArg,

    /// Epochs between decays (step scheduler).
    #[arg(long, env, default_value_t = 10)]
    decay_epochs: u32,

    #[arg(long, env, default_value_t = 0.1)]
    decay_rate: f64,

    /// Epoch milestones (multi-step scheduler).
    #[arg(long, env, value_delimiter = ',')]
    multi_step_decay_milestones: Vec<u32>,

    #[arg(long, env, default_value_t = 1)]
    num_cycles: u32,

    #[arg(long, env, default_value_t = 1.0)]
    cycle_decay: f64,

    #[arg(long, env, value_enum, default_value_t = OptimizerArg::Adamw)]
    opt: OptimizerArg,

    #[arg(long, env, default_value_t = 0.9)]
    momentum: f32,

    #[arg(long, env, default_value_t = false)]
    use_nesterov: bool,

    #[arg(long, env, default_value_t = 0.9)]
    beta1: f32,

    #[arg(long, env, default_value_t = 0.999)]
    beta2: f32,

    #[arg(long, env, default_value_t = 1e-8)]
    eps: f32,

    #[arg(long, env, default_value_t = 0.0)]
    weight_decay: f32,

    #[arg(long, env, value_enum, default_value_t = LossScaleArg::Fixed)]
    loss_scale_type: LossScaleArg,

    #[arg(long, env, default_value_t = 1.0)]
    loss_scale: f64,

    #[arg(long, env, default_value_t = false)]
    drop_overflow_update: bool,

    #[arg(long, env, default_value_t = 1)]
    gradient_accumulation_steps: u32,

    #[arg(long, env, default_value_t = false)]
    ema: bool,

    #[arg(long, env, default_value_t = 0.9995)]
    ema_decay: f64,

    #[arg(long, env, default_value_t = false)]
    clip_grad: bool,

    #[arg(long, env, default_value_t = 1.0)]
    clip_value: f32,

    #[arg(long, env, value_enum, default_value_t = PolicyArg::Interval)]
    ckpt_save_policy: PolicyArg,

    #[arg(long, env, default_value_t = 1)]
    ckpt_save_interval: u32,

    #[arg(long, env, default_value_t = 10)]
    keep_checkpoint_max: usize,

    #[arg(long, env, default_value = "./ckpt")]
    ckpt_save_dir: PathBuf,

    /// Checkpoint to resume from.
    #[arg(long, env)]
    ckpt_path: Option<PathBuf>,

    /// Also restore optimizer moments from the separate optim_{model} blob.
    #[arg(long, env, default_value_t = false)]
    resume_opt: bool,

    #[arg(long, env, default_value_t = false)]
    val_while_train: bool,

    #[arg(long, env, default_value_t = 1)]
    val_interval: u32,

    #[arg(long, env, value_enum, default_value_t = MetricDirectionArg::LowerIsBetter)]
    metric_direction: MetricDirectionArg,

    #[arg(long, env, default_value_t = 100)]
    log_interval: u32,

    /// Directory for the JSONL summary sink.
    #[arg(long, env)]
    summary_dir: Option<PathBuf>,

    #[arg(long, env, value_enum, default_value_t = LogOutput::Console)]
    logs: LogOutput,
}

impl Args {
    fn decay(&self) -> DecayStrategy {
        match self.scheduler {
            SchedulerArg::Constant => DecayStrategy::Constant,
            SchedulerArg::Step => DecayStrategy::Step {
                decay_epochs: self.decay_epochs,
                decay_rate: self.decay_rate,
            },
            SchedulerArg::MultiStep => DecayStrategy::MultiStep {
                milestones: self.multi_step_decay_milestones.clone(),
                decay_rate: self.decay_rate,
            },
            SchedulerArg::Exponential => DecayStrategy::Exponential {
                decay_rate: self.decay_rate,
            },
            SchedulerArg::Cosine => DecayStrategy::Cosine,
            SchedulerArg::CosineRestarts => DecayStrategy::CosineRestarts {
                num_cycles: self.num_cycles,
                cycle_decay: self.cycle_decay,
            },
        }
    }

    fn optimizer(&self) -> OptimizerDefinition {
        match self.opt {
            OptimizerArg::Sgd => OptimizerDefinition::Sgd {
                momentum: self.momentum,
                nesterov: self.use_nesterov,
                weight_decay: self.weight_decay,
            },
            OptimizerArg::Adamw => OptimizerDefinition::AdamW {
                betas: [self.beta1, self.beta2],
                eps: self.eps,
                weight_decay: self.weight_decay,
            },
        }
    }

    fn loss_scale(&self) -> LossScaleSpec {
        match self.loss_scale_type {
            LossScaleArg::Fixed => LossScaleSpec::Fixed {
                scale: self.loss_scale,
            },
            LossScaleArg::Dynamic => LossScaleSpec::dynamic(self.loss_scale),
        }
    }

    fn to_config(&self) -> TrainingRunConfig {
        TrainingRunConfig {
            model_name: self.model_name.clone(),
            epoch_size: self.epoch_size,
            batch_size: self.batch_size,
            seed: self.seed,
            distribute: self.distribute,
            lr: self.lr,
            min_lr: self.min_lr,
            warmup_epochs: self.warmup_epochs,
            warmup_factor: self.warmup_factor,
            decay: self.decay(),
            optimizer: self.optimizer(),
            loss_scale: self.loss_scale(),
            drop_overflow_update: self.drop_overflow_update,
            gradient_accumulation_steps: self.gradient_accumulation_steps,
            ema: self.ema,
            ema_decay: self.ema_decay,
            clip_grad: self.clip_grad,
            clip_value: self.clip_value,
            ckpt_save_policy: self.ckpt_save_policy.into(),
            ckpt_save_interval: self.ckpt_save_interval,
            keep_checkpoint_max: self.keep_checkpoint_max,
            ckpt_save_dir: self.ckpt_save_dir.clone(),
            ckpt_path: self.ckpt_path.clone(),
            resume_opt: self.resume_opt,
            val_while_train: self.val_while_train,
            val_interval: self.val_interval,
            metric_direction: self.metric_direction.into(),
            log_interval: self.log_interval,
            summary_dir: self.summary_dir.clone(),
        }
    }
}

fn init_logging(output: LogOutput) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match output {
        LogOutput::Console => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogOutput::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogOutput::None => {}
    }
}

/// One worker's whole run: shard, reconcile counts, build the stepper, resume
/// if asked, then hand the loop to the state monitor.
fn run_worker(
    args: &Args,
    config: TrainingRunConfig,
    context: DistributedContext,
    reducer: &dyn AllReduce,
) -> Result<()> {
    let train_source =
        BinFileSource::new_from_directory(&args.data_dir, args.input_width, args.target_width)
            .context("failed to load training data")?;
    let local_count = train_source.num_samples() as u64;
    let shard = ShardedBatchSource::new(
        train_source,
        &context,
        config.batch_size,
        Shuffle::seeded(config.seed),
    );
    // Each worker only knows its own shard; the reducer yields the true
    // aggregate for the banner below.
    let train_count = reducer.all_reduce_sum(local_count)?;
    let num_batches = shard.num_batches();

    // Validation runs on the coordinating rank only, which also owns the
    // best-record bookkeeping.
    let mut evaluator = match (
        config.val_while_train && context.is_coordinator(),
        &args.val_data_dir,
    ) {
        (true, Some(dir)) => {
            let source = BinFileSource::new_from_directory(dir, args.input_width, args.target_width)
                .context("failed to load validation data")?;
            Some(MeanLossEvaluator::new(ShardedBatchSource::new(
                source,
                &DistributedContext::single_process(),
                config.batch_size,
                Shuffle::DontShuffle,
            )))
        }
        (true, None) => anyhow::bail!("--val-while-train requires --val-data-dir"),
        _ => None,
    };

    let mut model = DummyModel::new(args.input_width, args.target_width);
    let schedule = LearningRateSchedule::from_config(&config, num_batches);
    let mut stepper = TrainStepper::new(&config, schedule, &model);
    let mut monitor = StateMonitor::new(config.clone(), context)?;

    if let Some(ckpt_path) = &config.ckpt_path {
        let metadata = resume_metadata(ckpt_path)?;
        if context.is_coordinator() {
            info!(
                "Resume training from {}, last step: {}, last epoch: {}",
                ckpt_path.display(),
                metadata.step,
                metadata.epoch
            );
        }
        monitor.resume(ckpt_path, &mut model, &mut stepper)?;
        if config.resume_opt {
            let moments = load_optimizer_moments(&config.ckpt_save_dir, &config.model_name)
                .context("failed to load the optimizer-state artifact")?;
            stepper.restore_moments(moments)?;
        }
    } else if context.is_coordinator() {
        info!("Start training");
    }

    if context.is_coordinator() {
        info!("{}", "-".repeat(40));
        info!(
            "Num workers: {}\nDistributed mode: {}\nNum training samples: {}",
            context.num_workers(),
            config.distribute,
            train_count,
        );
        info!(
            "Num batches: {}\nBatch size: {}\nModel: {}\nNum epochs: {}\nOptimizer: {:?}\nLR: {}\nLR decay: {:?}",
            num_batches,
            config.batch_size,
            config.model_name,
            config.epoch_size,
            config.optimizer,
            config.lr,
            config.decay,
        );
        info!("{}", "-".repeat(40));
    }

    let report = monitor.train(
        &mut model,
        &mut stepper,
        &shard,
        evaluator.as_mut().map(|e| e as &mut dyn Evaluator),
    )?;

    if context.is_coordinator() {
        info!(
            "Training finished: {} epochs, final step: {}, overflow steps: {}, checkpoints kept: {}",
            report.epochs_run,
            report.final_step,
            report.overflow_steps,
            report.saved_checkpoints.len()
        );
        if let Some(best) = report.best_metric {
            info!("Best validation metric: {:.6}", best);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.logs);

    let config = args.to_config();
    config.validate().context("invalid run configuration")?;

    if !args.distribute {
        return run_worker(&args, config, DistributedContext::single_process(), &NoopReduce);
    }

    // Local data-parallel group: one worker thread per rank, each with its
    // own model replica and disjoint shard. Gradient averaging between
    // replicas belongs to the tensor runtime behind the Model trait; the
    // orchestration layer only reconciles counts and gates persistence.
    let handles = ThreadGroupReduce::group(args.num_workers);
    let workers: Vec<_> = handles
        .into_iter()
        .enumerate()
        .map(|(rank, reducer)| {
            let args = args.clone();
            let config = config.clone();
            std::thread::spawn(move || -> Result<()> {
                let context = DistributedContext::init(args.num_workers, rank)?;
                run_worker(&args, config, context, &reducer)
            })
        })
        .collect();

    for worker in workers {
        worker
            .join()
            .map_err(|_| anyhow::anyhow!("worker thread panicked"))??;
    }
    Ok(())
}
