mod collective;
mod config;
mod schedule;
mod shuffle;

pub use collective::{
    AllReduce, DistributedContext, DistributedError, NoopReduce, ReduceError, ThreadGroupReduce,
};
pub use config::{
    CheckpointPolicy, ConfigError, LossScaleSpec, MetricDirection, OptimizerDefinition,
    TrainingRunConfig,
};
pub use schedule::{DecayStrategy, LearningRateSchedule};
pub use shuffle::Shuffle;
