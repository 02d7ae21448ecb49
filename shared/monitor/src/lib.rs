mod checkpoint;
mod evaluate;
mod monitor;
mod summary;

pub use checkpoint::{
    load_checkpoint, load_optimizer_moments, parse_checkpoint_filename, resume_metadata,
    CheckpointError, CheckpointMetadata, CheckpointRecord, CheckpointStore, TrainingCheckpoint,
};
pub use evaluate::MeanLossEvaluator;
pub use monitor::{StateMonitor, TrainReport};
pub use summary::{load_summary, EpochRecord, StepRecord, SummaryRecord, SummaryWriter};
