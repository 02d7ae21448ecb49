mod local;
mod sharded;
mod traits;

pub use local::BinFileSource;
pub use sharded::{EpochBatches, ShardedBatchSource};
pub use traits::{Batch, InMemorySource, LengthKnownSampleSource, Sample, SampleSource};
