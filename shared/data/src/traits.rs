use anyhow::{anyhow, Result};

/// One training example: a flat input vector and its regression/label target.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub input: Vec<f32>,
    pub target: Vec<f32>,
}

#[derive(Clone, Debug, Default)]
pub struct Batch {
    pub samples: Vec<Sample>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

pub trait LengthKnownSampleSource {
    fn num_samples(&self) -> usize;
}

/// Random-access source of samples. The orchestration core never looks inside
/// a sample; it only needs the count (to size shards and batches) and the
/// ability to fetch by index.
pub trait SampleSource: LengthKnownSampleSource {
    fn sample(&self, index: u64) -> Result<Sample>;
}

/// Owned in-memory source, used by tests and small synthetic runs.
#[derive(Clone, Debug, Default)]
pub struct InMemorySource {
    samples: Vec<Sample>,
}

impl InMemorySource {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }
}

impl LengthKnownSampleSource for InMemorySource {
    fn num_samples(&self) -> usize {
        self.samples.len()
    }
}

impl SampleSource for InMemorySource {
    fn sample(&self, index: u64) -> Result<Sample> {
        self.samples
            .get(index as usize)
            .cloned()
            .ok_or_else(|| {
                anyhow!(
                    "index {index} is out of bounds, we only have {} samples.",
                    self.samples.len()
                )
            })
    }
}
