use anyhow::Result;
use kiln_core::{DistributedContext, Shuffle};
use rand::seq::SliceRandom;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::traits::{Batch, LengthKnownSampleSource, SampleSource};

/// Deterministic rank-sharded view over a sample source.
///
/// The dataset is partitioned into disjoint equal-length shards, one per
/// worker: the tail that doesn't divide evenly is dropped, so every rank
/// walks the same number of batches per epoch. A desync here would stall the
/// whole group at the next collective call, so equal shard lengths are a hard
/// contract, not an optimization.
///
/// The per-epoch permutation is derived from (shuffle seed, epoch), which
/// makes shard contents reproducible across process restarts: resuming at
/// epoch E re-derives exactly the order an uninterrupted run would have used.
pub struct ShardedBatchSource<S> {
    source: S,
    shuffle: Shuffle,
    world_size: usize,
    rank: usize,
    batch_size: usize,
}

impl<S: SampleSource> ShardedBatchSource<S> {
    pub fn new(
        source: S,
        context: &DistributedContext,
        batch_size: usize,
        shuffle: Shuffle,
    ) -> Self {
        Self {
            source,
            shuffle,
            world_size: context.num_workers(),
            rank: context.rank().unwrap_or(0),
            batch_size: batch_size.max(1),
        }
    }

    /// Samples in this worker's shard (identical on every rank).
    pub fn local_samples(&self) -> usize {
        self.source.num_samples() / self.world_size
    }

    /// Batches per epoch on this worker; the partial tail batch is dropped.
    pub fn num_batches(&self) -> u64 {
        (self.local_samples() / self.batch_size) as u64
    }

    /// The global sample indices this rank visits in the given epoch, in
    /// visit order, truncated to whole batches.
    fn epoch_indices(&self, epoch: u32) -> Vec<u64> {
        let total = self.source.num_samples() as u64;
        let mut order: Vec<u64> = (0..total).collect();
        if let Shuffle::Seeded(seed) = self.shuffle {
            let mut epoch_seed = seed;
            for (dst, src) in epoch_seed[0..4].iter_mut().zip(epoch.to_be_bytes()) {
                *dst ^= src;
            }
            order.shuffle(&mut ChaCha8Rng::from_seed(epoch_seed));
        }

        let per_rank = self.local_samples();
        let start = self.rank * per_rank;
        let usable = (per_rank / self.batch_size) * self.batch_size;
        order[start..start + per_rank][..usable].to_vec()
    }

    /// Iterate this worker's batches for one epoch.
    pub fn epoch(&self, epoch: u32) -> EpochBatches<'_, S> {
        EpochBatches {
            source: &self.source,
            indices: self.epoch_indices(epoch),
            batch_size: self.batch_size,
            cursor: 0,
        }
    }

    pub fn into_inner(self) -> S {
        self.source
    }
}

impl<S: SampleSource> LengthKnownSampleSource for ShardedBatchSource<S> {
    fn num_samples(&self) -> usize {
        self.source.num_samples()
    }
}

pub struct EpochBatches<'a, S> {
    source: &'a S,
    indices: Vec<u64>,
    batch_size: usize,
    cursor: usize,
}

impl<S: SampleSource> Iterator for EpochBatches<'_, S> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.indices.len() {
            return None;
        }
        let end = self.cursor + self.batch_size;
        let samples: Result<Vec<_>> = self.indices[self.cursor..end]
            .iter()
            .map(|&index| self.source.sample(index))
            .collect();
        self.cursor = end;
        Some(samples.map(|samples| Batch { samples }))
    }
}
