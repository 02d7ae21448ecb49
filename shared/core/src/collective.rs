use std::sync::{Arc, Condvar, Mutex};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DistributedError {
    #[error("world_size must be at least 1, got {0}")]
    EmptyWorld(usize),

    #[error("rank {rank} is out of range for world_size {world_size}")]
    RankOutOfRange { rank: usize, world_size: usize },
}

/// This worker's view of the data-parallel group.
///
/// In single-process mode there is no world: `world_size()` and `rank()` are
/// absent rather than zero, so callers can tell "sole process" apart from
/// "rank 0 of many". Every coordinator-only action (logging, checkpoint
/// writes, best-model bookkeeping) gates on the one `is_coordinator`
/// predicate instead of scattering rank checks through control flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DistributedContext {
    world: Option<(usize, usize)>,
}

impl DistributedContext {
    pub fn single_process() -> Self {
        Self { world: None }
    }

    pub fn init(world_size: usize, rank: usize) -> Result<Self, DistributedError> {
        if world_size == 0 {
            return Err(DistributedError::EmptyWorld(world_size));
        }
        if rank >= world_size {
            return Err(DistributedError::RankOutOfRange { rank, world_size });
        }
        Ok(Self {
            world: Some((world_size, rank)),
        })
    }

    pub fn world_size(&self) -> Option<usize> {
        self.world.map(|(size, _)| size)
    }

    pub fn rank(&self) -> Option<usize> {
        self.world.map(|(_, rank)| rank)
    }

    pub fn num_workers(&self) -> usize {
        self.world.map(|(size, _)| size).unwrap_or(1)
    }

    pub fn is_coordinator(&self) -> bool {
        match self.world {
            Some((_, rank)) => rank == 0,
            None => true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReduceError {
    #[error("reduction group poisoned; another participant panicked")]
    Poisoned,
}

/// Sum a scalar across every worker in the group.
///
/// The call blocks until all participants have contributed. If a worker never
/// reaches the reduction point the call hangs; that is a fatal condition the
/// surrounding job supervision must catch with a timeout, not something the
/// reducer can recover from.
pub trait AllReduce: Send + Sync {
    fn all_reduce_sum(&self, value: u64) -> Result<u64, ReduceError>;
}

/// Identity reduction for single-process runs.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopReduce;

impl AllReduce for NoopReduce {
    fn all_reduce_sum(&self, value: u64) -> Result<u64, ReduceError> {
        Ok(value)
    }
}

struct ReduceState {
    generation: u64,
    pending: usize,
    sum: u64,
    result: u64,
}

struct ReduceInner {
    participants: usize,
    state: Mutex<ReduceState>,
    cv: Condvar,
}

/// In-process all-reduce over a fixed-size group of worker threads.
///
/// Each participant holds one handle; `all_reduce_sum` blocks until all
/// `participants` handles have contributed, then every caller observes the
/// same total. Reusable across rounds.
#[derive(Clone)]
pub struct ThreadGroupReduce {
    inner: Arc<ReduceInner>,
}

impl ThreadGroupReduce {
    /// Create one handle per participant.
    pub fn group(participants: usize) -> Vec<Self> {
        let inner = Arc::new(ReduceInner {
            participants: participants.max(1),
            state: Mutex::new(ReduceState {
                generation: 0,
                pending: 0,
                sum: 0,
                result: 0,
            }),
            cv: Condvar::new(),
        });
        (0..participants.max(1))
            .map(|_| Self {
                inner: inner.clone(),
            })
            .collect()
    }
}

impl AllReduce for ThreadGroupReduce {
    fn all_reduce_sum(&self, value: u64) -> Result<u64, ReduceError> {
        let mut state = self.inner.state.lock().map_err(|_| ReduceError::Poisoned)?;
        let generation = state.generation;
        state.sum += value;
        state.pending += 1;

        if state.pending == self.inner.participants {
            state.result = state.sum;
            state.sum = 0;
            state.pending = 0;
            state.generation += 1;
            self.inner.cv.notify_all();
            return Ok(state.result);
        }

        while state.generation == generation {
            state = self
                .inner
                .cv
                .wait(state)
                .map_err(|_| ReduceError::Poisoned)?;
        }
        Ok(state.result)
    }
}
