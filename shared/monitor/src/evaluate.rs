use anyhow::{bail, Result};
use kiln_data::{SampleSource, ShardedBatchSource};
use kiln_modeling::{Evaluator, Model};

/// Mean loss over a held-out shard, lower-is-better.
///
/// The simplest useful validation collaborator: runs the model forward over
/// every validation batch (loss scale 1, gradients discarded) and averages.
pub struct MeanLossEvaluator<S> {
    batches: ShardedBatchSource<S>,
    name: String,
}

impl<S: SampleSource> MeanLossEvaluator<S> {
    pub fn new(batches: ShardedBatchSource<S>) -> Self {
        Self {
            batches,
            name: "val-loss".to_string(),
        }
    }
}

impl<S: SampleSource> Evaluator for MeanLossEvaluator<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&mut self, model: &mut dyn Model) -> Result<f64> {
        let mut total = 0.0;
        let mut count = 0usize;
        for batch in self.batches.epoch(0) {
            let backward = model.forward_backward(&batch?, 1.0)?;
            total += backward.loss;
            count += 1;
        }
        if count == 0 {
            bail!("validation shard has no batches");
        }
        Ok(total / count as f64)
    }
}
