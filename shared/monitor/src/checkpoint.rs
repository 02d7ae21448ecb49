use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use kiln_core::{CheckpointPolicy, MetricDirection, TrainingRunConfig};
use kiln_modeling::{OptimizerMoments, StepperSnapshot};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CHECKPOINT_EXTENSION: &str = "ckpt";
const SIDECAR_SUFFIX: &str = "meta.json";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O failed at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("failed to encode checkpoint: {0}")]
    Encode(postcard::Error),

    #[error("failed to decode checkpoint {path}: {source}")]
    Decode {
        path: PathBuf,
        source: postcard::Error,
    },

    #[error("checkpoint is for model '{got}', this run trains '{expected}'")]
    ModelMismatch { expected: String, got: String },

    #[error("cannot determine resume epoch from {0}: no metadata sidecar, unreadable blob, and unparseable filename")]
    NoResumeMetadata(PathBuf),
}

/// Structured description of a checkpoint, stored inside the blob and
/// duplicated in a `.meta.json` sidecar. This record, not the filename, is
/// the authoritative source of resume metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub model_name: String,
    pub epoch: u32,
    pub step: u64,
    pub num_parameters: usize,
    pub validation_metric: Option<f64>,
    pub ema: bool,
    pub timestamp_ms: u64,
}

/// The opaque blob written to disk: parameters plus the full wrapper state
/// (global step, optimizer moments, loss scale, EMA shadow).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainingCheckpoint {
    pub metadata: CheckpointMetadata,
    pub parameters: Vec<f32>,
    pub stepper: StepperSnapshot,
}

impl TrainingCheckpoint {
    pub fn new(
        config: &TrainingRunConfig,
        epoch: u32,
        parameters: Vec<f32>,
        stepper: StepperSnapshot,
        validation_metric: Option<f64>,
    ) -> Self {
        Self {
            metadata: CheckpointMetadata {
                model_name: config.model_name.clone(),
                epoch,
                step: stepper.global_step,
                num_parameters: parameters.len(),
                validation_metric,
                ema: stepper.ema.is_some(),
                timestamp_ms: now_ms(),
            },
            parameters,
            stepper,
        }
    }
}

/// One retained checkpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct CheckpointRecord {
    pub epoch: u32,
    pub step: u64,
    pub path: PathBuf,
    pub validation_metric: Option<f64>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
    std::fs::write(path, bytes).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{SIDECAR_SUFFIX}"));
    PathBuf::from(name)
}

/// Legacy-compatibility fallback: recover (model, epoch, step) from a
/// `{model}-{epoch}_{step}.ckpt` filename. Only consulted when a checkpoint
/// has lost both its sidecar and a readable in-blob metadata record; new code
/// paths go through `CheckpointMetadata`.
pub fn parse_checkpoint_filename(path: &Path) -> Option<(String, u32, u64)> {
    let stem = path.file_stem()?.to_str()?;
    // The model name may itself contain '-', so split from the right.
    let (model, counters) = stem.rsplit_once('-')?;
    let (epoch, step) = counters.split_once('_')?;
    Some((model.to_string(), epoch.parse().ok()?, step.parse().ok()?))
}

/// Load a full checkpoint blob and verify it belongs to this run's model.
pub fn load_checkpoint(
    path: &Path,
    expected_model: &str,
) -> Result<TrainingCheckpoint, CheckpointError> {
    let bytes = std::fs::read(path).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let checkpoint: TrainingCheckpoint =
        postcard::from_bytes(&bytes).map_err(|source| CheckpointError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
    if checkpoint.metadata.model_name != expected_model {
        return Err(CheckpointError::ModelMismatch {
            expected: expected_model.to_string(),
            got: checkpoint.metadata.model_name,
        });
    }
    Ok(checkpoint)
}

/// Resolve the metadata a resume should start from: the sidecar first, then
/// the blob itself, and only then the filename fallback.
pub fn resume_metadata(path: &Path) -> Result<CheckpointMetadata, CheckpointError> {
    let sidecar = sidecar_path(path);
    if let Ok(contents) = std::fs::read_to_string(&sidecar) {
        if let Ok(metadata) = serde_json::from_str::<CheckpointMetadata>(&contents) {
            return Ok(metadata);
        }
        warn!("ignoring malformed metadata sidecar {}", sidecar.display());
    }

    if let Ok(bytes) = std::fs::read(path) {
        if let Ok(checkpoint) = postcard::from_bytes::<TrainingCheckpoint>(&bytes) {
            return Ok(checkpoint.metadata);
        }
    }

    if let Some((model_name, epoch, step)) = parse_checkpoint_filename(path) {
        warn!(
            "no metadata record for {}; falling back to filename parse",
            path.display()
        );
        return Ok(CheckpointMetadata {
            model_name,
            epoch,
            step,
            num_parameters: 0,
            validation_metric: None,
            ema: false,
            timestamp_ms: 0,
        });
    }

    Err(CheckpointError::NoResumeMetadata(path.to_path_buf()))
}

/// Load the separate per-model optimizer-state artifact.
pub fn load_optimizer_moments(
    dir: &Path,
    model_name: &str,
) -> Result<OptimizerMoments, CheckpointError> {
    let path = dir.join(format!("optim_{model_name}.{CHECKPOINT_EXTENSION}"));
    let bytes = std::fs::read(&path).map_err(|source| CheckpointError::Io {
        path: path.clone(),
        source,
    })?;
    postcard::from_bytes(&bytes).map_err(|source| CheckpointError::Decode { path, source })
}

/// Owns the bounded retention set and the best-record bookkeeping.
///
/// Only the coordinating rank constructs one of these; `&mut self` on every
/// mutating call keeps saves non-re-entrant. Save failures propagate as
/// errors; when checkpointing was requested at this interval the run
/// terminates rather than continuing unmonitored.
pub struct CheckpointStore {
    dir: PathBuf,
    model_name: String,
    policy: CheckpointPolicy,
    save_interval: u32,
    keep_max: usize,
    metric_direction: MetricDirection,
    records: Vec<CheckpointRecord>,
    best: Option<CheckpointRecord>,
}

impl CheckpointStore {
    pub fn new(config: &TrainingRunConfig) -> Result<Self, CheckpointError> {
        std::fs::create_dir_all(&config.ckpt_save_dir).map_err(|source| CheckpointError::Io {
            path: config.ckpt_save_dir.clone(),
            source,
        })?;
        Ok(Self {
            dir: config.ckpt_save_dir.clone(),
            model_name: config.model_name.clone(),
            policy: config.ckpt_save_policy,
            save_interval: config.ckpt_save_interval.max(1),
            keep_max: config.keep_checkpoint_max,
            metric_direction: config.metric_direction,
            records: Vec::new(),
            best: None,
        })
    }

    pub fn records(&self) -> &[CheckpointRecord] {
        &self.records
    }

    pub fn best(&self) -> Option<&CheckpointRecord> {
        self.best.as_ref()
    }

    pub fn best_metric(&self) -> Option<f64> {
        self.best.as_ref().and_then(|b| b.validation_metric)
    }

    /// Whether `metric` improves on the tracked best.
    pub fn improves(&self, metric: f64) -> bool {
        match self.best_metric() {
            Some(best) => self.metric_direction.improves(metric, best),
            None => true,
        }
    }

    /// Record a validation result; when it improves on the best so far, the
    /// separately-named best artifact is (re)written. Returns whether it
    /// improved.
    pub fn observe_validation(
        &mut self,
        checkpoint: &TrainingCheckpoint,
        metric: f64,
    ) -> Result<bool, CheckpointError> {
        if !self.improves(metric) {
            return Ok(false);
        }
        let path = self
            .dir
            .join(format!("{}_best.{CHECKPOINT_EXTENSION}", self.model_name));
        self.write_checkpoint(&path, checkpoint)?;
        info!(
            epoch = checkpoint.metadata.epoch,
            step = checkpoint.metadata.step,
            metric,
            "new best checkpoint saved to {}",
            path.display()
        );
        self.best = Some(CheckpointRecord {
            epoch: checkpoint.metadata.epoch,
            step: checkpoint.metadata.step,
            path,
            validation_metric: Some(metric),
        });
        Ok(true)
    }

    /// Apply the configured save policy at an epoch boundary. Returns the
    /// path written, if any.
    pub fn maybe_save(
        &mut self,
        checkpoint: &TrainingCheckpoint,
        improved: bool,
    ) -> Result<Option<PathBuf>, CheckpointError> {
        let should_save = match self.policy {
            CheckpointPolicy::Interval => checkpoint.metadata.epoch % self.save_interval == 0,
            CheckpointPolicy::TopK => improved,
            CheckpointPolicy::LatestK => true,
        };
        if !should_save {
            return Ok(None);
        }

        let path = self.dir.join(format!(
            "{}-{}_{}.{CHECKPOINT_EXTENSION}",
            self.model_name, checkpoint.metadata.epoch, checkpoint.metadata.step
        ));
        self.write_checkpoint(&path, checkpoint)?;
        debug!(
            epoch = checkpoint.metadata.epoch,
            step = checkpoint.metadata.step,
            "checkpoint saved to {}",
            path.display()
        );
        self.records.push(CheckpointRecord {
            epoch: checkpoint.metadata.epoch,
            step: checkpoint.metadata.step,
            path: path.clone(),
            validation_metric: checkpoint.metadata.validation_metric,
        });
        self.evict_beyond_max();
        Ok(Some(path))
    }

    /// Write the separate optimizer-state artifact for `resume_opt`.
    pub fn save_optimizer_state(
        &mut self,
        moments: &OptimizerMoments,
    ) -> Result<PathBuf, CheckpointError> {
        let path = self
            .dir
            .join(format!("optim_{}.{CHECKPOINT_EXTENSION}", self.model_name));
        let bytes = postcard::to_stdvec(moments).map_err(CheckpointError::Encode)?;
        write_file(&path, &bytes)?;
        Ok(path)
    }

    fn write_checkpoint(
        &self,
        path: &Path,
        checkpoint: &TrainingCheckpoint,
    ) -> Result<(), CheckpointError> {
        let bytes = postcard::to_stdvec(checkpoint).map_err(CheckpointError::Encode)?;
        write_file(path, &bytes)?;
        let sidecar = sidecar_path(path);
        let json = serde_json::to_string_pretty(&checkpoint.metadata)
            .expect("metadata is always serializable");
        write_file(&sidecar, json.as_bytes())?;
        Ok(())
    }

    /// Evict oldest-by-epoch records past `keep_checkpoint_max`. The record
    /// backing the current best is exempt; only a better checkpoint ever
    /// supersedes it.
    fn evict_beyond_max(&mut self) {
        while self.records.len() > self.keep_max {
            let best_key = self.best.as_ref().map(|b| (b.epoch, b.step));
            let victim = self
                .records
                .iter()
                .position(|r| best_key != Some((r.epoch, r.step)));
            let Some(victim) = victim else {
                return;
            };
            let record = self.records.remove(victim);
            debug!(
                epoch = record.epoch,
                "evicting checkpoint {}",
                record.path.display()
            );
            for path in [sidecar_path(&record.path), record.path] {
                if let Err(err) = std::fs::remove_file(&path) {
                    warn!("failed to remove evicted checkpoint {}: {err}", path.display());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_modeling::LossScaleState;

    fn snapshot(step: u64) -> StepperSnapshot {
        StepperSnapshot {
            global_step: step,
            moments: OptimizerMoments::Sgd {
                velocity: vec![0.0; 3],
            },
            loss_scale: LossScaleState {
                scale: 1.0,
                good_steps: 0,
            },
            ema: None,
        }
    }

    fn config(dir: &Path) -> TrainingRunConfig {
        TrainingRunConfig {
            model_name: "tiny-net".to_string(),
            ckpt_save_dir: dir.to_path_buf(),
            keep_checkpoint_max: 2,
            ..Default::default()
        }
    }

    fn checkpoint_at(config: &TrainingRunConfig, epoch: u32, metric: Option<f64>) -> TrainingCheckpoint {
        TrainingCheckpoint::new(config, epoch, vec![1.0, 2.0, 3.0], snapshot(epoch as u64 * 10), metric)
    }

    #[test]
    fn test_parse_checkpoint_filename() {
        assert_eq!(
            parse_checkpoint_filename(Path::new("/ckpt/tiny-net-3_120.ckpt")),
            Some(("tiny-net".to_string(), 3, 120))
        );
        assert_eq!(parse_checkpoint_filename(Path::new("garbage.ckpt")), None);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let mut store = CheckpointStore::new(&config).unwrap();
        let checkpoint = checkpoint_at(&config, 1, None);
        let path = store.maybe_save(&checkpoint, false).unwrap().unwrap();

        let loaded = load_checkpoint(&path, "tiny-net").unwrap();
        assert_eq!(loaded.metadata, checkpoint.metadata);
        assert_eq!(loaded.parameters, checkpoint.parameters);
        assert_eq!(loaded.stepper.global_step, 10);
    }

    #[test]
    fn test_model_mismatch_is_fatal_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let mut store = CheckpointStore::new(&config).unwrap();
        let path = store
            .maybe_save(&checkpoint_at(&config, 1, None), false)
            .unwrap()
            .unwrap();
        assert!(matches!(
            load_checkpoint(&path, "other-model"),
            Err(CheckpointError::ModelMismatch { .. })
        ));
    }

    #[test]
    fn test_resume_metadata_prefers_sidecar_then_falls_back_to_filename() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let mut store = CheckpointStore::new(&config).unwrap();
        let path = store
            .maybe_save(&checkpoint_at(&config, 4, None), false)
            .unwrap()
            .unwrap();

        let metadata = resume_metadata(&path).unwrap();
        assert_eq!(metadata.epoch, 4);
        assert_eq!(metadata.num_parameters, 3);

        // Remove both the sidecar and the blob: only the filename is left.
        std::fs::remove_file(sidecar_path(&path)).unwrap();
        std::fs::write(&path, b"not a checkpoint").unwrap();
        let fallback = resume_metadata(&path).unwrap();
        assert_eq!(fallback.model_name, "tiny-net");
        assert_eq!(fallback.epoch, 4);
        assert_eq!(fallback.step, 40);
    }

    #[test]
    fn test_retention_never_exceeds_keep_max() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let mut store = CheckpointStore::new(&config).unwrap();
        for epoch in 1..=6 {
            store
                .maybe_save(&checkpoint_at(&config, epoch, None), false)
                .unwrap();
            assert!(store.records().len() <= 2);
        }
        // Oldest evicted first: epochs 5 and 6 remain, and their files exist.
        let epochs: Vec<u32> = store.records().iter().map(|r| r.epoch).collect();
        assert_eq!(epochs, vec![5, 6]);
        for record in store.records() {
            assert!(record.path.exists());
        }
        // Evicted files are gone.
        assert!(!dir.path().join("tiny-net-1_10.ckpt").exists());
    }

    #[test]
    fn test_best_record_survives_interval_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainingRunConfig {
            ckpt_save_policy: CheckpointPolicy::LatestK,
            val_while_train: true,
            ..config(dir.path())
        };
        let mut store = CheckpointStore::new(&config).unwrap();

        let first = checkpoint_at(&config, 1, Some(0.9));
        assert!(store.observe_validation(&first, 0.9).unwrap());
        store.maybe_save(&first, true).unwrap();

        for epoch in 2..=6 {
            let worse = checkpoint_at(&config, epoch, Some(0.1));
            assert!(!store.observe_validation(&worse, 0.1).unwrap());
            store.maybe_save(&worse, false).unwrap();
        }

        // The interval ring churned past epoch 1, but the best artifact and
        // its record are untouched.
        let best = store.best().unwrap();
        assert_eq!(best.epoch, 1);
        assert_eq!(best.validation_metric, Some(0.9));
        assert!(best.path.exists());
        assert_eq!(store.best_metric(), Some(0.9));
    }

    #[test]
    fn test_best_is_superseded_only_by_improvement() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainingRunConfig {
            metric_direction: MetricDirection::LowerIsBetter,
            ..config(dir.path())
        };
        let mut store = CheckpointStore::new(&config).unwrap();
        assert!(store
            .observe_validation(&checkpoint_at(&config, 1, Some(0.5)), 0.5)
            .unwrap());
        assert!(!store
            .observe_validation(&checkpoint_at(&config, 2, Some(0.7)), 0.7)
            .unwrap());
        assert!(store
            .observe_validation(&checkpoint_at(&config, 3, Some(0.3)), 0.3)
            .unwrap());
        assert_eq!(store.best().unwrap().epoch, 3);
    }

    #[test]
    fn test_top_k_policy_saves_only_on_improvement() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainingRunConfig {
            ckpt_save_policy: CheckpointPolicy::TopK,
            val_while_train: true,
            ..config(dir.path())
        };
        let mut store = CheckpointStore::new(&config).unwrap();
        assert!(store
            .maybe_save(&checkpoint_at(&config, 1, Some(0.5)), true)
            .unwrap()
            .is_some());
        assert!(store
            .maybe_save(&checkpoint_at(&config, 2, Some(0.4)), false)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_interval_policy_respects_interval() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainingRunConfig {
            ckpt_save_interval: 2,
            ..config(dir.path())
        };
        let mut store = CheckpointStore::new(&config).unwrap();
        assert!(store
            .maybe_save(&checkpoint_at(&config, 1, None), false)
            .unwrap()
            .is_none());
        assert!(store
            .maybe_save(&checkpoint_at(&config, 2, None), false)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_optimizer_state_artifact_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let mut store = CheckpointStore::new(&config).unwrap();
        let moments = OptimizerMoments::AdamW {
            m: vec![0.1, 0.2],
            v: vec![0.3, 0.4],
            updates: 7,
        };
        store.save_optimizer_state(&moments).unwrap();
        let loaded = load_optimizer_moments(dir.path(), "tiny-net").unwrap();
        assert_eq!(loaded, moments);
    }
}
