//! Append-only JSONL summary sink: a scalar time series keyed by step,
//! written only by the coordinating rank.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: u64,
    pub epoch: u32,
    pub loss: f64,
    pub lr: f64,
    pub loss_scale: f64,
    /// Overflow-skipped windows so far, cumulative over the run.
    pub overflow_steps: u64,
    pub timestamp_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: u32,
    pub final_step: u64,
    pub mean_loss: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_metric: Option<f64>,
    pub duration_ms: u64,
    pub timestamp_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SummaryRecord {
    Step(StepRecord),
    Epoch(EpochRecord),
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct SummaryWriter {
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
}

impl SummaryWriter {
    pub fn new(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            writer: Some(BufWriter::new(file)),
            path: Some(path),
        })
    }

    /// A sink that drops everything, for non-coordinator ranks and runs
    /// without a summary dir.
    pub fn disabled() -> Self {
        Self {
            writer: None,
            path: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.writer.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn record(&mut self, record: &SummaryRecord) -> std::io::Result<()> {
        if let Some(writer) = &mut self.writer {
            let json = serde_json::to_string(record)?;
            writeln!(writer, "{}", json)?;
            writer.flush()?;
        }
        Ok(())
    }

    pub fn record_step(&mut self, record: StepRecord) -> std::io::Result<()> {
        self.record(&SummaryRecord::Step(record))
    }

    pub fn record_epoch(&mut self, record: EpochRecord) -> std::io::Result<()> {
        self.record(&SummaryRecord::Epoch(record))
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        if let Some(writer) = &mut self.writer {
            writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for SummaryWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Read a summary file back, skipping blank lines.
pub fn load_summary(path: impl AsRef<Path>) -> std::io::Result<Vec<SummaryRecord>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if !line.trim().is_empty() {
            records.push(serde_json::from_str(&line)?);
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_record(step: u64) -> StepRecord {
        StepRecord {
            step,
            epoch: 1,
            loss: 2.5,
            lr: 1e-3,
            loss_scale: 1.0,
            overflow_steps: 0,
            timestamp_ms: now_ms(),
        }
    }

    #[test]
    fn test_write_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary").join("run.jsonl");
        let mut writer = SummaryWriter::new(&path).unwrap();
        writer.record_step(step_record(1)).unwrap();
        writer
            .record_epoch(EpochRecord {
                epoch: 1,
                final_step: 10,
                mean_loss: 2.0,
                validation_metric: Some(0.8),
                duration_ms: 12,
                timestamp_ms: now_ms(),
            })
            .unwrap();

        let records = load_summary(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert!(matches!(&records[0], SummaryRecord::Step(s) if s.step == 1));
        assert!(
            matches!(&records[1], SummaryRecord::Epoch(e) if e.validation_metric == Some(0.8))
        );
    }

    #[test]
    fn test_append_keeps_existing_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.jsonl");
        SummaryWriter::new(&path)
            .unwrap()
            .record_step(step_record(1))
            .unwrap();
        SummaryWriter::new(&path)
            .unwrap()
            .record_step(step_record(2))
            .unwrap();
        assert_eq!(load_summary(&path).unwrap().len(), 2);
    }

    #[test]
    fn test_disabled_writer_is_a_no_op() {
        let mut writer = SummaryWriter::disabled();
        assert!(!writer.is_enabled());
        writer.record_step(step_record(1)).unwrap();
    }
}
