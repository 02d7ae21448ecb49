use std::path::Path;

use anyhow::{anyhow, bail, Result};
use tracing::info;

use crate::traits::{LengthKnownSampleSource, Sample, SampleSource};

const DATA_FILE_EXTENSION: &str = "bin";

/// Directory-backed sample source over raw little-endian f32 records.
///
/// Each record is `input_width + target_width` consecutive f32 values;
/// trailing bytes that don't fill a whole record are ignored.
pub struct BinFileSource {
    data: Vec<Vec<f32>>,
    samples_per_file: Vec<usize>,
    input_width: usize,
    target_width: usize,
}

impl BinFileSource {
    pub fn new_from_directory(
        dir: impl AsRef<Path>,
        input_width: usize,
        target_width: usize,
    ) -> Result<Self> {
        if input_width == 0 {
            bail!("input_width must be at least 1");
        }
        let dir = std::fs::canonicalize(&dir)
            .map_err(|e| anyhow!("Failed to open data directory {:?}: {e}", dir.as_ref()))?;

        let mut bin_files = vec![];
        for file in std::fs::read_dir(&dir)
            .map_err(|e| anyhow!("couldn't load training data from {}: {e}", dir.display()))?
            .flatten()
        {
            let file = file.path();
            if file.extension().and_then(|s| s.to_str()) == Some(DATA_FILE_EXTENSION) {
                bin_files.push(file);
            }
        }
        bin_files.sort();

        if bin_files.is_empty() {
            bail!("No .{DATA_FILE_EXTENSION} data files in directory {:?}", dir);
        }

        let record_width = input_width + target_width;
        let mut data = Vec::with_capacity(bin_files.len());
        let mut samples_per_file = Vec::with_capacity(bin_files.len());
        for path in &bin_files {
            let bytes = std::fs::read(path)
                .map_err(|e| anyhow!("failed to read data file {}: {e}", path.display()))?;
            let values: Vec<f32> = bytes
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes(chunk.try_into().unwrap()))
                .collect();
            samples_per_file.push(values.len() / record_width);
            data.push(values);
        }

        let total: usize = samples_per_file.iter().sum();
        if total == 0 {
            bail!(
                "No complete records found in {}. Ensure files contain at least {} bytes per record.",
                dir.display(),
                record_width * 4
            );
        }

        info!(
            "Loaded {} files ({} samples) of training data from directory {}",
            bin_files.len(),
            total,
            dir.display()
        );

        Ok(Self {
            data,
            samples_per_file,
            input_width,
            target_width,
        })
    }
}

impl LengthKnownSampleSource for BinFileSource {
    fn num_samples(&self) -> usize {
        self.samples_per_file.iter().sum()
    }
}

impl SampleSource for BinFileSource {
    fn sample(&self, index: u64) -> Result<Sample> {
        let mut local = index as usize;
        for (file, &count) in self.data.iter().zip(&self.samples_per_file) {
            if local < count {
                let record_width = self.input_width + self.target_width;
                let offset = local * record_width;
                let record = &file[offset..offset + record_width];
                return Ok(Sample {
                    input: record[..self.input_width].to_vec(),
                    target: record[self.input_width..].to_vec(),
                });
            }
            local -= count;
        }
        Err(anyhow!(
            "index {index} is out of bounds, we only have {} samples.",
            self.num_samples()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_records(path: &Path, records: &[&[f32]]) {
        let mut file = std::fs::File::create(path).unwrap();
        for record in records {
            for value in *record {
                file.write_all(&value.to_le_bytes()).unwrap();
            }
        }
    }

    #[test]
    fn test_reads_records_across_files() {
        let dir = tempfile::tempdir().unwrap();
        write_records(&dir.path().join("a.bin"), &[&[1.0, 2.0, 10.0]]);
        write_records(
            &dir.path().join("b.bin"),
            &[&[3.0, 4.0, 20.0], &[5.0, 6.0, 30.0]],
        );

        let source = BinFileSource::new_from_directory(dir.path(), 2, 1).unwrap();
        assert_eq!(source.num_samples(), 3);
        assert_eq!(
            source.sample(0).unwrap(),
            Sample {
                input: vec![1.0, 2.0],
                target: vec![10.0]
            }
        );
        // Files are visited in sorted order, so index 2 lands in b.bin.
        assert_eq!(source.sample(2).unwrap().target, vec![30.0]);
        assert!(source.sample(3).is_err());
    }

    #[test]
    fn test_empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(BinFileSource::new_from_directory(dir.path(), 2, 1).is_err());
    }

    #[test]
    fn test_trailing_partial_record_ignored() {
        let dir = tempfile::tempdir().unwrap();
        // One full record plus half of another.
        write_records(&dir.path().join("a.bin"), &[&[1.0, 2.0, 10.0], &[3.0]]);
        let source = BinFileSource::new_from_directory(dir.path(), 2, 1).unwrap();
        assert_eq!(source.num_samples(), 1);
    }
}
