//! Record file discovery and decoding into the in-memory cache
//!
//! Files are matched with a glob, read in sorted order, and every record is
//! decoded in parallel with rayon. The decoded images are cached once per
//! process; augmentation runs fresh every epoch on top of this cache.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dataset::burn_dataset::XrayDataset;
use crate::dataset::example::parse_example;
use crate::dataset::split::SplitConfig;
use crate::dataset::tfrecord::TfRecordReader;
use crate::utils::error::{Result, XrayError};

/// Data pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DataConfig {
    /// One-hot depth
    pub num_classes: usize,
    /// Side of the square the decoded JPEG is resized to
    pub decode_size: u32,
    /// Examples per batch
    pub batch_size: usize,
    /// Fraction of examples (rounded down to whole batches) used for training
    pub train_fraction: f64,
    /// Dataset size used for the split instead of the counted one
    pub declared_total: Option<usize>,
    /// Verify record checksums while reading
    pub verify_checksums: bool,
    /// Batches assembled ahead of the training loop
    pub prefetch: usize,
    /// Shuffle the training examples every epoch
    pub shuffle: bool,
    /// Seed for augmentation and shuffling
    pub seed: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            num_classes: crate::NUM_CLASSES,
            decode_size: crate::DECODE_SIZE,
            batch_size: crate::BATCH_SIZE,
            train_fraction: 0.7,
            declared_total: None,
            verify_checksums: true,
            prefetch: 2,
            shuffle: false,
            seed: 42,
        }
    }
}

impl DataConfig {
    pub fn split(&self) -> SplitConfig {
        SplitConfig {
            train_fraction: self.train_fraction,
            batch_size: self.batch_size,
            declared_total: self.declared_total,
        }
    }
}

/// Expand a glob into the sorted list of matching files
pub fn collect_record_files(pattern: &str) -> Result<Vec<PathBuf>> {
    let paths = glob::glob(pattern).map_err(|e| XrayError::Pattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;

    let mut files = Vec::new();
    for entry in paths {
        match entry {
            Ok(path) if path.is_file() => files.push(path),
            Ok(path) => debug!("Skipping non-file match {:?}", path),
            Err(e) => warn!("Unreadable glob match: {}", e),
        }
    }

    if files.is_empty() {
        return Err(XrayError::NoInputFiles(pattern.to_string()));
    }

    files.sort();
    Ok(files)
}

/// A serialized example together with where it came from
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub file: usize,
    pub index: usize,
    pub bytes: Vec<u8>,
}

/// Read every record of every file, in file order
pub fn read_records(files: &[PathBuf], verify_checksums: bool) -> Result<Vec<RawRecord>> {
    let mut records = Vec::new();
    for (file_idx, path) in files.iter().enumerate() {
        let before = records.len();
        read_file_records(path, file_idx, verify_checksums, &mut records)?;
        debug!("{:?}: {} records", path, records.len() - before);
    }
    Ok(records)
}

fn read_file_records(
    path: &Path,
    file_idx: usize,
    verify_checksums: bool,
    out: &mut Vec<RawRecord>,
) -> Result<()> {
    if !path.exists() {
        return Err(XrayError::PathNotFound(path.to_path_buf()));
    }
    let reader = TfRecordReader::new(BufReader::new(File::open(path)?)).with_checksums(verify_checksums);
    for (index, record) in reader.enumerate() {
        let bytes = record.map_err(|e| e.in_record(path, index))?;
        out.push(RawRecord {
            file: file_idx,
            index,
            bytes,
        });
    }
    Ok(())
}

/// Read and decode all examples into the cache
pub fn load_examples(files: &[PathBuf], config: &DataConfig) -> Result<XrayDataset> {
    info!("Reading {} record file(s)", files.len());
    let records = read_records(files, config.verify_checksums)?;
    let total = records.len();
    info!("Decoding {} examples", total);

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")
            .map_err(|e| XrayError::Dataset(e.to_string()))?
            .progress_chars("#>-"),
    );

    let decoded = AtomicUsize::new(0);
    let items = records
        .par_iter()
        .map(|record| {
            let example = parse_example(&record.bytes, config.num_classes, config.decode_size)
                .map_err(|e| e.in_record(&files[record.file], record.index));
            let count = decoded.fetch_add(1, Ordering::Relaxed);
            if count % 100 == 0 {
                pb.set_position(count as u64);
            }
            example
        })
        .collect::<Result<Vec<_>>>();

    pb.finish_and_clear();
    let items = items?;

    let unlabeled = items.iter().filter(|item| item.label.is_none()).count();
    if unlabeled > 0 {
        warn!(
            "{} example(s) carry labels outside [0, {})",
            unlabeled, config.num_classes
        );
    }
    info!("Cached {} decoded examples", items.len());

    Ok(XrayDataset::new(items, config.num_classes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::example::{encode_example, encode_jpeg};
    use crate::dataset::tfrecord::TfRecordWriter;
    use image::{Rgb, RgbImage};

    fn write_fixture(path: &Path, labels: &[i64]) {
        let jpeg = encode_jpeg(&RgbImage::from_pixel(16, 16, Rgb([90, 90, 90]))).unwrap();
        let mut writer = TfRecordWriter::new(File::create(path).unwrap());
        for &label in labels {
            writer.write_record(&encode_example(&jpeg, label)).unwrap();
        }
        writer.flush().unwrap();
    }

    #[test]
    fn test_collect_record_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.tfrecord", "a.tfrecord", "c.txt"] {
            File::create(dir.path().join(name)).unwrap();
        }
        let pattern = format!("{}/*.tfrecord", dir.path().display());
        let files = collect_record_files(&pattern).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.tfrecord", "b.tfrecord"]);
    }

    #[test]
    fn test_empty_glob_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = format!("{}/*.tfrecord", dir.path().display());
        assert!(matches!(
            collect_record_files(&pattern),
            Err(XrayError::NoInputFiles(_))
        ));
    }

    #[test]
    fn test_bad_pattern_is_an_error() {
        assert!(matches!(
            collect_record_files("data/[*.tfrecord"),
            Err(XrayError::Pattern { .. })
        ));
    }

    #[test]
    fn test_load_examples_keeps_file_order() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("part-0.tfrecord");
        let second = dir.path().join("part-1.tfrecord");
        write_fixture(&first, &[0, 1, 2]);
        write_fixture(&second, &[3, 25]);

        let config = DataConfig {
            decode_size: 32,
            ..DataConfig::default()
        };
        let dataset = load_examples(&[first, second], &config).unwrap();
        let labels: Vec<_> = dataset.examples().iter().map(|e| e.label).collect();
        assert_eq!(labels, vec![Some(0), Some(1), Some(2), Some(3), None]);
        assert_eq!(dataset.examples()[0].image.dimensions(), (32, 32));
    }

    #[test]
    fn test_corrupt_file_reports_path_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.tfrecord");
        write_fixture(&path, &[1, 2]);
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 10;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let err = read_records(&[path], true).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("broken.tfrecord"));
        assert!(msg.contains("record 1"));
    }
}
