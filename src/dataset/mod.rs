//! Dataset module for chest X-ray record handling
//!
//! This module provides functionality for:
//! - Reading TFRecord files holding serialized `tf.train.Example`s
//! - Decoding JPEG images into an in-memory cache
//! - Per-epoch augmentation and prefetched batching
//! - The prefix/suffix train/validation split
//!
//! ## Pipeline
//!
//! ```text
//! glob -> TFRecord frames -> Example -> JPEG decode -> resize 250x250 -> cache
//!      -> contrast x2 -> brightness +0.4 -> random crop 224 -> batch -> prefetch
//! ```

pub mod augmentation;
pub mod burn_dataset;
pub mod example;
pub mod loader;
pub mod split;
pub mod tfrecord;

// Re-export main types for convenience
pub use augmentation::{AugmentationConfig, Augmenter, FloatImage};
pub use burn_dataset::{EpochLoader, XrayBatch, XrayBatcher, XrayDataset, XrayItem};
pub use example::{parse_example, CachedExample};
pub use loader::{collect_record_files, load_examples, DataConfig};
pub use split::{BatchPlan, SplitConfig};
pub use tfrecord::{TfRecordReader, TfRecordWriter};
