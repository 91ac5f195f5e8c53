//! # Chest X-Ray Transfer Learning
//!
//! Two-phase EfficientNet-B0 transfer learning for 20-class chest X-ray
//! classification, built on the Burn framework.
//!
//! ## Features
//!
//! - **TFRecord input** of serialized `tf.train.Example`s with JPEG images
//! - **Augmentation** on the host: contrast, brightness, random crop and rotation
//! - **Transfer learning**: frozen-backbone head training, then fine-tuning
//! - **TensorBoard** scalar logs written directly as event files
//!
//! ## Modules
//!
//! - `dataset`: record reading, decoding, augmentation, split and batching
//! - `model`: EfficientNet-B0 backbone and the classifier head
//! - `training`: epoch loop, schedules, callbacks and the two-phase run
//! - `config`: TOML run configuration
//! - `utils`: errors, logging, metrics and event files
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use chestxray_transfer::backend::{default_device, TrainingBackend};
//! use chestxray_transfer::config::XrayConfig;
//! use chestxray_transfer::dataset::collect_record_files;
//! use chestxray_transfer::training::run_training;
//!
//! let config = XrayConfig::load(None)?;
//! let files = collect_record_files("data/train-*.tfrecord")?;
//! let outcome = run_training::<TrainingBackend>(&config, &files, default_device())?;
//! ```

pub mod backend;
pub mod config;
pub mod dataset;
pub mod model;
pub mod training;
pub mod utils;

// Re-export commonly used items for convenience
pub use config::XrayConfig;
pub use dataset::{BatchPlan, XrayBatch, XrayBatcher, XrayDataset, XrayItem};
pub use model::{BackbonePolicy, XrayClassifier, XrayClassifierConfig};
pub use training::{run_training, Trainer, TrainingOutcome};
pub use utils::error::{Result, XrayError};
pub use utils::metrics::{ConfusionMatrix, ValidationReport};

/// Chest X-ray classes
pub const NUM_CLASSES: usize = 20;

/// Side length decoded images are resized to
pub const DECODE_SIZE: u32 = 250;

/// Side length of the crops fed to the network
pub const IMAGE_SIZE: usize = 224;

/// Examples per batch
pub const BATCH_SIZE: usize = 32;

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
