//! Model module for the transfer-learning classifier
//!
//! This module provides:
//! - The EfficientNet-B0 feature extractor (no classification top)
//! - The classifier head with its training-only noise layer
//! - Serde model settings and their conversion to Burn configs
//!
//! ## Freezing
//!
//! Batch norm is frozen for the whole run. The rest of the backbone is either
//! kept out of the autodiff graph (head training) or trained along with the
//! head (fine-tuning), as selected by [`BackbonePolicy`].

pub mod classifier;
pub mod config;
pub mod efficientnet;

// Re-export main types for convenience
pub use classifier::{BackbonePolicy, XrayClassifier, XrayClassifierConfig};
pub use config::ModelConfig;
pub use efficientnet::{EfficientNetB0, EfficientNetB0Config};
