//! Train/validation split over consecutive batches
//!
//! The record stream is cut into fixed-size batches in file order. The first
//! `floor(total * train_fraction / batch_size)` batches train the model and
//! every remaining batch (including a trailing partial one) validates it.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::utils::error::{Result, XrayError};

/// Split parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SplitConfig {
    /// Fraction of examples, rounded down to whole batches, used for training
    pub train_fraction: f64,
    /// Examples per batch
    pub batch_size: usize,
    /// Overrides the counted total when computing the number of train batches
    pub declared_total: Option<usize>,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            train_fraction: 0.7,
            batch_size: crate::BATCH_SIZE,
            declared_total: None,
        }
    }
}

/// Batch layout of the cached dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    /// Number of examples actually loaded
    pub total: usize,
    pub batch_size: usize,
    /// Batches taken for training
    pub train_batches: usize,
}

impl BatchPlan {
    /// Compute the plan from the number of examples actually loaded
    pub fn new(total: usize, config: &SplitConfig) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(XrayError::Config("batch_size must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&config.train_fraction) {
            return Err(XrayError::Config(format!(
                "train_fraction must be within [0, 1], got {}",
                config.train_fraction
            )));
        }

        let basis = match config.declared_total {
            Some(declared) => {
                if declared != total {
                    warn!(
                        "Declared dataset size {} differs from the {} examples loaded",
                        declared, total
                    );
                }
                declared
            }
            None => total,
        };

        let requested = (basis as f64 * config.train_fraction / config.batch_size as f64).floor() as usize;
        let total_batches = total.div_ceil(config.batch_size);
        let train_batches = requested.min(total_batches);

        Ok(Self {
            total,
            batch_size: config.batch_size,
            train_batches,
        })
    }

    /// Number of batches over the whole dataset, counting a partial last batch
    pub fn total_batches(&self) -> usize {
        self.total.div_ceil(self.batch_size)
    }

    pub fn validation_batches(&self) -> usize {
        self.total_batches() - self.train_batches
    }

    /// Index range of the `batch`-th batch
    pub fn batch_range(&self, batch: usize) -> Range<usize> {
        let start = (batch * self.batch_size).min(self.total);
        let end = (start + self.batch_size).min(self.total);
        start..end
    }

    /// Example ranges of the training batches
    pub fn train_ranges(&self) -> Vec<Range<usize>> {
        (0..self.train_batches).map(|b| self.batch_range(b)).collect()
    }

    /// Example ranges of the validation batches
    pub fn validation_ranges(&self) -> Vec<Range<usize>> {
        (self.train_batches..self.total_batches())
            .map(|b| self.batch_range(b))
            .collect()
    }

    pub fn train_examples(&self) -> usize {
        (self.train_batches * self.batch_size).min(self.total)
    }

    pub fn validation_examples(&self) -> usize {
        self.total - self.train_examples()
    }
}
