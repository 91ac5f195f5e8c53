//! Model Configuration Module
//!
//! Serde-facing model settings read from the TOML config, converted into
//! Burn configs when the model is built.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::classifier::XrayClassifierConfig;
use crate::model::efficientnet::EfficientNetB0Config;

/// Configuration for the classifier architecture
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    /// Number of output classes
    pub num_classes: usize,

    /// Standard deviation of the Gaussian noise input layer
    pub noise_std: f64,

    /// Drop-connect rate of the last MBConv block
    pub drop_connect_rate: f64,

    /// Batch-norm epsilon used throughout the backbone
    pub bn_epsilon: f64,

    /// Burn record with pretrained backbone weights
    pub pretrained_weights: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_classes: crate::NUM_CLASSES,
            noise_std: 0.1,
            drop_connect_rate: 0.2,
            bn_epsilon: 1e-3,
            pretrained_weights: None,
        }
    }
}

impl ModelConfig {
    /// Burn config for the full classifier
    pub fn classifier_config(&self) -> XrayClassifierConfig {
        let backbone = EfficientNetB0Config::new()
            .with_drop_connect_rate(self.drop_connect_rate)
            .with_bn_epsilon(self.bn_epsilon);

        XrayClassifierConfig::new(backbone)
            .with_num_classes(self.num_classes)
            .with_noise_std(self.noise_std)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ModelConfig::default();
        assert_eq!(config.num_classes, 20);
        assert_eq!(config.noise_std, 0.1);
        assert!(config.pretrained_weights.is_none());
    }

    #[test]
    fn test_classifier_config_carries_settings() {
        let config = ModelConfig {
            num_classes: 4,
            drop_connect_rate: 0.0,
            ..ModelConfig::default()
        };
        let burn_config = config.classifier_config();
        assert_eq!(burn_config.num_classes, 4);
        assert_eq!(burn_config.backbone.drop_connect_rate, 0.0);
        assert_eq!(burn_config.backbone.bn_epsilon, 1e-3);
    }

    #[test]
    fn test_partial_toml() {
        let config: ModelConfig = toml::from_str("noise_std = 0.05").unwrap();
        assert_eq!(config.noise_std, 0.05);
        assert_eq!(config.num_classes, 20);
    }
}
