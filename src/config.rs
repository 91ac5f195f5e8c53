//! Run configuration
//!
//! One TOML file with `[data]`, `[augmentation]`, `[model]`, `[training]` and
//! `[output]` sections. Every field is optional; missing fields take the
//! defaults of the standard 20-class run.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::dataset::augmentation::AugmentationConfig;
use crate::dataset::loader::DataConfig;
use crate::model::config::ModelConfig;
use crate::training::scheduler::LRScheduler;
use crate::utils::error::{Result, XrayError};

/// Epoch counts and learning rates of the two phases
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainingSettings {
    /// Epochs of head training with the backbone frozen
    pub head_epochs: usize,
    /// Epochs of fine-tuning after unfreezing
    pub fine_tune_epochs: usize,
    /// Per-epoch learning rate of the head phase
    pub head_schedule: LRScheduler,
    /// Constant learning rate of the fine-tuning phase
    pub fine_tune_learning_rate: f64,
    /// Adam epsilon for both phases
    pub adam_epsilon: f64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            head_epochs: 25,
            fine_tune_epochs: 15,
            head_schedule: LRScheduler::default(),
            fine_tune_learning_rate: 4e-8,
            adam_epsilon: 1e-7,
        }
    }
}

/// Where logs and artifacts go
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    /// Parent of the TensorBoard run directories
    pub log_root: PathBuf,
    /// Run directory name prefix
    pub run_prefix: String,
    /// Directory for the model, history and reports
    pub output_dir: PathBuf,
    /// Also save the backbone on its own
    pub save_backbone: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            log_root: PathBuf::from("logs"),
            run_prefix: "owl".to_string(),
            output_dir: PathBuf::from("output"),
            save_backbone: false,
        }
    }
}

/// Complete configuration of a training run
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct XrayConfig {
    pub data: DataConfig,
    pub augmentation: AugmentationConfig,
    pub model: ModelConfig,
    pub training: TrainingSettings,
    pub output: OutputConfig,
}

/// Command-line values that take precedence over the file
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub log_root: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub weights: Option<PathBuf>,
    pub head_epochs: Option<usize>,
    pub fine_tune_epochs: Option<usize>,
    pub batch_size: Option<usize>,
}

/// Read a TOML file into any deserializable config
pub fn load_toml_config<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = fs::read_to_string(path)
        .map_err(|e| XrayError::Config(format!("Failed to read config {}: {e}", path.display())))?;

    toml::from_str(&content)
        .map_err(|e| XrayError::Config(format!("Failed to parse config {}: {e}", path.display())))
}

impl XrayConfig {
    /// Load from `path`, or the defaults when no file is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Self = match path {
            Some(path) => load_toml_config(path)?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Apply command-line overrides
    pub fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(log_root) = overrides.log_root {
            self.output.log_root = log_root;
        }
        if let Some(output_dir) = overrides.output_dir {
            self.output.output_dir = output_dir;
        }
        if let Some(weights) = overrides.weights {
            self.model.pretrained_weights = Some(weights);
        }
        if let Some(epochs) = overrides.head_epochs {
            self.training.head_epochs = epochs;
        }
        if let Some(epochs) = overrides.fine_tune_epochs {
            self.training.fine_tune_epochs = epochs;
        }
        if let Some(batch_size) = overrides.batch_size {
            self.data.batch_size = batch_size;
        }
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.data.num_classes == 0 {
            return Err(XrayError::Config("data.num_classes must be positive".to_string()));
        }
        if self.data.num_classes != self.model.num_classes {
            return Err(XrayError::Config(format!(
                "data.num_classes ({}) and model.num_classes ({}) differ",
                self.data.num_classes, self.model.num_classes
            )));
        }
        if self.data.batch_size == 0 {
            return Err(XrayError::Config("data.batch_size must be positive".to_string()));
        }
        if self.augmentation.crop_size as u32 > self.data.decode_size {
            return Err(XrayError::Config(format!(
                "augmentation.crop_size ({}) exceeds data.decode_size ({})",
                self.augmentation.crop_size, self.data.decode_size
            )));
        }
        Ok(())
    }

    /// Write the effective configuration as TOML
    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = XrayConfig::default();
        assert_eq!(config.data.batch_size, 32);
        assert_eq!(config.data.num_classes, 20);
        assert_eq!(config.data.decode_size, 250);
        assert_eq!(config.augmentation.crop_size, 224);
        assert_eq!(config.training.head_epochs, 25);
        assert_eq!(config.training.fine_tune_epochs, 15);
        assert_eq!(config.training.fine_tune_learning_rate, 4e-8);
        assert_eq!(config.output.run_prefix, "owl");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        fs::write(
            &path,
            "[data]\nbatch_size = 8\n\n[training]\nhead_epochs = 3\n\n[training.head_schedule]\ntype = \"constant\"\nlr = 0.001\n",
        )
        .unwrap();

        let config = XrayConfig::load(Some(&path)).unwrap();
        assert_eq!(config.data.batch_size, 8);
        assert_eq!(config.data.train_fraction, 0.7);
        assert_eq!(config.training.head_epochs, 3);
        assert_eq!(config.training.head_schedule, LRScheduler::constant(0.001));
        assert_eq!(config.training.fine_tune_epochs, 15);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = XrayConfig::default();
        config.data.declared_total = Some(12786);
        config.save(&path).unwrap();

        let loaded = XrayConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_overrides() {
        let mut config = XrayConfig::default();
        config.apply(ConfigOverrides {
            head_epochs: Some(1),
            batch_size: Some(4),
            weights: Some(PathBuf::from("b0.mpk")),
            ..ConfigOverrides::default()
        });
        assert_eq!(config.training.head_epochs, 1);
        assert_eq!(config.data.batch_size, 4);
        assert_eq!(config.model.pretrained_weights, Some(PathBuf::from("b0.mpk")));
        assert_eq!(config.output.log_root, PathBuf::from("logs"));
    }

    #[test]
    fn test_validation_errors() {
        let mut config = XrayConfig::default();
        config.model.num_classes = 5;
        assert!(matches!(config.validate(), Err(XrayError::Config(_))));

        let mut config = XrayConfig::default();
        config.augmentation.crop_size = 300;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unreadable_file() {
        let err = XrayConfig::load(Some(Path::new("/nonexistent/run.toml"))).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/run.toml"));
    }
}
