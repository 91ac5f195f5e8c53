//! Learning Rate Scheduler Module
//!
//! Per-epoch learning rates. The head-training phase decays exponentially
//! from 0.01; fine-tuning holds a constant 4e-8.

use serde::{Deserialize, Serialize};

/// Learning rate schedule evaluated at the start of every epoch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LRScheduler {
    /// Constant learning rate
    Constant { lr: f64 },

    /// `initial_lr * exp(-k * epoch)`
    ExponentialDecay { initial_lr: f64, k: f64 },
}

impl LRScheduler {
    /// Create a constant learning rate scheduler
    pub fn constant(lr: f64) -> Self {
        Self::Constant { lr }
    }

    /// Create an exponential decay scheduler
    pub fn exponential_decay(initial_lr: f64, k: f64) -> Self {
        Self::ExponentialDecay { initial_lr, k }
    }

    /// Learning rate for a phase-local, 0-based epoch
    pub fn get_lr(&self, epoch: usize) -> f64 {
        match self {
            Self::Constant { lr } => *lr,
            Self::ExponentialDecay { initial_lr, k } => initial_lr * (-k * epoch as f64).exp(),
        }
    }

    /// Human-readable description of the scheduler
    pub fn description(&self) -> String {
        match self {
            Self::Constant { lr } => format!("constant {:e}", lr),
            Self::ExponentialDecay { initial_lr, k } => {
                format!("{} * exp(-{} * epoch)", initial_lr, k)
            }
        }
    }
}

impl Default for LRScheduler {
    fn default() -> Self {
        Self::exponential_decay(0.01, 0.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_scheduler() {
        let scheduler = LRScheduler::constant(4e-8);
        assert_eq!(scheduler.get_lr(0), 4e-8);
        assert_eq!(scheduler.get_lr(14), 4e-8);
    }

    #[test]
    fn test_exponential_decay_values() {
        let scheduler = LRScheduler::default();
        assert!((scheduler.get_lr(0) - 0.01).abs() < 1e-15);
        assert!((scheduler.get_lr(1) - 0.006_065_306_597_126_334).abs() < 1e-12);
        assert!((scheduler.get_lr(2) - 0.003_678_794_411_714_423).abs() < 1e-12);
        assert!(scheduler.get_lr(24) < 1e-7);
    }

    #[test]
    fn test_decay_is_monotonic() {
        let scheduler = LRScheduler::default();
        for epoch in 0..25 {
            assert!(scheduler.get_lr(epoch + 1) < scheduler.get_lr(epoch));
        }
    }

    #[test]
    fn test_toml_representation() {
        let scheduler: LRScheduler =
            toml::from_str("type = \"exponential_decay\"\ninitial_lr = 0.02\nk = 0.1").unwrap();
        assert_eq!(scheduler, LRScheduler::exponential_decay(0.02, 0.1));
    }
}
