//! Training module for two-phase transfer learning
//!
//! This module provides:
//! - The epoch loop with Burn's autodiff and Adam
//! - Learning rate schedules
//! - Callbacks for TensorBoard, progress and history
//! - The head-then-fine-tune orchestration
//!
//! ## Phases
//!
//! 1. Train the dense head on top of the frozen EfficientNet-B0 backbone
//! 2. Unfreeze the backbone (except batch norm) and fine-tune everything
//!    with a very small learning rate

pub mod callbacks;
pub mod fine_tune;
pub mod scheduler;
pub mod trainer;

// Re-export main types for convenience
pub use callbacks::{
    CallbackContext, EpochLogs, LrSchedulerCallback, ProgressCallback, TensorBoardCallback,
    TrainingCallback, TrainingHistory,
};
pub use fine_tune::{run_training, TrainingOutcome};
pub use scheduler::LRScheduler;
pub use trainer::{categorical_cross_entropy, Phase, Trainer};
