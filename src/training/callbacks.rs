//! Training callbacks
//!
//! Hooks invoked by the epoch loop:
//! - `LrSchedulerCallback` - sets the learning rate at the start of each epoch
//! - `TensorBoardCallback` - writes epoch scalars to `train/` and `validation/`
//! - `ProgressCallback` - progress bar over training batches plus an epoch summary
//! - `TrainingHistory` - keeps every epoch's logs for `history.json`
//!
//! Both phases share one run directory and one event file per split. Steps
//! are global epochs, so fine-tuning continues at step `head_epochs` instead
//! of restarting at 0 in a fresh event file as a second Keras `fit` would.

use std::path::Path;
use std::time::Instant;

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::training::scheduler::LRScheduler;
use crate::utils::error::{Result, XrayError};
use crate::utils::format_duration;
use crate::utils::tensorboard::EventWriter;

/// State passed to callbacks
#[derive(Clone, Debug)]
pub struct CallbackContext {
    /// Phase name (`head` or `fine_tune`)
    pub phase: String,
    /// Epoch within the phase (0-indexed)
    pub epoch: usize,
    /// Epochs planned for the phase
    pub epochs: usize,
    /// Epoch counted across all phases (0-indexed)
    pub global_epoch: usize,
    /// Learning rate for the current epoch
    pub learning_rate: f64,
    /// Training batches per epoch
    pub train_batches: usize,
    /// Validation batches per epoch
    pub validation_batches: usize,
}

/// Metrics of one finished epoch
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct EpochLogs {
    pub loss: f64,
    pub categorical_accuracy: f64,
    pub val_loss: Option<f64>,
    pub val_categorical_accuracy: Option<f64>,
    pub learning_rate: f64,
    pub duration_secs: f64,
}

/// Trait for training callbacks
///
/// All methods have no-op defaults.
pub trait TrainingCallback {
    /// Called before the first epoch of a phase
    fn on_train_begin(&mut self, _ctx: &CallbackContext) -> Result<()> {
        Ok(())
    }

    /// Called before each epoch; may adjust the context
    fn on_epoch_begin(&mut self, _ctx: &mut CallbackContext) -> Result<()> {
        Ok(())
    }

    /// Called after each training batch with its mean loss
    fn on_batch_end(&mut self, _ctx: &CallbackContext, _batch: usize, _loss: f64) -> Result<()> {
        Ok(())
    }

    /// Called after training and validation of an epoch
    fn on_epoch_end(&mut self, _ctx: &CallbackContext, _logs: &EpochLogs) -> Result<()> {
        Ok(())
    }

    /// Called after the last epoch of a phase
    fn on_train_end(&mut self, _ctx: &CallbackContext) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

/// Sets `ctx.learning_rate` from a schedule
pub struct LrSchedulerCallback {
    scheduler: LRScheduler,
}

impl LrSchedulerCallback {
    pub fn new(scheduler: LRScheduler) -> Self {
        Self { scheduler }
    }
}

impl TrainingCallback for LrSchedulerCallback {
    fn on_epoch_begin(&mut self, ctx: &mut CallbackContext) -> Result<()> {
        ctx.learning_rate = self.scheduler.get_lr(ctx.epoch);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "LrSchedulerCallback"
    }
}

/// Writes epoch scalars in TensorBoard's event format
///
/// The step of every scalar is `CallbackContext::global_epoch`.
pub struct TensorBoardCallback {
    train: EventWriter,
    validation: EventWriter,
}

impl TensorBoardCallback {
    /// Open `train/` and `validation/` writers under `run_dir`
    pub fn new(run_dir: &Path) -> Result<Self> {
        Ok(Self {
            train: EventWriter::create(&run_dir.join("train"))?,
            validation: EventWriter::create(&run_dir.join("validation"))?,
        })
    }
}

impl TrainingCallback for TensorBoardCallback {
    fn on_epoch_end(&mut self, ctx: &CallbackContext, logs: &EpochLogs) -> Result<()> {
        let step = ctx.global_epoch;
        self.train.add_scalar("epoch_loss", logs.loss, step)?;
        self.train
            .add_scalar("epoch_categorical_accuracy", logs.categorical_accuracy, step)?;
        self.train
            .add_scalar("epoch_learning_rate", logs.learning_rate, step)?;
        self.train.flush()?;

        if let (Some(loss), Some(acc)) = (logs.val_loss, logs.val_categorical_accuracy) {
            self.validation.add_scalar("epoch_loss", loss, step)?;
            self.validation
                .add_scalar("epoch_categorical_accuracy", acc, step)?;
            self.validation.flush()?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "TensorBoardCallback"
    }
}

/// Console progress for each epoch
pub struct ProgressCallback {
    bar: Option<ProgressBar>,
    phase_start: Instant,
}

impl ProgressCallback {
    pub fn new() -> Self {
        Self {
            bar: None,
            phase_start: Instant::now(),
        }
    }
}

impl Default for ProgressCallback {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingCallback for ProgressCallback {
    fn on_train_begin(&mut self, ctx: &CallbackContext) -> Result<()> {
        self.phase_start = Instant::now();
        println!();
        println!(
            "{}",
            format!("Phase '{}': {} epochs", ctx.phase, ctx.epochs).green().bold()
        );
        Ok(())
    }

    fn on_epoch_begin(&mut self, ctx: &mut CallbackContext) -> Result<()> {
        println!(
            "{}",
            format!("Epoch {}/{}", ctx.epoch + 1, ctx.epochs).yellow().bold()
        );
        let bar = ProgressBar::new(ctx.train_batches as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("  [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .map_err(|e| XrayError::Training(e.to_string()))?
                .progress_chars("#>-"),
        );
        self.bar = Some(bar);
        Ok(())
    }

    fn on_batch_end(&mut self, _ctx: &CallbackContext, _batch: usize, loss: f64) -> Result<()> {
        if let Some(bar) = &self.bar {
            bar.set_message(format!("loss: {:.4}", loss));
            bar.inc(1);
        }
        Ok(())
    }

    fn on_epoch_end(&mut self, ctx: &CallbackContext, logs: &EpochLogs) -> Result<()> {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
        let validation = match (logs.val_loss, logs.val_categorical_accuracy) {
            (Some(loss), Some(acc)) => format!(" | val_loss: {:.4} | val_acc: {:.2}%", loss, acc * 100.0),
            _ => String::new(),
        };
        info!(
            "[{}] epoch {}/{} in {} | loss: {:.4} | acc: {:.2}%{} | lr: {:e}",
            ctx.phase,
            ctx.epoch + 1,
            ctx.epochs,
            format_duration(logs.duration_secs),
            logs.loss,
            logs.categorical_accuracy * 100.0,
            validation,
            logs.learning_rate
        );
        Ok(())
    }

    fn on_train_end(&mut self, ctx: &CallbackContext) -> Result<()> {
        info!(
            "Phase '{}' finished in {}",
            ctx.phase,
            format_duration(self.phase_start.elapsed().as_secs_f64())
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ProgressCallback"
    }
}

/// One row of the training history
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub phase: String,
    pub epoch: usize,
    pub global_epoch: usize,
    #[serde(flatten)]
    pub logs: EpochLogs,
}

/// Records every epoch across phases
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<HistoryEntry>,
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Best validation accuracy seen so far, if any epoch validated
    pub fn best_val_accuracy(&self) -> Option<f64> {
        self.epochs
            .iter()
            .filter_map(|e| e.logs.val_categorical_accuracy)
            .fold(None, |best, acc| Some(best.map_or(acc, |b: f64| b.max(acc))))
    }

    /// Write the history as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

impl TrainingCallback for TrainingHistory {
    fn on_epoch_end(&mut self, ctx: &CallbackContext, logs: &EpochLogs) -> Result<()> {
        self.epochs.push(HistoryEntry {
            phase: ctx.phase.clone(),
            epoch: ctx.epoch,
            global_epoch: ctx.global_epoch,
            logs: logs.clone(),
        });
        Ok(())
    }

    fn name(&self) -> &'static str {
        "TrainingHistory"
    }
}
