//! Two-phase transfer learning
//!
//! 1. `head`: backbone frozen, only the dense head trains, learning rate
//!    decays exponentially from 0.01.
//! 2. `fine_tune`: backbone unfrozen (batch norm stays frozen), fresh Adam,
//!    constant learning rate 4e-8.
//!
//! Both phases log into the same TensorBoard run directory, with the step
//! continuing from one phase into the next.

use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    record::CompactRecorder,
    tensor::backend::AutodiffBackend,
};
use colored::Colorize;
use tracing::{info, warn};

use crate::config::{TrainingSettings, XrayConfig};
use crate::dataset::augmentation::Augmenter;
use crate::dataset::loader::load_examples;
use crate::dataset::split::BatchPlan;
use crate::model::{BackbonePolicy, XrayClassifier};
use crate::training::callbacks::{
    LrSchedulerCallback, ProgressCallback, TensorBoardCallback, TrainingHistory,
};
use crate::training::trainer::{Phase, Trainer};
use crate::utils::error::{Result, XrayError};
use crate::utils::metrics::ValidationReport;
use crate::utils::tensorboard::run_directory;

/// File stem of the saved classifier record
pub const MODEL_FILE: &str = "xray_classifier";
/// File stem of the optional backbone-only record
pub const BACKBONE_FILE: &str = "backbone";

/// Phase 1: frozen backbone, scheduled learning rate
pub fn head_phase(settings: &TrainingSettings) -> Phase {
    Phase {
        name: "head".to_string(),
        epochs: settings.head_epochs,
        policy: BackbonePolicy::Frozen,
        learning_rate: settings.head_schedule.get_lr(0),
        adam_epsilon: settings.adam_epsilon,
    }
}

/// Phase 2: every layer except batch norm trains
pub fn fine_tune_phase(settings: &TrainingSettings) -> Phase {
    Phase {
        name: "fine_tune".to_string(),
        epochs: settings.fine_tune_epochs,
        policy: BackbonePolicy::FineTune,
        learning_rate: settings.fine_tune_learning_rate,
        adam_epsilon: settings.adam_epsilon,
    }
}

/// What a finished run produced
#[derive(Debug)]
pub struct TrainingOutcome {
    pub run_dir: PathBuf,
    pub model_path: PathBuf,
    pub history: TrainingHistory,
    pub report: Option<ValidationReport>,
    /// Examples per class over the whole dataset
    pub class_counts: Vec<usize>,
}

/// Build the classifier, loading pretrained backbone weights when configured
pub fn build_model<B: AutodiffBackend>(config: &XrayConfig, device: &B::Device) -> Result<XrayClassifier<B>> {
    let model = config.model.classifier_config().init::<B>(device);
    match &config.model.pretrained_weights {
        Some(path) => {
            info!("Loading backbone weights from {:?}", path);
            Ok(XrayClassifier {
                backbone: model.backbone.load_weights(path, device)?,
                ..model
            })
        }
        None => {
            warn!("No pretrained backbone weights given; the backbone starts from random initialization");
            Ok(model)
        }
    }
}

/// Load the records, run both phases and save the artifacts
pub fn run_training<B: AutodiffBackend>(
    config: &XrayConfig,
    files: &[PathBuf],
    device: B::Device,
) -> Result<TrainingOutcome> {
    let dataset = load_examples(files, &config.data)?;
    let total = dataset.examples().len();
    let class_counts = dataset.class_counts();
    let unlabeled = total - class_counts.iter().sum::<usize>();
    info!("Class counts: {:?} ({} unlabeled)", class_counts, unlabeled);
    let plan = BatchPlan::new(total, &config.data.split())?;
    if plan.train_batches == 0 {
        return Err(XrayError::Dataset(format!(
            "{} examples are not enough for one training batch of {}",
            total, plan.batch_size
        )));
    }
    info!(
        "Split: {} training batches ({} examples), {} validation batches ({} examples)",
        plan.train_batches,
        plan.train_examples(),
        plan.validation_batches(),
        plan.validation_examples()
    );

    let augmenter = Augmenter::new(config.augmentation.clone());
    let model = build_model::<B>(config, &device)?;

    let run_dir = run_directory(&config.output.log_root, &config.output.run_prefix);
    info!("TensorBoard logs: {:?}", run_dir);
    let mut tensorboard = TensorBoardCallback::new(&run_dir)?;
    let mut progress = ProgressCallback::new();
    let mut history = TrainingHistory::new();

    let mut trainer = Trainer::new(model, &dataset, &augmenter, plan, config.data.clone(), device);

    let head = head_phase(&config.training);
    let mut scheduler = LrSchedulerCallback::new(config.training.head_schedule.clone());
    trainer.fit_phase(
        &head,
        &mut [&mut scheduler, &mut tensorboard, &mut progress, &mut history],
    )?;

    info!("Unfreezing the backbone (batch norm stays frozen)");
    let fine_tune = fine_tune_phase(&config.training);
    trainer.fit_phase(&fine_tune, &mut [&mut tensorboard, &mut progress, &mut history])?;

    let report = trainer.validation_report()?;
    let model = trainer.into_model();

    let output_dir = &config.output.output_dir;
    std::fs::create_dir_all(output_dir)?;
    let model_path = save_model(&model, output_dir, config.output.save_backbone)?;
    history.save(&output_dir.join("history.json"))?;
    config.save(&output_dir.join("config.toml"))?;
    if let Some(report) = &report {
        std::fs::write(
            output_dir.join("validation_report.json"),
            serde_json::to_string_pretty(report)?,
        )?;
    }

    println!();
    println!("{}", "Training Complete!".green().bold());
    if let Some(best) = history.best_val_accuracy() {
        println!("  Best validation accuracy: {:.2}%", best * 100.0);
    }
    if let Some(report) = &report {
        println!("  Final validation accuracy: {:.2}%", report.accuracy * 100.0);
        println!("  Macro F1: {:.4}", report.macro_f1);
        println!("{}", report.confusion_matrix);
    }
    println!("  Model saved to: {:?}", model_path);

    Ok(TrainingOutcome {
        run_dir,
        model_path,
        history,
        report,
        class_counts,
    })
}

/// Save the classifier (and optionally its backbone) with `CompactRecorder`
pub fn save_model<B: AutodiffBackend>(
    model: &XrayClassifier<B>,
    output_dir: &Path,
    save_backbone: bool,
) -> Result<PathBuf> {
    let recorder = CompactRecorder::new();
    let model_path = output_dir.join(MODEL_FILE);
    model
        .clone()
        .save_file(&model_path, &recorder)
        .map_err(|e| XrayError::Model(format!("Failed to save model: {:?}", e)))?;

    if save_backbone {
        model
            .backbone
            .clone()
            .save_file(output_dir.join(BACKBONE_FILE), &recorder)
            .map_err(|e| XrayError::Model(format!("Failed to save backbone: {:?}", e)))?;
    }
    Ok(model_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::example::{encode_example, encode_jpeg};
    use crate::dataset::tfrecord::TfRecordWriter;
    use crate::training::scheduler::LRScheduler;
    use crate::utils::tensorboard::{event, Event};
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use image::{Rgb, RgbImage};
    use prost::Message;
    use std::fs::File;
    use std::io::BufReader;

    type TestAutodiffBackend = Autodiff<NdArray>;

    #[test]
    fn test_phase_settings() {
        let settings = TrainingSettings::default();
        let head = head_phase(&settings);
        assert_eq!(head.epochs, 25);
        assert_eq!(head.policy, BackbonePolicy::Frozen);
        assert_eq!(head.learning_rate, 0.01);

        let fine = fine_tune_phase(&settings);
        assert_eq!(fine.epochs, 15);
        assert_eq!(fine.policy, BackbonePolicy::FineTune);
        assert_eq!(fine.learning_rate, 4e-8);
        assert_eq!(fine.adam_epsilon, 1e-7);
    }

    #[test]
    fn test_missing_weights_file_is_an_error() {
        let mut config = XrayConfig::default();
        config.model.pretrained_weights = Some(PathBuf::from("/nonexistent/b0"));
        let result = build_model::<TestAutodiffBackend>(&config, &Default::default());
        assert!(matches!(result, Err(XrayError::PathNotFound(_))));
    }

    #[test]
    fn test_end_to_end_run() {
        let dir = tempfile::tempdir().unwrap();
        let record_path = dir.path().join("train.tfrecord");
        let jpeg = encode_jpeg(&RgbImage::from_pixel(48, 48, Rgb([120, 120, 120]))).unwrap();
        let mut writer = TfRecordWriter::new(File::create(&record_path).unwrap());
        for label in [0i64, 1, 2, 0, 1, 2] {
            writer.write_record(&encode_example(&jpeg, label)).unwrap();
        }
        writer.flush().unwrap();
        drop(writer);

        let mut config = XrayConfig::default();
        config.data.num_classes = 3;
        config.model.num_classes = 3;
        config.data.decode_size = 40;
        config.data.batch_size = 2;
        config.augmentation.crop_size = 32;
        config.training.head_epochs = 2;
        config.training.fine_tune_epochs = 1;
        config.training.head_schedule = LRScheduler::exponential_decay(0.01, 0.5);
        config.output.log_root = dir.path().join("logs");
        config.output.output_dir = dir.path().join("output");
        config.output.save_backbone = true;

        let outcome = run_training::<TestAutodiffBackend>(&config, &[record_path], Default::default()).unwrap();

        assert_eq!(outcome.history.epochs.len(), 3);
        assert_eq!(outcome.history.epochs[2].phase, "fine_tune");
        assert_eq!(outcome.history.epochs[2].epoch, 0);
        assert_eq!(outcome.history.epochs[2].global_epoch, 2);
        assert!((outcome.history.epochs[1].logs.learning_rate - 0.01 * (-0.5f64).exp()).abs() < 1e-12);
        assert_eq!(outcome.history.epochs[2].logs.learning_rate, 4e-8);

        let output = dir.path().join("output");
        assert!(output.join("history.json").exists());
        assert!(output.join("config.toml").exists());
        assert!(output.join("validation_report.json").exists());
        assert!(output.join(format!("{}.mpk", BACKBONE_FILE)).exists());
        assert!(outcome.report.is_some());
        assert_eq!(outcome.class_counts, vec![2, 2, 2]);

        let run_name = outcome.run_dir.file_name().unwrap().to_string_lossy().to_string();
        assert!(run_name.starts_with("owl-"));

        let train_dir = outcome.run_dir.join("train");
        let file = std::fs::read_dir(&train_dir).unwrap().next().unwrap().unwrap().path();
        let steps: Vec<i64> = crate::dataset::tfrecord::TfRecordReader::new(BufReader::new(File::open(file).unwrap()))
            .filter_map(|r| {
                let event = Event::decode(r.unwrap().as_slice()).unwrap();
                match event.what {
                    Some(event::What::Summary(_)) => Some(event.step),
                    _ => None,
                }
            })
            .collect();
        assert_eq!(steps, vec![0, 0, 0, 1, 1, 1, 2, 2, 2]);
    }
}
