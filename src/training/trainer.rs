//! Epoch loop for the transfer-learning phases
//!
//! The trainer owns the classifier and runs phases against one dataset and
//! one batch plan:
//! - Forward/backward passes with automatic differentiation
//! - Categorical cross-entropy on one-hot targets
//! - A fresh Adam optimizer per phase
//! - A validation pass after every epoch
//! - Callbacks for scheduling, TensorBoard, progress and history

use std::ops::Range;
use std::time::Instant;

use burn::{
    data::dataloader::batcher::Batcher,
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{
        activation::log_softmax,
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use tracing::{debug, info};

use crate::dataset::augmentation::Augmenter;
use crate::dataset::burn_dataset::{EpochLoader, XrayBatch, XrayBatcher, XrayDataset};
use crate::dataset::loader::DataConfig;
use crate::dataset::split::BatchPlan;
use crate::model::{BackbonePolicy, EfficientNetB0, XrayClassifier};
use crate::training::callbacks::{CallbackContext, EpochLogs, TrainingCallback};
use crate::utils::error::{Result, XrayError};
use crate::utils::metrics::{ConfusionMatrix, EpochMeter, ValidationReport};

/// One training phase
#[derive(Debug, Clone)]
pub struct Phase {
    /// Name used in logs and history
    pub name: String,
    pub epochs: usize,
    pub policy: BackbonePolicy,
    /// Learning rate before any scheduler callback adjusts it
    pub learning_rate: f64,
    /// Adam epsilon
    pub adam_epsilon: f64,
}

/// Mean categorical cross-entropy, `-sum(y * log_softmax(logits))` averaged over the batch
///
/// All-zero target rows contribute zero loss.
pub fn categorical_cross_entropy<B: Backend>(logits: Tensor<B, 2>, one_hot: Tensor<B, 2>) -> Tensor<B, 1> {
    (one_hot * log_softmax(logits, 1)).sum_dim(1).mean().neg()
}

/// Arg-max class of each row
pub fn predictions<B: Backend>(logits: Tensor<B, 2>) -> Tensor<B, 1, Int> {
    logits.argmax(1).squeeze::<1>(1)
}

/// Number of rows whose arg-max matches `targets`
pub fn count_correct<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let correct: i64 = predictions(logits)
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem();
    correct as usize
}

/// Trainer for the chest X-ray classifier
pub struct Trainer<'a, B: AutodiffBackend> {
    /// Model being trained
    pub model: XrayClassifier<B>,
    dataset: &'a XrayDataset,
    augmenter: &'a Augmenter,
    plan: BatchPlan,
    data: DataConfig,
    batcher: XrayBatcher,
    device: B::Device,
    /// Epochs completed across all phases
    global_epoch: usize,
}

impl<'a, B: AutodiffBackend> Trainer<'a, B> {
    pub fn new(
        model: XrayClassifier<B>,
        dataset: &'a XrayDataset,
        augmenter: &'a Augmenter,
        plan: BatchPlan,
        data: DataConfig,
        device: B::Device,
    ) -> Self {
        Self {
            model,
            batcher: XrayBatcher::new(dataset.num_classes()),
            dataset,
            augmenter,
            plan,
            data,
            device,
            global_epoch: 0,
        }
    }

    pub fn plan(&self) -> &BatchPlan {
        &self.plan
    }

    pub fn global_epoch(&self) -> usize {
        self.global_epoch
    }

    fn loader(&self) -> EpochLoader<'a> {
        EpochLoader::new(self.dataset, self.augmenter, self.data.seed, self.data.prefetch)
    }

    /// Run every epoch of `phase`, validating after each one
    pub fn fit_phase(&mut self, phase: &Phase, callbacks: &mut [&mut dyn TrainingCallback]) -> Result<()> {
        info!(
            "Starting phase '{}': {} epochs, backbone {}, {} train / {} validation batches",
            phase.name,
            phase.epochs,
            phase.policy,
            self.plan.train_batches,
            self.plan.validation_batches()
        );

        let mut optimizer = AdamConfig::new()
            .with_beta_1(0.9)
            .with_beta_2(0.999)
            .with_epsilon(phase.adam_epsilon as f32)
            .init::<B, XrayClassifier<B>>();

        let mut ctx = CallbackContext {
            phase: phase.name.clone(),
            epoch: 0,
            epochs: phase.epochs,
            global_epoch: self.global_epoch,
            learning_rate: phase.learning_rate,
            train_batches: self.plan.train_batches,
            validation_batches: self.plan.validation_batches(),
        };

        for cb in callbacks.iter_mut() {
            cb.on_train_begin(&ctx)?;
        }

        let frozen = match phase.policy {
            BackbonePolicy::Frozen => Some(self.model.backbone.valid()),
            BackbonePolicy::FineTune => None,
        };

        for epoch in 0..phase.epochs {
            let start = Instant::now();
            ctx.epoch = epoch;
            ctx.global_epoch = self.global_epoch;
            for cb in callbacks.iter_mut() {
                cb.on_epoch_begin(&mut ctx)?;
            }

            let train = self.train_epoch(frozen.as_ref(), &mut optimizer, &ctx, callbacks)?;
            let validation = if self.plan.validation_batches() > 0 {
                Some(self.evaluate(&self.plan.validation_ranges(), self.global_epoch, None)?)
            } else {
                None
            };

            let logs = EpochLogs {
                loss: train.loss(),
                categorical_accuracy: train.accuracy(),
                val_loss: validation.as_ref().map(EpochMeter::loss),
                val_categorical_accuracy: validation.as_ref().map(EpochMeter::accuracy),
                learning_rate: ctx.learning_rate,
                duration_secs: start.elapsed().as_secs_f64(),
            };
            for cb in callbacks.iter_mut() {
                cb.on_epoch_end(&ctx, &logs)?;
            }
            self.global_epoch += 1;
        }

        for cb in callbacks.iter_mut() {
            cb.on_train_end(&ctx)?;
        }
        Ok(())
    }

    /// One pass over the training batches, through `frozen` when the backbone is frozen
    fn train_epoch<O>(
        &mut self,
        frozen: Option<&EfficientNetB0<B::InnerBackend>>,
        optimizer: &mut O,
        ctx: &CallbackContext,
        callbacks: &mut [&mut dyn TrainingCallback],
    ) -> Result<EpochMeter>
    where
        O: Optimizer<XrayClassifier<B>, B>,
    {
        let loader = self.loader();
        let batches = loader.batch_indices(&self.plan.train_ranges(), self.global_epoch, self.data.shuffle);
        let mut meter = EpochMeter::new();
        let num_batches = batches.len();
        let model = &mut self.model;
        let batcher = &self.batcher;
        let device = &self.device;

        loader.for_each_batch(&batches, self.global_epoch, true, |batch_idx, items| {
            let batch_size = items.len();
            let batch: XrayBatch<B> = batcher.batch(items, device);

            let logits = match frozen {
                Some(backbone) => model.forward_frozen(backbone, batch.images.inner(), true),
                None => model.forward(batch.images, true),
            };
            let loss = categorical_cross_entropy(logits.clone(), batch.one_hot);
            let loss_value: f64 = loss.clone().into_scalar().elem();
            let correct = count_correct(logits, batch.targets);
            meter.add_batch(loss_value, correct, batch_size);

            let grads = GradientsParams::from_grads(loss.backward(), &*model);
            *model = optimizer.step(ctx.learning_rate, model.clone(), grads);

            if (batch_idx + 1) % 50 == 0 || batch_idx + 1 == num_batches {
                debug!(
                    "  Batch {}/{}: loss = {:.4}, acc = {:.2}%",
                    batch_idx + 1,
                    num_batches,
                    loss_value,
                    meter.accuracy() * 100.0
                );
            }
            for cb in callbacks.iter_mut() {
                cb.on_batch_end(ctx, batch_idx, loss_value)?;
            }
            Ok(())
        })?;

        Ok(meter)
    }

    /// Inference pass over `ranges` with augmentation in validation mode
    ///
    /// Loss and accuracy cover every example. `confusion` only receives
    /// examples with an in-range label.
    pub fn evaluate(
        &self,
        ranges: &[Range<usize>],
        epoch: usize,
        mut confusion: Option<&mut ConfusionMatrix>,
    ) -> Result<EpochMeter> {
        let model = self.model.valid();
        let loader = self.loader();
        let batches = loader.batch_indices(ranges, epoch, false);
        let mut meter = EpochMeter::new();

        loader.for_each_batch(&batches, epoch, false, |_, items| {
            let batch_size = items.len();
            let classes: Vec<Option<usize>> = items.iter().map(|item| item.class).collect();
            let batch: XrayBatch<B::InnerBackend> = self.batcher.batch(items, &self.device);

            let logits = model.forward(batch.images, false);
            let loss: f64 = categorical_cross_entropy(logits.clone(), batch.one_hot)
                .into_scalar()
                .elem();
            let predicted = predictions(logits);

            if let Some(cm) = confusion.as_deref_mut() {
                let predicted: Vec<usize> = predicted
                    .clone()
                    .into_data()
                    .convert::<i64>()
                    .to_vec::<i64>()
                    .map_err(|e| XrayError::Training(format!("{:?}", e)))?
                    .into_iter()
                    .map(|p| p as usize)
                    .collect();
                let (actual, predicted): (Vec<usize>, Vec<usize>) = classes
                    .iter()
                    .zip(predicted)
                    .filter_map(|(class, p)| class.map(|c| (c, p)))
                    .unzip();
                cm.add_batch(&actual, &predicted);
            }

            let correct: i64 = predicted.equal(batch.targets).int().sum().into_scalar().elem();
            meter.add_batch(loss, correct as usize, batch_size);
            Ok(())
        })?;

        Ok(meter)
    }

    /// Final validation pass with a per-class breakdown
    pub fn validation_report(&self) -> Result<Option<ValidationReport>> {
        if self.plan.validation_batches() == 0 {
            return Ok(None);
        }
        let mut cm = ConfusionMatrix::new(self.dataset.num_classes());
        let meter = self.evaluate(&self.plan.validation_ranges(), self.global_epoch, Some(&mut cm))?;
        info!(
            "Validation: loss = {:.4}, accuracy = {:.2}% over {} examples",
            meter.loss(),
            meter.accuracy() * 100.0,
            meter.count()
        );
        Ok(Some(ValidationReport::new(meter.loss(), cm)))
    }

    pub fn into_model(self) -> XrayClassifier<B> {
        self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::augmentation::AugmentationConfig;
    use crate::dataset::example::CachedExample;
    use crate::dataset::split::SplitConfig;
    use crate::model::{EfficientNetB0Config, XrayClassifierConfig};
    use crate::training::callbacks::TrainingHistory;
    use burn::backend::Autodiff;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;
    use image::{Rgb, RgbImage};

    type TestBackend = NdArray;
    type TestAutodiffBackend = Autodiff<NdArray>;

    fn dataset(n: usize, num_classes: usize) -> XrayDataset {
        let items = (0..n)
            .map(|i| CachedExample {
                image: RgbImage::from_pixel(40, 40, Rgb([(i * 20) as u8, 50, 50])),
                label: Some(i % num_classes),
            })
            .collect();
        XrayDataset::new(items, num_classes)
    }

    fn augmenter() -> Augmenter {
        Augmenter::new(AugmentationConfig {
            crop_size: 32,
            ..AugmentationConfig::default()
        })
    }

    fn data_config(batch_size: usize) -> DataConfig {
        DataConfig {
            num_classes: 3,
            batch_size,
            prefetch: 1,
            ..DataConfig::default()
        }
    }

    fn phase(policy: BackbonePolicy, epochs: usize) -> Phase {
        Phase {
            name: "test".to_string(),
            epochs,
            policy,
            learning_rate: 0.01,
            adam_epsilon: 1e-7,
        }
    }

    #[test]
    fn test_cross_entropy_matches_manual_value() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_floats(
            TensorData::new(vec![0.0f32, 0.0, 2.0, 0.0], [2, 2]),
            &device,
        );
        let targets = Tensor::<TestBackend, 2>::from_floats(
            TensorData::new(vec![1.0f32, 0.0, 1.0, 0.0], [2, 2]),
            &device,
        );
        let loss: f64 = categorical_cross_entropy(logits, targets).into_scalar().elem();

        let first = 2.0f64.ln();
        let second = (1.0 + (-2.0f64).exp()).ln();
        assert!((loss - (first + second) / 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_zero_target_rows_add_no_loss() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_floats(
            TensorData::new(vec![0.0f32, 0.0, 5.0, -5.0], [2, 2]),
            &device,
        );
        let targets = Tensor::<TestBackend, 2>::from_floats(
            TensorData::new(vec![1.0f32, 0.0, 0.0, 0.0], [2, 2]),
            &device,
        );
        let loss: f64 = categorical_cross_entropy(logits, targets).into_scalar().elem();
        assert!((loss - 2.0f64.ln() / 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_count_correct() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_floats(
            TensorData::new(vec![0.9f32, 0.1, 0.2, 0.8, 0.7, 0.3], [3, 2]),
            &device,
        );
        let targets = Tensor::<TestBackend, 1, Int>::from_data(TensorData::new(vec![0i64, 1, 1], [3]), &device);
        assert_eq!(count_correct(logits, targets), 2);
    }

    #[test]
    fn test_frozen_phase_leaves_backbone_untouched() {
        let device = Default::default();
        let ds = dataset(8, 3);
        let aug = augmenter();
        let plan = BatchPlan::new(
            ds.examples().len(),
            &SplitConfig {
                train_fraction: 0.5,
                batch_size: 2,
                declared_total: None,
            },
        )
        .unwrap();
        assert_eq!(plan.train_batches, 2);

        let model = XrayClassifierConfig::new(EfficientNetB0Config::new())
            .with_num_classes(3)
            .init::<TestAutodiffBackend>(&device);
        let stem_before: Vec<f32> = model.backbone.stem.conv.weight.val().into_data().to_vec().unwrap();
        let head_before: Vec<f32> = model.head.weight.val().into_data().to_vec().unwrap();

        let mut trainer = Trainer::new(model, &ds, &aug, plan, data_config(2), device);
        let mut history = TrainingHistory::new();
        trainer
            .fit_phase(&phase(BackbonePolicy::Frozen, 2), &mut [&mut history])
            .unwrap();

        assert_eq!(trainer.global_epoch(), 2);
        assert_eq!(history.epochs.len(), 2);
        assert_eq!(history.epochs[1].global_epoch, 1);
        assert!(history.epochs[0].logs.val_loss.is_some());

        let stem_after: Vec<f32> = trainer.model.backbone.stem.conv.weight.val().into_data().to_vec().unwrap();
        let head_after: Vec<f32> = trainer.model.head.weight.val().into_data().to_vec().unwrap();
        assert_eq!(stem_before, stem_after);
        assert_ne!(head_before, head_after);
    }

    #[test]
    fn test_fine_tune_updates_convs_but_not_batch_norm() {
        let device = Default::default();
        let ds = dataset(4, 3);
        let aug = augmenter();
        let plan = BatchPlan::new(
            4,
            &SplitConfig {
                train_fraction: 1.0,
                batch_size: 2,
                declared_total: None,
            },
        )
        .unwrap();

        let model = XrayClassifierConfig::new(EfficientNetB0Config::new())
            .with_num_classes(3)
            .init::<TestAutodiffBackend>(&device);
        let conv_before: Vec<f32> = model.backbone.top.conv.weight.val().into_data().to_vec().unwrap();
        let gamma_before: Vec<f32> = model.backbone.top.bn.gamma.val().into_data().to_vec().unwrap();

        let mut trainer = Trainer::new(model, &ds, &aug, plan, data_config(2), device);
        let mut fine_tune = phase(BackbonePolicy::FineTune, 1);
        fine_tune.learning_rate = 1e-3;
        trainer.fit_phase(&fine_tune, &mut []).unwrap();

        let conv_after: Vec<f32> = trainer.model.backbone.top.conv.weight.val().into_data().to_vec().unwrap();
        let gamma_after: Vec<f32> = trainer.model.backbone.top.bn.gamma.val().into_data().to_vec().unwrap();
        assert_ne!(conv_before, conv_after);
        assert_eq!(gamma_before, gamma_after);
        assert!(trainer.validation_report().unwrap().is_none());
    }

    #[test]
    fn test_validation_report_covers_validation_suffix() {
        let device = Default::default();
        let ds = dataset(7, 3);
        let aug = augmenter();
        let plan = BatchPlan::new(
            7,
            &SplitConfig {
                train_fraction: 0.5,
                batch_size: 2,
                declared_total: None,
            },
        )
        .unwrap();
        assert_eq!(plan.validation_examples(), 5);

        let model = XrayClassifierConfig::new(EfficientNetB0Config::new())
            .with_num_classes(3)
            .init::<TestAutodiffBackend>(&device);
        let trainer = Trainer::new(model, &ds, &aug, plan, data_config(2), device);
        let report = trainer.validation_report().unwrap().unwrap();
        assert_eq!(report.confusion_matrix.total(), 5);
        assert!(report.loss > 0.0);
    }

    #[test]
    fn test_unlabeled_examples_stay_out_of_confusion_matrix() {
        let device = Default::default();
        let items = (0..7)
            .map(|i| CachedExample {
                image: RgbImage::from_pixel(40, 40, Rgb([(i * 20) as u8, 50, 50])),
                label: if i < 4 { Some(1) } else { None },
            })
            .collect();
        let ds = XrayDataset::new(items, 3);
        let aug = augmenter();
        let plan = BatchPlan::new(
            7,
            &SplitConfig {
                train_fraction: 0.5,
                batch_size: 2,
                declared_total: None,
            },
        )
        .unwrap();

        let model = XrayClassifierConfig::new(EfficientNetB0Config::new())
            .with_num_classes(3)
            .init::<TestAutodiffBackend>(&device);
        let trainer = Trainer::new(model, &ds, &aug, plan, data_config(2), device);

        let mut cm = ConfusionMatrix::new(3);
        let meter = trainer
            .evaluate(&trainer.plan().validation_ranges(), 0, Some(&mut cm))
            .unwrap();
        // validation holds examples 2..7: two labeled class 1, three unlabeled
        assert_eq!(meter.count(), 5);
        assert_eq!(cm.total(), 2);

        let support: Vec<usize> = cm.class_reports().iter().map(|r| r.support).collect();
        assert_eq!(support, vec![0, 2, 0]);
    }
}
