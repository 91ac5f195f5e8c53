//! Chest X-ray classifier: EfficientNet-B0 backbone plus a dense head
//!
//! ```text
//! images -> [training] gaussian noise -> backbone -> global average pool -> dense -> logits
//! ```
//!
//! Random rotation, the other training-only input layer, runs host-side in
//! the augmentation pipeline.

use burn::{
    config::Config,
    module::Module,
    nn::{
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Linear, LinearConfig,
    },
    tensor::{
        activation::softmax,
        backend::{AutodiffBackend, Backend},
        Distribution, Tensor,
    },
};

use crate::model::efficientnet::{EfficientNetB0, EfficientNetB0Config};

/// How the backbone takes part in a training phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackbonePolicy {
    /// Backbone runs outside the autodiff graph; only the head trains
    Frozen,
    /// Every backbone layer except batch norm trains
    FineTune,
}

impl std::fmt::Display for BackbonePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackbonePolicy::Frozen => write!(f, "frozen"),
            BackbonePolicy::FineTune => write!(f, "fine-tune"),
        }
    }
}

/// Additive zero-mean Gaussian noise, active only while training
#[derive(Module, Clone, Debug)]
pub struct GaussianNoise {
    pub std: f64,
}

impl GaussianNoise {
    pub fn forward<B: Backend, const D: usize>(&self, x: Tensor<B, D>, training: bool) -> Tensor<B, D> {
        if !training || self.std <= 0.0 {
            return x;
        }
        let noise = Tensor::random(x.shape(), Distribution::Normal(0.0, self.std), &x.device());
        x + noise
    }
}

/// Configuration for the classifier
#[derive(Config, Debug)]
pub struct XrayClassifierConfig {
    /// Number of output classes
    #[config(default = "20")]
    pub num_classes: usize,

    /// Standard deviation of the input noise layer
    #[config(default = "0.1")]
    pub noise_std: f64,

    /// Backbone configuration
    pub backbone: EfficientNetB0Config,
}

impl XrayClassifierConfig {
    /// Initialize a new classifier with random weights
    pub fn init<B: Backend>(&self, device: &B::Device) -> XrayClassifier<B> {
        let backbone = self.backbone.init(device);
        let head = LinearConfig::new(backbone.out_channels, self.num_classes).init(device);

        XrayClassifier {
            backbone,
            noise: GaussianNoise { std: self.noise_std },
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            head,
        }
    }
}

/// EfficientNet-B0 transfer-learning classifier
#[derive(Module, Debug)]
pub struct XrayClassifier<B: Backend> {
    pub backbone: EfficientNetB0<B>,
    pub noise: GaussianNoise,
    pub pool: AdaptiveAvgPool2d,
    pub head: Linear<B>,
}

impl<B: Backend> XrayClassifier<B> {
    /// Logits for a batch of `[N, 3, H, W]` images on the 0-255 scale
    pub fn forward(&self, images: Tensor<B, 4>, training: bool) -> Tensor<B, 2> {
        let x = self.noise.forward(images, training);
        let features = self.backbone.forward(x, training);
        self.classify(features)
    }

    /// Class probabilities
    pub fn forward_softmax(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images, false), 1)
    }

    /// Global average pooling followed by the dense head
    pub fn classify(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let [n, c, _, _] = features.dims();
        let pooled = self.pool.forward(features).reshape([n, c]);
        self.head.forward(pooled)
    }
}

impl<B: AutodiffBackend> XrayClassifier<B> {
    /// Logits with the backbone evaluated outside the autodiff graph
    ///
    /// `backbone` is a snapshot of `self.backbone` on the inner backend,
    /// taken once per phase with `valid()` by `Trainer::fit_phase`.
    pub fn forward_frozen(
        &self,
        backbone: &EfficientNetB0<B::InnerBackend>,
        images: Tensor<B::InnerBackend, 4>,
        training: bool,
    ) -> Tensor<B, 2> {
        let x = self.noise.forward(images, training);
        let features = backbone.forward(x, training);
        self.classify(Tensor::from_inner(features))
    }
}
