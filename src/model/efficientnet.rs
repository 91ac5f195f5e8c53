//! EfficientNet-B0 feature extractor
//!
//! The network without its classification top: input rescaling and ImageNet
//! normalization, a 3x3 stem, sixteen MBConv blocks in seven stages and a
//! 1x1 top convolution to 1280 channels. Output is the final feature map,
//! `[batch, 1280, H/32, W/32]`.
//!
//! Batch normalization is never trained here. Every BN layer runs on its
//! running statistics with detached scale and shift, so gradients flow
//! through it to the convolutions but never into it. Drop-connect on the
//! residual branches stays active while training.

use std::path::Path;

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    record::CompactRecorder,
    tensor::{
        activation::{sigmoid, silu},
        backend::Backend,
        Distribution, Tensor, TensorData,
    },
};

use crate::utils::error::XrayError;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// One stage of the B0 layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSpec {
    pub expand_ratio: usize,
    pub out_channels: usize,
    pub repeats: usize,
    pub stride: usize,
    pub kernel: usize,
}

const fn stage(expand_ratio: usize, out_channels: usize, repeats: usize, stride: usize, kernel: usize) -> StageSpec {
    StageSpec {
        expand_ratio,
        out_channels,
        repeats,
        stride,
        kernel,
    }
}

/// Stage table of EfficientNet-B0 (width and depth multipliers of 1.0)
pub const B0_STAGES: [StageSpec; 7] = [
    stage(1, 16, 1, 1, 3),
    stage(6, 24, 2, 2, 3),
    stage(6, 40, 2, 2, 5),
    stage(6, 80, 3, 2, 3),
    stage(6, 112, 3, 1, 5),
    stage(6, 192, 4, 2, 5),
    stage(6, 320, 1, 1, 3),
];

pub const STEM_CHANNELS: usize = 32;

/// Configuration for the EfficientNet-B0 backbone
#[derive(Config, Debug)]
pub struct EfficientNetB0Config {
    /// Drop-connect rate reached by the last block
    #[config(default = "0.2")]
    pub drop_connect_rate: f64,

    /// Batch-norm epsilon
    #[config(default = "1e-3")]
    pub bn_epsilon: f64,

    /// Squeeze-excitation ratio relative to block input channels
    #[config(default = "0.25")]
    pub se_ratio: f64,

    /// Channels of the top 1x1 convolution
    #[config(default = "1280")]
    pub top_channels: usize,
}

impl EfficientNetB0Config {
    /// Initialize a new backbone with random weights
    pub fn init<B: Backend>(&self, device: &B::Device) -> EfficientNetB0<B> {
        let total_blocks: usize = B0_STAGES.iter().map(|s| s.repeats).sum();

        let stem = ConvBn::new(3, STEM_CHANNELS, 3, 2, 1, self.bn_epsilon, device);

        let mut blocks = Vec::with_capacity(total_blocks);
        let mut in_channels = STEM_CHANNELS;
        for spec in B0_STAGES.iter() {
            for repeat in 0..spec.repeats {
                let stride = if repeat == 0 { spec.stride } else { 1 };
                let drop_rate = self.drop_connect_rate * blocks.len() as f64 / total_blocks as f64;
                blocks.push(MbConvBlock::new(
                    MbConvSettings {
                        in_channels,
                        out_channels: spec.out_channels,
                        expand_ratio: spec.expand_ratio,
                        kernel: spec.kernel,
                        stride,
                        se_ratio: self.se_ratio,
                        drop_rate,
                        bn_epsilon: self.bn_epsilon,
                    },
                    device,
                ));
                in_channels = spec.out_channels;
            }
        }

        let top = ConvBn::new(in_channels, self.top_channels, 1, 1, 1, self.bn_epsilon, device);

        EfficientNetB0 {
            stem,
            blocks,
            top,
            out_channels: self.top_channels,
        }
    }
}

/// Batch norm in inference mode with non-trainable affine parameters
pub fn frozen_batch_norm<B: Backend>(bn: &BatchNorm<B, 2>, x: Tensor<B, 4>) -> Tensor<B, 4> {
    let channels = x.dims()[1];
    let mean = bn.running_mean.value().reshape([1, channels, 1, 1]);
    let var = bn.running_var.value().reshape([1, channels, 1, 1]);
    let gamma = bn.gamma.val().detach().reshape([1, channels, 1, 1]);
    let beta = bn.beta.val().detach().reshape([1, channels, 1, 1]);

    (x - mean) / var.add_scalar(bn.epsilon).sqrt() * gamma + beta
}

/// Zero whole residual branches per sample with probability `rate`
pub fn drop_connect<B: Backend>(x: Tensor<B, 4>, rate: f64) -> Tensor<B, 4> {
    let keep = 1.0 - rate;
    let batch = x.dims()[0];
    let mask = Tensor::<B, 4>::random([batch, 1, 1, 1], Distribution::Bernoulli(keep), &x.device());
    x * mask / keep
}

/// Zero padding `(left, right, top, bottom)` ahead of a stride-2 `valid`
/// convolution. Even sides get one row and column less on the top and left.
pub fn correct_pad(height: usize, width: usize, kernel: usize) -> (usize, usize, usize, usize) {
    let half = kernel / 2;
    let leading = |side: usize| if side % 2 == 0 { half.saturating_sub(1) } else { half };
    (leading(width), half, leading(height), half)
}

/// Convolution followed by frozen batch norm
#[derive(Module, Debug)]
pub struct ConvBn<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
    pub kernel: usize,
    pub stride: usize,
}

impl<B: Backend> ConvBn<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        groups: usize,
        bn_epsilon: f64,
        device: &B::Device,
    ) -> Self {
        // strided convolutions pad asymmetrically in forward_linear
        let padding = match stride {
            1 => PaddingConfig2d::Explicit(kernel / 2, kernel / 2),
            _ => PaddingConfig2d::Valid,
        };
        let conv = Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
            .with_stride([stride, stride])
            .with_padding(padding)
            .with_groups(groups)
            .with_bias(false)
            .init(device);
        let bn = BatchNormConfig::new(out_channels)
            .with_epsilon(bn_epsilon)
            .init(device);
        Self {
            conv,
            bn,
            kernel,
            stride,
        }
    }

    /// Conv + BN without activation
    pub fn forward_linear(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match self.stride {
            1 => x,
            _ => {
                let [_, _, height, width] = x.dims();
                x.pad(correct_pad(height, width, self.kernel), 0.0)
            }
        };
        frozen_batch_norm(&self.bn, self.conv.forward(x))
    }

    /// Conv + BN + swish
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        silu(self.forward_linear(x))
    }
}

/// Squeeze-and-excitation gate
#[derive(Module, Debug)]
pub struct SqueezeExcite<B: Backend> {
    pub reduce: Conv2d<B>,
    pub expand: Conv2d<B>,
}

impl<B: Backend> SqueezeExcite<B> {
    fn new(channels: usize, squeezed: usize, device: &B::Device) -> Self {
        Self {
            reduce: Conv2dConfig::new([channels, squeezed], [1, 1]).init(device),
            expand: Conv2dConfig::new([squeezed, channels], [1, 1]).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [n, c, h, w] = x.dims();
        let pooled = x.clone().reshape([n, c, h * w]).mean_dim(2).reshape([n, c, 1, 1]);
        let gate = sigmoid(self.expand.forward(silu(self.reduce.forward(pooled))));
        x * gate
    }
}

struct MbConvSettings {
    in_channels: usize,
    out_channels: usize,
    expand_ratio: usize,
    kernel: usize,
    stride: usize,
    se_ratio: f64,
    drop_rate: f64,
    bn_epsilon: f64,
}

/// Mobile inverted bottleneck block
#[derive(Module, Debug)]
pub struct MbConvBlock<B: Backend> {
    pub expand: Option<ConvBn<B>>,
    pub depthwise: ConvBn<B>,
    pub se: SqueezeExcite<B>,
    pub project: ConvBn<B>,
    pub residual: bool,
    pub drop_rate: f64,
}

impl<B: Backend> MbConvBlock<B> {
    fn new(s: MbConvSettings, device: &B::Device) -> Self {
        let hidden = s.in_channels * s.expand_ratio;
        let expand = (s.expand_ratio != 1)
            .then(|| ConvBn::new(s.in_channels, hidden, 1, 1, 1, s.bn_epsilon, device));
        let depthwise = ConvBn::new(hidden, hidden, s.kernel, s.stride, hidden, s.bn_epsilon, device);
        let squeezed = ((s.in_channels as f64 * s.se_ratio) as usize).max(1);
        let se = SqueezeExcite::new(hidden, squeezed, device);
        let project = ConvBn::new(hidden, s.out_channels, 1, 1, 1, s.bn_epsilon, device);

        Self {
            expand,
            depthwise,
            se,
            project,
            residual: s.stride == 1 && s.in_channels == s.out_channels,
            drop_rate: s.drop_rate,
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>, training: bool) -> Tensor<B, 4> {
        let x = match &self.expand {
            Some(expand) => expand.forward(input.clone()),
            None => input.clone(),
        };
        let x = self.depthwise.forward(x);
        let x = self.se.forward(x);
        let x = self.project.forward_linear(x);

        if !self.residual {
            return x;
        }
        let x = if training && self.drop_rate > 0.0 {
            drop_connect(x, self.drop_rate)
        } else {
            x
        };
        x + input
    }
}

/// EfficientNet-B0 without the classification top
#[derive(Module, Debug)]
pub struct EfficientNetB0<B: Backend> {
    pub stem: ConvBn<B>,
    pub blocks: Vec<MbConvBlock<B>>,
    pub top: ConvBn<B>,
    pub out_channels: usize,
}

impl<B: Backend> EfficientNetB0<B> {
    /// Map raw 0-255 pixels to ImageNet-normalized inputs
    pub fn normalize(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let device = x.device();
        let mean = Tensor::<B, 4>::from_floats(TensorData::new(IMAGENET_MEAN.to_vec(), [1, 3, 1, 1]), &device);
        let std = Tensor::<B, 4>::from_floats(TensorData::new(IMAGENET_STD.to_vec(), [1, 3, 1, 1]), &device);
        (x / 255.0 - mean) / std
    }

    /// Feature map for a batch of `[N, 3, H, W]` images on the 0-255 scale
    pub fn forward(&self, images: Tensor<B, 4>, training: bool) -> Tensor<B, 4> {
        let mut x = self.stem.forward(self.normalize(images));
        for block in self.blocks.iter() {
            x = block.forward(x, training);
        }
        self.top.forward(x)
    }

    /// Load weights from a Burn record file
    pub fn load_weights(self, path: &Path, device: &B::Device) -> crate::utils::error::Result<Self> {
        if !path.exists() {
            return Err(XrayError::PathNotFound(path.to_path_buf()));
        }
        self.load_file(path.to_path_buf(), &CompactRecorder::new(), device)
            .map_err(|e| XrayError::Model(format!("Failed to load backbone weights from {:?}: {:?}", path, e)))
    }
}
