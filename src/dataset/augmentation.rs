//! Data Augmentation Module for Chest X-Ray Training
//!
//! Per-epoch augmentations applied on top of the decoded image cache:
//!
//! 1. contrast stretch around the per-channel mean (factor 2)
//! 2. brightness shift (+0.4 on the 0-255 pixel scale)
//! 3. random 224x224 crop out of the 250x250 cached image
//! 4. training only: random rotation with reflect fill
//!
//! Values are kept as unclipped floats throughout, so contrast and
//! brightness can push pixels outside `[0, 255]`.

use image::RgbImage;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Configuration for data augmentation
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AugmentationConfig {
    /// Contrast factor applied around the per-channel mean
    pub contrast_factor: f32,
    /// Value added to every pixel after the contrast stretch
    pub brightness_delta: f32,
    /// Side of the square random crop
    pub crop_size: usize,
    /// Rotation range as a fraction of a full turn (training only)
    pub rotation_factor: f32,
    /// Apply per-image standardization after cropping
    pub standardize: bool,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            contrast_factor: 2.0,
            brightness_delta: 0.4,
            crop_size: crate::IMAGE_SIZE,
            rotation_factor: 0.05,
            standardize: false,
        }
    }
}

/// Float image in CHW layout
#[derive(Clone, Debug, PartialEq)]
pub struct FloatImage {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

impl FloatImage {
    /// Convert an 8-bit RGB image to CHW floats on the 0-255 scale
    pub fn from_rgb(img: &RgbImage) -> Self {
        let (w, h) = img.dimensions();
        let (width, height) = (w as usize, h as usize);
        let plane = width * height;
        let mut data = vec![0.0f32; 3 * plane];

        for (x, y, pixel) in img.enumerate_pixels() {
            let idx = y as usize * width + x as usize;
            data[idx] = pixel[0] as f32;
            data[plane + idx] = pixel[1] as f32;
            data[2 * plane + idx] = pixel[2] as f32;
        }

        Self {
            channels: 3,
            height,
            width,
            data,
        }
    }

    fn plane(&self) -> usize {
        self.height * self.width
    }

    /// `(x - mean_c) * factor + mean_c` for each channel `c`
    pub fn adjust_contrast(&mut self, factor: f32) {
        let plane = self.plane();
        if plane == 0 {
            return;
        }
        for channel in self.data.chunks_mut(plane) {
            let mean = channel.iter().map(|&v| v as f64).sum::<f64>() / plane as f64;
            let mean = mean as f32;
            for v in channel.iter_mut() {
                *v = (*v - mean) * factor + mean;
            }
        }
    }

    pub fn adjust_brightness(&mut self, delta: f32) {
        for v in self.data.iter_mut() {
            *v += delta;
        }
    }

    /// Copy out a `size` x `size` window starting at `(top, left)`
    pub fn crop(&self, top: usize, left: usize, size: usize) -> Self {
        let plane = self.plane();
        let mut data = Vec::with_capacity(self.channels * size * size);
        for c in 0..self.channels {
            for y in top..top + size {
                let row = c * plane + y * self.width;
                data.extend_from_slice(&self.data[row + left..row + left + size]);
            }
        }
        Self {
            channels: self.channels,
            height: size,
            width: size,
            data,
        }
    }

    /// Crop at a uniformly random offset; images smaller than `size` are returned unchanged
    pub fn random_crop(&self, size: usize, rng: &mut impl Rng) -> Self {
        if self.height < size || self.width < size {
            return self.clone();
        }
        let top = rng.gen_range(0..=self.height - size);
        let left = rng.gen_range(0..=self.width - size);
        self.crop(top, left, size)
    }

    /// Rotate counter-clockwise by `angle` radians about the image centre,
    /// sampling bilinearly and filling with the reflected image
    pub fn rotate(&self, angle: f32) -> Self {
        let (h, w) = (self.height, self.width);
        let plane = self.plane();
        let cx = (w as f32 - 1.0) / 2.0;
        let cy = (h as f32 - 1.0) / 2.0;
        let (sin_a, cos_a) = angle.sin_cos();
        let mut data = vec![0.0f32; self.data.len()];

        for y in 0..h {
            for x in 0..w {
                let dx = x as f32 - cx;
                let dy = y as f32 - cy;
                let src_x = cos_a * dx - sin_a * dy + cx;
                let src_y = sin_a * dx + cos_a * dy + cy;

                let x0f = src_x.floor();
                let y0f = src_y.floor();
                let fx = src_x - x0f;
                let fy = src_y - y0f;
                let x0 = reflect_index(x0f as i64, w);
                let x1 = reflect_index(x0f as i64 + 1, w);
                let y0 = reflect_index(y0f as i64, h);
                let y1 = reflect_index(y0f as i64 + 1, h);

                for c in 0..self.channels {
                    let base = c * plane;
                    let p00 = self.data[base + y0 * w + x0];
                    let p10 = self.data[base + y0 * w + x1];
                    let p01 = self.data[base + y1 * w + x0];
                    let p11 = self.data[base + y1 * w + x1];
                    data[base + y * w + x] = p00 * (1.0 - fx) * (1.0 - fy)
                        + p10 * fx * (1.0 - fy)
                        + p01 * (1.0 - fx) * fy
                        + p11 * fx * fy;
                }
            }
        }

        Self {
            channels: self.channels,
            height: h,
            width: w,
            data,
        }
    }

    /// Zero mean, unit variance with the stddev floored at `1/sqrt(N)`
    pub fn standardize(&mut self) {
        let n = self.data.len();
        if n == 0 {
            return;
        }
        let mean = self.data.iter().map(|&v| v as f64).sum::<f64>() / n as f64;
        let var = self
            .data
            .iter()
            .map(|&v| {
                let d = v as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n as f64;
        let adjusted = var.sqrt().max(1.0 / (n as f64).sqrt());
        for v in self.data.iter_mut() {
            *v = ((*v as f64 - mean) / adjusted) as f32;
        }
    }
}

/// Map an index onto `[0, n)` by mirroring at the edges: `d c b a | a b c d | d c b a`
fn reflect_index(i: i64, n: usize) -> usize {
    let n = n as i64;
    if n <= 1 {
        return 0;
    }
    let period = 2 * n;
    let m = i.rem_euclid(period);
    (if m >= n { period - 1 - m } else { m }) as usize
}

/// Deterministic RNG for one example in one epoch
pub fn example_rng(seed: u64, epoch: usize, index: usize) -> ChaCha8Rng {
    let mixed = seed
        ^ (epoch as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (index as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    ChaCha8Rng::seed_from_u64(mixed)
}

/// Applies the augmentation chain to cached images
#[derive(Clone, Debug)]
pub struct Augmenter {
    config: AugmentationConfig,
}

impl Augmenter {
    pub fn new(config: AugmentationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AugmentationConfig {
        &self.config
    }

    /// Contrast, brightness and random crop; rotation is added when `training`
    pub fn augment(&self, img: &RgbImage, training: bool, rng: &mut ChaCha8Rng) -> FloatImage {
        let mut image = FloatImage::from_rgb(img);
        image.adjust_contrast(self.config.contrast_factor);
        image.adjust_brightness(self.config.brightness_delta);
        let mut image = image.random_crop(self.config.crop_size, rng);

        if training && self.config.rotation_factor > 0.0 {
            let max = self.config.rotation_factor * std::f32::consts::TAU;
            let angle = rng.gen_range(-max..=max);
            image = image.rotate(angle);
        }

        if self.config.standardize {
            image.standardize();
        }

        image
    }
}
