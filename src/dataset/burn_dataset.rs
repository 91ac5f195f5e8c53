//! Burn Dataset Integration for Chest X-Ray Records
//!
//! `XrayDataset` holds the decoded cache and implements Burn's `Dataset`
//! trait. `EpochLoader` turns batches of cache indices into augmented
//! `XrayItem`s, assembling upcoming batches on a background thread while the
//! current one trains. `XrayBatcher` stacks items into tensors.
//!
//! Pixel values stay on the 0-255 scale here; rescaling and ImageNet
//! normalization happen inside the backbone.

use std::ops::Range;
use std::sync::mpsc;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::dataset::augmentation::{example_rng, Augmenter};
use crate::dataset::example::{one_hot, CachedExample};
use crate::utils::error::Result;

/// Decoded examples held in memory for the lifetime of training
#[derive(Debug, Clone)]
pub struct XrayDataset {
    items: Vec<CachedExample>,
    num_classes: usize,
}

impl XrayDataset {
    pub fn new(items: Vec<CachedExample>, num_classes: usize) -> Self {
        Self { items, num_classes }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn examples(&self) -> &[CachedExample] {
        &self.items
    }

    /// Number of examples per class, in class order
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.num_classes];
        for label in self.items.iter().filter_map(|item| item.label) {
            counts[label] += 1;
        }
        counts
    }
}

impl Dataset<CachedExample> for XrayDataset {
    fn get(&self, index: usize) -> Option<CachedExample> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// An augmented example ready for batching
#[derive(Clone, Debug)]
pub struct XrayItem {
    /// Image data as flattened CHW float array [3 * H * W]
    pub image: Vec<f32>,
    /// Image side length
    pub size: usize,
    /// One-hot target
    pub target: Vec<f32>,
    /// Class index used for accuracy; all-zero targets count as class 0
    pub label: usize,
    /// Class from the record, `None` when the label was out of range
    pub class: Option<usize>,
}

/// A batch of chest X-ray images
#[derive(Clone, Debug)]
pub struct XrayBatch<B: Backend> {
    /// Images with shape [batch_size, 3, height, width]
    pub images: Tensor<B, 4>,
    /// One-hot targets with shape [batch_size, num_classes]
    pub one_hot: Tensor<B, 2>,
    /// Class indices with shape [batch_size]
    pub targets: Tensor<B, 1, Int>,
}

/// Batcher stacking `XrayItem`s into tensors
#[derive(Clone, Debug)]
pub struct XrayBatcher {
    num_classes: usize,
}

impl XrayBatcher {
    pub fn new(num_classes: usize) -> Self {
        Self { num_classes }
    }
}

impl<B: Backend> Batcher<B, XrayItem, XrayBatch<B>> for XrayBatcher {
    fn batch(&self, items: Vec<XrayItem>, device: &B::Device) -> XrayBatch<B> {
        let batch_size = items.len();
        let size = items.first().map(|item| item.size).unwrap_or(0);

        let images_data: Vec<f32> = items.iter().flat_map(|item| item.image.iter().copied()).collect();
        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(images_data, [batch_size, 3, size, size]),
            device,
        );

        let targets_data: Vec<f32> = items.iter().flat_map(|item| item.target.iter().copied()).collect();
        let one_hot = Tensor::<B, 2>::from_floats(
            TensorData::new(targets_data, [batch_size, self.num_classes]),
            device,
        );

        let labels: Vec<i64> = items.iter().map(|item| item.label as i64).collect();
        let targets = Tensor::<B, 1, Int>::from_data(TensorData::new(labels, [batch_size]), device);

        XrayBatch {
            images,
            one_hot,
            targets,
        }
    }
}

/// Produces augmented host batches for one pass over a set of batches
pub struct EpochLoader<'a> {
    dataset: &'a XrayDataset,
    augmenter: &'a Augmenter,
    seed: u64,
    prefetch: usize,
}

impl<'a> EpochLoader<'a> {
    pub fn new(dataset: &'a XrayDataset, augmenter: &'a Augmenter, seed: u64, prefetch: usize) -> Self {
        Self {
            dataset,
            augmenter,
            seed,
            prefetch,
        }
    }

    /// Index lists for the given batch ranges, shuffled across batches when requested
    pub fn batch_indices(&self, ranges: &[Range<usize>], epoch: usize, shuffle: bool) -> Vec<Vec<usize>> {
        if !shuffle {
            return ranges.iter().map(|r| r.clone().collect()).collect();
        }

        let mut all: Vec<usize> = ranges.iter().flat_map(|r| r.clone()).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        all.shuffle(&mut rng);

        let mut batches = Vec::with_capacity(ranges.len());
        let mut rest = all.as_slice();
        for range in ranges {
            let (head, tail) = rest.split_at(range.len());
            batches.push(head.to_vec());
            rest = tail;
        }
        batches
    }

    /// Augment the examples at `indices` in parallel, preserving order
    pub fn prepare(&self, indices: &[usize], epoch: usize, training: bool) -> Vec<XrayItem> {
        let num_classes = self.dataset.num_classes();
        indices
            .par_iter()
            .filter_map(|&index| {
                let example = self.dataset.get(index)?;
                let mut rng = example_rng(self.seed, epoch, index);
                let image = self.augmenter.augment(&example.image, training, &mut rng);
                Some(XrayItem {
                    size: image.width,
                    image: image.data,
                    target: one_hot(example.label, num_classes),
                    label: example.label.unwrap_or(0),
                    class: example.label,
                })
            })
            .collect()
    }

    /// Feed every batch to `consume` in order, preparing up to `prefetch`
    /// batches ahead on a producer thread
    pub fn for_each_batch<F>(&self, batches: &[Vec<usize>], epoch: usize, training: bool, mut consume: F) -> Result<()>
    where
        F: FnMut(usize, Vec<XrayItem>) -> Result<()>,
    {
        if self.prefetch == 0 {
            for (i, indices) in batches.iter().enumerate() {
                consume(i, self.prepare(indices, epoch, training))?;
            }
            return Ok(());
        }

        std::thread::scope(|scope| {
            let (tx, rx) = mpsc::sync_channel::<(usize, Vec<XrayItem>)>(self.prefetch);
            scope.spawn(move || {
                for (i, indices) in batches.iter().enumerate() {
                    if tx.send((i, self.prepare(indices, epoch, training))).is_err() {
                        break;
                    }
                }
            });

            for (i, items) in rx.iter() {
                consume(i, items)?;
            }
            Ok(())
        })
    }
}
