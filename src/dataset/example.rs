//! `tf.train.Example` decoding
//!
//! Message definitions mirror `tensorflow/core/example/{example,feature}.proto`
//! and are derived with prost. Only the two features the trainer reads are
//! extracted, with fixed-length scalar semantics: a missing key takes the
//! default, a present key must hold exactly one value of the expected kind.

use std::collections::HashMap;

use image::{ImageFormat, Rgb, RgbImage};
use prost::Message;
use tracing::warn;

use crate::utils::error::{Result, XrayError};

/// Feature key holding the JPEG bytes
pub const IMAGE_KEY: &str = "image/encoded";
/// Feature key holding the integer class label
pub const LABEL_KEY: &str = "image/label";

#[derive(Clone, PartialEq, Message)]
pub struct Example {
    #[prost(message, optional, tag = "1")]
    pub features: Option<Features>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Features {
    #[prost(map = "string, message", tag = "1")]
    pub feature: HashMap<String, Feature>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Feature {
    #[prost(oneof = "feature::Kind", tags = "1, 2, 3")]
    pub kind: Option<feature::Kind>,
}

pub mod feature {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        BytesList(super::BytesList),
        #[prost(message, tag = "2")]
        FloatList(super::FloatList),
        #[prost(message, tag = "3")]
        Int64List(super::Int64List),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct BytesList {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub value: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct FloatList {
    #[prost(float, repeated, tag = "1")]
    pub value: Vec<f32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Int64List {
    #[prost(int64, repeated, tag = "1")]
    pub value: Vec<i64>,
}

impl Feature {
    fn kind_name(&self) -> &'static str {
        match &self.kind {
            Some(feature::Kind::BytesList(_)) => "bytes_list",
            Some(feature::Kind::FloatList(_)) => "float_list",
            Some(feature::Kind::Int64List(_)) => "int64_list",
            None => "empty",
        }
    }
}

/// Label and image bytes pulled out of an `Example`
#[derive(Debug, Clone, PartialEq)]
pub struct RawExample {
    pub encoded: Vec<u8>,
    pub label: i64,
}

/// A decoded training example as held in the in-memory cache
#[derive(Debug, Clone)]
pub struct CachedExample {
    /// RGB image resized to the decode size
    pub image: RgbImage,
    /// Class index, `None` when the stored label is outside `[0, num_classes)`
    pub label: Option<usize>,
}

impl CachedExample {
    /// One-hot target vector of the given depth
    pub fn one_hot(&self, depth: usize) -> Vec<f32> {
        one_hot(self.label, depth)
    }
}

/// One-hot encode a class index; `None` produces an all-zero vector
pub fn one_hot(label: Option<usize>, depth: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; depth];
    if let Some(l) = label.filter(|&l| l < depth) {
        v[l] = 1.0;
    }
    v
}

fn scalar_bytes(features: &HashMap<String, Feature>, key: &str) -> Result<Vec<u8>> {
    let Some(feature) = features.get(key) else {
        return Ok(Vec::new());
    };
    match &feature.kind {
        Some(feature::Kind::BytesList(list)) if list.value.len() == 1 => Ok(list.value[0].clone()),
        Some(feature::Kind::BytesList(list)) => Err(XrayError::Example(format!(
            "feature '{}' expected 1 value, found {}",
            key,
            list.value.len()
        ))),
        _ => Err(XrayError::Example(format!(
            "feature '{}' expected bytes_list, found {}",
            key,
            feature.kind_name()
        ))),
    }
}

fn scalar_int64(features: &HashMap<String, Feature>, key: &str) -> Result<i64> {
    let Some(feature) = features.get(key) else {
        return Ok(0);
    };
    match &feature.kind {
        Some(feature::Kind::Int64List(list)) if list.value.len() == 1 => Ok(list.value[0]),
        Some(feature::Kind::Int64List(list)) => Err(XrayError::Example(format!(
            "feature '{}' expected 1 value, found {}",
            key,
            list.value.len()
        ))),
        _ => Err(XrayError::Example(format!(
            "feature '{}' expected int64_list, found {}",
            key,
            feature.kind_name()
        ))),
    }
}

/// Deserialize an `Example` and extract the image bytes and label
pub fn parse_raw_example(bytes: &[u8]) -> Result<RawExample> {
    let example = Example::decode(bytes)?;
    let features = example.features.unwrap_or_default().feature;

    Ok(RawExample {
        encoded: scalar_bytes(&features, IMAGE_KEY)?,
        label: scalar_int64(&features, LABEL_KEY)?,
    })
}

/// Source taps and weight of the second tap for output index `dst`
fn bilinear_taps(dst: u32, src_len: u32, dst_len: u32) -> (u32, u32, f32) {
    let last = src_len.saturating_sub(1);
    let scale = src_len as f32 / dst_len as f32;
    let pos = ((dst as f32 + 0.5) * scale - 0.5).max(0.0);
    let lo = (pos.floor() as u32).min(last);
    let hi = (lo + 1).min(last);
    (lo, hi, pos - lo as f32)
}

/// Bilinear resize with half-pixel centers and no antialiasing
///
/// Matches `tf.image.resize(method="bilinear")`. Results are rounded back to
/// u8, so the cache stays at a byte per channel.
pub fn resize_bilinear(src: &RgbImage, width: u32, height: u32) -> RgbImage {
    let (src_width, src_height) = src.dimensions();
    let cols: Vec<_> = (0..width).map(|x| bilinear_taps(x, src_width, width)).collect();
    let rows: Vec<_> = (0..height).map(|y| bilinear_taps(y, src_height, height)).collect();

    RgbImage::from_fn(width, height, |x, y| {
        let (x0, x1, fx) = cols[x as usize];
        let (y0, y1, fy) = rows[y as usize];
        let (p00, p10) = (src.get_pixel(x0, y0), src.get_pixel(x1, y0));
        let (p01, p11) = (src.get_pixel(x0, y1), src.get_pixel(x1, y1));

        let mut out = [0u8; 3];
        for (c, value) in out.iter_mut().enumerate() {
            let top = p00[c] as f32 + (p10[c] as f32 - p00[c] as f32) * fx;
            let bottom = p01[c] as f32 + (p11[c] as f32 - p01[c] as f32) * fx;
            *value = (top + (bottom - top) * fy).round().clamp(0.0, 255.0) as u8;
        }
        Rgb(out)
    })
}

/// Decode a JPEG into RGB and resize it to `decode_size` x `decode_size`
pub fn decode_image(encoded: &[u8], decode_size: u32) -> Result<RgbImage> {
    let img = image::load_from_memory_with_format(encoded, ImageFormat::Jpeg)?.to_rgb8();
    if img.dimensions() == (decode_size, decode_size) {
        return Ok(img);
    }
    Ok(resize_bilinear(&img, decode_size, decode_size))
}

/// Full record-to-cache decode
pub fn parse_example(bytes: &[u8], num_classes: usize, decode_size: u32) -> Result<CachedExample> {
    let raw = parse_raw_example(bytes)?;
    let image = decode_image(&raw.encoded, decode_size)?;

    let label = usize::try_from(raw.label).ok().filter(|&l| l < num_classes);
    if label.is_none() {
        warn!(
            "Label {} is outside [0, {}); using an all-zero target",
            raw.label, num_classes
        );
    }

    Ok(CachedExample { image, label })
}

/// Build a serialized `Example` holding a JPEG and its label
pub fn encode_example(jpeg: &[u8], label: i64) -> Vec<u8> {
    let mut feature = HashMap::new();
    feature.insert(
        IMAGE_KEY.to_string(),
        Feature {
            kind: Some(feature::Kind::BytesList(BytesList {
                value: vec![jpeg.to_vec()],
            })),
        },
    );
    feature.insert(
        LABEL_KEY.to_string(),
        Feature {
            kind: Some(feature::Kind::Int64List(Int64List { value: vec![label] })),
        },
    );

    Example {
        features: Some(Features { feature }),
    }
    .encode_to_vec()
}

/// Encode an RGB image as JPEG
pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>> {
    let mut out = std::io::Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Jpeg)?;
    Ok(out.into_inner())
}
