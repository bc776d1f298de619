//! Decode, resize and normalize an upload into a [`Tensor`].
//!
//! The transform is fixed so that two implementations using the same
//! decoder produce bit-identical tensors:
//!
//! 1. decode with the format the upload was validated as,
//! 2. resize exactly to `width × height` (no aspect-ratio preservation,
//!    no cropping) with the configured filter, bilinear by default,
//! 3. convert to RGB (3 channels) or luma (1 channel),
//! 4. normalize each value as `(pixel * scale - mean[c]) / std[c]` in `f32`.

mod tensor;

pub use tensor::{Tensor, TensorShape};

use image::DynamicImage;
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};

use crate::error::DiagnosisError;
use crate::ingest::ImageBlob;

/// Interpolation used when resizing to the target shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeFilter {
    #[default]
    Bilinear,
    Nearest,
}

impl From<ResizeFilter> for FilterType {
    fn from(filter: ResizeFilter) -> Self {
        match filter {
            ResizeFilter::Bilinear => FilterType::Triangle,
            ResizeFilter::Nearest => FilterType::Nearest,
        }
    }
}

/// Per-channel normalization constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Normalization {
    pub scale: f32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Default for Normalization {
    /// Min-max to `[0, 1]`.
    fn default() -> Self {
        Self {
            scale: 1.0 / 255.0,
            mean: [0.0; 3],
            std: [1.0; 3],
        }
    }
}

impl Normalization {
    /// ImageNet mean/std, the usual choice for pretrained CNN backbones.
    pub fn imagenet() -> Self {
        Self {
            scale: 1.0 / 255.0,
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
        }
    }

    pub fn validate(&self) -> Result<(), DiagnosisError> {
        if !self.scale.is_finite() || self.scale <= 0.0 {
            return Err(DiagnosisError::Config(format!(
                "normalization scale must be finite and > 0, got {}",
                self.scale
            )));
        }
        for (i, (&m, &s)) in self.mean.iter().zip(&self.std).enumerate() {
            if !m.is_finite() {
                return Err(DiagnosisError::Config(format!(
                    "normalization mean[{i}] is not finite"
                )));
            }
            if !s.is_finite() || s <= 0.0 {
                return Err(DiagnosisError::Config(format!(
                    "normalization std[{i}] must be finite and > 0, got {s}"
                )));
            }
        }
        Ok(())
    }

    fn apply(&self, value: u8, channel: usize) -> f32 {
        (value as f32 * self.scale - self.mean[channel]) / self.std[channel]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    pub filter: ResizeFilter,
    #[serde(flatten)]
    pub normalization: Normalization,
}

/// Stateless image → tensor transform.
#[derive(Debug, Clone, Default)]
pub struct Preprocessor {
    config: PreprocessConfig,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Result<Self, DiagnosisError> {
        config.normalization.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    /// Decode and transform in one step.
    pub fn preprocess(&self, blob: &ImageBlob, shape: TensorShape) -> Result<Tensor, DiagnosisError> {
        let image = self.decode(blob)?;
        self.transform(&image, shape)
    }

    pub fn decode(&self, blob: &ImageBlob) -> Result<DynamicImage, DiagnosisError> {
        image::load_from_memory_with_format(blob.bytes(), blob.mime().image_format())
            .map_err(|e| DiagnosisError::Decode(e.to_string()))
    }

    pub fn transform(&self, image: &DynamicImage, shape: TensorShape) -> Result<Tensor, DiagnosisError> {
        if shape.height == 0 || shape.width == 0 {
            return Err(DiagnosisError::Config(format!(
                "target shape {shape} has a zero dimension"
            )));
        }
        let resized = image.resize_exact(shape.width, shape.height, self.config.filter.into());
        let raw = match shape.channels {
            1 => resized.to_luma8().into_raw(),
            3 => resized.to_rgb8().into_raw(),
            n => {
                return Err(DiagnosisError::Config(format!(
                    "unsupported channel count {n} (expected 1 or 3)"
                )));
            }
        };

        let channels = shape.channels as usize;
        let values = raw
            .iter()
            .enumerate()
            .map(|(i, &v)| self.config.normalization.apply(v, i % channels))
            .collect();
        Tensor::from_vec(shape, values)
    }
}
