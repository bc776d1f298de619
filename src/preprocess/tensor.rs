use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::DiagnosisError;

/// Height × width × channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TensorShape {
    pub height: u32,
    pub width: u32,
    pub channels: u32,
}

impl TensorShape {
    pub const fn new(height: u32, width: u32, channels: u32) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.height as usize * self.width as usize * self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn dims(&self) -> (usize, usize, usize) {
        (
            self.height as usize,
            self.width as usize,
            self.channels as usize,
        )
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.height, self.width, self.channels)
    }
}

/// A model-ready image: HWC, `f32`, normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: Array3<f32>,
}

impl Tensor {
    /// Build a tensor from row-major HWC values.
    pub fn from_vec(shape: TensorShape, values: Vec<f32>) -> Result<Self, DiagnosisError> {
        let data = Array3::from_shape_vec(shape.dims(), values).map_err(|e| {
            DiagnosisError::Validation(format!("tensor data does not fit shape {shape}: {e}"))
        })?;
        Ok(Self { data })
    }

    pub fn zeros(shape: TensorShape) -> Self {
        Self {
            data: Array3::zeros(shape.dims()),
        }
    }

    pub fn filled(shape: TensorShape, value: f32) -> Self {
        Self {
            data: Array3::from_elem(shape.dims(), value),
        }
    }

    pub fn shape(&self) -> TensorShape {
        let (h, w, c) = self.data.dim();
        TensorShape::new(h as u32, w as u32, c as u32)
    }

    pub fn view(&self) -> &Array3<f32> {
        &self.data
    }

    /// Values in row-major HWC order.
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().copied().collect()
    }
}
