//! Linear-probe classifier loaded from a JSON checkpoint.
//!
//! The tensor is mean-pooled over a `grid × grid` layout per channel,
//! giving `grid² · channels` features ordered row-major by cell, then by
//! channel. An affine layer maps features to one logit per label and a
//! softmax turns logits into confidences. Feature sums run in `f32`,
//! the affine layer in `f64`.

use anyhow::{Context, Result, bail, ensure};
use async_trait::async_trait;
use ndarray::s;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{ClassifierStage, ScoredLabel, check_label_space, ensure_shape, rank, softmax};
use crate::error::StageError;
use crate::preprocess::{Tensor, TensorShape};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearConfig {
    pub checkpoint: PathBuf,
}

fn default_architecture() -> String {
    "linear-probe".to_string()
}

/// On-disk checkpoint format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearCheckpoint {
    #[serde(default = "default_architecture")]
    pub architecture: String,
    pub labels: Vec<String>,
    pub input_shape: TensorShape,
    pub grid: u32,
    /// One row per label, `grid² · channels` columns.
    pub weights: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
}

impl LinearCheckpoint {
    pub fn feature_len(&self) -> usize {
        (self.grid * self.grid * self.input_shape.channels) as usize
    }

    pub fn validate(&self) -> Result<()> {
        check_label_space(&self.labels)?;
        let shape = self.input_shape;
        ensure!(
            shape.channels == 1 || shape.channels == 3,
            "input_shape channels must be 1 or 3, got {}",
            shape.channels
        );
        ensure!(self.grid > 0, "grid must be at least 1");
        ensure!(
            self.grid <= shape.height && self.grid <= shape.width,
            "grid {} does not fit input shape {shape}",
            self.grid
        );
        ensure!(
            self.weights.len() == self.labels.len(),
            "weights has {} rows for {} labels",
            self.weights.len(),
            self.labels.len()
        );
        ensure!(
            self.bias.len() == self.labels.len(),
            "bias has {} entries for {} labels",
            self.bias.len(),
            self.labels.len()
        );
        let features = self.feature_len();
        for (row, weights) in self.weights.iter().enumerate() {
            if weights.len() != features {
                bail!(
                    "weights row {row} has {} columns, expected {features}",
                    weights.len()
                );
            }
        }
        let all_finite = self
            .weights
            .iter()
            .flatten()
            .chain(&self.bias)
            .all(|v| v.is_finite());
        ensure!(all_finite, "checkpoint contains non-finite parameters");
        Ok(())
    }

    fn features(&self, input: &Tensor) -> Vec<f32> {
        let shape = self.input_shape;
        let grid = self.grid as usize;
        let (h, w, c) = (
            shape.height as usize,
            shape.width as usize,
            shape.channels as usize,
        );
        let view = input.view();
        let mut features = Vec::with_capacity(self.feature_len());
        for gy in 0..grid {
            let (y0, y1) = (gy * h / grid, (gy + 1) * h / grid);
            for gx in 0..grid {
                let (x0, x1) = (gx * w / grid, (gx + 1) * w / grid);
                for ch in 0..c {
                    let cell = view.slice(s![y0..y1, x0..x1, ch]);
                    features.push(cell.mean().unwrap_or(0.0));
                }
            }
        }
        features
    }

    fn logits(&self, features: &[f32]) -> Vec<f64> {
        self.weights
            .iter()
            .zip(&self.bias)
            .map(|(row, &bias)| {
                row.iter()
                    .zip(features)
                    .fold(bias as f64, |acc, (&w, &f)| acc + w as f64 * f as f64)
            })
            .collect()
    }

    /// Pool, apply the affine layer, softmax. The caller checks the shape.
    fn classify(&self, input: &Tensor) -> Result<Vec<ScoredLabel>, StageError> {
        let features = self.features(input);
        if features.iter().any(|f| !f.is_finite()) {
            return Err(StageError::Inference("input contains non-finite values".to_string()));
        }
        let probabilities = softmax(&self.logits(&features));
        rank(&self.labels, &probabilities)
    }
}

pub struct LinearStage {
    id: String,
    checkpoint: Arc<LinearCheckpoint>,
}

impl LinearStage {
    pub fn new(id: impl Into<String>, checkpoint: LinearCheckpoint) -> Result<Self> {
        let id = id.into();
        checkpoint
            .validate()
            .with_context(|| format!("invalid checkpoint for stage '{id}'"))?;
        Ok(Self {
            id,
            checkpoint: Arc::new(checkpoint),
        })
    }

    pub fn load(id: &str, path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read checkpoint {}", path.display()))?;
        let checkpoint: LinearCheckpoint = serde_json::from_str(&json)
            .with_context(|| format!("failed to parse checkpoint {}", path.display()))?;
        Self::new(id, checkpoint)
    }
}

#[async_trait]
impl ClassifierStage for LinearStage {
    fn id(&self) -> &str {
        &self.id
    }

    fn architecture(&self) -> &str {
        &self.checkpoint.architecture
    }

    fn expected_shape(&self) -> TensorShape {
        self.checkpoint.input_shape
    }

    fn label_space(&self) -> &[String] {
        &self.checkpoint.labels
    }

    async fn predict(&self, input: &Tensor) -> Result<Vec<ScoredLabel>, StageError> {
        ensure_shape(self.checkpoint.input_shape, input)?;
        let checkpoint = Arc::clone(&self.checkpoint);
        let input = input.clone();
        tokio::task::spawn_blocking(move || checkpoint.classify(&input))
            .await
            .map_err(|e| StageError::Inference(format!("inference worker failed: {e}")))?
    }
}
