use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ClassifierStage, ScoredLabel, check_label_space, ensure_shape, sort_ranked, validate_distribution};
use crate::consts::DEFAULT_INPUT_SHAPE;
use crate::error::StageError;
use crate::preprocess::{Tensor, TensorShape};

fn default_shape() -> TensorShape {
    DEFAULT_INPUT_SHAPE
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedConfig {
    pub labels: Vec<ScoredLabel>,
    #[serde(default = "default_shape")]
    pub expected_shape: TensorShape,
    /// Artificial latency before answering.
    #[serde(default)]
    pub delay_ms: u64,
    /// Fail every call with this message instead of answering.
    #[serde(default)]
    pub fail_with: Option<String>,
}

/// A scripted stage. Answers every call with the same labels.
pub struct FixedStage {
    id: String,
    labels: Vec<ScoredLabel>,
    label_space: Vec<String>,
    expected_shape: TensorShape,
    delay: Duration,
    failure: Option<String>,
}

impl FixedStage {
    pub fn new(
        id: impl Into<String>,
        labels: Vec<ScoredLabel>,
        expected_shape: TensorShape,
    ) -> Result<Self, StageError> {
        let label_space: Vec<String> = labels.iter().map(|l| l.label.clone()).collect();
        check_label_space(&label_space)?;
        validate_distribution(&labels)?;
        let mut labels = labels;
        sort_ranked(&mut labels);
        Ok(Self {
            id: id.into(),
            labels,
            label_space,
            expected_shape,
            delay: Duration::ZERO,
            failure: None,
        })
    }

    pub fn from_config(id: &str, config: &FixedConfig) -> Result<Self> {
        let mut stage = Self::new(id, config.labels.clone(), config.expected_shape)?
            .with_delay(Duration::from_millis(config.delay_ms));
        if let Some(message) = &config.fail_with {
            stage = stage.failing(message.clone());
        }
        Ok(stage)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }
}

#[async_trait]
impl ClassifierStage for FixedStage {
    fn id(&self) -> &str {
        &self.id
    }

    fn architecture(&self) -> &str {
        "fixed"
    }

    fn expected_shape(&self) -> TensorShape {
        self.expected_shape
    }

    fn label_space(&self) -> &[String] {
        &self.label_space
    }

    async fn predict(&self, input: &Tensor) -> Result<Vec<ScoredLabel>, StageError> {
        ensure_shape(self.expected_shape, input)?;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(message) = &self.failure {
            return Err(StageError::Inference(message.clone()));
        }
        Ok(self.labels.clone())
    }
}
