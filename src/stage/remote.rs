use anyhow::{Result, ensure};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::{ClassifierStage, ScoredLabel, check_label_space, ensure_shape, rank, softmax};
use crate::error::StageError;
use crate::preprocess::{Tensor, TensorShape};

/// How to read the model server's first output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// Raw scores; softmax is applied here.
    #[default]
    Logits,
    /// Already a distribution; validated as-is.
    Probabilities,
}

fn default_input_name() -> String {
    "input".to_string()
}

fn default_architecture() -> String {
    "remote".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    250
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Full inference URL, e.g. `http://host:8000/v2/models/densenet/infer`.
    pub endpoint: String,
    pub labels: Vec<String>,
    pub expected_shape: TensorShape,
    #[serde(default)]
    pub output: OutputKind,
    #[serde(default = "default_input_name")]
    pub input_name: String,
    #[serde(default = "default_architecture")]
    pub architecture: String,
    /// Attempts per prediction when the server answers 429 or 503. The
    /// stage timeout still bounds the whole call.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First backoff; doubles after each retry.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InferTensor {
    pub name: String,
    pub shape: Vec<u64>,
    pub datatype: String,
    pub data: Vec<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InferRequest {
    pub inputs: Vec<InferTensor>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InferOutput {
    #[serde(default)]
    pub name: String,
    pub data: Vec<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InferResponse {
    pub outputs: Vec<InferOutput>,
}

/// A classifier served by a model server speaking the KServe v2 JSON
/// inference protocol (Triton, KServe, MLServer, TorchServe's v2 API).
pub struct RemoteStage {
    id: String,
    config: RemoteConfig,
    client: reqwest::Client,
}

impl RemoteStage {
    pub fn new(id: impl Into<String>, config: RemoteConfig) -> Result<Self> {
        check_label_space(&config.labels)?;
        ensure!(config.max_attempts > 0, "max_attempts must be at least 1");
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            id: id.into(),
            config,
            client,
        })
    }

    fn build_request(&self, input: &Tensor) -> InferRequest {
        let shape = self.config.expected_shape;
        InferRequest {
            inputs: vec![InferTensor {
                name: self.config.input_name.clone(),
                shape: vec![
                    1,
                    shape.height as u64,
                    shape.width as u64,
                    shape.channels as u64,
                ],
                datatype: "FP32".to_string(),
                data: input.to_vec(),
            }],
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.config.retry_delay_ms.saturating_mul(factor))
    }
}

fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE
}

#[async_trait]
impl ClassifierStage for RemoteStage {
    fn id(&self) -> &str {
        &self.id
    }

    fn architecture(&self) -> &str {
        &self.config.architecture
    }

    fn expected_shape(&self) -> TensorShape {
        self.config.expected_shape
    }

    fn label_space(&self) -> &[String] {
        &self.config.labels
    }

    async fn predict(&self, input: &Tensor) -> Result<Vec<ScoredLabel>, StageError> {
        ensure_shape(self.config.expected_shape, input)?;

        let request = self.build_request(input);
        let mut attempt = 1;
        let response = loop {
            // Transport errors carry the endpoint URL; keep it in the logs
            // and out of the error that reaches clients.
            let response = self
                .client
                .post(&self.config.endpoint)
                .json(&request)
                .send()
                .await
                .map_err(|e| {
                    warn!(stage = %self.id, error = %e, "model server request failed");
                    StageError::Inference("model server unreachable".to_string())
                })?;

            let status = response.status();
            if status.is_success() {
                break response;
            }
            if is_transient(status) && attempt < self.config.max_attempts {
                let delay = self.backoff(attempt);
                debug!(
                    stage = %self.id,
                    %status,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "model server busy, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            return Err(StageError::Inference(format!(
                "model server returned {status}"
            )));
        };

        let body: InferResponse = response.json().await.map_err(|e| {
            warn!(stage = %self.id, error = %e, "unreadable model server response");
            StageError::Inference(format!(
                "malformed model server response: {}",
                e.without_url()
            ))
        })?;
        let output = body
            .outputs
            .into_iter()
            .next()
            .ok_or_else(|| StageError::Inference("model server returned no outputs".to_string()))?;

        let scores = match self.config.output {
            OutputKind::Logits => {
                if output.data.iter().any(|v| !v.is_finite()) {
                    return Err(StageError::Inference("non-finite logits".to_string()));
                }
                softmax(&output.data)
            }
            OutputKind::Probabilities => output.data,
        };
        rank(&self.config.labels, &scores)
    }
}
