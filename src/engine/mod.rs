pub mod fanout;

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

use crate::aggregate::DiagnosticResult;
use crate::error::DiagnosisError;

/// One upload plus what the caller wants done with it.
#[derive(Debug, Clone, Default)]
pub struct DiagnosisRequest {
    pub image: Vec<u8>,
    pub mime_type: String,
    /// Stage ids to run. `None` runs every configured stage.
    pub stages: Option<Vec<String>>,
    /// Per-request weight overrides, keyed by stage id.
    pub aggregation_weights: Option<BTreeMap<String, f64>>,
}

impl DiagnosisRequest {
    pub fn new(image: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            image,
            mime_type: mime_type.into(),
            ..Self::default()
        }
    }

    pub fn with_stages<I, S>(mut self, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stages = Some(stages.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_weights(mut self, weights: BTreeMap<String, f64>) -> Self {
        self.aggregation_weights = Some(weights);
        self
    }
}

/// The outermost boundary. The server and the CLI only know this trait.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Run one request to completion. Once `cancel` fires no result is
    /// returned, only [`DiagnosisError::Cancelled`].
    async fn diagnose(
        &self,
        request: DiagnosisRequest,
        cancel: CancellationToken,
    ) -> Result<DiagnosticResult, DiagnosisError>;
}
