//! Error taxonomy for the diagnosis pipeline.
//!
//! Every error carries a stable machine-readable [`ErrorKind`] so callers
//! (and the HTTP layer) can branch on it without parsing messages.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::preprocess::TensorShape;

/// Stable, machine-readable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    DecodeError,
    ShapeMismatch,
    InferenceError,
    Timeout,
    AllStagesFailed,
    AggregationError,
    Cancelled,
    ConfigError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::DecodeError => "decode_error",
            ErrorKind::ShapeMismatch => "shape_mismatch",
            ErrorKind::InferenceError => "inference_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::AllStagesFailed => "all_stages_failed",
            ErrorKind::AggregationError => "aggregation_error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ConfigError => "config_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure raised by a single classifier stage.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    #[error("input shape {actual} does not match expected shape {expected}")]
    ShapeMismatch {
        expected: TensorShape,
        actual: TensorShape,
    },
    #[error("inference failed: {0}")]
    Inference(String),
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::ShapeMismatch { .. } => ErrorKind::ShapeMismatch,
            StageError::Inference(_) => ErrorKind::InferenceError,
        }
    }
}

/// One stage that did not contribute to a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Everything that can go wrong between upload and diagnosis.
#[derive(Debug, Clone, Error)]
pub enum DiagnosisError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("could not decode image: {0}")]
    Decode(String),

    #[error("stage '{stage}': {source}")]
    Stage {
        stage: String,
        #[source]
        source: StageError,
    },

    #[error("stage '{stage}' timed out after {}ms", after.as_millis())]
    Timeout { stage: String, after: Duration },

    #[error("all {} selected stage(s) failed", failures.len())]
    AllStagesFailed { failures: Vec<StageFailure> },

    #[error("aggregation failed: {0}")]
    Aggregation(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),
}

impl DiagnosisError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DiagnosisError::Validation(_) => ErrorKind::ValidationError,
            DiagnosisError::Decode(_) => ErrorKind::DecodeError,
            DiagnosisError::Stage { source, .. } => source.kind(),
            DiagnosisError::Timeout { .. } => ErrorKind::Timeout,
            DiagnosisError::AllStagesFailed { .. } => ErrorKind::AllStagesFailed,
            DiagnosisError::Aggregation(_) => ErrorKind::AggregationError,
            DiagnosisError::Cancelled => ErrorKind::Cancelled,
            DiagnosisError::Config(_) => ErrorKind::ConfigError,
        }
    }

    /// Only transient failures are worth resubmitting unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            DiagnosisError::Timeout { .. } => true,
            DiagnosisError::AllStagesFailed { failures } => {
                !failures.is_empty() && failures.iter().all(|f| f.kind == ErrorKind::Timeout)
            }
            _ => false,
        }
    }

    /// The stage this error is attributed to, if any.
    pub fn stage(&self) -> Option<&str> {
        match self {
            DiagnosisError::Stage { stage, .. } | DiagnosisError::Timeout { stage, .. } => {
                Some(stage)
            }
            _ => None,
        }
    }

    pub(crate) fn to_failure(&self, stage: &str) -> StageFailure {
        StageFailure {
            stage: stage.to_string(),
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}
