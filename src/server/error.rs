use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::error::{DiagnosisError, ErrorKind, StageFailure};

/// Everything a handler can fail with.
#[derive(Debug)]
pub enum ApiError {
    Diagnosis(DiagnosisError),
    NotFound(String),
    Internal(anyhow::Error),
}

impl From<DiagnosisError> for ApiError {
    fn from(err: DiagnosisError) -> Self {
        ApiError::Diagnosis(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

/// `{"error": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<StageFailure>,
}

pub fn status_for(err: &DiagnosisError) -> StatusCode {
    match err.kind() {
        ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
        ErrorKind::DecodeError | ErrorKind::ShapeMismatch => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::AllStagesFailed if err.is_retryable() => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::InferenceError
        | ErrorKind::AllStagesFailed
        | ErrorKind::AggregationError
        | ErrorKind::ConfigError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ApiError {
    fn parts(&self) -> (StatusCode, ErrorDetail) {
        match self {
            ApiError::Diagnosis(err) => {
                let failures = match err {
                    DiagnosisError::AllStagesFailed { failures } => failures.clone(),
                    _ => Vec::new(),
                };
                let detail = ErrorDetail {
                    kind: err.kind().to_string(),
                    message: err.to_string(),
                    retryable: err.is_retryable(),
                    stage: err.stage().map(str::to_string),
                    failures,
                };
                (status_for(err), detail)
            }
            ApiError::NotFound(message) => (
                StatusCode::NOT_FOUND,
                ErrorDetail {
                    kind: "not_found".to_string(),
                    message: message.clone(),
                    retryable: false,
                    stage: None,
                    failures: Vec::new(),
                },
            ),
            ApiError::Internal(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorDetail {
                    kind: "internal_error".to_string(),
                    message: format!("{err:#}"),
                    retryable: false,
                    stage: None,
                    failures: Vec::new(),
                },
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = self.parts();
        if status.is_server_error() {
            tracing::error!(kind = %error.kind, message = %error.message, "request failed");
        } else {
            tracing::debug!(kind = %error.kind, message = %error.message, "request rejected");
        }
        (status, Json(ErrorBody { error })).into_response()
    }
}
