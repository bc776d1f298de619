//! Wire format for a [`DiagnosticResult`]. Pure serialization.

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};

use crate::aggregate::DiagnosticResult;
use crate::consts::CONFIDENCE_DECIMALS;
use crate::error::StageFailure;
use crate::stage::ScoredLabel;

/// What the UI receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisPayload {
    /// Ranked, confidences rounded to [`CONFIDENCE_DECIMALS`] places.
    pub labels: Vec<ScoredLabel>,
    pub contributing_stages: Vec<String>,
    pub omitted_stages: Vec<String>,
    #[serde(default)]
    pub omissions: Vec<StageFailure>,
    /// RFC 3339, UTC, millisecond precision.
    pub timestamp: String,
}

impl DiagnosisPayload {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Round half away from zero to the fixed wire precision.
pub fn round_confidence(confidence: f64) -> f64 {
    let factor = 10f64.powi(CONFIDENCE_DECIMALS as i32);
    (confidence * factor).round() / factor
}

pub fn present(result: &DiagnosticResult) -> DiagnosisPayload {
    DiagnosisPayload {
        labels: result
            .labels()
            .iter()
            .map(|l| ScoredLabel::new(l.label.clone(), round_confidence(l.confidence)))
            .collect(),
        contributing_stages: result.contributing_stages().to_vec(),
        omitted_stages: result.omitted_stage_ids(),
        omissions: result.omitted().to_vec(),
        timestamp: result
            .timestamp()
            .to_rfc3339_opts(SecondsFormat::Millis, true),
    }
}
