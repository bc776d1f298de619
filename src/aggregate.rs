//! Combines stage outputs into one ranked [`DiagnosticResult`].
//!
//! Rule: weighted arithmetic mean with absent labels counted as zero.
//! For every label emitted by any contributing stage `s`:
//!
//! ```text
//! combined(L) = Σ_s w_s · conf_s(L) / Σ_s w_s
//! ```
//!
//! Weights default to 1.0 (equal). They are divided by the largest
//! contributing weight before summing, so every scaled weight lies in
//! `(0, 1]` and the sums stay finite for any finite input. Stages are
//! summed in id order so the
//! result does not depend on the order outputs arrive in. Ranking is by
//! confidence descending, then label ascending.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

use crate::consts::DEFAULT_STAGE_WEIGHT;
use crate::error::{DiagnosisError, StageFailure};
use crate::stage::{ScoredLabel, check_weight, sort_ranked};

/// What one stage said about the image.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    pub stage: String,
    pub labels: Vec<ScoredLabel>,
}

impl StageOutput {
    pub fn new(stage: impl Into<String>, labels: Vec<ScoredLabel>) -> Self {
        Self {
            stage: stage.into(),
            labels,
        }
    }
}

/// The final, ranked answer for one request. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticResult {
    labels: Vec<ScoredLabel>,
    contributing_stages: Vec<String>,
    omitted: Vec<StageFailure>,
    timestamp: DateTime<Utc>,
}

impl DiagnosticResult {
    pub fn labels(&self) -> &[ScoredLabel] {
        &self.labels
    }

    pub fn top(&self) -> Option<&ScoredLabel> {
        self.labels.first()
    }

    pub fn contributing_stages(&self) -> &[String] {
        &self.contributing_stages
    }

    /// Stages that were selected but did not contribute, with why.
    pub fn omitted(&self) -> &[StageFailure] {
        &self.omitted
    }

    pub fn omitted_stage_ids(&self) -> Vec<String> {
        self.omitted.iter().map(|f| f.stage.clone()).collect()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    weights: BTreeMap<String, f64>,
}

impl Aggregator {
    /// Equal weights.
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-stage weights; stages not listed weigh 1.0.
    pub fn with_weights(weights: BTreeMap<String, f64>) -> Result<Self, DiagnosisError> {
        for (stage, &weight) in &weights {
            check_weight(stage, weight).map_err(DiagnosisError::Validation)?;
        }
        Ok(Self { weights })
    }

    pub fn weight(&self, stage: &str) -> f64 {
        self.weights
            .get(stage)
            .copied()
            .unwrap_or(DEFAULT_STAGE_WEIGHT)
    }

    pub fn aggregate(
        &self,
        outputs: &[StageOutput],
        omitted: Vec<StageFailure>,
        timestamp: DateTime<Utc>,
    ) -> Result<DiagnosticResult, DiagnosisError> {
        if outputs.is_empty() {
            return Err(DiagnosisError::Aggregation(
                "no stage outputs to aggregate".to_string(),
            ));
        }

        let mut ordered: Vec<&StageOutput> = outputs.iter().collect();
        ordered.sort_by(|a, b| a.stage.cmp(&b.stage));

        let mut seen = BTreeSet::new();
        for output in &ordered {
            if !seen.insert(output.stage.as_str()) {
                return Err(DiagnosisError::Aggregation(format!(
                    "stage '{}' reported twice",
                    output.stage
                )));
            }
        }

        let max_weight = ordered
            .iter()
            .map(|o| self.weight(&o.stage))
            .fold(0.0, f64::max);
        let scaled = |stage: &str| self.weight(stage) / max_weight;
        let total_weight: f64 = ordered.iter().map(|o| scaled(&o.stage)).sum();
        let mut sums: BTreeMap<&str, f64> = BTreeMap::new();
        for output in &ordered {
            let weight = scaled(&output.stage);
            for label in &output.labels {
                *sums.entry(label.label.as_str()).or_insert(0.0) += weight * label.confidence;
            }
        }

        let mut labels: Vec<ScoredLabel> = sums
            .into_iter()
            .map(|(label, sum)| ScoredLabel::new(label, sum / total_weight))
            .collect();
        sort_ranked(&mut labels);

        let mut omitted = omitted;
        omitted.sort_by(|a, b| a.stage.cmp(&b.stage));

        Ok(DiagnosticResult {
            labels,
            contributing_stages: ordered.iter().map(|o| o.stage.clone()).collect(),
            omitted,
            timestamp,
        })
    }
}
