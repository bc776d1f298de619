pub mod fixed;
pub mod linear;
pub mod remote;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::consts::{DEFAULT_STAGE_TIMEOUT, DEFAULT_STAGE_WEIGHT};
use crate::error::{DiagnosisError, StageError};
use crate::preprocess::{Tensor, TensorShape};

use fixed::{FixedConfig, FixedStage};
use linear::{LinearConfig, LinearStage};
use remote::{RemoteConfig, RemoteStage};

/// Slack allowed on `Σ confidence ≤ 1` for floating-point rounding.
pub const SUM_TOLERANCE: f64 = 1e-6;

/// One label and how confident a stage is in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredLabel {
    pub label: String,
    pub confidence: f64,
}

impl ScoredLabel {
    pub fn new(label: impl Into<String>, confidence: f64) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }
}

/// A pre-trained classifier behind a uniform contract. Could be a
/// checkpoint loaded in-process, a remote model server, or a fixed script.
///
/// Implementations must be deterministic: the same tensor always yields
/// the same labels.
#[async_trait]
pub trait ClassifierStage: Send + Sync {
    fn id(&self) -> &str;

    /// Short name of the backing model family, for the stage catalog.
    fn architecture(&self) -> &str;

    /// The only input shape `predict` accepts.
    fn expected_shape(&self) -> TensorShape;

    /// Every label this stage can emit, in model output order.
    fn label_space(&self) -> &[String];

    /// Ranked labels, confidence descending, summing to at most 1.
    async fn predict(&self, input: &Tensor) -> Result<Vec<ScoredLabel>, StageError>;
}

/// Fail fast on a tensor of the wrong shape. Never reshape.
pub fn ensure_shape(expected: TensorShape, input: &Tensor) -> Result<(), StageError> {
    let actual = input.shape();
    if actual != expected {
        return Err(StageError::ShapeMismatch { expected, actual });
    }
    Ok(())
}

/// Numerically stable softmax.
pub fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Order labels by confidence descending, ties by label ascending.
pub fn sort_ranked(labels: &mut [ScoredLabel]) {
    labels.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| a.label.cmp(&b.label))
    });
}

/// Check that scores form a (sub-)distribution: each finite and in
/// `[0, 1]`, total at most 1.
pub fn validate_distribution(labels: &[ScoredLabel]) -> Result<(), StageError> {
    let mut total = 0.0;
    for l in labels {
        if !l.confidence.is_finite() || !(0.0..=1.0).contains(&l.confidence) {
            return Err(StageError::Inference(format!(
                "confidence for '{}' is out of range: {}",
                l.label, l.confidence
            )));
        }
        total += l.confidence;
    }
    if total > 1.0 + SUM_TOLERANCE {
        return Err(StageError::Inference(format!(
            "confidences sum to {total}, expected at most 1"
        )));
    }
    Ok(())
}

/// Pair model scores with the label space, validate and rank them.
pub fn rank(label_space: &[String], scores: &[f64]) -> Result<Vec<ScoredLabel>, StageError> {
    if label_space.len() != scores.len() {
        return Err(StageError::Inference(format!(
            "model produced {} scores for {} labels",
            scores.len(),
            label_space.len()
        )));
    }
    let mut labels: Vec<ScoredLabel> = label_space
        .iter()
        .zip(scores)
        .map(|(label, &score)| ScoredLabel::new(label.clone(), score))
        .collect();
    validate_distribution(&labels)?;
    sort_ranked(&mut labels);
    Ok(labels)
}

/// Reject empty or duplicated label spaces.
pub(crate) fn check_label_space(labels: &[String]) -> Result<(), StageError> {
    if labels.is_empty() {
        return Err(StageError::Inference("label space is empty".to_string()));
    }
    let mut seen = BTreeSet::new();
    for label in labels {
        if !seen.insert(label.as_str()) {
            return Err(StageError::Inference(format!("duplicate label '{label}'")));
        }
    }
    Ok(())
}

/// Which backend a configured stage uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StageKind {
    Fixed(FixedConfig),
    Linear(LinearConfig),
    Remote(RemoteConfig),
}

impl StageKind {
    /// Build the concrete stage. Relative checkpoint paths resolve
    /// against `base_dir`.
    pub fn build(&self, id: &str, base_dir: &Path) -> Result<Arc<dyn ClassifierStage>> {
        let stage: Arc<dyn ClassifierStage> = match self {
            StageKind::Fixed(config) => Arc::new(FixedStage::from_config(id, config)?),
            StageKind::Linear(config) => {
                let path = base_dir.join(&config.checkpoint);
                Arc::new(LinearStage::load(id, &path)?)
            }
            StageKind::Remote(config) => Arc::new(RemoteStage::new(id, config.clone())?),
        };
        Ok(stage)
    }
}

/// How the gateway runs a stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSettings {
    /// Shape the preprocessor produces for this stage.
    pub input_shape: TensorShape,
    pub weight: f64,
    pub timeout: Duration,
    /// A required stage failing fails the request; optional ones are omitted.
    pub required: bool,
}

impl StageSettings {
    pub fn for_stage(stage: &dyn ClassifierStage) -> Self {
        Self {
            input_shape: stage.expected_shape(),
            weight: DEFAULT_STAGE_WEIGHT,
            timeout: DEFAULT_STAGE_TIMEOUT,
            required: false,
        }
    }
}

#[derive(Clone)]
pub struct RegisteredStage {
    pub stage: Arc<dyn ClassifierStage>,
    pub settings: StageSettings,
}

impl RegisteredStage {
    pub fn id(&self) -> &str {
        self.stage.id()
    }
}

/// Catalog entry for a configured stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDescription {
    pub id: String,
    pub architecture: String,
    pub expected_shape: TensorShape,
    pub input_shape: TensorShape,
    pub labels: Vec<String>,
    pub weight: f64,
    pub timeout_ms: u64,
    pub required: bool,
}

/// The configured stages, keyed and iterated by id. Built at startup,
/// read-only afterwards.
#[derive(Default, Clone)]
pub struct StageRegistry {
    stages: BTreeMap<String, RegisteredStage>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        stage: Arc<dyn ClassifierStage>,
        settings: StageSettings,
    ) -> Result<(), DiagnosisError> {
        let id = stage.id().to_string();
        if id.trim().is_empty() {
            return Err(DiagnosisError::Config("stage id must not be empty".to_string()));
        }
        if self.stages.contains_key(&id) {
            return Err(DiagnosisError::Config(format!("duplicate stage id '{id}'")));
        }
        check_weight(&id, settings.weight).map_err(DiagnosisError::Config)?;
        if settings.timeout.is_zero() {
            return Err(DiagnosisError::Config(format!(
                "stage '{id}' timeout must be greater than zero"
            )));
        }
        self.stages.insert(id, RegisteredStage { stage, settings });
        Ok(())
    }

    /// Register with the stage's own shape, equal weight and the default timeout.
    pub fn register_default(&mut self, stage: Arc<dyn ClassifierStage>) -> Result<(), DiagnosisError> {
        let settings = StageSettings::for_stage(stage.as_ref());
        self.register(stage, settings)
    }

    pub fn get(&self, id: &str) -> Option<&RegisteredStage> {
        self.stages.get(id)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.stages.keys().cloned().collect()
    }

    /// Resolve a request's stage list. `None` selects every stage.
    /// Unknown ids are rejected, duplicates collapse, order is by id.
    pub fn select(&self, ids: Option<&[String]>) -> Result<Vec<&RegisteredStage>, DiagnosisError> {
        let Some(ids) = ids else {
            return Ok(self.stages.values().collect());
        };
        if ids.is_empty() {
            return Err(DiagnosisError::Validation("no stages selected".to_string()));
        }
        let wanted: BTreeSet<&str> = ids.iter().map(String::as_str).collect();
        wanted
            .into_iter()
            .map(|id| {
                self.stages
                    .get(id)
                    .ok_or_else(|| DiagnosisError::Validation(format!("unknown stage '{id}'")))
            })
            .collect()
    }

    pub fn descriptions(&self) -> Vec<StageDescription> {
        self.stages
            .values()
            .map(|entry| StageDescription {
                id: entry.id().to_string(),
                architecture: entry.stage.architecture().to_string(),
                expected_shape: entry.stage.expected_shape(),
                input_shape: entry.settings.input_shape,
                labels: entry.stage.label_space().to_vec(),
                weight: entry.settings.weight,
                timeout_ms: entry.settings.timeout.as_millis() as u64,
                required: entry.settings.required,
            })
            .collect()
    }
}

/// Weights must be finite and strictly positive.
pub(crate) fn check_weight(stage: &str, weight: f64) -> Result<(), String> {
    if !weight.is_finite() || weight <= 0.0 {
        return Err(format!(
            "weight for stage '{stage}' must be finite and > 0, got {weight}"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn fixed(id: &str) -> Arc<dyn ClassifierStage> {
        Arc::new(
            FixedStage::new(
                id,
                vec![ScoredLabel::new("a", 0.6), ScoredLabel::new("b", 0.4)],
                TensorShape::new(4, 4, 3),
            )
            .unwrap(),
        )
    }

    #[test]
    fn softmax_sums_to_one() {
        let probs = softmax(&[1.0, 2.0, 3.0]);
        let sum: f64 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    }

    #[test]
    fn softmax_is_stable_for_large_logits() {
        let probs = softmax(&[1000.0, 1000.0]);
        assert!((probs[0] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn rank_sorts_descending_with_lexicographic_ties() {
        let ranked = rank(&labels(&["zeta", "alpha", "mid"]), &[0.3, 0.3, 0.4]).unwrap();
        let order: Vec<&str> = ranked.iter().map(|l| l.label.as_str()).collect();
        assert_eq!(order, vec!["mid", "alpha", "zeta"]);
    }

    #[test]
    fn rank_rejects_arity_mismatch() {
        let err = rank(&labels(&["a", "b"]), &[1.0]).unwrap_err();
        assert!(err.to_string().contains("1 scores for 2 labels"));
    }

    #[test]
    fn rank_rejects_sums_above_one() {
        assert!(rank(&labels(&["a", "b"]), &[0.7, 0.7]).is_err());
    }

    #[test]
    fn rank_rejects_out_of_range_and_nan() {
        assert!(rank(&labels(&["a"]), &[-0.1]).is_err());
        assert!(rank(&labels(&["a"]), &[f64::NAN]).is_err());
    }

    #[test]
    fn label_space_must_be_unique_and_non_empty() {
        assert!(check_label_space(&[]).is_err());
        assert!(check_label_space(&labels(&["a", "a"])).is_err());
        assert!(check_label_space(&labels(&["a", "b"])).is_ok());
    }

    #[test]
    fn ensure_shape_reports_both_shapes() {
        let err = ensure_shape(TensorShape::new(2, 2, 3), &Tensor::zeros(TensorShape::new(2, 2, 1)))
            .unwrap_err();
        assert!(matches!(err, StageError::ShapeMismatch { .. }));
    }

    #[test]
    fn registry_rejects_duplicates_and_bad_settings() {
        let mut registry = StageRegistry::new();
        registry.register_default(fixed("a")).unwrap();
        assert!(registry.register_default(fixed("a")).is_err());

        let stage = fixed("b");
        let mut settings = StageSettings::for_stage(stage.as_ref());
        settings.weight = 0.0;
        assert!(registry.register(stage.clone(), settings.clone()).is_err());

        settings.weight = 1.0;
        settings.timeout = Duration::ZERO;
        assert!(registry.register(stage, settings).is_err());
    }

    #[test]
    fn select_defaults_to_all_in_id_order() {
        let mut registry = StageRegistry::new();
        registry.register_default(fixed("b")).unwrap();
        registry.register_default(fixed("a")).unwrap();

        let ids: Vec<&str> = registry.select(None).unwrap().iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn select_dedupes_and_rejects_unknown() {
        let mut registry = StageRegistry::new();
        registry.register_default(fixed("a")).unwrap();
        registry.register_default(fixed("b")).unwrap();

        let picked = registry.select(Some(&labels(&["b", "b"]))).unwrap();
        assert_eq!(picked.len(), 1);

        assert!(registry.select(Some(&labels(&["nope"]))).is_err());
        assert!(registry.select(Some(&[])).is_err());
    }

    #[test]
    fn descriptions_list_catalog() {
        let mut registry = StageRegistry::new();
        registry.register_default(fixed("a")).unwrap();
        let catalog = registry.descriptions();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].architecture, "fixed");
        assert_eq!(catalog[0].labels, labels(&["a", "b"]));
        assert_eq!(catalog[0].timeout_ms, 30_000);
    }
}
