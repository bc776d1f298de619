use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use super::{DiagnosisRequest, Engine};
use crate::aggregate::{Aggregator, DiagnosticResult, StageOutput};
use crate::error::DiagnosisError;
use crate::events::{Event, EventBus};
use crate::ingest::{ImageBlob, ImageIngestor};
use crate::ingest::store::{NoopStore, UploadStore};
use crate::preprocess::{Preprocessor, Tensor, TensorShape};
use crate::present::present;
use crate::stage::{
    ClassifierStage, RegisteredStage, ScoredLabel, StageRegistry, sort_ranked,
    validate_distribution,
};

/// Ingest, preprocess once per distinct shape, run the selected stages
/// concurrently, aggregate whatever came back.
pub struct FanOutEngine {
    ingestor: ImageIngestor,
    store: Arc<dyn UploadStore>,
    preprocessor: Preprocessor,
    registry: Arc<StageRegistry>,
    events: Option<Arc<EventBus>>,
}

struct StageRun {
    stage: Arc<dyn ClassifierStage>,
    tensor: Arc<Tensor>,
    timeout: Duration,
    required: bool,
}

impl FanOutEngine {
    pub fn new(
        ingestor: ImageIngestor,
        preprocessor: Preprocessor,
        registry: Arc<StageRegistry>,
    ) -> Self {
        Self {
            ingestor,
            store: Arc::new(NoopStore),
            preprocessor,
            registry,
            events: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn UploadStore>) -> Self {
        self.store = store;
        self
    }

    /// Emit [`Event::DiagnosisCompleted`] on `bus` after each success.
    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.ingestor.max_bytes()
    }

    /// Configured weights, overridden per request. Overrides must name
    /// configured stages.
    fn aggregator(
        &self,
        selected: &[&RegisteredStage],
        overrides: Option<&BTreeMap<String, f64>>,
    ) -> Result<Aggregator, DiagnosisError> {
        if let Some(overrides) = overrides
            && let Some(unknown) = overrides.keys().find(|id| self.registry.get(id).is_none())
        {
            return Err(DiagnosisError::Validation(format!(
                "aggregation weight given for unknown stage '{unknown}'"
            )));
        }
        let weights = selected
            .iter()
            .map(|entry| {
                let weight = overrides
                    .and_then(|o| o.get(entry.id()))
                    .copied()
                    .unwrap_or(entry.settings.weight);
                (entry.id().to_string(), weight)
            })
            .collect();
        Aggregator::with_weights(weights)
    }

    async fn run(
        &self,
        request_id: Uuid,
        request: DiagnosisRequest,
        cancel: CancellationToken,
    ) -> Result<DiagnosticResult, DiagnosisError> {
        let started = Instant::now();
        let blob = self.ingestor.ingest(request.image, &request.mime_type)?;
        let selected = self.registry.select(request.stages.as_deref())?;
        let aggregator = self.aggregator(&selected, request.aggregation_weights.as_ref())?;
        debug!(
            digest = blob.digest(),
            bytes = blob.len(),
            stages = selected.len(),
            "upload accepted"
        );

        match self.store.persist(&blob).await {
            Ok(Some(path)) => debug!(path = %path.display(), "upload persisted"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to persist upload"),
        }

        if cancel.is_cancelled() {
            return Err(DiagnosisError::Cancelled);
        }

        let digest = blob.digest().to_string();
        let shapes: Vec<TensorShape> = selected.iter().map(|e| e.settings.input_shape).collect();
        let preprocessor = self.preprocessor.clone();
        let worker = tokio::task::spawn_blocking(move || preprocess_all(&preprocessor, blob, shapes));
        let tensors = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("cancelled during preprocessing");
                return Err(DiagnosisError::Cancelled);
            }
            joined = worker => joined
                .map_err(|e| DiagnosisError::Decode(format!("preprocessing worker failed: {e}")))??,
        };
        debug!(shapes = tensors.len(), "preprocessed");

        let runs: Vec<StageRun> = selected
            .iter()
            .filter_map(|entry| {
                let tensor = tensors.get(&entry.settings.input_shape)?;
                Some(StageRun {
                    stage: Arc::clone(&entry.stage),
                    tensor: Arc::clone(tensor),
                    timeout: entry.settings.timeout,
                    required: entry.settings.required,
                })
            })
            .collect();
        drop(tensors);

        let futures: Vec<_> = runs.into_iter().map(run_stage).collect();
        let results = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("cancelled during inference");
                return Err(DiagnosisError::Cancelled);
            }
            results = futures::future::join_all(futures) => results,
        };

        let mut outputs = Vec::with_capacity(results.len());
        let mut omitted = Vec::new();
        for (id, required, outcome) in results {
            match outcome {
                Ok(labels) => {
                    debug!(
                        stage = %id,
                        top = labels.first().map(|l| l.label.as_str()).unwrap_or("-"),
                        "stage answered"
                    );
                    outputs.push(StageOutput::new(id, labels));
                }
                Err(err) if required => {
                    warn!(stage = %id, kind = %err.kind(), error = %err, "required stage failed");
                    return Err(err);
                }
                Err(err) => {
                    warn!(stage = %id, kind = %err.kind(), error = %err, "stage omitted");
                    omitted.push(err.to_failure(&id));
                }
            }
        }

        if outputs.is_empty() {
            return Err(DiagnosisError::AllStagesFailed { failures: omitted });
        }

        let result = aggregator.aggregate(&outputs, omitted, Utc::now())?;
        info!(
            top = result.top().map(|l| l.label.as_str()).unwrap_or("-"),
            contributing = result.contributing_stages().len(),
            omitted = result.omitted().len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "diagnosis complete"
        );

        if let Some(bus) = &self.events {
            bus.emit(Event::DiagnosisCompleted {
                request_id,
                image_digest: digest,
                payload: present(&result),
            });
        }
        Ok(result)
    }
}

/// Decode once and build one tensor per distinct shape, shared read-only
/// by every stage that wants it. CPU bound; runs on the blocking pool.
fn preprocess_all(
    preprocessor: &Preprocessor,
    blob: ImageBlob,
    shapes: Vec<TensorShape>,
) -> Result<BTreeMap<TensorShape, Arc<Tensor>>, DiagnosisError> {
    let image = preprocessor.decode(&blob)?;
    drop(blob);
    let mut tensors = BTreeMap::new();
    for shape in shapes {
        if !tensors.contains_key(&shape) {
            tensors.insert(shape, Arc::new(preprocessor.transform(&image, shape)?));
        }
    }
    Ok(tensors)
}

/// Run one stage under its deadline. Returns its id, whether it is
/// required, and what happened.
async fn run_stage(run: StageRun) -> (String, bool, Result<Vec<ScoredLabel>, DiagnosisError>) {
    let id = run.stage.id().to_string();
    let outcome = match tokio::time::timeout(run.timeout, run.stage.predict(&run.tensor)).await {
        Ok(predicted) => predicted
            .and_then(|mut labels| {
                validate_distribution(&labels)?;
                sort_ranked(&mut labels);
                Ok(labels)
            })
            .map_err(|source| DiagnosisError::Stage {
                stage: id.clone(),
                source,
            }),
        Err(_) => Err(DiagnosisError::Timeout {
            stage: id.clone(),
            after: run.timeout,
        }),
    };
    (id, run.required, outcome)
}

#[async_trait]
impl Engine for FanOutEngine {
    async fn diagnose(
        &self,
        request: DiagnosisRequest,
        cancel: CancellationToken,
    ) -> Result<DiagnosticResult, DiagnosisError> {
        let request_id = Uuid::new_v4();
        let span = info_span!("diagnose", %request_id);
        self.run(request_id, request, cancel).instrument(span).await
    }
}
