pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::events::Event;
use crate::present::DiagnosisPayload;

/// One past diagnosis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub request_id: String,
    pub image_digest: String,
    pub result: DiagnosisPayload,
}

/// Where past diagnoses are kept. Could be SQLite, a file, a remote store.
#[async_trait]
pub trait DiagnosisLog: Send + Sync {
    async fn record(&self, entry: HistoryEntry) -> Result<()>;
    /// The latest `limit` entries, oldest first.
    async fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>>;
    /// Everything, oldest first.
    async fn all(&self) -> Result<Vec<HistoryEntry>>;
    async fn count(&self) -> Result<usize>;
    async fn clear(&self) -> Result<()>;
}

/// Append every completed diagnosis on the bus to `log`. Runs until the
/// bus is dropped.
pub fn spawn_recorder(
    mut events: broadcast::Receiver<Event>,
    log: Arc<dyn DiagnosisLog>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(Event::DiagnosisCompleted {
                    request_id,
                    image_digest,
                    payload,
                }) => {
                    let entry = HistoryEntry {
                        request_id: request_id.to_string(),
                        image_digest,
                        result: payload,
                    };
                    if let Err(e) = log.record(entry).await {
                        tracing::warn!(%request_id, error = %e, "failed to record diagnosis");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "history recorder fell behind, entries dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
