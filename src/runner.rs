//! Batch state machine: owns the fetch → diff → deliver → commit loop and the
//! per-batch run registry that gates concurrent starts.

use crate::courier::{Courier, DeliveryError};
use crate::db::{self, HistoryAction, Pool};
use crate::diff;
use crate::model::{ControlSignal, RunPhase};
use crate::resolver::{DestinationError, DestinationResolver};
use crate::source::{CatalogSource, SourceError};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("unknown batch {0}")]
    UnknownBatch(String),
    #[error("destination not configured for batch {0}")]
    DestinationUnset(String),
    #[error(transparent)]
    Destination(#[from] DestinationError),
    #[error(transparent)]
    Origin(#[from] SourceError),
    #[error("destination revoked mid-run: {0}")]
    Revoked(String),
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("batch {0} is already running")]
    AlreadyRunning(String),
    #[error("batch {0} is not running")]
    NotRunning(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Outcome of one run. `phase` is the state the batch lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub phase: RunPhase,
    pub delivered: u64,
    pub failed: u64,
    pub total: usize,
}

/// Execute one run of a batch.
///
/// Destination verification precedes everything; its failure consumes no
/// catalog item. Per-item failures are counted and the loop continues; a
/// destination-invalidating failure aborts the run. Pause/stop signals are
/// honored only at item boundaries, after progress has been committed.
#[instrument(skip_all, fields(batch_id = %batch_id))]
pub async fn run_batch(
    pool: &Pool,
    source: &dyn CatalogSource,
    courier: &dyn Courier,
    resolver: &DestinationResolver,
    batch_id: &str,
    signal: &watch::Receiver<ControlSignal>,
) -> Result<RunReport, RunError> {
    let batch = db::get_batch(pool, batch_id)
        .await?
        .ok_or_else(|| RunError::UnknownBatch(batch_id.to_string()))?;
    let destination_id = batch
        .destination_id
        .ok_or_else(|| RunError::DestinationUnset(batch_id.to_string()))?;

    let run_id = Uuid::new_v4();
    db::append_history(pool, batch_id, HistoryAction::RunStarted, Some(&run_id.to_string())).await?;

    let destination = match resolver.resolve_and_verify(destination_id).await {
        Ok(d) => d,
        Err(err) => {
            db::append_history(pool, batch_id, HistoryAction::RunError, Some(&err.to_string())).await?;
            return Err(err.into());
        }
    };

    let catalog = match source.fetch_catalog(batch_id).await {
        Ok(c) => c,
        Err(err) => {
            db::append_history(pool, batch_id, HistoryAction::RunError, Some(&err.to_string())).await?;
            return Err(err.into());
        }
    };

    let delivered_set = db::delivered_hashes(pool, batch_id, destination_id).await?;
    let delta = diff::compute_delta(&catalog.items, &delivered_set);
    info!(
        catalog = catalog.items.len(),
        pending = delta.len(),
        "computed delivery delta"
    );

    if delta.is_empty() {
        db::append_history(pool, batch_id, HistoryAction::RunCompleted, Some("up to date")).await?;
        return Ok(RunReport {
            phase: RunPhase::Idle,
            delivered: 0,
            failed: 0,
            total: 0,
        });
    }

    db::reset_progress(pool, batch_id, delta.len() as i64).await?;

    let mut delivered = 0u64;
    let mut failed = 0u64;

    for item in &delta {
        let hash = item.content_hash();
        match courier
            .deliver(&destination, item, batch.quality, &item.title)
            .await
        {
            Ok(message_ref) => {
                db::commit_item_success(pool, batch_id, destination_id, item, &hash, Some(message_ref.0))
                    .await?;
                delivered += 1;
            }
            Err(DeliveryError::Revoked(msg)) => {
                db::commit_item_failure(pool, batch_id, &item.url, &msg).await?;
                resolver.invalidate(destination_id).await;
                db::append_history(pool, batch_id, HistoryAction::RunError, Some(&msg)).await?;
                return Err(RunError::Revoked(msg));
            }
            Err(err) => {
                warn!(url = %item.url, %err, "item delivery failed; continuing");
                db::commit_item_failure(pool, batch_id, &item.url, &err.to_string()).await?;
                failed += 1;
            }
        }

        // Signals are observed only here, at item boundaries: an in-flight
        // delivery always completes before the run yields.
        let pending = *signal.borrow();
        match pending {
            ControlSignal::Pause => {
                db::append_history(pool, batch_id, HistoryAction::RunPaused, Some(&run_id.to_string()))
                    .await?;
                info!(delivered, failed, "run paused at item boundary");
                return Ok(RunReport {
                    phase: RunPhase::Paused,
                    delivered,
                    failed,
                    total: delta.len(),
                });
            }
            ControlSignal::Stop => {
                db::append_history(pool, batch_id, HistoryAction::RunStopped, Some(&run_id.to_string()))
                    .await?;
                info!(delivered, failed, "run stopped at item boundary");
                return Ok(RunReport {
                    phase: RunPhase::Stopped,
                    delivered,
                    failed,
                    total: delta.len(),
                });
            }
            ControlSignal::Run => {}
        }
    }

    let summary = format!(
        "run {run_id}: {delivered} delivered, {failed} failed of {}",
        delta.len()
    );
    db::append_history(pool, batch_id, HistoryAction::RunCompleted, Some(&summary)).await?;
    Ok(RunReport {
        phase: RunPhase::Idle,
        delivered,
        failed,
        total: delta.len(),
    })
}

struct RunHandle {
    phase: RunPhase,
    signal: watch::Sender<ControlSignal>,
}

/// Run registry: at most one active run per batch, with pause/stop signalling
/// into the running loop. Distinct batches run concurrently.
#[derive(Clone)]
pub struct BatchEngine {
    pool: Pool,
    source: Arc<dyn CatalogSource>,
    courier: Arc<dyn Courier>,
    resolver: Arc<DestinationResolver>,
    runs: Arc<Mutex<HashMap<String, RunHandle>>>,
}

impl BatchEngine {
    pub fn new(
        pool: Pool,
        source: Arc<dyn CatalogSource>,
        courier: Arc<dyn Courier>,
        resolver: Arc<DestinationResolver>,
    ) -> Self {
        Self {
            pool,
            source,
            courier,
            resolver,
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn resolver(&self) -> &DestinationResolver {
        &self.resolver
    }

    /// Current lifecycle phase of a batch. Batches with no recorded run are
    /// `Idle`.
    pub async fn phase(&self, batch_id: &str) -> RunPhase {
        self.runs
            .lock()
            .await
            .get(batch_id)
            .map(|h| h.phase)
            .unwrap_or(RunPhase::Idle)
    }

    /// Register a batch: validate the id against the origin, store the
    /// configuration row and record the registration.
    pub async fn register_batch(&self, batch_id: &str, owner_id: i64) -> Result<String, RunError> {
        let catalog = self.source.fetch_catalog(batch_id).await?;
        db::upsert_batch(&self.pool, batch_id, &catalog.name, owner_id)
            .await
            .map_err(RunError::Storage)?;
        db::append_history(&self.pool, batch_id, HistoryAction::Registered, Some(&catalog.name))
            .await
            .map_err(RunError::Storage)?;
        Ok(catalog.name)
    }

    /// Start (or resume) a run. Rejected with `AlreadyRunning` when a run is
    /// in flight; `Paused`, `Stopped`, `Error` and `Idle` batches all re-enter
    /// the loop from the last committed state.
    pub async fn start(&self, batch_id: &str) -> Result<(), ControlError> {
        let mut runs = self.runs.lock().await;
        if let Some(handle) = runs.get(batch_id) {
            if handle.phase == RunPhase::Active {
                return Err(ControlError::AlreadyRunning(batch_id.to_string()));
            }
        }
        let (tx, rx) = watch::channel(ControlSignal::Run);
        runs.insert(
            batch_id.to_string(),
            RunHandle {
                phase: RunPhase::Active,
                signal: tx,
            },
        );
        drop(runs);

        let engine = self.clone();
        let batch_id = batch_id.to_string();
        tokio::spawn(async move {
            let result = run_batch(
                &engine.pool,
                engine.source.as_ref(),
                engine.courier.as_ref(),
                engine.resolver.as_ref(),
                &batch_id,
                &rx,
            )
            .await;
            let phase = match &result {
                Ok(report) => {
                    info!(
                        batch_id = %batch_id,
                        delivered = report.delivered,
                        failed = report.failed,
                        phase = report.phase.as_str(),
                        "batch run finished"
                    );
                    report.phase
                }
                Err(err) => {
                    error!(batch_id = %batch_id, %err, "batch run failed");
                    RunPhase::Error
                }
            };
            let mut runs = engine.runs.lock().await;
            if let Some(handle) = runs.get_mut(&batch_id) {
                handle.phase = phase;
            }
        });
        Ok(())
    }

    /// Request a pause at the next item boundary and persist the pause flag
    /// so the scheduler skips the batch until it is resumed.
    pub async fn pause(&self, batch_id: &str) -> Result<(), ControlError> {
        let runs = self.runs.lock().await;
        let handle = runs
            .get(batch_id)
            .filter(|h| h.phase == RunPhase::Active)
            .ok_or_else(|| ControlError::NotRunning(batch_id.to_string()))?;
        let _ = handle.signal.send(ControlSignal::Pause);
        drop(runs);
        db::set_paused(&self.pool, batch_id, true).await?;
        Ok(())
    }

    /// Request a stop at the next item boundary. The cursor is preserved but
    /// the run is considered abandoned.
    pub async fn stop(&self, batch_id: &str) -> Result<(), ControlError> {
        let runs = self.runs.lock().await;
        let handle = runs
            .get(batch_id)
            .filter(|h| h.phase == RunPhase::Active)
            .ok_or_else(|| ControlError::NotRunning(batch_id.to_string()))?;
        let _ = handle.signal.send(ControlSignal::Stop);
        Ok(())
    }

    /// Clear the persisted pause flag and re-enter the run loop.
    pub async fn resume(&self, batch_id: &str) -> Result<(), ControlError> {
        db::set_paused(&self.pool, batch_id, false).await?;
        self.start(batch_id).await
    }
}
