//! Backup/restore codec: snapshots a batch's configuration, ledger, progress
//! and history into a portable JSON document and reconstructs them.

use crate::db::{self, BatchProgress, BatchRecord, DeliveryRecord, HistoryAction, HistoryEntry, Pool};
use crate::resolver::DestinationResolver;
use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument};

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum BackupError {
    /// Validation failed; nothing was written.
    #[error("malformed backup document: {0}")]
    Malformed(String),
    #[error("backup document is for batch {found}, expected {expected}")]
    BatchMismatch { expected: String, found: String },
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// The portable document. Consumers must ignore unknown keys (serde already
/// does), so fields can be added without breaking old readers.
#[derive(Debug, Serialize, Deserialize)]
pub struct BackupDocument {
    #[serde(default)]
    pub format_version: u32,
    pub batch: BatchRecord,
    pub sent_content: Vec<DeliveryRecord>,
    #[serde(default)]
    pub state: Option<BatchProgress>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreSummary {
    pub records: usize,
    pub history_entries: usize,
}

/// Snapshot everything the ledger knows about a batch.
#[instrument(skip_all)]
pub async fn serialize_batch(pool: &Pool, batch_id: &str) -> Result<String> {
    let batch = db::get_batch(pool, batch_id)
        .await?
        .ok_or_else(|| anyhow!("unknown batch {batch_id}"))?;
    let doc = BackupDocument {
        format_version: FORMAT_VERSION,
        sent_content: db::list_deliveries(pool, batch_id).await?,
        state: db::get_progress(pool, batch_id).await?,
        history: db::list_history(pool, batch_id).await?,
        batch,
    };
    Ok(serde_json::to_string_pretty(&doc)?)
}

/// Reconstruct a batch from a document.
///
/// The whole document is validated before any write. Application is a single
/// transaction: config upserted, delivery records bulk-replaced (so their
/// hashes are immediately visible to the diff), progress restored verbatim,
/// history appended. The resolver cache entry for the batch's destination is
/// invalidated afterwards — a restored destination id has not been verified
/// in this session.
#[instrument(skip_all)]
pub async fn restore_batch(
    pool: &Pool,
    resolver: &DestinationResolver,
    raw: &str,
    expected_batch_id: Option<&str>,
) -> Result<RestoreSummary, BackupError> {
    let doc: BackupDocument =
        serde_json::from_str(raw).map_err(|e| BackupError::Malformed(e.to_string()))?;
    let batch_id = doc.batch.batch_id.trim().to_string();
    if batch_id.is_empty() {
        return Err(BackupError::Malformed("empty batch id".into()));
    }
    if let Some(expected) = expected_batch_id {
        if expected != batch_id {
            return Err(BackupError::BatchMismatch {
                expected: expected.to_string(),
                found: batch_id,
            });
        }
    }

    let mut tx = pool.begin().await?;

    let b = &doc.batch;
    sqlx::query(
        "INSERT OR REPLACE INTO batches \
         (batch_id, batch_name, owner_id, destination_id, quality, schedule_time, caption_style, is_active, is_paused, added_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&batch_id)
    .bind(&b.batch_name)
    .bind(b.owner_id)
    .bind(b.destination_id)
    .bind(b.quality.as_str())
    .bind(&b.schedule_time)
    .bind(&b.caption_style)
    .bind(b.is_active)
    .bind(b.is_paused)
    .bind(b.added_at)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM sent_content WHERE batch_id = ?")
        .bind(&batch_id)
        .execute(&mut *tx)
        .await?;
    for rec in &doc.sent_content {
        sqlx::query(
            "INSERT OR REPLACE INTO sent_content \
             (batch_id, destination_id, content_title, content_url, content_hash, content_type, message_ref, sent_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&batch_id)
        .bind(rec.destination_id)
        .bind(&rec.content_title)
        .bind(&rec.content_url)
        .bind(&rec.content_hash)
        .bind(&rec.content_type)
        .bind(rec.message_ref)
        .bind(rec.sent_at)
        .execute(&mut *tx)
        .await?;
    }

    if let Some(state) = &doc.state {
        sqlx::query(
            "INSERT OR REPLACE INTO batch_progress \
             (batch_id, current_index, total_items, items_success, items_failed, last_item_url, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&batch_id)
        .bind(state.current_index)
        .bind(state.total_items)
        .bind(state.items_success)
        .bind(state.items_failed)
        .bind(&state.last_item_url)
        .bind(state.updated_at)
        .execute(&mut *tx)
        .await?;
    }

    for entry in &doc.history {
        sqlx::query(
            "INSERT INTO processing_history (batch_id, action, details, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&batch_id)
        .bind(&entry.action)
        .bind(&entry.details)
        .bind(entry.created_at)
        .execute(&mut *tx)
        .await?;
    }
    sqlx::query(
        "INSERT INTO processing_history (batch_id, action, details, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(&batch_id)
    .bind(HistoryAction::Restored.as_str())
    .bind(format!("{} records", doc.sent_content.len()))
    .bind(Utc::now())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    if let Some(destination_id) = b.destination_id {
        resolver.invalidate(destination_id).await;
    }
    info!(batch_id = %batch_id, records = doc.sent_content.len(), "batch restored");

    Ok(RestoreSummary {
        records: doc.sent_content.len(),
        history_entries: doc.history.len(),
    })
}
