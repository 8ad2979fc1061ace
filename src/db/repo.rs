use super::model::{BatchProgress, BatchRecord, DeliveryRecord, HistoryAction, HistoryEntry};
use crate::model::{CatalogItem, Quality};
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow, SqliteSynchronous};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::HashSet;
use std::str::FromStr;
use tracing::instrument;

pub type Pool = SqlitePool;

/// Open the ledger database with WAL journaling and full fsync durability.
/// A missing file-backed database (and its directory) is created on first
/// connect.
pub async fn init_pool(database_url: &str) -> Result<Pool> {
    ensure_parent_dir(database_url);
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);
    let pool = SqlitePool::connect_with(options).await?;
    Ok(pool)
}

/// SQLite creates a missing database file but not missing directories; cover
/// the directory half for file-backed URLs. In-memory URLs pass through.
fn ensure_parent_dir(database_url: &str) {
    let Some(rest) = database_url.strip_prefix("sqlite://") else {
        return;
    };
    let path = rest.split('?').next().unwrap_or(rest);
    if path.is_empty() || path.starts_with(':') {
        return;
    }
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn map_batch(row: &SqliteRow) -> BatchRecord {
    let quality: String = row.get("quality");
    BatchRecord {
        batch_id: row.get("batch_id"),
        batch_name: row.get("batch_name"),
        owner_id: row.get("owner_id"),
        destination_id: row.get("destination_id"),
        quality: Quality::parse(&quality).unwrap_or_default(),
        schedule_time: row.get("schedule_time"),
        caption_style: row.get("caption_style"),
        is_active: row.get("is_active"),
        is_paused: row.get("is_paused"),
        added_at: row.get("added_at"),
    }
}

const BATCH_COLUMNS: &str = "batch_id, batch_name, owner_id, destination_id, quality, \
     schedule_time, caption_style, is_active, is_paused, added_at";

/// Register a batch, keeping existing settings when the id is already known.
#[instrument(skip_all)]
pub async fn upsert_batch(pool: &Pool, batch_id: &str, batch_name: &str, owner_id: i64) -> Result<()> {
    sqlx::query(
        "INSERT INTO batches (batch_id, batch_name, owner_id, added_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT(batch_id) DO UPDATE SET batch_name = excluded.batch_name",
    )
    .bind(batch_id)
    .bind(batch_name)
    .bind(owner_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_batch(pool: &Pool, batch_id: &str) -> Result<Option<BatchRecord>> {
    let row = sqlx::query(&format!("SELECT {BATCH_COLUMNS} FROM batches WHERE batch_id = ?"))
        .bind(batch_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(map_batch))
}

#[instrument(skip_all)]
pub async fn list_batches_for_owner(pool: &Pool, owner_id: i64) -> Result<Vec<BatchRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT {BATCH_COLUMNS} FROM batches WHERE owner_id = ? ORDER BY added_at DESC"
    ))
    .bind(owner_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(map_batch).collect())
}

/// Batches the scheduler considers: active, with a schedule configured.
#[instrument(skip_all)]
pub async fn list_scheduled_batches(pool: &Pool) -> Result<Vec<BatchRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT {BATCH_COLUMNS} FROM batches \
         WHERE is_active = 1 AND schedule_time IS NOT NULL"
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(map_batch).collect())
}

#[instrument(skip_all)]
pub async fn set_destination(pool: &Pool, batch_id: &str, destination_id: i64) -> Result<()> {
    sqlx::query("UPDATE batches SET destination_id = ? WHERE batch_id = ?")
        .bind(destination_id)
        .bind(batch_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn set_quality(pool: &Pool, batch_id: &str, quality: Quality) -> Result<()> {
    sqlx::query("UPDATE batches SET quality = ? WHERE batch_id = ?")
        .bind(quality.as_str())
        .bind(batch_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn set_schedule_time(pool: &Pool, batch_id: &str, schedule_time: &str) -> Result<()> {
    sqlx::query("UPDATE batches SET schedule_time = ? WHERE batch_id = ?")
        .bind(schedule_time)
        .bind(batch_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn set_caption_style(pool: &Pool, batch_id: &str, style: &str) -> Result<()> {
    sqlx::query("UPDATE batches SET caption_style = ? WHERE batch_id = ?")
        .bind(style)
        .bind(batch_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn set_active(pool: &Pool, batch_id: &str, active: bool) -> Result<()> {
    sqlx::query("UPDATE batches SET is_active = ? WHERE batch_id = ?")
        .bind(active)
        .bind(batch_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn set_paused(pool: &Pool, batch_id: &str, paused: bool) -> Result<()> {
    sqlx::query("UPDATE batches SET is_paused = ? WHERE batch_id = ?")
        .bind(paused)
        .bind(batch_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Remove a batch and everything the ledger knows about it.
#[instrument(skip_all)]
pub async fn remove_batch(pool: &Pool, batch_id: &str) -> Result<()> {
    let mut tx = pool.begin().await?;
    for stmt in [
        "DELETE FROM sent_content WHERE batch_id = ?",
        "DELETE FROM batch_progress WHERE batch_id = ?",
        "DELETE FROM processing_history WHERE batch_id = ?",
        "DELETE FROM batches WHERE batch_id = ?",
    ] {
        sqlx::query(stmt).bind(batch_id).execute(&mut *tx).await?;
    }
    tx.commit().await?;
    Ok(())
}

/// All delivered hashes for a (batch, destination) pair. This is the ledger
/// side of the diff: membership is O(1) against the returned set.
#[instrument(skip_all)]
pub async fn delivered_hashes(pool: &Pool, batch_id: &str, destination_id: i64) -> Result<HashSet<String>> {
    let hashes: Vec<String> = sqlx::query_scalar(
        "SELECT content_hash FROM sent_content WHERE batch_id = ? AND destination_id = ?",
    )
    .bind(batch_id)
    .bind(destination_id)
    .fetch_all(pool)
    .await?;
    Ok(hashes.into_iter().collect())
}

#[instrument(skip_all)]
pub async fn list_deliveries(pool: &Pool, batch_id: &str) -> Result<Vec<DeliveryRecord>> {
    let rows = sqlx::query(
        "SELECT batch_id, destination_id, content_title, content_url, content_hash, \
                content_type, message_ref, sent_at \
         FROM sent_content WHERE batch_id = ? ORDER BY sent_at, id",
    )
    .bind(batch_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(map_delivery).collect())
}

fn map_delivery(row: &SqliteRow) -> DeliveryRecord {
    DeliveryRecord {
        batch_id: row.get("batch_id"),
        destination_id: row.get("destination_id"),
        content_title: row.get("content_title"),
        content_url: row.get("content_url"),
        content_hash: row.get("content_hash"),
        content_type: row.get("content_type"),
        message_ref: row.get("message_ref"),
        sent_at: row.get("sent_at"),
    }
}

#[instrument(skip_all)]
pub async fn count_deliveries(pool: &Pool, batch_id: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sent_content WHERE batch_id = ?")
        .bind(batch_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Reset the run cursor at the start of a run over a freshly computed delta.
#[instrument(skip_all)]
pub async fn reset_progress(pool: &Pool, batch_id: &str, total_items: i64) -> Result<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO batch_progress \
         (batch_id, current_index, total_items, items_success, items_failed, last_item_url, updated_at) \
         VALUES (?, 0, ?, 0, 0, NULL, ?)",
    )
    .bind(batch_id)
    .bind(total_items)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_progress(pool: &Pool, batch_id: &str) -> Result<Option<BatchProgress>> {
    let row = sqlx::query(
        "SELECT batch_id, current_index, total_items, items_success, items_failed, \
                last_item_url, updated_at \
         FROM batch_progress WHERE batch_id = ?",
    )
    .bind(batch_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| BatchProgress {
        batch_id: row.get("batch_id"),
        current_index: row.get("current_index"),
        total_items: row.get("total_items"),
        items_success: row.get("items_success"),
        items_failed: row.get("items_failed"),
        last_item_url: row.get("last_item_url"),
        updated_at: row.get("updated_at"),
    }))
}

/// Record a delivered item and advance the cursor in one transaction.
/// The hash uniqueness turns an accidental duplicate into a row replace,
/// never a second record.
#[instrument(skip_all)]
pub async fn commit_item_success(
    pool: &Pool,
    batch_id: &str,
    destination_id: i64,
    item: &CatalogItem,
    content_hash: &str,
    message_ref: Option<i64>,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT OR REPLACE INTO sent_content \
         (batch_id, destination_id, content_title, content_url, content_hash, content_type, message_ref, sent_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(batch_id)
    .bind(destination_id)
    .bind(&item.title)
    .bind(&item.url)
    .bind(content_hash)
    .bind(item.kind.as_str())
    .bind(message_ref)
    .bind(Utc::now())
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "UPDATE batch_progress SET current_index = current_index + 1, \
         items_success = items_success + 1, last_item_url = ?, updated_at = ? \
         WHERE batch_id = ?",
    )
    .bind(&item.url)
    .bind(Utc::now())
    .bind(batch_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Advance the cursor past a failed item and log it. No delivery record is
/// written, so the item reappears in the next run's delta.
#[instrument(skip_all)]
pub async fn commit_item_failure(pool: &Pool, batch_id: &str, item_url: &str, error: &str) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "UPDATE batch_progress SET current_index = current_index + 1, \
         items_failed = items_failed + 1, last_item_url = ?, updated_at = ? \
         WHERE batch_id = ?",
    )
    .bind(item_url)
    .bind(Utc::now())
    .bind(batch_id)
    .execute(&mut *tx)
    .await?;
    append_history_tx(&mut tx, batch_id, HistoryAction::ItemFailed.as_str(), Some(error), Utc::now()).await?;
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn append_history(pool: &Pool, batch_id: &str, action: HistoryAction, details: Option<&str>) -> Result<()> {
    let mut tx = pool.begin().await?;
    append_history_tx(&mut tx, batch_id, action.as_str(), details, Utc::now()).await?;
    tx.commit().await?;
    Ok(())
}

pub(crate) async fn append_history_tx(
    tx: &mut Transaction<'_, Sqlite>,
    batch_id: &str,
    action: &str,
    details: Option<&str>,
    created_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("INSERT INTO processing_history (batch_id, action, details, created_at) VALUES (?, ?, ?, ?)")
        .bind(batch_id)
        .bind(action)
        .bind(details)
        .bind(created_at)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn list_history(pool: &Pool, batch_id: &str) -> Result<Vec<HistoryEntry>> {
    let rows = sqlx::query(
        "SELECT batch_id, action, details, created_at FROM processing_history \
         WHERE batch_id = ? ORDER BY created_at, id",
    )
    .bind(batch_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| HistoryEntry {
            batch_id: row.get("batch_id"),
            action: row.get("action"),
            details: row.get("details"),
            created_at: row.get("created_at"),
        })
        .collect())
}
