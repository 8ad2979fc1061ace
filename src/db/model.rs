//! Ledger entity and view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use crate::model::Quality;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A configured batch: one origin catalog tied to one destination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchRecord {
    pub batch_id: String,
    pub batch_name: String,
    pub owner_id: i64,
    pub destination_id: Option<i64>,
    pub quality: Quality,
    pub schedule_time: Option<String>,
    pub caption_style: String,
    pub is_active: bool,
    pub is_paused: bool,
    pub added_at: DateTime<Utc>,
}

/// One successfully delivered item for a (batch, destination) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub batch_id: String,
    pub destination_id: i64,
    pub content_title: String,
    pub content_url: String,
    pub content_hash: String,
    pub content_type: String,
    pub message_ref: Option<i64>,
    pub sent_at: DateTime<Utc>,
}

/// Run cursor for a batch. Exactly one row per batch; counters are per run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchProgress {
    pub batch_id: String,
    pub current_index: i64,
    pub total_items: i64,
    pub items_success: i64,
    pub items_failed: i64,
    pub last_item_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub batch_id: String,
    pub action: String,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Known audit actions. Stored as plain strings so restored documents may
/// carry actions this build does not know about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryAction {
    Registered,
    RunStarted,
    RunCompleted,
    RunPaused,
    RunStopped,
    RunError,
    ItemFailed,
    Restored,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryAction::Registered => "registered",
            HistoryAction::RunStarted => "run_started",
            HistoryAction::RunCompleted => "run_completed",
            HistoryAction::RunPaused => "run_paused",
            HistoryAction::RunStopped => "run_stopped",
            HistoryAction::RunError => "run_error",
            HistoryAction::ItemFailed => "item_failed",
            HistoryAction::Restored => "restored",
        }
    }
}
