//! Daily scheduler: converts a batch's civil schedule time (fixed IST zone)
//! into absolute UTC wake instants and starts ready batches once per civil
//! day.

use crate::db::{self, Pool};
use crate::model::RunPhase;
use crate::runner::{BatchEngine, ControlError};
use chrono::{DateTime, FixedOffset, NaiveTime, TimeZone, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// The civil zone all schedule times are expressed in: IST, UTC+05:30.
/// A fixed offset, no daylight-saving transitions.
pub fn delivery_zone() -> FixedOffset {
    FixedOffset::east_opt(5 * 3600 + 30 * 60).expect("valid offset")
}

/// Parse operator schedule input: `hh:mm AM/PM` or 24-hour `HH:MM`.
pub fn parse_civil_time(s: &str) -> Option<NaiveTime> {
    let normalized = s.trim().to_ascii_uppercase();
    NaiveTime::parse_from_str(&normalized, "%I:%M %p")
        .or_else(|_| NaiveTime::parse_from_str(&normalized, "%H:%M"))
        .ok()
}

/// Canonical stored form of a schedule time (24-hour `HH:MM`).
pub fn canonical_civil_time(s: &str) -> Option<String> {
    parse_civil_time(s).map(|t| t.format("%H:%M").to_string())
}

/// The next UTC instant, strictly in the future, at which the given civil
/// time occurs in the delivery zone.
pub fn next_fire_utc(civil: NaiveTime, now: DateTime<Utc>) -> DateTime<Utc> {
    let tz = delivery_zone();
    let local_now = now.with_timezone(&tz);

    let mut date = local_now.date_naive();
    let mut fire = tz
        .from_local_datetime(&date.and_time(civil))
        .single()
        .expect("fixed offset is unambiguous");
    if fire <= local_now {
        date = date.succ_opt().expect("date in range");
        fire = tz
            .from_local_datetime(&date.and_time(civil))
            .single()
            .expect("fixed offset is unambiguous");
    }
    fire.with_timezone(&Utc)
}

/// Returns false when the shutdown channel fired (or closed) during the wait.
async fn sleep_or_shutdown(dur: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(dur) => true,
        _ = shutdown.changed() => false,
    }
}

/// Single long-lived scheduling loop.
///
/// Sleeps until the earliest wake instant across scheduled batches (capped at
/// `rescan_interval` so newly added or edited batches are picked up), then
/// starts every due batch that is active and not paused. After firing, the
/// next occurrence is recomputed from the clock rather than advanced by a
/// fixed interval, so no skew accumulates. The wait cancels cleanly through
/// the shutdown channel.
pub async fn run_scheduler(
    pool: Pool,
    engine: BatchEngine,
    rescan_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("scheduler started");
    loop {
        if *shutdown.borrow() {
            info!("scheduler shut down");
            return;
        }

        let now = Utc::now();
        let batches = match db::list_scheduled_batches(&pool).await {
            Ok(batches) => batches,
            Err(err) => {
                warn!(?err, "failed to load scheduled batches");
                if !sleep_or_shutdown(rescan_interval, &mut shutdown).await {
                    return;
                }
                continue;
            }
        };

        let mut fire_at: HashMap<String, DateTime<Utc>> = HashMap::new();
        for batch in &batches {
            let Some(time_str) = batch.schedule_time.as_deref() else {
                continue;
            };
            let Some(civil) = parse_civil_time(time_str) else {
                warn!(batch_id = %batch.batch_id, time_str, "unparsable schedule time");
                continue;
            };
            fire_at.insert(batch.batch_id.clone(), next_fire_utc(civil, now));
        }

        let Some(earliest) = fire_at.values().min().copied() else {
            if !sleep_or_shutdown(rescan_interval, &mut shutdown).await {
                return;
            }
            continue;
        };

        let wait = (earliest - now).to_std().unwrap_or(Duration::ZERO);
        if !sleep_or_shutdown(wait.min(rescan_interval), &mut shutdown).await {
            info!("scheduler shut down");
            return;
        }

        let woke_at = Utc::now();
        for batch in &batches {
            let Some(due) = fire_at.get(&batch.batch_id) else {
                continue;
            };
            if *due > woke_at {
                continue;
            }
            // A paused batch is skipped for the day, never force-resumed.
            if batch.is_paused || engine.phase(&batch.batch_id).await == RunPhase::Paused {
                info!(batch_id = %batch.batch_id, "scheduled batch is paused; skipping");
                continue;
            }
            match engine.start(&batch.batch_id).await {
                Ok(()) => info!(batch_id = %batch.batch_id, "scheduled run started"),
                Err(ControlError::AlreadyRunning(_)) => {
                    info!(batch_id = %batch.batch_id, "scheduled run skipped; already running");
                }
                Err(err) => warn!(batch_id = %batch.batch_id, %err, "scheduled start failed"),
            }
        }
    }
}
