//! Operator command surface. Each command maps 1:1 onto an engine or codec
//! entry point; there is deliberately no conversational menu here.

use crate::backup;
use crate::db;
use crate::model::Quality;
use crate::resolver::extract_destination_id;
use crate::runner::BatchEngine;
use crate::scheduler::canonical_civil_time;
use crate::source::is_valid_batch_id;
use anyhow::Result;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::InputFile;
use tracing::{info, instrument, warn};

const HELP: &str = "Commands:\n\
/add <batch_id> - register a catalog\n\
/batches - list your batches\n\
/setchat <batch_id> <channel_id> - set the destination\n\
/settime <batch_id> <hh:mm AM/PM> - set the daily schedule (IST)\n\
/setquality <batch_id> <480p|720p|1080p>\n\
/setstyle <batch_id> <style> - caption template id\n\
/toggle <batch_id> - activate or deactivate scheduling\n\
/remove <batch_id> - delete a batch and its ledger\n\
/run <batch_id> - start a delivery run now\n\
/pause <batch_id> - pause at the next item\n\
/resume <batch_id> - resume a paused or failed run\n\
/stop <batch_id> - stop at the next item\n\
/status <batch_id>\n\
/backup <batch_id> - receive a JSON backup\n\
/restore <batch_id> - attach a backup file with this caption";

#[instrument(skip_all)]
pub async fn handle_update(
    bot: &Bot,
    engine: &BatchEngine,
    data_dir: &str,
    allowed_users: &[i64],
    msg: &Message,
) -> Result<()> {
    let user = match msg.from() {
        Some(u) => u,
        None => return Ok(()),
    };
    let user_id = user.id.0 as i64;
    if !allowed_users.contains(&user_id) {
        info!(user_id, "ignoring message from unknown user");
        return Ok(());
    }

    let text = match msg.text().or_else(|| msg.caption()) {
        Some(t) => t.trim().to_owned(),
        None => return Ok(()),
    };

    let mut parts = text.split_whitespace();
    let command = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();

    match command {
        "/start" | "/help" => {
            let _ = bot.send_message(msg.chat.id, HELP).await;
        }
        "/ping" => {
            let _ = bot.send_message(msg.chat.id, "PONG").await;
        }
        "/add" => handle_add(bot, engine, msg, user_id, &args).await,
        "/batches" => handle_list(bot, engine, msg, user_id).await,
        "/setchat" => handle_set_chat(bot, engine, msg, &args).await,
        "/settime" => handle_set_time(bot, engine, msg, &args).await,
        "/setquality" => handle_set_quality(bot, engine, msg, &args).await,
        "/setstyle" => handle_set_style(bot, engine, msg, &args).await,
        "/toggle" => handle_toggle(bot, engine, msg, &args).await,
        "/remove" => handle_remove(bot, engine, msg, &args).await,
        "/run" | "/resume" => handle_start(bot, engine, msg, &args, command == "/resume").await,
        "/pause" => handle_pause(bot, engine, msg, &args).await,
        "/stop" => handle_stop(bot, engine, msg, &args).await,
        "/status" => handle_status(bot, engine, msg, &args).await,
        "/backup" => handle_backup(bot, engine, msg, &args).await,
        "/restore" => handle_restore(bot, engine, data_dir, msg, user_id, &args).await,
        _ if command.starts_with('/') => {
            let _ = bot.send_message(msg.chat.id, "Unknown command. /help").await;
        }
        _ => {}
    }

    Ok(())
}

fn first_arg<'a>(args: &[&'a str]) -> Option<&'a str> {
    args.first().copied()
}

async fn handle_add(bot: &Bot, engine: &BatchEngine, msg: &Message, user_id: i64, args: &[&str]) {
    let Some(batch_id) = first_arg(args) else {
        let _ = bot.send_message(msg.chat.id, "Usage: /add <batch_id>").await;
        return;
    };
    if !is_valid_batch_id(batch_id) {
        let _ = bot
            .send_message(msg.chat.id, "Invalid batch id: expected a 24-character token.")
            .await;
        return;
    }
    match engine.register_batch(batch_id, user_id).await {
        Ok(name) => {
            let _ = bot
                .send_message(msg.chat.id, format!("Registered batch: {name}"))
                .await;
        }
        Err(err) => {
            warn!(?err, "failed to register batch");
            let _ = bot.send_message(msg.chat.id, format!("Failed: {err}")).await;
        }
    }
}

async fn handle_list(bot: &Bot, engine: &BatchEngine, msg: &Message, user_id: i64) {
    match db::list_batches_for_owner(engine.pool(), user_id).await {
        Ok(batches) if batches.is_empty() => {
            let _ = bot.send_message(msg.chat.id, "No batches registered.").await;
        }
        Ok(batches) => {
            let lines: Vec<String> = batches
                .iter()
                .map(|b| {
                    let state = if b.is_paused {
                        "paused"
                    } else if b.is_active {
                        "active"
                    } else {
                        "inactive"
                    };
                    format!("{} - {} ({state})", b.batch_id, b.batch_name)
                })
                .collect();
            let _ = bot.send_message(msg.chat.id, lines.join("\n")).await;
        }
        Err(err) => warn!(?err, "failed to list batches"),
    }
}

async fn handle_set_chat(bot: &Bot, engine: &BatchEngine, msg: &Message, args: &[&str]) {
    let (Some(batch_id), Some(raw)) = (args.first().copied(), args.get(1).copied()) else {
        let _ = bot
            .send_message(msg.chat.id, "Usage: /setchat <batch_id> <channel_id>")
            .await;
        return;
    };
    let Some(destination_id) = extract_destination_id(raw) else {
        let _ = bot
            .send_message(msg.chat.id, "Invalid channel id. Use the -100… form or a t.me/c/ link.")
            .await;
        return;
    };
    if let Err(err) = db::set_destination(engine.pool(), batch_id, destination_id).await {
        warn!(?err, "failed to set destination");
        return;
    }
    let _ = bot
        .send_message(
            msg.chat.id,
            format!("Destination set to {destination_id}. Access is verified on the next run."),
        )
        .await;
}

async fn handle_set_time(bot: &Bot, engine: &BatchEngine, msg: &Message, args: &[&str]) {
    let Some(batch_id) = first_arg(args) else {
        let _ = bot
            .send_message(msg.chat.id, "Usage: /settime <batch_id> <hh:mm AM/PM>")
            .await;
        return;
    };
    let raw = args[1..].join(" ");
    let Some(canonical) = canonical_civil_time(&raw) else {
        let _ = bot
            .send_message(msg.chat.id, "Invalid time. Use e.g. 09:00 AM")
            .await;
        return;
    };
    if let Err(err) = db::set_schedule_time(engine.pool(), batch_id, &canonical).await {
        warn!(?err, "failed to set schedule time");
        return;
    }
    let _ = bot
        .send_message(msg.chat.id, format!("Scheduled daily at {canonical} IST."))
        .await;
}

async fn handle_set_quality(bot: &Bot, engine: &BatchEngine, msg: &Message, args: &[&str]) {
    let (Some(batch_id), Some(raw)) = (args.first().copied(), args.get(1).copied()) else {
        let _ = bot
            .send_message(msg.chat.id, "Usage: /setquality <batch_id> <480p|720p|1080p>")
            .await;
        return;
    };
    let Some(quality) = Quality::parse(raw) else {
        let _ = bot
            .send_message(msg.chat.id, "Quality must be 480p, 720p or 1080p.")
            .await;
        return;
    };
    if let Err(err) = db::set_quality(engine.pool(), batch_id, quality).await {
        warn!(?err, "failed to set quality");
        return;
    }
    let _ = bot
        .send_message(msg.chat.id, format!("Quality set to {}.", quality.as_str()))
        .await;
}

async fn handle_set_style(bot: &Bot, engine: &BatchEngine, msg: &Message, args: &[&str]) {
    let (Some(batch_id), Some(style)) = (args.first().copied(), args.get(1).copied()) else {
        let _ = bot
            .send_message(msg.chat.id, "Usage: /setstyle <batch_id> <style>")
            .await;
        return;
    };
    if let Err(err) = db::set_caption_style(engine.pool(), batch_id, style).await {
        warn!(?err, "failed to set caption style");
        return;
    }
    let _ = bot
        .send_message(msg.chat.id, format!("Caption style set to {style}."))
        .await;
}

async fn handle_toggle(bot: &Bot, engine: &BatchEngine, msg: &Message, args: &[&str]) {
    let Some(batch_id) = first_arg(args) else {
        let _ = bot.send_message(msg.chat.id, "Usage: /toggle <batch_id>").await;
        return;
    };
    let batch = match db::get_batch(engine.pool(), batch_id).await {
        Ok(Some(b)) => b,
        Ok(None) => {
            let _ = bot.send_message(msg.chat.id, "Unknown batch.").await;
            return;
        }
        Err(err) => {
            warn!(?err, "failed to load batch");
            return;
        }
    };
    let now_active = !batch.is_active;
    if let Err(err) = db::set_active(engine.pool(), batch_id, now_active).await {
        warn!(?err, "failed to toggle batch");
        return;
    }
    let state = if now_active { "active" } else { "inactive" };
    let _ = bot
        .send_message(msg.chat.id, format!("Batch is now {state}."))
        .await;
}

async fn handle_remove(bot: &Bot, engine: &BatchEngine, msg: &Message, args: &[&str]) {
    let Some(batch_id) = first_arg(args) else {
        let _ = bot.send_message(msg.chat.id, "Usage: /remove <batch_id>").await;
        return;
    };
    if let Err(err) = db::remove_batch(engine.pool(), batch_id).await {
        warn!(?err, "failed to remove batch");
        let _ = bot.send_message(msg.chat.id, "Remove failed.").await;
        return;
    }
    let _ = bot
        .send_message(msg.chat.id, "Batch and its delivery ledger removed.")
        .await;
}

async fn handle_start(bot: &Bot, engine: &BatchEngine, msg: &Message, args: &[&str], resume: bool) {
    let Some(batch_id) = first_arg(args) else {
        let _ = bot.send_message(msg.chat.id, "Usage: /run <batch_id>").await;
        return;
    };
    let result = if resume {
        engine.resume(batch_id).await
    } else {
        engine.start(batch_id).await
    };
    match result {
        Ok(()) => {
            let _ = bot.send_message(msg.chat.id, "Run started.").await;
        }
        Err(err) => {
            let _ = bot.send_message(msg.chat.id, format!("{err}")).await;
        }
    }
}

async fn handle_pause(bot: &Bot, engine: &BatchEngine, msg: &Message, args: &[&str]) {
    let Some(batch_id) = first_arg(args) else {
        let _ = bot.send_message(msg.chat.id, "Usage: /pause <batch_id>").await;
        return;
    };
    match engine.pause(batch_id).await {
        Ok(()) => {
            let _ = bot
                .send_message(msg.chat.id, "Pausing after the current item.")
                .await;
        }
        Err(err) => {
            let _ = bot.send_message(msg.chat.id, format!("{err}")).await;
        }
    }
}

async fn handle_stop(bot: &Bot, engine: &BatchEngine, msg: &Message, args: &[&str]) {
    let Some(batch_id) = first_arg(args) else {
        let _ = bot.send_message(msg.chat.id, "Usage: /stop <batch_id>").await;
        return;
    };
    match engine.stop(batch_id).await {
        Ok(()) => {
            let _ = bot
                .send_message(msg.chat.id, "Stopping after the current item.")
                .await;
        }
        Err(err) => {
            let _ = bot.send_message(msg.chat.id, format!("{err}")).await;
        }
    }
}

async fn handle_status(bot: &Bot, engine: &BatchEngine, msg: &Message, args: &[&str]) {
    let Some(batch_id) = first_arg(args) else {
        let _ = bot.send_message(msg.chat.id, "Usage: /status <batch_id>").await;
        return;
    };
    let batch = match db::get_batch(engine.pool(), batch_id).await {
        Ok(Some(b)) => b,
        Ok(None) => {
            let _ = bot.send_message(msg.chat.id, "Unknown batch.").await;
            return;
        }
        Err(err) => {
            warn!(?err, "failed to load batch");
            return;
        }
    };
    let delivered = db::count_deliveries(engine.pool(), batch_id).await.unwrap_or(0);
    let progress = db::get_progress(engine.pool(), batch_id).await.ok().flatten();
    let phase = engine.phase(batch_id).await;

    let mut lines = vec![
        batch.batch_name.clone(),
        format!("phase: {}", phase.as_str()),
        format!(
            "destination: {}",
            batch
                .destination_id
                .map(|d| d.to_string())
                .unwrap_or_else(|| "not set".into())
        ),
        format!("quality: {}", batch.quality.as_str()),
        format!(
            "schedule: {} IST",
            batch.schedule_time.as_deref().unwrap_or("not set")
        ),
        format!("delivered: {delivered}"),
    ];
    if let Some(p) = progress {
        lines.push(format!(
            "last run: {}/{} ({} ok, {} failed)",
            p.current_index, p.total_items, p.items_success, p.items_failed
        ));
    }
    let _ = bot.send_message(msg.chat.id, lines.join("\n")).await;
}

async fn handle_backup(bot: &Bot, engine: &BatchEngine, msg: &Message, args: &[&str]) {
    let Some(batch_id) = first_arg(args) else {
        let _ = bot.send_message(msg.chat.id, "Usage: /backup <batch_id>").await;
        return;
    };
    match backup::serialize_batch(engine.pool(), batch_id).await {
        Ok(doc) => {
            let file = InputFile::memory(doc.into_bytes())
                .file_name(format!("{batch_id}_backup.json"));
            if let Err(err) = bot.send_document(msg.chat.id, file).await {
                warn!(?err, "failed to send backup document");
            }
        }
        Err(err) => {
            warn!(?err, "failed to serialize backup");
            let _ = bot.send_message(msg.chat.id, format!("Backup failed: {err}")).await;
        }
    }
}

async fn handle_restore(
    bot: &Bot,
    engine: &BatchEngine,
    data_dir: &str,
    msg: &Message,
    user_id: i64,
    args: &[&str],
) {
    let Some(document) = msg.document() else {
        let _ = bot
            .send_message(
                msg.chat.id,
                "Attach the backup JSON file with the caption /restore <batch_id>.",
            )
            .await;
        return;
    };
    let expected = first_arg(args);

    let raw = match download_text(bot, data_dir, user_id, document.file.id.as_ref()).await {
        Ok(raw) => raw,
        Err(err) => {
            warn!(?err, "failed to download backup document");
            let _ = bot.send_message(msg.chat.id, "Could not download the file.").await;
            return;
        }
    };

    match backup::restore_batch(engine.pool(), engine.resolver(), &raw, expected).await {
        Ok(summary) => {
            let _ = bot
                .send_message(
                    msg.chat.id,
                    format!(
                        "Restore complete: {} records, {} history entries. The destination will be re-verified on the next run.",
                        summary.records, summary.history_entries
                    ),
                )
                .await;
        }
        Err(err) => {
            let _ = bot.send_message(msg.chat.id, format!("Restore failed: {err}")).await;
        }
    }
}

/// Fetch a document from Telegram into a string, via a scratch file under the
/// data dir.
async fn download_text(bot: &Bot, data_dir: &str, user_id: i64, file_id: &str) -> Result<String> {
    let file = bot.get_file(file_id).await?;
    let dir = format!("{data_dir}/incoming/{user_id}/");
    tokio::fs::create_dir_all(&dir).await.ok();
    let path = format!("{dir}{}.json", file.meta.unique_id);
    let mut dst = tokio::fs::File::create(&path).await?;
    bot.download_file(&file.path, &mut dst).await?;
    drop(dst);
    let content = tokio::fs::read_to_string(&path).await?;
    tokio::fs::remove_file(&path).await.ok();
    Ok(content)
}
