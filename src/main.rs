use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use tokio::sync::watch;
use tracing::{error, info};

use tg_relaybot::courier::TelegramCourier;
use tg_relaybot::resolver::{DestinationResolver, TelegramGateway};
use tg_relaybot::runner::BatchEngine;
use tg_relaybot::source::HttpCatalogSource;
use tg_relaybot::{config, db, handlers, scheduler};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/relaybot.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let bot = Bot::new(cfg.telegram.bot_token.clone());

    let source = Arc::new(HttpCatalogSource::new(
        &cfg.origin.base_url,
        Duration::from_secs(cfg.origin.request_timeout_secs),
    )?);
    let resolver = Arc::new(DestinationResolver::new(Arc::new(TelegramGateway::new(
        bot.clone(),
    ))));
    let courier = Arc::new(TelegramCourier::new(bot.clone()));
    let engine = BatchEngine::new(pool.clone(), source, courier, resolver);

    // Spawn the scheduling loop; the sender side of the channel stays alive
    // until the bot loop exits.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(scheduler::run_scheduler(
        pool.clone(),
        engine.clone(),
        Duration::from_secs(cfg.app.rescan_interval_secs),
        shutdown_rx,
    ));

    let data_dir = cfg.app.data_dir.clone();
    let allowed_users = cfg.telegram.allowed_users.clone();

    info!("starting telegram bot");
    teloxide::repl(bot, move |bot: Bot, msg: Message| {
        let engine = engine.clone();
        let data_dir = data_dir.clone();
        let allowed_users = allowed_users.clone();
        async move {
            if let Err(err) = handlers::handle_update(&bot, &engine, &data_dir, &allowed_users, &msg).await {
                error!(?err, "failed to handle update");
            }
            respond(())
        }
    })
    .await;

    let _ = shutdown_tx.send(true);
    Ok(())
}
