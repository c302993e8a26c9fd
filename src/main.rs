mod backend;
mod change_feed;
mod config;
mod dashboard;
mod engine;
mod error;
mod gateway;
mod journal;
mod reconciler;
mod state_store;
mod stats;
mod status_poller;
mod types;
mod utils;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;

use crate::{
    backend::{HttpBackend, TradingBackend},
    change_feed::ChangeFeedSource,
    config::Settings,
    engine::Engine,
    gateway::CommandGateway,
    journal::Journal,
    status_poller::RemoteStatusSource,
    utils::now_ts,
};

#[derive(Debug, Parser)]
#[command(name = "dashsync", version)]
struct Cli {
    /// Override BACKEND_URL
    #[arg(long)]
    backend_url: Option<String>,

    /// Do not serve the JSON API
    #[arg(long)]
    no_dashboard: bool,

    /// Poll only; skip the realtime change feed
    #[arg(long)]
    no_feed: bool,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let mut settings = Settings::load()?;
    if let Some(url) = cli.backend_url {
        settings.backend_url = url.trim().to_string();
    }
    if cli.no_dashboard {
        settings.dashboard_enabled = false;
    }
    if cli.no_feed {
        settings.feed_enabled = false;
    }
    settings.validate()?;

    let journal = Journal::new(&settings.sqlite_path)?;
    journal.init_db()?;

    let http = HttpBackend::new(&settings.backend_url, &settings.api_key, settings.http_timeout())?;
    log::info!(
        "app.start backend={} user_id={} poll_secs={} feed={} sqlite={}",
        http.base_url(),
        settings.user_id,
        settings.poll_interval_secs,
        settings.feed_active(),
        journal.path()
    );
    let backend: Arc<dyn TradingBackend> = Arc::new(http);

    let (engine, handle) = Engine::new(
        settings.reconciler(),
        backend.clone(),
        Some(journal.clone()),
        &settings.user_id,
    );
    let engine_task = tokio::spawn(engine.run());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    RemoteStatusSource::new(backend.clone(), settings.poll_interval(), handle.refresh_notify())
        .spawn(handle.sender(), shutdown_rx.clone());

    if settings.feed_active() {
        ChangeFeedSource::new(&settings).spawn(handle.sender(), shutdown_rx.clone());
    } else {
        log::warn!("feed.disabled polling only");
        journal
            .upsert_runtime_status("feed", "warn", "disabled", None, now_ts())
            .ok();
    }

    let gateway = CommandGateway::new(handle.clone(), backend, &settings.user_id);

    if settings.dashboard_enabled {
        let st = settings.clone();
        let db = journal.clone();
        let gw = gateway.clone();
        tokio::spawn(async move {
            if let Err(e) = dashboard::serve_dashboard(st, gw, db).await {
                log::error!("dashboard.error {:#}", e);
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    log::info!("app.shutdown");
    shutdown_tx.send(true).ok();
    handle.shutdown().await;
    engine_task.await.ok();
    Ok(())
}
