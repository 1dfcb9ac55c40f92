mod binlog;
mod client;
mod clock;
mod config;
mod error;
mod flood;
mod manager;
mod params;
mod query;
mod server;
mod stats;
mod tqueue;
mod updates;
mod upstream;
mod watchdog;
mod webhook;
mod webhook_db;

use std::sync::atomic::AtomicI64;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::binlog::Binlog;
use crate::config::Config;
use crate::manager::spawn_manager;
use crate::params::SharedParams;
use crate::server::{serve_bot_api, serve_stats, ServerState};
use crate::tqueue::TQueue;
use crate::upstream::LoopbackUpstream;
use crate::webhook_db::WebhookDb;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    clock::init();
    // Best-effort .env loading before clap reads the environment.
    let _ = dotenvy::dotenv();

    let config = Config::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_directive()));
    match &config.log {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("can't open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_ansi(false)
                .with_writer(move || file.try_clone().expect("log file handle clone failed"))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }

    config.log_summary();
    if config.api_id.is_none() || config.api_hash.is_none() {
        warn!("TELEGRAM_API_ID / TELEGRAM_API_HASH are not set");
    }

    // ── Working directories ─────────────────────────────────────────────

    std::fs::create_dir_all(&config.dir)
        .with_context(|| format!("can't create working directory {}", config.dir.display()))?;
    let temp_directory = config.temp_directory();
    std::fs::create_dir_all(&temp_directory).with_context(|| {
        format!(
            "can't create temporary directory {}",
            temp_directory.display()
        )
    })?;

    // ── Persistent state ────────────────────────────────────────────────

    let tqueue = {
        let started_at = clock::monotonic_now();
        let (log, records) = Binlog::open(&config.dir.join("tqueue.binlog"))
            .context("can't open tqueue.binlog")?;
        let tqueue = TQueue::with_replay(Some(log), &records);
        info!(
            records = records.len(),
            seconds = clock::monotonic_now() - started_at,
            "queue log replayed"
        );
        Arc::new(tqueue)
    };
    let webhook_db = Arc::new(
        WebhookDb::open(&config.dir.join("webhooks_db.binlog"))
            .context("can't open webhooks_db.binlog")?,
    );

    // ── Upstream transport ──────────────────────────────────────────────
    //
    // The MTProto transport lives behind `UpstreamConnector`; the loopback
    // implementation keeps the server self-contained for development.

    let connector = LoopbackUpstream::new();

    let params = Arc::new(SharedParams {
        tqueue,
        webhook_db,
        connector,
        local_mode: config.local,
        working_directory: config.dir.clone(),
        temp_directory,
        default_max_webhook_connections: config.default_max_webhook_connections(),
        max_webhook_connections_limit: config.max_webhook_connections_limit(),
        max_update_body_size: config.max_update_body_size(),
        webhook_proxy: config.proxy.clone(),
        query_count: Arc::new(AtomicI64::new(0)),
        start_time: clock::monotonic_now(),
    });

    // ── Actors and listeners ────────────────────────────────────────────

    let manager = spawn_manager(params.clone(), config.token_range());
    let state = ServerState {
        params,
        manager: manager.clone(),
    };

    let api_addr = format!("{}:{}", config.http_ip_address, config.http_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("can't bind {api_addr}"))?;
    tokio::spawn(serve_bot_api(api_listener, state.clone()));

    if let Some(stat_port) = config.http_stat_port {
        let stat_addr = format!("{}:{}", config.http_ip_address, stat_port);
        let stat_listener = tokio::net::TcpListener::bind(&stat_addr)
            .await
            .with_context(|| format!("can't bind {stat_addr}"))?;
        tokio::spawn(serve_stats(stat_listener, state.clone()));
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("can't install SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }

    info!("shutting down; a second signal exits immediately");
    tokio::select! {
        _ = manager.close() => info!("clean shutdown complete"),
        _ = tokio::signal::ctrl_c() => {
            warn!("second signal; exiting immediately");
            std::process::exit(1);
        }
        _ = sigterm.recv() => {
            warn!("second signal; exiting immediately");
            std::process::exit(1);
        }
    }

    Ok(())
}
