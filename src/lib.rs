//! Historify - OHLCV bar synchronization engine
//!
//! Keeps a local store of market bars current by fetching incremental
//! updates from a kline provider and merging them into DuckDB, with
//! per-series cursors and a job ledger in SQLite.

pub mod config;
pub mod db;
pub mod error;
pub mod providers;
pub mod scheduler;
pub mod services;
pub mod state;
pub mod sync;

use clap::Parser;
use config::Config;
use providers::http::HttpFetcher;
use providers::weekly::WeeklyFetcher;
use providers::FetcherRegistry;
use scheduler::DailySyncScheduler;
use services::SyncService;
use state::AppState;
use std::sync::Arc;
use sync::clock::SystemClock;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "historify=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Run the sync engine until Ctrl-C
pub async fn run() -> anyhow::Result<()> {
    init_tracing();

    tracing::info!("Starting Historify...");

    let config = Config::parse();
    tracing::info!("Provider: {}", config.provider_url);

    let http = Arc::new(HttpFetcher::new(&config.provider_url)?);
    let weekly = WeeklyFetcher::new(http.clone(), Arc::new(SystemClock));
    let fetchers = FetcherRegistry::with_default(Arc::new(weekly));

    // Initialize application state
    let state = Arc::new(AppState::new(&config.data_dir, fetchers)?);

    let service = SyncService::start(Arc::clone(&state.engine));
    for series in &config.series {
        service.register_series(series)?;
    }

    // Start daily sweep scheduler (configurable, default 15:10 Asia/Shanghai)
    let mut scheduler = DailySyncScheduler::new(Arc::clone(&state), service.clone());
    if config.refresh_series {
        scheduler = scheduler.with_series_source(http, config.seed_series());
    }
    let scheduler = scheduler.start();

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down Historify");
    scheduler.abort();

    Ok(())
}
