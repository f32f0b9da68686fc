//! Standalone queue maintenance process.
//!
//! Runs the reaper, the incomplete-pipeline sweep, history cleanup and the
//! queue status publisher against the database in `DATABASE_URL` until
//! interrupted. Connection pool health is logged on the status interval.

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tickerq_db::{Database, EventBus, PoolConfig};
use tickerq_jobs::{MaintenanceConfig, MaintenanceScheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter (default: "tickerq_jobs=info,tickerq_db=info")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "tickerq_jobs=info,tickerq_db=info".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("tickerq-maintenance.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool_config = PoolConfig::from_env();
    let events = EventBus::default();

    let db = Database::connect_with_config(&database_url, pool_config)
        .await
        .context("failed to connect to database")?
        .with_events(events.clone());
    db.migrate().await.context("failed to run migrations")?;
    info!("Database ready");

    let config = MaintenanceConfig::from_env();
    let status_interval = config.status_interval;
    let scheduler = MaintenanceScheduler::new(
        std::sync::Arc::new(db.jobs.clone()),
        std::sync::Arc::new(db.phases.clone()),
        config,
    )
    .with_events(events);

    let report = scheduler.run_once().await?;
    info!(
        reaped = report.reaped,
        requeued = report.requeued,
        cleaned = report.cleaned,
        "Startup maintenance pass finished"
    );

    let handle = scheduler.start();

    let mut health_tick = tokio::time::interval(status_interval);
    health_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            signal = &mut shutdown => {
                signal.context("failed to listen for shutdown signal")?;
                break;
            }
            _ = health_tick.tick() => db.pool_health().log(),
        }
    }
    info!("Shutdown signal received");
    handle.shutdown().await?;

    Ok(())
}
