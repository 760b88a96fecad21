use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use huddle_core::config::{AppConfig, LoadOptions};
use huddle_worker::bootstrap;
use huddle_worker::{spawn_workers, QueuePoller};
use tokio::sync::{mpsc, watch};

fn init_logging(config: &AppConfig) {
    use huddle_core::config::LogFormat;
    use tracing_subscriber::EnvFilter;

    // RUST_LOG, when set, replaces the configured level.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},sqlx=warn", config.logging.level)));
    let builder = tracing_subscriber::fmt().with_target(false).with_env_filter(filter);

    match config.logging.format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let worker = &app.config.worker;

    let (job_tx, job_rx) = mpsc::channel(worker.concurrency.saturating_mul(2).max(1));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let poller = QueuePoller::new(
        Arc::clone(&app.records),
        Duration::from_secs(worker.poll_interval_secs),
        worker.concurrency,
    );
    let poller = tokio::spawn(poller.run(job_tx, shutdown_rx));
    let workers = spawn_workers(Arc::clone(&app.runner), job_rx, worker.concurrency);

    tracing::info!(
        event_name = "system.worker.started",
        concurrency = worker.concurrency,
        poll_interval_secs = worker.poll_interval_secs,
        "huddle-worker started"
    );
    wait_for_shutdown().await?;
    tracing::info!(event_name = "system.worker.stopping", "huddle-worker stopping");

    // Stop claiming, then let in-flight jobs finish.
    let _ = shutdown_tx.send(true);
    poller.await?;
    for handle in workers {
        handle.await?;
    }

    app.db_pool.close().await;
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
