//! dutybot
//!
//! Runs the weekly duty worker against Postgres, or against the in-memory
//! store when no database is configured.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dutybot_rotation::{
    config::Config,
    notifier::LogNotifier,
    rotation::RotationEngine,
    store::{Database, MemoryStore, Storage},
    worker::DutyWorker,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to DUTYBOT_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        weekday = %config.schedule.weekday(),
        tick_secs = config.tick_interval.as_secs(),
        max_attempts = config.engine.retry.max_attempts,
        "Starting dutybot"
    );

    match &config.database {
        Some(db_config) => {
            let db = match Database::connect(db_config).await {
                Ok(db) => db,
                Err(e) => {
                    error!(error = %e, "Failed to connect to database");
                    return Err(e.into());
                }
            };
            db.health_check().await?;

            if config.run_migrations {
                if let Err(e) = db.run_migrations().await {
                    error!(error = %e, "Failed to run migrations");
                    return Err(e.into());
                }
            }

            run(db.store(), &config).await
        }
        None => {
            warn!("DATABASE_URL not set, using the in-memory store; state is lost on exit");
            run(MemoryStore::new(), &config).await
        }
    }
}

async fn run<S: Storage>(store: S, config: &Config) -> Result<()> {
    let engine = Arc::new(RotationEngine::new(Arc::new(store), config.engine));
    log_status(&engine, config.history_limit).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = DutyWorker::new(
        Arc::clone(&engine),
        Arc::new(LogNotifier),
        config.schedule,
        config.tick_interval,
    );
    let worker_handle = tokio::spawn(async move {
        worker.run(shutdown_rx).await;
    });

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);

    let shutdown_timeout = Duration::from_secs(10);
    if let Err(e) = tokio::time::timeout(shutdown_timeout, worker_handle).await {
        warn!(error = %e, "Duty worker did not shut down in time");
    }

    info!("dutybot shutdown complete");
    Ok(())
}

/// Log each pool's cycle, who is still eligible and its recent assignments.
async fn log_status<S: Storage>(engine: &RotationEngine<S>, history_limit: usize) -> Result<()> {
    for pool in engine.pools().list_pools().await? {
        let eligible = engine.preview_eligible(pool.pool_id).await?;
        let history = engine.get_history(pool.pool_id, history_limit).await?;
        info!(
            pool_id = %pool.pool_id,
            pool = %pool.display_name,
            cycle = %pool.current_cycle,
            eligible = eligible.len(),
            last_assigned = ?history.first().map(|a| a.member_id.to_string()),
            history_rows = history.len(),
            "Pool status"
        );
    }
    Ok(())
}
