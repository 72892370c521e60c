//! Shipping callback service.
//!
//! Wires configuration, the database, registered providers, the callback
//! HTTP surface, and the background retry sweep, then coordinates graceful
//! startup and shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use sendparcel_api::{providers::build_registry, AppState, Config};
use sendparcel_core::{
    storage::{self, Storage},
    Clock, RealClock,
};
use sendparcel_retry::{
    CallbackDispatcher, PostgresRetryStore, PostgresShipmentRepository, RetryStore, RetrySweep,
    ShipmentRepository, SweepWorker,
};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log);

    info!(
        database_url = %config.database_url_masked(),
        host = %config.host,
        port = config.port,
        providers = config.providers.len(),
        retry_enabled = config.retry_enabled,
        "configuration loaded"
    );

    let pool = create_database_pool(&config).await?;
    storage::migrate(&pool).await.context("failed to run database migrations")?;
    info!("database ready");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let storage = Arc::new(Storage::new(pool.clone(), &clock));

    let shipments: Arc<dyn ShipmentRepository> =
        Arc::new(PostgresShipmentRepository::new(storage.clone()));
    let retry_store: Arc<dyn RetryStore> = Arc::new(PostgresRetryStore::new(
        storage.clone(),
        clock.clone(),
        config.retry_backoff_seconds,
    ));

    let registry = build_registry(&config, &shipments);
    if registry.is_empty() {
        warn!("no providers configured, every callback will be rejected");
    } else {
        info!(providers = ?registry.slugs(), "providers registered");
    }

    let dispatcher = Arc::new(
        CallbackDispatcher::new(shipments, Arc::new(registry), config.to_retry_policy())
            .with_retry_store(retry_store.clone()),
    );

    let worker = if config.retry_enabled {
        let sweep = Arc::new(RetrySweep::new(
            dispatcher.clone(),
            retry_store,
            config.to_sweep_config(),
        ));
        Some(SweepWorker::new(sweep, config.to_worker_config(), clock.clone()).spawn())
    } else {
        info!("callback retries disabled, sweep worker not started");
        None
    };

    let state = AppState::new(dispatcher, clock)
        .with_storage(storage)
        .with_default_provider(config.default_provider.clone());
    let addr = config.parse_server_addr()?;

    if let Err(e) = sendparcel_api::start_server(state, addr, config.request_timeout()).await {
        error!(error = %e, "server failed");
    }

    if let Some(worker) = worker {
        worker.shutdown().await;
    }

    pool.close().await;
    info!("shutdown complete");
    Ok(())
}

/// Initializes tracing. `RUST_LOG` wins over the configured filter.
fn init_tracing(configured: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(configured))
        .unwrap_or_else(|_| EnvFilter::new("info,sendparcel=debug,tower_http=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Connects to PostgreSQL, retrying while the database comes up.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;
    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => return Ok(pool),
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}
