//! Flash-sale process entry point.
//!
//! Starts the order worker. The fast store is Redis when
//! `FLASHSALE_REDIS_URL` is set, otherwise in-process. Orders persist to
//! PostgreSQL when `FLASHSALE_DB_HOST` is set, otherwise to memory.

use std::sync::Arc;

use flashsale_core::{FlashSaleConfig, FlashSaleResult};
use flashsale_seckill::{
    init_tracing, DbConfig, FlashSaleRuntime, PgOrderRepository, TelemetryConfig,
};
use flashsale_storage::{MemoryOrderRepository, MemoryStore, OrderRepository};

#[tokio::main]
async fn main() -> FlashSaleResult<()> {
    let telemetry_config = TelemetryConfig::default();
    init_tracing(&telemetry_config)?;

    let config = FlashSaleConfig::from_env();
    let repo = open_repository().await?;
    let runtime = start_runtime(config, repo).await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    } else {
        tracing::info!("Shutdown signal received");
    }

    runtime.shutdown().await;
    Ok(())
}

#[cfg(feature = "redis")]
async fn start_runtime(
    config: FlashSaleConfig,
    repo: Arc<dyn OrderRepository>,
) -> FlashSaleResult<FlashSaleRuntime> {
    match flashsale_storage::RedisStore::from_env().await? {
        Some(store) => FlashSaleRuntime::start(config, Arc::new(store), repo),
        None => start_in_process(config, repo),
    }
}

#[cfg(not(feature = "redis"))]
async fn start_runtime(
    config: FlashSaleConfig,
    repo: Arc<dyn OrderRepository>,
) -> FlashSaleResult<FlashSaleRuntime> {
    start_in_process(config, repo)
}

fn start_in_process(
    config: FlashSaleConfig,
    repo: Arc<dyn OrderRepository>,
) -> FlashSaleResult<FlashSaleRuntime> {
    tracing::warn!(
        "FLASHSALE_REDIS_URL not set, fast store is in-process and lost on restart"
    );
    FlashSaleRuntime::start(config, Arc::new(MemoryStore::new()), repo)
}

async fn open_repository() -> FlashSaleResult<Arc<dyn OrderRepository>> {
    if std::env::var("FLASHSALE_DB_HOST").is_err() {
        tracing::warn!("FLASHSALE_DB_HOST not set, orders are kept in memory");
        return Ok(Arc::new(MemoryOrderRepository::new()));
    }

    let db_config = DbConfig::from_env();
    let repo = PgOrderRepository::from_config(&db_config)?;
    repo.migrate().await?;
    tracing::info!(
        host = %db_config.host,
        dbname = %db_config.dbname,
        max_size = db_config.max_size,
        "Connected to PostgreSQL"
    );
    Ok(Arc::new(repo))
}
