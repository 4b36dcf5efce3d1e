//! PostgreSQL Order Repository
//!
//! Durable store for vouchers and orders using deadpool-postgres. Fulfillment
//! writes run in one transaction: re-check the (user, voucher) order count,
//! decrement stock with `stock = stock - 1 WHERE stock > 0`, insert the order.
//! The schema lives in `migrations/V1__seckill.sql`.

use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolError, RecyclingMethod, Runtime};
use flashsale_core::{
    FlashSaleResult, OrderId, SeckillVoucher, StoreError, StoreResult, Timestamp, UserId,
    VoucherId, VoucherOrder,
};
use flashsale_storage::{CreateOutcome, OrderRepository};
use std::time::Duration;
use tokio_postgres::{NoTls, Row};

/// Schema applied by [`PgOrderRepository::migrate`].
pub const SCHEMA: &str = include_str!("../migrations/V1__seckill.sql");

// ============================================================================
// CONNECTION POOL CONFIGURATION
// ============================================================================

/// Database connection pool configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    /// Maximum pool size
    pub max_size: usize,
    /// Wait for a pooled connection
    pub timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "flashsale".to_string(),
            user: "postgres".to_string(),
            password: "".to_string(),
            max_size: 16,
            timeout: Duration::from_secs(30),
        }
    }
}

impl DbConfig {
    /// Create a database configuration from `FLASHSALE_DB_*` variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("FLASHSALE_DB_HOST").unwrap_or(defaults.host),
            port: std::env::var("FLASHSALE_DB_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            dbname: std::env::var("FLASHSALE_DB_NAME").unwrap_or(defaults.dbname),
            user: std::env::var("FLASHSALE_DB_USER").unwrap_or(defaults.user),
            password: std::env::var("FLASHSALE_DB_PASSWORD").unwrap_or_default(),
            max_size: std::env::var("FLASHSALE_DB_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_size),
            timeout: Duration::from_secs(
                std::env::var("FLASHSALE_DB_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.timeout.as_secs()),
            ),
        }
    }

    /// Create a connection pool from this configuration.
    pub fn create_pool(&self) -> FlashSaleResult<Pool> {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        let mut pool_cfg = deadpool_postgres::PoolConfig::new(self.max_size);
        pool_cfg.timeouts.wait = Some(self.timeout);
        cfg.pool = Some(pool_cfg);

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::Unavailable {
                reason: format!("failed to create pool: {}", e),
            })?;
        Ok(pool)
    }
}

// ============================================================================
// ERROR CONVERSION
// ============================================================================

fn pool_error(err: PoolError) -> StoreError {
    tracing::error!("Connection pool error: {:?}", err);
    match err {
        PoolError::Timeout(_) => StoreError::Timeout {
            operation: "acquire database connection".to_string(),
        },
        other => StoreError::Unavailable {
            reason: other.to_string(),
        },
    }
}

fn query_error(err: tokio_postgres::Error) -> StoreError {
    tracing::error!("Database error: {:?}", err);
    StoreError::QueryFailed {
        reason: err.to_string(),
    }
}

fn sql_id(field: &str, raw: u64) -> StoreResult<i64> {
    i64::try_from(raw).map_err(|_| StoreError::Protocol {
        operation: "encode id".to_string(),
        reason: format!("{} {} exceeds BIGINT range", field, raw),
    })
}

fn row_id(field: &str, raw: i64) -> StoreResult<u64> {
    u64::try_from(raw).map_err(|_| StoreError::Protocol {
        operation: "decode id".to_string(),
        reason: format!("{} {} is negative", field, raw),
    })
}

fn voucher_from_row(row: &Row) -> StoreResult<SeckillVoucher> {
    let voucher_id: i64 = row.get("voucher_id");
    let stock: i32 = row.get("stock");
    Ok(SeckillVoucher {
        voucher_id: VoucherId::new(row_id("voucher_id", voucher_id)?),
        stock: u32::try_from(stock).map_err(|_| StoreError::Protocol {
            operation: "decode voucher".to_string(),
            reason: format!("negative stock {}", stock),
        })?,
        begin_time: row.get::<_, Timestamp>("begin_time"),
        end_time: row.get::<_, Timestamp>("end_time"),
    })
}

fn order_from_row(row: &Row) -> StoreResult<VoucherOrder> {
    Ok(VoucherOrder {
        order_id: OrderId::new(row_id("id", row.get("id"))?),
        user_id: UserId::new(row_id("user_id", row.get("user_id"))?),
        voucher_id: VoucherId::new(row_id("voucher_id", row.get("voucher_id"))?),
        created_at: row.get::<_, Timestamp>("create_time"),
    })
}

// ============================================================================
// REPOSITORY
// ============================================================================

#[derive(Clone)]
pub struct PgOrderRepository {
    pool: Pool,
}

impl PgOrderRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn from_config(config: &DbConfig) -> FlashSaleResult<Self> {
        Ok(Self::new(config.create_pool()?))
    }

    /// Get the current pool size for observability.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    async fn get_conn(&self) -> StoreResult<deadpool_postgres::Object> {
        self.pool.get().await.map_err(pool_error)
    }

    /// Create tables and indexes if missing.
    pub async fn migrate(&self) -> StoreResult<()> {
        let conn = self.get_conn().await?;
        conn.batch_execute(SCHEMA).await.map_err(query_error)?;
        tracing::info!("Database schema up to date");
        Ok(())
    }
}

#[async_trait]
impl OrderRepository for PgOrderRepository {
    async fn voucher(&self, voucher_id: VoucherId) -> StoreResult<Option<SeckillVoucher>> {
        let conn = self.get_conn().await?;
        let row = conn
            .query_opt(
                "SELECT voucher_id, stock, begin_time, end_time \
                 FROM tb_seckill_voucher WHERE voucher_id = $1",
                &[&sql_id("voucher_id", voucher_id.get())?],
            )
            .await
            .map_err(query_error)?;
        row.as_ref().map(voucher_from_row).transpose()
    }

    async fn insert_voucher(&self, voucher: &SeckillVoucher) -> StoreResult<bool> {
        let stock = i32::try_from(voucher.stock).map_err(|_| StoreError::Protocol {
            operation: "encode voucher".to_string(),
            reason: format!("stock {} exceeds INTEGER range", voucher.stock),
        })?;
        let conn = self.get_conn().await?;
        let inserted = conn
            .execute(
                "INSERT INTO tb_seckill_voucher (voucher_id, stock, begin_time, end_time) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (voucher_id) DO NOTHING",
                &[
                    &sql_id("voucher_id", voucher.voucher_id.get())?,
                    &stock,
                    &voucher.begin_time,
                    &voucher.end_time,
                ],
            )
            .await
            .map_err(query_error)?;
        Ok(inserted == 1)
    }

    async fn count_orders(&self, user_id: UserId, voucher_id: VoucherId) -> StoreResult<u64> {
        let conn = self.get_conn().await?;
        let row = conn
            .query_one(
                "SELECT COUNT(*) FROM tb_voucher_order WHERE user_id = $1 AND voucher_id = $2",
                &[
                    &sql_id("user_id", user_id.get())?,
                    &sql_id("voucher_id", voucher_id.get())?,
                ],
            )
            .await
            .map_err(query_error)?;
        let count: i64 = row.get(0);
        row_id("count", count)
    }

    async fn create_order(&self, order: &VoucherOrder) -> StoreResult<CreateOutcome> {
        let order_id = sql_id("order_id", order.order_id.get())?;
        let user_id = sql_id("user_id", order.user_id.get())?;
        let voucher_id = sql_id("voucher_id", order.voucher_id.get())?;

        let mut conn = self.get_conn().await?;
        let tx = conn.transaction().await.map_err(query_error)?;

        let row = tx
            .query_one(
                "SELECT COUNT(*) FROM tb_voucher_order WHERE user_id = $1 AND voucher_id = $2",
                &[&user_id, &voucher_id],
            )
            .await
            .map_err(query_error)?;
        let existing: i64 = row.get(0);
        if existing > 0 {
            tx.rollback().await.map_err(query_error)?;
            return Ok(CreateOutcome::AlreadyExists);
        }

        let updated = tx
            .execute(
                "UPDATE tb_seckill_voucher SET stock = stock - 1, update_time = now() \
                 WHERE voucher_id = $1 AND stock > 0",
                &[&voucher_id],
            )
            .await
            .map_err(query_error)?;
        if updated == 0 {
            tx.rollback().await.map_err(query_error)?;
            return Ok(CreateOutcome::StockExhausted);
        }

        let inserted = tx
            .execute(
                "INSERT INTO tb_voucher_order (id, user_id, voucher_id, create_time) \
                 VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING",
                &[&order_id, &user_id, &voucher_id, &order.created_at],
            )
            .await
            .map_err(query_error)?;
        if inserted == 0 {
            tx.rollback().await.map_err(query_error)?;
            return Ok(CreateOutcome::AlreadyExists);
        }

        tx.commit().await.map_err(query_error)?;
        Ok(CreateOutcome::Created)
    }

    async fn order(&self, order_id: OrderId) -> StoreResult<Option<VoucherOrder>> {
        let conn = self.get_conn().await?;
        let row = conn
            .query_opt(
                "SELECT id, user_id, voucher_id, create_time FROM tb_voucher_order WHERE id = $1",
                &[&sql_id("order_id", order_id.get())?],
            )
            .await
            .map_err(query_error)?;
        row.as_ref().map(order_from_row).transpose()
    }
}
