//! Flash-sale Seckill - Admission, Fulfillment and Runtime
//!
//! The request path (`SeckillService::submit`) admits or rejects an order
//! atomically in the fast store and queues admitted orders. The background
//! `OrderQueueWorker` turns queued orders into durable rows through an
//! `OrderFulfiller`, replaying anything left pending after a failure.

pub mod admission;
pub mod db;
pub mod fulfillment;
pub mod runtime;
pub mod telemetry;
pub mod worker;

pub use admission::{AdmissionExecutor, SeckillService, VoucherLoader};
pub use db::{DbConfig, PgOrderRepository};
pub use fulfillment::{FulfillmentOutcome, OrderFulfiller, VoucherOrderFulfiller};
pub use runtime::{FlashSaleRuntime, ShutdownReport};
pub use telemetry::{init_tracing, TelemetryConfig};
pub use worker::{
    OrderQueueWorker, WorkerHandle, WorkerMetrics, WorkerSnapshot, DLQ_FIELD_REASON,
    DLQ_FIELD_SOURCE_ID,
};
