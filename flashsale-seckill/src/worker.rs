//! Order Queue Worker
//!
//! Drains the durable order queue as a single consumer of its group. Each
//! entry is decoded, handed to the [`OrderFulfiller`] and acknowledged only
//! if fulfillment returned without error.
//!
//! When anything fails the worker switches to pending-list recovery: it
//! re-reads this consumer's delivered-but-unacknowledged entries from the
//! start of the list and reprocesses each until it succeeds, sleeping briefly
//! between failed attempts. An entry is never skipped, so a poison entry
//! blocks the queue unless `max_delivery_attempts` is set, in which case it is
//! moved to the dead-letter stream. Once the pending list is empty the worker
//! resumes normal reads.
//!
//! Entries whose fields cannot be decoded can never succeed. They are copied
//! to the dead-letter stream and acknowledged at once.
//!
//! # Shutdown
//!
//! Reads block for at most `block_timeout`, after which the worker checks the
//! shutdown signal. It finishes the entry in hand, then exits.
//! [`WorkerHandle::shutdown`] waits up to a grace period before aborting.

use chrono::Utc;
use flashsale_core::{FlashSaleResult, QueueConfig, QueueEntry, ReadOffset, VoucherOrder};
use flashsale_storage::StreamStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::fulfillment::{FulfillmentOutcome, OrderFulfiller};

/// Dead-letter field holding the original entry id.
pub const DLQ_FIELD_SOURCE_ID: &str = "sourceId";
/// Dead-letter field holding the reason the entry was parked.
pub const DLQ_FIELD_REASON: &str = "reason";

// ============================================================================
// METRICS
// ============================================================================

/// Worker counters since startup.
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    /// Entries handed to processing, including replays.
    pub processed: AtomicU64,
    pub acknowledged: AtomicU64,
    /// Fulfillment attempts that returned an error.
    pub failed: AtomicU64,
    /// Entries acknowledged during pending-list recovery.
    pub recovered: AtomicU64,
    pub created: AtomicU64,
    pub lock_contended: AtomicU64,
    pub duplicates_skipped: AtomicU64,
    pub anomalies: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub read_errors: AtomicU64,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            lock_contended: self.lock_contended.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            anomalies: self.anomalies.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of worker metrics at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub processed: u64,
    pub acknowledged: u64,
    pub failed: u64,
    pub recovered: u64,
    pub created: u64,
    pub lock_contended: u64,
    pub duplicates_skipped: u64,
    pub anomalies: u64,
    pub dead_lettered: u64,
    pub read_errors: u64,
}

// ============================================================================
// WORKER
// ============================================================================

pub struct OrderQueueWorker {
    stream: Arc<dyn StreamStore>,
    fulfiller: Arc<dyn OrderFulfiller>,
    config: QueueConfig,
    metrics: Arc<WorkerMetrics>,
}

impl OrderQueueWorker {
    pub fn new(
        stream: Arc<dyn StreamStore>,
        fulfiller: Arc<dyn OrderFulfiller>,
        config: QueueConfig,
    ) -> Self {
        Self {
            stream,
            fulfiller,
            config,
            metrics: Arc::new(WorkerMetrics::new()),
        }
    }

    pub fn metrics(&self) -> Arc<WorkerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Spawn the worker loop on the current runtime.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = self.metrics();
        let join = tokio::spawn(self.run(shutdown_rx));
        WorkerHandle {
            shutdown_tx,
            join,
            metrics,
        }
    }

    /// Run until the shutdown signal is set or its sender is dropped.
    pub async fn run(self, shutdown_rx: watch::Receiver<bool>) -> WorkerSnapshot {
        if !self.ensure_group(&shutdown_rx).await {
            return self.metrics.snapshot();
        }

        tracing::info!(
            stream = %self.config.stream_key,
            group = %self.config.group,
            consumer = %self.config.consumer,
            block_timeout_ms = self.config.block_timeout.as_millis() as u64,
            "Order queue worker started"
        );

        // Entries left pending by a previous run.
        self.recover_pending(&shutdown_rx).await;

        while !shutdown_requested(&shutdown_rx) {
            let read = self
                .stream
                .read_group(
                    &self.config.stream_key,
                    &self.config.group,
                    &self.config.consumer,
                    ReadOffset::NextUndelivered,
                    self.config.block_timeout,
                )
                .await;

            match read {
                Ok(None) => continue,
                Ok(Some(entry)) => {
                    if let Err(e) = self.process(&entry).await {
                        tracing::error!(
                            entry_id = %entry.id,
                            error = %e,
                            "Failed to process order entry, entering recovery"
                        );
                        self.recover_pending(&shutdown_rx).await;
                    }
                }
                Err(e) => {
                    self.metrics.read_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(error = %e, "Order queue read failed, entering recovery");
                    tokio::time::sleep(self.config.recovery_backoff).await;
                    self.recover_pending(&shutdown_rx).await;
                }
            }
        }

        let snapshot = self.metrics.snapshot();
        tracing::info!(
            processed = snapshot.processed,
            acknowledged = snapshot.acknowledged,
            failed = snapshot.failed,
            recovered = snapshot.recovered,
            dead_lettered = snapshot.dead_lettered,
            anomalies = snapshot.anomalies,
            "Order queue worker stopped"
        );
        snapshot
    }

    async fn ensure_group(&self, shutdown_rx: &watch::Receiver<bool>) -> bool {
        loop {
            match self
                .stream
                .create_group(&self.config.stream_key, &self.config.group)
                .await
            {
                Ok(()) => return true,
                Err(e) => {
                    tracing::error!(
                        stream = %self.config.stream_key,
                        group = %self.config.group,
                        error = %e,
                        "Failed to create consumer group"
                    );
                    if shutdown_requested(shutdown_rx) {
                        return false;
                    }
                    tokio::time::sleep(self.config.recovery_backoff).await;
                }
            }
        }
    }

    /// Replay this consumer's pending entries until none remain.
    async fn recover_pending(&self, shutdown_rx: &watch::Receiver<bool>) {
        loop {
            if shutdown_requested(shutdown_rx) {
                return;
            }
            let read = self
                .stream
                .read_group(
                    &self.config.stream_key,
                    &self.config.group,
                    &self.config.consumer,
                    ReadOffset::Pending,
                    Duration::ZERO,
                )
                .await;

            let entry = match read {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    tracing::debug!("Pending list empty, resuming queue reads");
                    return;
                }
                Err(e) => {
                    self.metrics.read_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "Pending list read failed, retrying");
                    tokio::time::sleep(self.config.recovery_backoff).await;
                    continue;
                }
            };

            let result = match self.config.max_delivery_attempts {
                Some(max) if entry.delivery_count > max => {
                    let reason = format!("exceeded {} delivery attempts", max);
                    self.dead_letter(&entry, &reason).await
                }
                _ => self.process(&entry).await,
            };

            match result {
                Ok(()) => {
                    self.metrics.recovered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::warn!(
                        entry_id = %entry.id,
                        delivery_count = entry.delivery_count,
                        error = %e,
                        "Pending entry failed, retrying"
                    );
                    tokio::time::sleep(self.config.recovery_backoff).await;
                }
            }
        }
    }

    /// Process one entry. `Ok` means the entry was acknowledged.
    async fn process(&self, entry: &QueueEntry) -> FlashSaleResult<()> {
        self.metrics.processed.fetch_add(1, Ordering::Relaxed);

        let order = match VoucherOrder::from_queue_entry(entry, Utc::now()) {
            Ok(order) => order,
            Err(e) => return self.dead_letter(entry, &e.to_string()).await,
        };

        let outcome = match self.fulfiller.fulfill(&order).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let counter = match outcome {
            FulfillmentOutcome::Created => &self.metrics.created,
            FulfillmentOutcome::AlreadyFulfilled => &self.metrics.duplicates_skipped,
            FulfillmentOutcome::LockContended => &self.metrics.lock_contended,
            FulfillmentOutcome::StockAnomaly => &self.metrics.anomalies,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        self.ack(entry).await
    }

    async fn dead_letter(&self, entry: &QueueEntry, reason: &str) -> FlashSaleResult<()> {
        tracing::error!(
            entry_id = %entry.id,
            delivery_count = entry.delivery_count,
            reason = %reason,
            "Moving order entry to dead-letter stream"
        );
        let mut fields = entry.fields.clone();
        fields.insert(DLQ_FIELD_SOURCE_ID.to_string(), entry.id.to_string());
        fields.insert(DLQ_FIELD_REASON.to_string(), reason.to_string());
        self.stream
            .append(&self.config.dead_letter_key(), &fields)
            .await?;
        self.metrics.dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.ack(entry).await
    }

    async fn ack(&self, entry: &QueueEntry) -> FlashSaleResult<()> {
        let was_pending = self
            .stream
            .ack(&self.config.stream_key, &self.config.group, entry.id)
            .await?;
        if !was_pending {
            tracing::debug!(entry_id = %entry.id, "Entry was not pending at ack");
        }
        self.metrics.acknowledged.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn shutdown_requested(shutdown_rx: &watch::Receiver<bool>) -> bool {
    *shutdown_rx.borrow() || shutdown_rx.has_changed().is_err()
}

// ============================================================================
// HANDLE
// ============================================================================

/// Owner of a spawned worker.
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<WorkerSnapshot>,
    metrics: Arc<WorkerMetrics>,
}

impl WorkerHandle {
    pub fn metrics(&self) -> WorkerSnapshot {
        self.metrics.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signal shutdown and wait up to `grace` for the current entry to
    /// finish, then abort the task.
    pub async fn shutdown(self, grace: Duration) -> WorkerSnapshot {
        let _ = self.shutdown_tx.send(true);
        let mut join = self.join;
        match tokio::time::timeout(grace, &mut join).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Order queue worker task failed");
                self.metrics.snapshot()
            }
            Err(_) => {
                tracing::warn!(
                    grace_ms = grace.as_millis() as u64,
                    "Order queue worker did not stop within grace period, aborting"
                );
                join.abort();
                let _ = join.await;
                self.metrics.snapshot()
            }
        }
    }
}
