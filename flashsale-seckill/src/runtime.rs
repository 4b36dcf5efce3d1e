//! Process wiring: one fast store, one repository, one worker.

use crate::admission::{AdmissionExecutor, SeckillService};
use crate::fulfillment::{OrderFulfiller, VoucherOrderFulfiller};
use crate::worker::{OrderQueueWorker, WorkerHandle, WorkerSnapshot};
use flashsale_core::{FlashSaleConfig, FlashSaleResult};
use flashsale_storage::{
    CacheClient, DistributedLock, IdGenerator, KvStore, OrderRepository, RebuildMetrics,
    RebuildPool, ScriptStore, StreamStore,
};
use std::sync::Arc;

/// Final counters reported by [`FlashSaleRuntime::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub worker: WorkerSnapshot,
    pub rebuild: RebuildMetrics,
}

/// A running flash-sale process: the request service plus its background
/// order worker and cache rebuild pool.
pub struct FlashSaleRuntime {
    config: FlashSaleConfig,
    kv: Arc<dyn KvStore>,
    repo: Arc<dyn OrderRepository>,
    cache: Arc<CacheClient>,
    service: Arc<SeckillService>,
    worker: WorkerHandle,
}

impl FlashSaleRuntime {
    /// Validate `config`, wire every component over `store` and `repo`, and
    /// spawn the order worker on the current runtime.
    pub fn start<S>(
        config: FlashSaleConfig,
        store: Arc<S>,
        repo: Arc<dyn OrderRepository>,
    ) -> FlashSaleResult<Self>
    where
        S: KvStore + ScriptStore + StreamStore + 'static,
    {
        config.validate()?;

        let kv: Arc<dyn KvStore> = store.clone();
        let script: Arc<dyn ScriptStore> = store.clone();
        let stream: Arc<dyn StreamStore> = store;

        let locks = DistributedLock::new(Arc::clone(&kv));
        let pool = Arc::new(RebuildPool::new(config.cache.rebuild_workers));
        let cache = Arc::new(CacheClient::new(
            Arc::clone(&kv),
            locks.clone(),
            pool,
            config.cache.clone(),
        ));
        let ids = IdGenerator::new(Arc::clone(&kv), &config.id);
        let executor = AdmissionExecutor::new(script, config.queue.stream_key.clone());
        let service = Arc::new(SeckillService::new(
            Arc::clone(&kv),
            Arc::clone(&repo),
            Arc::clone(&cache),
            ids,
            executor,
        ));

        let fulfiller: Arc<dyn OrderFulfiller> = Arc::new(VoucherOrderFulfiller::new(
            Arc::clone(&repo),
            locks,
            &config.lock,
        ));
        let worker = OrderQueueWorker::new(stream, fulfiller, config.queue.clone()).spawn();

        tracing::info!(
            stream = %config.queue.stream_key,
            group = %config.queue.group,
            consumer = %config.queue.consumer,
            rebuild_workers = config.cache.rebuild_workers,
            "Flash-sale runtime started"
        );

        Ok(Self {
            config,
            kv,
            repo,
            cache,
            service,
            worker,
        })
    }

    pub fn config(&self) -> &FlashSaleConfig {
        &self.config
    }

    pub fn service(&self) -> Arc<SeckillService> {
        Arc::clone(&self.service)
    }

    pub fn cache(&self) -> Arc<CacheClient> {
        Arc::clone(&self.cache)
    }

    pub fn kv(&self) -> Arc<dyn KvStore> {
        Arc::clone(&self.kv)
    }

    pub fn repository(&self) -> Arc<dyn OrderRepository> {
        Arc::clone(&self.repo)
    }

    pub fn worker_metrics(&self) -> WorkerSnapshot {
        self.worker.metrics()
    }

    /// Stop the worker, then drain the rebuild pool, each within the
    /// configured grace period.
    pub async fn shutdown(self) -> ShutdownReport {
        let grace = self.config.queue.shutdown_grace;
        let worker = self.worker.shutdown(grace).await;
        let rebuild = self.cache.pool().shutdown(grace).await;
        tracing::info!(
            processed = worker.processed,
            acknowledged = worker.acknowledged,
            created = worker.created,
            dead_lettered = worker.dead_lettered,
            rebuilds_completed = rebuild.completed,
            "Flash-sale runtime stopped"
        );
        ShutdownReport { worker, rebuild }
    }
}
