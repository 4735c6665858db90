//! DistributedQueueService: owns the distributed tables of one node, the
//! shared shard router, the cleanup worker and the background-task
//! supervisor. Control operations take an optional table; `None` applies
//! the operation to every table.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use falcon_common::config::DistributedQueueConfig;
use falcon_common::datum::OwnedRow;
use falcon_common::error::{FalconError, FalconResult};
use falcon_common::types::{BatchId, ShardTarget, TableRef};

use crate::bg_supervisor::{BgTaskSnapshot, BgTaskSupervisor, QueueHealth};
use crate::cleanup::{wait_for_tick, CleanupRegistry, CleanupSource, CleanupWorker, SweepReport};
use crate::executor::QueryExecutor;
use crate::router::{ClusterTopology, ShardRouter, StaticTopology};
use crate::sender::SenderState;
use crate::table::{DistributedTable, DistributedTableSpec, InsertSummary};

pub struct DistributedQueueService {
    config: DistributedQueueConfig,
    router: Arc<ShardRouter>,
    executor: Arc<dyn QueryExecutor>,
    supervisor: Arc<BgTaskSupervisor>,
    registry: Arc<CleanupRegistry>,
    cleanup: Mutex<Option<CleanupWorker>>,
    tables: RwLock<BTreeMap<TableRef, Arc<DistributedTable>>>,
}

impl DistributedQueueService {
    /// Start with the static topology from `config.clusters`.
    pub fn start(config: DistributedQueueConfig, executor: Arc<dyn QueryExecutor>) -> FalconResult<Self> {
        let topology = Arc::new(StaticTopology::from_config(&config.clusters));
        Self::with_topology(config, topology, executor)
    }

    pub fn with_topology(
        config: DistributedQueueConfig,
        topology: Arc<dyn ClusterTopology>,
        executor: Arc<dyn QueryExecutor>,
    ) -> FalconResult<Self> {
        config.validate().map_err(FalconError::Config)?;

        let router = Arc::new(ShardRouter::new(
            topology,
            config.node.addr(),
            config.distributed.prefer_localhost_replica,
        ));
        let supervisor = Arc::new(BgTaskSupervisor::new());
        let registry = Arc::new(CleanupRegistry::new());
        let worker = CleanupWorker::start(
            registry.clone(),
            config.distributed.cleanup_period(),
            supervisor.clone(),
        )
        .map_err(|e| FalconError::Internal(format!("failed to spawn cleanup worker: {}", e)))?;

        tracing::info!(
            node = %config.node.addr(),
            data_dir = %config.distributed.data_dir,
            clusters = config.clusters.len(),
            cleanup_period_ms = config.distributed.cleanup_period_ms,
            "distributed queue service started"
        );

        Ok(Self {
            config,
            router,
            executor,
            supervisor,
            registry,
            cleanup: Mutex::new(Some(worker)),
            tables: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn config(&self) -> &DistributedQueueConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<ShardRouter> {
        &self.router
    }

    pub fn supervisor(&self) -> &Arc<BgTaskSupervisor> {
        &self.supervisor
    }

    // ── Tables ──

    /// Create (or re-attach to the on-disk queue of) a distributed table.
    pub fn create_table(&self, spec: DistributedTableSpec) -> FalconResult<Arc<DistributedTable>> {
        let mut tables = self.tables.write();
        if tables.contains_key(&spec.table) {
            return Err(FalconError::TableExists(spec.table.to_string()));
        }
        let name = spec.table.clone();
        let table = DistributedTable::open(
            spec,
            &self.config.distributed,
            self.router.clone(),
            self.executor.clone(),
            self.supervisor.clone(),
        )?;
        let weak: Weak<dyn CleanupSource> = Arc::downgrade(&table) as Weak<dyn CleanupSource>;
        self.registry.register(weak);
        tables.insert(name, table.clone());
        Ok(table)
    }

    pub fn table(&self, name: &TableRef) -> FalconResult<Arc<DistributedTable>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| FalconError::UnknownTable(name.to_string()))
    }

    pub fn tables(&self) -> Vec<TableRef> {
        self.tables.read().keys().cloned().collect()
    }

    /// Shut down a table's senders and forget it. Its queue stays on disk.
    pub async fn detach_table(&self, name: &TableRef) -> FalconResult<()> {
        let table = self
            .tables
            .write()
            .remove(name)
            .ok_or_else(|| FalconError::UnknownTable(name.to_string()))?;
        self.registry.unregister(&name.to_string());
        table.shutdown().await;
        Ok(())
    }

    pub async fn insert(&self, name: &TableRef, rows: Vec<OwnedRow>) -> FalconResult<InsertSummary> {
        self.table(name)?.insert(rows).await
    }

    fn selected(&self, name: Option<&TableRef>) -> FalconResult<Vec<Arc<DistributedTable>>> {
        match name {
            Some(name) => Ok(vec![self.table(name)?]),
            None => Ok(self.tables.read().values().cloned().collect()),
        }
    }

    // ── Control ──

    /// `SYSTEM STOP DISTRIBUTED SENDS [table]`
    pub fn stop_sends(&self, name: Option<&TableRef>) -> FalconResult<()> {
        for table in self.selected(name)? {
            table.stop_sends();
        }
        Ok(())
    }

    /// `SYSTEM START DISTRIBUTED SENDS [table]`
    pub fn start_sends(&self, name: Option<&TableRef>) -> FalconResult<()> {
        for table in self.selected(name)? {
            table.start_sends();
        }
        Ok(())
    }

    /// `SYSTEM FLUSH DISTRIBUTED [table]`. With no table, every table is
    /// flushed against the same deadline and the first timeout is returned.
    pub async fn flush(&self, name: Option<&TableRef>, timeout: Duration) -> FalconResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut first_err = None;
        for table in self.selected(name)? {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if let Err(e) = table.flush(remaining).await {
                tracing::warn!(table = %table.name(), error = %e, "distributed flush incomplete");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ── Introspection ──

    pub fn list_shard_directories(&self, name: &TableRef) -> FalconResult<BTreeSet<ShardTarget>> {
        self.table(name)?.list_shard_directories()
    }

    pub fn sender_states(&self, name: &TableRef) -> FalconResult<BTreeMap<ShardTarget, SenderState>> {
        Ok(self.table(name)?.sender_states())
    }

    pub fn pending_batches(&self, name: &TableRef, target: &ShardTarget) -> FalconResult<Vec<BatchId>> {
        self.table(name)?.pending_batches(target)
    }

    pub fn health(&self) -> QueueHealth {
        self.supervisor.health()
    }

    pub fn task_snapshot(&self) -> BgTaskSnapshot {
        self.supervisor.snapshot()
    }

    // ── Cleanup hooks ──

    /// Completed cleanup sweeps since start (0 once shut down).
    pub fn cleanup_tick_count(&self) -> u64 {
        self.cleanup.lock().as_ref().map_or(0, |w| w.tick_count())
    }

    /// Run the next cleanup sweep now.
    pub fn trigger_cleanup(&self) {
        if let Some(worker) = self.cleanup.lock().as_ref() {
            worker.trigger();
        }
    }

    /// Wait until the cleanup worker has completed more than `after` sweeps.
    pub async fn wait_for_cleanup_tick(&self, after: u64, timeout: Duration) -> bool {
        let ticks = match self.cleanup.lock().as_ref() {
            Some(worker) => worker.subscribe_ticks(),
            None => return false,
        };
        wait_for_tick(ticks, after, timeout).await
    }

    /// Sweep every table once on the calling thread.
    pub fn run_cleanup_once(&self) -> Vec<(String, SweepReport)> {
        self.registry.sweep_all()
    }

    /// Stop the cleanup worker, then every table's senders. Pending batches
    /// stay on disk.
    pub async fn shutdown(&self) {
        let worker = self.cleanup.lock().take();
        if let Some(mut worker) = worker {
            if let Err(e) = tokio::task::spawn_blocking(move || worker.stop()).await {
                tracing::warn!(error = %e, "cleanup worker did not stop cleanly");
            }
        }
        let tables: Vec<Arc<DistributedTable>> = self.tables.read().values().cloned().collect();
        for table in tables {
            table.shutdown().await;
        }
        tracing::info!("distributed queue service stopped");
    }
}
