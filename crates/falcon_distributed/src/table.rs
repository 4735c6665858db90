//! DistributedTable: insert entry point and per-table control surface.
//!
//! An insert is routed once; rows for a shard with a replica on this node
//! are executed before `insert` returns, rows for remote shards are written
//! to that shard's queue directory and delivered by its sender. Only routing
//! errors, local execution errors and enqueue I/O errors reach the caller.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use falcon_common::config::DistributedConfig;
use falcon_common::datum::OwnedRow;
use falcon_common::error::{FalconError, FalconResult, QueueError, RemoteError, RoutingError};
use falcon_common::types::{BatchId, ShardTarget, TableRef};

use crate::bg_supervisor::BgTaskSupervisor;
use crate::cleanup::{sweep_directory, CleanupSource, SweepReport};
use crate::directory::{BatchDirectory, ShardQueueStats};
use crate::executor::{InsertRequest, QueryExecutor};
use crate::router::{ShardRoute, ShardRouter};
use crate::sender::{SenderConfig, SenderState, ShardSender, ShardSenderHandle};

/// Definition of a distributed table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedTableSpec {
    pub table: TableRef,
    pub cluster: String,
    /// Table on every shard that receives the rows.
    pub destination: TableRef,
    /// Column index of the sharding key. Required when the cluster has more
    /// than one shard.
    pub sharding_key: Option<usize>,
}

/// Where the rows of one insert went.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertSummary {
    /// Rows executed on a local replica.
    pub local_rows: usize,
    /// Rows written to shard queues.
    pub queued_rows: usize,
    /// Rows sent inline (`insert_distributed_sync`).
    pub sent_rows: usize,
    pub batches: Vec<BatchId>,
}

pub struct DistributedTable {
    spec: DistributedTableSpec,
    config: DistributedConfig,
    router: Arc<ShardRouter>,
    directory: Arc<BatchDirectory>,
    executor: Arc<dyn QueryExecutor>,
    supervisor: Arc<BgTaskSupervisor>,
    runtime: tokio::runtime::Handle,
    senders: RwLock<BTreeMap<ShardTarget, Arc<ShardSenderHandle>>>,
    sends_enabled: AtomicBool,
    closed: AtomicBool,
}

impl DistributedTable {
    /// Open the table's queue root under `config.data_dir` and start a
    /// sender for every shard directory left from a previous run. Must be
    /// called inside a tokio runtime.
    pub fn open(
        spec: DistributedTableSpec,
        config: &DistributedConfig,
        router: Arc<ShardRouter>,
        executor: Arc<dyn QueryExecutor>,
        supervisor: Arc<BgTaskSupervisor>,
    ) -> FalconResult<Arc<Self>> {
        let shards = router
            .shard_count(&spec.cluster)
            .ok_or_else(|| RoutingError::UnknownCluster(spec.cluster.clone()))?;
        if shards > 1 && spec.sharding_key.is_none() {
            return Err(RoutingError::ShardingKeyRequired {
                cluster: spec.cluster.clone(),
                shards,
            }
            .into());
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| FalconError::Internal(format!("distributed table needs a tokio runtime: {}", e)))?;

        let root = Path::new(&config.data_dir)
            .join(&spec.table.database)
            .join(&spec.table.table);
        let directory = Arc::new(BatchDirectory::open(
            root,
            spec.table.clone(),
            &spec.cluster,
            config.fsync_batches,
        )?);

        let table = Arc::new(Self {
            spec,
            config: config.clone(),
            router,
            directory,
            executor,
            supervisor,
            runtime,
            senders: RwLock::new(BTreeMap::new()),
            sends_enabled: AtomicBool::new(config.send_enabled_by_default),
            closed: AtomicBool::new(false),
        });

        let recovered = table.directory.targets();
        for target in &recovered {
            table.ensure_sender(target);
        }
        tracing::info!(
            table = %table.spec.table,
            cluster = %table.spec.cluster,
            sends_enabled = config.send_enabled_by_default,
            recovered_shards = recovered.len(),
            "distributed table opened"
        );
        Ok(table)
    }

    pub fn name(&self) -> &TableRef {
        &self.spec.table
    }

    pub fn spec(&self) -> &DistributedTableSpec {
        &self.spec
    }

    pub fn directory(&self) -> &Arc<BatchDirectory> {
        &self.directory
    }

    /// Route and apply one insert.
    pub async fn insert(&self, rows: Vec<OwnedRow>) -> FalconResult<InsertSummary> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::ShutDown(self.spec.table.to_string()).into());
        }
        let routes = self
            .router
            .route(&self.spec.cluster, self.spec.sharding_key, rows)?;
        let (local, remote): (Vec<ShardRoute>, Vec<ShardRoute>) =
            routes.into_iter().partition(|r| r.local);

        let mut summary = InsertSummary::default();
        for route in local {
            self.executor
                .execute(InsertRequest {
                    destination: &self.spec.destination,
                    shard: route.target.shard,
                    node: &route.node,
                    rows: &route.rows,
                })
                .await?;
            falcon_observability::record_local_rows(&self.spec.table.to_string(), route.rows.len());
            summary.local_rows += route.rows.len();
        }

        for route in remote {
            if self.config.insert_distributed_sync {
                self.send_inline(&route).await?;
                summary.sent_rows += route.rows.len();
                continue;
            }
            let row_count = route.rows.len();
            let target = route.target.clone();
            let id = self.enqueue(route).await?;
            if self.ensure_sender(&target).is_none() {
                // The batch is on disk; the next `open` delivers it.
                return Err(QueueError::ShutDown(self.spec.table.to_string()).into());
            }
            summary.queued_rows += row_count;
            summary.batches.push(id);
        }

        tracing::debug!(
            table = %self.spec.table,
            local_rows = summary.local_rows,
            queued_rows = summary.queued_rows,
            sent_rows = summary.sent_rows,
            "insert applied"
        );
        Ok(summary)
    }

    async fn enqueue(&self, route: ShardRoute) -> FalconResult<BatchId> {
        let directory = self.directory.clone();
        let destination = self.spec.destination.clone();
        let ShardRoute { target, rows, .. } = route;
        tokio::task::spawn_blocking(move || directory.enqueue(&target, &destination, rows))
            .await
            .map_err(|e| FalconError::Internal(format!("enqueue task failed: {}", e)))?
            .map_err(FalconError::from)
    }

    async fn send_inline(&self, route: &ShardRoute) -> FalconResult<()> {
        let timeout = self.config.sync_insert_timeout();
        let request = InsertRequest {
            destination: &self.spec.destination,
            shard: route.target.shard,
            node: &route.node,
            rows: &route.rows,
        };
        match tokio::time::timeout(timeout, self.executor.execute(request)).await {
            Ok(result) => result.map_err(FalconError::from),
            Err(_) => Err(RemoteError::Timeout {
                node: route.node.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }
            .into()),
        }
    }

    /// Sender for `target`, started on first use. `None` once the table is
    /// shut down; `closed` is only set under the `senders` write lock.
    fn ensure_sender(&self, target: &ShardTarget) -> Option<Arc<ShardSenderHandle>> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        if let Some(handle) = self.senders.read().get(target) {
            return Some(handle.clone());
        }
        let mut senders = self.senders.write();
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let handle = senders
            .entry(target.clone())
            .or_insert_with(|| {
                let sender = ShardSender::new(
                    target.clone(),
                    self.directory.clone(),
                    self.router.clone(),
                    self.executor.clone(),
                    self.supervisor.clone(),
                    SenderConfig::from_distributed(&self.config),
                );
                Arc::new(sender.start(&self.runtime, self.sends_enabled.load(Ordering::SeqCst)))
            })
            .clone();
        Some(handle)
    }

    fn handles(&self) -> Vec<Arc<ShardSenderHandle>> {
        self.senders.read().values().cloned().collect()
    }

    pub fn stop_sends(&self) {
        self.sends_enabled.store(false, Ordering::SeqCst);
        for handle in self.senders.read().values() {
            handle.stop_sends();
        }
        tracing::info!(table = %self.spec.table, "distributed sends stopped");
    }

    pub fn start_sends(&self) {
        self.sends_enabled.store(true, Ordering::SeqCst);
        for handle in self.senders.read().values() {
            handle.start_sends();
        }
        tracing::info!(table = %self.spec.table, "distributed sends started");
    }

    pub fn sends_enabled(&self) -> bool {
        self.sends_enabled.load(Ordering::SeqCst)
    }

    /// Deliver every batch pending at call time, even while sends are
    /// stopped. On timeout the queue keeps draining in the background.
    pub async fn flush(&self, timeout: Duration) -> FalconResult<()> {
        let started = tokio::time::Instant::now();
        let deadline = started + timeout;

        let mut waits = Vec::new();
        for handle in self.handles() {
            let newest = self.directory.list_pending(handle.target())?.last().map(|b| b.seq);
            if let Some(upto) = newest {
                handle.request_flush(upto);
                waits.push((handle, upto));
            }
        }

        let mut timed_out = Vec::new();
        for (handle, upto) in waits {
            if !handle.wait_drained(upto, deadline).await {
                timed_out.push((handle, upto));
            }
        }
        if timed_out.is_empty() {
            tracing::debug!(table = %self.spec.table, elapsed_ms = started.elapsed().as_millis() as u64, "flush complete");
            return Ok(());
        }

        let mut pending = 0u64;
        for (handle, upto) in &timed_out {
            pending += self
                .directory
                .list_pending(handle.target())?
                .iter()
                .filter(|b| b.seq <= *upto)
                .count() as u64;
        }
        Err(FalconError::FlushTimeout {
            table: self.spec.table.to_string(),
            waited_ms: started.elapsed().as_millis() as u64,
            pending,
        })
    }

    /// Shard directories currently on disk.
    pub fn list_shard_directories(&self) -> FalconResult<BTreeSet<ShardTarget>> {
        Ok(self.directory.list_shard_directories()?)
    }

    pub fn pending_batches(&self, target: &ShardTarget) -> FalconResult<Vec<BatchId>> {
        Ok(self.directory.list_pending(target)?)
    }

    pub fn sender_state(&self, target: &ShardTarget) -> Option<SenderState> {
        self.senders.read().get(target).map(|h| h.state())
    }

    pub fn sender_states(&self) -> BTreeMap<ShardTarget, SenderState> {
        self.senders
            .read()
            .iter()
            .map(|(target, h)| (target.clone(), h.state()))
            .collect()
    }

    pub fn queue_stats(&self) -> FalconResult<BTreeMap<ShardTarget, ShardQueueStats>> {
        let mut out = BTreeMap::new();
        for target in self.directory.targets() {
            let stats = self.directory.stats(&target)?;
            out.insert(target, stats);
        }
        Ok(out)
    }

    /// Stop all senders, waiting for sends in progress. Pending batches stay
    /// on disk and are picked up by the next `open`.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = {
            let senders = self.senders.write();
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            senders.values().cloned().collect()
        };
        for handle in &handles {
            handle.signal_shutdown();
        }
        for handle in &handles {
            handle.shutdown().await;
            self.supervisor.unregister(handle.task_name());
        }
        tracing::info!(table = %self.spec.table, senders = handles.len(), "distributed table shut down");
    }
}

impl CleanupSource for DistributedTable {
    fn name(&self) -> String {
        self.spec.table.to_string()
    }

    fn sweep(&self) -> SweepReport {
        if self.closed.load(Ordering::SeqCst) {
            return SweepReport::default();
        }
        sweep_directory(&self.directory, |target| self.sender_state(target))
    }
}
