//! ShardSender: per-shard loop delivering queued batches with backoff.
//!
//! One sender owns one shard queue directory. It sends the oldest pending
//! batch, deletes it once the remote shard accepted it, and moves on; on
//! failure it retries the same batch with exponential backoff, so batches of
//! one shard are delivered strictly in enqueue order.
//!
//! ```ignore
//! let handle = ShardSender::new(...).start(&runtime, true);
//! handle.stop_sends();                   // finish current send, then idle
//! handle.flush_until(seq, deadline).await;
//! handle.shutdown().await;
//! ```
//!
//! `SenderState` is written only by the sender and read by the cleanup worker
//! and the control surface. A batch is marked in flight before its file is
//! read and stays in flight until the file is gone.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use falcon_common::config::DistributedConfig;
use falcon_common::error::{FalconError, FalconResult};
use falcon_common::types::{BatchId, ShardTarget, TableRef};

use crate::bg_supervisor::{BgTaskCriticality, BgTaskSupervisor};
use crate::directory::{BatchDirectory, ShardQueue};
use crate::executor::{InsertRequest, QueryExecutor};
use crate::router::ShardRouter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderStatus {
    Running,
    Stopped,
}

impl std::fmt::Display for SenderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SenderStatus::Running => write!(f, "RUNNING"),
            SenderStatus::Stopped => write!(f, "STOPPED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderState {
    pub status: SenderStatus,
    /// Seq of the batch currently being delivered (or quarantined).
    pub in_flight: Option<u64>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    /// Set once `consecutive_failures` reached the alert threshold; cleared
    /// by the next successful send.
    pub alerting: bool,
    pub batches_sent: u64,
    pub rows_sent: u64,
    pub batches_quarantined: u64,
    pub last_sent_seq: Option<u64>,
}

impl SenderState {
    pub(crate) fn new(status: SenderStatus) -> Self {
        Self {
            status,
            in_flight: None,
            consecutive_failures: 0,
            last_error: None,
            alerting: false,
            batches_sent: 0,
            rows_sent: 0,
            batches_quarantined: 0,
            last_sent_seq: None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }
}

/// Retry and alert policy of a sender.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// First retry delay (doubles up to `backoff_max`).
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Attempts per batch before it is moved to `broken/` (0 = never).
    pub max_send_attempts: u32,
    /// Consecutive failures that raise an alert (0 = never).
    pub alert_after_failures: u32,
}

impl SenderConfig {
    pub fn from_distributed(config: &DistributedConfig) -> Self {
        Self {
            backoff_initial: config.backoff_initial(),
            backoff_max: config.backoff_max(),
            max_send_attempts: config.max_send_attempts,
            alert_after_failures: config.alert_after_failures,
        }
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self::from_distributed(&DistributedConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SenderControl {
    enabled: bool,
    /// Batches with seq <= this are sent even while stopped.
    flush_upto: u64,
    shutdown: bool,
}

struct SenderShared {
    state: RwLock<SenderState>,
    control: watch::Sender<SenderControl>,
    /// Highest seq that left the queue (sent or quarantined). Batches leave
    /// in seq order, so every lower seq is gone too.
    drained_through: watch::Sender<u64>,
}

/// Handle returned by `ShardSender::start()`.
pub struct ShardSenderHandle {
    target: ShardTarget,
    task_name: String,
    queue: Arc<ShardQueue>,
    shared: Arc<SenderShared>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ShardSenderHandle {
    pub fn target(&self) -> &ShardTarget {
        &self.target
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn state(&self) -> SenderState {
        self.shared.state.read().clone()
    }

    pub fn status(&self) -> SenderStatus {
        self.shared.state.read().status
    }

    /// Resume sending. Idempotent.
    pub fn start_sends(&self) {
        self.shared.state.write().status = SenderStatus::Running;
        self.shared.control.send_modify(|c| c.enabled = true);
    }

    /// Stop sending after the batch currently in flight. Idempotent.
    pub fn stop_sends(&self) {
        self.shared.state.write().status = SenderStatus::Stopped;
        self.shared.control.send_modify(|c| c.enabled = false);
    }

    pub fn drained_through(&self) -> u64 {
        *self.shared.drained_through.borrow()
    }

    /// Ask the sender to deliver every batch with seq <= `upto`, even while
    /// STOPPED. Does not change the RUNNING/STOPPED status.
    pub fn request_flush(&self, upto: u64) {
        self.shared
            .control
            .send_modify(|c| c.flush_upto = c.flush_upto.max(upto));
        self.queue.wake();
    }

    /// Wait until every batch with seq <= `upto` has left the queue.
    /// Returns false on deadline.
    pub async fn wait_drained(&self, upto: u64, deadline: tokio::time::Instant) -> bool {
        let mut drained = self.shared.drained_through.subscribe();
        let waited = tokio::time::timeout_at(deadline, drained.wait_for(|d| *d >= upto)).await;
        matches!(waited, Ok(Ok(_)))
    }

    pub async fn flush_until(&self, upto: u64, deadline: tokio::time::Instant) -> bool {
        self.request_flush(upto);
        self.wait_drained(upto, deadline).await
    }

    /// Whether the sender task is still alive.
    pub fn is_running(&self) -> bool {
        self.join_handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Signal the sender to exit (non-blocking).
    pub fn signal_shutdown(&self) {
        self.shared.control.send_modify(|c| c.shutdown = true);
    }

    /// Signal the sender to exit and wait for it. A send in progress is
    /// allowed to finish.
    pub async fn shutdown(&self) {
        self.signal_shutdown();
        let handle = self.join_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Delivery loop for a single shard queue.
pub struct ShardSender {
    table: TableRef,
    target: ShardTarget,
    directory: Arc<BatchDirectory>,
    queue: Arc<ShardQueue>,
    router: Arc<ShardRouter>,
    executor: Arc<dyn QueryExecutor>,
    supervisor: Arc<BgTaskSupervisor>,
    config: SenderConfig,
}

impl ShardSender {
    pub fn new(
        target: ShardTarget,
        directory: Arc<BatchDirectory>,
        router: Arc<ShardRouter>,
        executor: Arc<dyn QueryExecutor>,
        supervisor: Arc<BgTaskSupervisor>,
        config: SenderConfig,
    ) -> Self {
        let queue = directory.queue(&target);
        Self {
            table: directory.table().clone(),
            target,
            directory,
            queue,
            router,
            executor,
            supervisor,
            config,
        }
    }

    pub fn task_name(&self) -> String {
        format!("distributed-send:{}/{}", self.table, self.target.dir_name())
    }

    /// Spawn the loop on `runtime`. `enabled` is the initial RUNNING/STOPPED
    /// status.
    pub fn start(self, runtime: &tokio::runtime::Handle, enabled: bool) -> ShardSenderHandle {
        let status = if enabled {
            SenderStatus::Running
        } else {
            SenderStatus::Stopped
        };
        let (control, control_rx) = watch::channel(SenderControl {
            enabled,
            flush_upto: 0,
            shutdown: false,
        });
        let (drained_through, _) = watch::channel(0u64);
        let shared = Arc::new(SenderShared {
            state: RwLock::new(SenderState::new(status)),
            control,
            drained_through,
        });

        let task_name = self.task_name();
        self.supervisor
            .register(&task_name, BgTaskCriticality::NonCritical);

        let target = self.target.clone();
        let queue = self.queue.clone();
        let shared_clone = shared.clone();
        let join_handle = runtime.spawn(async move {
            self.run_loop(shared_clone, control_rx).await;
        });

        ShardSenderHandle {
            target,
            task_name,
            queue,
            shared,
            join_handle: Mutex::new(Some(join_handle)),
        }
    }

    async fn run_loop(self, shared: Arc<SenderShared>, mut control_rx: watch::Receiver<SenderControl>) {
        let name = self.task_name();
        let table = self.table.to_string();
        let shard_dir = self.target.dir_name();
        let mut backoff = self.config.backoff_initial;
        // (seq, attempts) for the batch at the head of the queue.
        let mut head_attempts: (u64, u32) = (0, 0);

        tracing::info!(table = %table, shard = %shard_dir, "shard sender starting");

        loop {
            let control = *control_rx.borrow_and_update();
            if control.shutdown {
                break;
            }
            self.sync_supervisor(&shared, &name, control.enabled);

            let pending = match self.directory.list_pending(&self.target) {
                Ok(pending) => pending,
                Err(e) => {
                    tracing::warn!(
                        table = %table,
                        shard = %shard_dir,
                        error = %e,
                        "listing shard queue failed"
                    );
                    if !self.backoff_wait(&mut control_rx, backoff).await {
                        break;
                    }
                    backoff = (backoff * 2).min(self.config.backoff_max);
                    continue;
                }
            };
            falcon_observability::record_pending(&table, &shard_dir, pending.len());

            let head = pending
                .into_iter()
                .next()
                .filter(|id| control.enabled || id.seq <= control.flush_upto);
            let Some(id) = head else {
                tokio::select! {
                    _ = self.queue.notified() => {}
                    changed = control_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            };

            if head_attempts.0 != id.seq {
                head_attempts = (id.seq, 0);
            }
            head_attempts.1 += 1;

            let started = Instant::now();
            match self.send_one(&shared, &id).await {
                Ok(rows) => {
                    falcon_observability::record_send(&table, &shard_dir, true, started.elapsed());
                    backoff = self.config.backoff_initial;
                    let recovered = {
                        let mut state = shared.state.write();
                        let recovered = state.consecutive_failures > 0;
                        state.consecutive_failures = 0;
                        state.alerting = false;
                        state.batches_sent += 1;
                        state.rows_sent += rows as u64;
                        state.last_sent_seq = Some(id.seq);
                        recovered
                    };
                    if recovered {
                        tracing::info!(
                            table = %table,
                            shard = %shard_dir,
                            batch = id.seq,
                            attempts = head_attempts.1,
                            "shard sender recovered"
                        );
                    }
                    shared.drained_through.send_modify(|d| *d = (*d).max(id.seq));
                    tracing::debug!(table = %table, batch = %id, rows, "batch sent");
                }
                Err(e) if e.is_undeliverable() => {
                    if !self.quarantine(&shared, &id, &e) && !self.backoff_wait(&mut control_rx, backoff).await {
                        break;
                    }
                }
                Err(e) => {
                    falcon_observability::record_send(&table, &shard_dir, false, started.elapsed());
                    let failures = {
                        let mut state = shared.state.write();
                        state.consecutive_failures += 1;
                        state.last_error = Some(e.to_string());
                        state.consecutive_failures
                    };
                    tracing::warn!(
                        table = %table,
                        shard = %shard_dir,
                        batch = id.seq,
                        attempt = head_attempts.1,
                        backoff_ms = backoff.as_millis() as u64,
                        kind = ?e.kind(),
                        error = %e,
                        "batch send failed, will retry"
                    );

                    if self.config.alert_after_failures > 0
                        && failures == self.config.alert_after_failures
                    {
                        shared.state.write().alerting = true;
                        tracing::error!(
                            table = %table,
                            shard = %shard_dir,
                            failures,
                            error = %e,
                            "shard sender keeps failing"
                        );
                        self.supervisor.set_failed(
                            &name,
                            &format!("{} consecutive send failures: {}", failures, e),
                        );
                    }

                    if self.config.max_send_attempts > 0
                        && head_attempts.1 >= self.config.max_send_attempts
                        && self.quarantine(&shared, &id, &e)
                    {
                        continue;
                    }

                    if !self.backoff_wait(&mut control_rx, backoff).await {
                        break;
                    }
                    backoff = (backoff * 2).min(self.config.backoff_max);
                }
            }
        }

        tracing::info!(table = %table, shard = %shard_dir, "shard sender stopped");
        self.supervisor.set_stopped(&name);
    }

    fn sync_supervisor(&self, shared: &SenderShared, name: &str, enabled: bool) {
        if shared.state.read().alerting {
            return;
        }
        if enabled {
            self.supervisor.set_running(name);
        } else {
            self.supervisor.set_paused(name);
        }
    }

    /// Deliver one batch and delete it. The batch is in flight for the
    /// whole call.
    async fn send_one(&self, shared: &SenderShared, id: &BatchId) -> FalconResult<usize> {
        shared.state.write().in_flight = Some(id.seq);
        let result = match self.deliver(id).await {
            Ok(rows) => match self.directory.remove(id) {
                Ok(()) => Ok(rows),
                Err(e) => {
                    tracing::error!(
                        batch = %id,
                        error = %e,
                        "batch delivered but not removed; it will be sent again"
                    );
                    Err(e.into())
                }
            },
            Err(e) => Err(e),
        };
        shared.state.write().in_flight = None;
        result
    }

    async fn deliver(&self, id: &BatchId) -> FalconResult<usize> {
        let batch = self.directory.read(id)?;
        let node = self.router.replica_addr(&self.target)?;
        self.executor
            .execute(InsertRequest {
                destination: &batch.header.destination,
                shard: self.target.shard,
                node: &node,
                rows: &batch.rows,
            })
            .await?;
        Ok(batch.rows.len())
    }

    /// Move a batch that will never be delivered out of the queue. Returns
    /// false if the move itself failed.
    fn quarantine(&self, shared: &SenderShared, id: &BatchId, reason: &FalconError) -> bool {
        shared.state.write().in_flight = Some(id.seq);
        let moved = self.directory.quarantine(id);
        shared.state.write().in_flight = None;
        match moved {
            Ok(path) => {
                falcon_observability::record_quarantined(&self.table.to_string(), &self.target.dir_name());
                shared.state.write().batches_quarantined += 1;
                shared.drained_through.send_modify(|d| *d = (*d).max(id.seq));
                tracing::error!(
                    table = %self.table,
                    batch = %id,
                    path = %path.display(),
                    reason = %reason,
                    "batch moved to broken/"
                );
                true
            }
            Err(e) => {
                tracing::error!(batch = %id, error = %e, "failed to quarantine batch");
                false
            }
        }
    }

    /// Sleep for `backoff`. Stop, start and a flush request cut it short so
    /// the loop re-reads control. Returns false if the sender must exit.
    async fn backoff_wait(
        &self,
        control_rx: &mut watch::Receiver<SenderControl>,
        backoff: Duration,
    ) -> bool {
        let (enabled_before, flush_before) = {
            let control = control_rx.borrow();
            (control.enabled, control.flush_upto)
        };
        let sleep = tokio::time::sleep(backoff);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                changed = control_rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                    let control = *control_rx.borrow_and_update();
                    if control.shutdown {
                        return false;
                    }
                    if control.enabled != enabled_before || control.flush_upto > flush_before {
                        return true;
                    }
                }
            }
        }
    }
}
