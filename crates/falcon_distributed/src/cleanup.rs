//! Cleanup worker: periodically removes shard queue directories that have
//! been fully drained.
//!
//! A directory is removed only when its sender is RUNNING, nothing is in
//! flight, and no batch file is pending. STOPPED senders are skipped, so an
//! operator who stopped sends keeps seeing the directories the inserts
//! created. The removal itself is `remove_dir`, which fails on a non-empty
//! directory; a batch enqueued during the sweep therefore always survives.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::watch;

use falcon_common::types::ShardTarget;

use crate::bg_supervisor::{BgTaskCriticality, BgTaskSupervisor};
use crate::directory::{BatchDirectory, RemoveOutcome};
use crate::sender::{SenderState, SenderStatus};

pub const CLEANUP_TASK_NAME: &str = "distributed-cleanup";

/// What happened to the shard directories of one table during a sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: Vec<ShardTarget>,
    /// Empty at the check, not empty at removal: a batch arrived.
    pub raced: Vec<ShardTarget>,
    pub skipped_stopped: usize,
    pub skipped_in_flight: usize,
    pub skipped_pending: usize,
    /// Kept because `broken/` holds quarantined batches.
    pub kept_broken: usize,
    pub errors: usize,
}

impl SweepReport {
    pub fn skipped(&self) -> usize {
        self.skipped_stopped + self.skipped_in_flight + self.skipped_pending + self.kept_broken
    }
}

/// Anything whose queue directories the worker sweeps.
pub trait CleanupSource: Send + Sync {
    fn name(&self) -> String;
    fn sweep(&self) -> SweepReport;
}

/// Sweep one table's queue root. `sender_state` returns the state of the
/// sender owning a directory, if there is one.
pub fn sweep_directory(
    directory: &BatchDirectory,
    sender_state: impl Fn(&ShardTarget) -> Option<SenderState>,
) -> SweepReport {
    let mut report = SweepReport::default();
    let targets = match directory.list_shard_directories() {
        Ok(targets) => targets,
        Err(e) => {
            tracing::warn!(table = %directory.table(), error = %e, "cleanup: listing queue root failed");
            report.errors += 1;
            return report;
        }
    };

    for target in targets {
        match sender_state(&target) {
            Some(state) if state.status == SenderStatus::Stopped => {
                report.skipped_stopped += 1;
                continue;
            }
            Some(state) if state.is_in_flight() => {
                report.skipped_in_flight += 1;
                continue;
            }
            _ => {}
        }

        match directory.list_pending(&target) {
            Ok(pending) if !pending.is_empty() => {
                report.skipped_pending += 1;
                continue;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(shard = %target, error = %e, "cleanup: listing shard directory failed");
                report.errors += 1;
                continue;
            }
        }

        match directory.remove_if_empty(&target) {
            Ok(RemoveOutcome::Removed) => {
                tracing::info!(table = %directory.table(), shard = %target.dir_name(), "removed drained shard directory");
                report.removed.push(target);
            }
            Ok(RemoveOutcome::NotEmpty) => {
                tracing::debug!(shard = %target, "batch arrived during cleanup, keeping directory");
                report.raced.push(target);
            }
            Ok(RemoveOutcome::HasBroken) => report.kept_broken += 1,
            Ok(RemoveOutcome::Missing) => {}
            Err(e) => {
                tracing::warn!(shard = %target, error = %e, "cleanup: removing shard directory failed");
                report.errors += 1;
            }
        }
    }
    report
}

/// Tables the worker sweeps. Holds weak references, so a dropped table
/// simply disappears from the sweep.
#[derive(Default)]
pub struct CleanupRegistry {
    sources: Mutex<Vec<Weak<dyn CleanupSource>>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, source: Weak<dyn CleanupSource>) {
        self.sources.lock().push(source);
    }

    pub fn unregister(&self, name: &str) {
        self.sources
            .lock()
            .retain(|w| w.upgrade().is_some_and(|s| s.name() != name));
    }

    pub fn len(&self) -> usize {
        let mut sources = self.sources.lock();
        sources.retain(|w| w.strong_count() > 0);
        sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweep every live source once, on the calling thread.
    pub fn sweep_all(&self) -> Vec<(String, SweepReport)> {
        let sources: Vec<Arc<dyn CleanupSource>> = {
            let mut sources = self.sources.lock();
            sources.retain(|w| w.strong_count() > 0);
            sources.iter().filter_map(Weak::upgrade).collect()
        };
        sources.iter().map(|s| (s.name(), s.sweep())).collect()
    }
}

/// Condvar-backed wakeup for the worker thread: wakes on shutdown, on an
/// explicit trigger, or when the period elapses.
#[derive(Clone)]
struct CleanupSignal {
    inner: Arc<SignalInner>,
}

struct SignalInner {
    state: Mutex<SignalState>,
    condvar: Condvar,
}

#[derive(Default)]
struct SignalState {
    shutdown: bool,
    triggered: bool,
}

impl CleanupSignal {
    fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                state: Mutex::new(SignalState::default()),
                condvar: Condvar::new(),
            }),
        }
    }

    fn shutdown(&self) {
        self.inner.state.lock().shutdown = true;
        self.inner.condvar.notify_all();
    }

    fn trigger(&self) {
        self.inner.state.lock().triggered = true;
        self.inner.condvar.notify_all();
    }

    /// Wait up to `period`. Returns true if shutdown was requested.
    fn wait(&self, period: Duration) -> bool {
        let deadline = Instant::now() + period;
        let mut state = self.inner.state.lock();
        while !state.shutdown && !state.triggered {
            if self.inner.condvar.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.triggered = false;
        state.shutdown
    }
}

/// Background thread running a sweep every `period`.
pub struct CleanupWorker {
    signal: CleanupSignal,
    registry: Arc<CleanupRegistry>,
    ticks: Arc<watch::Sender<u64>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl CleanupWorker {
    /// Start the worker thread.
    ///
    /// Returns `Err` if the thread cannot be spawned.
    pub fn start(
        registry: Arc<CleanupRegistry>,
        period: Duration,
        supervisor: Arc<BgTaskSupervisor>,
    ) -> Result<Self, std::io::Error> {
        let signal = CleanupSignal::new();
        let (ticks, _) = watch::channel(0u64);
        let ticks = Arc::new(ticks);
        supervisor.register(CLEANUP_TASK_NAME, BgTaskCriticality::Critical);

        let handle = {
            let signal = signal.clone();
            let registry = registry.clone();
            let ticks = ticks.clone();
            let supervisor = supervisor.clone();
            std::thread::Builder::new()
                .name("falcon-dist-cleanup".into())
                .spawn(move || {
                    tracing::info!(period_ms = period.as_millis() as u64, "cleanup worker started");
                    supervisor.set_running(CLEANUP_TASK_NAME);
                    loop {
                        if signal.wait(period) {
                            break;
                        }
                        match std::panic::catch_unwind(AssertUnwindSafe(|| registry.sweep_all())) {
                            Ok(reports) => {
                                record_tick(&reports);
                                supervisor.set_running(CLEANUP_TASK_NAME);
                            }
                            Err(_) => supervisor.set_failed(CLEANUP_TASK_NAME, "cleanup sweep panicked"),
                        }
                        ticks.send_modify(|t| *t += 1);
                    }
                    supervisor.set_stopped(CLEANUP_TASK_NAME);
                    tracing::info!("cleanup worker stopped");
                })?
        };

        Ok(Self {
            signal,
            registry,
            ticks,
            handle: Some(handle),
        })
    }

    /// Completed sweeps since start.
    pub fn tick_count(&self) -> u64 {
        *self.ticks.borrow()
    }

    pub fn subscribe_ticks(&self) -> watch::Receiver<u64> {
        self.ticks.subscribe()
    }

    /// Run the next sweep now instead of at the end of the period.
    pub fn trigger(&self) {
        self.signal.trigger();
    }

    /// Sweep once on the calling thread (does not count as a tick).
    pub fn run_once(&self) -> Vec<(String, SweepReport)> {
        self.registry.sweep_all()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the worker and wait for the thread to exit.
    pub fn stop(&mut self) {
        self.signal.shutdown();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for CleanupWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wait until `ticks` counts more than `after` sweeps.
pub async fn wait_for_tick(mut ticks: watch::Receiver<u64>, after: u64, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, ticks.wait_for(|t| *t > after)).await,
        Ok(Ok(_))
    )
}

fn record_tick(reports: &[(String, SweepReport)]) {
    let removed: usize = reports.iter().map(|(_, r)| r.removed.len()).sum();
    let raced: usize = reports.iter().map(|(_, r)| r.raced.len()).sum();
    let skipped: usize = reports.iter().map(|(_, r)| r.skipped()).sum();
    falcon_observability::record_cleanup_tick(removed, raced, skipped);
    if removed > 0 || raced > 0 {
        tracing::debug!(tables = reports.len(), removed, raced, skipped, "cleanup sweep done");
    }
}
