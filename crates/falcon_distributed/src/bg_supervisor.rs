//! Health registry for the queue's background tasks.
//!
//! Each shard sender registers as `NonCritical` and the cleanup worker as
//! `Critical`. A sender whose sends are stopped is `Paused`, not failed. Any
//! failed sender makes the queue `Alerting`; a failed cleanup worker makes it
//! `Degraded`, since shard directories are no longer reclaimed.

use std::collections::BTreeMap;
use std::time::Instant;

use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BgTaskState {
    Starting,
    Running,
    /// Alive but deliberately idle (a sender whose sends were stopped).
    Paused,
    Failed,
    Stopped,
}

impl std::fmt::Display for BgTaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BgTaskState::Starting => "STARTING",
            BgTaskState::Running => "RUNNING",
            BgTaskState::Paused => "PAUSED",
            BgTaskState::Failed => "FAILED",
            BgTaskState::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BgTaskCriticality {
    Critical,
    NonCritical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueHealth {
    Healthy,
    /// At least one shard sender is failing; other shards still deliver.
    Alerting,
    Degraded,
}

impl std::fmt::Display for QueueHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QueueHealth::Healthy => "HEALTHY",
            QueueHealth::Alerting => "ALERTING",
            QueueHealth::Degraded => "DEGRADED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct BgTaskInfo {
    pub name: String,
    pub criticality: BgTaskCriticality,
    pub state: BgTaskState,
    /// Reason of the current failure; cleared on the next transition.
    pub failure_reason: Option<String>,
    pub failures: u64,
    pub since: Instant,
}

#[derive(Debug, Clone)]
pub struct BgTaskSnapshot {
    /// Sorted by task name.
    pub tasks: Vec<BgTaskInfo>,
    pub health: QueueHealth,
    /// Failures since start, including tasks since unregistered.
    pub total_failures: u64,
}

#[derive(Default)]
struct Registry {
    tasks: BTreeMap<String, BgTaskInfo>,
    total_failures: u64,
}

impl Registry {
    fn health(&self) -> QueueHealth {
        let mut health = QueueHealth::Healthy;
        for task in self.tasks.values().filter(|t| t.state == BgTaskState::Failed) {
            match task.criticality {
                BgTaskCriticality::Critical => return QueueHealth::Degraded,
                BgTaskCriticality::NonCritical => health = QueueHealth::Alerting,
            }
        }
        health
    }
}

#[derive(Default)]
pub struct BgTaskSupervisor {
    inner: RwLock<Registry>,
}

impl BgTaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` in `Starting`. A sender restarted after its table was
    /// re-opened registers under the same name and starts over.
    pub fn register(&self, name: &str, criticality: BgTaskCriticality) {
        let info = BgTaskInfo {
            name: name.to_string(),
            criticality,
            state: BgTaskState::Starting,
            failure_reason: None,
            failures: 0,
            since: Instant::now(),
        };
        self.inner.write().tasks.insert(name.to_string(), info);
        tracing::debug!(component = name, criticality = ?criticality, "bg task registered");
    }

    pub fn unregister(&self, name: &str) {
        if self.inner.write().tasks.remove(name).is_some() {
            tracing::debug!(component = name, "bg task unregistered");
        }
    }

    pub fn set_running(&self, name: &str) {
        self.transition(name, BgTaskState::Running, None);
    }

    pub fn set_paused(&self, name: &str) {
        self.transition(name, BgTaskState::Paused, None);
    }

    pub fn set_failed(&self, name: &str, reason: &str) {
        self.transition(name, BgTaskState::Failed, Some(reason));
    }

    pub fn set_stopped(&self, name: &str) {
        self.transition(name, BgTaskState::Stopped, None);
    }

    fn transition(&self, name: &str, state: BgTaskState, reason: Option<&str>) {
        let mut inner = self.inner.write();
        let Some(task) = inner.tasks.get_mut(name) else {
            return;
        };
        if state == BgTaskState::Failed {
            task.failures += 1;
        } else if task.state == state {
            return;
        }
        task.state = state;
        task.failure_reason = reason.map(str::to_string);
        task.since = Instant::now();
        let critical = task.criticality == BgTaskCriticality::Critical;
        if state == BgTaskState::Failed {
            inner.total_failures += 1;
            tracing::error!(component = name, reason = reason.unwrap_or_default(), critical, "bg task failed");
        } else {
            tracing::debug!(component = name, state = %state, "bg task state change");
        }
    }

    pub fn state(&self, name: &str) -> Option<BgTaskState> {
        self.inner.read().tasks.get(name).map(|t| t.state)
    }

    pub fn health(&self) -> QueueHealth {
        self.inner.read().health()
    }

    pub fn snapshot(&self) -> BgTaskSnapshot {
        let inner = self.inner.read();
        BgTaskSnapshot {
            tasks: inner.tasks.values().cloned().collect(),
            health: inner.health(),
            total_failures: inner.total_failures,
        }
    }
}
