//! QueryExecutor: the query-execution service the queue hands rows to.
//!
//! The same trait serves the local path (rows for a shard with a replica on
//! this node, executed before the insert returns) and the remote path (the
//! shard senders delivering queued batches).
//!
//! Implementations:
//! - `InMemoryExecutor`: per-node in-memory tables with fault injection,
//!   used by tests and the single-process demo setup.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use falcon_common::datum::OwnedRow;
use falcon_common::error::RemoteError;
use falcon_common::types::{NodeAddr, ShardNum, TableRef};

/// One INSERT as seen by the query-execution service.
#[derive(Debug, Clone, Copy)]
pub struct InsertRequest<'a> {
    pub destination: &'a TableRef,
    pub shard: ShardNum,
    pub node: &'a NodeAddr,
    pub rows: &'a [OwnedRow],
}

/// Executes an INSERT on one replica. Must be all-or-nothing per call: an
/// error means no row of the request was applied.
#[async_trait::async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, request: InsertRequest<'_>) -> Result<(), RemoteError>;
}

/// In-memory executor keyed by `(node, table)`.
///
/// Fault injection:
/// - `set_unreachable(node, true)`: every request to `node` fails
/// - `fail_next(node, n)`: the next `n` requests to `node` fail
/// - `set_delay(node, d)`: requests to `node` take `d` before applying
pub struct InMemoryExecutor {
    tables: Mutex<HashMap<(NodeAddr, TableRef), Vec<OwnedRow>>>,
    unreachable: Mutex<HashSet<NodeAddr>>,
    fail_next: Mutex<HashMap<NodeAddr, u32>>,
    delays: Mutex<HashMap<NodeAddr, Duration>>,
    calls: AtomicU64,
    failures: AtomicU64,
}

impl InMemoryExecutor {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            unreachable: Mutex::new(HashSet::new()),
            fail_next: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn set_unreachable(&self, node: &NodeAddr, unreachable: bool) {
        let mut set = self.unreachable.lock();
        if unreachable {
            set.insert(node.clone());
        } else {
            set.remove(node);
        }
    }

    pub fn fail_next(&self, node: &NodeAddr, count: u32) {
        self.fail_next.lock().insert(node.clone(), count);
    }

    pub fn set_delay(&self, node: &NodeAddr, delay: Duration) {
        if delay.is_zero() {
            self.delays.lock().remove(node);
        } else {
            self.delays.lock().insert(node.clone(), delay);
        }
    }

    /// Rows stored for `table` on `node`, in arrival order.
    pub fn rows(&self, node: &NodeAddr, table: &TableRef) -> Vec<OwnedRow> {
        self.tables
            .lock()
            .get(&(node.clone(), table.clone()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn row_count(&self, node: &NodeAddr, table: &TableRef) -> usize {
        self.tables
            .lock()
            .get(&(node.clone(), table.clone()))
            .map_or(0, Vec::len)
    }

    /// Rows stored for `table` across all nodes.
    pub fn total_rows(&self, table: &TableRef) -> usize {
        self.tables
            .lock()
            .iter()
            .filter(|((_, t), _)| t == table)
            .map(|(_, rows)| rows.len())
            .sum()
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn check_fault(&self, node: &NodeAddr) -> Result<(), RemoteError> {
        if self.unreachable.lock().contains(node) {
            return Err(RemoteError::Unreachable {
                node: node.to_string(),
                reason: "connection refused".into(),
            });
        }
        let mut fail_next = self.fail_next.lock();
        if let Some(remaining) = fail_next.get_mut(node) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RemoteError::Unreachable {
                    node: node.to_string(),
                    reason: "injected failure".into(),
                });
            }
        }
        Ok(())
    }
}

impl Default for InMemoryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl QueryExecutor for InMemoryExecutor {
    async fn execute(&self, request: InsertRequest<'_>) -> Result<(), RemoteError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let delay = self.delays.lock().get(request.node).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Err(e) = self.check_fault(request.node) {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        self.tables
            .lock()
            .entry((request.node.clone(), request.destination.clone()))
            .or_default()
            .extend_from_slice(request.rows);
        Ok(())
    }
}
