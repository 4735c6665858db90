#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use falcon_common::config::{ClusterConfig, DistributedQueueConfig, ShardConfig};
use falcon_common::datum::{Datum, OwnedRow};
use falcon_common::types::{NodeAddr, TableRef};
use falcon_distributed::{DistributedQueueService, DistributedTableSpec, InMemoryExecutor};
use tempfile::TempDir;

pub const CLUSTER: &str = "test_cluster_two_shards";

pub fn local_node() -> NodeAddr {
    NodeAddr::new("127.0.0.1", 9000)
}

pub fn remote_node() -> NodeAddr {
    NodeAddr::new("127.0.0.2", 9000)
}

pub fn dist_table() -> TableRef {
    TableRef::new("test", "dist_foo")
}

pub fn dest_table() -> TableRef {
    TableRef::new("test", "foo")
}

pub fn shard(replicas: Vec<NodeAddr>, internal_replication: bool) -> ShardConfig {
    ShardConfig {
        weight: 1,
        internal_replication,
        replicas,
    }
}

/// Node 127.0.0.1:9000 with the two-shard cluster: shard 1 local, shard 2 remote.
pub fn two_shard_config(data_dir: &TempDir) -> DistributedQueueConfig {
    let mut config = DistributedQueueConfig::default();
    config.node.host = "127.0.0.1".into();
    config.node.port = 9000;
    config.distributed.data_dir = data_dir.path().display().to_string();
    config.distributed.cleanup_period_ms = 100;
    config.distributed.backoff_initial_ms = 5;
    config.distributed.backoff_max_ms = 50;
    config.distributed.fsync_batches = false;
    config.clusters.push(ClusterConfig {
        name: CLUSTER.into(),
        shards: vec![
            shard(vec![local_node()], false),
            shard(vec![remote_node()], false),
        ],
    });
    config
}

pub fn table_spec(cluster: &str) -> DistributedTableSpec {
    DistributedTableSpec {
        table: dist_table(),
        cluster: cluster.into(),
        destination: dest_table(),
        sharding_key: Some(0),
    }
}

pub fn int_rows(range: std::ops::Range<i64>) -> Vec<OwnedRow> {
    range.map(|i| OwnedRow::new(vec![Datum::Int64(i)])).collect()
}

pub fn keys(rows: &[OwnedRow]) -> Vec<i64> {
    rows.iter()
        .filter_map(|r| r.get(0).and_then(Datum::as_i64))
        .collect()
}

pub fn start_service(
    config: DistributedQueueConfig,
) -> (DistributedQueueService, Arc<InMemoryExecutor>) {
    let exec = Arc::new(InMemoryExecutor::new());
    let service = DistributedQueueService::start(config, exec.clone()).unwrap();
    (service, exec)
}

/// Poll `cond` every 5ms until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
