//! Shard router: splits the rows of one insert by destination shard.
//!
//! Slot routing: every shard contributes `weight` slots, in shard order. A
//! row goes to `slots[key % slots.len()]`, where `key` is the sharding key
//! column's value (integers as-is, strings hashed with xxHash3).
//!
//! Each non-empty shard bucket then fans out to its destinations:
//!
//! - a replica on this node (with `prefer_localhost_replica`) is executed
//!   locally; with `internal_replication = false` the shard's other replicas
//!   also get a queued copy
//! - otherwise `internal_replication = true` queues for the first replica
//!   and `internal_replication = false` queues one copy per replica
//!
//! Routing is all-or-nothing: a row that cannot be routed fails the whole
//! insert before anything is executed or queued.

use std::collections::HashMap;
use std::sync::Arc;

use falcon_common::config::ClusterConfig;
use falcon_common::datum::OwnedRow;
use falcon_common::error::{RemoteError, RoutingError};
use falcon_common::types::{NodeAddr, ReplicaNum, ShardNum, ShardTarget};

/// One shard of a cluster as seen by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardInfo {
    pub shard: ShardNum,
    pub weight: u32,
    pub internal_replication: bool,
    pub replicas: Vec<NodeAddr>,
}

/// Source of cluster layouts.
pub trait ClusterTopology: Send + Sync {
    /// Shards of `cluster` in shard-number order, or `None` if unknown.
    fn shards(&self, cluster: &str) -> Option<Arc<[ShardInfo]>>;
}

/// Topology fixed at startup from the `[[clusters]]` config section.
#[derive(Debug, Default)]
pub struct StaticTopology {
    clusters: HashMap<String, Arc<[ShardInfo]>>,
}

impl StaticTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(clusters: &[ClusterConfig]) -> Self {
        let mut topology = Self::new();
        for cluster in clusters {
            let shards = cluster
                .shards
                .iter()
                .enumerate()
                .map(|(idx, s)| ShardInfo {
                    shard: ShardNum(idx as u32 + 1),
                    weight: s.weight,
                    internal_replication: s.internal_replication,
                    replicas: s.replicas.clone(),
                })
                .collect();
            topology.insert(&cluster.name, shards);
        }
        topology
    }

    /// Add or replace a cluster.
    pub fn insert(&mut self, name: &str, shards: Vec<ShardInfo>) {
        self.clusters.insert(name.to_string(), shards.into());
    }

    pub fn cluster_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.keys().cloned().collect();
        names.sort();
        names
    }
}

impl ClusterTopology for StaticTopology {
    fn shards(&self, cluster: &str) -> Option<Arc<[ShardInfo]>> {
        self.clusters.get(cluster).cloned()
    }
}

/// Rows bound for one shard replica.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardRoute {
    pub target: ShardTarget,
    pub node: NodeAddr,
    /// Execute in-process now instead of queueing.
    pub local: bool,
    pub rows: Vec<OwnedRow>,
}

pub struct ShardRouter {
    topology: Arc<dyn ClusterTopology>,
    local_node: NodeAddr,
    prefer_localhost_replica: bool,
}

impl ShardRouter {
    pub fn new(
        topology: Arc<dyn ClusterTopology>,
        local_node: NodeAddr,
        prefer_localhost_replica: bool,
    ) -> Self {
        Self {
            topology,
            local_node,
            prefer_localhost_replica,
        }
    }

    pub fn local_node(&self) -> &NodeAddr {
        &self.local_node
    }

    /// Number of shards in `cluster`, or `None` if the cluster is unknown.
    pub fn shard_count(&self, cluster: &str) -> Option<usize> {
        self.topology.shards(cluster).map(|shards| shards.len())
    }

    /// Split `rows` into per-replica routes. `sharding_key` is the column
    /// index of the sharding key; it may be omitted only for single-shard
    /// clusters.
    pub fn route(
        &self,
        cluster: &str,
        sharding_key: Option<usize>,
        rows: Vec<OwnedRow>,
    ) -> Result<Vec<ShardRoute>, RoutingError> {
        let shards = self
            .topology
            .shards(cluster)
            .ok_or_else(|| RoutingError::UnknownCluster(cluster.to_string()))?;
        if shards.is_empty() {
            return Err(RoutingError::EmptyCluster(cluster.to_string()));
        }
        if let Some(shard) = shards.iter().find(|s| s.replicas.is_empty()) {
            return Err(RoutingError::NoReplicas {
                cluster: cluster.to_string(),
                shard: shard.shard.0,
            });
        }
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let buckets = split_rows(cluster, &shards, sharding_key, rows)?;
        let mut routes = Vec::new();
        for (shard, rows) in shards.iter().zip(buckets) {
            if !rows.is_empty() {
                self.fan_out(cluster, shard, rows, &mut routes);
            }
        }
        Ok(routes)
    }

    fn fan_out(
        &self,
        cluster: &str,
        shard: &ShardInfo,
        mut rows: Vec<OwnedRow>,
        routes: &mut Vec<ShardRoute>,
    ) {
        let local = if self.prefer_localhost_replica {
            shard.replicas.iter().position(|r| *r == self.local_node)
        } else {
            None
        };

        // (replica index, is local)
        let destinations: Vec<(usize, bool)> = match local {
            Some(idx) if shard.internal_replication => vec![(idx, true)],
            Some(idx) => std::iter::once((idx, true))
                .chain((0..shard.replicas.len()).filter(|i| *i != idx).map(|i| (i, false)))
                .collect(),
            None if shard.internal_replication => vec![(0, false)],
            None => (0..shard.replicas.len()).map(|i| (i, false)).collect(),
        };

        let mut iter = destinations.into_iter().peekable();
        while let Some((idx, is_local)) = iter.next() {
            let batch = if iter.peek().is_some() {
                rows.clone()
            } else {
                std::mem::take(&mut rows)
            };
            routes.push(ShardRoute {
                target: ShardTarget::new(cluster, shard.shard, ReplicaNum(idx as u32 + 1)),
                node: shard.replicas[idx].clone(),
                local: is_local,
                rows: batch,
            });
        }
    }

    /// Address of the replica a queued batch is bound to.
    pub fn replica_addr(&self, target: &ShardTarget) -> Result<NodeAddr, RemoteError> {
        self.topology
            .shards(&target.cluster)
            .and_then(|shards| {
                let shard = shards.get((target.shard.0 as usize).checked_sub(1)?)?;
                shard
                    .replicas
                    .get((target.replica.0 as usize).checked_sub(1)?)
                    .cloned()
            })
            .ok_or_else(|| RemoteError::UnknownReplica {
                target: target.to_string(),
            })
    }
}

/// Shard index per slot: shard `i` appears `weight_i` times.
pub fn slot_table(shards: &[ShardInfo]) -> Vec<usize> {
    shards
        .iter()
        .enumerate()
        .flat_map(|(idx, s)| std::iter::repeat(idx).take(s.weight as usize))
        .collect()
}

fn split_rows(
    cluster: &str,
    shards: &[ShardInfo],
    sharding_key: Option<usize>,
    rows: Vec<OwnedRow>,
) -> Result<Vec<Vec<OwnedRow>>, RoutingError> {
    let mut buckets: Vec<Vec<OwnedRow>> = vec![Vec::new(); shards.len()];
    if shards.len() == 1 {
        buckets[0] = rows;
        return Ok(buckets);
    }

    let column = sharding_key.ok_or_else(|| RoutingError::ShardingKeyRequired {
        cluster: cluster.to_string(),
        shards: shards.len(),
    })?;
    let slots = slot_table(shards);
    if slots.is_empty() {
        return Err(RoutingError::ZeroTotalWeight(cluster.to_string()));
    }

    for row in rows {
        let datum = row
            .get(column)
            .ok_or_else(|| RoutingError::ShardingKeyOutOfRange {
                column,
                width: row.len(),
            })?;
        if datum.is_null() {
            return Err(RoutingError::NullShardingKey { column });
        }
        let value = datum
            .shard_key_value()
            .ok_or_else(|| RoutingError::UnsupportedShardingKey {
                column,
                value: datum.to_string(),
            })?;
        let idx = slots[(value % slots.len() as u64) as usize];
        buckets[idx].push(row);
    }
    Ok(buckets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use falcon_common::datum::Datum;

    fn local() -> NodeAddr {
        NodeAddr::new("127.0.0.1", 9000)
    }

    fn remote(n: u8) -> NodeAddr {
        NodeAddr::new(format!("127.0.0.{}", n), 9000)
    }

    fn shard(n: u32, weight: u32, internal: bool, replicas: Vec<NodeAddr>) -> ShardInfo {
        ShardInfo {
            shard: ShardNum(n),
            weight,
            internal_replication: internal,
            replicas,
        }
    }

    fn router(shards: Vec<ShardInfo>, prefer_local: bool) -> ShardRouter {
        let mut topology = StaticTopology::new();
        topology.insert("c", shards);
        ShardRouter::new(Arc::new(topology), local(), prefer_local)
    }

    fn rows(range: std::ops::Range<i64>) -> Vec<OwnedRow> {
        range.map(|i| OwnedRow::new(vec![Datum::Int64(i)])).collect()
    }

    fn two_shards() -> Vec<ShardInfo> {
        vec![
            shard(1, 1, false, vec![local()]),
            shard(2, 1, false, vec![remote(2)]),
        ]
    }

    #[test]
    fn test_two_shards_local_and_remote() {
        let routes = router(two_shards(), true).route("c", Some(0), rows(0..100)).unwrap();
        assert_eq!(routes.len(), 2);

        let local_route = routes.iter().find(|r| r.local).unwrap();
        assert_eq!(local_route.target.dir_name(), "shard1_replica1");
        assert_eq!(local_route.rows.len(), 50);
        assert!(local_route.rows.iter().all(|r| r.values[0].as_i64().unwrap() % 2 == 0));

        let remote_route = routes.iter().find(|r| !r.local).unwrap();
        assert_eq!(remote_route.target.dir_name(), "shard2_replica1");
        assert_eq!(remote_route.node, remote(2));
        assert_eq!(remote_route.rows.len(), 50);
    }

    #[test]
    fn test_routing_preserves_row_order_within_shard() {
        let routes = router(two_shards(), true).route("c", Some(0), rows(0..10)).unwrap();
        let remote_route = routes.iter().find(|r| !r.local).unwrap();
        let keys: Vec<i64> = remote_route.rows.iter().map(|r| r.values[0].as_i64().unwrap()).collect();
        assert_eq!(keys, vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn test_weighted_slots() {
        let shards = vec![
            shard(1, 1, false, vec![remote(2)]),
            shard(2, 2, false, vec![remote(3)]),
        ];
        assert_eq!(slot_table(&shards), vec![0, 1, 1]);
        let routes = router(shards, true).route("c", Some(0), rows(0..6)).unwrap();
        assert_eq!(routes[0].target.shard, ShardNum(1));
        assert_eq!(routes[0].rows.len(), 2);
        assert_eq!(routes[1].target.shard, ShardNum(2));
        assert_eq!(routes[1].rows.len(), 4);
    }

    #[test]
    fn test_zero_weight_shard_receives_nothing() {
        let shards = vec![
            shard(1, 0, false, vec![remote(2)]),
            shard(2, 1, false, vec![remote(3)]),
        ];
        let routes = router(shards, true).route("c", Some(0), rows(0..10)).unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].target.shard, ShardNum(2));
    }

    #[test]
    fn test_zero_total_weight_rejected() {
        let shards = vec![
            shard(1, 0, false, vec![remote(2)]),
            shard(2, 0, false, vec![remote(3)]),
        ];
        assert_eq!(
            router(shards, true).route("c", Some(0), rows(0..1)).unwrap_err(),
            RoutingError::ZeroTotalWeight("c".into())
        );
    }

    #[test]
    fn test_negative_keys_route_deterministically() {
        let r = router(two_shards(), true);
        let a = r.route("c", Some(0), rows(-5..0)).unwrap();
        let b = r.route("c", Some(0), rows(-5..0)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.iter().map(|r| r.rows.len()).sum::<usize>(), 5);
    }

    #[test]
    fn test_sharding_key_required_for_multiple_shards() {
        let err = router(two_shards(), true).route("c", None, rows(0..1)).unwrap_err();
        assert!(matches!(err, RoutingError::ShardingKeyRequired { shards: 2, .. }));
    }

    #[test]
    fn test_single_shard_needs_no_key() {
        let r = router(vec![shard(1, 1, false, vec![remote(2)])], true);
        let routes = r.route("c", None, rows(0..7)).unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].rows.len(), 7);
    }

    #[test]
    fn test_bad_sharding_key_values_fail_whole_insert() {
        let r = router(two_shards(), true);
        let mut input = rows(0..3);
        input.push(OwnedRow::new(vec![Datum::Null]));
        assert_eq!(
            r.route("c", Some(0), input).unwrap_err(),
            RoutingError::NullShardingKey { column: 0 }
        );

        assert!(matches!(
            r.route("c", Some(3), rows(0..1)).unwrap_err(),
            RoutingError::ShardingKeyOutOfRange { column: 3, width: 1 }
        ));

        let floats = vec![OwnedRow::new(vec![Datum::Float64(0.5)])];
        assert!(matches!(
            r.route("c", Some(0), floats).unwrap_err(),
            RoutingError::UnsupportedShardingKey { .. }
        ));
    }

    #[test]
    fn test_text_keys_hash() {
        let r = router(two_shards(), true);
        let input: Vec<OwnedRow> = (0..50)
            .map(|i| OwnedRow::new(vec![Datum::Text(format!("user-{}", i))]))
            .collect();
        let routes = r.route("c", Some(0), input).unwrap();
        assert_eq!(routes.iter().map(|r| r.rows.len()).sum::<usize>(), 50);
        assert_eq!(routes.len(), 2);
    }

    #[test]
    fn test_unknown_cluster() {
        assert_eq!(
            router(two_shards(), true).route("nope", Some(0), rows(0..1)).unwrap_err(),
            RoutingError::UnknownCluster("nope".into())
        );
        let r = router(two_shards(), true);
        assert_eq!(r.shard_count("c"), Some(2));
        assert_eq!(r.shard_count("nope"), None);
    }

    #[test]
    fn test_shard_without_replicas_rejected() {
        let r = router(vec![shard(1, 1, false, vec![])], true);
        assert!(matches!(
            r.route("c", None, rows(0..1)).unwrap_err(),
            RoutingError::NoReplicas { shard: 1, .. }
        ));
    }

    #[test]
    fn test_empty_insert_has_no_routes() {
        assert!(router(two_shards(), true).route("c", Some(0), Vec::new()).unwrap().is_empty());
    }

    #[test]
    fn test_prefer_localhost_replica_disabled_queues_local_shard() {
        let routes = router(two_shards(), false).route("c", Some(0), rows(0..10)).unwrap();
        assert_eq!(routes.len(), 2);
        assert!(routes.iter().all(|r| !r.local));
        assert_eq!(routes[0].target.dir_name(), "shard1_replica1");
        assert_eq!(routes[0].node, local());
    }

    #[test]
    fn test_replica_fan_out_without_internal_replication() {
        let r = router(vec![shard(1, 1, false, vec![remote(2), remote(3)])], true);
        let routes = r.route("c", None, rows(0..4)).unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].target.dir_name(), "shard1_replica1");
        assert_eq!(routes[1].target.dir_name(), "shard1_replica2");
        assert_eq!(routes[1].node, remote(3));
        assert_eq!(routes[0].rows, routes[1].rows);
    }

    #[test]
    fn test_internal_replication_picks_first_replica() {
        let r = router(vec![shard(1, 1, true, vec![remote(2), remote(3)])], true);
        let routes = r.route("c", None, rows(0..4)).unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].target.dir_name(), "shard1_replica1");
    }

    #[test]
    fn test_local_replica_with_peers() {
        let r = router(vec![shard(1, 1, false, vec![remote(2), local()])], true);
        let routes = r.route("c", None, rows(0..3)).unwrap();
        assert_eq!(routes.len(), 2);
        assert!(routes[0].local);
        assert_eq!(routes[0].target.dir_name(), "shard1_replica2");
        assert!(!routes[1].local);
        assert_eq!(routes[1].target.dir_name(), "shard1_replica1");

        // With internal replication the local copy is enough.
        let r = router(vec![shard(1, 1, true, vec![remote(2), local()])], true);
        let routes = r.route("c", None, rows(0..3)).unwrap();
        assert_eq!(routes.len(), 1);
        assert!(routes[0].local);
    }

    #[test]
    fn test_replica_addr() {
        let r = router(two_shards(), true);
        let t = ShardTarget::new("c", ShardNum(2), ReplicaNum(1));
        assert_eq!(r.replica_addr(&t).unwrap(), remote(2));
        let missing = ShardTarget::new("c", ShardNum(3), ReplicaNum(1));
        assert!(matches!(r.replica_addr(&missing), Err(RemoteError::UnknownReplica { .. })));
        let zero = ShardTarget::new("c", ShardNum(0), ReplicaNum(1));
        assert!(r.replica_addr(&zero).is_err());
    }

    #[test]
    fn test_from_config() {
        let config = falcon_common::config::DistributedQueueConfig::from_toml_str(
            r#"
[[clusters]]
name = "two_shards"
[[clusters.shards]]
replicas = ["127.0.0.1:9000"]
[[clusters.shards]]
weight = 3
internal_replication = true
replicas = ["127.0.0.2:9000", "127.0.0.3:9000"]
"#,
        )
        .unwrap();
        let topology = StaticTopology::from_config(&config.clusters);
        assert_eq!(topology.cluster_names(), vec!["two_shards".to_string()]);
        let shards = topology.shards("two_shards").unwrap();
        assert_eq!(shards[1].shard, ShardNum(2));
        assert_eq!(shards[1].weight, 3);
        assert!(shards[1].internal_replication);
        assert_eq!(shards[1].replicas.len(), 2);
    }
}
