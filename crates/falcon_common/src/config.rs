use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::NodeAddr;

/// Top-level configuration for a node hosting distributed tables
/// (`falcon_dist.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DistributedQueueConfig {
    /// Static cluster topology used by the shard router.
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub distributed: DistributedConfig,
}

/// Identity of the executing node. A shard replica whose address equals this
/// one is considered local.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
}

impl NodeConfig {
    pub fn addr(&self) -> NodeAddr {
        NodeAddr::new(self.host.clone(), self.port)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
        }
    }
}

/// `[distributed]` section: queue, sender and cleanup behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    /// Root for queue directories: `<data_dir>/<database>/<table>/...`.
    pub data_dir: String,
    /// Execute rows for a shard that has a replica on this node in-process
    /// instead of queueing them (default: true).
    pub prefer_localhost_replica: bool,
    /// Whether senders start RUNNING (default: true).
    pub send_enabled_by_default: bool,
    /// Interval between cleanup sweeps in milliseconds (default: 60000).
    pub cleanup_period_ms: u64,
    /// First retry delay after a failed send (doubles up to `backoff_max_ms`).
    pub backoff_initial_ms: u64,
    /// Maximum retry delay after repeated failed sends.
    pub backoff_max_ms: u64,
    /// Attempts per batch before it is moved to `broken/` (0 = retry forever).
    pub max_send_attempts: u32,
    /// Consecutive failures after which a sender raises an alert.
    pub alert_after_failures: u32,
    /// fsync batch files and their directory before acknowledging an insert.
    pub fsync_batches: bool,
    /// Send remote rows inline instead of queueing them.
    pub insert_distributed_sync: bool,
    /// Per-shard timeout for inline sends when `insert_distributed_sync` is set.
    pub sync_insert_timeout_ms: u64,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            data_dir: "./falcon_data".to_string(),
            prefer_localhost_replica: true,
            send_enabled_by_default: true,
            cleanup_period_ms: 60_000,
            backoff_initial_ms: 100,
            backoff_max_ms: 30_000,
            max_send_attempts: 0,
            alert_after_failures: 10,
            fsync_batches: true,
            insert_distributed_sync: false,
            sync_insert_timeout_ms: 10_000,
        }
    }
}

impl DistributedConfig {
    pub fn cleanup_period(&self) -> Duration {
        Duration::from_millis(self.cleanup_period_ms)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn sync_insert_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_insert_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.data_dir.trim().is_empty() {
            return Err("distributed.data_dir must be set".into());
        }
        if self.cleanup_period_ms == 0 {
            return Err("distributed.cleanup_period_ms must be >= 1".into());
        }
        if self.backoff_initial_ms == 0 {
            return Err("distributed.backoff_initial_ms must be >= 1".into());
        }
        if self.backoff_max_ms < self.backoff_initial_ms {
            return Err(format!(
                "distributed.backoff_max_ms ({}) must be >= backoff_initial_ms ({})",
                self.backoff_max_ms, self.backoff_initial_ms
            ));
        }
        if self.insert_distributed_sync && self.sync_insert_timeout_ms == 0 {
            return Err("distributed.sync_insert_timeout_ms must be >= 1 for sync inserts".into());
        }
        Ok(())
    }
}

/// One named cluster: an ordered list of shards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    pub shards: Vec<ShardConfig>,
}

/// One shard. Its 1-based position in `ClusterConfig::shards` is its shard number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Relative share of rows routed to this shard (0 = receives nothing).
    #[serde(default = "default_shard_weight")]
    pub weight: u32,
    /// When true, only one replica receives each batch and the shard replicates
    /// internally. When false, every replica receives its own copy.
    #[serde(default)]
    pub internal_replication: bool,
    pub replicas: Vec<NodeAddr>,
}

fn default_shard_weight() -> u32 {
    1
}

impl DistributedQueueConfig {
    pub fn cluster(&self, name: &str) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|c| c.name == name)
    }

    /// Validate the whole configuration, including the static topology.
    pub fn validate(&self) -> Result<(), String> {
        if self.node.host.trim().is_empty() {
            return Err("node.host must be set".into());
        }
        self.distributed.validate()?;

        let mut names = HashSet::new();
        for cluster in &self.clusters {
            if cluster.name.trim().is_empty() {
                return Err("cluster name must not be empty".into());
            }
            if !names.insert(cluster.name.as_str()) {
                return Err(format!("cluster '{}' is defined twice", cluster.name));
            }
            if cluster.shards.is_empty() {
                return Err(format!("cluster '{}' must have at least one shard", cluster.name));
            }
            for (idx, shard) in cluster.shards.iter().enumerate() {
                if shard.replicas.is_empty() {
                    return Err(format!(
                        "cluster '{}' shard {} must have at least one replica",
                        cluster.name,
                        idx + 1
                    ));
                }
                let mut seen = HashSet::new();
                for replica in &shard.replicas {
                    if !seen.insert(replica) {
                        return Err(format!(
                            "cluster '{}' shard {} lists replica {} twice",
                            cluster.name,
                            idx + 1,
                            replica
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn from_toml_str(text: &str) -> Result<Self, String> {
        let config: Self = toml::from_str(text).map_err(|e| e.to_string())?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file. A missing file yields the defaults; a file that
    /// exists but does not parse or validate is an error.
    pub fn load(path: &Path) -> Result<Self, String> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let config = Self::from_toml_str(&content)
                    .map_err(|e| format!("{}: {}", path.display(), e))?;
                tracing::info!("Loaded config from {}", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("Config file {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(format!("{}: {}", path.display(), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_SHARDS: &str = r#"
[node]
host = "127.0.0.1"
port = 9000

[distributed]
data_dir = "/var/lib/falcon"
cleanup_period_ms = 400
send_enabled_by_default = false

[[clusters]]
name = "test_cluster_two_shards"

[[clusters.shards]]
replicas = ["127.0.0.1:9000"]

[[clusters.shards]]
weight = 2
replicas = ["127.0.0.2:9000"]
"#;

    #[test]
    fn test_default_config_valid() {
        assert!(DistributedQueueConfig::default().validate().is_ok());
    }

    #[test]
    fn test_parse_two_shard_cluster() {
        let config = DistributedQueueConfig::from_toml_str(TWO_SHARDS).unwrap();
        assert_eq!(config.distributed.cleanup_period(), Duration::from_millis(400));
        assert!(!config.distributed.send_enabled_by_default);
        // Unspecified fields keep their defaults.
        assert!(config.distributed.prefer_localhost_replica);
        assert_eq!(config.distributed.backoff_initial_ms, 100);

        let cluster = config.cluster("test_cluster_two_shards").unwrap();
        assert_eq!(cluster.shards.len(), 2);
        assert_eq!(cluster.shards[0].weight, 1);
        assert_eq!(cluster.shards[1].weight, 2);
        assert!(!cluster.shards[1].internal_replication);
        assert_eq!(cluster.shards[1].replicas[0], NodeAddr::new("127.0.0.2", 9000));
        assert_eq!(config.node.addr(), NodeAddr::new("127.0.0.1", 9000));
    }

    #[test]
    fn test_zero_cleanup_period_rejected() {
        let mut config = DistributedConfig::default();
        config.cleanup_period_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_bounds_rejected() {
        let mut config = DistributedConfig::default();
        config.backoff_initial_ms = 5_000;
        config.backoff_max_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_shard_without_replicas_rejected() {
        let text = r#"
[[clusters]]
name = "c"

[[clusters.shards]]
replicas = []
"#;
        let err = DistributedQueueConfig::from_toml_str(text).unwrap_err();
        assert!(err.contains("at least one replica"));
    }

    #[test]
    fn test_duplicate_cluster_rejected() {
        let text = r#"
[[clusters]]
name = "c"
[[clusters.shards]]
replicas = ["a:1"]

[[clusters]]
name = "c"
[[clusters.shards]]
replicas = ["b:1"]
"#;
        assert!(DistributedQueueConfig::from_toml_str(text).is_err());
    }

    #[test]
    fn test_bad_replica_address_rejected() {
        let text = r#"
[[clusters]]
name = "c"
[[clusters.shards]]
replicas = ["no-port"]
"#;
        assert!(DistributedQueueConfig::from_toml_str(text).is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = DistributedQueueConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.distributed.cleanup_period_ms, 60_000);
        assert!(config.clusters.is_empty());
    }

    #[test]
    fn test_load_invalid_file_is_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[distributed]\ncleanup_period_ms = \"soon\"\n").unwrap();
        assert!(DistributedQueueConfig::load(&path).is_err());
    }

    #[test]
    fn test_default_roundtrips_through_toml() {
        let text = toml::to_string_pretty(&DistributedQueueConfig::default()).unwrap();
        let parsed = DistributedQueueConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.distributed.data_dir, "./falcon_data");
    }
}
