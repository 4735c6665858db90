use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Fully qualified table name (`database.table`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub database: String,
    pub table: String,
}

impl TableRef {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
        }
    }

    /// Parse `db.table`. Both parts must be non-empty.
    pub fn parse(s: &str) -> Option<Self> {
        let (db, table) = s.trim().split_once('.')?;
        if db.is_empty() || table.is_empty() || table.contains('.') {
            return None;
        }
        Some(Self::new(db, table))
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

/// Network address of a replica. Serialized as `"host:port"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| format!("invalid node address '{}': expected host:port", s))?;
        if host.is_empty() {
            return Err(format!("invalid node address '{}': empty host", s));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("invalid node address '{}': bad port: {}", s, e))?;
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for NodeAddr {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeAddr> for String {
    fn from(addr: NodeAddr) -> Self {
        addr.to_string()
    }
}

/// 1-based shard number inside a cluster definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardNum(pub u32);

impl fmt::Display for ShardNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 1-based replica number inside a shard definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaNum(pub u32);

impl fmt::Display for ReplicaNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One destination of a distributed write: a single replica of a single shard.
///
/// The replica is fixed when the batch is queued, so a topology reload never
/// redirects rows that are already on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardTarget {
    pub cluster: String,
    pub shard: ShardNum,
    pub replica: ReplicaNum,
}

impl ShardTarget {
    pub fn new(cluster: impl Into<String>, shard: ShardNum, replica: ReplicaNum) -> Self {
        Self {
            cluster: cluster.into(),
            shard,
            replica,
        }
    }

    /// Name of the on-disk queue directory, e.g. `shard2_replica1`.
    pub fn dir_name(&self) -> String {
        format!("shard{}_replica{}", self.shard.0, self.replica.0)
    }

    /// Inverse of [`ShardTarget::dir_name`]. Returns `None` for foreign entries
    /// such as `tmp` or `broken`.
    pub fn parse_dir_name(cluster: &str, name: &str) -> Option<Self> {
        let rest = name.strip_prefix("shard")?;
        let (shard, replica) = rest.split_once("_replica")?;
        let shard = parse_ordinal(shard)?;
        let replica = parse_ordinal(replica)?;
        Some(Self::new(cluster, ShardNum(shard), ReplicaNum(replica)))
    }
}

impl fmt::Display for ShardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster, self.dir_name())
    }
}

fn parse_ordinal(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse::<u32>().ok().filter(|n| *n >= 1)
}

/// Identifier of one queued batch: its target plus the per-target sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchId {
    pub target: ShardTarget,
    pub seq: u64,
}

impl BatchId {
    pub fn new(target: ShardTarget, seq: u64) -> Self {
        Self { target, seq }
    }

    pub fn file_name(&self) -> String {
        format!("{}.bin", self.seq)
    }

    /// Parse a batch file name (`<seq>.bin`) into its sequence number.
    pub fn parse_file_name(name: &str) -> Option<u64> {
        let seq = name.strip_suffix(".bin")?;
        if seq.is_empty() || !seq.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        seq.parse().ok()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.target, self.seq)
    }
}
