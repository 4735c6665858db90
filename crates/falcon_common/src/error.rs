use thiserror::Error;

/// Convenience alias for `Result<T, FalconError>`.
pub type FalconResult<T> = Result<T, FalconError>;

/// Error classification for retry/escalation decisions.
///
/// - `UserError`: bad input or configuration; retrying will not help
/// - `Retryable`: the operation may succeed if repeated right away
/// - `Transient`: remote or resource trouble; retry after back-off
/// - `InternalBug`: should never happen; corrupt state or broken invariant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Retryable,
    Transient,
    InternalBug,
}

/// Top-level error type for the distributed insert queue.
#[derive(Error, Debug)]
pub enum FalconError {
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Administrative flush did not drain in time. The queue keeps draining
    /// in the background; nothing was dropped.
    #[error("Flush of {table} timed out after {waited_ms}ms ({pending} batch(es) still pending)")]
    FlushTimeout {
        table: String,
        waited_ms: u64,
        pending: u64,
    },

    #[error("Unknown distributed table: {0}")]
    UnknownTable(String),

    #[error("Distributed table already exists: {0}")]
    TableExists(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Shard routing failures. Always fatal to the insert that triggered them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("Cluster '{0}' is not defined")]
    UnknownCluster(String),

    #[error("Cluster '{0}' has no shards")]
    EmptyCluster(String),

    #[error("Cluster '{0}' has zero total shard weight")]
    ZeroTotalWeight(String),

    #[error("Cluster '{cluster}' shard {shard} has no replicas")]
    NoReplicas { cluster: String, shard: u32 },

    #[error("Cluster '{cluster}' has {shards} shards; inserts require a sharding key")]
    ShardingKeyRequired { cluster: String, shards: usize },

    #[error("Sharding key column {column} is out of range for a row of width {width}")]
    ShardingKeyOutOfRange { column: usize, width: usize },

    #[error("Sharding key column {column} is NULL")]
    NullShardingKey { column: usize },

    #[error("Sharding key column {column} has unsupported value '{value}'")]
    UnsupportedShardingKey { column: usize, value: String },
}

/// Failures reported by the query-execution service for a remote shard.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("node {node} unreachable: {reason}")]
    Unreachable { node: String, reason: String },

    #[error("node {node} rejected insert: {reason}")]
    Rejected { node: String, reason: String },

    #[error("node {node} timed out after {timeout_ms}ms")]
    Timeout { node: String, timeout_ms: u64 },

    #[error("no replica address known for {target}")]
    UnknownReplica { target: String },
}

/// Durable queue failures.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupt batch file {path}: {reason}")]
    CorruptBatch { path: String, reason: String },

    #[error("Queue for {0} is shut down")]
    ShutDown(String),
}

impl FalconError {
    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FalconError::Routing(_) => ErrorKind::UserError,
            FalconError::UnknownTable(_) => ErrorKind::UserError,
            FalconError::TableExists(_) => ErrorKind::UserError,
            FalconError::Config(_) => ErrorKind::UserError,

            FalconError::Queue(QueueError::ShutDown(_)) => ErrorKind::Retryable,

            FalconError::Remote(_) => ErrorKind::Transient,
            FalconError::FlushTimeout { .. } => ErrorKind::Transient,
            FalconError::Queue(QueueError::Io(_)) => ErrorKind::Transient,

            FalconError::Queue(QueueError::Serialization(_)) => ErrorKind::InternalBug,
            FalconError::Queue(QueueError::CorruptBatch { .. }) => ErrorKind::InternalBug,
            FalconError::Internal(_) => ErrorKind::InternalBug,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    /// Whether a batch that failed with this error can never be delivered and
    /// should be quarantined instead of retried.
    pub fn is_undeliverable(&self) -> bool {
        matches!(
            self,
            FalconError::Queue(QueueError::CorruptBatch { .. })
                | FalconError::Queue(QueueError::Serialization(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_errors_are_user_errors() {
        let e: FalconError = RoutingError::UnknownCluster("c".into()).into();
        assert_eq!(e.kind(), ErrorKind::UserError);
        assert!(!e.is_transient());
    }

    #[test]
    fn test_remote_errors_are_transient() {
        let e: FalconError = RemoteError::Unreachable {
            node: "n2:9000".into(),
            reason: "connection refused".into(),
        }
        .into();
        assert!(e.is_transient());
        assert!(e.to_string().contains("n2:9000"));
    }

    #[test]
    fn test_flush_timeout_is_transient() {
        let e = FalconError::FlushTimeout {
            table: "test.dist_foo".into(),
            waited_ms: 500,
            pending: 3,
        };
        assert!(e.is_transient());
        assert!(e.to_string().contains("3 batch(es)"));
    }

    #[test]
    fn test_corrupt_batch_is_undeliverable() {
        let e: FalconError = QueueError::CorruptBatch {
            path: "/x/1.bin".into(),
            reason: "checksum mismatch".into(),
        }
        .into();
        assert_eq!(e.kind(), ErrorKind::InternalBug);
        assert!(e.is_undeliverable());
    }

    #[test]
    fn test_io_error_converts_and_is_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let e: FalconError = QueueError::from(io).into();
        assert!(e.is_transient());
        assert!(!e.is_undeliverable());
    }

    #[test]
    fn test_shutdown_is_retryable() {
        let e: FalconError = QueueError::ShutDown("test.dist".into()).into();
        assert_eq!(e.kind(), ErrorKind::Retryable);
    }
}
