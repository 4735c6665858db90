//! Distributed table insert path: shard routing, a durable per-shard batch
//! queue on local disk, one async sender per shard directory and a periodic
//! cleanup worker that reclaims drained shard directories.
//!
//! Inserts for a shard with a replica on this node execute in-process;
//! everything else is queued as `<data_dir>/<db>/<table>/shard<N>_replica<M>/<seq>.bin`
//! and delivered in order, with retry, by the shard's sender.

pub mod batch;
pub mod bg_supervisor;
pub mod cleanup;
pub mod directory;
pub mod executor;
pub mod router;
pub mod sender;
pub mod service;
pub mod table;

pub use bg_supervisor::{
    BgTaskCriticality, BgTaskInfo, BgTaskSnapshot, BgTaskState, BgTaskSupervisor, QueueHealth,
};
pub use cleanup::{CleanupRegistry, CleanupSource, CleanupWorker, SweepReport};
pub use directory::{inspect_queue_root, BatchDirectory, QueueRootReport, ShardQueueStats};
pub use executor::{InMemoryExecutor, InsertRequest, QueryExecutor};
pub use router::{ClusterTopology, ShardInfo, ShardRoute, ShardRouter, StaticTopology};
pub use sender::{SenderConfig, SenderState, SenderStatus, ShardSenderHandle};
pub use service::DistributedQueueService;
pub use table::{DistributedTable, DistributedTableSpec, InsertSummary};
