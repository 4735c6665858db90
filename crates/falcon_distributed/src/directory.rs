//! Durable per-shard batch queues.
//!
//! Layout under a table's queue root:
//!
//! ```text
//! <root>/
//!   tmp/                         half-written batches, purged on open
//!   shard2_replica1/
//!     17.bin                     pending batch, seq 17
//!     18.bin
//!     broken/                    batches that can never be delivered
//!       9.bin
//! ```
//!
//! A batch is written to `tmp/`, flushed, then renamed into its shard
//! directory, so a visible `<seq>.bin` is always complete. Sequence numbers
//! are assigned and published under a per-shard append lock, which makes a
//! directory listing sorted by seq equal to enqueue order.
//!
//! Directories are removed by the cleanup worker with `remove_dir`, which
//! fails on a non-empty directory. An enqueue that loses the race against a
//! removal sees `NotFound` from the rename and recreates the directory.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

use falcon_common::datum::OwnedRow;
use falcon_common::error::QueueError;
use falcon_common::types::{BatchId, ShardTarget, TableRef};

use crate::batch::{decode_batch, encode_batch, Batch, BatchPayload};

pub const TMP_DIR_NAME: &str = "tmp";
pub const BROKEN_DIR_NAME: &str = "broken";

/// How often an enqueue recreates a directory that vanished under it.
const PUBLISH_RETRIES: u32 = 64;

pub type QueueResult<T> = Result<T, QueueError>;

/// In-memory state of one shard queue. Survives removal of the directory
/// itself, so sequence numbers never go backwards while the process lives.
pub struct ShardQueue {
    target: ShardTarget,
    path: PathBuf,
    next_seq: AtomicU64,
    append_lock: Mutex<()>,
    notify: Notify,
}

impl ShardQueue {
    fn new(target: ShardTarget, path: PathBuf, next_seq: u64) -> Self {
        Self {
            target,
            path,
            next_seq: AtomicU64::new(next_seq),
            append_lock: Mutex::new(()),
            notify: Notify::new(),
        }
    }

    pub fn target(&self) -> &ShardTarget {
        &self.target
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sequence number the next enqueue will get.
    pub fn next_seq(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst)
    }

    /// Resolves once a batch has been enqueued since the last wakeup. A
    /// notification that arrives while nobody waits is stored, so no wakeup
    /// is lost between listing the directory and waiting.
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    /// Wake the sender without enqueueing (used on shutdown and flush).
    pub fn wake(&self) {
        self.notify.notify_one();
    }
}

/// Result of [`BatchDirectory::remove_if_empty`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    /// A batch appeared (or was still there); the directory stays.
    NotEmpty,
    /// Only quarantined batches remain in `broken/`; the directory stays.
    HasBroken,
    /// Already gone.
    Missing,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShardQueueStats {
    pub pending_batches: u64,
    pub pending_bytes: u64,
    pub oldest_seq: Option<u64>,
    pub newest_seq: Option<u64>,
    pub broken_batches: u64,
}

/// The queue root of one distributed table.
pub struct BatchDirectory {
    table: TableRef,
    cluster: String,
    root: PathBuf,
    tmp_dir: PathBuf,
    fsync: bool,
    queues: DashMap<ShardTarget, Arc<ShardQueue>>,
    tmp_counter: AtomicU64,
}

impl BatchDirectory {
    /// Open (or create) the queue root. Leftover files in `tmp/` are deleted
    /// and every existing shard directory is registered with its sequence
    /// counter resumed after the highest seq found on disk.
    pub fn open(
        root: impl Into<PathBuf>,
        table: TableRef,
        cluster: &str,
        fsync: bool,
    ) -> QueueResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let tmp_dir = root.join(TMP_DIR_NAME);
        let purged = purge_dir_files(&tmp_dir)?;
        fs::create_dir_all(&tmp_dir)?;

        let dir = Self {
            table,
            cluster: cluster.to_string(),
            root,
            tmp_dir,
            fsync,
            queues: DashMap::new(),
            tmp_counter: AtomicU64::new(0),
        };

        for target in dir.list_shard_directories()? {
            let path = dir.shard_path(&target);
            let mut seqs = list_seqs(&path)?;
            seqs.extend(list_seqs(&path.join(BROKEN_DIR_NAME))?);
            let next_seq = seqs.into_iter().max().map_or(1, |s| s + 1);
            dir.queues
                .insert(target.clone(), Arc::new(ShardQueue::new(target, path, next_seq)));
        }

        tracing::info!(
            table = %dir.table,
            root = %dir.root.display(),
            shard_dirs = dir.queues.len(),
            purged_tmp = purged,
            "batch directory opened"
        );
        Ok(dir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Shard queues known to this process, sorted.
    pub fn targets(&self) -> Vec<ShardTarget> {
        let mut targets: Vec<ShardTarget> = self.queues.iter().map(|e| e.key().clone()).collect();
        targets.sort();
        targets
    }

    /// Queue state for `target`, created on first use.
    pub fn queue(&self, target: &ShardTarget) -> Arc<ShardQueue> {
        if let Some(q) = self.queues.get(target) {
            return q.clone();
        }
        self.queues
            .entry(target.clone())
            .or_insert_with(|| {
                Arc::new(ShardQueue::new(target.clone(), self.shard_path(target), 1))
            })
            .clone()
    }

    fn shard_path(&self, target: &ShardTarget) -> PathBuf {
        self.root.join(target.dir_name())
    }

    fn batch_path(&self, id: &BatchId) -> PathBuf {
        self.shard_path(&id.target).join(id.file_name())
    }

    /// Durably append a batch for `target`. The batch is visible to the
    /// sender only once it is complete on disk.
    pub fn enqueue(
        &self,
        target: &ShardTarget,
        destination: &TableRef,
        rows: Vec<OwnedRow>,
    ) -> QueueResult<BatchId> {
        let row_count = rows.len();
        let bytes = encode_batch(&BatchPayload::new(destination.clone(), rows))?;

        let tmp_path = self.tmp_dir.join(format!(
            "{}.{}.tmp",
            target.dir_name(),
            self.tmp_counter.fetch_add(1, Ordering::Relaxed)
        ));
        if let Err(e) = write_file(&tmp_path, &bytes, self.fsync) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        let queue = self.queue(target);
        let id = {
            let _guard = queue.append_lock.lock();
            let id = BatchId::new(target.clone(), queue.next_seq.fetch_add(1, Ordering::SeqCst));
            if let Err(e) = publish(&tmp_path, &queue.path, &id.file_name()) {
                let _ = fs::remove_file(&tmp_path);
                return Err(e.into());
            }
            id
        };
        if self.fsync {
            // The file is in place; a failed directory sync only weakens
            // crash durability of the rename.
            if let Err(e) = sync_dir(&queue.path) {
                tracing::debug!(batch = %id, error = %e, "shard directory sync failed");
            }
        }
        queue.wake();

        falcon_observability::record_batch_enqueued(
            &self.table.to_string(),
            &target.dir_name(),
            row_count,
            bytes.len(),
        );
        tracing::debug!(table = %self.table, batch = %id, rows = row_count, "batch enqueued");
        Ok(id)
    }

    /// Pending batches of `target` in send order. A missing directory has
    /// no pending batches.
    pub fn list_pending(&self, target: &ShardTarget) -> QueueResult<Vec<BatchId>> {
        let mut seqs = list_seqs(&self.shard_path(target))?;
        seqs.sort_unstable();
        Ok(seqs.into_iter().map(|seq| BatchId::new(target.clone(), seq)).collect())
    }

    pub fn read(&self, id: &BatchId) -> QueueResult<Batch> {
        let path = self.batch_path(id);
        let data = fs::read(&path)?;
        let payload = decode_batch(&data).map_err(|reason| QueueError::CorruptBatch {
            path: path.display().to_string(),
            reason,
        })?;
        Ok(Batch {
            id: id.clone(),
            header: payload.header,
            rows: payload.rows,
            size_bytes: data.len() as u64,
        })
    }

    /// Delete a delivered batch. Removing an already-removed batch is a no-op.
    pub fn remove(&self, id: &BatchId) -> QueueResult<()> {
        match fs::remove_file(self.batch_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Move an undeliverable batch to the shard's `broken/` directory.
    pub fn quarantine(&self, id: &BatchId) -> QueueResult<PathBuf> {
        let broken = self.shard_path(&id.target).join(BROKEN_DIR_NAME);
        fs::create_dir_all(&broken)?;
        let dst = broken.join(id.file_name());
        fs::rename(self.batch_path(id), &dst)?;
        Ok(dst)
    }

    /// Shard directories currently present on disk.
    pub fn list_shard_directories(&self) -> QueueResult<BTreeSet<ShardTarget>> {
        let mut out = BTreeSet::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(target) = entry
                .file_name()
                .to_str()
                .and_then(|name| ShardTarget::parse_dir_name(&self.cluster, name))
            {
                out.insert(target);
            }
        }
        Ok(out)
    }

    /// Remove the shard directory if it holds nothing. Never deletes a
    /// batch: `remove_dir` refuses a non-empty directory, so a concurrent
    /// enqueue either lands before (and the removal fails) or after (and
    /// recreates the directory).
    pub fn remove_if_empty(&self, target: &ShardTarget) -> QueueResult<RemoveOutcome> {
        let path = self.shard_path(target);

        match fs::remove_dir(path.join(BROKEN_DIR_NAME)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) if is_not_empty(&e) => return Ok(RemoveOutcome::HasBroken),
            Err(e) => return Err(e.into()),
        }

        match fs::remove_dir(&path) {
            Ok(()) => {
                if self.fsync {
                    if let Err(e) = sync_dir(&self.root) {
                        tracing::debug!(root = %self.root.display(), error = %e, "queue root sync failed");
                    }
                }
                Ok(RemoveOutcome::Removed)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(RemoveOutcome::Missing),
            Err(e) if is_not_empty(&e) => Ok(RemoveOutcome::NotEmpty),
            Err(e) => Err(e.into()),
        }
    }

    pub fn stats(&self, target: &ShardTarget) -> QueueResult<ShardQueueStats> {
        shard_stats(&self.shard_path(target))
    }
}

/// Offline view of one shard directory.
#[derive(Debug, Clone, Serialize)]
pub struct ShardDirReport {
    pub target: ShardTarget,
    pub stats: ShardQueueStats,
    /// Rows in verified batches (only filled when verifying).
    pub rows: u64,
    /// `(seq, reason)` for pending batches that fail verification.
    pub corrupt: Vec<(u64, String)>,
}

/// Offline view of a table's queue root.
#[derive(Debug, Clone, Serialize)]
pub struct QueueRootReport {
    pub root: String,
    pub tmp_files: u64,
    pub shards: Vec<ShardDirReport>,
}

/// Inspect a queue root without modifying it. With `verify`, every pending
/// batch is read and checked.
pub fn inspect_queue_root(root: &Path, cluster: &str, verify: bool) -> QueueResult<QueueRootReport> {
    let mut shards = Vec::new();
    let mut names: Vec<(ShardTarget, PathBuf)> = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(target) = entry
            .file_name()
            .to_str()
            .and_then(|name| ShardTarget::parse_dir_name(cluster, name))
        {
            names.push((target, entry.path()));
        }
    }
    names.sort();

    for (target, path) in names {
        let stats = shard_stats(&path)?;
        let mut rows = 0;
        let mut corrupt = Vec::new();
        if verify {
            let mut seqs = list_seqs(&path)?;
            seqs.sort_unstable();
            for seq in seqs {
                let file = path.join(BatchId::new(target.clone(), seq).file_name());
                let data = fs::read(&file)?;
                match decode_batch(&data) {
                    Ok(payload) => rows += payload.rows.len() as u64,
                    Err(reason) => corrupt.push((seq, reason)),
                }
            }
        }
        shards.push(ShardDirReport {
            target,
            stats,
            rows,
            corrupt,
        });
    }

    let tmp_files = match fs::read_dir(root.join(TMP_DIR_NAME)) {
        Ok(entries) => entries.count() as u64,
        Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
        Err(e) => return Err(e.into()),
    };

    Ok(QueueRootReport {
        root: root.display().to_string(),
        tmp_files,
        shards,
    })
}

fn shard_stats(path: &Path) -> QueueResult<ShardQueueStats> {
    let mut stats = ShardQueueStats::default();
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(stats),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let Some(seq) = entry.file_name().to_str().and_then(BatchId::parse_file_name) else {
            continue;
        };
        stats.pending_batches += 1;
        stats.pending_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        stats.oldest_seq = Some(stats.oldest_seq.map_or(seq, |s| s.min(seq)));
        stats.newest_seq = Some(stats.newest_seq.map_or(seq, |s| s.max(seq)));
    }
    stats.broken_batches = list_seqs(&path.join(BROKEN_DIR_NAME))?.len() as u64;
    Ok(stats)
}

fn list_seqs(dir: &Path) -> io::Result<Vec<u64>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut seqs = Vec::new();
    for entry in entries {
        let entry = entry?;
        if let Some(seq) = entry.file_name().to_str().and_then(BatchId::parse_file_name) {
            seqs.push(seq);
        }
    }
    Ok(seqs)
}

fn purge_dir_files(dir: &Path) -> io::Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut purged = 0;
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            fs::remove_file(entry.path())?;
            purged += 1;
        }
    }
    Ok(purged)
}

/// Rename `tmp_path` to `dir/file_name`, recreating `dir` if the cleanup
/// worker removed it in between.
fn publish(tmp_path: &Path, dir: &Path, file_name: &str) -> io::Result<()> {
    let dst = dir.join(file_name);
    let mut attempt = 0;
    loop {
        fs::create_dir_all(dir)?;
        match fs::rename(tmp_path, &dst) {
            Ok(()) => return Ok(()),
            Err(e)
                if e.kind() == io::ErrorKind::NotFound
                    && attempt < PUBLISH_RETRIES
                    && tmp_path.exists() =>
            {
                attempt += 1;
                tracing::debug!(dir = %dir.display(), attempt, "shard directory removed during enqueue, recreating");
            }
            Err(e) => return Err(e),
        }
    }
}

fn write_file(path: &Path, data: &[u8], fsync: bool) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    if fsync {
        file.sync_all()?;
    }
    Ok(())
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn is_not_empty(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::DirectoryNotEmpty | io::ErrorKind::AlreadyExists
    )
}
