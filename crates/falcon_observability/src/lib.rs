//! Observability setup: structured logging and queue metrics.

use std::time::Duration;

use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber with structured logging.
pub fn init_tracing() {
    init_tracing_with_default("info,falcon=debug");
}

/// Same as [`init_tracing`] with a caller-chosen default filter (used by the
/// operator CLI, which should stay quiet unless `RUST_LOG` says otherwise).
/// Calling it twice is harmless; the second subscriber is simply not installed.
pub fn init_tracing_with_default(default_filter: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

/// A batch was written to a shard queue directory.
pub fn record_batch_enqueued(table: &str, shard_dir: &str, rows: usize, bytes: usize) {
    metrics::counter!("falcon_dist_batches_enqueued_total", "table" => table.to_string(), "shard" => shard_dir.to_string()).increment(1);
    metrics::counter!("falcon_dist_rows_enqueued_total", "table" => table.to_string(), "shard" => shard_dir.to_string()).increment(rows as u64);
    metrics::counter!("falcon_dist_bytes_enqueued_total", "table" => table.to_string()).increment(bytes as u64);
}

/// Rows executed synchronously on the local replica (no queue involved).
pub fn record_local_rows(table: &str, rows: usize) {
    metrics::counter!("falcon_dist_local_rows_total", "table" => table.to_string()).increment(rows as u64);
}

/// Outcome of one send attempt of a queued batch.
pub fn record_send(table: &str, shard_dir: &str, success: bool, elapsed: Duration) {
    metrics::counter!("falcon_dist_sends_total", "table" => table.to_string(), "shard" => shard_dir.to_string(), "success" => success.to_string()).increment(1);
    metrics::histogram!("falcon_dist_send_duration_us", "table" => table.to_string()).record(elapsed.as_micros() as f64);
}

/// A batch that can never be delivered was moved to `broken/`.
pub fn record_quarantined(table: &str, shard_dir: &str) {
    metrics::counter!("falcon_dist_batches_quarantined_total", "table" => table.to_string(), "shard" => shard_dir.to_string()).increment(1);
}

/// Current number of pending batches in a shard queue.
pub fn record_pending(table: &str, shard_dir: &str, pending: usize) {
    metrics::gauge!("falcon_dist_pending_batches", "table" => table.to_string(), "shard" => shard_dir.to_string()).set(pending as f64);
}

/// Result of one cleanup sweep.
pub fn record_cleanup_tick(removed: usize, raced: usize, skipped: usize) {
    metrics::counter!("falcon_dist_cleanup_ticks_total").increment(1);
    metrics::counter!("falcon_dist_cleanup_removed_dirs_total").increment(removed as u64);
    metrics::counter!("falcon_dist_cleanup_races_total").increment(raced as u64);
    metrics::gauge!("falcon_dist_cleanup_skipped_dirs").set(skipped as f64);
}
