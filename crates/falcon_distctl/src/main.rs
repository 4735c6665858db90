mod args;

use std::fmt::Write as _;
use std::path::Path;
use std::process;

use anyhow::{bail, Context, Result};
use clap::Parser;

use args::{Args, Command};
use falcon_common::config::DistributedQueueConfig;
use falcon_common::types::TableRef;
use falcon_distributed::{inspect_queue_root, QueueRootReport};

fn main() {
    if let Err(e) = run() {
        eprintln!("falcon-distctl: error: {:#}", e);
        process::exit(1);
    }
}

fn run() -> Result<()> {
    falcon_observability::init_tracing_with_default("warn");
    let args = Args::parse();

    match args.command {
        Command::Inspect {
            data_dir,
            table,
            cluster,
            verify,
            json,
        } => {
            let report = inspect(&data_dir, &table, &cluster, verify)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", render_report(&report));
            }
            if report.shards.iter().any(|s| !s.corrupt.is_empty()) {
                bail!("corrupt batches found under {}", report.root);
            }
        }
        Command::CheckConfig { config } => {
            let summary = check_config(&config)?;
            println!("{}", summary);
        }
        Command::PrintDefaultConfig => {
            let text = toml::to_string_pretty(&DistributedQueueConfig::default())
                .context("Could not serialize default config")?;
            print!("{}", text);
        }
    }
    Ok(())
}

fn inspect(data_dir: &Path, table: &str, cluster: &str, verify: bool) -> Result<QueueRootReport> {
    let table = TableRef::parse(table)
        .with_context(|| format!("Table must be given as database.table, got '{}'", table))?;
    let root = data_dir.join(&table.database).join(&table.table);
    if !root.is_dir() {
        bail!("No queue for {} under {}", table, data_dir.display());
    }
    tracing::debug!(root = %root.display(), verify, "inspecting queue root");
    inspect_queue_root(&root, cluster, verify)
        .with_context(|| format!("Cannot inspect {}", root.display()))
}

fn check_config(path: &Path) -> Result<String> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config file: {}", path.display()))?;
    let config = DistributedQueueConfig::from_toml_str(&text)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("Invalid config: {}", path.display()))?;
    let shards: usize = config.clusters.iter().map(|c| c.shards.len()).sum();
    Ok(format!(
        "{}: OK (node {}, {} cluster(s), {} shard(s), data_dir {})",
        path.display(),
        config.node.addr(),
        config.clusters.len(),
        shards,
        config.distributed.data_dir
    ))
}

fn render_report(report: &QueueRootReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "queue root: {}", report.root);
    if report.tmp_files > 0 {
        let _ = writeln!(out, "temp files: {} (removed on next open)", report.tmp_files);
    }
    if report.shards.is_empty() {
        let _ = writeln!(out, "no shard directories");
        return out;
    }
    let _ = writeln!(
        out,
        "{:<24} {:>8} {:>12} {:>10} {:>10} {:>7}",
        "shard", "pending", "bytes", "oldest", "newest", "broken"
    );
    for shard in &report.shards {
        let seq = |s: Option<u64>| s.map_or_else(|| "-".to_string(), |v| v.to_string());
        let _ = writeln!(
            out,
            "{:<24} {:>8} {:>12} {:>10} {:>10} {:>7}",
            shard.target.dir_name(),
            shard.stats.pending_batches,
            shard.stats.pending_bytes,
            seq(shard.stats.oldest_seq),
            seq(shard.stats.newest_seq),
            shard.stats.broken_batches
        );
        for (seq, reason) in &shard.corrupt {
            let _ = writeln!(out, "  corrupt batch {}: {}", seq, reason);
        }
    }
    out
}
