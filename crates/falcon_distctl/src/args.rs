use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// falcon-distctl: inspect distributed insert queues and their config
#[derive(Debug, Parser)]
#[command(
    name = "falcon-distctl",
    about = "Operator tool for FalconDB distributed insert queues",
    version
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show pending, broken and temp files of a table's queue (read-only)
    Inspect {
        /// Data directory holding `<database>/<table>/` queue roots
        #[arg(long, env = "FALCON_DIST_DATA_DIR")]
        data_dir: PathBuf,

        /// Distributed table as `database.table`
        #[arg(long)]
        table: String,

        /// Cluster the table writes to
        #[arg(long)]
        cluster: String,

        /// Decode every pending batch and report corrupt files
        #[arg(long)]
        verify: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Parse and validate a config file
    CheckConfig {
        #[arg(long, short = 'c', env = "FALCON_DIST_CONFIG", default_value = "falcon_dist.toml")]
        config: PathBuf,
    },

    /// Print the default config as TOML
    PrintDefaultConfig,
}
