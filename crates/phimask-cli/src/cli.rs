use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "phimask")]
#[command(about = "Resumable PHI masking for document collections", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Mask the configured collections
    Run {
        /// Job config (TOML or JSON)
        #[arg(long, env = "PHIMASK_CONFIG")]
        config: Option<PathBuf>,

        /// Run id to start or resume (default: a new id)
        #[arg(long)]
        run_id: Option<String>,

        /// Only mask these collections (must be listed in the config)
        #[arg(long)]
        collection: Vec<String>,

        /// Overwrite the source collections instead of copying
        #[arg(long)]
        in_situ: bool,

        /// Required with in-situ masking
        #[arg(long)]
        confirm_destructive: bool,

        /// Forget any stored progress for this run id
        #[arg(long)]
        reset_checkpoint: bool,

        /// Drop destination collections before copying
        #[arg(long)]
        reset_destination: bool,

        /// Pause each collection after this many documents
        #[arg(long)]
        limit: Option<u64>,

        /// Mask and count without writing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Compare a sample of source documents with their masked copies
    Validate {
        #[arg(long, env = "PHIMASK_CONFIG")]
        config: Option<PathBuf>,

        #[arg(long)]
        collection: String,

        /// Number of documents to sample
        #[arg(long, default_value = "100")]
        sample: usize,

        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect or reset run checkpoints
    #[command(subcommand)]
    Checkpoint(CheckpointCommands),
}

#[derive(Subcommand)]
pub enum CheckpointCommands {
    /// Show the checkpoints of a run
    Show {
        #[arg(long, env = "PHIMASK_CONFIG")]
        config: Option<PathBuf>,

        #[arg(long)]
        run_id: String,

        #[arg(long)]
        json: bool,
    },

    /// Delete the checkpoints of a run
    Reset {
        #[arg(long, env = "PHIMASK_CONFIG")]
        config: Option<PathBuf>,

        #[arg(long)]
        run_id: String,

        /// Only this collection
        #[arg(long)]
        collection: Option<String>,
    },
}
