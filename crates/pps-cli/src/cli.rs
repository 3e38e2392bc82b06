use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use pps_types::{DatasetId, DatasetState};

#[derive(Parser)]
#[command(
    name = "pps",
    about = "Prompt Publication Service: replicate, verify and retire prompt data products",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Service configuration file
    #[arg(short, long, global = true, default_value = "pps.toml")]
    pub config: PathBuf,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the service until interrupted
    Run,
    /// Run one pass: discovery, transfers until drained, reconcile, retention
    Once,
    /// Summarise the ledger by state
    Status,
    /// Show one ledger entry
    Show(ShowArgs),
    /// List entries in a given state
    List(ListArgs),
    /// Send a failed dataset back for transfer
    Requeue(RequeueArgs),
    /// Purge one dataset from the source if its retention window has elapsed
    Purge(PurgeArgs),
    /// Check every ledger entry against the lifecycle rules
    Validate,
    /// Rewrite the ledger journal to one record per entry
    Compact,
    /// Write a configuration file with every default filled in
    InitConfig(InitConfigArgs),
}

#[derive(Args)]
pub struct ShowArgs {
    pub id: DatasetId,
}

#[derive(Args)]
pub struct ListArgs {
    /// pending, retrying, replicated, purgeable, purged or failed
    #[arg(short, long)]
    pub state: DatasetState,
    #[arg(short = 'n', long)]
    pub limit: Option<usize>,
}

#[derive(Args)]
pub struct RequeueArgs {
    pub id: DatasetId,
}

#[derive(Args)]
pub struct PurgeArgs {
    pub id: DatasetId,
}

#[derive(Args)]
pub struct InitConfigArgs {
    /// Overwrite an existing file
    #[arg(long)]
    pub force: bool,
}
