use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Clone, Parser)]
#[command(name = "agent-relay", version, about = "Multi-agent orchestration: broker + workflow runner")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run a workflow document to completion (or validate/plan it without
    /// dispatching any step).
    Run(RunArgs),
    /// Drive the broker's line-delimited JSON-RPC protocol stream over
    /// this process's own stdin/stdout.
    Broker(BrokerArgs),
}

#[derive(Debug, Clone, Parser)]
pub struct RunArgs {
    /// Path to a YAML or JSON workflow document.
    pub workflow_path: PathBuf,

    /// Override the workflow document's declared name.
    #[arg(long)]
    pub workflow: Option<String>,

    /// Resume a previously started run by id, replaying its journal
    /// before continuing dispatch.
    #[arg(long)]
    pub resume: Option<String>,

    /// Parse and validate the document (build the DAG, reject cycles and
    /// unknown dependencies) without running anything.
    #[arg(long, default_value_t = false)]
    pub validate: bool,

    /// Optional TOML file of broker/runtime tunables; CLI flags (none of
    /// which overlap with `RelayConfig` today) would take precedence over
    /// this file if added.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory run-scoped state (trajectory, step outputs, worker logs,
    /// journal) is written under. Defaults to the current directory.
    #[arg(long, default_value = ".")]
    pub run_dir: PathBuf,
}

#[derive(Debug, Clone, Parser)]
pub struct BrokerArgs {
    /// Optional TOML file of broker/runtime tunables.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// "host:port" to bind the companion WebSocket gateway on (§6). Unset
    /// by default; requires `--companion-public-key` to also be set.
    #[arg(long)]
    pub companion_addr: Option<SocketAddr>,

    /// Hex-encoded Ed25519 public key the companion gateway verifies
    /// connect handshakes against.
    #[arg(long)]
    pub companion_public_key: Option<String>,

    /// Localhost JSON-RPC endpoint used as the fallback delivery path once
    /// an inbound companion message exhausts the delivery engine's retry
    /// budget (§4.7).
    #[arg(long)]
    pub fallback_url: Option<String>,

    /// Dedup time-to-live, in seconds, for inbound companion messages
    /// (§4.7 default: 15 minutes).
    #[arg(long, default_value_t = 900)]
    pub inbound_dedup_ttl_secs: u64,
}

/// Whether plan-only execution is requested via the `DRY_RUN` environment
/// variable (§6): any non-empty value other than `0`/`false` enables it.
pub fn dry_run_requested() -> bool {
    match std::env::var("DRY_RUN") {
        Ok(value) => !matches!(value.trim(), "" | "0" | "false"),
        Err(_) => false,
    }
}
