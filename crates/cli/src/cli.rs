use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use offload_protocol::Framing;

/// Offload transformation jobs to a pool of execution units.
#[derive(Parser, Debug)]
#[command(
    name = "offload",
    version,
    about = "Job-dispatch scheduler for offloaded transformations"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a batch of jobs through a pool and print one JSON line per outcome.
    Run(RunArgs),
    /// Act as a subprocess execution unit speaking the protocol on stdio.
    Worker(WorkerArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Pool config file (TOML). Defaults plus OFFLOAD_* overrides when unset.
    #[arg(long, env = "OFFLOAD_CONFIG")]
    pub config: Option<PathBuf>,

    /// JSON-lines job file: `{"capability": .., "payload": .., "priority": ..}`.
    /// Use `-` for stdin.
    #[arg(long, conflicts_with = "jobs")]
    pub input: Option<PathBuf>,

    /// Number of synthetic jobs to run when no input file is given.
    #[arg(long, default_value_t = 10)]
    pub jobs: usize,

    /// Capability of the synthetic jobs.
    #[arg(long, default_value = "conversion")]
    pub capability: String,

    /// Per-attempt timeout override in milliseconds.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Serve `GET /metrics` on this port while the batch runs.
    #[arg(long)]
    pub metrics_port: Option<u16>,

    /// Keep serving metrics after the batch finishes, until Ctrl-C.
    #[arg(long, requires = "metrics_port")]
    pub linger: bool,
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Capability announced in the `ready` handshake.
    #[arg(long, env = "OFFLOAD_UNIT_CAPABILITY", default_value = "conversion")]
    pub capability: String,

    /// Unit id assigned by the scheduler.
    #[arg(long, env = "OFFLOAD_UNIT_ID", default_value_t = 0)]
    pub unit_id: u64,

    /// Stream framing on stdin/stdout.
    #[arg(long, value_enum, default_value_t = FramingArg::JsonLines)]
    pub framing: FramingArg,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FramingArg {
    JsonLines,
    MessagePack,
}

impl From<FramingArg> for Framing {
    fn from(arg: FramingArg) -> Self {
        match arg {
            FramingArg::JsonLines => Framing::JsonLines,
            FramingArg::MessagePack => Framing::MessagePack,
        }
    }
}
