mod batch;
mod cli;
mod metrics_server;
mod worker;

use anyhow::Result;
use clap::Parser;

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Logs go to stderr: stdout carries outcomes in `run` and protocol
    // frames in `worker`.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match Cli::parse().command {
        Command::Run(args) => batch::run(args).await,
        Command::Worker(args) => worker::run(args).await,
    }
}
