//! meshcheck CLI library
//!
//! Acceptance scenarios for Consul's Kubernetes namespace support, plus
//! one-shot probes for checking a live installation by hand.

pub mod cleanup;
pub mod commands;
pub mod config;
pub mod error;
pub mod harness;
pub mod helm;
pub mod k8s;
pub mod port_forward;
pub mod scenarios;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};
use meshcheck_common::telemetry::LogFormat;
use tokio_util::sync::CancellationToken;

/// meshcheck - service mesh convergence checks
#[derive(Parser, Debug)]
#[command(name = "meshcheck")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log output format: text or json
    #[arg(long, global = true, env = "MESHCHECK_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run scenario suites against a cluster
    Run(commands::run::RunArgs),
    /// List suites and their cases
    List,
    /// Run a single probe against a live system
    Probe(commands::probe::ProbeArgs),
}

impl Cli {
    /// Run the CLI command; `cancel` stops convergence checks early
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        match self.command {
            Commands::Run(args) => commands::run::run(args, cancel).await,
            Commands::List => commands::list::run(),
            Commands::Probe(args) => commands::probe::run(args, cancel).await,
        }
    }
}
