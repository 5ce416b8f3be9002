//! meshcheck
//!
//! Runs Consul service mesh acceptance scenarios and convergence probes.

use clap::Parser;
use meshcheck_common::telemetry::{init_telemetry, TelemetryConfig};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use meshcheck_cli::error::CommandErrorExt;
use meshcheck_cli::{Cli, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        format: cli.log_format,
        ..Default::default()
    })
    .cmd_err()?;

    // Ctrl-C stops new probe attempts; cleanup still runs
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing current step");
            on_signal.cancel();
        }
    });

    cli.run(cancel).await
}
