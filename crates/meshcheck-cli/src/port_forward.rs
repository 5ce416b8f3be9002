//! `kubectl port-forward` to the Consul server service.
//!
//! The local port is OS-assigned (`:remote` syntax) and parsed from kubectl's
//! `Forwarding from 127.0.0.1:XXXXX -> YYYYY` line. The forward lives as long
//! as the [`PortForward`] guard; dropping it kills kubectl.

use std::process::Stdio;
use std::time::Duration;

use meshcheck_common::command::KubectlOptions;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info};

use crate::{Error, Result};

/// Maximum time to wait for kubectl to emit its "Forwarding from" line.
const PORT_PARSE_TIMEOUT: Duration = Duration::from_secs(20);

/// Consul HTTP port
pub const CONSUL_HTTP_PORT: u16 = 8500;

/// Consul HTTPS port
pub const CONSUL_HTTPS_PORT: u16 = 8501;

/// Remote port of the Consul API for the given security mode
pub fn consul_api_port(secure: bool) -> u16 {
    if secure {
        CONSUL_HTTPS_PORT
    } else {
        CONSUL_HTTP_PORT
    }
}

/// A running port-forward
pub struct PortForward {
    port: u16,
    target: String,
    // kill_on_drop
    _child: Child,
}

impl PortForward {
    /// Forward an OS-assigned local port to `target:remote_port`
    /// (e.g. `svc/consul-abc123-consul-server`).
    pub async fn start(options: &KubectlOptions, target: &str, remote_port: u16) -> Result<Self> {
        let mut args = options.args();
        args.push("port-forward".to_string());
        args.push(target.to_string());
        args.push(format!(":{remote_port}"));

        let mut child = Command::new("kubectl")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::command_failed(format!("failed to spawn port-forward: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::command_failed("kubectl stdout not captured"))?;
        let mut lines = BufReader::new(stdout).lines();

        let port = tokio::time::timeout(PORT_PARSE_TIMEOUT, read_forwarded_port(&mut lines))
            .await
            .map_err(|_| {
                Error::command_failed(format!(
                    "timeout waiting for kubectl to report forwarded port for {target}"
                ))
            })??;

        // kubectl keeps logging per connection; a closed pipe would kill it
        let label = target.to_string();
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(forward = %label, "[PortForward] {line}");
            }
        });
        if let Some(stderr) = child.stderr.take() {
            let label = target.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(forward = %label, "[PortForward] stderr: {line}");
                }
            });
        }

        info!(forward = target, port = port, "[PortForward] Forwarding {remote_port}");
        Ok(Self {
            port,
            target: target.to_string(),
            _child: child,
        })
    }

    /// Local port
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        debug!(forward = %self.target, port = self.port, "[PortForward] Stopping");
    }
}

async fn read_forwarded_port(lines: &mut Lines<BufReader<ChildStdout>>) -> Result<u16> {
    while let Some(line) = lines.next_line().await? {
        if line.contains("Forwarding from") {
            return parse_forwarded_port(&line);
        }
    }
    Err(Error::command_failed(
        "kubectl port-forward exited before reporting a port",
    ))
}

/// Parse "Forwarding from 127.0.0.1:54321 -> 8500" or "[::1]:54321 -> 8500"
fn parse_forwarded_port(line: &str) -> Result<u16> {
    let port_str = line
        .split("Forwarding from ")
        .nth(1)
        .and_then(|rest| rest.split(" -> ").next())
        .and_then(|addr| addr.rsplit_once(':'))
        .map(|(_, port)| port.trim())
        .ok_or_else(|| {
            Error::command_failed(format!("failed to parse port from kubectl output: {line}"))
        })?;

    port_str
        .parse::<u16>()
        .map_err(|e| Error::command_failed(format!("invalid port '{port_str}': {e}")))
}
