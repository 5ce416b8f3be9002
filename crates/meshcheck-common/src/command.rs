//! External command execution (kubectl, helm)
//!
//! Every kubectl invocation that mutates or reads cluster state goes through
//! [`Kubectl::run`], which retries connection-level hiccups with backoff and
//! returns permanent errors (NotFound, Forbidden, ...) immediately.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::retry::{retry_with_backoff_if, RetryConfig};
use crate::{Error, Result};

/// Default timeout for a single command invocation
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Captured result of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Whether the process exited with status 0
    pub success: bool,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

impl CommandOutput {
    /// stdout and stderr joined, the way a terminal would show them
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
            (false, true) => self.stdout.trim_end().to_string(),
            (true, _) => self.stderr.trim_end().to_string(),
        }
    }
}

/// Run a command and capture its output regardless of exit status.
///
/// Errors only when the process cannot be spawned or exceeds `timeout`.
pub async fn run_cmd_output(
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<CommandOutput> {
    debug!(command = %program, args = ?args, "Running command");

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::command(program, format!("failed to spawn: {e}")))?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| Error::command(program, format!("timed out after {timeout:?}")))?
        .map_err(|e| Error::command(program, format!("error waiting for process: {e}")))?;

    Ok(CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run a command, returning stdout on success and stderr as the error otherwise
pub async fn run_cmd(program: &str, args: &[String], timeout: Duration) -> Result<String> {
    let output = run_cmd_output(program, args, timeout).await?;
    if output.success {
        Ok(output.stdout)
    } else {
        Err(Error::command(program, output.stderr.trim()))
    }
}

/// Whether a kubectl error is transient (connection-level) and worth retrying.
///
/// Permanent errors (NotFound, Forbidden, etc.) return immediately since retrying
/// won't change the outcome.
pub fn is_transient_kubectl_error(error: &str) -> bool {
    const TRANSIENT: &[&str] = &[
        "Unable to connect to the server",
        "connection refused",
        "connection reset",
        "i/o timeout",
        "TLS handshake timeout",
        "no such host",
        "unexpected EOF",
        "broken pipe",
        "transport is closing",
        "context deadline exceeded",
        "the object has been modified",
        "InternalError",
        "ServiceUnavailable",
        "client rate limiter",
        "couldn't get current server API group list",
    ];
    TRANSIENT.iter().any(|needle| error.contains(needle))
}

/// Whether a kubectl error means the desired object already exists
pub fn is_already_exists(error: &str) -> bool {
    error.contains("AlreadyExists") || error.contains("already exists")
}

/// Cluster selection flags passed to every kubectl call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KubectlOptions {
    /// `--kubeconfig`
    pub kubeconfig: Option<String>,
    /// `--context`
    pub context: Option<String>,
    /// `--namespace`
    pub namespace: Option<String>,
}

impl KubectlOptions {
    /// Copy of these options scoped to `namespace`
    pub fn in_namespace(&self, namespace: &str) -> Self {
        Self {
            namespace: Some(namespace.to_string()),
            ..self.clone()
        }
    }

    /// Global flags, in the order kubectl documents them
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(path) = &self.kubeconfig {
            args.push("--kubeconfig".to_string());
            args.push(path.clone());
        }
        if let Some(ctx) = &self.context {
            args.push("--context".to_string());
            args.push(ctx.clone());
        }
        if let Some(ns) = &self.namespace {
            args.push("--namespace".to_string());
            args.push(ns.clone());
        }
        args
    }
}

/// kubectl bound to a cluster (and optionally a namespace)
#[derive(Debug, Clone)]
pub struct Kubectl {
    options: KubectlOptions,
    timeout: Duration,
    retry: RetryConfig,
}

impl Kubectl {
    /// Create a kubectl wrapper with default timeout and retry policy
    pub fn new(options: KubectlOptions) -> Self {
        Self {
            options,
            timeout: DEFAULT_COMMAND_TIMEOUT,
            retry: RetryConfig::with_max_attempts(10),
        }
    }

    /// Override the per-invocation timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Same cluster, different namespace
    pub fn namespaced(&self, namespace: &str) -> Self {
        Self {
            options: self.options.in_namespace(namespace),
            ..self.clone()
        }
    }

    /// Flags this wrapper passes to kubectl
    pub fn options(&self) -> &KubectlOptions {
        &self.options
    }

    fn full_args(&self, args: &[&str]) -> Vec<String> {
        let mut full = self.options.args();
        full.extend(args.iter().map(|s| s.to_string()));
        full
    }

    /// Run kubectl once and capture output without interpreting the exit code
    pub async fn output(&self, args: &[&str]) -> Result<CommandOutput> {
        run_cmd_output("kubectl", &self.full_args(args), self.timeout).await
    }

    /// Run kubectl, retrying transient failures.
    ///
    /// AlreadyExists is treated as success: the desired state is achieved.
    pub async fn run(&self, args: &[&str]) -> Result<String> {
        let full = self.full_args(args);
        let timeout = self.timeout;
        let result = retry_with_backoff_if(
            &self.retry,
            "kubectl",
            || {
                let full = full.clone();
                async move { run_cmd("kubectl", &full, timeout).await }
            },
            |e| is_transient_kubectl_error(&e.to_string()),
        )
        .await;

        match result {
            Err(e) if is_already_exists(&e.to_string()) => Ok(e.to_string()),
            other => other,
        }
    }
}
