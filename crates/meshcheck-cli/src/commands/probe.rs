//! `meshcheck probe`: run a single convergence check against a live system

use std::time::Duration;

use clap::{Args, Subcommand};
use meshcheck_common::command::{Kubectl, KubectlOptions};
use meshcheck_common::{ConvergenceChecker, Outcome, RetryBudget};
use meshcheck_probe::{
    AcceptedFailures, ConnectivityProbe, ConsulClient, ConsulConfig, ExecCurlTransport,
    HttpTransport, RegistrationProbe, Transport,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::CommandErrorExt;
use crate::Result;

#[derive(Args, Debug)]
pub struct ProbeArgs {
    #[command(subcommand)]
    pub command: ProbeCommand,
}

#[derive(Subcommand, Debug)]
pub enum ProbeCommand {
    /// Wait until a URL is reachable (or refused with an accepted error)
    Connectivity(ConnectivityArgs),
    /// Wait until the Consul catalog shows the expected registrations
    Registration(RegistrationArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BudgetArgs {
    /// Maximum probe attempts
    #[arg(long, default_value = "60")]
    pub attempts: u32,

    /// Pause between attempts, in milliseconds
    #[arg(long)]
    pub interval_ms: Option<u64>,
}

impl BudgetArgs {
    fn budget(&self, default_interval: Duration) -> Result<RetryBudget> {
        let interval = self
            .interval_ms
            .map(Duration::from_millis)
            .unwrap_or(default_interval);
        Ok(RetryBudget::new(self.attempts, interval)?)
    }
}

#[derive(Args, Debug)]
pub struct ConnectivityArgs {
    /// Target URL
    #[arg(long)]
    pub url: String,

    /// Expect the connection to fail instead of succeed
    #[arg(long)]
    pub expect_failure: bool,

    /// Accepted failure output (substring); repeatable. Defaults to the
    /// known empty-reply and connection-reset signatures.
    #[arg(long = "pattern")]
    pub patterns: Vec<String>,

    /// Issue the request with curl inside this deployment instead of from
    /// this host
    #[arg(long)]
    pub exec_from: Option<String>,

    /// Namespace of `--exec-from`
    #[arg(long, requires = "exec_from")]
    pub namespace: Option<String>,

    #[arg(long, env = "MESHCHECK_KUBECONFIG")]
    pub kubeconfig: Option<String>,

    #[arg(long, env = "MESHCHECK_KUBE_CONTEXT")]
    pub kube_context: Option<String>,

    /// Payload the response body must contain
    #[arg(long, default_value = meshcheck_probe::connectivity::EXPECTED_PAYLOAD_MARKER)]
    pub marker: String,

    #[command(flatten)]
    pub budget: BudgetArgs,
}

impl ConnectivityArgs {
    fn accepted(&self) -> AcceptedFailures {
        if self.patterns.is_empty() {
            AcceptedFailures::mesh_refusal()
        } else {
            self.patterns.iter().cloned().collect()
        }
    }
}

#[derive(Args, Debug)]
pub struct RegistrationArgs {
    /// Consul HTTP(S) address, e.g. http://127.0.0.1:8500
    #[arg(long, env = "MESHCHECK_CONSUL_ADDR")]
    pub consul_addr: String,

    /// ACL token
    #[arg(long, env = "MESHCHECK_CONSUL_TOKEN")]
    pub token: Option<String>,

    /// Accept a self-signed server certificate
    #[arg(long)]
    pub insecure_skip_verify: bool,

    /// Service name
    #[arg(long)]
    pub service: String,

    /// Consul namespace
    #[arg(long, default_value = "default")]
    pub namespace: String,

    /// Expect exactly this many instances
    #[arg(long, conflicts_with = "absent", required_unless_present = "absent")]
    pub count: Option<usize>,

    /// Expect no instance whose id contains this
    #[arg(long)]
    pub absent: Option<String>,

    #[command(flatten)]
    pub budget: BudgetArgs,
}

fn report(description: &str, outcome: Outcome) -> Result<()> {
    let attempts = outcome.attempts();
    outcome.into_result(description)?;
    info!(attempts = attempts, "[Probe] {description}: converged");
    Ok(())
}

async fn check_connectivity<T: Transport>(
    args: &ConnectivityArgs,
    transport: T,
    cancel: CancellationToken,
) -> Result<()> {
    let budget = args.budget.budget(RetryBudget::CONNECTIVITY_INTERVAL)?;
    let probe = ConnectivityProbe::new(transport).with_marker(args.marker.clone());
    let accepted = args.accepted();
    let expect_success = !args.expect_failure;
    let description = if expect_success {
        format!("{} reachable", args.url)
    } else {
        format!("{} refused", args.url)
    };

    let checker = ConvergenceChecker::new(description.clone()).with_cancellation(cancel);
    let outcome = checker
        .run(&budget, || probe.check(&args.url, expect_success, &accepted))
        .await;
    report(&description, outcome)
}

pub async fn connectivity(args: ConnectivityArgs, cancel: CancellationToken) -> Result<()> {
    match &args.exec_from {
        Some(deployment) => {
            let options = KubectlOptions {
                kubeconfig: args.kubeconfig.clone(),
                context: args.kube_context.clone(),
                namespace: args.namespace.clone(),
            };
            let transport = ExecCurlTransport::new(Kubectl::new(options), deployment.clone());
            check_connectivity(&args, transport, cancel).await
        }
        None => {
            let transport = HttpTransport::new(Duration::from_secs(10)).cmd_err()?;
            check_connectivity(&args, transport, cancel).await
        }
    }
}

pub async fn registration(args: RegistrationArgs, cancel: CancellationToken) -> Result<()> {
    let budget = args.budget.budget(RetryBudget::REGISTRATION_INTERVAL)?;
    let mut config = ConsulConfig::new(args.consul_addr.clone());
    config.accept_invalid_certs = args.insecure_skip_verify;
    if let Some(token) = &args.token {
        config = config.with_token(token.clone());
    }
    let probe = RegistrationProbe::new(ConsulClient::new(config)?);

    let (description, outcome) = match (&args.absent, args.count) {
        (Some(needle), _) => {
            let description = format!("no {} instance matching {needle} in {}", args.service, args.namespace);
            let checker = ConvergenceChecker::new(description.clone()).with_cancellation(cancel);
            let outcome = checker
                .run(&budget, || probe.check_absent(&args.service, &args.namespace, needle))
                .await;
            (description, outcome)
        }
        (None, count) => {
            let expected = count.unwrap_or(1);
            let description = format!("{expected} instance(s) of {} in {}", args.service, args.namespace);
            let checker = ConvergenceChecker::new(description.clone()).with_cancellation(cancel);
            let outcome = checker
                .run(&budget, || probe.check_count(&args.service, &args.namespace, expected))
                .await;
            (description, outcome)
        }
    };
    report(&description, outcome)
}

pub async fn run(args: ProbeArgs, cancel: CancellationToken) -> Result<()> {
    match args.command {
        ProbeCommand::Connectivity(args) => connectivity(args, cancel).await,
        ProbeCommand::Registration(args) => registration(args, cancel).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Cli;
    use crate::Commands;
    use clap::Parser;

    fn parse_probe(args: &[&str]) -> std::result::Result<ProbeCommand, clap::Error> {
        let mut argv = vec!["meshcheck", "probe"];
        argv.extend_from_slice(args);
        let cli = Cli::try_parse_from(argv)?;
        match cli.command {
            Commands::Probe(p) => Ok(p.command),
            other => panic!("parsed as {other:?}"),
        }
    }

    #[test]
    fn connectivity_defaults() {
        let cmd = parse_probe(&["connectivity", "--url", "http://localhost:1234"]).unwrap();
        let ProbeCommand::Connectivity(args) = cmd else {
            panic!("expected connectivity")
        };
        assert!(!args.expect_failure);
        assert_eq!(args.marker, "hello world");
        let budget = args.budget.budget(RetryBudget::CONNECTIVITY_INTERVAL).unwrap();
        assert_eq!(budget.max_attempts(), 60);
        assert_eq!(budget.interval(), Duration::from_secs(2));
        assert_eq!(args.accepted().patterns().len(), 2);
    }

    #[test]
    fn connectivity_custom_patterns_replace_defaults() {
        let cmd = parse_probe(&[
            "connectivity",
            "--url",
            "http://localhost:1234",
            "--expect-failure",
            "--pattern",
            "curl: (7)",
            "--attempts",
            "5",
            "--interval-ms",
            "100",
        ])
        .unwrap();
        let ProbeCommand::Connectivity(args) = cmd else {
            panic!("expected connectivity")
        };
        assert!(args.expect_failure);
        assert_eq!(args.accepted().patterns(), &["curl: (7)".to_string()]);
        let budget = args.budget.budget(RetryBudget::CONNECTIVITY_INTERVAL).unwrap();
        assert_eq!(budget.max_attempts(), 5);
        assert_eq!(budget.interval(), Duration::from_millis(100));
    }

    #[test]
    fn zero_attempts_is_a_validation_error() {
        let budget = BudgetArgs {
            attempts: 0,
            interval_ms: None,
        };
        assert!(budget.budget(Duration::from_secs(1)).is_err());
    }

    #[test]
    fn registration_needs_count_or_absent() {
        let base = [
            "registration",
            "--consul-addr",
            "http://127.0.0.1:8500",
            "--service",
            "static-client",
        ];
        assert!(parse_probe(&base).is_err());

        let mut with_both = base.to_vec();
        with_both.extend_from_slice(&["--count", "1", "--absent", "pod-x"]);
        assert!(parse_probe(&with_both).is_err());

        let mut with_count = base.to_vec();
        with_count.extend_from_slice(&["--count", "1", "--namespace", "ns2"]);
        let ProbeCommand::Registration(args) = parse_probe(&with_count).unwrap() else {
            panic!("expected registration")
        };
        assert_eq!(args.count, Some(1));
        assert_eq!(args.namespace, "ns2");
        assert_eq!(args.budget.budget(RetryBudget::REGISTRATION_INTERVAL).unwrap().interval(),
            Duration::from_millis(500));
    }

    #[tokio::test]
    async fn unreachable_url_exhausts_budget() {
        let args = ConnectivityArgs {
            url: "http://127.0.0.1:9/".to_string(),
            expect_failure: false,
            patterns: vec![],
            exec_from: None,
            namespace: None,
            kubeconfig: None,
            kube_context: None,
            marker: "hello world".to_string(),
            budget: BudgetArgs {
                attempts: 2,
                interval_ms: Some(1),
            },
        };
        let err = connectivity(args, CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("not converged after 2 attempt(s)"));
    }

    #[tokio::test]
    async fn refused_url_matches_expected_failure() {
        let args = ConnectivityArgs {
            url: "http://127.0.0.1:9/".to_string(),
            expect_failure: true,
            patterns: vec!["error sending request".to_string()],
            exec_from: None,
            namespace: None,
            kubeconfig: None,
            kube_context: None,
            marker: "hello world".to_string(),
            budget: BudgetArgs {
                attempts: 1,
                interval_ms: None,
            },
        };
        connectivity(args, CancellationToken::new()).await.unwrap();
    }
}
