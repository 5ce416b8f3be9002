//! Scenario suites
//!
//! Each suite is a table of [`Case`]s driving one shared body. A case owns
//! its Helm release, namespaces and cleanup stack; nothing is shared between
//! cases.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use meshcheck_common::{
    sidecar_proxy_name, ConvergenceChecker, STATIC_CLIENT_NAME, STATIC_CLIENT_NAMESPACE,
    STATIC_SERVER_NAME, STATIC_SERVER_NAMESPACE,
};
use meshcheck_probe::{ConsulClient, ConsulConfig, Intention};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cleanup::CleanupStack;
use crate::config::SuiteConfig;
use crate::harness::TestHarness;
use crate::helm::{HelmCli, HelmRelease, HelmRunner, HelmValues};
use crate::k8s::Cluster;
use crate::port_forward::{consul_api_port, PortForward};
use crate::{Error, Result};

pub mod cleanup_controller;
pub mod connect_inject;
pub mod root_service_accounts;

/// Destination namespace used by the cleanup-controller suite
pub const CONSUL_DEST_NAMESPACE: &str = "consul-dest";

/// URL of the static-server upstream as seen from inside static-client
pub const STATIC_SERVER_UPSTREAM: &str = "http://localhost:1234";

/// Label selecting the static-client pod
pub const STATIC_CLIENT_SELECTOR: &str = "app=static-client";

/// Kustomize fixtures
pub const FIXTURE_STATIC_SERVER: &str = "static-server-inject";
pub const FIXTURE_STATIC_CLIENT: &str = "static-client-namespaces";
pub const FIXTURE_STATIC_CLIENT_DEFAULT_SA: &str = "static-client-default-svc-account";

/// A suite of scenario cases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suite {
    ConnectInject,
    CleanupController,
    RootServiceAccounts,
}

impl Suite {
    pub const ALL: [Suite; 3] = [
        Suite::ConnectInject,
        Suite::CleanupController,
        Suite::RootServiceAccounts,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Suite::ConnectInject => "connect-inject",
            Suite::CleanupController => "cleanup-controller",
            Suite::RootServiceAccounts => "root-service-accounts",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Suite::ConnectInject => {
                "services register in the right Consul namespace; intentions and health gate traffic"
            }
            Suite::CleanupController => "force-killed pods are deregistered from Consul",
            Suite::RootServiceAccounts => "injection works with a root service account for all pods",
        }
    }

    /// Log prefix, e.g. `[Scenario/CleanupController]`
    pub fn tag(&self) -> &'static str {
        match self {
            Suite::ConnectInject => "[Scenario/ConnectInject]",
            Suite::CleanupController => "[Scenario/CleanupController]",
            Suite::RootServiceAccounts => "[Scenario/RootServiceAccounts]",
        }
    }

    pub fn cases(&self) -> Vec<Case> {
        match self {
            Suite::ConnectInject => Case::matrix(STATIC_SERVER_NAMESPACE),
            Suite::CleanupController => Case::matrix(CONSUL_DEST_NAMESPACE),
            Suite::RootServiceAccounts => vec![
                Case::new("mirror k8s namespaces", None, true, false),
                Case::new("mirror k8s namespaces; secure", None, true, true),
            ],
        }
    }

    /// Helm values for `case` in this suite
    pub fn helm_values(&self, case: &Case) -> HelmValues {
        let values = case.helm_values();
        match self {
            Suite::RootServiceAccounts => values.set("connectInject.rootServiceAccountName", "default"),
            _ => values,
        }
    }
}

impl fmt::Display for Suite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Suite {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Suite::ALL
            .into_iter()
            .find(|suite| suite.name() == s)
            .ok_or_else(|| {
                let known: Vec<_> = Suite::ALL.iter().map(|s| s.name()).collect();
                Error::validation(format!("unknown suite '{s}' (known: {})", known.join(", ")))
            })
    }
}

/// One row of a suite's case table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Case {
    pub name: String,
    /// Fixed Consul namespace for all services; ignored when mirroring
    pub destination_namespace: Option<String>,
    pub mirror_k8s: bool,
    /// ACLs and TLS
    pub secure: bool,
}

impl Case {
    pub fn new(name: &str, destination: Option<&str>, mirror_k8s: bool, secure: bool) -> Self {
        Self {
            name: name.to_string(),
            destination_namespace: destination.map(str::to_string),
            mirror_k8s,
            secure,
        }
    }

    /// {single destination, mirror} x {plain, secure}
    pub fn matrix(destination: &str) -> Vec<Case> {
        vec![
            Case::new("single destination namespace", Some(destination), false, false),
            Case::new("single destination namespace; secure", Some(destination), false, true),
            Case::new("mirror k8s namespaces", Some(destination), true, false),
            Case::new("mirror k8s namespaces; secure", Some(destination), true, true),
        ]
    }

    pub fn helm_values(&self) -> HelmValues {
        let mut values = HelmValues::new()
            .set_bool("global.enableConsulNamespaces", true)
            .set_bool("connectInject.enabled", true)
            .set_bool("connectInject.consulNamespaces.mirroringK8S", self.mirror_k8s)
            .set_bool("global.acls.manageSystemACLs", self.secure)
            .set_bool("global.tls.enabled", self.secure);
        if let Some(dest) = &self.destination_namespace {
            values = values.set("connectInject.consulNamespaces.consulDestinationNamespace", dest);
        }
        values
    }

    /// Consul namespace a workload from Kubernetes namespace `k8s_namespace`
    /// registers into
    pub fn consul_namespace<'a>(&'a self, k8s_namespace: &'a str) -> &'a str {
        match (&self.destination_namespace, self.mirror_k8s) {
            (Some(dest), false) => dest.as_str(),
            _ => k8s_namespace,
        }
    }

    /// The namespace a correctly placed workload must *not* appear in
    pub fn other_namespace<'a>(&'a self, k8s_namespace: &'a str) -> &'a str {
        match (&self.destination_namespace, self.mirror_k8s) {
            (Some(dest), true) => dest.as_str(),
            _ => k8s_namespace,
        }
    }

    /// Intention allowing static-client to reach static-server
    pub fn client_to_server_intention(&self) -> Intention {
        Intention::allow(
            STATIC_CLIENT_NAME,
            self.consul_namespace(STATIC_CLIENT_NAMESPACE),
            STATIC_SERVER_NAME,
            self.consul_namespace(STATIC_SERVER_NAMESPACE),
        )
    }
}

/// `service` and its sidecar proxy registration
pub fn with_sidecar(service: &str) -> [String; 2] {
    [service.to_string(), sidecar_proxy_name(service)]
}

/// A Consul installed by one case
pub struct ConsulCluster {
    pub release: HelmRelease,
    pub secure: bool,
}

impl ConsulCluster {
    /// Server service the port-forward targets
    pub fn server_service(&self) -> String {
        format!("svc/{}-consul-server", self.release.name)
    }

    /// Secret holding the bootstrap ACL token
    pub fn bootstrap_token_secret(&self) -> String {
        format!("{}-consul-bootstrap-acl-token", self.release.name)
    }
}

/// Register the uninstall of `release` with `cleanup`, then install it.
///
/// The hook goes first: a `--wait` install that times out has still created
/// the release.
pub async fn install_release(
    helm: Arc<dyn HelmRunner>,
    release: HelmRelease,
    timeout: Duration,
    cleanup: &mut CleanupStack,
) -> Result<HelmRelease> {
    let installed = release.clone();
    let uninstaller = helm.clone();
    cleanup.push(format!("helm uninstall {}", release.name), move || async move {
        uninstaller.uninstall(&installed).await
    });
    helm.install(&release, timeout).await?;
    Ok(release)
}

/// Everything one case needs while it runs
pub struct CaseContext {
    pub suite: Suite,
    pub case: Case,
    pub config: SuiteConfig,
    pub cluster: Cluster,
    pub helm: Arc<dyn HelmRunner>,
    pub cleanup: CleanupStack,
    cancel: CancellationToken,
    deadline: Instant,
    namespaces: Vec<String>,
}

impl CaseContext {
    pub fn new(
        suite: Suite,
        case: Case,
        config: SuiteConfig,
        cluster: Cluster,
        helm: Arc<dyn HelmRunner>,
        cancel: CancellationToken,
    ) -> Self {
        let cleanup = CleanupStack::new(
            format!("{suite}/{}", case.name),
            config.no_cleanup_on_failure,
        );
        let deadline = Instant::now() + config.scenario_timeout;
        Self {
            suite,
            case,
            config,
            cluster,
            helm,
            cleanup,
            cancel,
            deadline,
            namespaces: Vec::new(),
        }
    }

    /// A checker bounded by this case's deadline and the run's cancellation
    pub fn checker(&self, description: impl Into<String>) -> ConvergenceChecker {
        ConvergenceChecker::new(description)
            .with_cancellation(self.cancel.clone())
            .with_deadline(self.deadline)
    }

    /// Install Consul with the suite's values for this case
    pub async fn install_consul(&mut self) -> Result<ConsulCluster> {
        let values = self
            .suite
            .helm_values(&self.case)
            .merged(&self.config.helm_set);
        let release = HelmRelease::new(self.config.chart.clone(), values);
        info!(release = %release.name, "{} Installing Consul", self.suite.tag());

        // Registered first so it runs after the uninstall
        let cluster = self.cluster.clone();
        let selector = format!("release={}", release.name);
        self.cleanup.push(format!("delete pvc {selector}"), move || async move {
            let ns = cluster.default_namespace().to_string();
            cluster
                .kubectl(&ns)
                .run(&["delete", "pvc", "-l", selector.as_str(), "--ignore-not-found"])
                .await?;
            Ok(())
        });

        let release = install_release(
            self.helm.clone(),
            release,
            self.config.helm_timeout,
            &mut self.cleanup,
        )
        .await?;
        Ok(ConsulCluster {
            release,
            secure: self.case.secure,
        })
    }

    /// Create `namespace` and delete it on cleanup
    pub async fn create_namespace(&mut self, namespace: &str) -> Result<()> {
        self.cluster.create_namespace(namespace).await?;
        self.namespaces.push(namespace.to_string());
        let cluster = self.cluster.clone();
        let ns = namespace.to_string();
        self.cleanup
            .push(format!("delete namespace {namespace}"), move || async move {
                cluster.delete_namespace(&ns).await
            });
        Ok(())
    }

    /// Apply the kustomize `fixture` into `namespace` and remove it on cleanup
    pub async fn deploy(&mut self, namespace: &str, fixture: &str) -> Result<()> {
        let path = self.config.fixture(fixture);
        self.cluster.deploy_kustomize(namespace, &path).await?;
        let cluster = self.cluster.clone();
        let ns = namespace.to_string();
        self.cleanup
            .push(format!("delete -k {fixture}"), move || async move {
                cluster.delete_kustomize(&ns, &path).await
            });
        Ok(())
    }

    /// Port-forward to the Consul servers and build an API client.
    ///
    /// The forward must stay alive as long as the client is used.
    pub async fn consul_client(&self, consul: &ConsulCluster) -> Result<(ConsulClient, PortForward)> {
        let forward = PortForward::start(
            &self.config.kubectl_options(),
            &consul.server_service(),
            consul_api_port(consul.secure),
        )
        .await?;

        let mut config = ConsulConfig::local(forward.port(), consul.secure);
        if consul.secure {
            let token = self
                .cluster
                .secret_value(
                    self.cluster.default_namespace(),
                    &consul.bootstrap_token_secret(),
                    "token",
                )
                .await?;
            config = config.with_token(token);
        }
        Ok((ConsulClient::new(config)?, forward))
    }

    /// Run the cleanup stack, dumping debug state first if the case failed
    pub async fn finish(self, failed: bool) {
        if failed {
            if let Some(dir) = &self.config.debug_directory {
                for ns in &self.namespaces {
                    self.cluster.dump_debug(dir, &self.case.name, ns).await;
                }
            }
        }
        let failures = self.cleanup.release(failed).await;
        if !failures.is_empty() {
            warn!(
                case = %self.case.name,
                "{} Cleanup incomplete: {}",
                self.suite.tag(),
                failures.join(", ")
            );
        }
    }
}

async fn run_body(ctx: &mut CaseContext) -> Result<()> {
    match ctx.suite {
        Suite::ConnectInject => connect_inject::run(ctx).await,
        Suite::CleanupController => cleanup_controller::run(ctx).await,
        Suite::RootServiceAccounts => root_service_accounts::run(ctx).await,
    }
}

/// Run one case end to end: body under the case timeout, then cleanup
pub async fn run_case(mut ctx: CaseContext) -> Result<()> {
    let timeout = ctx.config.scenario_timeout;
    let result = match tokio::time::timeout(timeout, run_body(&mut ctx)).await {
        Ok(result) => result,
        Err(_) => Err(Error::command_failed(format!(
            "case did not finish within {}s",
            timeout.as_secs()
        ))),
    };
    ctx.finish(result.is_err()).await;
    result
}

/// Options for [`run_suite`]
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Only cases whose name contains this
    pub case_filter: Option<String>,
    pub cancel: CancellationToken,
}

/// Cases of `suite` selected by `filter`
pub fn select_cases(suite: Suite, filter: Option<&str>) -> Vec<Case> {
    suite
        .cases()
        .into_iter()
        .filter(|c| filter.map_or(true, |f| c.name.contains(f)))
        .collect()
}

/// Run every selected case of `suite` and report
pub async fn run_suite(suite: Suite, config: &SuiteConfig, options: &RunOptions) -> Result<()> {
    let harness = TestHarness::new(suite.name());
    let cases = select_cases(suite, options.case_filter.as_deref());
    if cases.is_empty() {
        return Err(Error::validation(format!(
            "no case of {suite} matches '{}'",
            options.case_filter.as_deref().unwrap_or_default()
        )));
    }

    if !config.enable_enterprise {
        for case in &cases {
            harness.skip(&case.name, "needs Consul Enterprise (--enable-enterprise)");
        }
        return harness.finish();
    }

    let cluster = Cluster::connect(config).await?;
    let helm: Arc<dyn HelmRunner> = Arc::new(HelmCli::new(config.kubectl_options()));

    for case in cases {
        if options.cancel.is_cancelled() {
            harness.skip(&case.name, "run cancelled");
            continue;
        }
        let ctx = CaseContext::new(
            suite,
            case.clone(),
            config.clone(),
            cluster.clone(),
            helm.clone(),
            options.cancel.clone(),
        );
        harness.run(&case.name, || run_case(ctx)).await;
    }
    harness.finish()
}
