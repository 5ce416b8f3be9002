//! Suite configuration
//!
//! Every setting is a CLI flag with a `MESHCHECK_*` environment fallback, so
//! the same struct configures both `meshcheck run` and the cluster tests
//! (which only have the environment).

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser};
use meshcheck_common::command::KubectlOptions;

use crate::{Error, Result};

/// Chart installed when none is configured
pub const DEFAULT_CHART: &str = "hashicorp/consul";

/// Kustomize fixtures, relative to the working directory
pub const DEFAULT_FIXTURES_DIR: &str = "fixtures/cases";

/// Flags shared by every command that touches a cluster
#[derive(Args, Debug, Clone)]
pub struct SuiteArgs {
    /// Kubeconfig to use (kube defaults when unset)
    #[arg(long, env = "MESHCHECK_KUBECONFIG")]
    pub kubeconfig: Option<String>,

    /// Kubeconfig context to use
    #[arg(long, env = "MESHCHECK_KUBE_CONTEXT")]
    pub kube_context: Option<String>,

    /// Helm chart reference or local path
    #[arg(long, env = "MESHCHECK_CHART", default_value = DEFAULT_CHART)]
    pub chart: String,

    /// Run scenarios that need Consul Enterprise (namespaces)
    #[arg(long, env = "MESHCHECK_ENABLE_ENTERPRISE")]
    pub enable_enterprise: bool,

    /// Keep cluster resources when a scenario fails
    #[arg(long, env = "MESHCHECK_NO_CLEANUP_ON_FAILURE")]
    pub no_cleanup_on_failure: bool,

    /// Where to dump pod state and logs for failed scenarios
    #[arg(long, env = "MESHCHECK_DEBUG_DIRECTORY")]
    pub debug_directory: Option<PathBuf>,

    /// Directory holding the kustomize fixtures
    #[arg(long, env = "MESHCHECK_FIXTURES_DIR", default_value = DEFAULT_FIXTURES_DIR)]
    pub fixtures_dir: PathBuf,

    /// Overall timeout per scenario case, in seconds
    #[arg(long, env = "MESHCHECK_TIMEOUT_SECS", default_value = "900")]
    pub timeout_secs: u64,

    /// `helm install --timeout`, in seconds
    #[arg(long, env = "MESHCHECK_HELM_TIMEOUT_SECS", default_value = "300")]
    pub helm_timeout_secs: u64,

    /// Extra helm values (`key=value`), applied after the case's own
    #[arg(
        long = "set",
        env = "MESHCHECK_HELM_SET",
        value_delimiter = ',',
        value_parser = parse_key_val
    )]
    pub helm_set: Vec<(String, String)>,
}

/// Parse `key=value`
fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got '{s}'")),
    }
}

/// Resolved suite configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteConfig {
    pub kubeconfig: Option<String>,
    pub kube_context: Option<String>,
    pub chart: String,
    pub enable_enterprise: bool,
    pub no_cleanup_on_failure: bool,
    pub debug_directory: Option<PathBuf>,
    pub fixtures_dir: PathBuf,
    pub scenario_timeout: Duration,
    pub helm_timeout: Duration,
    pub helm_set: Vec<(String, String)>,
}

#[derive(Parser)]
#[command(name = "meshcheck")]
struct EnvOnly {
    #[command(flatten)]
    suite: SuiteArgs,
}

impl SuiteConfig {
    /// Build the config from `MESHCHECK_*` environment variables alone
    pub fn from_env() -> Result<Self> {
        let parsed =
            EnvOnly::try_parse_from(["meshcheck"]).map_err(|e| Error::validation(e.to_string()))?;
        Self::try_from(parsed.suite)
    }

    /// kubectl flags for the configured cluster
    pub fn kubectl_options(&self) -> KubectlOptions {
        KubectlOptions {
            kubeconfig: self.kubeconfig.clone(),
            context: self.kube_context.clone(),
            namespace: None,
        }
    }

    /// Path of the kustomize fixture `name`
    pub fn fixture(&self, name: &str) -> PathBuf {
        self.fixtures_dir.join(name)
    }
}

impl TryFrom<SuiteArgs> for SuiteConfig {
    type Error = Error;

    fn try_from(args: SuiteArgs) -> Result<Self> {
        if args.timeout_secs == 0 {
            return Err(Error::validation("timeout_secs must be > 0"));
        }
        if args.helm_timeout_secs == 0 {
            return Err(Error::validation("helm_timeout_secs must be > 0"));
        }
        if args.chart.trim().is_empty() {
            return Err(Error::validation("chart must not be empty"));
        }
        Ok(Self {
            kubeconfig: args.kubeconfig,
            kube_context: args.kube_context,
            chart: args.chart,
            enable_enterprise: args.enable_enterprise,
            no_cleanup_on_failure: args.no_cleanup_on_failure,
            debug_directory: args.debug_directory,
            fixtures_dir: args.fixtures_dir,
            scenario_timeout: Duration::from_secs(args.timeout_secs),
            helm_timeout: Duration::from_secs(args.helm_timeout_secs),
            helm_set: args.helm_set,
        })
    }
}
