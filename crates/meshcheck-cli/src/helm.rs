//! Helm release management
//!
//! Installs go through the `helm` binary; [`HelmRunner`] is the seam that
//! lets the scenario layer be tested without a cluster.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use meshcheck_common::command::{run_cmd, KubectlOptions};
#[cfg(test)]
use mockall::automock;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::info;

use crate::Result;

/// Prefix of generated release names
pub const RELEASE_PREFIX: &str = "consul";

/// Slack on top of `helm --timeout` before the process itself is killed
const PROCESS_TIMEOUT_SLACK: Duration = Duration::from_secs(60);

/// Random release name: `consul-` plus 6 lowercase alphanumerics
pub fn random_release_name() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("{RELEASE_PREFIX}-{suffix}")
}

/// Ordered `--set` values
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HelmValues(BTreeMap<String, String>);

impl HelmValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key`, replacing any earlier value
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Set `key` to `"true"` or `"false"`
    pub fn set_bool(self, key: impl Into<String>, value: bool) -> Self {
        self.set(key, value.to_string())
    }

    /// Apply `overrides` on top of these values
    pub fn merged(mut self, overrides: &[(String, String)]) -> Self {
        for (k, v) in overrides {
            self.0.insert(k.clone(), v.clone());
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// `--set k=v` pairs
    pub fn to_args(&self) -> Vec<String> {
        self.0
            .iter()
            .flat_map(|(k, v)| ["--set".to_string(), format!("{k}={v}")])
            .collect()
    }
}

/// A Helm release to install
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelmRelease {
    pub name: String,
    pub chart: String,
    pub namespace: Option<String>,
    pub values: HelmValues,
}

impl HelmRelease {
    /// Release of `chart` under a random name
    pub fn new(chart: impl Into<String>, values: HelmValues) -> Self {
        Self {
            name: random_release_name(),
            chart: chart.into(),
            namespace: None,
            values,
        }
    }

    /// `helm install` arguments (without the cluster flags)
    pub fn install_args(&self, timeout: Duration) -> Vec<String> {
        let mut args = vec![
            "install".to_string(),
            self.name.clone(),
            self.chart.clone(),
            "--wait".to_string(),
            "--timeout".to_string(),
            format!("{}s", timeout.as_secs()),
        ];
        if let Some(ns) = &self.namespace {
            args.push("--namespace".to_string());
            args.push(ns.clone());
        }
        args.extend(self.values.to_args());
        args
    }

    /// `helm uninstall` arguments (without the cluster flags)
    pub fn uninstall_args(&self) -> Vec<String> {
        let mut args = vec!["uninstall".to_string(), self.name.clone()];
        if let Some(ns) = &self.namespace {
            args.push("--namespace".to_string());
            args.push(ns.clone());
        }
        args
    }
}

/// Installs and removes releases
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HelmRunner: Send + Sync {
    /// `helm install --wait`
    async fn install(&self, release: &HelmRelease, timeout: Duration) -> Result<()>;
    /// `helm uninstall`
    async fn uninstall(&self, release: &HelmRelease) -> Result<()>;
}

/// [`HelmRunner`] backed by the `helm` binary
#[derive(Debug, Clone)]
pub struct HelmCli {
    options: KubectlOptions,
}

impl HelmCli {
    pub fn new(options: KubectlOptions) -> Self {
        Self { options }
    }

    /// helm spells the cluster flags differently from kubectl
    fn cluster_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(path) = &self.options.kubeconfig {
            args.push("--kubeconfig".to_string());
            args.push(path.clone());
        }
        if let Some(ctx) = &self.options.context {
            args.push("--kube-context".to_string());
            args.push(ctx.clone());
        }
        args
    }
}

#[async_trait]
impl HelmRunner for HelmCli {
    async fn install(&self, release: &HelmRelease, timeout: Duration) -> Result<()> {
        info!(
            release = %release.name,
            chart = %release.chart,
            "[Helm] Installing (--wait, timeout {}s)",
            timeout.as_secs()
        );
        let mut args = self.cluster_args();
        args.extend(release.install_args(timeout));
        run_cmd("helm", &args, timeout + PROCESS_TIMEOUT_SLACK).await?;
        info!(release = %release.name, "[Helm] Installed");
        Ok(())
    }

    async fn uninstall(&self, release: &HelmRelease) -> Result<()> {
        info!(release = %release.name, "[Helm] Uninstalling");
        let mut args = self.cluster_args();
        args.extend(release.uninstall_args());
        match run_cmd("helm", &args, PROCESS_TIMEOUT_SLACK).await {
            Err(meshcheck_common::Error::Command { message, .. }) if is_release_not_found(&message) => {
                info!(release = %release.name, "[Helm] Release was never installed");
                Ok(())
            }
            other => {
                other?;
                Ok(())
            }
        }
    }
}

/// Whether helm's stderr says the release does not exist.
///
/// An install that fails before creating its release leaves nothing to uninstall.
fn is_release_not_found(stderr: &str) -> bool {
    stderr.contains("release: not found")
}
