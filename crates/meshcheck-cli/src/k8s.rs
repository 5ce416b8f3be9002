//! Kubernetes operations used by the scenarios
//!
//! Typed API calls go through kube-rs; kustomize, exec and rollout waits go
//! through kubectl, which already implements them.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Namespace, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use meshcheck_common::command::Kubectl;
use tracing::{debug, info, warn};

use crate::config::SuiteConfig;
use crate::error::CommandErrorExt;
use crate::{Error, Result};

/// How long to wait for deployments from a fixture to become available
const ROLLOUT_TIMEOUT: Duration = Duration::from_secs(300);

/// How long a deleted namespace may take to finish terminating
const NAMESPACE_DELETION_TIMEOUT: Duration = Duration::from_secs(180);

/// Poll interval while waiting for a deletion
const DELETION_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Build a kube [`Client`] from an optional kubeconfig path and context.
///
/// With neither set, kube's inference (`KUBECONFIG`, `~/.kube/config`,
/// in-cluster) decides.
pub async fn kube_client(kubeconfig: Option<&str>, context: Option<&str>) -> Result<Client> {
    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..Default::default()
    };
    let config = match (kubeconfig, context) {
        (Some(path), _) => {
            let kc = Kubeconfig::read_from(path).map_err(|e| {
                Error::command_failed(format!("failed to read kubeconfig {path}: {e}"))
            })?;
            Config::from_custom_kubeconfig(kc, &options).await.cmd_err()?
        }
        (None, Some(_)) => Config::from_kubeconfig(&options).await.cmd_err()?,
        (None, None) => Config::infer().await.cmd_err()?,
    };
    Ok(Client::try_from(config)?)
}

/// Ignore 404 (gone already)
fn ignore_not_found<T>(result: std::result::Result<T, kube::Error>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Whether `ns` is already on its way out
fn is_terminating(ns: &Namespace) -> bool {
    ns.metadata.deletion_timestamp.is_some()
}

/// Wait until `check_exists` reports the resource gone.
///
/// `check_exists` returns `Ok(true)` while the resource is still there.
/// Running out of `timeout` is an error: the caller is about to reuse the name.
async fn wait_for_deletion<F, Fut>(
    timeout: Duration,
    interval: Duration,
    description: &str,
    mut check_exists: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = tokio::time::Instant::now();

    loop {
        if !check_exists().await? {
            debug!("{description} deleted");
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(Error::command_failed(format!(
                "{description} still present after {}s",
                timeout.as_secs()
            )));
        }
        debug!("{description} still exists, waiting...");
        tokio::time::sleep(interval).await;
    }
}

/// One cluster, reached through both kube-rs and kubectl
#[derive(Clone)]
pub struct Cluster {
    client: Client,
    kubectl: Kubectl,
}

impl Cluster {
    pub fn new(client: Client, kubectl: Kubectl) -> Self {
        Self { client, kubectl }
    }

    /// Connect using the suite's kubeconfig and context
    pub async fn connect(config: &SuiteConfig) -> Result<Self> {
        let client = kube_client(config.kubeconfig.as_deref(), config.kube_context.as_deref()).await?;
        Ok(Self::new(client, Kubectl::new(config.kubectl_options())))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// kubectl scoped to `namespace`
    pub fn kubectl(&self, namespace: &str) -> Kubectl {
        self.kubectl.namespaced(namespace)
    }

    /// Namespace helm installs into when none is given
    pub fn default_namespace(&self) -> &str {
        self.client.default_namespace()
    }

    /// Create `name`; an existing namespace is fine.
    ///
    /// A namespace still terminating from an earlier case is waited out and
    /// then created fresh.
    pub async fn create_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &ns).await {
            Ok(_) => {
                info!(namespace = name, "[K8s] Created namespace");
                return Ok(());
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {}
            Err(e) => return Err(e.into()),
        }

        match api.get_opt(name).await? {
            Some(existing) if is_terminating(&existing) => {
                info!(namespace = name, "[K8s] Namespace is terminating, waiting before recreating");
                self.wait_for_namespace_gone(name).await?;
                api.create(&PostParams::default(), &ns).await?;
                info!(namespace = name, "[K8s] Created namespace");
            }
            Some(_) => debug!(namespace = name, "[K8s] Namespace already exists"),
            None => {
                api.create(&PostParams::default(), &ns).await?;
                info!(namespace = name, "[K8s] Created namespace");
            }
        }
        Ok(())
    }

    /// Delete `name` and wait until the API server has finished removing it
    pub async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        info!(namespace = name, "[K8s] Deleting namespace");
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)?;
        self.wait_for_namespace_gone(name).await
    }

    async fn wait_for_namespace_gone(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let description = format!("namespace {name}");
        wait_for_deletion(
            NAMESPACE_DELETION_TIMEOUT,
            DELETION_POLL_INTERVAL,
            &description,
            || {
                let api = api.clone();
                async move { Ok(api.get_opt(name).await?.is_some()) }
            },
        )
        .await
    }

    /// `kubectl apply -k <dir>` into `namespace`, then wait for its deployments
    pub async fn deploy_kustomize(&self, namespace: &str, dir: &Path) -> Result<()> {
        let dir = dir.to_string_lossy().into_owned();
        info!(namespace = namespace, fixture = %dir, "[K8s] Applying kustomization");
        let kubectl = self.kubectl(namespace);
        kubectl.run(&["apply", "-k", dir.as_str()]).await?;

        let timeout = format!("--timeout={}s", ROLLOUT_TIMEOUT.as_secs());
        kubectl
            .with_timeout(ROLLOUT_TIMEOUT + Duration::from_secs(30))
            .run(&["wait", "--for=condition=available", "deploy", "--all", timeout.as_str()])
            .await?;
        Ok(())
    }

    /// `kubectl delete -k <dir>` from `namespace`
    pub async fn delete_kustomize(&self, namespace: &str, dir: &Path) -> Result<()> {
        let dir = dir.to_string_lossy().into_owned();
        self.kubectl(namespace)
            .run(&["delete", "-k", dir.as_str(), "--ignore-not-found"])
            .await?;
        Ok(())
    }

    /// Names of pods in `namespace` matching `selector`
    pub async fn pod_names(&self, namespace: &str, selector: &str) -> Result<Vec<String>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default().labels(selector)).await?;
        Ok(pods
            .items
            .into_iter()
            .filter_map(|p| p.metadata.name)
            .collect())
    }

    /// Delete a pod with a zero grace period
    pub async fn force_delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        info!(namespace = namespace, pod = name, "[K8s] Force deleting pod");
        api.delete(name, &params).await?;
        Ok(())
    }

    /// Run `command` in the default container of `deploy/<deployment>`
    pub async fn exec(&self, namespace: &str, deployment: &str, command: &[&str]) -> Result<String> {
        let target = format!("deploy/{deployment}");
        let mut args = vec!["exec", target.as_str(), "--"];
        args.extend_from_slice(command);
        Ok(self.kubectl(namespace).run(&args).await?)
    }

    /// Value of `key` in secret `name`, decoded as UTF-8
    pub async fn secret_value(&self, namespace: &str, name: &str, key: &str) -> Result<String> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get(name).await?;
        let bytes = secret
            .data
            .and_then(|mut data| data.remove(key))
            .ok_or_else(|| Error::validation(format!("secret {namespace}/{name} has no key {key}")))?;
        String::from_utf8(bytes.0)
            .map_err(|e| Error::validation(format!("secret {namespace}/{name} key {key}: {e}")))
    }

    /// Write pod descriptions and logs from `namespace` under `dir/<case>/`.
    ///
    /// Best effort: failures are logged, never returned.
    pub async fn dump_debug(&self, dir: &Path, case: &str, namespace: &str) {
        let case_dir: String = case
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        let target = dir.join(case_dir).join(namespace);
        if let Err(e) = tokio::fs::create_dir_all(&target).await {
            warn!(path = %target.display(), error = %e, "[K8s] Cannot create debug directory");
            return;
        }

        let kubectl = self.kubectl(namespace);
        let dumps: [(&str, &[&str]); 2] = [
            ("pods.txt", &["describe", "pods"]),
            ("logs.txt", &["logs", "--all-containers", "--prefix", "-l", "app"]),
        ];
        for (file, args) in dumps {
            let content = match kubectl.output(args).await {
                Ok(out) => out.combined(),
                Err(e) => e.to_string(),
            };
            if let Err(e) = tokio::fs::write(target.join(file), content).await {
                warn!(file = file, error = %e, "[K8s] Cannot write debug dump");
            }
        }
        info!(path = %target.display(), "[K8s] Wrote debug dump");
    }
}
