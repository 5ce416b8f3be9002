//! The cleanup controller deregisters force-killed pods.

use meshcheck_common::{RetryBudget, STATIC_CLIENT_NAME, STATIC_CLIENT_NAMESPACE};
use meshcheck_probe::RegistrationProbe;
use tracing::info;

use super::{with_sidecar, CaseContext, FIXTURE_STATIC_CLIENT, STATIC_CLIENT_SELECTOR};
use crate::{Error, Result};

pub async fn run(ctx: &mut CaseContext) -> Result<()> {
    let tag = ctx.suite.tag();
    let case = ctx.case.clone();

    let consul = ctx.install_consul().await?;

    info!("{tag} Creating namespace {STATIC_CLIENT_NAMESPACE}");
    ctx.create_namespace(STATIC_CLIENT_NAMESPACE).await?;

    info!("{tag} Deploying static-client");
    ctx.deploy(STATIC_CLIENT_NAMESPACE, FIXTURE_STATIC_CLIENT).await?;

    let (client, _forward) = ctx.consul_client(&consul).await?;
    let registrations = RegistrationProbe::new(client);
    let consul_namespace = case.consul_namespace(STATIC_CLIENT_NAMESPACE);
    let services = with_sidecar(STATIC_CLIENT_NAME);
    let services: Vec<&str> = services.iter().map(String::as_str).collect();

    info!("{tag} Waiting for static-client to be registered in {consul_namespace}");
    ctx.checker(format!("static-client registered in {consul_namespace}"))
        .assert(&RetryBudget::registration(), || {
            registrations.check_counts(&services, consul_namespace, 1)
        })
        .await?;

    let pods = ctx
        .cluster
        .pod_names(STATIC_CLIENT_NAMESPACE, STATIC_CLIENT_SELECTOR)
        .await?;
    let pod = match pods.as_slice() {
        [pod] => pod.clone(),
        other => {
            return Err(Error::validation(format!(
                "expected 1 pod matching {STATIC_CLIENT_SELECTOR}, found {}",
                other.len()
            )))
        }
    };

    info!(pod = %pod, "{tag} Force killing static-client pod");
    ctx.cluster
        .force_delete_pod(STATIC_CLIENT_NAMESPACE, &pod)
        .await?;

    info!(pod = %pod, "{tag} Ensuring pod is deregistered");
    ctx.checker(format!("{pod} deregistered from {consul_namespace}"))
        .assert(&RetryBudget::registration(), || {
            registrations.check_all_absent(&services, consul_namespace, &pod)
        })
        .await?;

    Ok(())
}
