//! Injection with `connectInject.rootServiceAccountName=default`.
//!
//! Registration alone proves the service account worked: with ACLs on, a
//! failed Consul login leaves the service unregistered.

use meshcheck_common::{
    RetryBudget, STATIC_CLIENT_NAME, STATIC_CLIENT_NAMESPACE, STATIC_SERVER_NAME,
    STATIC_SERVER_NAMESPACE,
};
use meshcheck_probe::RegistrationProbe;
use tracing::info;

use super::{
    with_sidecar, CaseContext, FIXTURE_STATIC_CLIENT_DEFAULT_SA, FIXTURE_STATIC_SERVER,
};
use crate::Result;

pub async fn run(ctx: &mut CaseContext) -> Result<()> {
    let tag = ctx.suite.tag();
    let case = ctx.case.clone();

    let consul = ctx.install_consul().await?;

    info!("{tag} Creating namespaces {STATIC_SERVER_NAMESPACE} and {STATIC_CLIENT_NAMESPACE}");
    ctx.create_namespace(STATIC_SERVER_NAMESPACE).await?;
    ctx.create_namespace(STATIC_CLIENT_NAMESPACE).await?;

    info!("{tag} Deploying static-client and static-server");
    ctx.deploy(STATIC_CLIENT_NAMESPACE, FIXTURE_STATIC_CLIENT_DEFAULT_SA)
        .await?;
    ctx.deploy(STATIC_SERVER_NAMESPACE, FIXTURE_STATIC_SERVER)
        .await?;

    let (client, _forward) = ctx.consul_client(&consul).await?;
    let registrations = RegistrationProbe::new(client);

    for (service, k8s_namespace) in [
        (STATIC_CLIENT_NAME, STATIC_CLIENT_NAMESPACE),
        (STATIC_SERVER_NAME, STATIC_SERVER_NAMESPACE),
    ] {
        let consul_namespace = case.consul_namespace(k8s_namespace);
        let services = with_sidecar(service);
        let services: Vec<&str> = services.iter().map(String::as_str).collect();

        info!("{tag} Checking {service} is registered in {consul_namespace}");
        ctx.checker(format!("{service} and its sidecar registered in {consul_namespace}"))
            .assert(&RetryBudget::registration(), || {
                registrations.check_counts(&services, consul_namespace, 1)
            })
            .await?;
    }

    Ok(())
}
