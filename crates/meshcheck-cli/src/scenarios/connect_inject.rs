//! Connect injection with Consul namespaces.
//!
//! Registration lands in the mirrored or the single destination namespace,
//! intentions gate traffic in secure mode, and Kubernetes readiness is synced
//! into Consul health.

use meshcheck_common::{
    RetryBudget, STATIC_CLIENT_NAME, STATIC_CLIENT_NAMESPACE, STATIC_SERVER_NAME,
    STATIC_SERVER_NAMESPACE,
};
use meshcheck_probe::{AcceptedFailures, ConnectivityProbe, ExecCurlTransport, RegistrationProbe};
use tracing::info;

use super::{
    CaseContext, FIXTURE_STATIC_CLIENT, FIXTURE_STATIC_SERVER, STATIC_SERVER_UPSTREAM,
};
use crate::Result;

pub async fn run(ctx: &mut CaseContext) -> Result<()> {
    let tag = ctx.suite.tag();
    let case = ctx.case.clone();

    let consul = ctx.install_consul().await?;

    info!("{tag} Creating namespaces {STATIC_SERVER_NAMESPACE} and {STATIC_CLIENT_NAMESPACE}");
    ctx.create_namespace(STATIC_SERVER_NAMESPACE).await?;
    ctx.create_namespace(STATIC_CLIENT_NAMESPACE).await?;

    info!("{tag} Deploying static-server and static-client");
    ctx.deploy(STATIC_SERVER_NAMESPACE, FIXTURE_STATIC_SERVER).await?;
    ctx.deploy(STATIC_CLIENT_NAMESPACE, FIXTURE_STATIC_CLIENT).await?;

    let (client, _forward) = ctx.consul_client(&consul).await?;
    let registrations = RegistrationProbe::new(client);

    for (service, k8s_namespace) in [
        (STATIC_SERVER_NAME, STATIC_SERVER_NAMESPACE),
        (STATIC_CLIENT_NAME, STATIC_CLIENT_NAMESPACE),
    ] {
        let expected = case.consul_namespace(k8s_namespace);
        let other = case.other_namespace(k8s_namespace);
        info!(service = service, expected = expected, "{tag} Checking registration placement");
        ctx.checker(format!("{service} registered only in Consul namespace {expected}"))
            .assert(&RetryBudget::registration(), || {
                registrations.check_placement(service, expected, other)
            })
            .await?;
    }

    let connectivity = ConnectivityProbe::new(ExecCurlTransport::new(
        ctx.cluster.kubectl(STATIC_CLIENT_NAMESPACE),
        STATIC_CLIENT_NAME,
    ));
    let budget = RetryBudget::connectivity();

    if case.secure {
        info!("{tag} Checking that the connection is refused without an intention");
        connectivity
            .assert_failing(
                &ctx.checker("connection refused without intention"),
                &budget,
                STATIC_SERVER_UPSTREAM,
                &AcceptedFailures::mesh_refusal(),
            )
            .await?;

        info!("{tag} Creating intention");
        registrations
            .directory()
            .create_intention(&case.client_to_server_intention())
            .await?;
    }

    info!("{tag} Checking that the connection is successful");
    connectivity
        .assert_successful(
            &ctx.checker("static-client reaches static-server"),
            &budget,
            STATIC_SERVER_UPSTREAM,
        )
        .await?;

    // Fails the static-server readiness probe; Consul should stop routing to it
    info!("{tag} Making static-server unhealthy");
    ctx.cluster
        .exec(STATIC_SERVER_NAMESPACE, STATIC_SERVER_NAME, &["touch", "/tmp/unhealthy"])
        .await?;

    info!("{tag} Checking that the connection is unsuccessful");
    connectivity
        .assert_failing(
            &ctx.checker("connection fails once static-server is unhealthy"),
            &budget,
            STATIC_SERVER_UPSTREAM,
            &AcceptedFailures::mesh_refusal(),
        )
        .await?;

    Ok(())
}
