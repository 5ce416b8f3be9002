//! Probes against an already-running Consul
//!
//! `MESHCHECK_CONSUL_ADDR` points at the API (typically a port-forward);
//! `MESHCHECK_CONSUL_TOKEN` is needed when ACLs are on.

use std::time::Duration;

use meshcheck_common::telemetry::init_test_logging;
use meshcheck_common::{ConvergenceChecker, ProbeResult, RetryBudget};
use meshcheck_probe::{ConsulClient, ConsulConfig, RegistrationProbe, RegistrationSnapshot};
use tracing::info;

fn consul_from_env() -> ConsulClient {
    let addr = std::env::var("MESHCHECK_CONSUL_ADDR")
        .expect("MESHCHECK_CONSUL_ADDR must point at the Consul API");
    let mut config = ConsulConfig::new(addr.clone());
    config.accept_invalid_certs = addr.starts_with("https://");
    if let Ok(token) = std::env::var("MESHCHECK_CONSUL_TOKEN") {
        config = config.with_token(token);
    }
    ConsulClient::new(config).expect("consul client")
}

/// The Consul servers register themselves as the `consul` service
#[tokio::test]
#[ignore]
async fn consul_servers_are_registered() {
    init_test_logging();
    let client = &consul_from_env();

    ConvergenceChecker::new("consul service registered")
        .assert(&RetryBudget::registration(), move || async move {
            match RegistrationSnapshot::capture(client, &["consul"], "default").await {
                Ok(snapshot) if snapshot.count("consul") > 0 => ProbeResult::Success,
                Ok(_) => ProbeResult::retry("no consul server registered yet"),
                Err(e) => ProbeResult::FatalFailure(e),
            }
        })
        .await
        .unwrap();
}

#[tokio::test]
#[ignore]
async fn snapshot_of_static_workloads() {
    init_test_logging();
    let client = consul_from_env();

    for namespace in ["ns1", "ns2", "consul-dest"] {
        let snapshot = RegistrationSnapshot::capture(
            &client,
            &["static-server", "static-client"],
            namespace,
        )
        .await
        .unwrap();
        info!(
            namespace = namespace,
            server = snapshot.count("static-server"),
            client = snapshot.count("static-client"),
            "[Probes] Registration snapshot"
        );
    }
}

#[tokio::test]
#[ignore]
async fn bogus_service_never_converges() {
    init_test_logging();
    let probe = RegistrationProbe::new(consul_from_env());
    let budget = RetryBudget::new(3, Duration::from_millis(100)).unwrap();

    let err = ConvergenceChecker::new("bogus service registered")
        .assert(&budget, || probe.check_count("no-such-service-meshcheck", "default", 1))
        .await
        .unwrap_err();
    assert!(err.is_exhausted());
}
