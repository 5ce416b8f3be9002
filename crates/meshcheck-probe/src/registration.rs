//! Registration probe
//!
//! Asserts on what the service directory (Consul catalog) reports for a
//! service in a namespace. A failing query is fatal here: wrong credentials
//! or an unreachable API do not fix themselves by waiting. A wrong count is
//! just propagation delay.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use meshcheck_common::{ProbeResult, Result};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

/// One registered instance as returned by the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Unique instance identifier; the injector embeds the pod name in it
    #[serde(rename = "ServiceID")]
    pub service_id: String,
    /// Logical service name
    #[serde(rename = "ServiceName")]
    pub service_name: String,
    /// Node the instance is registered on
    #[serde(rename = "Node", default)]
    pub node: String,
    /// Directory namespace (enterprise only)
    #[serde(rename = "Namespace", default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Read access to a service directory
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServiceDirectory: Send + Sync {
    /// All instances of `service` registered in `namespace`
    async fn service_instances(&self, service: &str, namespace: &str)
        -> Result<Vec<ServiceInstance>>;
}

#[async_trait]
impl<D: ServiceDirectory + ?Sized> ServiceDirectory for Arc<D> {
    async fn service_instances(
        &self,
        service: &str,
        namespace: &str,
    ) -> Result<Vec<ServiceInstance>> {
        (**self).service_instances(service, namespace).await
    }
}

/// Instances of several services in one namespace, captured at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationSnapshot {
    namespace: String,
    services: BTreeMap<String, Vec<ServiceInstance>>,
}

impl RegistrationSnapshot {
    /// Query `directory` for each of `services` in `namespace`
    pub async fn capture<D: ServiceDirectory + ?Sized>(
        directory: &D,
        services: &[&str],
        namespace: &str,
    ) -> Result<Self> {
        let mut snapshot = Self {
            namespace: namespace.to_string(),
            services: BTreeMap::new(),
        };
        for service in services {
            let instances = directory.service_instances(service, namespace).await?;
            snapshot.services.insert(service.to_string(), instances);
        }
        Ok(snapshot)
    }

    /// Namespace the snapshot was taken in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Number of instances of `service` (0 if it was not queried)
    pub fn count(&self, service: &str) -> usize {
        self.services.get(service).map_or(0, Vec::len)
    }

    /// Instance ids of `service`
    pub fn instance_ids(&self, service: &str) -> Vec<&str> {
        self.services
            .get(service)
            .map(|instances| instances.iter().map(|i| i.service_id.as_str()).collect())
            .unwrap_or_default()
    }

    /// First instance id of `service` containing `needle`
    pub fn find_instance(&self, service: &str, needle: &str) -> Option<&str> {
        self.instance_ids(service)
            .into_iter()
            .find(|id| id.contains(needle))
    }
}

/// Probes a [`ServiceDirectory`]
pub struct RegistrationProbe<D> {
    directory: D,
}

impl<D: ServiceDirectory> RegistrationProbe<D> {
    /// Create a probe over `directory`
    pub fn new(directory: D) -> Self {
        Self { directory }
    }

    /// The underlying directory
    pub fn directory(&self) -> &D {
        &self.directory
    }

    async fn snapshot(&self, services: &[&str], namespace: &str) -> std::result::Result<RegistrationSnapshot, ProbeResult> {
        RegistrationSnapshot::capture(&self.directory, services, namespace)
            .await
            .map_err(ProbeResult::FatalFailure)
    }

    /// Exactly `expected` instances of `service` in `namespace`
    pub async fn check_count(&self, service: &str, namespace: &str, expected: usize) -> ProbeResult {
        self.check_counts(&[service], namespace, expected).await
    }

    /// Exactly `expected` instances of every one of `services` in `namespace`.
    ///
    /// Reports the first service whose count is off.
    pub async fn check_counts(&self, services: &[&str], namespace: &str, expected: usize) -> ProbeResult {
        let snapshot = match self.snapshot(services, namespace).await {
            Ok(s) => s,
            Err(fatal) => return fatal,
        };
        for service in services {
            let found = snapshot.count(service);
            if found != expected {
                return ProbeResult::retry(format!(
                    "expected {expected} instance(s) of {service} in {namespace}, found {found}"
                ));
            }
        }
        ProbeResult::Success
    }

    /// No instance of `service` in `namespace` has an id containing `needle`
    pub async fn check_absent(&self, service: &str, namespace: &str, needle: &str) -> ProbeResult {
        self.check_all_absent(&[service], namespace, needle).await
    }

    /// [`check_absent`](Self::check_absent) for several services at once
    pub async fn check_all_absent(&self, services: &[&str], namespace: &str, needle: &str) -> ProbeResult {
        let snapshot = match self.snapshot(services, namespace).await {
            Ok(s) => s,
            Err(fatal) => return fatal,
        };
        for service in services {
            if let Some(id) = snapshot.find_instance(service, needle) {
                return ProbeResult::retry(format!("{id} is still registered in {namespace}"));
            }
        }
        ProbeResult::Success
    }

    /// `service` has one instance in `expected_namespace` and none in
    /// `other_namespace`.
    ///
    /// Distinguishes mirrored from single-destination namespace placement.
    /// When both namespaces are the same this is a plain count of one.
    pub async fn check_placement(
        &self,
        service: &str,
        expected_namespace: &str,
        other_namespace: &str,
    ) -> ProbeResult {
        let expected = self.check_count(service, expected_namespace, 1).await;
        if !expected.is_success() || expected_namespace == other_namespace {
            return expected;
        }
        match self.snapshot(&[service], other_namespace).await {
            Ok(snapshot) if snapshot.count(service) == 0 => ProbeResult::Success,
            Ok(snapshot) => ProbeResult::retry(format!(
                "{service} registered in both {expected_namespace} and {other_namespace} ({} instance(s))",
                snapshot.count(service)
            )),
            Err(fatal) => fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshcheck_common::{ConvergenceChecker, Error, RetryBudget};
    use mockall::predicate::eq;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn instance(service: &str, pod: &str) -> ServiceInstance {
        ServiceInstance {
            service_id: format!("{pod}-{service}"),
            service_name: service.to_string(),
            node: "k8s-sync".to_string(),
            namespace: None,
        }
    }

    fn instances(service: &str, pods: &[&str]) -> Vec<ServiceInstance> {
        pods.iter().map(|p| instance(service, p)).collect()
    }

    #[test]
    fn service_instance_deserializes_catalog_json() {
        let body = r#"[{
            "ID": "7a6d...",
            "Node": "kind-worker",
            "ServiceID": "static-client-6d8b9c-x2x9z-static-client",
            "ServiceName": "static-client",
            "Namespace": "ns2",
            "ServicePort": 0
        }]"#;
        let parsed: Vec<ServiceInstance> = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].service_name, "static-client");
        assert_eq!(parsed[0].namespace.as_deref(), Some("ns2"));
        assert!(parsed[0].service_id.contains("x2x9z"));
    }

    // ==========================================================================
    // Story: counting registrations
    // ==========================================================================

    #[tokio::test]
    async fn count_mismatch_is_retryable() {
        let mut dir = MockServiceDirectory::new();
        dir.expect_service_instances()
            .with(eq("static-server"), eq("ns1"))
            .returning(|s, _| Ok(instances(s, &["pod-a", "pod-b"])));

        let probe = RegistrationProbe::new(dir);
        match probe.check_count("static-server", "ns1", 1).await {
            ProbeResult::RetryableFailure(msg) => {
                assert_eq!(msg, "expected 1 instance(s) of static-server in ns1, found 2")
            }
            other => panic!("expected RetryableFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exact_count_is_success() {
        let mut dir = MockServiceDirectory::new();
        dir.expect_service_instances()
            .returning(|s, _| Ok(instances(s, &["pod-a"])));

        let probe = RegistrationProbe::new(dir);
        assert!(probe.check_count("static-server", "ns1", 1).await.is_success());
    }

    #[tokio::test]
    async fn query_error_is_fatal() {
        let mut dir = MockServiceDirectory::new();
        dir.expect_service_instances()
            .returning(|s, ns| Err(Error::directory(s, ns, "403 Forbidden: ACL not found")));

        let probe = RegistrationProbe::new(dir);
        match probe.check_count("static-server", "ns1", 1).await {
            ProbeResult::FatalFailure(e) => assert!(e.to_string().contains("ACL not found")),
            other => panic!("expected FatalFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn check_counts_reports_first_offender() {
        let mut dir = MockServiceDirectory::new();
        dir.expect_service_instances()
            .with(eq("static-client"), eq("ns2"))
            .returning(|s, _| Ok(instances(s, &["pod-a"])));
        dir.expect_service_instances()
            .with(eq("static-client-sidecar-proxy"), eq("ns2"))
            .returning(|_, _| Ok(vec![]));

        let probe = RegistrationProbe::new(dir);
        match probe
            .check_counts(&["static-client", "static-client-sidecar-proxy"], "ns2", 1)
            .await
        {
            ProbeResult::RetryableFailure(msg) => {
                assert!(msg.contains("static-client-sidecar-proxy"));
                assert!(msg.contains("found 0"));
            }
            other => panic!("expected RetryableFailure, got {other:?}"),
        }
    }

    // ==========================================================================
    // Story: a force-killed pod is deregistered by the cleanup controller
    // ==========================================================================

    #[tokio::test]
    async fn absent_check_converges_once_instance_disappears() {
        let queries = Arc::new(AtomicU32::new(0));
        let q = queries.clone();
        let mut dir = MockServiceDirectory::new();
        dir.expect_service_instances().returning(move |s, _| {
            // Still registered for the first two queries
            if q.fetch_add(1, Ordering::SeqCst) < 2 {
                Ok(instances(s, &["static-client-6d8b9c-x2x9z"]))
            } else {
                Ok(instances(s, &["static-client-6d8b9c-k7p4q"]))
            }
        });

        let probe = RegistrationProbe::new(dir);
        let pod = "static-client-6d8b9c-x2x9z";

        match probe.check_absent("static-client", "ns2", pod).await {
            ProbeResult::RetryableFailure(msg) => assert!(msg.contains("still registered")),
            other => panic!("expected RetryableFailure, got {other:?}"),
        }

        let checker = ConvergenceChecker::new("pod deregistered");
        let budget = RetryBudget::new(5, Duration::from_millis(1)).unwrap();
        checker
            .assert(&budget, || probe.check_absent("static-client", "ns2", pod))
            .await
            .unwrap();
        assert_eq!(queries.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn absent_query_error_is_fatal() {
        let mut dir = MockServiceDirectory::new();
        dir.expect_service_instances()
            .returning(|s, ns| Err(Error::directory(s, ns, "connection refused")));
        let probe = RegistrationProbe::new(dir);
        assert!(matches!(
            probe.check_absent("static-client", "ns2", "pod").await,
            ProbeResult::FatalFailure(_)
        ));
    }

    // ==========================================================================
    // Story: mirrored vs single-destination namespace placement
    // ==========================================================================

    fn directory_with(registered_in: &'static str) -> MockServiceDirectory {
        let mut dir = MockServiceDirectory::new();
        dir.expect_service_instances().returning(move |s, ns| {
            if ns == registered_in {
                Ok(instances(s, &["pod-a"]))
            } else {
                Ok(vec![])
            }
        });
        dir
    }

    #[tokio::test]
    async fn placement_mirrored() {
        let probe = RegistrationProbe::new(directory_with("ns2"));
        assert!(probe.check_placement("static-client", "ns2", "consul-dest").await.is_success());
        assert!(!probe.check_placement("static-client", "consul-dest", "ns2").await.is_success());
    }

    #[tokio::test]
    async fn placement_single_destination() {
        let probe = RegistrationProbe::new(directory_with("consul-dest"));
        assert!(probe.check_placement("static-client", "consul-dest", "ns2").await.is_success());
        assert!(!probe.check_placement("static-client", "ns2", "consul-dest").await.is_success());
    }

    #[tokio::test]
    async fn placement_in_both_namespaces_is_rejected() {
        let mut dir = MockServiceDirectory::new();
        dir.expect_service_instances()
            .returning(|s, _| Ok(instances(s, &["pod-a"])));
        let probe = RegistrationProbe::new(dir);
        match probe.check_placement("static-client", "ns2", "consul-dest").await {
            ProbeResult::RetryableFailure(msg) => assert!(msg.contains("both")),
            other => panic!("expected RetryableFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn snapshot_counts_and_finds() {
        let mut dir = MockServiceDirectory::new();
        dir.expect_service_instances()
            .returning(|s, _| Ok(instances(s, &["pod-a", "pod-b"])));

        let snapshot = RegistrationSnapshot::capture(&dir, &["static-server"], "ns1")
            .await
            .unwrap();
        assert_eq!(snapshot.namespace(), "ns1");
        assert_eq!(snapshot.count("static-server"), 2);
        assert_eq!(snapshot.count("never-queried"), 0);
        assert_eq!(
            snapshot.find_instance("static-server", "pod-b"),
            Some("pod-b-static-server")
        );
        assert_eq!(snapshot.find_instance("static-server", "pod-c"), None);
    }
}
