//! Connectivity probe
//!
//! Classifies one request through the mesh and maps the classification onto
//! a [`ProbeResult`]. Every connectivity state is expected to flap while
//! intentions, health checks and routes propagate, so this probe never
//! reports a fatal failure: a wrong state is always "not converged yet".

use meshcheck_common::{ConvergenceChecker, ProbeResult, Result, RetryBudget};
use meshcheck_common::retry::Clock;
use tracing::debug;

use crate::transport::{RequestError, Transport};

/// Text the static-server fixture returns
pub const EXPECTED_PAYLOAD_MARKER: &str = "hello world";

/// curl output when the upstream proxy has no healthy endpoint to forward to
pub const CONNECTION_RESET: &str = "curl: (56) Recv failure: Connection reset by peer";

/// curl output when the sidecar accepts and closes the connection (denied intention)
pub const EMPTY_REPLY: &str = "curl: (52) Empty reply from server";

/// Failure signatures that count as "connection failed, as expected".
///
/// Open-ended: scenarios add signatures as they discover new ways the mesh
/// refuses traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceptedFailures {
    patterns: Vec<String>,
}

impl AcceptedFailures {
    /// Empty set; nothing is accepted until patterns are added
    pub fn new() -> Self {
        Self::default()
    }

    /// Signatures of a connection the mesh refuses to carry, whether for
    /// lack of an allow intention or of a healthy upstream. The sidecar
    /// either resets the connection or closes it without a reply.
    pub fn mesh_refusal() -> Self {
        Self::new().with(CONNECTION_RESET).with(EMPTY_REPLY)
    }

    /// Add a pattern
    pub fn with(mut self, pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        if !self.patterns.contains(&pattern) {
            self.patterns.push(pattern);
        }
        self
    }

    /// First pattern contained in `message`
    pub fn matching(&self, message: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|p| message.contains(p.as_str()))
            .map(String::as_str)
    }

    /// Configured patterns
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Whether no patterns are configured
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for AcceptedFailures {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        iter.into_iter().fold(Self::new(), |acc, p| acc.with(p))
    }
}

/// What one request observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityOutcome {
    /// A response came back; carries the body
    Reached(String),
    /// The connection failed with an accepted signature
    RefusedMatchingPattern(String),
    /// The connection failed with output matching no accepted signature
    RefusedNonMatching(String),
    /// The request could not be issued
    TransportError(String),
}

/// Probes a target URL through a [`Transport`]
pub struct ConnectivityProbe<T> {
    transport: T,
    marker: String,
}

impl<T: Transport> ConnectivityProbe<T> {
    /// Probe expecting the static-server payload
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            marker: EXPECTED_PAYLOAD_MARKER.to_string(),
        }
    }

    /// Expect a different payload marker on success
    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = marker.into();
        self
    }

    /// Issue one request and classify it against `accepted`
    pub async fn observe(&self, target: &str, accepted: &AcceptedFailures) -> ConnectivityOutcome {
        match self.transport.get(target).await {
            Ok(body) => ConnectivityOutcome::Reached(body),
            Err(RequestError::Refused(output)) => match accepted.matching(&output) {
                Some(pattern) => ConnectivityOutcome::RefusedMatchingPattern(pattern.to_string()),
                None => ConnectivityOutcome::RefusedNonMatching(output),
            },
            Err(RequestError::Transport(msg)) => ConnectivityOutcome::TransportError(msg),
        }
    }

    /// One connectivity check.
    ///
    /// With `expect_success`, only a non-empty body containing the marker is
    /// a success. Without it, only a refusal matching `accepted` is.
    pub async fn check(
        &self,
        target: &str,
        expect_success: bool,
        accepted: &AcceptedFailures,
    ) -> ProbeResult {
        let outcome = self.observe(target, accepted).await;
        debug!(url = %target, expect_success, outcome = ?outcome, "Connectivity observed");

        match (expect_success, outcome) {
            (true, ConnectivityOutcome::Reached(body)) => {
                if !body.trim().is_empty() && body.contains(&self.marker) {
                    ProbeResult::Success
                } else {
                    ProbeResult::retry(format!(
                        "response from {target} did not contain {:?}: {:?}",
                        self.marker,
                        body.trim()
                    ))
                }
            }
            (true, ConnectivityOutcome::RefusedMatchingPattern(output))
            | (true, ConnectivityOutcome::RefusedNonMatching(output)) => ProbeResult::retry(
                format!("expected connection to {target} to succeed: {output}"),
            ),
            (false, ConnectivityOutcome::RefusedMatchingPattern(_)) => ProbeResult::Success,
            (false, ConnectivityOutcome::RefusedNonMatching(output)) => {
                ProbeResult::retry(format!(
                    "connection to {target} failed with unexpected output (accepted: {:?}): {output}",
                    accepted.patterns()
                ))
            }
            (false, ConnectivityOutcome::Reached(_)) => {
                ProbeResult::retry(format!("expected connection to {target} to fail, but it succeeded"))
            }
            (_, ConnectivityOutcome::TransportError(msg)) => {
                ProbeResult::retry(format!("could not reach {target}: {msg}"))
            }
        }
    }

    /// Wait until `target` serves the payload marker
    pub async fn assert_successful<C: Clock>(
        &self,
        checker: &ConvergenceChecker<C>,
        budget: &RetryBudget,
        target: &str,
    ) -> Result<()> {
        let none = AcceptedFailures::new();
        checker
            .assert(budget, || self.check(target, true, &none))
            .await
    }

    /// Wait until requests to `target` fail with one of the `accepted` signatures
    pub async fn assert_failing<C: Clock>(
        &self,
        checker: &ConvergenceChecker<C>,
        budget: &RetryBudget,
        target: &str,
        accepted: &AcceptedFailures,
    ) -> Result<()> {
        checker
            .assert(budget, || self.check(target, false, accepted))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use mockall::Sequence;
    use std::time::Duration;

    const TARGET: &str = "http://localhost:1234";

    fn probe_returning(
        result: std::result::Result<String, RequestError>,
    ) -> ConnectivityProbe<MockTransport> {
        let mut transport = MockTransport::new();
        transport
            .expect_get()
            .times(1)
            .returning(move |_| result.clone());
        ConnectivityProbe::new(transport)
    }

    #[test]
    fn accepted_failures_match_by_substring() {
        let accepted = AcceptedFailures::mesh_refusal();
        let output = "* Trying 127.0.0.1:1234...\ncurl: (56) Recv failure: Connection reset by peer\ncommand terminated with exit code 56";
        assert_eq!(accepted.matching(output), Some(CONNECTION_RESET));
        assert_eq!(accepted.matching("curl: (7) Failed to connect"), None);
    }

    #[test]
    fn mesh_refusal_covers_reset_and_empty_reply() {
        let accepted = AcceptedFailures::mesh_refusal();
        assert_eq!(accepted.patterns(), &[CONNECTION_RESET.to_string(), EMPTY_REPLY.to_string()]);
        assert_eq!(
            accepted.matching("* Connected\ncurl: (52) Empty reply from server"),
            Some(EMPTY_REPLY)
        );
    }

    #[test]
    fn accepted_failures_are_open_ended() {
        let accepted: AcceptedFailures = ["curl: (7) Failed to connect", EMPTY_REPLY, EMPTY_REPLY]
            .into_iter()
            .collect();
        assert_eq!(accepted.patterns().len(), 2);
        assert!(accepted.matching("curl: (7) Failed to connect to localhost").is_some());
        assert!(AcceptedFailures::new().is_empty());
    }

    // ==========================================================================
    // Story: expecting failure
    // ==========================================================================

    #[tokio::test]
    async fn expected_failure_matching_pattern_is_success() {
        let probe = probe_returning(Err(RequestError::Refused(EMPTY_REPLY.to_string())));
        let result = probe
            .check(TARGET, false, &AcceptedFailures::mesh_refusal())
            .await;
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn expected_failure_with_other_message_is_retryable() {
        let probe = probe_returning(Err(RequestError::Refused(
            "curl: (7) Failed to connect to localhost port 1234".to_string(),
        )));
        let result = probe
            .check(TARGET, false, &AcceptedFailures::mesh_refusal())
            .await;
        match result {
            ProbeResult::RetryableFailure(msg) => assert!(msg.contains("Failed to connect")),
            other => panic!("expected RetryableFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expected_failure_but_reached_is_retryable() {
        let probe = probe_returning(Ok("hello world".to_string()));
        let result = probe
            .check(TARGET, false, &AcceptedFailures::mesh_refusal())
            .await;
        match result {
            ProbeResult::RetryableFailure(msg) => assert!(msg.contains("but it succeeded")),
            other => panic!("expected RetryableFailure, got {other:?}"),
        }
    }

    // ==========================================================================
    // Story: expecting success
    // ==========================================================================

    #[tokio::test]
    async fn expected_success_with_marker_is_success() {
        let probe = probe_returning(Ok("\"hello world\"\n".to_string()));
        assert!(probe.check(TARGET, true, &AcceptedFailures::new()).await.is_success());
    }

    #[tokio::test]
    async fn expected_success_with_empty_body_is_retryable() {
        let probe = probe_returning(Ok("   \n".to_string()));
        let result = probe.check(TARGET, true, &AcceptedFailures::new()).await;
        assert!(matches!(result, ProbeResult::RetryableFailure(_)));
    }

    #[tokio::test]
    async fn expected_success_but_refused_is_retryable() {
        let probe = probe_returning(Err(RequestError::Refused(EMPTY_REPLY.to_string())));
        let result = probe.check(TARGET, true, &AcceptedFailures::new()).await;
        match result {
            ProbeResult::RetryableFailure(msg) => assert!(msg.contains("to succeed")),
            other => panic!("expected RetryableFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_errors_are_never_fatal() {
        for expect_success in [true, false] {
            let probe = probe_returning(Err(RequestError::Transport(
                "error: unable to upgrade connection: container not found".to_string(),
            )));
            let result = probe
                .check(TARGET, expect_success, &AcceptedFailures::mesh_refusal())
                .await;
            assert!(matches!(result, ProbeResult::RetryableFailure(_)));
        }
    }

    #[tokio::test]
    async fn custom_marker_is_honoured() {
        let probe = probe_returning(Ok("pong".to_string())).with_marker("pong");
        assert!(probe.check(TARGET, true, &AcceptedFailures::new()).await.is_success());
    }

    #[tokio::test]
    async fn observe_classifies_outcomes() {
        let accepted = AcceptedFailures::mesh_refusal();

        let probe = probe_returning(Err(RequestError::Refused(EMPTY_REPLY.to_string())));
        assert_eq!(
            probe.observe(TARGET, &accepted).await,
            ConnectivityOutcome::RefusedMatchingPattern(EMPTY_REPLY.to_string())
        );

        let probe = probe_returning(Err(RequestError::Refused("curl: (6)".to_string())));
        assert_eq!(
            probe.observe(TARGET, &accepted).await,
            ConnectivityOutcome::RefusedNonMatching("curl: (6)".to_string())
        );
    }

    // ==========================================================================
    // Story: health check propagation flips a working connection to failing
    // ==========================================================================

    #[tokio::test]
    async fn assert_failing_waits_for_the_mesh_to_converge() {
        let mut seq = Sequence::new();
        let mut transport = MockTransport::new();
        transport
            .expect_get()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Ok("hello world".to_string()));
        transport
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(RequestError::Refused(CONNECTION_RESET.to_string())));

        let probe = ConnectivityProbe::new(transport);
        let checker = ConvergenceChecker::new("static-server unhealthy");
        let budget = RetryBudget::new(5, Duration::from_millis(1)).unwrap();

        probe
            .assert_failing(&checker, &budget, TARGET, &AcceptedFailures::mesh_refusal())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn assert_successful_reports_last_diagnostic_when_exhausted() {
        let mut transport = MockTransport::new();
        transport
            .expect_get()
            .times(3)
            .returning(|_| Err(RequestError::Refused(EMPTY_REPLY.to_string())));

        let probe = ConnectivityProbe::new(transport);
        let checker = ConvergenceChecker::new("static-client -> static-server");
        let budget = RetryBudget::new(3, Duration::from_millis(1)).unwrap();

        let err = probe
            .assert_successful(&checker, &budget, TARGET)
            .await
            .unwrap_err();
        assert!(err.is_exhausted());
        assert!(err.to_string().contains("Empty reply from server"));
    }
}
