//! Common types for meshcheck: convergence checking, errors, and plumbing

#![deny(missing_docs)]

pub mod command;
pub mod converge;
pub mod error;
pub mod retry;
pub mod telemetry;

pub use converge::{ConvergenceChecker, Outcome, ProbeResult, RetryBudget};
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Service name of the test server workload
pub const STATIC_SERVER_NAME: &str = "static-server";

/// Service name of the test client workload
pub const STATIC_CLIENT_NAME: &str = "static-client";

/// Kubernetes namespace the static server is deployed into
pub const STATIC_SERVER_NAMESPACE: &str = "ns1";

/// Kubernetes namespace the static client is deployed into
pub const STATIC_CLIENT_NAMESPACE: &str = "ns2";

/// Suffix the injector appends to a service name for its sidecar registration
pub const SIDECAR_PROXY_SUFFIX: &str = "-sidecar-proxy";

/// Name of the sidecar proxy registration for `service`
pub fn sidecar_proxy_name(service: &str) -> String {
    format!("{service}{SIDECAR_PROXY_SUFFIX}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_proxy_name_appends_suffix() {
        assert_eq!(
            sidecar_proxy_name(STATIC_CLIENT_NAME),
            "static-client-sidecar-proxy"
        );
    }
}
