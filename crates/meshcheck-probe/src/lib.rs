//! Probes for service mesh acceptance checks
//!
//! Each probe performs one observation and classifies it as a
//! [`ProbeResult`](meshcheck_common::ProbeResult); a
//! [`ConvergenceChecker`](meshcheck_common::ConvergenceChecker) decides
//! whether to look again.

#![deny(missing_docs)]

pub mod connectivity;
pub mod consul;
pub mod registration;
pub mod transport;

pub use connectivity::{AcceptedFailures, ConnectivityOutcome, ConnectivityProbe};
pub use consul::{ConsulClient, ConsulConfig, Intention, IntentionAction};
pub use registration::{RegistrationProbe, RegistrationSnapshot, ServiceDirectory, ServiceInstance};
pub use transport::{ExecCurlTransport, HttpTransport, RequestError, Transport};
