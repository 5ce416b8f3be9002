//! Bounded-retry convergence checking
//!
//! Assertions against an eventually-consistent system are written as probes:
//! zero-argument async closures returning a [`ProbeResult`]. The
//! [`ConvergenceChecker`] owns the retry timing and turns a sequence of probe
//! results into a terminal [`Outcome`]:
//!
//! ```text
//!            RetryableFailure
//!              ┌──────┐
//!              ▼      │
//!  start ──► Pending ─┴──► Converged   (Success)
//!              │
//!              ├─────────► Aborted     (FatalFailure)
//!              └─────────► Exhausted   (budget spent / cancelled / deadline)
//! ```
//!
//! A probe must only read. `RetryableFailure` means "not there yet";
//! `FatalFailure` means retrying cannot help (bad credentials, malformed
//! query) and stops the loop on the spot.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::retry::{Clock, TokioClock};
use crate::{Error, Result};

/// Attempts and spacing for one convergence check.
///
/// Wall-clock ceiling is roughly `max_attempts * interval`; time spent inside
/// the probe comes on top.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    max_attempts: u32,
    interval: Duration,
}

impl RetryBudget {
    /// Default attempts for catalog registration checks
    pub const REGISTRATION_ATTEMPTS: u32 = 60;
    /// Default spacing for catalog registration checks
    pub const REGISTRATION_INTERVAL: Duration = Duration::from_millis(500);
    /// Default attempts for connectivity checks through the mesh
    pub const CONNECTIVITY_ATTEMPTS: u32 = 60;
    /// Default spacing for connectivity checks through the mesh
    pub const CONNECTIVITY_INTERVAL: Duration = Duration::from_secs(2);

    /// Create a budget. `max_attempts` must be at least 1.
    pub fn new(max_attempts: u32, interval: Duration) -> Result<Self> {
        if max_attempts == 0 {
            return Err(Error::validation("retry budget needs at least 1 attempt"));
        }
        Ok(Self {
            max_attempts,
            interval,
        })
    }

    /// A single probe, no sleeping: "assert immediately"
    pub fn immediate() -> Self {
        Self {
            max_attempts: 1,
            interval: Duration::ZERO,
        }
    }

    /// Budget for waiting on catalog registration/deregistration
    pub fn registration() -> Self {
        Self {
            max_attempts: Self::REGISTRATION_ATTEMPTS,
            interval: Self::REGISTRATION_INTERVAL,
        }
    }

    /// Budget for waiting on mesh routing/authorization to settle
    pub fn connectivity() -> Self {
        Self {
            max_attempts: Self::CONNECTIVITY_ATTEMPTS,
            interval: Self::CONNECTIVITY_INTERVAL,
        }
    }

    /// Maximum number of probe invocations
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Sleep between attempts
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Soft upper bound on wall-clock time, excluding probe execution
    pub fn ceiling(&self) -> Duration {
        self.interval.saturating_mul(self.max_attempts)
    }
}

/// What a single probe invocation observed
#[derive(Debug)]
pub enum ProbeResult {
    /// Desired state reached
    Success,
    /// Not converged yet; the diagnostic explains the mismatch
    RetryableFailure(String),
    /// Retrying cannot fix this
    FatalFailure(Error),
}

impl ProbeResult {
    /// Shorthand for a retryable failure
    pub fn retry(diagnostic: impl Into<String>) -> Self {
        Self::RetryableFailure(diagnostic.into())
    }

    /// Whether this result ends the loop positively
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Terminal result of a convergence check
#[derive(Debug)]
pub enum Outcome {
    /// The probe succeeded
    Converged {
        /// Probe invocations made, including the successful one
        attempts: u32,
    },
    /// Budget, deadline or cancellation ended the loop first
    ExhaustedRetries {
        /// Probe invocations made
        attempts: u32,
        /// Diagnostic of the last retryable failure
        last_diagnostic: String,
    },
    /// The probe reported a fatal failure
    Fatal {
        /// Probe invocations made, including the fatal one
        attempts: u32,
        /// The error reported by the probe
        error: Error,
    },
}

impl Outcome {
    /// Probe invocations made
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Converged { attempts }
            | Self::ExhaustedRetries { attempts, .. }
            | Self::Fatal { attempts, .. } => *attempts,
        }
    }

    /// Whether the check converged
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged { .. })
    }

    /// Convert into a `Result`, naming what was waited for on exhaustion.
    ///
    /// Fatal errors come back verbatim.
    pub fn into_result(self, description: &str) -> Result<()> {
        match self {
            Self::Converged { .. } => Ok(()),
            Self::ExhaustedRetries {
                attempts,
                last_diagnostic,
            } => Err(Error::ExhaustedRetries {
                description: description.to_string(),
                attempts,
                last_diagnostic,
            }),
            Self::Fatal { error, .. } => Err(error),
        }
    }
}

const NOT_STARTED: &str = "cancelled before the first attempt";

/// Drives a probe until it converges, fails fatally, or runs out of budget.
///
/// One checker can be reused for many checks; it holds no per-check state.
pub struct ConvergenceChecker<C = TokioClock> {
    description: String,
    clock: C,
    cancel: Option<CancellationToken>,
    deadline: Option<Instant>,
}

impl ConvergenceChecker<TokioClock> {
    /// Create a checker on the tokio clock
    pub fn new(description: impl Into<String>) -> Self {
        Self::with_clock(description, TokioClock)
    }
}

impl<C: Clock> ConvergenceChecker<C> {
    /// Create a checker on a custom clock
    pub fn with_clock(description: impl Into<String>, clock: C) -> Self {
        Self {
            description: description.into(),
            clock,
            cancel: None,
            deadline: None,
        }
    }

    /// Stop starting new attempts once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Stop starting new attempts once `deadline` has passed
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// What this checker waits for, used in logs and errors
    pub fn description(&self) -> &str {
        &self.description
    }

    fn interrupted(&self) -> bool {
        let cancelled = self.cancel.as_ref().is_some_and(|t| t.is_cancelled());
        let expired = self.deadline.is_some_and(|d| self.clock.now() >= d);
        cancelled || expired
    }

    async fn pause(&self, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        match &self.cancel {
            Some(token) => {
                tokio::select! {
                    _ = self.clock.sleep(interval) => {}
                    _ = token.cancelled() => {}
                }
            }
            None => self.clock.sleep(interval).await,
        }
    }

    /// Run `probe` under `budget`.
    ///
    /// Makes at most `budget.max_attempts()` probe calls with one sleep
    /// between consecutive calls and none after the last.
    pub async fn run<F, Fut>(&self, budget: &RetryBudget, mut probe: F) -> Outcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProbeResult>,
    {
        let mut attempts = 0u32;
        let mut last_diagnostic = NOT_STARTED.to_string();

        loop {
            if self.interrupted() {
                warn!(
                    check = %self.description,
                    attempts = attempts,
                    "Convergence check interrupted before next attempt"
                );
                return Outcome::ExhaustedRetries {
                    attempts,
                    last_diagnostic,
                };
            }

            attempts += 1;
            match probe().await {
                ProbeResult::Success => {
                    debug!(check = %self.description, attempts = attempts, "Converged");
                    return Outcome::Converged { attempts };
                }
                ProbeResult::FatalFailure(error) => {
                    error!(
                        check = %self.description,
                        attempt = attempts,
                        error = %error,
                        "Probe failed fatally, not retrying"
                    );
                    return Outcome::Fatal { attempts, error };
                }
                ProbeResult::RetryableFailure(diagnostic) => {
                    last_diagnostic = diagnostic;
                    if attempts >= budget.max_attempts() {
                        warn!(
                            check = %self.description,
                            attempts = attempts,
                            last = %last_diagnostic,
                            "Retry budget exhausted"
                        );
                        return Outcome::ExhaustedRetries {
                            attempts,
                            last_diagnostic,
                        };
                    }
                    debug!(
                        check = %self.description,
                        attempt = attempts,
                        of = budget.max_attempts(),
                        diagnostic = %last_diagnostic,
                        "Not converged yet, retrying"
                    );
                    self.pause(budget.interval()).await;
                }
            }
        }
    }

    /// Run `probe` and convert the outcome with [`Outcome::into_result`]
    pub async fn assert<F, Fut>(&self, budget: &RetryBudget, probe: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProbeResult>,
    {
        self.run(budget, probe).await.into_result(&self.description)
    }
}
