//! Run-all-and-report execution of scenario cases.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::{Error, Result};

/// Errors longer than this are cut in the summary
const SUMMARY_ERROR_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone)]
pub struct CaseResult {
    pub name: String,
    pub status: CaseStatus,
    pub duration: Duration,
    pub error: Option<String>,
}

pub struct TestHarness {
    suite: String,
    results: Mutex<Vec<CaseResult>>,
}

fn truncate(msg: &str) -> &str {
    match msg.char_indices().nth(SUMMARY_ERROR_LIMIT) {
        Some((idx, _)) => &msg[..idx],
        None => msg,
    }
}

impl TestHarness {
    pub fn new(suite: &str) -> Self {
        Self {
            suite: suite.to_string(),
            results: Mutex::new(Vec::new()),
        }
    }

    pub fn suite(&self) -> &str {
        &self.suite
    }

    fn push(&self, result: CaseResult) {
        // A poisoned lock only means another case panicked while recording
        let mut results = self.results.lock().unwrap_or_else(|e| e.into_inner());
        results.push(result);
    }

    /// Run one case, recording its outcome. Panics are caught and recorded
    /// as failures.
    pub async fn run<F, Fut>(&self, name: &str, f: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        info!(suite = %self.suite, case = name, "[Harness] Running");
        let start = Instant::now();
        let result = AssertUnwindSafe(f()).catch_unwind().await;
        let (status, error) = match result {
            Ok(Ok(())) => (CaseStatus::Passed, None),
            Ok(Err(e)) => (CaseStatus::Failed, Some(e.to_string())),
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                (CaseStatus::Failed, Some(format!("PANIC: {msg}")))
            }
        };
        if let Some(e) = &error {
            warn!(suite = %self.suite, case = name, error = %e, "[Harness] Case failed");
        }
        let passed = status == CaseStatus::Passed;
        self.push(CaseResult {
            name: name.to_string(),
            status,
            duration: start.elapsed(),
            error,
        });
        passed
    }

    /// Record a case that was not run
    pub fn skip(&self, name: &str, reason: &str) {
        info!(suite = %self.suite, case = name, "[Harness] Skipping: {reason}");
        self.push(CaseResult {
            name: name.to_string(),
            status: CaseStatus::Skipped,
            duration: Duration::ZERO,
            error: Some(reason.to_string()),
        });
    }

    pub fn results(&self) -> Vec<CaseResult> {
        self.results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Log the summary; fails if any case failed
    pub fn finish(&self) -> Result<()> {
        let results = self.results();
        let total_duration: Duration = results.iter().map(|r| r.duration).sum();
        let count = |s: CaseStatus| results.iter().filter(|r| r.status == s).count();
        let (passed, failed, skipped) = (
            count(CaseStatus::Passed),
            count(CaseStatus::Failed),
            count(CaseStatus::Skipped),
        );

        info!("========================================");
        info!("  {}", self.suite.to_uppercase());
        info!("========================================");
        for r in &results {
            let tag = match r.status {
                CaseStatus::Passed => "PASS",
                CaseStatus::Failed => "FAIL",
                CaseStatus::Skipped => "SKIP",
            };
            info!("  {tag}  {:40} {:.1}s", r.name, r.duration.as_secs_f64());
            if let Some(ref e) = r.error {
                info!("        -> {}", truncate(e));
            }
        }
        info!("----------------------------------------");
        info!(
            "  {passed} passed, {failed} failed, {skipped} skipped ({:.1}s total)",
            total_duration.as_secs_f64()
        );
        info!("========================================");

        if failed > 0 {
            let failures: Vec<_> = results
                .iter()
                .filter(|r| r.status == CaseStatus::Failed)
                .map(|r| r.name.as_str())
                .collect();
            Err(Error::SuiteFailed {
                suite: self.suite.clone(),
                failed,
                cases: failures.join(", "),
            })
        } else {
            Ok(())
        }
    }
}
