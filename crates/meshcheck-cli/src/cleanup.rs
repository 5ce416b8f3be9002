//! Scoped cleanup
//!
//! Scenario steps register release hooks as they create resources. After the
//! body finishes the hooks run newest first. When the body failed and the
//! suite keeps resources on failure, nothing is released.

use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{info, warn};

use crate::Result;

type Hook = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Stack of cleanup hooks for one scenario case
pub struct CleanupStack {
    scope: String,
    keep_on_failure: bool,
    hooks: Vec<(String, Hook)>,
}

impl CleanupStack {
    pub fn new(scope: impl Into<String>, keep_on_failure: bool) -> Self {
        Self {
            scope: scope.into(),
            keep_on_failure,
            hooks: Vec::new(),
        }
    }

    /// Register a hook; hooks run in reverse registration order
    pub fn push<F, Fut>(&mut self, label: impl Into<String>, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.hooks
            .push((label.into(), Box::new(move || hook().boxed())));
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Release everything, unless `failed` and resources are kept on failure.
    ///
    /// Every hook runs even if an earlier one fails; the labels of failed
    /// hooks are returned.
    pub async fn release(self, failed: bool) -> Vec<String> {
        if failed && self.keep_on_failure {
            warn!(
                scope = %self.scope,
                kept = self.hooks.len(),
                "[Cleanup] Scenario failed, keeping resources for debugging"
            );
            return Vec::new();
        }

        let mut failures = Vec::new();
        for (label, hook) in self.hooks.into_iter().rev() {
            match hook().await {
                Ok(()) => info!(scope = %self.scope, "[Cleanup] {label}"),
                Err(e) => {
                    warn!(scope = %self.scope, error = %e, "[Cleanup] {label} failed");
                    failures.push(label);
                }
            }
        }
        failures
    }
}
