//! Shared setup for cluster tests

use std::time::Duration;

use meshcheck_cli::config::SuiteConfig;
use meshcheck_cli::scenarios::{run_suite, RunOptions, Suite};
use meshcheck_common::telemetry::init_test_logging;

/// Upper bound for a whole suite (4 cases, each installing Consul)
pub const SUITE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Config from `MESHCHECK_*`; panics with the parse error otherwise
pub fn suite_config() -> SuiteConfig {
    SuiteConfig::from_env().unwrap_or_else(|e| panic!("invalid MESHCHECK_* environment: {e}"))
}

/// Run `suite` with the environment's config, panicking on any failed case
pub async fn run_suite_from_env(suite: Suite) {
    init_test_logging();
    let config = suite_config();
    let options = RunOptions {
        case_filter: std::env::var("MESHCHECK_CASE").ok(),
        ..Default::default()
    };

    let result = tokio::time::timeout(SUITE_TIMEOUT, run_suite(suite, &config, &options))
        .await
        .unwrap_or_else(|_| panic!("{suite} timed out after {SUITE_TIMEOUT:?}"));
    if let Err(e) = result {
        panic!("{suite} failed: {e}");
    }
}
