//! `meshcheck run`

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::config::{SuiteArgs, SuiteConfig};
use crate::scenarios::{run_suite, select_cases, RunOptions, Suite};
use crate::{Error, Result};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Suite to run (`meshcheck list` shows them), or `all`
    #[arg(long, default_value = "all")]
    pub suite: String,

    /// Only run cases whose name contains this
    #[arg(long = "case")]
    pub case_filter: Option<String>,

    #[command(flatten)]
    pub suite_args: SuiteArgs,
}

/// Suites selected by `--suite` that have at least one case matching the filter
fn selected_suites(suite: &str, filter: Option<&str>) -> Result<Vec<Suite>> {
    if suite != "all" {
        return Ok(vec![suite.parse()?]);
    }
    let suites: Vec<Suite> = Suite::ALL
        .into_iter()
        .filter(|s| !select_cases(*s, filter).is_empty())
        .collect();
    if suites.is_empty() {
        return Err(Error::validation(format!(
            "no case matches '{}'",
            filter.unwrap_or_default()
        )));
    }
    Ok(suites)
}

pub async fn run(args: RunArgs, cancel: CancellationToken) -> Result<()> {
    let config = SuiteConfig::try_from(args.suite_args)?;
    let suites = selected_suites(&args.suite, args.case_filter.as_deref())?;
    let options = RunOptions {
        case_filter: args.case_filter,
        cancel,
    };

    let mut first_failure = None;
    for suite in suites {
        if let Err(e) = run_suite(suite, &config, &options).await {
            error!(suite = %suite, error = %e, "[Run] Suite failed");
            first_failure.get_or_insert(e);
        }
    }
    match first_failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_selects_suites_with_matching_cases() {
        assert_eq!(selected_suites("all", None).unwrap().len(), 3);
        // Only the namespace-matrix suites have single destination cases
        assert_eq!(
            selected_suites("all", Some("single destination")).unwrap(),
            vec![Suite::ConnectInject, Suite::CleanupController]
        );
        assert!(selected_suites("all", Some("no such case")).is_err());
    }

    #[test]
    fn named_suite_is_parsed() {
        assert_eq!(
            selected_suites("cleanup-controller", None).unwrap(),
            vec![Suite::CleanupController]
        );
        assert!(selected_suites("bogus", None).is_err());
    }
}
