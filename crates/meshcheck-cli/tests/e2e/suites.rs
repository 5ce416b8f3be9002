//! One test per scenario suite

use meshcheck_cli::scenarios::Suite;

use super::helpers::run_suite_from_env;

#[tokio::test]
#[ignore]
async fn connect_inject_namespaces() {
    run_suite_from_env(Suite::ConnectInject).await;
}

#[tokio::test]
#[ignore]
async fn cleanup_controller_deregisters_killed_pods() {
    run_suite_from_env(Suite::CleanupController).await;
}

#[tokio::test]
#[ignore]
async fn root_service_accounts() {
    run_suite_from_env(Suite::RootServiceAccounts).await;
}
