//! Cluster tests for meshcheck
//!
//! Every test here needs a Kubernetes cluster reachable through the usual
//! kubeconfig, `helm` and `kubectl` on `PATH`, and an enterprise Consul image
//! (namespaces are an enterprise feature).
//!
//! # Running
//!
//! ```bash
//! MESHCHECK_ENABLE_ENTERPRISE=true \
//! MESHCHECK_HELM_SET=global.image=hashicorp/consul-enterprise:1.9.0-ent \
//! MESHCHECK_FIXTURES_DIR=$PWD/fixtures/cases \
//! cargo test -p meshcheck-cli --features cluster-e2e --test e2e -- --ignored --nocapture
//! ```
//!
//! Probes against an existing installation (e.g. after a run with
//! `MESHCHECK_NO_CLEANUP_ON_FAILURE=true`):
//!
//! ```bash
//! MESHCHECK_CONSUL_ADDR=http://127.0.0.1:8500 \
//! cargo test -p meshcheck-cli --features cluster-e2e --test e2e probes -- --ignored --nocapture
//! ```

#![cfg(feature = "cluster-e2e")]

mod helpers;
mod probes;
mod suites;
