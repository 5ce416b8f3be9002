//! Ways of issuing the single request a connectivity probe makes
//!
//! In a mesh the interesting request usually originates *inside* a pod (the
//! client's upstream listener on localhost), so the main transport execs curl
//! in the client deployment. A direct HTTP transport covers endpoints that are
//! reachable from the test host.

use std::time::Duration;

use async_trait::async_trait;
use meshcheck_common::command::Kubectl;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

/// Why a request did not produce a response
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// The request went out and the connection failed; carries the client's
    /// error output (e.g. `curl: (52) Empty reply from server`)
    #[error("connection failed: {0}")]
    Refused(String),
    /// The request could not be issued at all (exec failed, bad URL, ...)
    #[error("could not issue request: {0}")]
    Transport(String),
}

/// Issues one GET request and returns the response body
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// GET `url`, returning the body of a successful response
    async fn get(&self, url: &str) -> Result<String, RequestError>;
}

/// Marker curl prints when the request itself failed (as opposed to kubectl)
const CURL_ERROR_PREFIX: &str = "curl: (";

/// Runs `curl -vvvsSf <url>` inside a deployment via `kubectl exec`
#[derive(Debug, Clone)]
pub struct ExecCurlTransport {
    kubectl: Kubectl,
    deployment: String,
    container: Option<String>,
}

impl ExecCurlTransport {
    /// Exec into `deploy/<deployment>` using `kubectl` (already namespaced)
    pub fn new(kubectl: Kubectl, deployment: impl Into<String>) -> Self {
        Self {
            kubectl,
            deployment: deployment.into(),
            container: None,
        }
    }

    /// Exec into a specific container instead of the default one
    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    fn exec_args(&self, target: &str) -> Vec<String> {
        let mut args = vec!["exec".to_string(), format!("deploy/{}", self.deployment)];
        if let Some(c) = &self.container {
            args.push("-c".to_string());
            args.push(c.clone());
        }
        args.extend(
            ["--", "curl", "-vvvsSf", target]
                .iter()
                .map(|s| s.to_string()),
        );
        args
    }
}

#[async_trait]
impl Transport for ExecCurlTransport {
    async fn get(&self, url: &str) -> Result<String, RequestError> {
        let args = self.exec_args(url);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self
            .kubectl
            .output(&args)
            .await
            .map_err(|e| RequestError::Transport(e.to_string()))?;

        if output.success {
            return Ok(output.stdout);
        }
        let combined = output.combined();
        if combined.contains(CURL_ERROR_PREFIX) {
            Err(RequestError::Refused(combined))
        } else {
            Err(RequestError::Transport(combined))
        }
    }
}

/// Plain HTTP GET from the test host
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport with a per-request timeout
    pub fn new(timeout: Duration) -> Result<Self, RequestError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| RequestError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

/// Flatten an error and its sources into one line
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut msg = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        msg.push_str(": ");
        msg.push_str(&inner.to_string());
        source = inner.source();
    }
    msg
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str) -> Result<String, RequestError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_builder() {
                RequestError::Transport(error_chain(&e))
            } else {
                RequestError::Refused(error_chain(&e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            // Same wording curl -f uses so failure patterns work for both transports
            return Err(RequestError::Refused(format!(
                "The requested URL returned error: {}",
                status.as_u16()
            )));
        }

        response
            .text()
            .await
            .map_err(|e| RequestError::Refused(error_chain(&e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshcheck_common::command::KubectlOptions;

    #[test]
    fn exec_args_target_the_deployment() {
        let kubectl = Kubectl::new(KubectlOptions::default()).namespaced("ns2");
        let transport = ExecCurlTransport::new(kubectl, "static-client");
        assert_eq!(
            transport.exec_args("http://localhost:1234"),
            vec![
                "exec",
                "deploy/static-client",
                "--",
                "curl",
                "-vvvsSf",
                "http://localhost:1234"
            ]
        );
    }

    #[test]
    fn exec_args_include_container_when_set() {
        let transport = ExecCurlTransport::new(Kubectl::new(KubectlOptions::default()), "static-client")
            .with_container("static-client");
        let args = transport.exec_args("http://localhost:1234");
        assert_eq!(&args[2..4], &["-c".to_string(), "static-client".to_string()]);
    }

    #[test]
    fn request_error_display() {
        let refused = RequestError::Refused("curl: (52) Empty reply from server".to_string());
        assert_eq!(
            refused.to_string(),
            "connection failed: curl: (52) Empty reply from server"
        );
        let transport = RequestError::Transport("pod not found".to_string());
        assert!(transport.to_string().starts_with("could not issue request"));
    }

    #[test]
    fn request_error_is_a_std_error() {
        let err: Box<dyn std::error::Error + Send + Sync> =
            Box::new(RequestError::Refused("curl: (56) Recv failure".to_string()));
        assert!(err.source().is_none());
        assert_eq!(err.to_string(), "connection failed: curl: (56) Recv failure");
    }

    #[tokio::test]
    async fn http_transport_refused_on_closed_port() {
        // Port 9 (discard) is essentially never listening on test hosts
        let transport = HttpTransport::new(Duration::from_secs(2)).unwrap();
        let err = transport.get("http://127.0.0.1:9/").await.unwrap_err();
        assert!(matches!(err, RequestError::Refused(_)));
    }

    #[tokio::test]
    async fn http_transport_rejects_malformed_url() {
        let transport = HttpTransport::new(Duration::from_secs(2)).unwrap();
        let err = transport.get("not a url").await.unwrap_err();
        assert!(matches!(err, RequestError::Transport(_)));
    }
}
