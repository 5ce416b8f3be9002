//! Minimal Consul HTTP API client
//!
//! Covers the two endpoints the checks need: catalog lookups and intention
//! creation. Everything else goes through helm and kubectl.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use meshcheck_common::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::registration::{ServiceDirectory, ServiceInstance};

/// Header carrying the ACL token
const TOKEN_HEADER: &str = "X-Consul-Token";

/// How to reach the Consul API
#[derive(Debug, Clone)]
pub struct ConsulConfig {
    /// Base address, e.g. `https://127.0.0.1:43121`
    pub address: String,
    /// ACL token (secure installs only)
    pub token: Option<String>,
    /// Accept the cluster's self-signed server certificate
    pub accept_invalid_certs: bool,
    /// Per-request timeout
    pub timeout: Duration,
}

impl ConsulConfig {
    /// Plain HTTP, no ACLs
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            token: None,
            accept_invalid_certs: false,
            timeout: Duration::from_secs(10),
        }
    }

    /// Config for a local port-forward; `secure` switches to HTTPS with the
    /// self-signed CA accepted
    pub fn local(port: u16, secure: bool) -> Self {
        let scheme = if secure { "https" } else { "http" };
        Self {
            accept_invalid_certs: secure,
            ..Self::new(format!("{scheme}://127.0.0.1:{port}"))
        }
    }

    /// Attach an ACL token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// Allow or deny
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentionAction {
    /// Permit the connection
    Allow,
    /// Refuse the connection
    Deny,
}

/// Service-to-service authorization rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intention {
    /// Source service
    #[serde(rename = "SourceName")]
    pub source_name: String,
    /// Source namespace
    #[serde(rename = "SourceNS")]
    pub source_namespace: String,
    /// Destination service
    #[serde(rename = "DestinationName")]
    pub destination_name: String,
    /// Destination namespace
    #[serde(rename = "DestinationNS")]
    pub destination_namespace: String,
    /// Allow or deny
    #[serde(rename = "Action")]
    pub action: IntentionAction,
}

impl Intention {
    /// Allow `source` in `source_ns` to reach `destination` in `destination_ns`
    pub fn allow(
        source: impl Into<String>,
        source_ns: impl Into<String>,
        destination: impl Into<String>,
        destination_ns: impl Into<String>,
    ) -> Self {
        Self {
            source_name: source.into(),
            source_namespace: source_ns.into(),
            destination_name: destination.into(),
            destination_namespace: destination_ns.into(),
            action: IntentionAction::Allow,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreatedIntention {
    #[serde(rename = "ID")]
    id: String,
}

/// Consul API client
#[derive(Debug, Clone)]
pub struct ConsulClient {
    http: reqwest::Client,
    base: Url,
    config: ConsulConfig,
}

impl ConsulClient {
    /// Build a client from `config`
    pub fn new(config: ConsulConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| Error::http("consul client", e.to_string()))?;
        let base = Url::parse(&config.address)
            .map_err(|e| Error::http("consul client", format!("{}: {e}", config.address)))?;
        if base.cannot_be_a_base() {
            return Err(Error::http(
                "consul client",
                format!("{} is not a base URL", config.address),
            ));
        }
        Ok(Self { http, base, config })
    }

    /// Base address requests go to
    pub fn address(&self) -> &str {
        &self.config.address
    }

    /// API URL for `segments`, each percent-encoded as one path segment
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.token {
            Some(token) => request.header(TOKEN_HEADER, token),
            None => request,
        }
    }

    /// Create an intention, returning its id
    pub async fn create_intention(&self, intention: &Intention) -> Result<String> {
        let context = format!(
            "create intention {}/{} -> {}/{}",
            intention.source_namespace,
            intention.source_name,
            intention.destination_namespace,
            intention.destination_name
        );
        let response = self
            .authorize(self.http.post(self.endpoint(&["v1", "connect", "intentions"])))
            .json(intention)
            .send()
            .await
            .map_err(|e| Error::http(&context, e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::http(&context, e.to_string()))?;
        if !status.is_success() {
            return Err(Error::http(&context, format!("{status}: {body}")));
        }

        let created: CreatedIntention =
            serde_json::from_str(&body).map_err(|e| Error::http(&context, e.to_string()))?;
        info!(id = %created.id, "[Consul] {context}");
        Ok(created.id)
    }
}

#[async_trait]
impl ServiceDirectory for ConsulClient {
    async fn service_instances(
        &self,
        service: &str,
        namespace: &str,
    ) -> Result<Vec<ServiceInstance>> {
        let request = self
            .http
            .get(self.endpoint(&["v1", "catalog", "service", service]))
            .query(&[("ns", namespace)]);
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| Error::directory(service, namespace, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::directory(service, namespace, format!("{status}: {body}")));
        }

        let instances: Vec<ServiceInstance> = response
            .json()
            .await
            .map_err(|e| Error::directory(service, namespace, e.to_string()))?;
        debug!(
            service = service,
            namespace = namespace,
            count = instances.len(),
            "[Consul] catalog lookup"
        );
        Ok(instances)
    }
}
