//! Backend HTTP API client
//!
//! Two calls leave the cluster outside the event stream: the periodic
//! cluster ping and project status reports. Both authenticate with the
//! same bearer token as the stream.

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::error::StreamError;
use crate::token::TokenSource;

/// Cluster identifiers carried by each ping
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ClusterPing {
    /// Host cluster Kubernetes version
    pub version: String,
    /// Region the host cluster runs in
    pub region: String,
    /// Infrastructure provider
    pub provider: String,
    /// Identifier of this agent instance
    pub agent_identifier: String,
    /// Agent build version
    pub agent_version: String,
}

/// Body of `POST /api/v1/clusters/{id}/ping`
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PingRequest {
    /// Cluster identifiers
    pub cluster: ClusterPing,
}

/// Body of `PATCH /api/v1/projects/{id}`
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProjectStatusReport {
    /// Virtual-cluster CA, once provisioned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_certificate: Option<String>,
    /// Project phase (`pending`, `provisioned`, `failed`)
    pub status: String,
}

/// Calls made against the backend API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Report cluster liveness
    async fn ping(&self, cluster_id: i64, request: &PingRequest) -> Result<(), StreamError>;

    /// Report a project's provisioning status
    async fn update_project(
        &self,
        project_id: i64,
        report: &ProjectStatusReport,
    ) -> Result<(), StreamError>;
}

/// [`BackendClient`] over HTTPS with `reqwest`
pub struct HttpBackendClient {
    http: reqwest::Client,
    base: Url,
    tokens: Arc<dyn TokenSource>,
}

impl HttpBackendClient {
    /// Create a client for the API rooted at `base`
    pub fn new(
        http: reqwest::Client,
        base: &str,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self, StreamError> {
        let base = Url::parse(base)
            .map_err(|e| StreamError::Backend(format!("invalid api url {base}: {e}")))?;
        Ok(Self { http, base, tokens })
    }

    fn endpoint(&self, path: &str) -> Result<Url, StreamError> {
        self.base
            .join(path)
            .map_err(|e| StreamError::Backend(format!("invalid path {path}: {e}")))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<(), StreamError> {
        let token = self.tokens.token().await?;
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| StreamError::Backend(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StreamError::Backend(format!("{status}: {body}")));
        }
        Ok(())
    }
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn ping(&self, cluster_id: i64, request: &PingRequest) -> Result<(), StreamError> {
        let url = self.endpoint(&ping_path(cluster_id))?;
        debug!(%url, "pinging backend");
        self.send(self.http.post(url).json(request)).await
    }

    async fn update_project(
        &self,
        project_id: i64,
        report: &ProjectStatusReport,
    ) -> Result<(), StreamError> {
        let url = self.endpoint(&project_path(project_id))?;
        debug!(%url, status = %report.status, "reporting project status");
        self.send(self.http.patch(url).json(report)).await
    }
}

fn ping_path(cluster_id: i64) -> String {
    format!("/api/v1/clusters/{cluster_id}/ping")
}

fn project_path(project_id: i64) -> String {
    format!("/api/v1/projects/{project_id}")
}
