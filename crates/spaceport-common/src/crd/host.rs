//! HostCluster CRD
//!
//! The singleton HostCluster (always named `default`) describes the shared
//! host: the agent release that connects it to the backend, host-level
//! add-ons, chart repositories and identity-provider defaults applied to
//! every tenant.
//!
//! Example:
//! ```yaml
//! apiVersion: spaceport.dev/v1alpha1
//! kind: HostCluster
//! metadata:
//!   name: default
//! spec:
//!   clusterId: 42
//!   credentialsRef:
//!     name: spaceport-credentials
//!   agent:
//!     chartVersion: 0.4.1
//!   backend:
//!     tokenUrl: https://auth.spaceport.dev/oauth/token
//!     apiUrl: https://api.spaceport.dev
//!     streamUrl: wss://api.spaceport.dev/cable
//!     channel: ClusterChannel
//! ```

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{is_condition_true, set_condition, Condition, CONDITION_READY};

/// Image repository of the agent when the spec doesn't override it
pub const DEFAULT_AGENT_REPOSITORY: &str = "ghcr.io/spaceport-dev/agent";

/// Image pull policy of the agent when the spec doesn't override it
pub const DEFAULT_AGENT_PULL_POLICY: &str = "IfNotPresent";

/// Specification for the host cluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "spaceport.dev",
    version = "v1alpha1",
    kind = "HostCluster",
    plural = "hostclusters",
    status = "HostClusterStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Cluster","type":"integer","jsonPath":".spec.clusterId"}"#,
    printcolumn = r#"{"name":"Agent","type":"string","jsonPath":".spec.agent.chartVersion"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HostClusterSpec {
    /// Backend identifier of this host cluster
    pub cluster_id: i64,

    /// Secret holding the OAuth client credentials of the agent
    pub credentials_ref: CredentialsRef,

    /// Agent release settings
    pub agent: AgentSpec,

    /// Backend endpoints the agent connects to
    pub backend: BackendSpec,

    /// Chart repositories to register before installing anything
    #[serde(default)]
    pub repos: Vec<RepoEntry>,

    /// Host-level add-ons installed once per host
    #[serde(default)]
    pub addons: Vec<HelmRef>,

    /// Defaults applied to every tenant
    #[serde(default)]
    pub config: HostConfig,

    /// Default tenant resources
    #[serde(default)]
    pub defaults: HostDefaults,
}

/// Reference to a secret in the spaceport system namespace
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct CredentialsRef {
    /// Secret name
    pub name: String,
}

/// Agent image and chart settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    /// Image repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    /// Image pull policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_policy: Option<String>,
    /// Image tag (defaults to the chart version)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Version of the agent chart
    pub chart_version: String,
}

impl AgentSpec {
    /// Effective image repository
    pub fn repository(&self) -> &str {
        self.repository.as_deref().unwrap_or(DEFAULT_AGENT_REPOSITORY)
    }

    /// Effective pull policy
    pub fn pull_policy(&self) -> &str {
        self.pull_policy
            .as_deref()
            .unwrap_or(DEFAULT_AGENT_PULL_POLICY)
    }

    /// Effective image tag
    pub fn tag(&self) -> &str {
        self.tag.as_deref().unwrap_or(&self.chart_version)
    }
}

/// Backend endpoints
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackendSpec {
    /// OAuth token endpoint for the client-credential grant
    pub token_url: String,
    /// REST API base URL (pings, project status)
    pub api_url: String,
    /// Event stream URL
    pub stream_url: String,
    /// Event channel to subscribe to
    pub channel: String,
}

/// A chart repository
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct RepoEntry {
    /// Local repository name
    pub name: String,
    /// Repository URL
    pub url: String,
    /// Basic-auth username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Basic-auth password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// A chart release reference: what to install, where, and with which values
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct HelmRef {
    /// Repository name or OCI URL prefix
    #[serde(default)]
    pub repo: String,
    /// Chart name
    pub chart: String,
    /// Chart version (latest when empty)
    #[serde(default)]
    pub version: String,
    /// Release namespace
    pub namespace: String,
    /// Release name
    pub name: String,
    /// Chart values
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, serde_json::Value>,
}

impl HelmRef {
    /// Chart reference as passed to the installer (`repo/chart` or an OCI URL)
    pub fn chart_ref(&self) -> String {
        if self.repo.is_empty() {
            self.chart.clone()
        } else if self.repo.starts_with("oci://") {
            format!("{}/{}", self.repo.trim_end_matches('/'), self.chart)
        } else {
            format!("{}/{}", self.repo, self.chart)
        }
    }
}

/// Host-wide tenant configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    /// DNS zone under which tenant API hosts are published
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_zone: Option<String>,
    /// Identity provider settings for tenant API servers
    #[serde(default)]
    pub oidc: OidcConfig,
    /// Ingress class for tenant API ingresses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class: Option<String>,
}

/// OIDC settings passed to tenant API servers
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OidcConfig {
    /// Issuer URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_url: Option<String>,
    /// Client ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Claim used as the username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_claim: Option<String>,
    /// Prefix applied to usernames
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_prefix: Option<String>,
    /// Prefix applied to groups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_prefix: Option<String>,
}

/// Tenant defaults
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct HostDefaults {
    /// Default resources for tenants that don't request any
    #[serde(default)]
    pub resources: DefaultResources,
}

/// Default cpu cores and memory (MiB)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct DefaultResources {
    /// CPU cores
    #[serde(default)]
    pub cpu: u32,
    /// Memory in MiB
    #[serde(default)]
    pub memory: u32,
}

/// Observed state of the host cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct HostClusterStatus {
    /// Host conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HostClusterStatus {
    /// Add a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        set_condition(&mut self.conditions, condition);
        self
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }
}

impl HostCluster {
    /// Whether the agent and host add-ons have been installed
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| is_condition_true(&s.conditions, CONDITION_READY))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::types::ConditionStatus;
    use kube::CustomResourceExt;

    fn host(status: Option<HostClusterStatus>) -> HostCluster {
        let spec: HostClusterSpec = serde_json::from_value(serde_json::json!({
            "clusterId": 42,
            "credentialsRef": {"name": "creds"},
            "agent": {"chartVersion": "0.4.1"},
            "backend": {
                "tokenUrl": "https://auth.example.com/token",
                "apiUrl": "https://api.example.com",
                "streamUrl": "wss://api.example.com/cable",
                "channel": "ClusterChannel"
            }
        }))
        .unwrap();
        let mut host = HostCluster::new("default", spec);
        host.status = status;
        host
    }

    #[test]
    fn agent_defaults() {
        let h = host(None);
        assert_eq!(h.spec.agent.repository(), DEFAULT_AGENT_REPOSITORY);
        assert_eq!(h.spec.agent.pull_policy(), "IfNotPresent");
        assert_eq!(h.spec.agent.tag(), "0.4.1");
    }

    #[test]
    fn ready_requires_true_ready_condition() {
        assert!(!host(None).is_ready());

        let pending = HostClusterStatus::default().condition(Condition::new(
            CONDITION_READY,
            ConditionStatus::False,
            "Installing",
            "agent not installed",
        ));
        assert!(!host(Some(pending)).is_ready());

        let ready = HostClusterStatus::default().condition(Condition::new(
            CONDITION_READY,
            ConditionStatus::True,
            "Installed",
            "Chart 0.4.1 has been installed",
        ));
        assert!(host(Some(ready)).is_ready());
    }

    #[test]
    fn chart_ref_handles_repo_and_oci() {
        let mut r = HelmRef {
            repo: "loft-sh".to_string(),
            chart: "vcluster".to_string(),
            namespace: "acme".to_string(),
            name: "acme".to_string(),
            ..Default::default()
        };
        assert_eq!(r.chart_ref(), "loft-sh/vcluster");

        r.repo = "oci://ghcr.io/spaceport-dev/agent/helm/".to_string();
        r.chart = "agent".to_string();
        assert_eq!(r.chart_ref(), "oci://ghcr.io/spaceport-dev/agent/helm/agent");
    }

    #[test]
    fn crd_is_cluster_scoped() {
        let crd = HostCluster::crd();
        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(crd.spec.names.kind, "HostCluster");
    }
}
