//! Values payloads for the virtual-cluster and agent releases
//!
//! Both payloads are rendered from templates embedded at compile time and
//! parsed back into JSON so they can be compared against the values of a
//! deployed release.

use std::collections::BTreeMap;

use minijinja::{context, Environment};
use serde::Serialize;
use spaceport_common::crd::{HostClusterSpec, HostConfig, ProjectSpec};
use spaceport_common::Error;

/// Virtual-cluster values template loaded at compile time
const VCLUSTER_TEMPLATE: &str = include_str!("../templates/vcluster-values.yaml");

/// Agent values template loaded at compile time
const AGENT_TEMPLATE: &str = include_str!("../templates/agent-values.yaml");

/// Username claim passed to tenant API servers when the host doesn't set one
const DEFAULT_USERNAME_CLAIM: &str = "email";

/// k3s images by Kubernetes version
const K3S_IMAGES: &[(&str, &str)] = &[
    ("1.28.3", "rancher/k3s:v1.28.3-k3s2"),
    ("1.28.2", "rancher/k3s:v1.28.2-k3s1"),
    ("1.28.1", "rancher/k3s:v1.28.1-k3s1"),
    ("1.28.0", "rancher/k3s:v1.28.0-rc1-k3s1"),
    ("1.27.7", "rancher/k3s:v1.27.7-k3s2"),
    ("1.27.6", "rancher/k3s:v1.27.6-k3s1"),
    ("1.27.5", "rancher/k3s:v1.27.5-k3s1"),
    ("1.27.4", "rancher/k3s:v1.27.4-k3s1"),
    ("1.27.3", "rancher/k3s:v1.27.3-k3s1"),
    ("1.27.2", "rancher/k3s:v1.27.2-k3s1"),
    ("1.27.1", "rancher/k3s:v1.27.1-k3s1"),
    ("1.26.10", "rancher/k3s:v1.26.10-k3s2"),
    ("1.26.9", "rancher/k3s:v1.26.9-k3s1"),
    ("1.26.8", "rancher/k3s:v1.26.8-k3s1"),
    ("1.26.7", "rancher/k3s:v1.26.7-k3s1"),
    ("1.26.6", "rancher/k3s:v1.26.6-k3s1"),
    ("1.26.5", "rancher/k3s:v1.26.5-k3s1"),
    ("1.26.4", "rancher/k3s:v1.26.4-k3s1"),
    ("1.26.3", "rancher/k3s:v1.26.3-k3s1"),
    ("1.26.2", "rancher/k3s:v1.26.2-k3s1"),
    ("1.26.1", "rancher/k3s:v1.26.1-k3s1"),
    ("1.26.0", "rancher/k3s:v1.26.0-k3s2"),
];

/// Map a Kubernetes version (with or without a leading `v`) to its k3s image
pub fn k3s_image(version: &str) -> Option<&'static str> {
    let version = version.trim_start_matches('v');
    K3S_IMAGES
        .iter()
        .find(|(v, _)| *v == version)
        .map(|(_, image)| *image)
}

/// Controller-level defaults, overridden by the HostCluster's own config
#[derive(Clone, Debug, Default)]
pub struct ValuesDefaults {
    /// Ingress class for tenant API ingresses
    pub ingress_class: Option<String>,
    /// Domain under which `api.<slug>.<domain>` is published
    pub ingress_domain: Option<String>,
    /// OIDC issuer URL
    pub oidc_issuer_url: Option<String>,
    /// OIDC client ID
    pub oidc_client_id: Option<String>,
}

#[derive(Serialize)]
struct OidcArgs {
    issuer_url: String,
    client_id: String,
    username_claim: String,
    username_prefix: Option<String>,
    group_prefix: Option<String>,
}

#[derive(Serialize, Debug, PartialEq)]
struct RoleBinding {
    name: String,
    role: String,
    users: Vec<String>,
}

/// One ClusterRoleBinding per distinct role, users in spec order
fn role_bindings(spec: &ProjectSpec) -> Vec<RoleBinding> {
    let mut by_role: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for user in &spec.users {
        by_role
            .entry(user.role())
            .or_default()
            .push(user.email.clone());
    }
    by_role
        .into_iter()
        .map(|(role, users)| RoleBinding {
            name: format!("spaceport-{role}"),
            role: role.to_string(),
            users,
        })
        .collect()
}

fn oidc_args(host: &HostConfig, defaults: &ValuesDefaults) -> Option<OidcArgs> {
    let issuer_url = host
        .oidc
        .issuer_url
        .clone()
        .or_else(|| defaults.oidc_issuer_url.clone())?;
    let client_id = host
        .oidc
        .client_id
        .clone()
        .or_else(|| defaults.oidc_client_id.clone())?;
    Some(OidcArgs {
        issuer_url,
        client_id,
        username_claim: host
            .oidc
            .username_claim
            .clone()
            .unwrap_or_else(|| DEFAULT_USERNAME_CLAIM.to_string()),
        username_prefix: host.oidc.username_prefix.clone(),
        group_prefix: host.oidc.group_prefix.clone(),
    })
}

/// Host name of the tenant API ingress
pub fn ingress_host(spec: &ProjectSpec, host: &HostConfig, defaults: &ValuesDefaults) -> String {
    if let Some(h) = spec.ingress_host.as_deref().filter(|h| !h.is_empty()) {
        return h.to_string();
    }
    let domain = host
        .dns_zone
        .as_deref()
        .or(defaults.ingress_domain.as_deref())
        .unwrap_or("local");
    format!("api.{}.{}", spec.slug, domain)
}

fn render(name: &str, template: &str, ctx: minijinja::Value) -> Result<serde_json::Value, Error> {
    let mut env = Environment::new();
    env.add_template(name, template)
        .map_err(|e| Error::template(name, e.to_string()))?;
    let rendered = env
        .get_template(name)
        .and_then(|t| t.render(ctx))
        .map_err(|e| Error::template(name, e.to_string()))?;
    serde_yaml::from_str(&rendered).map_err(|e| Error::template(name, e.to_string()))
}

/// Render the values of a tenant's virtual-cluster release.
///
/// Fails with a validation error when the requested Kubernetes version has
/// no known k3s image.
pub fn vcluster_values(
    spec: &ProjectSpec,
    host: &HostClusterSpec,
    defaults: &ValuesDefaults,
) -> Result<serde_json::Value, Error> {
    let image = k3s_image(&spec.kubernetes_version).ok_or_else(|| {
        Error::validation_for_field(
            &spec.slug,
            "spec.kubernetesVersion",
            format!("unsupported kubernetes version {}", spec.kubernetes_version),
        )
    })?;

    let cpu = match spec.resources.cpu {
        0 => host.defaults.resources.cpu,
        n => n,
    };
    let memory = match spec.resources.memory {
        0 => host.defaults.resources.memory,
        n => n,
    };

    let ingress_class = host
        .config
        .ingress_class
        .clone()
        .or_else(|| defaults.ingress_class.clone());

    render(
        "vcluster-values",
        VCLUSTER_TEMPLATE,
        context! {
            project_id => spec.id,
            slug => &spec.slug,
            image => image,
            oidc => oidc_args(&host.config, defaults),
            cpu => cpu,
            memory => memory,
            disk => spec.resources.disk,
            ingress_class => ingress_class,
            ingress_host => ingress_host(spec, &host.config, defaults),
            bindings => role_bindings(spec),
        },
    )
}

/// Render the values of the agent release
pub fn agent_values(host: &HostClusterSpec) -> Result<serde_json::Value, Error> {
    render(
        "agent-values",
        AGENT_TEMPLATE,
        context! {
            agent => context! {
                repository => host.agent.repository(),
                pull_policy => host.agent.pull_policy(),
                tag => host.agent.tag(),
            },
            backend => &host.backend,
            cluster_id => host.cluster_id,
            credentials_secret => &host.credentials_ref.name,
        },
    )
}

/// Convert a rendered values object into the map carried by a chart reference
pub fn into_values_map(values: serde_json::Value) -> BTreeMap<String, serde_json::Value> {
    match values {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        _ => BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spaceport_common::crd::{ProjectResources, ProjectUser, DEFAULT_KUBERNETES_VERSION};

    fn acme() -> ProjectSpec {
        ProjectSpec {
            slug: "acme".to_string(),
            id: 7,
            paused: false,
            kubernetes_version: DEFAULT_KUBERNETES_VERSION.to_string(),
            resources: ProjectResources {
                cpu: 2,
                memory: 4096,
                disk: 20,
            },
            ingress_host: None,
            users: vec![],
            addons: vec![],
        }
    }

    fn host() -> HostClusterSpec {
        serde_json::from_value(serde_json::json!({
            "clusterId": 42,
            "credentialsRef": {"name": "spaceport-credentials"},
            "agent": {"chartVersion": "0.4.1"},
            "backend": {
                "tokenUrl": "https://auth.example.io/oauth/token",
                "apiUrl": "https://api.example.io",
                "streamUrl": "wss://api.example.io/cable",
                "channel": "ClusterChannel"
            },
            "config": {"dnsZone": "spaces.example.io"}
        }))
        .unwrap()
    }

    #[test]
    fn k3s_image_lookup() {
        assert_eq!(k3s_image("1.28.3"), Some("rancher/k3s:v1.28.3-k3s2"));
        assert_eq!(k3s_image("v1.26.0"), Some("rancher/k3s:v1.26.0-k3s2"));
        assert_eq!(k3s_image("1.25.0"), None);
    }

    #[test]
    fn acme_values_carry_quotas() {
        let values = vcluster_values(&acme(), &host(), &ValuesDefaults::default()).unwrap();
        assert_eq!(values["vcluster"]["resources"]["limits"]["cpu"], 2);
        assert_eq!(values["vcluster"]["resources"]["limits"]["memory"], "4096Mi");
        assert_eq!(values["storage"]["size"], "20Gi");
        assert_eq!(values["vcluster"]["image"], "rancher/k3s:v1.28.3-k3s2");
        assert_eq!(values["globalAnnotations"]["spaceport.dev/project-id"], "7");
        assert_eq!(values["ingress"]["host"], "api.acme.spaces.example.io");
        assert!(values["vcluster"].get("extraArgs").is_none());
    }

    #[test]
    fn ingress_host_override_wins() {
        let mut spec = acme();
        spec.ingress_host = Some("k8s.acme.io".to_string());
        let values = vcluster_values(&spec, &host(), &ValuesDefaults::default()).unwrap();
        assert_eq!(values["ingress"]["host"], "k8s.acme.io");
    }

    #[test]
    fn oidc_args_from_controller_defaults() {
        let defaults = ValuesDefaults {
            oidc_issuer_url: Some("https://id.example.io".to_string()),
            oidc_client_id: Some("spaceport".to_string()),
            ingress_class: Some("nginx".to_string()),
            ..Default::default()
        };
        let values = vcluster_values(&acme(), &host(), &defaults).unwrap();
        let args = values["vcluster"]["extraArgs"].as_array().unwrap();
        assert!(args
            .iter()
            .any(|a| a == "--kube-apiserver-arg=--oidc-issuer-url=https://id.example.io"));
        assert!(args
            .iter()
            .any(|a| a == "--kube-apiserver-arg=--oidc-username-claim=email"));
        assert_eq!(values["ingress"]["ingressClassName"], "nginx");
    }

    #[test]
    fn users_are_bound_to_their_roles() {
        let mut spec = acme();
        spec.users = vec![
            ProjectUser {
                email: "ops@acme.io".to_string(),
                cluster_role: None,
            },
            ProjectUser {
                email: "dev@acme.io".to_string(),
                cluster_role: Some("view".to_string()),
            },
        ];
        let values = vcluster_values(&spec, &host(), &ValuesDefaults::default()).unwrap();
        let manifests = values["init"]["manifests"].as_str().unwrap();
        let docs: Vec<serde_json::Value> = serde_yaml::Deserializer::from_str(manifests)
            .map(|d| serde::Deserialize::deserialize(d).unwrap())
            .collect();
        assert_eq!(docs.len(), 2);
        let admin = docs
            .iter()
            .find(|d| d["roleRef"]["name"] == "cluster-admin")
            .unwrap();
        assert_eq!(admin["subjects"][0]["name"], "ops@acme.io");
        let view = docs.iter().find(|d| d["roleRef"]["name"] == "view").unwrap();
        assert_eq!(view["subjects"][0]["name"], "dev@acme.io");
    }

    #[test]
    fn zero_resources_fall_back_to_host_defaults() {
        let mut spec = acme();
        spec.resources.cpu = 0;
        spec.resources.memory = 0;
        let mut h = host();
        h.defaults.resources.cpu = 1;
        h.defaults.resources.memory = 2048;
        let values = vcluster_values(&spec, &h, &ValuesDefaults::default()).unwrap();
        assert_eq!(values["vcluster"]["resources"]["limits"]["cpu"], 1);
        assert_eq!(values["vcluster"]["resources"]["limits"]["memory"], "2048Mi");
    }

    #[test]
    fn unsupported_version_is_validation_error() {
        let mut spec = acme();
        spec.kubernetes_version = "1.19.0".to_string();
        let err = vcluster_values(&spec, &host(), &ValuesDefaults::default()).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn agent_values_shape() {
        let values = agent_values(&host()).unwrap();
        assert_eq!(values["image"]["repository"], "ghcr.io/spaceport-dev/agent");
        assert_eq!(values["image"]["tag"], "0.4.1");
        assert_eq!(values["agent"]["clusterId"], 42);
        assert_eq!(values["agent"]["channel"], "ClusterChannel");
        assert_eq!(values["credentialsSecret"]["name"], "spaceport-credentials");
    }
}
