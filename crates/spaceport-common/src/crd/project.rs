//! Project Custom Resource Definition
//!
//! A Project is one tenant: an isolated virtual cluster provisioned inside
//! the host cluster, plus the add-ons requested for it. Projects are
//! cluster-scoped and named after their slug, which is also the name of the
//! tenant namespace.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{set_condition, Condition};

/// Kubernetes version used when a project does not request one
pub const DEFAULT_KUBERNETES_VERSION: &str = "1.28.3";

/// Cluster role bound to project users that don't specify one
pub const DEFAULT_CLUSTER_ROLE: &str = "cluster-admin";

/// Prefix of the access-credential secret generated for each virtual cluster
pub const CREDENTIAL_SECRET_PREFIX: &str = "vc-";

/// Specification for a Project
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "spaceport.dev",
    version = "v1alpha1",
    kind = "Project",
    plural = "projects",
    shortname = "proj",
    status = "ProjectStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Paused","type":"boolean","jsonPath":".spec.paused"}"#,
    printcolumn = r#"{"name":"K8s","type":"string","jsonPath":".spec.kubernetesVersion"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSpec {
    /// Unique, immutable identifier used for the namespace and all derived names
    pub slug: String,

    /// Backend identifier of the project
    pub id: i64,

    /// Scale the virtual cluster to zero when true
    #[serde(default)]
    pub paused: bool,

    /// Kubernetes version of the virtual cluster
    #[serde(default = "default_kubernetes_version")]
    pub kubernetes_version: String,

    /// Resource quotas for the virtual cluster control plane
    #[serde(default)]
    pub resources: ProjectResources,

    /// Ingress host override for the virtual cluster API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_host: Option<String>,

    /// Users granted access to the virtual cluster
    #[serde(default)]
    pub users: Vec<ProjectUser>,

    /// Requested add-on installations
    #[serde(default)]
    pub addons: Vec<ProjectAddon>,
}

fn default_kubernetes_version() -> String {
    DEFAULT_KUBERNETES_VERSION.to_string()
}

/// Resource quotas: cpu cores, memory in MiB, disk in GiB
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectResources {
    /// CPU cores
    #[serde(default)]
    pub cpu: u32,
    /// Memory in MiB
    #[serde(default)]
    pub memory: u32,
    /// Disk in GiB
    #[serde(default)]
    pub disk: u32,
}

/// A user-to-role binding inside the virtual cluster
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectUser {
    /// OIDC email of the user
    pub email: String,
    /// ClusterRole to bind (defaults to cluster-admin)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_role: Option<String>,
}

impl ProjectUser {
    /// The effective cluster role for this user
    pub fn role(&self) -> &str {
        self.cluster_role
            .as_deref()
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_CLUSTER_ROLE)
    }
}

/// A requested add-on installation
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectAddon {
    /// Catalog name of the add-on
    pub addon_name: String,

    /// Name of this installation (defaults to the add-on name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation_name: Option<String>,

    /// Backend subscription that requested the add-on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<i64>,

    /// API group of the add-on resource
    pub group: String,

    /// API version of the add-on resource
    pub version: String,

    /// Plural resource name (e.g., "postgresinstances")
    pub resource: String,

    /// Kind of the add-on resource (defaults to `resource`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Install parameters merged into the resource spec
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl ProjectAddon {
    /// Name of the installed resource
    pub fn installation_name(&self) -> &str {
        self.installation_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.addon_name)
    }

    /// Key of this installation in [`ProjectStatus::addons`]
    pub fn status_key(&self) -> String {
        format!("{}/{}", self.addon_name, self.installation_name())
    }

    /// Kind used in the resource's `kind` field
    pub fn kind(&self) -> &str {
        self.kind
            .as_deref()
            .filter(|k| !k.is_empty())
            .unwrap_or(&self.resource)
    }

    /// `group/version` string for the resource
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl ProjectSpec {
    /// Name of the virtual-cluster release, namespace and workload
    pub fn release_name(&self) -> &str {
        &self.slug
    }

    /// Name of the generated access-credential secret
    pub fn credential_secret_name(&self) -> String {
        format!("{}{}", CREDENTIAL_SECRET_PREFIX, self.slug)
    }

    /// Desired replica count of the tenant control plane
    pub fn desired_replicas(&self) -> i32 {
        if self.paused {
            0
        } else {
            1
        }
    }

    /// Validate the project specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        if !is_dns_label(&self.slug) {
            return Err(crate::Error::validation_for_field(
                &self.slug,
                "spec.slug",
                format!(
                    "slug '{}' must be a lowercase RFC 1123 label of at most 57 characters",
                    self.slug
                ),
            ));
        }

        let mut keys = std::collections::BTreeSet::new();
        for addon in &self.addons {
            if addon.addon_name.is_empty() || addon.version.is_empty() || addon.resource.is_empty()
            {
                return Err(crate::Error::validation_for_field(
                    &self.slug,
                    "spec.addons",
                    "addonName, version and resource are required",
                ));
            }
            if !keys.insert(addon.status_key()) {
                return Err(crate::Error::validation_for_field(
                    &self.slug,
                    "spec.addons",
                    format!("duplicate installation {}", addon.status_key()),
                ));
            }
        }
        Ok(())
    }
}

/// RFC 1123 label, short enough that `vc-<slug>` style names stay valid
fn is_dns_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 57
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

/// Project lifecycle phase
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProjectPhase {
    /// Spec observed, virtual cluster not yet ready
    #[default]
    Pending,
    /// Virtual cluster credentials are available
    Provisioned,
    /// The spec cannot be converged without a change
    Failed,
}

impl std::fmt::Display for ProjectPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Provisioned => write!(f, "provisioned"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Status of a single add-on installation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct AddonStatus {
    /// Conditions reported for the installation
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Observed state of a Project
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatus {
    /// Lifecycle phase
    #[serde(default)]
    pub phase: ProjectPhase,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// CA certificate of the virtual cluster API server (PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_certificate: Option<String>,

    /// Project-level conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Per-installation status keyed by `addonName/installationName`
    #[serde(default)]
    pub addons: BTreeMap<String, AddonStatus>,

    /// Generation of the spec last reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl ProjectStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: ProjectPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the phase and return self for chaining
    pub fn phase(mut self, phase: ProjectPhase) -> Self {
        self.phase = phase;
        self
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Add a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        set_condition(&mut self.conditions, condition);
        self
    }

    /// Status of the installation with the given key
    pub fn addon_status(&self, key: &str) -> Option<&AddonStatus> {
        self.addons.get(key)
    }

    /// Merge a condition into an installation's status, creating it if needed.
    ///
    /// Returns true if anything changed.
    pub fn set_addon_condition(&mut self, key: &str, condition: Condition) -> bool {
        let entry = self.addons.entry(key.to_string()).or_default();
        set_condition(&mut entry.conditions, condition)
    }

    /// Remove an installation's status, returning true if it was present
    pub fn remove_addon_status(&mut self, key: &str) -> bool {
        self.addons.remove(key).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::types::{is_condition_true, ConditionStatus};
    use kube::CustomResourceExt;

    fn sample_spec() -> ProjectSpec {
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

    fn addon(name: &str, installation: Option<&str>) -> ProjectAddon {
        ProjectAddon {
            addon_name: name.to_string(),
            installation_name: installation.map(str::to_string),
            subscription_id: None,
            group: "db.example.io".to_string(),
            version: "v1".to_string(),
            resource: "PostgresInstance".to_string(),
            kind: None,
            parameters: BTreeMap::new(),
        }
    }

    mod spec {
        use super::*;

        #[test]
        fn derived_names_follow_slug() {
            let spec = sample_spec();
            assert_eq!(spec.release_name(), "acme");
            assert_eq!(spec.credential_secret_name(), "vc-acme");
        }

        #[test]
        fn desired_replicas_tracks_paused() {
            let mut spec = sample_spec();
            assert_eq!(spec.desired_replicas(), 1);
            spec.paused = true;
            assert_eq!(spec.desired_replicas(), 0);
        }

        #[test]
        fn defaults_apply_when_fields_are_missing() {
            let spec: ProjectSpec =
                serde_json::from_value(serde_json::json!({"slug": "acme", "id": 1})).unwrap();
            assert!(!spec.paused);
            assert_eq!(spec.kubernetes_version, DEFAULT_KUBERNETES_VERSION);
            assert!(spec.addons.is_empty());
        }

        #[test]
        fn slug_must_be_a_dns_label() {
            assert!(sample_spec().validate().is_ok());
            for bad in ["", "Acme", "acme_corp", "-acme", "acme-", &"a".repeat(58)] {
                let mut spec = sample_spec();
                spec.slug = bad.to_string();
                assert!(spec.validate().is_err(), "slug {bad:?} should be rejected");
            }
        }

        #[test]
        fn duplicate_installations_are_rejected() {
            let mut spec = sample_spec();
            spec.addons = vec![addon("pg", None), addon("pg", Some("pg"))];
            assert!(spec.validate().is_err());

            spec.addons = vec![addon("pg", None), addon("pg", Some("pg-2"))];
            assert!(spec.validate().is_ok());
        }

        #[test]
        fn user_role_defaults_to_cluster_admin() {
            let user = ProjectUser {
                email: "a@example.com".to_string(),
                cluster_role: None,
            };
            assert_eq!(user.role(), "cluster-admin");
            let viewer = ProjectUser {
                email: "b@example.com".to_string(),
                cluster_role: Some("view".to_string()),
            };
            assert_eq!(viewer.role(), "view");
        }
    }

    mod addons {
        use super::*;

        #[test]
        fn installation_name_defaults_to_addon_name() {
            assert_eq!(addon("pg", None).installation_name(), "pg");
            assert_eq!(addon("pg", Some("")).installation_name(), "pg");
            assert_eq!(addon("pg", Some("main")).installation_name(), "main");
        }

        #[test]
        fn status_key_joins_addon_and_installation() {
            assert_eq!(addon("pg", None).status_key(), "pg/pg");
            assert_eq!(addon("pg", Some("main")).status_key(), "pg/main");
        }

        #[test]
        fn kind_defaults_to_resource() {
            let mut a = addon("pg", None);
            assert_eq!(a.kind(), "PostgresInstance");
            a.kind = Some("Postgres".to_string());
            assert_eq!(a.kind(), "Postgres");
            assert_eq!(a.api_version(), "db.example.io/v1");
        }
    }

    mod status {
        use super::*;

        #[test]
        fn phase_serializes_lowercase() {
            let status = ProjectStatus::with_phase(ProjectPhase::Provisioned);
            let json = serde_json::to_value(&status).unwrap();
            assert_eq!(json["phase"], "provisioned");
        }

        #[test]
        fn addon_conditions_merge_and_remove() {
            let mut status = ProjectStatus::default();
            let ready = || {
                Condition::new(
                    "Ready",
                    ConditionStatus::True,
                    "Installed",
                    "Addon has been installed",
                )
            };
            assert!(status.set_addon_condition("pg/pg", ready()));
            assert!(!status.set_addon_condition("pg/pg", ready()));
            assert!(is_condition_true(
                &status.addon_status("pg/pg").unwrap().conditions,
                "Ready"
            ));

            assert!(status.remove_addon_status("pg/pg"));
            assert!(!status.remove_addon_status("pg/pg"));
            assert!(status.addon_status("pg/pg").is_none());
        }
    }

    #[test]
    fn crd_is_cluster_scoped() {
        let crd = Project::crd();
        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(crd.spec.group, "spaceport.dev");
        let yaml = serde_yaml::to_string(&crd).unwrap();
        assert!(yaml.contains("kubernetesVersion"));
    }
}
