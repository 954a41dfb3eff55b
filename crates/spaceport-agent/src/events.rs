//! Event types and their payload schemas

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use spaceport_common::crd::{
    ProjectResources, ProjectSpec, ProjectUser, DEFAULT_KUBERNETES_VERSION,
};

/// A project was created
pub const PROJECT_CREATED: &str = "projects.created";
/// A project's settings changed
pub const PROJECT_UPDATED: &str = "projects.updated";
/// A project was paused
pub const PROJECT_PAUSED: &str = "projects.paused";
/// A project was resumed
pub const PROJECT_RESUMED: &str = "projects.resumed";
/// A project was deleted
pub const PROJECT_DELETED: &str = "projects.deleted";
/// An add-on was published
pub const ADDON_CREATED: &str = "addons.created";
/// An add-on was republished
pub const ADDON_UPDATED: &str = "addons.updated";
/// An add-on was withdrawn
pub const ADDON_DELETED: &str = "addons.delete";

/// All project event types
pub const PROJECT_EVENTS: &[&str] = &[
    PROJECT_CREATED,
    PROJECT_UPDATED,
    PROJECT_PAUSED,
    PROJECT_RESUMED,
    PROJECT_DELETED,
];

/// All add-on event types
pub const ADDON_EVENTS: &[&str] = &[ADDON_CREATED, ADDON_UPDATED, ADDON_DELETED];

/// User entry in a project payload
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserPayload {
    /// User email
    pub email: String,
    /// Cluster role to bind
    #[serde(default, rename = "clusterRole", alias = "cluster_role")]
    pub cluster_role: Option<String>,
}

/// Payload of `projects.*` events
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProjectPayload {
    /// Backend project id
    pub id: i64,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Slug (resource name)
    pub slug: String,
    /// Users granted access
    #[serde(default)]
    pub users: Vec<UserPayload>,
    /// CPU cores
    #[serde(default)]
    pub cpu: u32,
    /// Memory in MiB
    #[serde(default)]
    pub memory: u32,
    /// Disk in GiB
    #[serde(default)]
    pub disk: u32,
    /// Kubernetes version
    #[serde(default)]
    pub kubernetes_version: Option<String>,
}

impl ProjectPayload {
    /// Desired spec for a new project
    pub fn to_spec(&self) -> ProjectSpec {
        ProjectSpec {
            slug: self.slug.clone(),
            id: self.id,
            paused: false,
            kubernetes_version: self
                .kubernetes_version
                .clone()
                .unwrap_or_else(|| DEFAULT_KUBERNETES_VERSION.to_string()),
            resources: ProjectResources {
                cpu: self.cpu,
                memory: self.memory,
                disk: self.disk,
            },
            ingress_host: None,
            users: self
                .users
                .iter()
                .map(|u| ProjectUser {
                    email: u.email.clone(),
                    cluster_role: u.cluster_role.clone(),
                })
                .collect(),
            addons: vec![],
        }
    }

    /// Apply this payload to an existing spec.
    ///
    /// Fields the payload doesn't carry (paused, add-ons, ingress host) are
    /// kept, as is the Kubernetes version when the payload omits it.
    pub fn merge_into(&self, existing: &ProjectSpec) -> ProjectSpec {
        let mut spec = self.to_spec();
        spec.paused = existing.paused;
        spec.addons = existing.addons.clone();
        spec.ingress_host = existing.ingress_host.clone();
        if self.kubernetes_version.is_none() {
            spec.kubernetes_version = existing.kubernetes_version.clone();
        }
        spec
    }
}

/// Minimal project reference (pause, resume, delete)
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ProjectRef {
    /// Slug (resource name)
    pub slug: String,
}

/// Payload of `addons.created` / `addons.updated`
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct AddonPayload {
    /// Backend add-on id
    pub id: i64,
    /// Configuration name
    pub name: String,
    /// OCI repository of the package
    pub oci_registry: String,
    /// Package version tag
    pub oci_version: String,
    /// Package pull policy
    #[serde(default)]
    pub pull_policy: Option<String>,
    /// Revision activation policy
    #[serde(default)]
    pub activation_policy: Option<String>,
}

/// Pull policy used when the payload doesn't name one
pub const DEFAULT_PULL_POLICY: &str = "Always";
/// Activation policy used when the payload doesn't name one
pub const DEFAULT_ACTIVATION_POLICY: &str = "Automatic";
/// Package revisions retained
pub const REVISION_HISTORY_LIMIT: i64 = 5;

impl AddonPayload {
    /// OCI package reference `registry:version`
    pub fn package(&self) -> String {
        format!("{}:{}", self.oci_registry, self.oci_version)
    }

    /// Desired `spec` of the Configuration package
    pub fn configuration_spec(&self) -> serde_json::Value {
        serde_json::json!({
            "package": self.package(),
            "packagePullPolicy": self
                .pull_policy
                .as_deref()
                .filter(|p| !p.is_empty())
                .unwrap_or(DEFAULT_PULL_POLICY),
            "revisionActivationPolicy": self
                .activation_policy
                .as_deref()
                .filter(|p| !p.is_empty())
                .unwrap_or(DEFAULT_ACTIVATION_POLICY),
            "revisionHistoryLimit": REVISION_HISTORY_LIMIT,
        })
    }

    /// Labels applied to the Configuration
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                spaceport_common::MANAGED_BY_LABEL_KEY.to_string(),
                spaceport_common::MANAGED_BY_VALUE.to_string(),
            ),
            ("spaceport.dev/addon-id".to_string(), self.id.to_string()),
        ])
    }
}

/// Minimal add-on reference (delete)
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct AddonRef {
    /// Configuration name
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use spaceport_common::crd::ProjectAddon;

    fn acme() -> ProjectPayload {
        serde_json::from_value(serde_json::json!({
            "id": 7,
            "name": "Acme",
            "slug": "acme",
            "users": [{"email": "ops@acme.io", "clusterRole": "view"}],
            "cpu": 2,
            "memory": 4096,
            "disk": 20
        }))
        .unwrap()
    }

    #[test]
    fn project_payload_maps_to_spec() {
        let spec = acme().to_spec();
        assert_eq!(spec.slug, "acme");
        assert_eq!(spec.id, 7);
        assert!(!spec.paused);
        assert_eq!(spec.kubernetes_version, DEFAULT_KUBERNETES_VERSION);
        assert_eq!(spec.resources.memory, 4096);
        assert_eq!(spec.users[0].role(), "view");
    }

    #[test]
    fn merge_preserves_fields_the_payload_lacks() {
        let mut existing = acme().to_spec();
        existing.paused = true;
        existing.kubernetes_version = "1.27.4".to_string();
        existing.addons = vec![ProjectAddon {
            addon_name: "pg".to_string(),
            installation_name: None,
            subscription_id: Some(3),
            group: "db.example.io".to_string(),
            version: "v1".to_string(),
            resource: "postgresinstances".to_string(),
            kind: None,
            parameters: Default::default(),
        }];

        let mut update = acme();
        update.cpu = 4;
        let merged = update.merge_into(&existing);
        assert!(merged.paused);
        assert_eq!(merged.addons.len(), 1);
        assert_eq!(merged.kubernetes_version, "1.27.4");
        assert_eq!(merged.resources.cpu, 4);
    }

    #[test]
    fn project_payload_requires_slug() {
        let r: Result<ProjectPayload, _> = serde_json::from_value(serde_json::json!({"id": 7}));
        assert!(r.is_err());
    }

    #[test]
    fn addon_payload_defaults() {
        let addon: AddonPayload = serde_json::from_value(serde_json::json!({
            "id": 3,
            "name": "postgres",
            "oci_registry": "ghcr.io/acme/postgres",
            "oci_version": "v1.2.0"
        }))
        .unwrap();
        let spec = addon.configuration_spec();
        assert_eq!(spec["package"], "ghcr.io/acme/postgres:v1.2.0");
        assert_eq!(spec["packagePullPolicy"], "Always");
        assert_eq!(spec["revisionActivationPolicy"], "Automatic");
        assert_eq!(spec["revisionHistoryLimit"], 5);
    }

    #[test]
    fn addon_payload_honours_policies() {
        let addon: AddonPayload = serde_json::from_value(serde_json::json!({
            "id": 3,
            "name": "postgres",
            "oci_registry": "ghcr.io/acme/postgres",
            "oci_version": "v1.2.0",
            "pull_policy": "IfNotPresent",
            "activation_policy": "Manual"
        }))
        .unwrap();
        let spec = addon.configuration_spec();
        assert_eq!(spec["packagePullPolicy"], "IfNotPresent");
        assert_eq!(spec["revisionActivationPolicy"], "Manual");
    }
}
