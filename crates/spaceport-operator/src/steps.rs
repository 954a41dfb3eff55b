//! Provisioning step library
//!
//! Pure functions computing the desired shape of every resource a Project
//! depends on. Nothing here talks to the API server.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{DynamicObject, ObjectMeta};
use kube::discovery::ApiResource;
use kube::ResourceExt;
use spaceport_common::crd::{HelmRef, Project, ProjectAddon};
use spaceport_common::kube_utils::owner_reference;
use spaceport_common::registry::{ResourceKind, ResourceRegistry, PROVIDER_CONFIG_KINDS};
use spaceport_common::{MANAGED_BY_LABEL_KEY, MANAGED_BY_VALUE, PROJECT_LABEL_KEY};

/// Chart repository of the virtual-cluster chart
pub const VCLUSTER_REPO_NAME: &str = "loft-sh";
/// URL of [`VCLUSTER_REPO_NAME`]
pub const VCLUSTER_REPO_URL: &str = "https://charts.loft.sh";
/// Virtual-cluster chart
pub const VCLUSTER_CHART: &str = "vcluster";

/// Key of the CA certificate in the access-credential secret
pub const CA_CERTIFICATE_KEY: &str = "certificate-authority";
/// Key of the kubeconfig in the access-credential secret
pub const KUBECONFIG_KEY: &str = "config";

/// Label the virtual cluster puts on the pods it manages
pub const VCLUSTER_MANAGED_BY_LABEL: &str = "vcluster.loft.sh/managed-by";

/// Label carrying the add-on name on installation objects
pub const ADDON_LABEL_KEY: &str = "spaceport.dev/addon";
/// Label carrying the backend subscription id on installation objects
pub const SUBSCRIPTION_LABEL_KEY: &str = "spaceport.dev/subscription-id";

fn project_labels(project: &Project) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL_KEY.to_string(), MANAGED_BY_VALUE.to_string()),
        (PROJECT_LABEL_KEY.to_string(), project.spec.slug.clone()),
    ])
}

fn owned_meta(project: &Project, name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(project_labels(project)),
        owner_references: owner_reference(project).map(|r| vec![r]),
        ..Default::default()
    }
}

/// Tenant namespace, owned by the Project so it is collected on delete
pub fn namespace(project: &Project) -> Namespace {
    Namespace {
        metadata: owned_meta(project, &project.spec.slug, None),
        ..Default::default()
    }
}

/// Virtual-cluster release carrying the rendered values
pub fn vcluster_release(
    project: &Project,
    values: BTreeMap<String, serde_json::Value>,
) -> HelmRef {
    HelmRef {
        repo: VCLUSTER_REPO_NAME.to_string(),
        chart: VCLUSTER_CHART.to_string(),
        version: String::new(),
        namespace: project.spec.slug.clone(),
        name: project.spec.release_name().to_string(),
        values,
    }
}

/// Label selector matching every pod of the tenant's virtual cluster
pub fn pod_selector(project: &Project) -> String {
    format!("{}={}", VCLUSTER_MANAGED_BY_LABEL, project.spec.slug)
}

/// Provider configurations pointing both Crossplane providers at the
/// tenant's access credential, in creation order
pub fn provider_configs(
    project: &Project,
    registry: &ResourceRegistry,
) -> Vec<(ApiResource, DynamicObject)> {
    PROVIDER_CONFIG_KINDS
        .iter()
        .map(|kind| provider_config(project, registry, *kind))
        .collect()
}

fn provider_config(
    project: &Project,
    registry: &ResourceRegistry,
    kind: ResourceKind,
) -> (ApiResource, DynamicObject) {
    let ar = registry.get(kind);
    let mut obj = DynamicObject::new(&project.spec.slug, &ar);
    obj.metadata = owned_meta(project, &project.spec.slug, None);
    obj.data = serde_json::json!({
        "spec": {
            "credentials": {
                "source": "Secret",
                "secretRef": {
                    "namespace": project.spec.slug,
                    "name": project.spec.credential_secret_name(),
                    "key": KUBECONFIG_KEY,
                }
            }
        }
    });
    (ar, obj)
}

/// Installation object for one requested add-on
pub fn addon_object(
    project: &Project,
    addon: &ProjectAddon,
    registry: &ResourceRegistry,
) -> (ApiResource, DynamicObject) {
    let ar = registry.addon(&addon.group, &addon.version, &addon.resource, addon.kind());
    let name = addon.installation_name();
    let mut obj = DynamicObject::new(name, &ar).within(&project.spec.slug);
    obj.metadata.owner_references = owner_reference(project).map(|r| vec![r]);

    let mut labels = project_labels(project);
    labels.insert(ADDON_LABEL_KEY.to_string(), addon.addon_name.clone());
    if let Some(id) = addon.subscription_id {
        labels.insert(SUBSCRIPTION_LABEL_KEY.to_string(), id.to_string());
    }
    obj.metadata.labels = Some(labels);

    let mut spec = serde_json::Map::new();
    for (k, v) in &addon.parameters {
        spec.insert(k.clone(), v.clone());
    }
    spec.insert(
        "providerConfigRef".to_string(),
        serde_json::json!({ "name": project.spec.slug }),
    );
    obj.data = serde_json::json!({ "spec": spec });
    (ar, obj)
}

/// Whether an observed object already matches the desired one.
///
/// Only `spec` and labels are compared; the server owns everything else.
pub fn object_matches(observed: &DynamicObject, desired: &DynamicObject) -> bool {
    observed.data.get("spec") == desired.data.get("spec") && observed.labels() == desired.labels()
}

/// Desired object carrying the observed resourceVersion, for a replace
pub fn for_replace(observed: &DynamicObject, desired: &DynamicObject) -> DynamicObject {
    let mut obj = desired.clone();
    obj.metadata.resource_version = observed.metadata.resource_version.clone();
    obj
}
