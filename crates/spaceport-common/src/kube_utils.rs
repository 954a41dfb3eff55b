//! Kubernetes helpers shared by controllers and event handlers

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Resource;
use serde::de::DeserializeOwned;

/// Split an `apiVersion` into `(group, version)`
///
/// ```
/// use spaceport_common::kube_utils::parse_api_version;
///
/// assert_eq!(parse_api_version("apps/v1"), ("apps".to_string(), "v1".to_string()));
/// assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Build an ApiResource from an apiVersion and kind
///
/// ```ignore
/// let ar = build_api_resource("helm.crossplane.io/v1beta1", "ProviderConfig");
/// let api: Api<DynamicObject> = Api::all_with(client, &ar);
/// ```
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Irregular pluralizations of kinds spaceport works with
const KIND_PLURALS: &[(&str, &str)] = &[
    ("providerconfig", "providerconfigs"),
    ("configuration", "configurations"),
    ("ingress", "ingresses"),
    ("statefulset", "statefulsets"),
];

/// Pluralize a Kubernetes resource kind
///
/// Uses a lookup table for known types, falling back to simple
/// pluralization rules for unknown types.
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    if let Some((_, plural)) = KIND_PLURALS.iter().find(|(s, _)| *s == lower) {
        return (*plural).to_string();
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Check if a resource carries the given finalizer
pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// Controller owner reference pointing at `owner`
pub fn owner_reference<K>(owner: &K) -> Option<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    owner.controller_owner_ref(&())
}

/// Add a finalizer to a resource (no-op when already present)
pub async fn add_finalizer<K>(
    api: &Api<K>,
    name: &str,
    finalizer: &str,
    field_manager: &str,
) -> Result<(), kube::Error>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    let obj = api.get(name).await?;
    let mut finalizers = obj.meta().finalizers.clone().unwrap_or_default();
    if finalizers.iter().any(|f| f == finalizer) {
        return Ok(());
    }
    finalizers.push(finalizer.to_string());

    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Remove a finalizer from a resource (no-op when absent)
pub async fn remove_finalizer<K>(
    api: &Api<K>,
    name: &str,
    finalizer: &str,
    field_manager: &str,
) -> Result<(), kube::Error>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    let obj = api.get(name).await?;
    let finalizers: Vec<String> = obj
        .meta()
        .finalizers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|f| f != finalizer)
        .collect();

    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Build a `{ "status": ... }` merge patch.
///
/// Merge patches leave map keys untouched when they are simply missing, so
/// every key in `removed` under `map_field` is written as `null` to delete it.
pub fn build_status_patch(
    status: &impl serde::Serialize,
    map_field: &str,
    removed: &[String],
) -> Result<serde_json::Value, serde_json::Error> {
    let mut status = serde_json::to_value(status)?;
    if !removed.is_empty() {
        if let Some(obj) = status.as_object_mut() {
            let map = obj
                .entry(map_field.to_string())
                .or_insert_with(|| serde_json::json!({}));
            if let Some(map) = map.as_object_mut() {
                for key in removed {
                    map.insert(key.clone(), serde_json::Value::Null);
                }
            }
        }
    }
    Ok(serde_json::json!({ "status": status }))
}

/// Merge-patch the status of a cluster-scoped resource
pub async fn patch_cluster_resource_status<K>(
    api: &Api<K>,
    name: &str,
    patch: &serde_json::Value,
    field_manager: &str,
) -> Result<(), kube::Error>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    api.patch_status(name, &PatchParams::apply(field_manager), &Patch::Merge(patch))
        .await?;
    Ok(())
}
