//! Resource registration table
//!
//! Every third-party kind the operator touches through the dynamic API is
//! registered here once at startup and handed to the controllers through
//! their context. Add-on kinds are only known at reconcile time, so they are
//! resolved lazily and cached per `(group, version, resource)`.

use dashmap::DashMap;
use kube::discovery::ApiResource;
use tracing::debug;

use crate::kube_utils::{build_api_resource, pluralize_kind};

/// Known third-party kinds managed by spaceport controllers and handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// ProviderConfig (helm.crossplane.io)
    HelmProviderConfig,
    /// ProviderConfig (kubernetes.crossplane.io)
    KubernetesProviderConfig,
    /// Configuration package (pkg.crossplane.io)
    CrossplaneConfiguration,
}

/// All ResourceKind variants for iteration.
pub const ALL_RESOURCE_KINDS: &[ResourceKind] = &[
    ResourceKind::HelmProviderConfig,
    ResourceKind::KubernetesProviderConfig,
    ResourceKind::CrossplaneConfiguration,
];

/// Provider configurations created for every tenant, in creation order.
pub const PROVIDER_CONFIG_KINDS: &[ResourceKind] = &[
    ResourceKind::HelmProviderConfig,
    ResourceKind::KubernetesProviderConfig,
];

impl ResourceKind {
    /// API group
    pub fn group(&self) -> &'static str {
        match self {
            Self::HelmProviderConfig => "helm.crossplane.io",
            Self::KubernetesProviderConfig => "kubernetes.crossplane.io",
            Self::CrossplaneConfiguration => "pkg.crossplane.io",
        }
    }

    /// `group/version`
    pub fn api_version(&self) -> &'static str {
        match self {
            Self::HelmProviderConfig => "helm.crossplane.io/v1beta1",
            Self::KubernetesProviderConfig => "kubernetes.crossplane.io/v1alpha1",
            Self::CrossplaneConfiguration => "pkg.crossplane.io/v1",
        }
    }

    /// Kubernetes Kind string
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::HelmProviderConfig | Self::KubernetesProviderConfig => "ProviderConfig",
            Self::CrossplaneConfiguration => "Configuration",
        }
    }
}

/// Registration table of dynamic API resources.
///
/// Created once at startup and shared via `Arc<ResourceRegistry>`.
pub struct ResourceRegistry {
    known: DashMap<ResourceKind, ApiResource>,
    addons: DashMap<(String, String, String), ApiResource>,
}

impl ResourceRegistry {
    /// Build the table with every known kind registered
    pub fn new() -> Self {
        let known = DashMap::new();
        for kind in ALL_RESOURCE_KINDS {
            known.insert(
                *kind,
                build_api_resource(kind.api_version(), kind.kind_str()),
            );
        }
        Self {
            known,
            addons: DashMap::new(),
        }
    }

    /// API resource of a registered kind
    pub fn get(&self, kind: ResourceKind) -> ApiResource {
        match self.known.get(&kind) {
            Some(ar) => ar.clone(),
            None => build_api_resource(kind.api_version(), kind.kind_str()),
        }
    }

    /// API resource of an add-on installation.
    ///
    /// `resource` is the plural resource name when lowercase; otherwise it is
    /// treated as a kind and pluralized. `kind` overrides the Kind string.
    pub fn addon(&self, group: &str, version: &str, resource: &str, kind: &str) -> ApiResource {
        let key = (group.to_string(), version.to_string(), resource.to_string());
        if let Some(ar) = self.addons.get(&key) {
            return ar.clone();
        }

        let api_version = if group.is_empty() {
            version.to_string()
        } else {
            format!("{}/{}", group, version)
        };
        let mut ar = build_api_resource(&api_version, kind);
        ar.plural = if resource.chars().all(|c| !c.is_ascii_uppercase()) {
            resource.to_string()
        } else {
            pluralize_kind(resource)
        };
        debug!(api_version = %api_version, plural = %ar.plural, "registered add-on resource");
        self.addons.insert(key, ar.clone());
        ar
    }

    /// Number of add-on resources resolved so far
    pub fn addon_count(&self) -> usize {
        self.addons.len()
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
