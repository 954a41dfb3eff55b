//! Common types for spaceport: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod registry;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace for spaceport system resources (operator, agent, host addons)
pub const SPACEPORT_SYSTEM_NAMESPACE: &str = "spaceport-system";

/// Name of the singleton HostCluster resource
pub const HOST_CLUSTER_NAME: &str = "default";

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "spaceport-controller";

/// Label key identifying the project that owns a resource
pub const PROJECT_LABEL_KEY: &str = "spaceport.dev/project";

/// Standard managed-by label key
pub const MANAGED_BY_LABEL_KEY: &str = "app.kubernetes.io/managed-by";

/// Value of the managed-by label for resources spaceport creates
pub const MANAGED_BY_VALUE: &str = "spaceport";
