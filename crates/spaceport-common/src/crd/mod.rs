//! Custom Resource Definitions for spaceport
//!
//! This module contains all CRD definitions used by the spaceport operator.

mod host;
mod project;
mod types;

pub use host::{
    AgentSpec, BackendSpec, CredentialsRef, DefaultResources, HelmRef, HostCluster,
    HostClusterSpec, HostClusterStatus, HostConfig, HostDefaults, OidcConfig, RepoEntry,
    DEFAULT_AGENT_PULL_POLICY, DEFAULT_AGENT_REPOSITORY,
};
pub use project::{
    AddonStatus, Project, ProjectAddon, ProjectPhase, ProjectResources, ProjectSpec,
    ProjectStatus, ProjectUser, CREDENTIAL_SECRET_PREFIX, DEFAULT_CLUSTER_ROLE,
    DEFAULT_KUBERNETES_VERSION,
};
pub use types::{is_condition_true, set_condition, Condition, ConditionStatus, CONDITION_READY};
