//! Spaceport operator: tenant virtual clusters on a shared host

#![deny(missing_docs)]

/// Project and HostCluster reconcilers
pub mod controller;
/// Controller construction
pub mod controller_runner;
/// Liveness and readiness probes
pub mod health;
/// Package-installation boundary
pub mod installer;
/// Add-on provider variants
pub mod provider;
/// Desired shapes of tenant resources
pub mod steps;
/// Chart values rendering
pub mod values;
