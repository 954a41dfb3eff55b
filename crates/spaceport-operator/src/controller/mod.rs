//! Reconcilers for spaceport CRDs
//!
//! `project` converges tenants onto their virtual clusters; `host` installs
//! the shared host components. Both share the same backoff tiers.

pub mod host;
pub mod project;

use std::time::Duration;

use kube::runtime::controller::Action;
use spaceport_common::Error;

pub use host::{HostClient, HostClientImpl, HostContext};
pub use project::{Context, ContextBuilder, ProjectClient, ProjectClientImpl};

/// Requeue delay for a failed pass.
///
/// Conflicts retry almost immediately, transient failures back off briefly
/// and everything else waits for the periodic resync.
pub(crate) fn retry_action(error: &Error) -> Action {
    if error.is_conflict() {
        Action::requeue(Duration::from_secs(1))
    } else if error.is_retryable() {
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::requeue(Duration::from_secs(60))
    }
}
