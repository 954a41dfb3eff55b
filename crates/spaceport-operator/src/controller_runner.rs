//! Controller runner - builds controller futures for each CRD
//!
//! Each `build_*` function returns a Vec of boxed futures that can be composed
//! by the caller. This keeps controller construction pure and testable.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use spaceport_agent::BackendClient;
use spaceport_common::crd::{HostCluster, Project};
use spaceport_common::registry::ResourceRegistry;

use crate::controller::{host, project, Context, HostContext};
use crate::values::ValuesDefaults;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Boxed controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Build the Project controller
///
/// Namespaces are watched through their owner reference so a deleted tenant
/// namespace is recreated without waiting for the resync.
pub fn build_project_controllers(
    client: Client,
    registry: Arc<ResourceRegistry>,
    defaults: ValuesDefaults,
    backend: Option<Arc<dyn BackendClient>>,
) -> Vec<ControllerFuture> {
    let mut builder = Context::builder(client.clone())
        .registry(registry)
        .defaults(defaults);
    if let Some(backend) = backend {
        builder = builder.backend(backend);
    }
    let ctx = Arc::new(builder.build());

    let projects: Api<Project> = Api::all(client.clone());
    let namespaces: Api<Namespace> = Api::all(client);

    tracing::info!("- Project controller");

    vec![Box::pin(
        Controller::new(
            projects,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .owns(
            namespaces,
            WatcherConfig::default()
                .labels(&format!(
                    "{}={}",
                    spaceport_common::MANAGED_BY_LABEL_KEY,
                    spaceport_common::MANAGED_BY_VALUE
                ))
                .timeout(WATCH_TIMEOUT_SECS),
        )
        .shutdown_on_signal()
        .run(project::reconcile, project::error_policy, ctx)
        .for_each(log_reconcile_result("Project")),
    )]
}

/// Build the HostCluster controller
pub fn build_host_controllers(client: Client) -> Vec<ControllerFuture> {
    let ctx = Arc::new(HostContext::from_client(client.clone()));
    let hosts: Api<HostCluster> = Api::all(client);

    tracing::info!("- HostCluster controller");

    vec![Box::pin(
        Controller::new(hosts, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .shutdown_on_signal()
            .run(host::reconcile, host::error_policy, ctx)
            .for_each(log_reconcile_result("HostCluster")),
    )]
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
