//! Project controller implementation
//!
//! Converges a Project onto its dependent resources, one step per pass:
//!
//! ```text
//! host ready? -> namespace -> vcluster release -> credential -> status
//!             -> provider configs -> add-ons -> replicas -> requeue(60s)
//! ```
//!
//! Every step that mutates something returns early and asks for another
//! pass, so a pass never assumes side effects of an earlier write that the
//! API server has not confirmed. Waiting on the access credential is the
//! only step that polls.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, error, info, instrument, warn};

use spaceport_agent::{BackendClient, ProjectStatusReport};
use spaceport_common::crd::{
    Condition, ConditionStatus, HostCluster, Project, ProjectAddon, ProjectPhase, ProjectStatus,
    CONDITION_READY,
};
use spaceport_common::kube_utils::{
    self, build_status_patch, has_finalizer, patch_cluster_resource_status,
};
use spaceport_common::registry::ResourceRegistry;
use spaceport_common::{Error, FIELD_MANAGER, HOST_CLUSTER_NAME};

use crate::installer::{HelmCliInstaller, PackageInstaller};
use crate::steps;
use crate::values::{into_values_map, vcluster_values, ValuesDefaults};

/// Finalizer guarding release teardown
pub const PROJECT_FINALIZER: &str = "spaceport.dev/cleanup";

/// Requeue after a step made progress
const PROGRESS_REQUEUE: Duration = Duration::from_secs(1);
/// Poll interval while the access credential hasn't appeared
const CREDENTIAL_POLL: Duration = Duration::from_secs(5);
/// Poll interval while the host is not ready
const HOST_POLL: Duration = Duration::from_secs(10);
/// Periodic re-validation of a converged project
const RESYNC: Duration = Duration::from_secs(60);
/// Grace period for pods drained on pause
const POD_GRACE_SECONDS: u32 = 5;

/// Kubernetes operations the Project controller performs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProjectClient: Send + Sync {
    /// Get the singleton HostCluster
    async fn get_host(&self) -> Result<Option<HostCluster>, Error>;

    /// Check whether a namespace exists
    async fn namespace_exists(&self, name: &str) -> Result<bool, Error>;

    /// Create a namespace (already-exists is success)
    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), Error>;

    /// Get a Secret by namespace and name
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Get the observed counterpart of `desired` (same name and namespace)
    async fn get_object(
        &self,
        ar: &ApiResource,
        desired: &DynamicObject,
    ) -> Result<Option<DynamicObject>, Error>;

    /// Create a dynamic object
    async fn create_object(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<(), Error>;

    /// Replace a dynamic object (the object carries its resourceVersion)
    async fn replace_object(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<(), Error>;

    /// Replica count of a StatefulSet, `None` if it doesn't exist
    async fn get_replicas(&self, namespace: &str, name: &str) -> Result<Option<i32>, Error>;

    /// Set the replica count of a StatefulSet
    async fn scale(&self, namespace: &str, name: &str, replicas: i32) -> Result<(), Error>;

    /// Delete all pods matching `selector` with a short grace period.
    ///
    /// Returns the number of pods deleted.
    async fn delete_pods(
        &self,
        namespace: &str,
        selector: &str,
        grace_seconds: u32,
    ) -> Result<usize, Error>;

    /// Merge-patch a Project's status, deleting the `removed` add-on keys
    async fn patch_status(
        &self,
        name: &str,
        status: &ProjectStatus,
        removed_addons: &[String],
    ) -> Result<(), Error>;

    /// Add the cleanup finalizer
    async fn add_finalizer(&self, name: &str) -> Result<(), Error>;

    /// Remove the cleanup finalizer
    async fn remove_finalizer(&self, name: &str) -> Result<(), Error>;
}

/// [`ProjectClient`] backed by the Kubernetes API
pub struct ProjectClientImpl {
    client: Client,
}

impl ProjectClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn dynamic_api(&self, ar: &ApiResource, obj: &DynamicObject) -> Api<DynamicObject> {
        match obj.metadata.namespace.as_deref() {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
            None => Api::all_with(self.client.clone(), ar),
        }
    }
}

/// Delete options for draining a paused virtual cluster's pods
fn pod_delete_params(grace_seconds: u32) -> DeleteParams {
    DeleteParams {
        grace_period_seconds: Some(grace_seconds),
        ..Default::default()
    }
}

#[async_trait]
impl ProjectClient for ProjectClientImpl {
    async fn get_host(&self) -> Result<Option<HostCluster>, Error> {
        let api: Api<HostCluster> = Api::all(self.client.clone());
        Ok(api.get_opt(HOST_CLUSTER_NAME).await?)
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.create(&PostParams::default(), namespace).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_object(
        &self,
        ar: &ApiResource,
        desired: &DynamicObject,
    ) -> Result<Option<DynamicObject>, Error> {
        Ok(self
            .dynamic_api(ar, desired)
            .get_opt(&desired.name_any())
            .await?)
    }

    async fn create_object(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<(), Error> {
        self.dynamic_api(ar, obj)
            .create(&PostParams::default(), obj)
            .await?;
        Ok(())
    }

    async fn replace_object(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<(), Error> {
        self.dynamic_api(ar, obj)
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await?;
        Ok(())
    }

    async fn get_replicas(&self, namespace: &str, name: &str) -> Result<Option<i32>, Error> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .get_opt(name)
            .await?
            .map(|sts| sts.spec.and_then(|s| s.replicas).unwrap_or(1)))
    }

    async fn scale(&self, namespace: &str, name: &str, replicas: i32) -> Result<(), Error> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_pods(
        &self,
        namespace: &str,
        selector: &str,
        grace_seconds: u32,
    ) -> Result<usize, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default().labels(selector)).await?;
        let params = pod_delete_params(grace_seconds);

        let mut deleted = 0;
        for pod in pods.items {
            match api.delete(&pod.name_any(), &params).await {
                Ok(_) => deleted += 1,
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(deleted)
    }

    async fn patch_status(
        &self,
        name: &str,
        status: &ProjectStatus,
        removed_addons: &[String],
    ) -> Result<(), Error> {
        let api: Api<Project> = Api::all(self.client.clone());
        let patch = build_status_patch(status, "addons", removed_addons)?;
        patch_cluster_resource_status(&api, name, &patch, FIELD_MANAGER).await?;
        Ok(())
    }

    async fn add_finalizer(&self, name: &str) -> Result<(), Error> {
        let api: Api<Project> = Api::all(self.client.clone());
        kube_utils::add_finalizer(&api, name, PROJECT_FINALIZER, FIELD_MANAGER).await?;
        Ok(())
    }

    async fn remove_finalizer(&self, name: &str) -> Result<(), Error> {
        let api: Api<Project> = Api::all(self.client.clone());
        kube_utils::remove_finalizer(&api, name, PROJECT_FINALIZER, FIELD_MANAGER).await?;
        Ok(())
    }
}

/// Shared context for the Project controller
pub struct Context {
    /// Kubernetes operations (trait object for testability)
    pub kube: Arc<dyn ProjectClient>,
    /// Package installer for the virtual-cluster release
    pub installer: Arc<dyn PackageInstaller>,
    /// Registration table of dynamic resource kinds
    pub registry: Arc<ResourceRegistry>,
    /// Backend client for status reports, when configured
    pub backend: Option<Arc<dyn BackendClient>>,
    /// Controller-level values defaults
    pub defaults: ValuesDefaults,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn ProjectClient>, installer: Arc<dyn PackageInstaller>) -> Self {
        Self {
            kube,
            installer,
            registry: Arc::new(ResourceRegistry::new()),
            backend: None,
            defaults: ValuesDefaults::default(),
        }
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn ProjectClient>>,
    installer: Option<Arc<dyn PackageInstaller>>,
    registry: Option<Arc<ResourceRegistry>>,
    backend: Option<Arc<dyn BackendClient>>,
    defaults: ValuesDefaults,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            installer: None,
            registry: None,
            backend: None,
            defaults: ValuesDefaults::default(),
        }
    }

    /// Override the Kubernetes operations
    pub fn kube_client(mut self, kube: Arc<dyn ProjectClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the package installer
    pub fn installer(mut self, installer: Arc<dyn PackageInstaller>) -> Self {
        self.installer = Some(installer);
        self
    }

    /// Share a registration table with other components
    pub fn registry(mut self, registry: Arc<ResourceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Report project status to the backend
    pub fn backend(mut self, backend: Arc<dyn BackendClient>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Controller-level values defaults
    pub fn defaults(mut self, defaults: ValuesDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(ProjectClientImpl::new(self.client.clone()))),
            installer: self
                .installer
                .unwrap_or_else(|| Arc::new(HelmCliInstaller::new())),
            registry: self
                .registry
                .unwrap_or_else(|| Arc::new(ResourceRegistry::new())),
            backend: self.backend,
            defaults: self.defaults,
        }
    }
}

/// Reconcile a Project
#[instrument(skip(project, ctx), fields(project = %project.name_any()))]
pub async fn reconcile(project: Arc<Project>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = project.name_any();

    if project.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&project, &ctx).await;
    }

    if !has_finalizer(project.as_ref(), PROJECT_FINALIZER) {
        debug!("adding finalizer");
        ctx.kube.add_finalizer(&name).await?;
    }

    let host = match ctx.kube.get_host().await? {
        Some(host) if host.is_ready() => host,
        _ => {
            debug!("host cluster not ready, waiting");
            return Ok(Action::requeue(HOST_POLL));
        }
    };

    let values = match project
        .spec
        .validate()
        .and_then(|_| vcluster_values(&project.spec, &host.spec, &ctx.defaults))
    {
        Ok(values) => values,
        Err(e @ Error::Validation { .. }) => {
            warn!(error = %e, "invalid project spec");
            mark_failed(&project, &ctx, &e).await?;
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };

    let slug = project.spec.slug.as_str();

    // 1. namespace
    if !ctx.kube.namespace_exists(slug).await? {
        info!(namespace = %slug, "creating namespace");
        ctx.kube.create_namespace(&steps::namespace(&project)).await?;
        return Ok(Action::requeue(PROGRESS_REQUEUE));
    }

    // 2. virtual-cluster release
    let release = steps::vcluster_release(&project, into_values_map(values));
    let desired_values = serde_json::to_value(&release.values)?;
    match ctx.installer.exists(&release).await? {
        None => {
            info!(release = %release.name, "installing virtual cluster");
            ctx.installer.ensure(&release).await?;
            return Ok(Action::requeue(PROGRESS_REQUEUE));
        }
        Some(deployed) if deployed.values != desired_values => {
            info!(release = %release.name, "virtual cluster values drifted, upgrading");
            ctx.installer.ensure(&release).await?;
            return Ok(Action::requeue(PROGRESS_REQUEUE));
        }
        Some(_) => {}
    }

    // 3. readiness gate
    let secret_name = project.spec.credential_secret_name();
    let Some(ca) = ctx
        .kube
        .get_secret(slug, &secret_name)
        .await?
        .as_ref()
        .and_then(ca_certificate)
    else {
        debug!(secret = %secret_name, "access credential not available yet");
        return Ok(Action::requeue(CREDENTIAL_POLL));
    };

    // 4. status commit
    let observed = project.status.clone().unwrap_or_default();
    if observed.ca_certificate.as_deref() != Some(ca.as_str())
        || observed.phase != ProjectPhase::Provisioned
    {
        let mut status = observed.clone();
        status.phase = ProjectPhase::Provisioned;
        status.ca_certificate = Some(ca);
        status.message = None;
        status.observed_generation = project.metadata.generation;
        status = status.condition(Condition::new(
            CONDITION_READY,
            ConditionStatus::True,
            "Provisioned",
            "Virtual cluster is ready",
        ));
        info!("virtual cluster provisioned");
        ctx.kube.patch_status(&name, &status, &[]).await?;
        report_status(&ctx, &project, &status).await;
        return Ok(Action::requeue(PROGRESS_REQUEUE));
    }

    // 5. provider configurations
    for (ar, desired) in steps::provider_configs(&project, &ctx.registry) {
        if ctx.kube.get_object(&ar, &desired).await?.is_none() {
            info!(kind = %ar.kind, group = %ar.group, "creating provider config");
            ctx.kube.create_object(&ar, &desired).await?;
        }
    }

    // 6. add-ons
    converge_addons(&project, &ctx, &observed).await?;

    // 7. replicas
    let desired_replicas = project.spec.desired_replicas();
    match ctx.kube.get_replicas(slug, project.spec.release_name()).await? {
        Some(current) if current != desired_replicas => {
            info!(from = current, to = desired_replicas, "scaling virtual cluster");
            ctx.kube
                .scale(slug, project.spec.release_name(), desired_replicas)
                .await?;
        }
        Some(_) => {}
        None => {
            warn!("virtual cluster workload not found");
            return Ok(Action::requeue(CREDENTIAL_POLL));
        }
    }
    if project.spec.paused {
        let deleted = ctx
            .kube
            .delete_pods(slug, &steps::pod_selector(&project), POD_GRACE_SECONDS)
            .await?;
        if deleted > 0 {
            info!(pods = deleted, "drained paused virtual cluster");
        }
    }

    Ok(Action::requeue(RESYNC))
}

/// Upsert every requested add-on and commit their conditions.
///
/// Status entries of add-ons no longer in the spec are removed. The status
/// is written only when something changed. The first installation failure
/// is returned after its condition has been recorded.
async fn converge_addons(
    project: &Project,
    ctx: &Context,
    observed: &ProjectStatus,
) -> Result<(), Error> {
    let mut status = observed.clone();
    status.observed_generation = project.metadata.generation;

    let mut failure = None;
    for addon in &project.spec.addons {
        let key = addon.status_key();
        let condition = match upsert_addon(project, ctx, addon).await {
            Ok(()) => Condition::new(
                CONDITION_READY,
                ConditionStatus::True,
                "Installed",
                "Add-on installed",
            ),
            Err(e) => {
                warn!(addon = %key, error = %e, "add-on installation failed");
                let condition = Condition::new(
                    CONDITION_READY,
                    ConditionStatus::False,
                    "InstallFailed",
                    e.to_string(),
                );
                failure.get_or_insert(e);
                condition
            }
        };
        status.set_addon_condition(&key, condition);
    }

    let wanted: BTreeSet<String> = project.spec.addons.iter().map(|a| a.status_key()).collect();
    let removed: Vec<String> = status
        .addons
        .keys()
        .filter(|k| !wanted.contains(*k))
        .cloned()
        .collect();
    for key in &removed {
        debug!(addon = %key, "dropping status of removed add-on");
        status.remove_addon_status(key);
    }

    if status != *observed {
        ctx.kube
            .patch_status(&project.name_any(), &status, &removed)
            .await?;
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn upsert_addon(project: &Project, ctx: &Context, addon: &ProjectAddon) -> Result<(), Error> {
    let (ar, desired) = steps::addon_object(project, addon, &ctx.registry);
    match ctx.kube.get_object(&ar, &desired).await? {
        None => {
            info!(addon = %addon.status_key(), kind = %ar.kind, "creating add-on");
            ctx.kube.create_object(&ar, &desired).await
        }
        Some(observed) if !steps::object_matches(&observed, &desired) => {
            info!(addon = %addon.status_key(), kind = %ar.kind, "updating add-on");
            ctx.kube
                .replace_object(&ar, &steps::for_replace(&observed, &desired))
                .await
        }
        Some(_) => Ok(()),
    }
}

/// CA certificate held by the access-credential secret
fn ca_certificate(secret: &Secret) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(steps::CA_CERTIFICATE_KEY))
        .and_then(|b| String::from_utf8(b.0.clone()).ok())
        .filter(|ca| !ca.is_empty())
}

/// Surface a fatal configuration error in status
async fn mark_failed(project: &Project, ctx: &Context, err: &Error) -> Result<(), Error> {
    let observed = project.status.clone().unwrap_or_default();
    let mut status = observed.clone();
    status.phase = ProjectPhase::Failed;
    status.message = Some(err.to_string());
    status.observed_generation = project.metadata.generation;
    status = status.condition(Condition::new(
        CONDITION_READY,
        ConditionStatus::False,
        "InvalidSpec",
        err.to_string(),
    ));
    if status != observed {
        ctx.kube
            .patch_status(&project.name_any(), &status, &[])
            .await?;
        report_status(ctx, project, &status).await;
    }
    Ok(())
}

/// Best-effort status report to the backend
async fn report_status(ctx: &Context, project: &Project, status: &ProjectStatus) {
    let Some(backend) = ctx.backend.as_ref() else {
        return;
    };
    let report = ProjectStatusReport {
        ca_certificate: status.ca_certificate.clone(),
        status: status.phase.to_string(),
    };
    if let Err(e) = backend.update_project(project.spec.id, &report).await {
        warn!(error = %e, "failed to report project status");
    }
}

async fn handle_deletion(project: &Project, ctx: &Context) -> Result<Action, Error> {
    if !has_finalizer(project, PROJECT_FINALIZER) {
        return Ok(Action::await_change());
    }

    let release = steps::vcluster_release(project, BTreeMap::new());
    if ctx.installer.exists(&release).await?.is_some() {
        info!(release = %release.name, "uninstalling virtual cluster");
        ctx.installer.uninstall(&release).await?;
    }

    ctx.kube.remove_finalizer(&project.name_any()).await?;
    info!("project cleanup complete");
    Ok(Action::await_change())
}

/// Error policy for Project reconciliation
pub fn error_policy(project: Arc<Project>, error: &Error, _ctx: Arc<Context>) -> Action {
    if error.is_retryable() {
        warn!(project = %project.name_any(), error = %error, "reconciliation failed, retrying");
    } else {
        error!(project = %project.name_any(), error = %error, "reconciliation failed");
    }
    super::retry_action(error)
}
