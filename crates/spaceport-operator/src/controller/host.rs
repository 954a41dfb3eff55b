//! HostCluster controller implementation
//!
//! The host is a singleton: repositories, host add-ons and the agent
//! release are converged in one pass, then the Ready condition is written.
//! Nothing is registered or installed when everything is already deployed,
//! so a converged host costs only read calls.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info, instrument, warn};

use spaceport_common::crd::{
    Condition, ConditionStatus, HelmRef, HostCluster, HostClusterStatus, RepoEntry,
    CONDITION_READY,
};
use spaceport_common::kube_utils::{self, build_status_patch, has_finalizer};
use spaceport_common::{Error, FIELD_MANAGER, HOST_CLUSTER_NAME, SPACEPORT_SYSTEM_NAMESPACE};

use crate::installer::{HelmCliInstaller, PackageInstaller};
use crate::provider::AddonProvider;
use crate::steps::{VCLUSTER_REPO_NAME, VCLUSTER_REPO_URL};
use crate::values::{agent_values, into_values_map};

/// Finalizer guarding agent teardown
pub const HOST_FINALIZER: &str = "spaceport.dev/host-cleanup";

/// Release name of the agent
pub const AGENT_RELEASE: &str = "agent";
/// OCI location of the agent chart
pub const AGENT_CHART_REPO: &str = "oci://ghcr.io/spaceport-dev/agent/helm";
/// Agent chart name
pub const AGENT_CHART: &str = "agent";

const RESYNC: Duration = Duration::from_secs(60);

/// Kubernetes operations the HostCluster controller performs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HostClient: Send + Sync {
    /// Merge-patch the HostCluster status
    async fn patch_status(&self, name: &str, status: &HostClusterStatus) -> Result<(), Error>;

    /// Add the teardown finalizer
    async fn add_finalizer(&self, name: &str) -> Result<(), Error>;

    /// Remove the teardown finalizer
    async fn remove_finalizer(&self, name: &str) -> Result<(), Error>;
}

/// [`HostClient`] backed by the Kubernetes API
pub struct HostClientImpl {
    client: Client,
}

impl HostClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self) -> Api<HostCluster> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl HostClient for HostClientImpl {
    async fn patch_status(&self, name: &str, status: &HostClusterStatus) -> Result<(), Error> {
        let patch = build_status_patch(status, "conditions", &[])?;
        kube_utils::patch_cluster_resource_status(&self.api(), name, &patch, FIELD_MANAGER)
            .await?;
        Ok(())
    }

    async fn add_finalizer(&self, name: &str) -> Result<(), Error> {
        kube_utils::add_finalizer(&self.api(), name, HOST_FINALIZER, FIELD_MANAGER).await?;
        Ok(())
    }

    async fn remove_finalizer(&self, name: &str) -> Result<(), Error> {
        kube_utils::remove_finalizer(&self.api(), name, HOST_FINALIZER, FIELD_MANAGER).await?;
        Ok(())
    }
}

/// Shared context for the HostCluster controller
pub struct HostContext {
    /// Kubernetes operations
    pub kube: Arc<dyn HostClient>,
    /// Package installer for host add-ons and the agent
    pub installer: Arc<dyn PackageInstaller>,
}

impl HostContext {
    /// Context talking to the cluster and to `helm` on PATH
    pub fn from_client(client: Client) -> Self {
        Self {
            kube: Arc::new(HostClientImpl::new(client)),
            installer: Arc::new(HelmCliInstaller::new()),
        }
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn HostClient>, installer: Arc<dyn PackageInstaller>) -> Self {
        Self { kube, installer }
    }
}

/// Release reference of the agent for this host
pub fn agent_release(host: &HostCluster) -> Result<HelmRef, Error> {
    Ok(HelmRef {
        repo: AGENT_CHART_REPO.to_string(),
        chart: AGENT_CHART.to_string(),
        version: host.spec.agent.chart_version.clone(),
        namespace: SPACEPORT_SYSTEM_NAMESPACE.to_string(),
        name: AGENT_RELEASE.to_string(),
        values: into_values_map(agent_values(&host.spec)?),
    })
}

/// Repositories to register: the built-in virtual-cluster repo, then the spec's
fn repositories(host: &HostCluster) -> Vec<RepoEntry> {
    let builtin = RepoEntry {
        name: VCLUSTER_REPO_NAME.to_string(),
        url: VCLUSTER_REPO_URL.to_string(),
        username: None,
        password: None,
    };
    std::iter::once(builtin)
        .chain(
            host.spec
                .repos
                .iter()
                .filter(|r| r.name != VCLUSTER_REPO_NAME)
                .cloned(),
        )
        .collect()
}

/// Reconcile the HostCluster
#[instrument(skip(host, ctx), fields(host = %host.name_any()))]
pub async fn reconcile(host: Arc<HostCluster>, ctx: Arc<HostContext>) -> Result<Action, Error> {
    let name = host.name_any();
    if name != HOST_CLUSTER_NAME {
        warn!(expected = HOST_CLUSTER_NAME, "ignoring HostCluster with unexpected name");
        return Ok(Action::await_change());
    }

    if host.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&host, &ctx).await;
    }

    if !has_finalizer(host.as_ref(), HOST_FINALIZER) {
        debug!("adding finalizer");
        ctx.kube.add_finalizer(&name).await?;
    }

    let agent = match agent_release(&host) {
        Ok(agent) => agent,
        Err(e) if !e.is_retryable() => {
            warn!(error = %e, "invalid host spec");
            set_ready(&host, &ctx, ConditionStatus::False, "InvalidSpec", e.to_string()).await?;
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };

    if let Err(e) = converge(&host, &ctx, &agent).await {
        warn!(error = %e, "host installation failed");
        set_ready(&host, &ctx, ConditionStatus::False, "InstallFailed", e.to_string()).await?;
        return Err(e);
    }

    set_ready(
        &host,
        &ctx,
        ConditionStatus::True,
        "Installed",
        format!("Chart {} has been installed", agent.version),
    )
    .await?;
    Ok(Action::requeue(RESYNC))
}

/// Install whatever is missing or drifted
async fn converge(host: &HostCluster, ctx: &HostContext, agent: &HelmRef) -> Result<(), Error> {
    let mut missing_addons = Vec::new();
    for addon in &host.spec.addons {
        if ctx.installer.exists(addon).await?.is_none() {
            missing_addons.push(addon.clone());
        }
    }

    let desired_values = serde_json::to_value(&agent.values)?;
    let agent_drifted = match ctx.installer.exists(agent).await? {
        None => true,
        Some(release) => {
            release.chart_version != agent.version || release.values != desired_values
        }
    };

    if missing_addons.is_empty() && !agent_drifted {
        debug!("host already converged");
        return Ok(());
    }

    for repo in repositories(host) {
        ctx.installer.init_repo(&repo).await?;
    }

    for addon in missing_addons {
        info!(addon = %addon.name, chart = %addon.chart_ref(), "installing host add-on");
        let name = addon.name.clone();
        AddonProvider::Helm(addon)
            .install(&name, ctx.installer.as_ref())
            .await?;
    }

    if agent_drifted {
        info!(version = %agent.version, "installing agent");
        ctx.installer.ensure(agent).await?;
    }
    Ok(())
}

/// Write the Ready condition when it changed
async fn set_ready(
    host: &HostCluster,
    ctx: &HostContext,
    status: ConditionStatus,
    reason: &str,
    message: String,
) -> Result<(), Error> {
    let observed = host.status.clone().unwrap_or_default();
    let mut next = observed.clone();
    next.message = Some(message.clone());
    next = next.condition(Condition::new(CONDITION_READY, status, reason, message));
    if next != observed {
        ctx.kube.patch_status(&host.name_any(), &next).await?;
    }
    Ok(())
}

async fn handle_deletion(host: &HostCluster, ctx: &HostContext) -> Result<Action, Error> {
    if !has_finalizer(host, HOST_FINALIZER) {
        return Ok(Action::await_change());
    }

    let agent = HelmRef {
        repo: AGENT_CHART_REPO.to_string(),
        chart: AGENT_CHART.to_string(),
        namespace: SPACEPORT_SYSTEM_NAMESPACE.to_string(),
        name: AGENT_RELEASE.to_string(),
        ..Default::default()
    };
    info!("uninstalling agent");
    ctx.installer.uninstall(&agent).await?;
    ctx.kube.remove_finalizer(&host.name_any()).await?;
    Ok(Action::await_change())
}

/// Error policy for HostCluster reconciliation
pub fn error_policy(host: Arc<HostCluster>, error: &Error, _ctx: Arc<HostContext>) -> Action {
    warn!(host = %host.name_any(), error = %error, "host reconciliation failed");
    super::retry_action(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::{MockPackageInstaller, Release, STATUS_DEPLOYED};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use spaceport_common::crd::{is_condition_true, HostClusterSpec};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn host() -> HostCluster {
        let spec: HostClusterSpec = serde_json::from_value(serde_json::json!({
            "clusterId": 42,
            "credentialsRef": {"name": "spaceport-credentials"},
            "agent": {"chartVersion": "0.4.1"},
            "backend": {
                "tokenUrl": "https://auth.example.io/token",
                "apiUrl": "https://api.example.io",
                "streamUrl": "wss://api.example.io/cable",
                "channel": "ClusterChannel"
            },
            "repos": [{"name": "ingress-nginx", "url": "https://kubernetes.github.io/ingress-nginx"}],
            "addons": [{
                "repo": "ingress-nginx",
                "chart": "ingress-nginx",
                "version": "4.8.3",
                "namespace": "ingress-nginx",
                "name": "ingress-nginx"
            }]
        }))
        .unwrap();
        let mut host = HostCluster::new(HOST_CLUSTER_NAME, spec);
        host.metadata.finalizers = Some(vec![HOST_FINALIZER.to_string()]);
        host
    }

    // ==========================================================================
    // In-memory helm
    // ==========================================================================

    #[derive(Default)]
    struct FakeHelm {
        releases: Mutex<BTreeMap<String, Release>>,
        repos: Mutex<Vec<String>>,
        ensures: Mutex<usize>,
        statuses: Mutex<Vec<HostClusterStatus>>,
        fail_agent: bool,
    }

    impl FakeHelm {
        fn context(self: &Arc<Self>) -> Arc<HostContext> {
            Arc::new(HostContext::for_testing(self.clone(), self.clone()))
        }

        fn ensures(&self) -> usize {
            *self.ensures.lock().unwrap()
        }

        fn last_status(&self) -> Option<HostClusterStatus> {
            self.statuses.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl PackageInstaller for FakeHelm {
        async fn exists(&self, chart: &HelmRef) -> Result<Option<Release>, Error> {
            Ok(self.releases.lock().unwrap().get(&chart.name).cloned())
        }

        async fn ensure(&self, chart: &HelmRef) -> Result<Release, Error> {
            if self.fail_agent && chart.name == AGENT_RELEASE {
                return Err(Error::install(&chart.name, "helm", "chart not found"));
            }
            *self.ensures.lock().unwrap() += 1;
            let release = Release {
                name: chart.name.clone(),
                namespace: chart.namespace.clone(),
                status: STATUS_DEPLOYED.to_string(),
                chart_version: chart.version.clone(),
                values: serde_json::to_value(&chart.values)?,
            };
            self.releases
                .lock()
                .unwrap()
                .insert(chart.name.clone(), release.clone());
            Ok(release)
        }

        async fn init_repo(&self, repo: &RepoEntry) -> Result<(), Error> {
            self.repos.lock().unwrap().push(repo.name.clone());
            Ok(())
        }

        async fn uninstall(&self, chart: &HelmRef) -> Result<(), Error> {
            self.releases.lock().unwrap().remove(&chart.name);
            Ok(())
        }
    }

    #[async_trait]
    impl HostClient for FakeHelm {
        async fn patch_status(&self, _name: &str, status: &HostClusterStatus) -> Result<(), Error> {
            self.statuses.lock().unwrap().push(status.clone());
            Ok(())
        }

        async fn add_finalizer(&self, _name: &str) -> Result<(), Error> {
            Ok(())
        }

        async fn remove_finalizer(&self, _name: &str) -> Result<(), Error> {
            Ok(())
        }
    }

    // ==========================================================================
    // Story Tests: installation
    // ==========================================================================

    mod installation {
        use super::*;

        /// Story: a fresh host gets repos, add-ons and the agent, then Ready
        #[tokio::test]
        async fn story_fresh_host_is_installed() {
            let helm = Arc::new(FakeHelm::default());
            let action = reconcile(Arc::new(host()), helm.context()).await.unwrap();
            assert_eq!(action, Action::requeue(RESYNC));

            assert_eq!(
                *helm.repos.lock().unwrap(),
                vec![VCLUSTER_REPO_NAME.to_string(), "ingress-nginx".to_string()]
            );

            let releases = helm.releases.lock().unwrap();
            assert!(releases.contains_key("ingress-nginx"));
            let agent = &releases[AGENT_RELEASE];
            assert_eq!(agent.namespace, SPACEPORT_SYSTEM_NAMESPACE);
            assert_eq!(agent.chart_version, "0.4.1");
            assert_eq!(agent.values["agent"]["clusterId"], 42);
            assert_eq!(agent.values["credentialsSecret"]["name"], "spaceport-credentials");

            let status = helm.last_status().unwrap();
            assert!(is_condition_true(&status.conditions, CONDITION_READY));
            let ready = &status.conditions[0];
            assert_eq!(ready.reason, "Installed");
            assert_eq!(ready.message, "Chart 0.4.1 has been installed");
        }

        /// Story: a converged host performs no installs and no status writes
        #[tokio::test]
        async fn story_converged_host_is_quiet() {
            let helm = Arc::new(FakeHelm::default());
            let mut h = host();
            reconcile(Arc::new(h.clone()), helm.context()).await.unwrap();
            h.status = helm.last_status();

            let ensures = helm.ensures();
            let repos = helm.repos.lock().unwrap().len();
            let statuses = helm.statuses.lock().unwrap().len();

            reconcile(Arc::new(h), helm.context()).await.unwrap();
            assert_eq!(helm.ensures(), ensures);
            assert_eq!(helm.repos.lock().unwrap().len(), repos);
            assert_eq!(helm.statuses.lock().unwrap().len(), statuses);
        }

        /// Story: bumping the chart version upgrades only the agent
        #[tokio::test]
        async fn story_chart_version_bump_upgrades_agent() {
            let helm = Arc::new(FakeHelm::default());
            let mut h = host();
            reconcile(Arc::new(h.clone()), helm.context()).await.unwrap();
            let before = helm.ensures();

            h.spec.agent.chart_version = "0.5.0".to_string();
            reconcile(Arc::new(h), helm.context()).await.unwrap();

            assert_eq!(helm.ensures(), before + 1);
            assert_eq!(
                helm.releases.lock().unwrap()[AGENT_RELEASE].chart_version,
                "0.5.0"
            );
            assert_eq!(
                helm.last_status().unwrap().conditions[0].message,
                "Chart 0.5.0 has been installed"
            );
        }

        /// Story: an already deployed host add-on is left alone
        #[tokio::test]
        async fn story_deployed_addon_not_reinstalled() {
            let mut installer = MockPackageInstaller::new();
            installer.expect_exists().returning(|chart| {
                Ok(Some(Release {
                    name: chart.name.clone(),
                    namespace: chart.namespace.clone(),
                    status: STATUS_DEPLOYED.to_string(),
                    chart_version: chart.version.clone(),
                    values: serde_json::to_value(&chart.values).unwrap(),
                }))
            });
            installer.expect_ensure().times(0);
            installer.expect_init_repo().times(0);

            let mut kube = MockHostClient::new();
            kube.expect_patch_status().times(1).returning(|_, _| Ok(()));

            let ctx = Arc::new(HostContext::for_testing(Arc::new(kube), Arc::new(installer)));
            reconcile(Arc::new(host()), ctx).await.unwrap();
        }

        /// Story: a failed agent install is surfaced in status and retried
        #[tokio::test]
        async fn story_install_failure_sets_condition() {
            let helm = Arc::new(FakeHelm {
                fail_agent: true,
                ..Default::default()
            });
            let err = reconcile(Arc::new(host()), helm.context())
                .await
                .unwrap_err();
            assert!(err.is_retryable());

            let status = helm.last_status().unwrap();
            let ready = &status.conditions[0];
            assert_eq!(ready.status, ConditionStatus::False);
            assert_eq!(ready.reason, "InstallFailed");
            assert!(ready.message.contains("chart not found"));
        }

        /// Story: only the singleton named `default` is managed
        #[tokio::test]
        async fn story_other_names_are_ignored() {
            let mut h = host();
            h.metadata.name = Some("other".to_string());
            let ctx = Arc::new(HostContext::for_testing(
                Arc::new(MockHostClient::new()),
                Arc::new(MockPackageInstaller::new()),
            ));
            let action = reconcile(Arc::new(h), ctx).await.unwrap();
            assert_eq!(action, Action::await_change());
        }
    }

    // ==========================================================================
    // Story Tests: teardown
    // ==========================================================================

    mod teardown {
        use super::*;

        /// Story: deleting the host uninstalls the agent, then drops the finalizer
        #[tokio::test]
        async fn story_deletion_uninstalls_agent() {
            let mut installer = MockPackageInstaller::new();
            installer
                .expect_uninstall()
                .withf(|chart| chart.name == AGENT_RELEASE)
                .times(1)
                .returning(|_| Ok(()));
            let mut kube = MockHostClient::new();
            kube.expect_remove_finalizer().times(1).returning(|_| Ok(()));

            let mut h = host();
            h.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
            let ctx = Arc::new(HostContext::for_testing(Arc::new(kube), Arc::new(installer)));
            let action = reconcile(Arc::new(h), ctx).await.unwrap();
            assert_eq!(action, Action::await_change());
        }
    }

    #[test]
    fn builtin_repo_is_not_duplicated() {
        let mut h = host();
        h.spec.repos.push(RepoEntry {
            name: VCLUSTER_REPO_NAME.to_string(),
            url: "https://mirror.example.io".to_string(),
            username: None,
            password: None,
        });
        let names: Vec<String> = repositories(&h).into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec![VCLUSTER_REPO_NAME, "ingress-nginx"]);
    }

    #[test]
    fn agent_release_points_at_oci_chart() {
        let release = agent_release(&host()).unwrap();
        assert_eq!(
            release.chart_ref(),
            "oci://ghcr.io/spaceport-dev/agent/helm/agent"
        );
        assert_eq!(release.version, "0.4.1");
    }
}
