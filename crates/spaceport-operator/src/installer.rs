//! Package installation through the `helm` CLI
//!
//! Chart resolution and apply are delegated to helm. The reconcilers only
//! see [`PackageInstaller`], so tests swap in a mock.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use spaceport_common::crd::{HelmRef, RepoEntry};
use spaceport_common::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Status helm reports for a healthy release
pub const STATUS_DEPLOYED: &str = "deployed";

/// An installed release
#[derive(Clone, Debug, PartialEq)]
pub struct Release {
    /// Release name
    pub name: String,
    /// Release namespace
    pub namespace: String,
    /// Release status as reported by helm
    pub status: String,
    /// Version of the deployed chart
    pub chart_version: String,
    /// User-supplied values of the deployed revision
    pub values: serde_json::Value,
}

/// Boundary to the package-installation engine
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    /// The deployed release for `chart`, `None` if absent or not deployed
    async fn exists(&self, chart: &HelmRef) -> Result<Option<Release>, Error>;

    /// Install or upgrade `chart`, returning the resulting release
    async fn ensure(&self, chart: &HelmRef) -> Result<Release, Error>;

    /// Register a chart repository
    async fn init_repo(&self, repo: &RepoEntry) -> Result<(), Error>;

    /// Uninstall the release for `chart` in any status (absence is success)
    async fn uninstall(&self, chart: &HelmRef) -> Result<(), Error>;
}

#[derive(Deserialize)]
struct ListedRelease {
    name: String,
    namespace: String,
    status: String,
    chart: String,
}

/// [`PackageInstaller`] that shells out to `helm`
#[derive(Clone, Debug)]
pub struct HelmCliInstaller {
    binary: String,
}

impl Default for HelmCliInstaller {
    fn default() -> Self {
        Self::new()
    }
}

impl HelmCliInstaller {
    /// Use `helm` from `PATH`
    pub fn new() -> Self {
        Self {
            binary: "helm".to_string(),
        }
    }

    /// Use a specific helm binary
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, release: &str, args: &[&str]) -> Result<String, Error> {
        debug!(release = %release, ?args, "running helm");
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::install(release, "helm", format!("failed to run helm: {e}")))?;

        if !output.status.success() {
            return Err(Error::install(
                release,
                "helm",
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn deployed_values(&self, chart: &HelmRef) -> Result<serde_json::Value, Error> {
        let out = self
            .run(
                &chart.name,
                &[
                    "get",
                    "values",
                    chart.name.as_str(),
                    "-n",
                    chart.namespace.as_str(),
                    "-o",
                    "json",
                ],
            )
            .await?;
        let values: serde_json::Value = serde_json::from_str(&out)?;
        // helm prints `null` for a release installed without values
        Ok(match values {
            serde_json::Value::Null => serde_json::json!({}),
            v => v,
        })
    }
}

/// Version part of the `chart` column of `helm list`
///
/// The column is `<chart>-<version>` and versions may carry their own
/// dashes (`0.4.1-rc.1`), so the known chart name is stripped rather than
/// splitting on the last dash. Falls back to the first `-<digit>` when the
/// listed chart name differs from the configured one.
fn chart_version(chart_field: &str, chart: &str) -> String {
    let name = chart.rsplit('/').next().unwrap_or(chart);
    if let Some(v) = chart_field
        .strip_prefix(name)
        .and_then(|rest| rest.strip_prefix('-'))
    {
        return v.to_string();
    }
    chart_field
        .char_indices()
        .find(|&(i, c)| {
            c == '-'
                && chart_field[i + 1..]
                    .chars()
                    .next()
                    .is_some_and(|d| d.is_ascii_digit())
        })
        .map(|(i, _)| chart_field[i + 1..].to_string())
        .unwrap_or_default()
}

impl HelmCliInstaller {
    /// The listed release named after `chart`, in any status
    async fn listed(&self, chart: &HelmRef) -> Result<Option<ListedRelease>, Error> {
        let filter = format!("^{}$", chart.name);
        let out = self
            .run(
                &chart.name,
                &[
                    "list",
                    "-n",
                    chart.namespace.as_str(),
                    "--filter",
                    filter.as_str(),
                    "--all",
                    "-o",
                    "json",
                ],
            )
            .await?;
        let listed: Vec<ListedRelease> = serde_json::from_str(&out)?;
        Ok(listed.into_iter().find(|r| r.name == chart.name))
    }
}

#[async_trait]
impl PackageInstaller for HelmCliInstaller {
    async fn exists(&self, chart: &HelmRef) -> Result<Option<Release>, Error> {
        let Some(found) = self
            .listed(chart)
            .await?
            .filter(|r| r.status == STATUS_DEPLOYED)
        else {
            return Ok(None);
        };

        let values = self.deployed_values(chart).await?;
        Ok(Some(Release {
            chart_version: chart_version(&found.chart, &chart.chart),
            name: found.name,
            namespace: found.namespace,
            status: found.status,
            values,
        }))
    }

    async fn ensure(&self, chart: &HelmRef) -> Result<Release, Error> {
        let values = serde_json::to_string(&chart.values)?;
        let chart_ref = chart.chart_ref();
        let mut args = vec![
            "upgrade",
            "--install",
            chart.name.as_str(),
            chart_ref.as_str(),
            "-n",
            chart.namespace.as_str(),
            "--create-namespace",
            // JSON is valid YAML
            "-f",
            "-",
        ];
        if !chart.version.is_empty() {
            args.extend(["--version", chart.version.as_str()]);
        }

        info!(release = %chart.name, chart = %chart_ref, version = %chart.version, "installing chart");
        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| Error::install(&chart.name, "helm", format!("failed to run helm: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            stdin
                .write_all(values.as_bytes())
                .await
                .map_err(|e| Error::install(&chart.name, "helm", e.to_string()))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::install(&chart.name, "helm", e.to_string()))?;
        if !output.status.success() {
            return Err(Error::install(
                &chart.name,
                "helm",
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Ok(Release {
            name: chart.name.clone(),
            namespace: chart.namespace.clone(),
            status: STATUS_DEPLOYED.to_string(),
            chart_version: chart.version.clone(),
            values: serde_json::to_value(&chart.values)?,
        })
    }

    async fn init_repo(&self, repo: &RepoEntry) -> Result<(), Error> {
        let mut args = vec![
            "repo",
            "add",
            repo.name.as_str(),
            repo.url.as_str(),
            "--force-update",
        ];
        if let (Some(user), Some(pass)) = (&repo.username, &repo.password) {
            args.extend(["--username", user.as_str(), "--password", pass.as_str()]);
        }
        self.run(&repo.name, &args).await?;
        info!(repo = %repo.name, url = %repo.url, "chart repository registered");
        Ok(())
    }

    async fn uninstall(&self, chart: &HelmRef) -> Result<(), Error> {
        // failed and pending releases still hold resources
        let Some(found) = self.listed(chart).await? else {
            debug!(release = %chart.name, "release already absent");
            return Ok(());
        };
        debug!(release = %chart.name, status = %found.status, "uninstalling release");
        self.run(
            &chart.name,
            &[
                "uninstall",
                chart.name.as_str(),
                "-n",
                chart.namespace.as_str(),
                "--wait",
            ],
        )
        .await?;
        info!(release = %chart.name, namespace = %chart.namespace, "release uninstalled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chart_version_from_list_output() {
        assert_eq!(chart_version("vcluster-0.16.4", "vcluster"), "0.16.4");
        assert_eq!(chart_version("agent-0.4.1", "agent"), "0.4.1");
        assert_eq!(chart_version("nochart", "nochart"), "");
    }

    #[test]
    fn chart_version_keeps_prerelease_suffix() {
        assert_eq!(chart_version("agent-0.4.1-rc.1", "agent"), "0.4.1-rc.1");
        assert_eq!(
            chart_version("my-chart-1.0.0-beta.2", "oci://ghcr.io/acme/my-chart"),
            "1.0.0-beta.2"
        );
        // listed name differs from the configured one
        assert_eq!(chart_version("my-chart-1.0.0-beta.2", "other"), "1.0.0-beta.2");
    }

    #[test]
    fn list_output_parses() {
        let listed: Vec<ListedRelease> = serde_json::from_str(
            r#"[{"name":"acme","namespace":"acme","revision":"3","updated":"2024-01-02",
                 "status":"deployed","chart":"vcluster-0.16.4","app_version":"0.16.4"}]"#,
        )
        .unwrap();
        assert_eq!(listed[0].name, "acme");
        assert_eq!(listed[0].status, STATUS_DEPLOYED);
    }

    /// Shell script standing in for helm: logs its arguments and lists one
    /// release in the given status
    #[cfg(unix)]
    fn fake_helm(dir: &std::path::Path, status: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let log = dir.join("calls.log");
        let script = dir.join("helm");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\n\
                 echo \"$@\" >> {log}\n\
                 case \"$1\" in\n\
                 list) echo '[{{\"name\":\"agent\",\"namespace\":\"spaceport-system\",\"status\":\"{status}\",\"chart\":\"agent-0.4.1-rc.1\"}}]' ;;\n\
                 get) echo '{{\"replicas\":1}}' ;;\n\
                 esac\n",
                log = log.display(),
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script.display().to_string()
    }

    #[cfg(unix)]
    fn agent_chart() -> HelmRef {
        HelmRef {
            repo: "oci://ghcr.io/spaceport-dev/agent/helm".to_string(),
            chart: "agent".to_string(),
            version: "0.4.1-rc.1".to_string(),
            namespace: "spaceport-system".to_string(),
            name: "agent".to_string(),
            ..Default::default()
        }
    }

    /// Story: a release stuck in `failed` is invisible to drift checks but
    /// still removed on teardown
    #[cfg(unix)]
    #[tokio::test]
    async fn story_failed_release_is_still_uninstalled() {
        let dir = tempfile::tempdir().unwrap();
        let installer = HelmCliInstaller::with_binary(fake_helm(dir.path(), "failed"));
        let chart = agent_chart();

        assert_eq!(installer.exists(&chart).await.unwrap(), None);
        installer.uninstall(&chart).await.unwrap();

        let calls = std::fs::read_to_string(dir.path().join("calls.log")).unwrap();
        assert!(
            calls
                .lines()
                .any(|l| l == "uninstall agent -n spaceport-system --wait"),
            "uninstall not issued: {calls}"
        );
    }

    /// Story: a deployed pre-release chart reports its full version
    #[cfg(unix)]
    #[tokio::test]
    async fn story_deployed_prerelease_matches_configured_version() {
        let dir = tempfile::tempdir().unwrap();
        let installer = HelmCliInstaller::with_binary(fake_helm(dir.path(), STATUS_DEPLOYED));
        let chart = agent_chart();

        let release = installer.exists(&chart).await.unwrap().unwrap();
        assert_eq!(release.chart_version, chart.version);
        assert_eq!(release.values, serde_json::json!({ "replicas": 1 }));
    }

    #[tokio::test]
    async fn missing_binary_is_an_install_error() {
        let installer = HelmCliInstaller::with_binary("/nonexistent/helm");
        let chart = HelmRef {
            chart: "vcluster".to_string(),
            namespace: "acme".to_string(),
            name: "acme".to_string(),
            ..Default::default()
        };
        match installer.exists(&chart).await {
            Err(Error::Install { release, retryable, .. }) => {
                assert_eq!(release, "acme");
                assert!(retryable);
            }
            other => panic!("expected install error, got {other:?}"),
        }
    }
}
