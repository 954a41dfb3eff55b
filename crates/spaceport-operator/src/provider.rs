//! Add-on providers
//!
//! Every way of installing an add-on is a variant of [`AddonProvider`] with
//! its own parameters. Only Helm is backed by an engine today; the other
//! variants fail with a permanent install error so a misconfigured add-on
//! surfaces in status instead of being retried forever.

use serde::{Deserialize, Serialize};
use spaceport_common::crd::HelmRef;
use spaceport_common::Error;

use crate::installer::{PackageInstaller, Release};

/// How an add-on gets installed
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum AddonProvider {
    /// Helm chart release
    Helm(HelmRef),
    /// Terraform module
    Terraform {
        /// Directory holding the module
        working_directory: String,
        /// Terraform version
        version: String,
    },
    /// Raw manifest
    Raw {
        /// Manifest YAML
        manifest: String,
    },
    /// Manifest fetched from a URL
    Url {
        /// Manifest location
        url: String,
    },
    /// Shell script
    Shell {
        /// Script body
        script: String,
    },
    /// Kustomize overlay
    Kustomize {
        /// Overlay path
        path: String,
    },
}

impl AddonProvider {
    /// Provider kind name
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Helm(_) => "helm",
            Self::Terraform { .. } => "terraform",
            Self::Raw { .. } => "raw",
            Self::Url { .. } => "url",
            Self::Shell { .. } => "shell",
            Self::Kustomize { .. } => "kustomize",
        }
    }

    /// Install the add-on named `name`.
    ///
    /// Returns the release for engines that produce one.
    pub async fn install(
        &self,
        name: &str,
        helm: &dyn PackageInstaller,
    ) -> Result<Option<Release>, Error> {
        match self {
            Self::Helm(chart) => {
                if let Some(release) = helm.exists(chart).await? {
                    return Ok(Some(release));
                }
                helm.ensure(chart).await.map(Some)
            }
            Self::Terraform { .. }
            | Self::Raw { .. }
            | Self::Url { .. }
            | Self::Shell { .. }
            | Self::Kustomize { .. } => Err(self.unsupported(name)),
        }
    }

    /// Uninstall the add-on named `name`
    pub async fn uninstall(&self, name: &str, helm: &dyn PackageInstaller) -> Result<(), Error> {
        match self {
            Self::Helm(chart) => helm.uninstall(chart).await,
            Self::Terraform { .. }
            | Self::Raw { .. }
            | Self::Url { .. }
            | Self::Shell { .. }
            | Self::Kustomize { .. } => Err(self.unsupported(name)),
        }
    }

    fn unsupported(&self, name: &str) -> Error {
        Error::install_permanent(
            name,
            self.kind(),
            format!("{} provider is not supported", self.kind()),
        )
    }
}
