//! Error types for spaceport
//!
//! Errors are structured with fields to aid debugging in production.
//! The variants follow the reconciler failure taxonomy: expected absence
//! (not-found) and conflicts come from the `Kube` variant and are
//! distinguished with [`Error::is_not_found`] and [`Error::is_conflict`],
//! while configuration errors are never retried.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for spaceport operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for CRD specs (fatal until the spec changes)
    #[error("validation error for {project}: {message}")]
    Validation {
        /// Name of the project (or host) with invalid configuration
        project: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.kubernetesVersion")
        field: Option<String>,
    },

    /// Package installation or add-on provider error
    #[error("install error [{provider}] for {release}: {message}")]
    Install {
        /// Release or add-on being installed
        release: String,
        /// Provider kind (helm, terraform, ...)
        provider: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Template rendering error
    #[error("template error [{template}]: {message}")]
    Template {
        /// Template name
        template: String,
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "installer")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            project: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with project context
    pub fn validation_for(project: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            project: project.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with project context and field path
    pub fn validation_for_field(
        project: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            project: project.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a retryable install error
    pub fn install(
        release: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Install {
            release: release.into(),
            provider: provider.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable install error (e.g., unsupported provider)
    pub fn install_permanent(
        release: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Install {
            release: release.into(),
            provider: provider.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a template rendering error
    pub fn template(template: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Template {
            template: template.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True if this is a Kubernetes 404
    ///
    /// Not-found drives state machine progression and is never a failure
    /// on its own.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// True if this is an optimistic-concurrency conflict (HTTP 409)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// Check if this error is retryable
    ///
    /// Validation, serialization and template errors require a spec or
    /// configuration change. Conflicts are always retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                if self.is_conflict() {
                    return true;
                }
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::Validation { .. } => false,
            Error::Install { retryable, .. } => *retryable,
            Error::Serialization { .. } => false,
            Error::Template { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the project name if this error is associated with one
    pub fn project(&self) -> Option<&str> {
        match self {
            Error::Validation { project, .. } => Some(project),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::from(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    // ==========================================================================
    // Story Tests: Error taxonomy drives reconciler control flow
    // ==========================================================================

    /// Story: a missing namespace or secret is an expected signal, not a failure
    #[test]
    fn story_not_found_is_distinguished() {
        let err = api_error(404);
        assert!(err.is_not_found());
        assert!(!err.is_conflict());
        // 4xx other than conflict is not retried blindly
        assert!(!err.is_retryable());
    }

    /// Story: a stale write is retried after re-fetching
    #[test]
    fn story_conflict_is_retryable() {
        let err = api_error(409);
        assert!(err.is_conflict());
        assert!(err.is_retryable());
    }

    /// Story: server errors and timeouts are transient
    #[test]
    fn story_server_errors_are_transient() {
        assert!(api_error(500).is_retryable());
        assert!(api_error(503).is_retryable());
    }

    /// Story: a project asking for an unknown Kubernetes version is fatal
    #[test]
    fn story_validation_is_fatal() {
        let err = Error::validation_for_field(
            "acme",
            "spec.kubernetesVersion",
            "unsupported version 1.19.0",
        );
        assert!(!err.is_retryable());
        assert_eq!(err.project(), Some("acme"));
        assert!(err.to_string().contains("acme"));
        match &err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.kubernetesVersion"))
            }
            _ => panic!("Expected Validation variant"),
        }
    }

    /// Story: unsupported add-on providers are reported once, not retried forever
    #[test]
    fn story_install_errors_carry_retry_hint() {
        let transient = Error::install("vcluster", "helm", "helm exited with status 1");
        assert!(transient.is_retryable());
        assert!(transient.to_string().contains("[helm]"));

        let permanent = Error::install_permanent("db", "terraform", "not supported");
        assert!(!permanent.is_retryable());
    }

    #[test]
    fn serde_errors_convert_to_serialization() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn template_and_internal_errors_display_context() {
        let err = Error::template("vcluster-values", "undefined variable");
        assert!(err.to_string().contains("vcluster-values"));

        let err = Error::internal_with_context("installer", "helm binary missing");
        assert!(err.to_string().contains("installer"));
        assert!(err.is_retryable());
    }
}
