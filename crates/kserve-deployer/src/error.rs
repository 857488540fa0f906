//! Error types for orchestrator access, path resolution and deployment.

use thiserror::Error;

/// Errors returned by [`crate::k8s::Orchestrator`] implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    /// The API server rejected the bearer token (401).
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The credentials lack RBAC permissions for the request (403).
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Listing returned 404, usually because the CRD is not installed.
    #[error("resource kind {kind} is not served by the cluster (is the CRD installed?)")]
    ResourceKindUnsupported { kind: String },

    /// A named resource does not exist (404 on get/delete).
    #[error("{kind} '{name}' not found")]
    ResourceNotFound { kind: String, name: String },

    /// Create was rejected as a conflict or an invalid spec (400/409/422).
    #[error("request rejected by the API server: {0}")]
    ValidationRejected(String),

    /// Connection-level failure: DNS, TLS, timeout, refused connection.
    #[error("API server unreachable: {0}")]
    TransportUnreachable(String),

    /// Any other non-success status.
    #[error("API error {code}: {message}")]
    Api { code: u16, message: String },

    /// The response body could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl OrchestratorError {
    /// Whether the error means the requested resource is gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ResourceNotFound { .. })
    }

    /// Errors that will not go away by polling again.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed(_)
                | Self::AccessDenied(_)
                | Self::ResourceKindUnsupported { .. }
        )
    }
}

/// Failures while mapping a checkpoint path to something the serving runtime can load.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("training job '{job}' declares no volume backed by a PersistentVolumeClaim")]
    NoPvcFound { job: String },

    #[error("PVC '{claim}' (volume '{volume}') of training job '{job}' is not mounted by any container")]
    PvcNotMounted {
        job: String,
        volume: String,
        claim: String,
    },

    #[error("checkpoint '{checkpoint}' is not under the training job's mount path '{mount_path}'")]
    PathMismatch {
        checkpoint: String,
        mount_path: String,
    },

    #[error("checkpoint '{checkpoint}' is the mount root '{mount_path}' itself; select a checkpoint directory below it")]
    EmptyRelativePath {
        checkpoint: String,
        mount_path: String,
    },

    #[error("checkpoint path '{0}' is not absolute")]
    NotAbsolute(String),
}

/// Failures of a one-shot log scan.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("no pods found for training job '{job}'")]
    NoPods { job: String },

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

/// Terminal result of a deploy or delete action.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeployError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("could not read training job '{job}': {source}")]
    JobUnavailable {
        job: String,
        #[source]
        source: OrchestratorError,
    },

    #[error("'{0}' is not a valid resource name (lowercase alphanumerics and '-', max 63 chars)")]
    InvalidServiceName(String),

    #[error("InferenceService rejected: {0}")]
    OrchestratorRejected(String),

    #[error("could not reach the orchestrator: {0}")]
    OrchestratorUnreachable(String),
}

impl From<OrchestratorError> for DeployError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::AuthenticationFailed(_)
            | OrchestratorError::AccessDenied(_)
            | OrchestratorError::TransportUnreachable(_) => {
                Self::OrchestratorUnreachable(err.to_string())
            }
            other => Self::OrchestratorRejected(other.to_string()),
        }
    }
}

/// Configuration loading and validation failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
