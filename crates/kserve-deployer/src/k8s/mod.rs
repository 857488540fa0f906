//! Orchestrator access.
//!
//! [`Orchestrator`] is the narrow set of cluster operations the core needs:
//! namespaced custom-resource CRUD, pod listing and pod log reads.
//! [`KubeOrchestrator`] implements it against a real API server.

use async_trait::async_trait;
use kube::discovery::ApiResource;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::OrchestratorError;

mod client;
#[cfg(test)]
pub(crate) mod fake;
mod resources;

pub use client::KubeOrchestrator;
pub use resources::{JobPhase, ReadyState, ServiceStatusSnapshot, TrainingJob, TrainingJobRef};

/// Group/version/kind/plural of a custom resource.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
}

impl ResourceKind {
    /// Kubeflow training operator `PyTorchJob`.
    pub fn pytorch_job() -> Self {
        Self {
            group: "kubeflow.org".to_string(),
            version: "v1".to_string(),
            kind: "PyTorchJob".to_string(),
            plural: "pytorchjobs".to_string(),
        }
    }

    /// KServe `InferenceService`.
    pub fn inference_service() -> Self {
        Self {
            group: "serving.kserve.io".to_string(),
            version: "v1beta1".to_string(),
            kind: "InferenceService".to_string(),
            plural: "inferenceservices".to_string(),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version: self.api_version(),
            kind: self.kind.clone(),
            plural: self.plural.clone(),
        }
    }
}

/// A pod and the container whose logs should be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    pub name: String,
    /// `None` lets the API server pick (single-container pods)
    pub container: Option<String>,
}

impl PodInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            container: None,
        }
    }
}

/// Cluster operations consumed by the deployer core.
///
/// Calls are not retried; the background loops poll again on their next tick.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// List custom resources of `kind` in `namespace` as raw JSON objects.
    async fn list_custom_resources(
        &self,
        kind: &ResourceKind,
        namespace: &str,
    ) -> Result<Vec<Value>, OrchestratorError>;

    /// Fetch one custom resource.
    async fn get_custom_resource(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Value, OrchestratorError>;

    /// Create a custom resource from a complete body. Never updates.
    async fn create_custom_resource(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        body: &Value,
    ) -> Result<Value, OrchestratorError>;

    /// Delete a custom resource.
    async fn delete_custom_resource(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), OrchestratorError>;

    /// List pods, optionally filtered by a label selector.
    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<PodInfo>, OrchestratorError>;

    /// Read a pod's log, optionally only the trailing `since_seconds`.
    async fn read_pod_logs(
        &self,
        namespace: &str,
        pod: &PodInfo,
        since_seconds: Option<i64>,
        timestamps: bool,
    ) -> Result<String, OrchestratorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inference_service_api_resource() {
        let ar = ResourceKind::inference_service().api_resource();
        assert_eq!(ar.group, "serving.kserve.io");
        assert_eq!(ar.api_version, "serving.kserve.io/v1beta1");
        assert_eq!(ar.kind, "InferenceService");
        assert_eq!(ar.plural, "inferenceservices");
    }

    #[test]
    fn core_group_api_version() {
        let kind = ResourceKind {
            group: String::new(),
            version: "v1".into(),
            kind: "ConfigMap".into(),
            plural: "configmaps".into(),
        };
        assert_eq!(kind.api_version(), "v1");
    }
}
