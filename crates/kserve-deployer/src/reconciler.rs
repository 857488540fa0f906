//! InferenceService creation, deletion and listing.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::InferenceServiceConfig;
use crate::error::{DeployError, OrchestratorError};
use crate::k8s::{Orchestrator, ResourceKind, ServiceStatusSnapshot, TrainingJob, TrainingJobRef};
use crate::naming::{is_valid_name, sanitize};
use crate::resolver::resolve_volume_mount;

const DEPLOYMENT_MODE_ANNOTATION: &str = "serving.kserve.io/deploymentMode";
const PASSTHROUGH_ANNOTATION: &str = "serving.knative.openshift.io/enablePassthrough";
const SIDECAR_INJECT_ANNOTATION: &str = "sidecar.istio.io/inject";
const PROBE_REWRITE_ANNOTATION: &str = "sidecar.istio.io/rewriteAppHTTPProbers";

/// Everything needed to render one InferenceService body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceServiceSpec {
    pub name: String,
    pub namespace: String,
    pub model_format: String,
    pub runtime: String,
    pub storage_uri: String,
    pub resource_requests: BTreeMap<String, String>,
    pub resource_limits: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl InferenceServiceSpec {
    /// Spec for `storage_uri` under the static serving policy.
    pub fn new(
        name: &str,
        namespace: &str,
        storage_uri: &str,
        policy: &InferenceServiceConfig,
    ) -> Self {
        let flag = |on: bool| on.to_string();
        let annotations = BTreeMap::from([
            (DEPLOYMENT_MODE_ANNOTATION.to_string(), policy.deployment_mode.clone()),
            (PASSTHROUGH_ANNOTATION.to_string(), flag(policy.enable_passthrough)),
            (SIDECAR_INJECT_ANNOTATION.to_string(), flag(policy.inject_sidecar)),
            (PROBE_REWRITE_ANNOTATION.to_string(), flag(policy.rewrite_probes)),
        ]);

        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            model_format: policy.model_format.clone(),
            runtime: policy.runtime.clone(),
            storage_uri: storage_uri.to_string(),
            resource_requests: policy.resources.requests.clone(),
            resource_limits: policy.resources.limits.clone(),
            annotations,
        }
    }

    /// Render the resource body.
    pub fn to_resource(&self, kind: &ResourceKind) -> Value {
        json!({
            "apiVersion": kind.api_version(),
            "kind": kind.kind,
            "metadata": {
                "name": self.name,
                "namespace": self.namespace,
                "annotations": self.annotations,
            },
            "spec": {
                "predictor": {
                    "model": {
                        "modelFormat": { "name": self.model_format },
                        "runtime": self.runtime,
                        "storageUri": self.storage_uri,
                        "resources": {
                            "requests": self.resource_requests,
                            "limits": self.resource_limits,
                        }
                    }
                }
            }
        })
    }
}

/// A successfully submitted InferenceService.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployedService {
    pub name: String,
    pub namespace: String,
    pub storage_uri: String,
}

/// An existing InferenceService and its readiness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSummary {
    pub name: String,
    pub status: ServiceStatusSnapshot,
}

/// Creates InferenceServices for checkpoints of training jobs.
///
/// Creation never updates: deploying over an existing name is rejected by the
/// API server and surfaces as [`DeployError::OrchestratorRejected`].
#[derive(Clone)]
pub struct ServiceReconciler {
    orchestrator: Arc<dyn Orchestrator>,
    training_kind: ResourceKind,
    policy: InferenceServiceConfig,
}

impl ServiceReconciler {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        training_kind: ResourceKind,
        policy: InferenceServiceConfig,
    ) -> Self {
        Self {
            orchestrator,
            training_kind,
            policy,
        }
    }

    /// Service name to use: `explicit` if given and legal, otherwise derived
    /// from the checkpoint path.
    pub fn service_name(checkpoint: &str, explicit: Option<&str>) -> Result<String, DeployError> {
        match explicit {
            Some(name) if is_valid_name(name) => Ok(name.to_string()),
            Some(name) => Err(DeployError::InvalidServiceName(name.to_string())),
            None => Ok(sanitize(checkpoint)),
        }
    }

    /// Build the storage URI for `checkpoint` from the PVC mounted by `job`.
    pub async fn storage_uri(&self, checkpoint: &str, job: &TrainingJobRef) -> Result<String, DeployError> {
        let raw = self
            .orchestrator
            .get_custom_resource(&self.training_kind, &job.namespace, &job.name)
            .await
            .map_err(|source| DeployError::JobUnavailable {
                job: job.name.clone(),
                source,
            })?;

        let mount = resolve_volume_mount(&TrainingJob::from_value(&raw))?;
        Ok(mount.storage_uri(checkpoint)?)
    }

    /// Create an InferenceService serving `checkpoint`.
    pub async fn deploy(
        &self,
        checkpoint: &str,
        service_name: Option<&str>,
        namespace: &str,
        job: &TrainingJobRef,
    ) -> Result<DeployedService, DeployError> {
        let name = Self::service_name(checkpoint, service_name)?;
        let storage_uri = self.storage_uri(checkpoint, job).await?;

        let spec = InferenceServiceSpec::new(&name, namespace, &storage_uri, &self.policy);
        let body = spec.to_resource(&self.policy.kind);

        info!(service = %name, namespace = %namespace, storage_uri = %storage_uri, "Creating InferenceService");
        self.orchestrator
            .create_custom_resource(&self.policy.kind, namespace, &body)
            .await
            .map_err(|e| {
                warn!(service = %name, error = %e, "InferenceService creation failed");
                DeployError::from(e)
            })?;

        Ok(DeployedService {
            name,
            namespace: namespace.to_string(),
            storage_uri,
        })
    }

    pub async fn delete(&self, name: &str, namespace: &str) -> Result<(), OrchestratorError> {
        self.orchestrator
            .delete_custom_resource(&self.policy.kind, namespace, name)
            .await?;
        info!(service = %name, namespace = %namespace, "Deleted InferenceService");
        Ok(())
    }

    /// Existing services sorted by name.
    pub async fn list(&self, namespace: &str) -> Result<Vec<ServiceSummary>, OrchestratorError> {
        let items = self
            .orchestrator
            .list_custom_resources(&self.policy.kind, namespace)
            .await?;

        let mut services: Vec<ServiceSummary> = items
            .iter()
            .filter_map(|item| {
                let name = item.pointer("/metadata/name")?.as_str()?.to_string();
                Some(ServiceSummary {
                    name,
                    status: ServiceStatusSnapshot::from_resource(item),
                })
            })
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(services)
    }
}
