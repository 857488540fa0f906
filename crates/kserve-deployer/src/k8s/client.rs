//! [`Orchestrator`] backed by a `kube` client.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, DynamicObject, ListParams, LogParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{Orchestrator, PodInfo, ResourceKind};
use crate::config::ClusterConfig;
use crate::error::OrchestratorError;

const DEFAULT_CONTAINER_ANNOTATION: &str = "kubectl.kubernetes.io/default-container";

#[derive(Debug, Clone, Copy)]
enum Operation {
    List,
    Get,
    Create,
    Delete,
}

/// Kubernetes-backed orchestrator.
#[derive(Clone)]
pub struct KubeOrchestrator {
    client: Client,
}

impl KubeOrchestrator {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect with explicit credentials, or the ambient kubeconfig /
    /// in-cluster environment when no API server is configured.
    pub async fn connect(cluster: &ClusterConfig, namespace: &str) -> Result<Self, OrchestratorError> {
        let mut config = match &cluster.api_server {
            Some(server) => {
                info!(server = %server, "Connecting with explicit API server credentials");
                let kubeconfig = explicit_kubeconfig(
                    server,
                    cluster.token.as_deref(),
                    cluster.insecure_skip_tls_verify,
                    namespace,
                )?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| OrchestratorError::TransportUnreachable(format!("invalid cluster configuration: {e}")))?
            }
            None => {
                debug!("Inferring cluster configuration");
                Config::infer()
                    .await
                    .map_err(|e| OrchestratorError::TransportUnreachable(format!("no cluster configuration found: {e}")))?
            }
        };

        let timeout = cluster.request_timeout();
        config.connect_timeout = Some(timeout);
        config.read_timeout = Some(timeout);

        let client = Client::try_from(config)
            .map_err(|e| OrchestratorError::TransportUnreachable(format!("failed to build client: {e}")))?;
        Ok(Self { client })
    }

    fn dynamic_api(&self, kind: &ResourceKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &kind.api_resource())
    }
}

fn explicit_kubeconfig(
    server: &str,
    token: Option<&str>,
    insecure_skip_tls_verify: bool,
    namespace: &str,
) -> Result<Kubeconfig, OrchestratorError> {
    let user = match token {
        Some(token) => json!({ "token": token }),
        None => json!({}),
    };
    let raw = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": "target",
            "cluster": {
                "server": server,
                "insecure-skip-tls-verify": insecure_skip_tls_verify,
            }
        }],
        "users": [{ "name": "kserve-deployer", "user": user }],
        "contexts": [{
            "name": "target",
            "context": {
                "cluster": "target",
                "user": "kserve-deployer",
                "namespace": namespace,
            }
        }],
        "current-context": "target",
    });
    serde_json::from_value(raw)
        .map_err(|e| OrchestratorError::Malformed(format!("failed to build kubeconfig: {e}")))
}

fn classify(err: kube::Error, op: Operation, kind: &str, name: &str) -> OrchestratorError {
    match err {
        kube::Error::Api(response) => match response.code {
            401 => OrchestratorError::AuthenticationFailed(response.message),
            403 => OrchestratorError::AccessDenied(response.message),
            404 => match op {
                // A 404 on a collection means the kind itself is not served.
                Operation::List | Operation::Create => OrchestratorError::ResourceKindUnsupported {
                    kind: kind.to_string(),
                },
                Operation::Get | Operation::Delete => {
                    OrchestratorError::ResourceNotFound {
                        kind: kind.to_string(),
                        name: name.to_string(),
                    }
                }
            },
            400 | 409 | 422 => OrchestratorError::ValidationRejected(response.message),
            code => OrchestratorError::Api {
                code,
                message: response.message,
            },
        },
        kube::Error::SerdeError(e) => OrchestratorError::Malformed(e.to_string()),
        other => OrchestratorError::TransportUnreachable(other.to_string()),
    }
}

fn to_value(object: &DynamicObject) -> Result<Value, OrchestratorError> {
    serde_json::to_value(object).map_err(|e| OrchestratorError::Malformed(e.to_string()))
}

fn log_container(pod: &Pod) -> Option<String> {
    if let Some(container) = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(DEFAULT_CONTAINER_ANNOTATION))
    {
        return Some(container.clone());
    }
    let containers = &pod.spec.as_ref()?.containers;
    if containers.len() > 1 {
        containers.first().map(|c| c.name.clone())
    } else {
        None
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn list_custom_resources(
        &self,
        kind: &ResourceKind,
        namespace: &str,
    ) -> Result<Vec<Value>, OrchestratorError> {
        let list = self
            .dynamic_api(kind, namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| classify(e, Operation::List, &kind.kind, ""))?;
        list.items.iter().map(to_value).collect()
    }

    async fn get_custom_resource(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Value, OrchestratorError> {
        let object = self
            .dynamic_api(kind, namespace)
            .get(name)
            .await
            .map_err(|e| classify(e, Operation::Get, &kind.kind, name))?;
        to_value(&object)
    }

    async fn create_custom_resource(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        body: &Value,
    ) -> Result<Value, OrchestratorError> {
        let object: DynamicObject = serde_json::from_value(body.clone())
            .map_err(|e| OrchestratorError::Malformed(format!("invalid {} body: {e}", kind.kind)))?;
        let name = object.metadata.name.clone().unwrap_or_default();
        let created = self
            .dynamic_api(kind, namespace)
            .create(&PostParams::default(), &object)
            .await
            .map_err(|e| classify(e, Operation::Create, &kind.kind, &name))?;
        to_value(&created)
    }

    async fn delete_custom_resource(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), OrchestratorError> {
        self.dynamic_api(kind, namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| classify(e, Operation::Delete, &kind.kind, name))?;
        Ok(())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<PodInfo>, OrchestratorError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let list = pods
            .list(&params)
            .await
            .map_err(|e| classify(e, Operation::List, "Pod", ""))?;

        Ok(list
            .items
            .iter()
            .filter_map(|pod| {
                let name = pod.metadata.name.clone()?;
                Some(PodInfo {
                    name,
                    container: log_container(pod),
                })
            })
            .collect())
    }

    async fn read_pod_logs(
        &self,
        namespace: &str,
        pod: &PodInfo,
        since_seconds: Option<i64>,
        timestamps: bool,
    ) -> Result<String, OrchestratorError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            container: pod.container.clone(),
            since_seconds,
            timestamps,
            ..LogParams::default()
        };
        pods.logs(&pod.name, &params)
            .await
            .map_err(|e| classify(e, Operation::Get, "Pod", &pod.name))
    }
}
