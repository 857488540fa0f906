//! Deployer configuration.
//!
//! Every field has a default so an empty (or absent) file is a valid config.
//! CLI flags override file values after loading.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::k8s::ResourceKind;
use crate::resolver::RewriteTable;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeployerConfig {
    /// API server connection
    pub cluster: ClusterConfig,

    /// Namespace for training jobs, pods and inference services
    pub namespace: String,

    /// Training job resource kind
    pub training_job: TrainingJobConfig,

    /// InferenceService resource body policy
    pub inference_service: InferenceServiceConfig,

    /// Pod discovery for a training job
    pub discovery: DiscoveryConfig,

    /// Log monitor cadence
    pub monitor: MonitorConfig,

    /// Service watcher cadence
    pub watcher: WatcherConfig,

    /// Ordered prefix rewrites from training paths to deployment paths
    pub path_rewrites: Vec<PathRewrite>,
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            cluster: ClusterConfig::default(),
            namespace: "default".to_string(),
            training_job: TrainingJobConfig::default(),
            inference_service: InferenceServiceConfig::default(),
            discovery: DiscoveryConfig::default(),
            monitor: MonitorConfig::default(),
            watcher: WatcherConfig::default(),
            path_rewrites: Vec::new(),
        }
    }
}

/// API server connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterConfig {
    /// API server URL, e.g. `https://kubernetes.default.svc`. `None` uses the ambient kubeconfig.
    pub api_server: Option<String>,

    /// Bearer token
    #[serde(skip_serializing)]
    pub token: Option<String>,

    /// Skip TLS verification. Must be set explicitly.
    pub insecure_skip_tls_verify: bool,

    /// Per-request transport timeout
    pub request_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            api_server: None,
            token: None,
            insecure_skip_tls_verify: false,
            request_timeout_secs: 30,
        }
    }
}

impl ClusterConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Training job kind
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TrainingJobConfig {
    pub kind: ResourceKind,
}

impl Default for TrainingJobConfig {
    fn default() -> Self {
        Self {
            kind: ResourceKind::pytorch_job(),
        }
    }
}

/// Static policy applied to every InferenceService body
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InferenceServiceConfig {
    pub kind: ResourceKind,

    /// Value of `serving.kserve.io/deploymentMode`
    pub deployment_mode: String,

    /// `spec.predictor.model.modelFormat.name`
    pub model_format: String,

    /// `spec.predictor.model.runtime`
    pub runtime: String,

    /// `serving.knative.openshift.io/enablePassthrough`
    pub enable_passthrough: bool,

    /// `sidecar.istio.io/inject`
    pub inject_sidecar: bool,

    /// `sidecar.istio.io/rewriteAppHTTPProbers`
    pub rewrite_probes: bool,

    pub resources: ResourceProfile,
}

impl Default for InferenceServiceConfig {
    fn default() -> Self {
        Self {
            kind: ResourceKind::inference_service(),
            deployment_mode: "Serverless".to_string(),
            model_format: "pytorch".to_string(),
            runtime: "kserve-torchserve".to_string(),
            enable_passthrough: true,
            inject_sidecar: true,
            rewrite_probes: true,
            resources: ResourceProfile::default(),
        }
    }
}

/// Requests and limits for the predictor container
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ResourceProfile {
    pub requests: BTreeMap<String, String>,
    pub limits: BTreeMap<String, String>,
}

impl Default for ResourceProfile {
    fn default() -> Self {
        let quantities = |cpu: &str, memory: &str| {
            BTreeMap::from([
                ("cpu".to_string(), cpu.to_string()),
                ("memory".to_string(), memory.to_string()),
                ("nvidia.com/gpu".to_string(), "1".to_string()),
            ])
        };
        Self {
            requests: quantities("2", "8Gi"),
            limits: quantities("4", "16Gi"),
        }
    }
}

/// How pods of a training job are found
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DiscoveryConfig {
    /// Label keys tried in order as `<key>=<job name>`
    pub label_selector_keys: Vec<String>,

    /// Fall back to pod-name substring matching when no selector matches
    pub substring_fallback: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            label_selector_keys: [
                "training.kubeflow.org/job-name",
                "job-name",
                "pytorch-job-name",
                "app",
            ]
            .iter()
            .map(|s| (*s).to_string())
            .collect(),
            substring_fallback: true,
        }
    }
}

/// Log monitor cadence
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MonitorConfig {
    pub poll_interval_secs: u64,
    pub backoff_secs: u64,
    /// Trailing log window read on each poll
    pub log_window_secs: i64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            backoff_secs: 10,
            log_window_secs: 60,
        }
    }
}

/// Service watcher cadence
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WatcherConfig {
    pub poll_interval_secs: u64,
    pub backoff_secs: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            backoff_secs: 10,
        }
    }
}

/// One `from -> to` prefix rewrite
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PathRewrite {
    pub from: String,
    pub to: String,
}

impl DeployerConfig {
    /// Load configuration from a YAML file and validate it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_yaml(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from YAML text without validating it.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.trim().is_empty() {
            return Err(ConfigError::Invalid("namespace must not be empty".into()));
        }

        for (label, kind) in [
            ("trainingJob.kind", &self.training_job.kind),
            ("inferenceService.kind", &self.inference_service.kind),
        ] {
            if kind.version.is_empty() || kind.kind.is_empty() || kind.plural.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "{label} requires version, kind and plural"
                )));
            }
        }

        if self.monitor.poll_interval_secs == 0 || self.watcher.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "poll intervals must be at least one second".into(),
            ));
        }

        if self.monitor.log_window_secs <= 0 {
            return Err(ConfigError::Invalid(
                "monitor.logWindowSecs must be positive".into(),
            ));
        }

        if self.discovery.label_selector_keys.is_empty() && !self.discovery.substring_fallback {
            return Err(ConfigError::Invalid(
                "discovery needs label selector keys or the substring fallback".into(),
            ));
        }

        if let Some(rewrite) = self.path_rewrites.iter().find(|r| r.from.is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "path rewrite to '{}' has an empty 'from' prefix",
                rewrite.to
            )));
        }

        match (&self.cluster.api_server, &self.cluster.token) {
            (Some(server), _) if !(server.starts_with("https://") || server.starts_with("http://")) => {
                return Err(ConfigError::Invalid(format!(
                    "apiServer '{server}' must be an http(s) URL"
                )));
            }
            (None, Some(_)) => {
                return Err(ConfigError::Invalid(
                    "a token was given without an apiServer".into(),
                ));
            }
            _ => {}
        }

        Ok(())
    }

    /// The configured rewrite table, in declaration order.
    pub fn rewrite_table(&self) -> RewriteTable {
        RewriteTable::new(
            self.path_rewrites
                .iter()
                .map(|r| (r.from.clone(), r.to.clone())),
        )
    }
}
