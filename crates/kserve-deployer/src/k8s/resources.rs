//! Typed views over the parts of orchestrator resources the deployer reads.
//!
//! Resources arrive as loosely-typed JSON. Only the consumed subset is
//! modelled and every field is optional: a missing or malformed field yields
//! an absent value instead of a parse failure.

use k8s_openapi::api::core::v1::PodTemplateSpec;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

/// Coarse lifecycle phase of a training job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobPhase {
    Running,
    Completed,
    Other,
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "Running"),
            Self::Completed => write!(f, "Completed"),
            Self::Other => write!(f, "Other"),
        }
    }
}

/// Tri-state `Ready` condition value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReadyState {
    True,
    False,
    #[default]
    Unknown,
}

impl ReadyState {
    fn parse(status: &str) -> Self {
        match status {
            "True" => Self::True,
            "False" => Self::False,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for ReadyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Metadata {
    name: Option<String>,
    namespace: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Condition {
    #[serde(rename = "type")]
    type_: String,
    status: String,
    reason: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ResourceStatus {
    conditions: Vec<Condition>,
    url: Option<String>,
}

fn metadata(resource: &Value) -> Metadata {
    resource
        .get("metadata")
        .and_then(|m| Metadata::deserialize(m).ok())
        .unwrap_or_default()
}

fn status(resource: &Value) -> ResourceStatus {
    resource
        .get("status")
        .and_then(|s| ResourceStatus::deserialize(s).ok())
        .unwrap_or_default()
}

/// Phase from the most recent condition whose status is `True`.
fn job_phase(status: &ResourceStatus) -> JobPhase {
    match status
        .conditions
        .iter()
        .rev()
        .find(|c| c.status == "True")
        .map(|c| c.type_.as_str())
    {
        Some("Running") => JobPhase::Running,
        Some("Succeeded" | "Complete") => JobPhase::Completed,
        _ => JobPhase::Other,
    }
}

/// Listing projection of a training job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingJobRef {
    pub name: String,
    pub namespace: String,
    pub status_phase: JobPhase,
}

impl TrainingJobRef {
    /// Project a listed resource. Entries without a name are skipped.
    pub fn from_value(resource: &Value, default_namespace: &str) -> Option<Self> {
        let meta = metadata(resource);
        Some(Self {
            name: meta.name?,
            namespace: meta.namespace.unwrap_or_else(|| default_namespace.to_string()),
            status_phase: job_phase(&status(resource)),
        })
    }
}

/// A training job with its pod templates.
#[derive(Debug, Clone)]
pub struct TrainingJob {
    pub name: String,
    pub namespace: String,
    pub phase: JobPhase,
    /// `(replica type, template)` sorted by replica type. Batch-style jobs with a
    /// single `spec.template` use the replica name `template`.
    pub templates: Vec<(String, PodTemplateSpec)>,
}

impl TrainingJob {
    pub fn from_value(resource: &Value) -> Self {
        let meta = metadata(resource);
        let name = meta.name.unwrap_or_default();
        let spec = resource.get("spec");

        let mut templates = Vec::new();
        if let Some(Value::Object(fields)) = spec {
            for (key, replica_specs) in fields.iter().filter(|(k, _)| k.ends_with("ReplicaSpecs")) {
                let Value::Object(replicas) = replica_specs else {
                    warn!(job = %name, field = %key, "Replica specs field is not an object");
                    continue;
                };
                for (replica, replica_spec) in replicas {
                    if let Some(template) = parse_template(&name, replica, replica_spec.get("template")) {
                        templates.push((replica.clone(), template));
                    }
                }
            }

            if templates.is_empty() {
                if let Some(template) = parse_template(&name, "template", fields.get("template")) {
                    templates.push(("template".to_string(), template));
                }
            }
        }

        Self {
            name,
            namespace: meta.namespace.unwrap_or_default(),
            phase: job_phase(&status(resource)),
            templates,
        }
    }
}

fn parse_template(job: &str, replica: &str, raw: Option<&Value>) -> Option<PodTemplateSpec> {
    let raw = raw?;
    match PodTemplateSpec::deserialize(raw) {
        Ok(template) => Some(template),
        Err(e) => {
            warn!(job = %job, replica = %replica, error = %e, "Skipping unparsable pod template");
            None
        }
    }
}

/// Comparable view of an InferenceService's readiness.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceStatusSnapshot {
    pub ready: ReadyState,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub url: Option<String>,
    pub condition_count: usize,
}

impl ServiceStatusSnapshot {
    pub fn from_resource(resource: &Value) -> Self {
        let status = status(resource);
        let ready = status.conditions.iter().find(|c| c.type_ == "Ready");

        Self {
            ready: ready.map_or(ReadyState::Unknown, |c| ReadyState::parse(&c.status)),
            reason: ready.and_then(|c| c.reason.clone()),
            message: ready.and_then(|c| c.message.clone()),
            url: status.url,
            condition_count: status.conditions.len(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready == ReadyState::True
    }
}
