//! In-memory orchestrator for unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::{Orchestrator, PodInfo, ResourceKind};
use crate::error::OrchestratorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    List,
    Get,
    Create,
    Delete,
    ListPods,
    ReadLogs,
}

#[derive(Debug, Clone)]
struct FakePod {
    info: PodInfo,
    labels: BTreeMap<String, String>,
    log: String,
}

#[derive(Debug, Default)]
struct State {
    resources: BTreeMap<(String, String, String), Value>,
    unsupported: HashSet<String>,
    pods: Vec<FakePod>,
    failures: HashMap<FakeOp, OrchestratorError>,
    created: Vec<Value>,
    log_requests: Vec<(String, Option<i64>)>,
    calls: HashMap<FakeOp, usize>,
}

#[derive(Debug, Default)]
pub struct FakeOrchestrator {
    state: Mutex<State>,
}

fn key(kind: &ResourceKind, namespace: &str, name: &str) -> (String, String, String) {
    (kind.plural.clone(), namespace.to_string(), name.to_string())
}

fn object_name(body: &Value) -> String {
    body.pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

impl FakeOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn put_resource(&self, kind: &ResourceKind, namespace: &str, body: Value) {
        let name = object_name(&body);
        self.state().resources.insert(key(kind, namespace, &name), body);
    }

    pub fn remove_resource(&self, kind: &ResourceKind, namespace: &str, name: &str) {
        self.state().resources.remove(&key(kind, namespace, name));
    }

    pub fn resource(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Option<Value> {
        self.state().resources.get(&key(kind, namespace, name)).cloned()
    }

    pub fn mark_unsupported(&self, kind: &ResourceKind) {
        self.state().unsupported.insert(kind.plural.clone());
    }

    pub fn add_pod(&self, name: &str, labels: &[(&str, &str)], log: &str) {
        self.state().pods.push(FakePod {
            info: PodInfo::new(name),
            labels: labels
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            log: log.to_string(),
        });
    }

    pub fn append_log(&self, pod: &str, line: &str) {
        if let Some(p) = self.state().pods.iter_mut().find(|p| p.info.name == pod) {
            p.log.push_str(line);
            p.log.push('\n');
        }
    }

    pub fn fail(&self, op: FakeOp, err: OrchestratorError) {
        self.state().failures.insert(op, err);
    }

    pub fn clear_failure(&self, op: FakeOp) {
        self.state().failures.remove(&op);
    }

    pub fn created(&self) -> Vec<Value> {
        self.state().created.clone()
    }

    pub fn log_requests(&self) -> Vec<(String, Option<i64>)> {
        self.state().log_requests.clone()
    }

    pub fn calls(&self, op: FakeOp) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    fn enter(&self, op: FakeOp) -> Result<std::sync::MutexGuard<'_, State>, OrchestratorError> {
        let mut state = self.state();
        *state.calls.entry(op).or_default() += 1;
        if let Some(err) = state.failures.get(&op) {
            return Err(err.clone());
        }
        Ok(state)
    }
}

fn selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector.split(',').all(|term| match term.split_once('=') {
        Some((k, v)) => labels.get(k.trim()).is_some_and(|l| l == v.trim()),
        None => labels.contains_key(term.trim()),
    })
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn list_custom_resources(
        &self,
        kind: &ResourceKind,
        namespace: &str,
    ) -> Result<Vec<Value>, OrchestratorError> {
        let state = self.enter(FakeOp::List)?;
        if state.unsupported.contains(&kind.plural) {
            return Err(OrchestratorError::ResourceKindUnsupported {
                kind: kind.kind.clone(),
            });
        }
        Ok(state
            .resources
            .iter()
            .filter(|((plural, ns, _), _)| *plural == kind.plural && ns == namespace)
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn get_custom_resource(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Value, OrchestratorError> {
        let state = self.enter(FakeOp::Get)?;
        state
            .resources
            .get(&key(kind, namespace, name))
            .cloned()
            .ok_or_else(|| OrchestratorError::ResourceNotFound {
                kind: kind.kind.clone(),
                name: name.to_string(),
            })
    }

    async fn create_custom_resource(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        body: &Value,
    ) -> Result<Value, OrchestratorError> {
        let mut state = self.enter(FakeOp::Create)?;
        let name = object_name(body);
        let k = key(kind, namespace, &name);
        if state.resources.contains_key(&k) {
            return Err(OrchestratorError::ValidationRejected(format!(
                "{} \"{name}\" already exists",
                kind.plural
            )));
        }
        state.created.push(body.clone());
        state.resources.insert(k, body.clone());
        Ok(body.clone())
    }

    async fn delete_custom_resource(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), OrchestratorError> {
        let mut state = self.enter(FakeOp::Delete)?;
        state
            .resources
            .remove(&key(kind, namespace, name))
            .map(|_| ())
            .ok_or_else(|| OrchestratorError::ResourceNotFound {
                kind: kind.kind.clone(),
                name: name.to_string(),
            })
    }

    async fn list_pods(
        &self,
        _namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<PodInfo>, OrchestratorError> {
        let state = self.enter(FakeOp::ListPods)?;
        Ok(state
            .pods
            .iter()
            .filter(|p| label_selector.map_or(true, |s| selector_matches(s, &p.labels)))
            .map(|p| p.info.clone())
            .collect())
    }

    async fn read_pod_logs(
        &self,
        _namespace: &str,
        pod: &PodInfo,
        since_seconds: Option<i64>,
        _timestamps: bool,
    ) -> Result<String, OrchestratorError> {
        let mut state = self.enter(FakeOp::ReadLogs)?;
        state.log_requests.push((pod.name.clone(), since_seconds));
        state
            .pods
            .iter()
            .find(|p| p.info.name == pod.name)
            .map(|p| p.log.clone())
            .ok_or_else(|| OrchestratorError::ResourceNotFound {
                kind: "Pod".into(),
                name: pod.name.clone(),
            })
    }
}
