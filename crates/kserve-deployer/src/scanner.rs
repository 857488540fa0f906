//! Checkpoint discovery from training pod logs and local directories.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::DiscoveryConfig;
use crate::error::{OrchestratorError, ScanError};
use crate::k8s::{Orchestrator, PodInfo};
use crate::patterns::{CheckpointPatternMatcher, CHECKPOINT_EXTENSIONS};
use crate::registry::CheckpointRegistry;

/// A newly recorded checkpoint and the pod whose log announced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    pub path: String,
    pub pod: String,
}

/// Outcome of a one-shot scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Pods whose logs were read
    pub pods: Vec<String>,
    /// Checkpoints not previously in the registry
    pub discovered: Vec<Discovery>,
}

/// Reads training pod logs and records checkpoint directories they mention.
#[derive(Clone)]
pub struct LogScanner {
    orchestrator: Arc<dyn Orchestrator>,
    matcher: CheckpointPatternMatcher,
    discovery: DiscoveryConfig,
    namespace: String,
}

impl LogScanner {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        namespace: impl Into<String>,
        discovery: DiscoveryConfig,
    ) -> Self {
        Self {
            orchestrator,
            matcher: CheckpointPatternMatcher::new(),
            discovery,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Find the pods of `job`.
    ///
    /// Label selectors `<key>=<job>` are tried in order and the first one that
    /// returns pods wins. Otherwise every pod whose name contains the job name
    /// is used. An empty result is not an error.
    pub async fn discover_pods(&self, job: &str) -> Result<Vec<PodInfo>, OrchestratorError> {
        for key in &self.discovery.label_selector_keys {
            let selector = format!("{key}={job}");
            let pods = self
                .orchestrator
                .list_pods(&self.namespace, Some(&selector))
                .await?;
            if !pods.is_empty() {
                debug!(job = %job, selector = %selector, count = pods.len(), "Found pods by label");
                return Ok(pods);
            }
        }

        if !self.discovery.substring_fallback {
            return Ok(Vec::new());
        }

        let pods: Vec<PodInfo> = self
            .orchestrator
            .list_pods(&self.namespace, None)
            .await?
            .into_iter()
            .filter(|p| p.name.contains(job))
            .collect();
        debug!(job = %job, count = pods.len(), "Found pods by name");
        Ok(pods)
    }

    /// Checkpoint directories mentioned in `text`, in order of first mention.
    pub fn extract_checkpoints(&self, text: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        text.lines()
            .filter_map(|line| self.matcher.extract_directory(line))
            .filter(|dir| seen.insert(dir.clone()))
            .collect()
    }

    /// Read one pod's log and record new checkpoints.
    ///
    /// `since_seconds = None` reads the full log.
    pub async fn scan_pod(
        &self,
        pod: &PodInfo,
        since_seconds: Option<i64>,
        registry: &CheckpointRegistry,
    ) -> Result<Vec<Discovery>, OrchestratorError> {
        let text = self
            .orchestrator
            .read_pod_logs(&self.namespace, pod, since_seconds, false)
            .await?;

        let now = Utc::now();
        Ok(self
            .extract_checkpoints(&text)
            .into_iter()
            .filter(|path| registry.record(path, now))
            .map(|path| {
                info!(pod = %pod.name, path = %path, "Discovered checkpoint");
                Discovery {
                    path,
                    pod: pod.name.clone(),
                }
            })
            .collect())
    }

    /// Scan `pods` in order, stopping early when `cancel` fires.
    ///
    /// Fatal errors abort the scan. Other per-pod failures are logged and the
    /// remaining pods are still read.
    pub async fn scan_pods(
        &self,
        pods: &[PodInfo],
        since_seconds: Option<i64>,
        registry: &CheckpointRegistry,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<Discovery>, OrchestratorError> {
        let mut discovered = Vec::new();
        for pod in pods {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                debug!("Scan cancelled");
                break;
            }
            match self.scan_pod(pod, since_seconds, registry).await {
                Ok(found) => discovered.extend(found),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(pod = %pod.name, error = %e, "Failed to read pod logs"),
            }
        }
        Ok(discovered)
    }

    /// Full-history scan of every pod of `job`.
    pub async fn scan_job(
        &self,
        job: &str,
        registry: &CheckpointRegistry,
        cancel: Option<&CancellationToken>,
    ) -> Result<ScanReport, ScanError> {
        let pods = self.discover_pods(job).await?;
        if pods.is_empty() {
            return Err(ScanError::NoPods {
                job: job.to_string(),
            });
        }

        info!(job = %job, pods = pods.len(), "Scanning training job logs");
        let discovered = self.scan_pods(&pods, None, registry, cancel).await?;
        Ok(ScanReport {
            pods: pods.into_iter().map(|p| p.name).collect(),
            discovered,
        })
    }
}

/// Directories under `root` holding at least one checkpoint file, sorted.
///
/// A missing or unreadable root yields an empty list.
pub fn scan_directory(root: &Path) -> Vec<String> {
    let root = if root.is_absolute() {
        root.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(root),
            Err(_) => root.to_path_buf(),
        }
    };

    let dirs: BTreeSet<String> = WalkDir::new(&root)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(error = %e, "Skipping unreadable entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && is_checkpoint_file(entry.path()))
        .filter_map(|entry| {
            entry
                .path()
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
        })
        .collect();

    dirs.into_iter().collect()
}

fn is_checkpoint_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| CHECKPOINT_EXTENSIONS.iter().any(|k| k.eq_ignore_ascii_case(ext)))
}
