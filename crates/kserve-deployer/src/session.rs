//! One operator session: discovered checkpoints, the background workers and
//! the deploy actions, bound to a single cluster and namespace.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::info;

use crate::config::DeployerConfig;
use crate::error::{DeployError, OrchestratorError, ScanError};
use crate::k8s::{JobPhase, KubeOrchestrator, Orchestrator, TrainingJobRef};
use crate::monitor::{LogMonitor, MonitorEvent, MonitorSettings, MonitorState};
use crate::reconciler::{DeployedService, ServiceReconciler, ServiceSummary};
use crate::registry::CheckpointRegistry;
use crate::resolver::RewriteTable;
use crate::scanner::{scan_directory, LogScanner, ScanReport};
use crate::watcher::{ServiceWatcher, WatchEvent, WatchSettings, WatchState};

pub struct DeploySession {
    orchestrator: Arc<dyn Orchestrator>,
    config: DeployerConfig,
    rewrites: RewriteTable,
    registry: Arc<CheckpointRegistry>,
    scanner: LogScanner,
    reconciler: ServiceReconciler,
    monitor: LogMonitor,
    watcher: ServiceWatcher,
}

impl DeploySession {
    /// Connect to the configured cluster.
    pub async fn connect(config: DeployerConfig) -> Result<Self, OrchestratorError> {
        let orchestrator = KubeOrchestrator::connect(&config.cluster, &config.namespace).await?;
        Ok(Self::new(Arc::new(orchestrator), config))
    }

    pub fn new(orchestrator: Arc<dyn Orchestrator>, config: DeployerConfig) -> Self {
        let registry = Arc::new(CheckpointRegistry::new());
        let scanner = LogScanner::new(
            Arc::clone(&orchestrator),
            config.namespace.clone(),
            config.discovery.clone(),
        );
        let reconciler = ServiceReconciler::new(
            Arc::clone(&orchestrator),
            config.training_job.kind.clone(),
            config.inference_service.clone(),
        );
        let monitor = LogMonitor::new(
            scanner.clone(),
            Arc::clone(&registry),
            MonitorSettings::from(&config.monitor),
        );
        let watcher = ServiceWatcher::new(
            Arc::clone(&orchestrator),
            config.inference_service.kind.clone(),
            WatchSettings::from(&config.watcher),
        );

        Self {
            rewrites: config.rewrite_table(),
            orchestrator,
            config,
            registry,
            scanner,
            reconciler,
            monitor,
            watcher,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    pub fn registry(&self) -> &Arc<CheckpointRegistry> {
        &self.registry
    }

    /// Route monitor events to a new channel. Takes effect on the next start.
    pub fn monitor_events(&mut self, capacity: usize) -> mpsc::Receiver<MonitorEvent> {
        let (tx, rx) = mpsc::channel(capacity);
        self.monitor.set_event_sender(tx);
        rx
    }

    /// Route watch events to a new channel. Takes effect on the next watch.
    pub fn watch_events(&mut self, capacity: usize) -> mpsc::Receiver<WatchEvent> {
        let (tx, rx) = mpsc::channel(capacity);
        self.watcher.set_event_sender(tx);
        rx
    }

    /// Training jobs in the namespace, sorted by name.
    pub async fn training_jobs(&self) -> Result<Vec<TrainingJobRef>, OrchestratorError> {
        let items = self
            .orchestrator
            .list_custom_resources(&self.config.training_job.kind, self.namespace())
            .await?;
        let mut jobs: Vec<TrainingJobRef> = items
            .iter()
            .filter_map(|item| TrainingJobRef::from_value(item, self.namespace()))
            .collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(jobs)
    }

    /// Full-history log scan of `job`.
    pub async fn scan_job(&self, job: &str) -> Result<ScanReport, ScanError> {
        self.scanner.scan_job(job, &self.registry, None).await
    }

    /// Record checkpoint directories found under a local directory. Returns
    /// the newly recorded ones.
    pub fn scan_local(&self, root: &Path) -> Vec<String> {
        let now = Utc::now();
        let found: Vec<String> = scan_directory(root)
            .into_iter()
            .filter(|dir| self.registry.record(dir, now))
            .collect();
        info!(root = %root.display(), new = found.len(), "Scanned local checkpoint directory");
        found
    }

    pub async fn start_monitor(&mut self, job: &str) {
        self.monitor.start(job).await;
    }

    pub async fn stop_monitor(&mut self) {
        self.monitor.stop().await;
    }

    pub fn monitor_state(&self) -> MonitorState {
        self.monitor.state()
    }

    /// Deployment-visible checkpoint paths, sorted and de-duplicated.
    pub fn checkpoints(&self) -> Vec<String> {
        self.registry.mapped_paths(&self.rewrites)
    }

    /// Training-side path for a selection from [`Self::checkpoints`].
    ///
    /// Paths that are not a rewritten registry entry are returned as given.
    pub fn original_path(&self, selected: &str) -> String {
        self.registry
            .records()
            .into_iter()
            .find(|r| r.mapped_path(&self.rewrites) == selected)
            .map_or_else(|| selected.to_string(), |r| r.original_path)
    }

    /// Deploy `checkpoint` from the PVC of training job `job`.
    pub async fn deploy(
        &self,
        checkpoint: &str,
        service_name: Option<&str>,
        job: &str,
    ) -> Result<DeployedService, DeployError> {
        let job = TrainingJobRef {
            name: job.to_string(),
            namespace: self.namespace().to_string(),
            status_phase: JobPhase::Other,
        };
        let checkpoint = self.original_path(checkpoint);
        self.reconciler
            .deploy(&checkpoint, service_name, self.namespace(), &job)
            .await
    }

    pub async fn delete_service(&self, name: &str) -> Result<(), OrchestratorError> {
        self.reconciler.delete(name, self.namespace()).await
    }

    pub async fn services(&self) -> Result<Vec<ServiceSummary>, OrchestratorError> {
        self.reconciler.list(self.namespace()).await
    }

    /// Watch `name`, replacing any current watch.
    pub async fn watch_service(&mut self, name: &str) {
        let namespace = self.config.namespace.clone();
        self.watcher.watch(name, &namespace).await;
    }

    pub async fn stop_watch(&mut self) {
        self.watcher.stop().await;
    }

    pub fn watch_state(&self) -> WatchState {
        self.watcher.state()
    }

    /// Forget every discovered checkpoint.
    pub fn reset(&self) {
        self.registry.clear();
    }

    /// Stop both workers and wait for them to exit.
    pub async fn shutdown(&mut self) {
        self.monitor.stop().await;
        self.watcher.stop().await;
        info!("Session shut down");
    }
}

impl Drop for DeploySession {
    fn drop(&mut self) {
        self.monitor.request_stop();
        self.watcher.request_stop();
    }
}
