//! Background log monitor for a running training job.
//!
//! On start the monitor performs one full-history scan, then polls a short
//! trailing log window of every job pod on a fixed interval. Newly seen
//! checkpoints are recorded in the shared registry and announced as
//! [`MonitorEvent::CheckpointDiscovered`].

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MonitorConfig;
use crate::error::{OrchestratorError, ScanError};
use crate::registry::CheckpointRegistry;
use crate::scanner::{Discovery, LogScanner};

/// Lifecycle of the monitor worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Starting,
    Active,
    Stopping,
    /// The loop exited on a fatal error
    Error,
}

/// Event emitted by the monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    StateChanged(MonitorState),
    CheckpointDiscovered { path: String, pod: String },
    NoPods { job: String },
    TransientError(String),
    Fatal(String),
}

/// Monitor cadence
#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    pub backoff: Duration,
    pub log_window_secs: i64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from(&MonitorConfig::default())
    }
}

impl From<&MonitorConfig> for MonitorSettings {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            backoff: Duration::from_secs(config.backoff_secs),
            log_window_secs: config.log_window_secs,
        }
    }
}

struct Run {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Polls training pod logs for checkpoint announcements.
pub struct LogMonitor {
    scanner: LogScanner,
    registry: Arc<CheckpointRegistry>,
    settings: MonitorSettings,
    state: Arc<Mutex<MonitorState>>,
    event_tx: Option<mpsc::Sender<MonitorEvent>>,
    job: Option<String>,
    run: Option<Run>,
}

impl LogMonitor {
    #[must_use]
    pub fn new(scanner: LogScanner, registry: Arc<CheckpointRegistry>, settings: MonitorSettings) -> Self {
        Self {
            scanner,
            registry,
            settings,
            state: Arc::new(Mutex::new(MonitorState::Idle)),
            event_tx: None,
            job: None,
            run: None,
        }
    }

    /// Set the event sender for emitting monitor events
    pub fn set_event_sender(&mut self, tx: mpsc::Sender<MonitorEvent>) {
        self.event_tx = Some(tx);
    }

    pub fn state(&self) -> MonitorState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state(), MonitorState::Starting | MonitorState::Active)
    }

    /// Job of the current or most recent run.
    pub fn job(&self) -> Option<&str> {
        self.job.as_deref()
    }

    /// Start monitoring `job`, fully stopping any previous run first.
    pub async fn start(&mut self, job: &str) {
        self.stop().await;

        set_state(&self.state, MonitorState::Starting);
        info!(job = %job, "Starting log monitor");

        let cancel = CancellationToken::new();
        let worker = Worker {
            job: job.to_string(),
            scanner: self.scanner.clone(),
            registry: Arc::clone(&self.registry),
            settings: self.settings,
            state: Arc::clone(&self.state),
            event_tx: self.event_tx.clone(),
            cancel: cancel.clone(),
        };
        if let Some(tx) = &self.event_tx {
            if let Err(e) = tx.try_send(MonitorEvent::StateChanged(MonitorState::Starting)) {
                debug!(job = %job, error = %e, "Dropped monitor start event");
            }
        }

        let handle = tokio::spawn(worker.run());
        self.job = Some(job.to_string());
        self.run = Some(Run { cancel, handle });
    }

    /// Ask the worker to stop. It finishes its current step first.
    pub fn request_stop(&self) {
        if let Some(run) = &self.run {
            if !run.cancel.is_cancelled() {
                debug!(job = ?self.job, "Requesting log monitor stop");
                run.cancel.cancel();
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if matches!(*state, MonitorState::Starting | MonitorState::Active) {
                    *state = MonitorState::Stopping;
                }
            }
        }
    }

    /// Request stop and wait for the worker to exit.
    pub async fn stop(&mut self) {
        self.request_stop();
        if let Some(run) = self.run.take() {
            if let Err(e) = run.handle.await {
                warn!(job = ?self.job, error = %e, "Log monitor task ended abnormally");
            }
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != MonitorState::Error {
            *state = MonitorState::Idle;
        }
    }
}

impl Drop for LogMonitor {
    fn drop(&mut self) {
        self.request_stop();
    }
}

fn set_state(state: &Mutex<MonitorState>, next: MonitorState) {
    *state.lock().unwrap_or_else(PoisonError::into_inner) = next;
}

struct Worker {
    job: String,
    scanner: LogScanner,
    registry: Arc<CheckpointRegistry>,
    settings: MonitorSettings,
    state: Arc<Mutex<MonitorState>>,
    event_tx: Option<mpsc::Sender<MonitorEvent>>,
    cancel: CancellationToken,
}

enum Cycle {
    Ok,
    Backoff,
    Fatal(OrchestratorError),
}

impl Worker {
    /// Deliver `event`, giving up once stop is requested so a stalled
    /// subscriber cannot hold the worker.
    async fn emit(&self, event: MonitorEvent) {
        if let Some(tx) = &self.event_tx {
            tokio::select! {
                biased;
                _ = tx.send(event) => {}
                () = self.cancel.cancelled() => {
                    debug!(job = %self.job, "Dropped monitor event after stop request");
                }
            }
        }
    }

    async fn transition(&self, next: MonitorState) {
        set_state(&self.state, next);
        self.emit(MonitorEvent::StateChanged(next)).await;
    }

    async fn announce(&self, discovered: Vec<Discovery>) {
        for Discovery { path, pod } in discovered {
            self.emit(MonitorEvent::CheckpointDiscovered { path, pod }).await;
        }
    }

    async fn run(self) {
        if self.cancel.is_cancelled() {
            self.transition(MonitorState::Idle).await;
            return;
        }
        self.transition(MonitorState::Active).await;

        let mut cycle = self.initial_scan().await;
        loop {
            let delay = match cycle {
                Cycle::Ok => self.settings.poll_interval,
                Cycle::Backoff => self.settings.backoff,
                Cycle::Fatal(e) => {
                    error!(job = %self.job, error = %e, "Log monitor stopped on fatal error");
                    self.emit(MonitorEvent::Fatal(e.to_string())).await;
                    self.transition(MonitorState::Error).await;
                    return;
                }
            };

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
            if self.cancel.is_cancelled() {
                break;
            }
            cycle = self.poll().await;
        }

        info!(job = %self.job, "Log monitor stopped");
        self.transition(MonitorState::Idle).await;
    }

    /// Full-history pass so checkpoints written before monitoring began are found.
    async fn initial_scan(&self) -> Cycle {
        match self
            .scanner
            .scan_job(&self.job, &self.registry, Some(&self.cancel))
            .await
        {
            Ok(report) => {
                info!(
                    job = %self.job,
                    pods = report.pods.len(),
                    discovered = report.discovered.len(),
                    "Initial scan complete"
                );
                self.announce(report.discovered).await;
                Cycle::Ok
            }
            Err(ScanError::NoPods { job }) => {
                warn!(job = %job, "No pods found for training job");
                self.emit(MonitorEvent::NoPods { job }).await;
                Cycle::Backoff
            }
            Err(ScanError::Orchestrator(e)) => self.classify(e).await,
        }
    }

    async fn poll(&self) -> Cycle {
        let pods = match self.scanner.discover_pods(&self.job).await {
            Ok(pods) => pods,
            Err(e) => return self.classify(e).await,
        };
        if pods.is_empty() {
            debug!(job = %self.job, "No pods found, backing off");
            self.emit(MonitorEvent::NoPods {
                job: self.job.clone(),
            })
            .await;
            return Cycle::Backoff;
        }

        match self
            .scanner
            .scan_pods(
                &pods,
                Some(self.settings.log_window_secs),
                &self.registry,
                Some(&self.cancel),
            )
            .await
        {
            Ok(discovered) => {
                debug!(job = %self.job, pods = pods.len(), new = discovered.len(), "Poll complete");
                self.announce(discovered).await;
                Cycle::Ok
            }
            Err(e) => self.classify(e).await,
        }
    }

    async fn classify(&self, e: OrchestratorError) -> Cycle {
        if e.is_fatal() {
            return Cycle::Fatal(e);
        }
        warn!(job = %self.job, error = %e, "Transient monitor error, backing off");
        self.emit(MonitorEvent::TransientError(e.to_string())).await;
        Cycle::Backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscoveryConfig;
    use crate::k8s::fake::{FakeOp, FakeOrchestrator};

    const POD: &str = "train-1-master-0";

    fn monitor(fake: &Arc<FakeOrchestrator>) -> (LogMonitor, mpsc::Receiver<MonitorEvent>, Arc<CheckpointRegistry>) {
        let scanner = LogScanner::new(fake.clone(), "ml", DiscoveryConfig::default());
        let registry = Arc::new(CheckpointRegistry::new());
        let mut monitor = LogMonitor::new(scanner, Arc::clone(&registry), MonitorSettings::default());
        let (tx, rx) = mpsc::channel(64);
        monitor.set_event_sender(tx);
        (monitor, rx, registry)
    }

    async fn next_event(rx: &mut mpsc::Receiver<MonitorEvent>) -> MonitorEvent {
        tokio::time::timeout(Duration::from_secs(120), rx.recv())
            .await
            .expect("timed out waiting for monitor event")
            .expect("event channel closed")
    }

    #[tokio::test(start_paused = true)]
    async fn initial_scan_then_polls_recent_window() {
        let fake = Arc::new(FakeOrchestrator::new());
        fake.add_pod(
            POD,
            &[("job-name", "train-1")],
            "Saving model checkpoint to /opt/model-dir/checkpoint-100\n",
        );
        let (mut monitor, mut rx, registry) = monitor(&fake);

        monitor.start("train-1").await;
        assert_eq!(monitor.job(), Some("train-1"));
        assert_eq!(next_event(&mut rx).await, MonitorEvent::StateChanged(MonitorState::Starting));
        assert_eq!(next_event(&mut rx).await, MonitorEvent::StateChanged(MonitorState::Active));
        assert_eq!(
            next_event(&mut rx).await,
            MonitorEvent::CheckpointDiscovered {
                path: "/opt/model-dir/checkpoint-100".into(),
                pod: POD.into()
            }
        );
        assert!(monitor.is_active());

        fake.append_log(POD, "Saving model checkpoint to /opt/model-dir/checkpoint-200");
        assert_eq!(
            next_event(&mut rx).await,
            MonitorEvent::CheckpointDiscovered {
                path: "/opt/model-dir/checkpoint-200".into(),
                pod: POD.into()
            }
        );
        assert_eq!(registry.len(), 2);

        let requests = fake.log_requests();
        assert_eq!(requests[0], (POD.to_string(), None));
        assert_eq!(requests[1], (POD.to_string(), Some(60)));

        monitor.stop().await;
        assert_eq!(monitor.state(), MonitorState::Idle);
        assert_eq!(next_event(&mut rx).await, MonitorEvent::StateChanged(MonitorState::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_ends_in_error_state() {
        let fake = Arc::new(FakeOrchestrator::new());
        fake.fail(
            FakeOp::ListPods,
            OrchestratorError::AuthenticationFailed("token expired".into()),
        );
        let (mut monitor, mut rx, _) = monitor(&fake);

        monitor.start("train-1").await;
        let mut events = Vec::new();
        loop {
            let event = next_event(&mut rx).await;
            let done = event == MonitorEvent::StateChanged(MonitorState::Error);
            events.push(event);
            if done {
                break;
            }
        }
        assert!(events
            .iter()
            .any(|e| matches!(e, MonitorEvent::Fatal(msg) if msg.contains("token expired"))));
        assert_eq!(monitor.state(), MonitorState::Error);
        assert!(!monitor.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_pods_back_off_and_retry() {
        let fake = Arc::new(FakeOrchestrator::new());
        let (mut monitor, mut rx, _) = monitor(&fake);

        monitor.start("train-1").await;
        next_event(&mut rx).await; // Starting
        next_event(&mut rx).await; // Active
        assert_eq!(
            next_event(&mut rx).await,
            MonitorEvent::NoPods {
                job: "train-1".into()
            }
        );

        fake.add_pod(
            POD,
            &[("job-name", "train-1")],
            "Checkpoint saved to /data/ckpt-7",
        );
        loop {
            match next_event(&mut rx).await {
                MonitorEvent::NoPods { .. } => continue,
                event => {
                    assert_eq!(
                        event,
                        MonitorEvent::CheckpointDiscovered {
                            path: "/data/ckpt-7".into(),
                            pod: POD.into()
                        }
                    );
                    break;
                }
            }
        }
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_do_not_stop_the_loop() {
        let fake = Arc::new(FakeOrchestrator::new());
        fake.add_pod(POD, &[("job-name", "train-1")], "");
        fake.fail(
            FakeOp::ReadLogs,
            OrchestratorError::TransportUnreachable("timeout".into()),
        );
        let (mut monitor, mut rx, _) = monitor(&fake);

        monitor.start("train-1").await;
        next_event(&mut rx).await; // Starting
        next_event(&mut rx).await; // Active

        // Per-pod read failures are logged; the loop keeps polling.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(fake.calls(FakeOp::ReadLogs) >= 3);
        assert_eq!(monitor.state(), MonitorState::Active);

        fake.clear_failure(FakeOp::ReadLogs);
        fake.append_log(POD, "Saving model checkpoint to /data/ckpt-1");
        assert_eq!(
            next_event(&mut rx).await,
            MonitorEvent::CheckpointDiscovered {
                path: "/data/ckpt-1".into(),
                pod: POD.into()
            }
        );
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn restarting_replaces_previous_run() {
        let fake = Arc::new(FakeOrchestrator::new());
        fake.add_pod("train-1-master-0", &[("job-name", "train-1")], "");
        fake.add_pod("train-2-master-0", &[("job-name", "train-2")], "");
        let (mut monitor, mut rx, _) = monitor(&fake);

        monitor.start("train-1").await;
        monitor.start("train-2").await;
        assert_eq!(monitor.job(), Some("train-2"));

        let mut states = Vec::new();
        while states.len() < 4 {
            if let MonitorEvent::StateChanged(state) = next_event(&mut rx).await {
                states.push(state);
            }
        }
        assert_eq!(states[0], MonitorState::Starting);
        assert!(states.contains(&MonitorState::Idle));
        assert_eq!(states[3], MonitorState::Active);
        assert!(monitor.is_active());
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_returns_while_subscriber_is_stalled() {
        let fake = Arc::new(FakeOrchestrator::new());
        fake.add_pod(
            POD,
            &[("job-name", "train-1")],
            "Saving model checkpoint to /data/ckpt-1\n\
             Saving model checkpoint to /data/ckpt-2\n\
             Saving model checkpoint to /data/ckpt-3\n",
        );
        let (mut monitor, _, registry) = monitor(&fake);
        let (tx, _rx) = mpsc::channel(1);
        monitor.set_event_sender(tx);

        monitor.start("train-1").await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        tokio::time::timeout(Duration::from_secs(60), monitor.stop())
            .await
            .expect("stop blocked on a full event channel");
        assert_eq!(monitor.state(), MonitorState::Idle);
        assert!(registry.len() <= 3);
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let fake = Arc::new(FakeOrchestrator::new());
        let (mut monitor, _rx, _) = monitor(&fake);
        monitor.request_stop();
        monitor.stop().await;
        assert_eq!(monitor.state(), MonitorState::Idle);
        assert_eq!(monitor.job(), None);
    }
}
