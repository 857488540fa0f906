//! Readiness watcher for a single InferenceService.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WatcherConfig;
use crate::k8s::{Orchestrator, ResourceKind, ServiceStatusSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    Active,
    Stopping,
    /// The watched service was deleted
    NotFound,
    /// The loop exited on a fatal error
    Error,
}

/// Event emitted by the watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    StatusChanged(ServiceStatusSnapshot),
    BecameReady { url: Option<String> },
    Deleted { name: String },
    TransientError(String),
    Fatal(String),
}

/// Turns a stream of polled snapshots into change events.
#[derive(Debug, Default)]
pub struct SnapshotTracker {
    last: Option<ServiceStatusSnapshot>,
}

impl SnapshotTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<&ServiceStatusSnapshot> {
        self.last.as_ref()
    }

    /// Compare `snapshot` with the previous one.
    ///
    /// Any structural difference yields `StatusChanged`. Entering Ready=True
    /// from anything else (including no previous snapshot) also yields
    /// `BecameReady`.
    pub fn observe(&mut self, snapshot: ServiceStatusSnapshot) -> Vec<WatchEvent> {
        if self.last.as_ref() == Some(&snapshot) {
            return Vec::new();
        }

        let was_ready = self.last.as_ref().is_some_and(ServiceStatusSnapshot::is_ready);
        let mut events = vec![WatchEvent::StatusChanged(snapshot.clone())];
        if snapshot.is_ready() && !was_ready {
            events.push(WatchEvent::BecameReady {
                url: snapshot.url.clone(),
            });
        }
        self.last = Some(snapshot);
        events
    }
}

/// Watcher cadence
#[derive(Debug, Clone, Copy)]
pub struct WatchSettings {
    pub poll_interval: Duration,
    pub backoff: Duration,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self::from(&WatcherConfig::default())
    }
}

impl From<&WatcherConfig> for WatchSettings {
    fn from(config: &WatcherConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            backoff: Duration::from_secs(config.backoff_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    pub name: String,
    pub namespace: String,
}

struct Run {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Polls one InferenceService and reports status changes.
pub struct ServiceWatcher {
    orchestrator: Arc<dyn Orchestrator>,
    kind: ResourceKind,
    settings: WatchSettings,
    state: Arc<Mutex<WatchState>>,
    last: Arc<Mutex<Option<ServiceStatusSnapshot>>>,
    event_tx: Option<mpsc::Sender<WatchEvent>>,
    target: Option<WatchTarget>,
    run: Option<Run>,
}

impl ServiceWatcher {
    #[must_use]
    pub fn new(orchestrator: Arc<dyn Orchestrator>, kind: ResourceKind, settings: WatchSettings) -> Self {
        Self {
            orchestrator,
            kind,
            settings,
            state: Arc::new(Mutex::new(WatchState::Idle)),
            last: Arc::new(Mutex::new(None)),
            event_tx: None,
            target: None,
            run: None,
        }
    }

    /// Set the event sender for emitting watch events
    pub fn set_event_sender(&mut self, tx: mpsc::Sender<WatchEvent>) {
        self.event_tx = Some(tx);
    }

    pub fn state(&self) -> WatchState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self) -> bool {
        self.state() == WatchState::Active
    }

    pub fn target(&self) -> Option<&WatchTarget> {
        self.target.as_ref()
    }

    /// Most recent snapshot published by the worker.
    pub fn last_snapshot(&self) -> Option<ServiceStatusSnapshot> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Watch `name`, fully stopping any previous watch first.
    pub async fn watch(&mut self, name: &str, namespace: &str) {
        self.stop().await;

        let target = WatchTarget {
            name: name.to_string(),
            namespace: namespace.to_string(),
        };
        info!(service = %name, namespace = %namespace, "Watching InferenceService");

        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = None;
        set_state(&self.state, WatchState::Active);

        let cancel = CancellationToken::new();
        let worker = Worker {
            target: target.clone(),
            orchestrator: Arc::clone(&self.orchestrator),
            kind: self.kind.clone(),
            settings: self.settings,
            state: Arc::clone(&self.state),
            last: Arc::clone(&self.last),
            event_tx: self.event_tx.clone(),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(worker.run());
        self.target = Some(target);
        self.run = Some(Run { cancel, handle });
    }

    /// Ask the worker to stop. It finishes its current poll first.
    pub fn request_stop(&self) {
        if let Some(run) = &self.run {
            if !run.cancel.is_cancelled() {
                debug!(watch = ?self.target, "Requesting service watch stop");
                run.cancel.cancel();
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if *state == WatchState::Active {
                    *state = WatchState::Stopping;
                }
            }
        }
    }

    /// Request stop and wait for the worker to exit.
    pub async fn stop(&mut self) {
        self.request_stop();
        if let Some(run) = self.run.take() {
            if let Err(e) = run.handle.await {
                warn!(watch = ?self.target, error = %e, "Service watch task ended abnormally");
            }
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == WatchState::Stopping {
            *state = WatchState::Idle;
        }
    }
}

impl Drop for ServiceWatcher {
    fn drop(&mut self) {
        self.request_stop();
    }
}

fn set_state(state: &Mutex<WatchState>, next: WatchState) {
    *state.lock().unwrap_or_else(PoisonError::into_inner) = next;
}

struct Worker {
    target: WatchTarget,
    orchestrator: Arc<dyn Orchestrator>,
    kind: ResourceKind,
    settings: WatchSettings,
    state: Arc<Mutex<WatchState>>,
    last: Arc<Mutex<Option<ServiceStatusSnapshot>>>,
    event_tx: Option<mpsc::Sender<WatchEvent>>,
    cancel: CancellationToken,
}

impl Worker {
    async fn emit(&self, event: WatchEvent) {
        if let Some(tx) = &self.event_tx {
            tokio::select! {
                biased;
                _ = tx.send(event) => {}
                () = self.cancel.cancelled() => {
                    debug!(service = %self.target.name, "Dropped watch event after stop request");
                }
            }
        }
    }

    async fn run(self) {
        let WatchTarget { name, namespace } = &self.target;
        let mut tracker = SnapshotTracker::new();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let delay = match self
                .orchestrator
                .get_custom_resource(&self.kind, namespace, name)
                .await
            {
                Ok(resource) => {
                    let snapshot = ServiceStatusSnapshot::from_resource(&resource);
                    *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
                    for event in tracker.observe(snapshot.clone()) {
                        match &event {
                            WatchEvent::BecameReady { url } => {
                                info!(service = %name, url = ?url, "InferenceService is ready");
                            }
                            _ => debug!(service = %name, ready = %snapshot.ready, "Status changed"),
                        }
                        self.emit(event).await;
                    }
                    self.settings.poll_interval
                }
                Err(e) if e.is_not_found() => {
                    info!(service = %name, "InferenceService deleted");
                    set_state(&self.state, WatchState::NotFound);
                    self.emit(WatchEvent::Deleted { name: name.clone() }).await;
                    return;
                }
                Err(e) if e.is_fatal() => {
                    error!(service = %name, error = %e, "Service watch stopped on fatal error");
                    set_state(&self.state, WatchState::Error);
                    self.emit(WatchEvent::Fatal(e.to_string())).await;
                    return;
                }
                Err(e) => {
                    warn!(service = %name, error = %e, "Transient watch error, backing off");
                    self.emit(WatchEvent::TransientError(e.to_string())).await;
                    self.settings.backoff
                }
            };

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        debug!(service = %name, "Service watch stopped");
        set_state(&self.state, WatchState::Idle);
    }
}
