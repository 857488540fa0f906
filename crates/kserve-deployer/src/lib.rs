//! Checkpoint discovery and KServe InferenceService deployment for training
//! jobs running on Kubernetes.
//!
//! Training pod logs are scanned for "saved checkpoint to <path>" lines, the
//! discovered directories are collected per session, and a selected checkpoint
//! is served by creating an InferenceService whose storage URI points into the
//! PVC the training job wrote to.
//!
//! Entry point for most callers is [`DeploySession`].

pub mod config;
pub mod error;
pub mod k8s;
pub mod monitor;
pub mod naming;
pub mod patterns;
pub mod reconciler;
pub mod registry;
pub mod resolver;
pub mod scanner;
pub mod session;
pub mod watcher;

pub use config::DeployerConfig;
pub use error::{ConfigError, DeployError, OrchestratorError, ResolveError, ScanError};
pub use k8s::{KubeOrchestrator, Orchestrator, ResourceKind};
pub use monitor::{LogMonitor, MonitorEvent, MonitorState};
pub use naming::sanitize;
pub use patterns::CheckpointPatternMatcher;
pub use reconciler::{DeployedService, InferenceServiceSpec, ServiceReconciler};
pub use registry::{CheckpointRecord, CheckpointRegistry};
pub use resolver::{RewriteTable, VolumeMount};
pub use scanner::{scan_directory, LogScanner};
pub use session::DeploySession;
pub use watcher::{ServiceWatcher, SnapshotTracker, WatchEvent, WatchState};
