//! kserve-deployer CLI
//!
//! Finds checkpoints written by training jobs and serves them through KServe.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use kserve_deployer::k8s::{JobPhase, ReadyState};
use kserve_deployer::{
    scan_directory, DeployError, DeploySession, DeployerConfig, MonitorEvent, ScanError, WatchEvent,
};

const EVENT_BUFFER: usize = 64;

/// Deploy training checkpoints as KServe InferenceServices
#[derive(Parser)]
#[command(name = "kserve-deployer")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// YAML configuration file
    #[arg(long, global = true, env = "KSERVE_DEPLOYER_CONFIG")]
    config: Option<PathBuf>,

    /// Kubernetes API server URL (defaults to the ambient kubeconfig)
    #[arg(long, global = true, env = "KSERVE_DEPLOYER_API_SERVER")]
    api_server: Option<String>,

    /// Bearer token for the API server
    #[arg(long, global = true, env = "KSERVE_DEPLOYER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Namespace of training jobs and inference services
    #[arg(short, long, global = true, env = "KSERVE_DEPLOYER_NAMESPACE")]
    namespace: Option<String>,

    /// Skip TLS certificate verification of the API server
    #[arg(long, global = true)]
    insecure_skip_tls_verify: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List training jobs in the namespace
    Jobs,
    /// Scan the full log history of a training job for checkpoints
    Scan {
        #[arg(long)]
        job: String,
    },
    /// Follow a training job's logs and report checkpoints as they are saved
    Monitor {
        #[arg(long)]
        job: String,
    },
    /// Find checkpoint directories on a locally mounted volume
    LocalScan {
        #[arg(long)]
        dir: PathBuf,
    },
    /// Create an InferenceService for a checkpoint of a training job
    Deploy {
        /// Training job whose PVC holds the checkpoint
        #[arg(long)]
        job: String,

        /// Absolute checkpoint directory as seen by the training pods
        #[arg(long)]
        checkpoint: String,

        /// Service name (derived from the checkpoint directory when omitted)
        #[arg(long)]
        name: Option<String>,
    },
    /// Delete an InferenceService
    Delete {
        #[arg(long)]
        name: String,
    },
    /// List InferenceServices and their readiness
    Services,
    /// Follow an InferenceService until it is deleted
    Watch {
        #[arg(long)]
        name: String,
    },
}

impl Cli {
    fn load_config(&self) -> Result<DeployerConfig> {
        let mut config = match &self.config {
            Some(path) => DeployerConfig::from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => DeployerConfig::default(),
        };

        if let Some(server) = &self.api_server {
            config.cluster.api_server = Some(server.clone());
        }
        if let Some(token) = &self.token {
            config.cluster.token = Some(token.clone());
        }
        if let Some(namespace) = &self.namespace {
            config.namespace.clone_from(namespace);
        }
        if self.insecure_skip_tls_verify {
            config.cluster.insecure_skip_tls_verify = true;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("info,kserve_deployer=debug")
        } else {
            EnvFilter::new("warn,kserve_deployer=info")
        }
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let config = cli.load_config()?;

    if let Commands::LocalScan { dir } = &cli.command {
        return local_scan(dir);
    }

    debug!(namespace = %config.namespace, "Connecting to cluster");
    let mut session = DeploySession::connect(config)
        .await
        .context("Failed to connect to the Kubernetes API server")?;

    let result = run(&mut session, cli.command).await;
    session.shutdown().await;
    result
}

async fn run(session: &mut DeploySession, command: Commands) -> Result<()> {
    match command {
        Commands::Jobs => list_jobs(session).await,
        Commands::Scan { job } => scan(session, &job).await,
        Commands::Monitor { job } => monitor(session, &job).await,
        Commands::LocalScan { dir } => local_scan(&dir),
        Commands::Deploy {
            job,
            checkpoint,
            name,
        } => deploy(session, &job, &checkpoint, name.as_deref()).await,
        Commands::Delete { name } => {
            session
                .delete_service(&name)
                .await
                .with_context(|| format!("Failed to delete InferenceService {name}"))?;
            println!("{} {name}", "Deleted".green());
            Ok(())
        }
        Commands::Services => list_services(session).await,
        Commands::Watch { name } => watch(session, &name).await,
    }
}

async fn list_jobs(session: &DeploySession) -> Result<()> {
    let jobs = session
        .training_jobs()
        .await
        .context("Failed to list training jobs")?;
    if jobs.is_empty() {
        println!("No training jobs in namespace {}", session.namespace());
        return Ok(());
    }
    for job in jobs {
        let phase = match job.status_phase {
            JobPhase::Running => job.status_phase.to_string().cyan(),
            JobPhase::Completed => job.status_phase.to_string().green(),
            JobPhase::Other => job.status_phase.to_string().dimmed(),
        };
        println!("{:<40} {phase}", job.name);
    }
    Ok(())
}

async fn scan(session: &DeploySession, job: &str) -> Result<()> {
    let report = match session.scan_job(job).await {
        Ok(report) => report,
        Err(ScanError::NoPods { job }) => bail!("No pods found for training job {job}"),
        Err(e) => return Err(e).context("Log scan failed"),
    };
    println!("Scanned {} pod(s) of {job}", report.pods.len());
    print_checkpoints(session);
    Ok(())
}

async fn monitor(session: &mut DeploySession, job: &str) -> Result<()> {
    let mut events = session.monitor_events(EVENT_BUFFER);
    session.start_monitor(job).await;
    println!("{}", format!("Monitoring {job} (Ctrl-C to stop)").cyan().bold());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(MonitorEvent::CheckpointDiscovered { path, pod }) => {
                    println!("{} {path} {}", "checkpoint".green(), format!("({pod})").dimmed());
                }
                Some(MonitorEvent::NoPods { job }) => {
                    println!("{}", format!("waiting for pods of {job}").yellow());
                }
                Some(MonitorEvent::TransientError(msg)) => {
                    println!("{} {msg}", "retrying:".yellow());
                }
                Some(MonitorEvent::Fatal(msg)) => bail!("Monitor stopped: {msg}"),
                Some(MonitorEvent::StateChanged(state)) => debug!(state = ?state, "Monitor state"),
                None => break,
            }
        }
    }

    session.stop_monitor().await;
    print_checkpoints(session);
    Ok(())
}

fn local_scan(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }
    let found = scan_directory(dir);
    if found.is_empty() {
        println!("No checkpoints under {}", dir.display());
    }
    for path in found {
        println!("{path}");
    }
    Ok(())
}

async fn deploy(session: &DeploySession, job: &str, checkpoint: &str, name: Option<&str>) -> Result<()> {
    match session.deploy(checkpoint, name, job).await {
        Ok(deployed) => {
            println!(
                "{} {} in {}",
                "Created InferenceService".green(),
                deployed.name.bold(),
                deployed.namespace
            );
            println!("  storageUri: {}", deployed.storage_uri);
            Ok(())
        }
        Err(e @ DeployError::Resolve(_)) => {
            Err(e).context("The checkpoint cannot be served from the training job's storage")
        }
        Err(e) => Err(e).context("Deployment failed"),
    }
}

async fn list_services(session: &DeploySession) -> Result<()> {
    let services = session
        .services()
        .await
        .context("Failed to list InferenceServices")?;
    if services.is_empty() {
        println!("No InferenceServices in namespace {}", session.namespace());
        return Ok(());
    }
    for service in services {
        let ready = match service.status.ready {
            ReadyState::True => "Ready".green(),
            ReadyState::False => "NotReady".red(),
            ReadyState::Unknown => "Unknown".yellow(),
        };
        println!(
            "{:<40} {ready:<10} {}",
            service.name,
            service.status.url.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn watch(session: &mut DeploySession, name: &str) -> Result<()> {
    let mut events = session.watch_events(EVENT_BUFFER);
    session.watch_service(name).await;
    println!("{}", format!("Watching {name} (Ctrl-C to stop)").cyan().bold());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(WatchEvent::StatusChanged(status)) => {
                    println!(
                        "ready={} reason={} message={}",
                        status.ready,
                        status.reason.as_deref().unwrap_or("-"),
                        status.message.as_deref().unwrap_or("-"),
                    );
                }
                Some(WatchEvent::BecameReady { url }) => {
                    println!("{} {}", "Ready".green().bold(), url.as_deref().unwrap_or(""));
                }
                Some(WatchEvent::Deleted { name }) => {
                    println!("{} {name}", "Deleted".yellow());
                    break;
                }
                Some(WatchEvent::TransientError(msg)) => println!("{} {msg}", "retrying:".yellow()),
                Some(WatchEvent::Fatal(msg)) => bail!("Watch stopped: {msg}"),
                None => break,
            }
        }
    }

    session.stop_watch().await;
    Ok(())
}

fn print_checkpoints(session: &DeploySession) {
    let checkpoints = session.checkpoints();
    if checkpoints.is_empty() {
        println!("No checkpoints found");
        return;
    }
    println!("{}", "Checkpoints:".bold());
    for path in checkpoints {
        println!("  {path}");
    }
}
