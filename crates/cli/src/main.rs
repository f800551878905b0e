//! devloopctl: the interactive watch loop around the component reconciler.
//!
//! `devloopctl dev` loads the devfile, wires the kube-backed adapters into
//! the engine and then re-runs the reconcile pass on every trigger: a
//! debounced filesystem event, a cluster event on the component's objects,
//! a periodic resync tick, or `p` + Enter on stdin. Passes are single-flight
//! by construction; the loop never runs two at once.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use notify::{RecursiveMode, Watcher};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use devloop_cluster::watch::start_component_watchers;
use devloop_cluster::{ClusterClient, KubeCluster};
use devloop_core::{labels, object_name, ComponentState, ComponentStatus, ReconcileRequest};
use devloop_devfile::Devfile;
use devloop_engine::ports::{ImageBackend, PortForwarder};
use devloop_engine::{PushParameters, ReconcileOutcome, Reconciler, ReconcilerPorts};
use devloop_ops::{
    KubeAutomounts, OperatorBindingClient, PortForwardManager, ProcNetPortChecker,
    RemoteCommandRunner, ShellImageBackend, TarSyncer,
};

#[derive(Parser, Debug)]
#[command(
    name = "devloopctl",
    version,
    about = "Keep a Kubernetes namespace in step with a devfile while you edit"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the inner dev loop against the current cluster
    Dev(DevArgs),
    /// Print the version
    Version,
}

#[derive(Args, Debug)]
struct DevArgs {
    /// Devfile describing the component
    #[arg(long, default_value = "devfile.yaml")]
    devfile: PathBuf,

    /// Source tree to sync (default: the devfile's directory)
    #[arg(long)]
    source: Option<PathBuf>,

    /// Component name (default: the devfile's metadata.name)
    #[arg(long)]
    component: Option<String>,

    /// Application the component belongs to
    #[arg(long, default_value = "app")]
    app: String,

    /// Kubernetes namespace (default: current context)
    #[arg(long = "ns")]
    namespace: Option<String>,

    /// Build command id (default: the build group's default command)
    #[arg(long = "build-command")]
    build_command: Option<String>,

    /// Run command id (default: the run group's default command)
    #[arg(long = "run-command")]
    run_command: Option<String>,

    /// Debug command id (default: the debug group's default command)
    #[arg(long = "debug-command")]
    debug_command: Option<String>,

    /// Target the debug command group instead of run
    #[arg(long, action = ArgAction::SetTrue)]
    debug: bool,

    /// Path fragment to skip when syncing (repeatable)
    #[arg(long = "ignore")]
    ignore: Vec<String>,

    /// Back the source volume with an emptyDir instead of a PVC
    #[arg(long, env = "DEVLOOP_EPHEMERAL_SOURCES", action = ArgAction::SetTrue)]
    ephemeral: bool,
}

fn init_tracing() {
    let env = std::env::var("DEVLOOP_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("DEVLOOP_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid DEVLOOP_METRICS_ADDR; metrics disabled");
        }
    }
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(key)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(default),
    )
}

/// Delay between failed passes: 1s doubling to a 30s cap, reset on success.
struct Backoff {
    delay: Duration,
}

impl Backoff {
    const INITIAL: Duration = Duration::from_secs(1);
    const CAP: Duration = Duration::from_secs(30);

    fn new() -> Self {
        Self {
            delay: Self::INITIAL,
        }
    }

    fn next(&mut self) -> Duration {
        let delay = self.delay;
        self.delay = (self.delay * 2).min(Self::CAP);
        delay
    }

    fn reset(&mut self) {
        self.delay = Self::INITIAL;
    }
}

/// What a batch of debounced filesystem events amounts to.
#[derive(Debug, Default)]
struct FileChanges {
    changed: Vec<PathBuf>,
    deleted: Vec<PathBuf>,
    devfile: bool,
}

/// Sorts watcher paths into changed/deleted relative paths, flagging edits
/// to the devfile itself (reloaded, never synced). The sync bookkeeping
/// folder and ignored fragments are dropped so the loop does not wake on
/// its own writes.
fn classify_events(
    paths: Vec<PathBuf>,
    source_dir: &Path,
    devfile_path: &Path,
    ignore: &[String],
) -> FileChanges {
    let mut changes = FileChanges::default();
    for path in paths {
        if path == devfile_path {
            changes.devfile = true;
            continue;
        }
        let Ok(rel) = path.strip_prefix(source_dir) else {
            continue;
        };
        if is_ignored(rel, ignore) {
            continue;
        }
        if path.exists() {
            changes.changed.push(rel.to_path_buf());
        } else {
            changes.deleted.push(rel.to_path_buf());
        }
    }
    changes
}

fn is_ignored(rel: &Path, ignore: &[String]) -> bool {
    let rel_str = rel.to_string_lossy();
    if rel
        .components()
        .any(|c| matches!(c.as_os_str().to_str(), Some(".git") | Some(".devloop")))
    {
        return true;
    }
    ignore.iter().any(|fragment| rel_str.contains(fragment.as_str()))
}

fn log_outcome(outcome: ReconcileOutcome) {
    match outcome {
        ReconcileOutcome::Ready => {
            info!("watching for changes (press p + Enter to force a push, Ctrl-C to quit)");
        }
        ReconcileOutcome::Waiting(reason) => info!(%reason, "waiting on the cluster"),
    }
}

async fn dev(args: DevArgs) -> Result<()> {
    let devfile_path = args
        .devfile
        .canonicalize()
        .with_context(|| format!("devfile {} not found", args.devfile.display()))?;
    let devfile = Devfile::from_path(&devfile_path)?;
    let source_dir = match &args.source {
        Some(dir) => dir
            .canonicalize()
            .with_context(|| format!("source dir {} not found", dir.display()))?,
        None => devfile_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf(),
    };
    let Some(component) = args
        .component
        .clone()
        .or_else(|| devfile.name().map(str::to_owned))
    else {
        bail!("the devfile has no metadata.name; pass --component");
    };

    let cluster = Arc::new(KubeCluster::try_default(args.namespace.as_deref()).await?);
    let namespace = cluster.namespace().to_string();
    let req = ReconcileRequest::new(&component, &args.app, &namespace, &devfile_path)?;
    let deployment_name = object_name(&component, &args.app)?;

    let client = cluster.client();
    let images: Arc<dyn ImageBackend> = if devfile.image_components().next().is_some() {
        Arc::new(ShellImageBackend::detect().await?)
    } else {
        // never invoked when the devfile declares no images
        Arc::new(ShellImageBackend::new("docker"))
    };
    let forwarder = Arc::new(PortForwardManager::new(client.clone(), &namespace));
    let ports = ReconcilerPorts {
        cluster: Arc::clone(&cluster) as Arc<dyn ClusterClient>,
        syncer: Arc::new(TarSyncer::new(client.clone(), &namespace)),
        runner: Arc::new(RemoteCommandRunner::new(client.clone(), &namespace)),
        forwarder: Arc::clone(&forwarder) as Arc<dyn PortForwarder>,
        images,
        bindings: Arc::new(OperatorBindingClient::new(
            client.clone(),
            &namespace,
            &deployment_name,
        )),
        port_checker: Arc::new(ProcNetPortChecker::new(client.clone(), &namespace)),
        automounts: Arc::new(KubeAutomounts::new(client.clone(), &namespace)),
    };
    let reconciler = Reconciler::new(req, ports);
    let mut status = ComponentStatus::new();
    let mut params = PushParameters::new(devfile, &source_dir);
    params.build_command = args.build_command.clone();
    params.run_command = args.run_command.clone();
    params.debug_command = args.debug_command.clone();
    params.debug = args.debug;
    params.ignore_paths = args.ignore.clone();
    params.ephemeral_source = args.ephemeral;

    // Debounced recursive watch on the source tree. The handler runs on the
    // watcher thread, so it only forwards paths into the loop's channel.
    let (file_tx, mut file_rx) = mpsc::unbounded_channel::<Vec<PathBuf>>();
    let mut debouncer = new_debouncer(
        Duration::from_millis(100),
        move |res: DebounceEventResult| match res {
            Ok(events) => {
                let _ = file_tx.send(events.into_iter().map(|e| e.path).collect());
            }
            Err(err) => warn!(error = %err, "file watcher error"),
        },
    )?;
    debouncer
        .watcher()
        .watch(&source_dir, RecursiveMode::Recursive)
        .with_context(|| format!("watching {}", source_dir.display()))?;
    if !devfile_path.starts_with(&source_dir) {
        let devfile_dir = devfile_path.parent().unwrap_or_else(|| Path::new("."));
        debouncer
            .watcher()
            .watch(devfile_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("watching {}", devfile_dir.display()))?;
    }

    let selector = labels::selector(&component, &args.app, labels::MODE_DEV, false);
    let (cluster_tx, mut cluster_rx) = mpsc::channel(64);
    let watch_tasks = start_component_watchers(client, &namespace, &selector, cluster_tx);

    info!(component = %component, namespace = %namespace, "starting dev session");
    // The first pass proves out the devfile and the cluster; failing it is
    // fatal rather than retried.
    log_outcome(reconciler.reconcile(&params, &mut status).await?);

    let resync = env_secs("DEVLOOP_RESYNC_SECS", 60);
    let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + resync, resync);
    let mut stdin_lines = BufReader::new(tokio::io::stdin()).lines();
    let mut backoff = Backoff::new();
    let mut pending_changed: BTreeSet<PathBuf> = BTreeSet::new();
    let mut pending_deleted: BTreeSet<PathBuf> = BTreeSet::new();

    loop {
        let trigger = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(paths) = file_rx.recv() => {
                let changes =
                    classify_events(paths, &source_dir, &devfile_path, &params.ignore_paths);
                pending_changed.extend(changes.changed);
                pending_deleted.extend(changes.deleted);
                if changes.devfile {
                    // Inline manifests referenced by uri are re-read from
                    // disk every pass, so only the devfile itself needs a
                    // reload here.
                    match Devfile::from_path(&devfile_path) {
                        Ok(devfile) => {
                            info!("devfile changed, reloading");
                            params.devfile = devfile;
                            status.set_state(ComponentState::SyncOutdated);
                        }
                        Err(err) => {
                            warn!(error = %err, "devfile change ignored, parse failed");
                            continue;
                        }
                    }
                } else if pending_changed.is_empty() && pending_deleted.is_empty() {
                    continue;
                } else if status.state() != ComponentState::Ready {
                    // Not ready: hold the files until a cluster event or the
                    // resync tick runs a pass that can sync them.
                    debug!(state = %status.state(), "holding file changes until ready");
                    continue;
                }
                "file change"
            }
            Some(event) = cluster_rx.recv() => {
                debug!(kind = ?event.kind, name = %event.name, "cluster event");
                // Rollouts emit bursts; collapse them into one pass.
                tokio::time::sleep(Duration::from_millis(300)).await;
                while cluster_rx.try_recv().is_ok() {}
                "cluster event"
            }
            line = stdin_lines.next_line() => {
                match line {
                    Ok(Some(l)) if l.trim() == "p" => {
                        // Forced push: drop the ready fast path and the image
                        // cache so everything is re-examined.
                        status.set_state(ComponentState::SyncOutdated);
                        "manual push"
                    }
                    Ok(Some(_)) => continue,
                    Ok(None) | Err(_) => continue,
                }
            }
            _ = tick.tick() => "resync",
        };

        params.changed_files = std::mem::take(&mut pending_changed).into_iter().collect();
        params.deleted_files = std::mem::take(&mut pending_deleted).into_iter().collect();
        debug!(trigger, "running reconcile pass");
        match reconciler.reconcile(&params, &mut status).await {
            Ok(outcome) => {
                backoff.reset();
                log_outcome(outcome);
            }
            Err(err) => {
                let delay = backoff.next();
                warn!(error = %err, retry_in = ?delay, "reconcile pass failed");
                tokio::time::sleep(delay).await;
            }
        }
    }

    info!("stopping port forwards; cluster resources are left in place");
    forwarder.stop().await;
    for task in watch_tasks {
        task.abort();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    match cli.command {
        Commands::Dev(args) => dev(args).await,
        Commands::Version => {
            println!("devloopctl {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
