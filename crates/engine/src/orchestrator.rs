//! The reconcile pass itself: workload first, then pruning, then the
//! running-pod work of syncing sources, running commands and forwarding
//! ports. One call to [`Reconciler::reconcile`] is one pass; the watch loop
//! calls it again on every cluster or filesystem event.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tracing::{debug, info};

use devloop_cluster::ClusterClient;
use devloop_core::labels;
use devloop_core::{object_name, ComponentState, ComponentStatus, ReconcileRequest};
use devloop_devfile::Devfile;

use crate::commands::{self, CommandExecutor};
use crate::ports::{
    AppPortChecker, AutomountProvider, BindingClient, CommandRunner, FileSyncer, ImageBackend,
    PortForwarder,
};
use crate::{forward, images, inline, prune, sync, synth, volumes, EngineError};

/// Everything one pass needs from the session besides cluster state. The
/// watch loop fills the per-event fields before each pass.
pub struct PushParameters {
    pub devfile: Devfile,
    /// Local directory holding the sources to sync.
    pub source_dir: PathBuf,
    /// Explicit build command id; `None` picks the default of the group.
    pub build_command: Option<String>,
    pub run_command: Option<String>,
    pub debug_command: Option<String>,
    /// Target the debug command group instead of run.
    pub debug: bool,
    /// Files changed since the last pass, relative to `source_dir`.
    pub changed_files: Vec<PathBuf>,
    pub deleted_files: Vec<PathBuf>,
    /// Path fragments the syncer skips.
    pub ignore_paths: Vec<String>,
    /// Back the source volume with an emptyDir instead of a PVC.
    pub ephemeral_source: bool,
}

impl PushParameters {
    pub fn new(devfile: Devfile, source_dir: impl Into<PathBuf>) -> Self {
        Self {
            devfile,
            source_dir: source_dir.into(),
            build_command: None,
            run_command: None,
            debug_command: None,
            debug: false,
            changed_files: Vec::new(),
            deleted_files: Vec::new(),
            ignore_paths: Vec::new(),
            ephemeral_source: false,
        }
    }
}

/// What a pass is blocked on when it exits before the component is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    /// The Deployment was just created or its spec changed; the rollout has
    /// to finish first.
    DeploymentUpdated,
    /// The Deployment exists but does not have exactly one ready replica.
    ReplicasNotReady,
    /// Service bindings declared in the devfile are not injected yet.
    BindingsNotInjected,
    /// The rollout finished but no running pod is visible yet.
    NoRunningPod,
}

impl std::fmt::Display for WaitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitReason::DeploymentUpdated => write!(f, "deployment updated"),
            WaitReason::ReplicasNotReady => write!(f, "replicas not ready"),
            WaitReason::BindingsNotInjected => write!(f, "service bindings not injected"),
            WaitReason::NoRunningPod => write!(f, "no running pod"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Sources, commands and forwards are all current.
    Ready,
    /// The pass exited early; a later cluster event resumes it.
    Waiting(WaitReason),
}

/// The engine's collaborators, injected at construction. Everything that
/// touches the cluster, the local filesystem or the network goes through one
/// of these, so tests swap them wholesale.
pub struct ReconcilerPorts {
    pub cluster: Arc<dyn ClusterClient>,
    pub syncer: Arc<dyn FileSyncer>,
    pub runner: Arc<dyn CommandRunner>,
    pub forwarder: Arc<dyn PortForwarder>,
    pub images: Arc<dyn ImageBackend>,
    pub bindings: Arc<dyn BindingClient>,
    pub port_checker: Arc<dyn AppPortChecker>,
    pub automounts: Arc<dyn AutomountProvider>,
}

/// Drives one component toward its devfile. Holds no cluster state of its
/// own; everything observed is re-read each pass and everything remembered
/// lives in the caller's [`ComponentStatus`].
pub struct Reconciler {
    req: ReconcileRequest,
    ports: ReconcilerPorts,
}

impl Reconciler {
    pub fn new(req: ReconcileRequest, ports: ReconcilerPorts) -> Self {
        Self { req, ports }
    }

    /// Runs one full pass and reports whether the component came out ready
    /// or is still waiting on the cluster. `status` carries state between
    /// passes and is updated in place.
    pub async fn reconcile(
        &self,
        params: &PushParameters,
        status: &mut ComponentStatus,
    ) -> Result<ReconcileOutcome, EngineError> {
        let started = Instant::now();
        let result = self.run_pass(params, status).await;
        let outcome = match &result {
            Ok(ReconcileOutcome::Ready) => "ready",
            Ok(ReconcileOutcome::Waiting(_)) => "waiting",
            Err(_) => "error",
        };
        histogram!("reconcile_pass_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("reconcile_passes_total", 1u64, "outcome" => outcome);
        result
    }

    async fn run_pass(
        &self,
        params: &PushParameters,
        status: &mut ComponentStatus,
    ) -> Result<ReconcileOutcome, EngineError> {
        let component = self.req.component_name();
        let app = self.req.app_name();
        let devfile = &params.devfile;
        let cluster = self.ports.cluster.as_ref();

        // Bad input fails here, before the first cluster call.
        if devfile.container_components().next().is_none() {
            return Err(EngineError::NoValidComponents);
        }
        let default_name = object_name(component, app)?;
        let resolved = commands::resolve(params)?;

        debug!(component, state = %status.state(), "starting reconcile pass");

        if status.state() == ComponentState::SyncOutdated {
            // Sources moved; images built from them are stale as well.
            status.image_components_auto_applied.clear();
        }

        images::push_auto_images(self.ports.images.as_ref(), &self.req, devfile, status).await?;

        let core_selector = labels::selector(component, app, labels::MODE_DEV, true);
        let existing = cluster
            .deployment_for_selector(&core_selector)
            .await
            .map_err(EngineError::cluster("fetching component deployment"))?;
        let deployment_existed = existing.is_some();

        let (deployment, updated) = synth::create_or_update_component(
            cluster,
            self.ports.automounts.as_ref(),
            &self.req,
            devfile,
            existing,
            params.ephemeral_source,
            &default_name,
        )
        .await?;

        let selector = labels::selector(component, app, labels::MODE_DEV, false);
        let diff =
            prune::remote_resources_not_in_devfile(cluster, &self.req, devfile, &selector).await?;
        prune::delete_orphans(Arc::clone(&self.ports.cluster), diff.orphans).await?;
        prune::delete_binding_secrets(cluster, self.ports.bindings.as_ref(), diff.binding_secrets)
            .await?;

        inline::push_inline_components(cluster, &self.req, devfile, &deployment).await?;
        volumes::adopt_pvcs(cluster, &self.req, &deployment).await?;

        if updated {
            debug!(
                generation = deployment.metadata.generation,
                "deployment changed, waiting for the rollout"
            );
            status.set_state(ComponentState::WaitDeployment);
            return Ok(ReconcileOutcome::Waiting(WaitReason::DeploymentUpdated));
        }

        let ready_replicas = deployment
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        if ready_replicas != 1 {
            debug!(ready_replicas, "deployment not ready yet");
            status.set_state(ComponentState::WaitDeployment);
            return Ok(ReconcileOutcome::Waiting(WaitReason::ReplicasNotReady));
        }

        let injected = self
            .ports
            .bindings
            .injection_done(component, app)
            .await
            .map_err(|err| EngineError::Other(err.context("checking service binding injection")))?;
        if !injected {
            debug!("service bindings not injected yet");
            status.set_state(ComponentState::WaitDeployment);
            return Ok(ReconcileOutcome::Waiting(WaitReason::BindingsNotInjected));
        }

        let ports_to_forward = devfile.container_endpoint_mapping(params.debug);
        let ports_changed = ports_to_forward != self.ports.forwarder.forwarded_ports();
        if status.state() == ComponentState::Ready && !ports_changed {
            debug!("component already ready and endpoints unchanged");
            return Ok(ReconcileOutcome::Ready);
        }

        let pod = cluster
            .running_pod_for_component(component, app)
            .await
            .map_err(EngineError::cluster("fetching running pod"))?;
        let Some(pod) = pod else {
            debug!("deployment ready but no running pod visible yet");
            status.set_state(ComponentState::WaitDeployment);
            return Ok(ReconcileOutcome::Waiting(WaitReason::NoRunningPod));
        };
        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        // A pass entered while waiting on a rollout means this pod replaced
        // the one sources were last synced into.
        let pod_changed = status.state() == ComponentState::WaitDeployment;

        let force_push = !deployment_existed || pod_changed;
        let exec_required = match sync::sync_files(
            self.ports.syncer.as_ref(),
            &self.req,
            params,
            &resolved,
            &pod_name,
            force_push,
        )
        .await
        {
            Ok(exec_required) => exec_required,
            Err(err) => {
                // A failed sync still ends the pass; the next file event
                // retries it.
                status.set_state(ComponentState::Ready);
                return Err(err);
            }
        };

        let executor = CommandExecutor {
            cluster,
            runner: self.ports.runner.as_ref(),
            images: self.ports.images.as_ref(),
            devfile,
            req: &self.req,
            pod_name: &pod_name,
            owner: &deployment,
        };
        let commands_result = match executor.run_post_start(status).await {
            Ok(()) => executor.apply_commands(&resolved, exec_required).await,
            Err(err) => Err(err),
        };
        if let Err(err) = commands_result {
            status.set_state(ComponentState::Ready);
            return Err(err);
        }

        forward::refresh(
            self.ports.forwarder.as_ref(),
            self.ports.port_checker.as_ref(),
            status,
            &pod_name,
            &ports_to_forward,
            pod_changed,
            ports_changed,
        )
        .await?;

        status.set_state(ComponentState::Ready);
        info!(component, "component is ready");
        Ok(ReconcileOutcome::Ready)
    }
}
