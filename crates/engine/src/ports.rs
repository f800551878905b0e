//! Ports the reconciler drives. Implementations live in devloop_ops; tests
//! substitute hand-written fakes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use devloop_devfile::{EnvVar, ImageComponent};

/// One file-sync invocation into a running container.
#[derive(Debug)]
pub struct SyncRequest<'a> {
    pub pod_name: &'a str,
    pub container_name: &'a str,
    /// Local project tree.
    pub source_dir: &'a Path,
    /// Destination inside the container, usually `/projects`.
    pub dest_dir: &'a str,
    /// Watch-reported changes; empty means the syncer recomputes drift from
    /// its own index.
    pub changed_files: &'a [PathBuf],
    pub deleted_files: &'a [PathBuf],
    pub ignore_paths: &'a [String],
    /// Push everything regardless of the index: the container is fresh.
    pub force_push: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOutcome {
    /// Files landed in the container, so commands have to re-execute.
    pub exec_required: bool,
}

#[async_trait]
pub trait FileSyncer: Send + Sync {
    async fn sync(&self, request: &SyncRequest<'_>) -> anyhow::Result<SyncOutcome>;
}

/// An exec leaf ready to run inside a container.
#[derive(Debug)]
pub struct ExecSpec<'a> {
    pub command_id: &'a str,
    pub container_name: &'a str,
    pub command_line: &'a str,
    pub working_dir: Option<&'a str>,
    pub env: &'a [EnvVar],
    /// Run and debug processes stay resident; build and lifecycle commands
    /// run to completion.
    pub background: bool,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn execute(&self, pod_name: &str, spec: &ExecSpec<'_>) -> anyhow::Result<()>;

    /// Whether the process group started for `command_id` is still alive in
    /// the named container.
    async fn is_running(
        &self,
        pod_name: &str,
        command_id: &str,
        container_name: &str,
    ) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedPort {
    pub container_name: String,
    pub local_port: u16,
    pub remote_port: u16,
}

#[async_trait]
pub trait PortForwarder: Send + Sync {
    /// Forward the container->ports mapping from the named pod. Calling it
    /// again with the same pod and mapping keeps the existing forwards.
    async fn start(
        &self,
        pod_name: &str,
        ports: &BTreeMap<String, Vec<u16>>,
    ) -> anyhow::Result<Vec<ForwardedPort>>;

    async fn stop(&self);

    /// Container -> remote ports currently forwarded.
    fn forwarded_ports(&self) -> BTreeMap<String, Vec<u16>>;
}

#[async_trait]
pub trait ImageBackend: Send + Sync {
    /// Build the image component from sources under `context_dir` and push
    /// it to its registry.
    async fn build_and_push(
        &self,
        component_name: &str,
        image: &ImageComponent,
        context_dir: &Path,
    ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait BindingClient: Send + Sync {
    /// Whether every service binding targeting the component has been
    /// injected into its pod.
    async fn injection_done(&self, component_name: &str, app_name: &str) -> anyhow::Result<bool>;

    /// Detach the binding that produced `secret_name`; called right before
    /// the secret itself is deleted.
    async fn unbind(&self, secret_name: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait AppPortChecker: Send + Sync {
    /// Block until the application listens on every mapped port, or until
    /// `timeout` elapses (an error the caller treats as a warning).
    async fn wait_listening(
        &self,
        pod_name: &str,
        ports: &BTreeMap<String, Vec<u16>>,
        timeout: Duration,
    ) -> anyhow::Result<()>;
}

/// A cluster-provided volume to mount into every container.
#[derive(Debug, Clone)]
pub struct AutomountVolume {
    pub volume_name: String,
    pub pvc_name: String,
    pub mount_path: String,
    pub read_only: bool,
}

#[async_trait]
pub trait AutomountProvider: Send + Sync {
    async fn volumes(&self) -> anyhow::Result<Vec<AutomountVolume>>;
}

/// Default provider for clusters with nothing to automount.
pub struct NoAutomounts;

#[async_trait]
impl AutomountProvider for NoAutomounts {
    async fn volumes(&self) -> anyhow::Result<Vec<AutomountVolume>> {
        Ok(Vec::new())
    }
}
