//! Devloop Ops: the imperative half of the dev loop. Everything here talks to
//! live pods over the Kubernetes API: tar-based file sync, remote command
//! execution through pod exec, port forwarding and container image builds.
//!
//! Each adapter implements one of the `devloop_engine::ports` traits; the CLI
//! wires them into the reconciler at startup.

#![forbid(unsafe_code)]

mod automount;
mod binding;
mod check;
mod exec;
mod forward;
mod image;
mod runner;
mod sync;

pub use automount::KubeAutomounts;
pub use binding::OperatorBindingClient;
pub use check::ProcNetPortChecker;
pub use forward::PortForwardManager;
pub use image::ShellImageBackend;
pub use runner::RemoteCommandRunner;
pub use sync::TarSyncer;

/// Shell used for remote command lines; present in every image worth
/// developing against.
pub(crate) const SHELL: &str = "/bin/sh";
