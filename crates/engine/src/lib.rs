//! devloop engine: one reconciliation pass drives the namespace toward the
//! devfile, then decides what to sync, build, run and forward.

#![forbid(unsafe_code)]

pub mod commands;
mod forward;
mod images;
mod inline;
mod orchestrator;
pub mod ports;
mod prune;
mod sync;
mod synth;
mod volumes;

pub use orchestrator::{
    PushParameters, ReconcileOutcome, Reconciler, ReconcilerPorts, WaitReason,
};

use devloop_cluster::ClusterError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    InvalidName(#[from] devloop_core::NameError),
    #[error("no valid components found in the devfile")]
    NoValidComponents,
    #[error("command {0:?} has a type this engine cannot run")]
    UnsupportedCommandType(String),
    #[error(transparent)]
    Devfile(#[from] devloop_devfile::DevfileError),
    #[error("{context}: {source}")]
    Cluster {
        context: String,
        #[source]
        source: ClusterError,
    },
    #[error("failed to delete {} resource(s):\n{}", .0.len(), .0.join("\n"))]
    Prune(Vec<String>),
    #[error("failed to sync files to component {component}: {source}")]
    Sync {
        component: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Wraps a cluster error with the operation it interrupted.
    pub(crate) fn cluster(context: impl Into<String>) -> impl FnOnce(ClusterError) -> EngineError {
        let context = context.into();
        move |source| EngineError::Cluster { context, source }
    }
}
