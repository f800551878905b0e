//! Sync coordination: pushes the local source tree into the container the
//! target command runs in.

use tracing::debug;

use devloop_core::ReconcileRequest;
use devloop_devfile::{Command, Devfile};

use crate::commands::ResolvedCommands;
use crate::ports::{FileSyncer, SyncRequest};
use crate::synth::PROJECTS_ROOT;
use crate::{EngineError, PushParameters};

/// Syncs sources and reports whether the transfer requires the command to
/// re-execute. `force_push` bypasses the syncer's own change index and
/// pushes everything.
pub(crate) async fn sync_files(
    syncer: &dyn FileSyncer,
    req: &ReconcileRequest,
    params: &PushParameters,
    resolved: &ResolvedCommands<'_>,
    pod_name: &str,
    force_push: bool,
) -> Result<bool, EngineError> {
    let devfile = &params.devfile;
    let Some(container) = sync_container(devfile, resolved.target) else {
        return Err(EngineError::Sync {
            component: req.component_name().to_string(),
            source: anyhow::anyhow!("target command has no exec container to sync into"),
        });
    };
    let dest_dir = devfile
        .component(container)
        .and_then(|c| c.container.as_ref())
        .and_then(|cc| cc.source_mapping.clone())
        .unwrap_or_else(|| PROJECTS_ROOT.to_string());

    let request = SyncRequest {
        pod_name,
        container_name: container,
        source_dir: &params.source_dir,
        dest_dir: &dest_dir,
        changed_files: &params.changed_files,
        deleted_files: &params.deleted_files,
        ignore_paths: &params.ignore_paths,
        force_push,
    };
    debug!(pod = pod_name, container, force = force_push, "syncing files");
    let outcome = syncer
        .sync(&request)
        .await
        .map_err(|source| EngineError::Sync {
            component: req.component_name().to_string(),
            source,
        })?;
    Ok(outcome.exec_required)
}

/// The container the target command executes in: its exec component, or for
/// composites the first exec leaf found walking the children in order.
fn sync_container<'a>(devfile: &'a Devfile, command: &'a Command) -> Option<&'a str> {
    if let Some(exec) = &command.exec {
        return Some(&exec.component);
    }
    if let Some(composite) = &command.composite {
        for id in &composite.commands {
            if let Some(child) = devfile.command_by_id(id) {
                if let Some(container) = sync_container(devfile, child) {
                    return Some(container);
                }
            }
        }
    }
    None
}
