//! Command resolution, the build/run decision procedure, and remote
//! execution of devfile commands.

use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use k8s_openapi::api::apps::v1::Deployment;
use tracing::{debug, info};

use devloop_cluster::ClusterClient;
use devloop_core::{ComponentStatus, ReconcileRequest};
use devloop_devfile::{Command, CommandGroupKind, Devfile, DevfileError};

use crate::ports::{CommandRunner, ExecSpec, ImageBackend};
use crate::{inline, EngineError, PushParameters};

/// The commands one pass works with: the run or debug target and, when the
/// devfile has one, the build command that precedes it.
pub(crate) struct ResolvedCommands<'a> {
    pub build: Option<&'a Command>,
    pub target: &'a Command,
}

/// Resolves the build and run/debug commands named in the parameters,
/// before any cluster call is made. The target must be an exec or composite
/// command; a missing build command is only an error when one was named
/// explicitly.
pub(crate) fn resolve(params: &PushParameters) -> Result<ResolvedCommands<'_>, EngineError> {
    let (name, kind) = if params.debug {
        (params.debug_command.as_deref(), CommandGroupKind::Debug)
    } else {
        (params.run_command.as_deref(), CommandGroupKind::Run)
    };
    let target = params.devfile.command(name, kind)?;
    if target.exec.is_none() && target.composite.is_none() {
        return Err(EngineError::UnsupportedCommandType(target.id.clone()));
    }
    let build = match params
        .devfile
        .command(params.build_command.as_deref(), CommandGroupKind::Build)
    {
        Ok(command) => Some(command),
        Err(DevfileError::CommandNotFound(_)) if params.build_command.is_none() => None,
        Err(err) => return Err(err.into()),
    };
    Ok(ResolvedCommands { build, target })
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Decision {
    pub build: bool,
    pub exec: bool,
}

/// The per-pass decision table. Composite targets always re-run (their
/// sequencing lives in the runner); a hot-reload-capable process that is
/// already running and saw no file changes is left alone; everything else
/// builds once and (re)starts the target.
pub(crate) fn decide(composite: bool, running: bool, hot_reload: bool, exec_required: bool) -> Decision {
    if composite {
        return Decision {
            build: true,
            exec: true,
        };
    }
    if running && hot_reload && !exec_required {
        return Decision {
            build: false,
            exec: false,
        };
    }
    Decision {
        build: true,
        exec: true,
    }
}

/// Executes resolved commands inside the component's pod. Apply commands
/// loop back into image builds and manifest application, so the executor
/// carries those collaborators too.
pub(crate) struct CommandExecutor<'e> {
    pub cluster: &'e dyn ClusterClient,
    pub runner: &'e dyn CommandRunner,
    pub images: &'e dyn ImageBackend,
    pub devfile: &'e Devfile,
    pub req: &'e ReconcileRequest,
    pub pod_name: &'e str,
    pub owner: &'e Deployment,
}

impl CommandExecutor<'_> {
    /// Applies the decision table to this pass and runs what it selects.
    pub(crate) async fn apply_commands(
        &self,
        resolved: &ResolvedCommands<'_>,
        exec_required: bool,
    ) -> Result<(), EngineError> {
        let composite = resolved.target.composite.is_some();
        let (running, hot_reload) = match &resolved.target.exec {
            Some(exec) => {
                let running = self
                    .runner
                    .is_running(self.pod_name, &resolved.target.id, &exec.component)
                    .await
                    .map_err(|err| {
                        EngineError::Other(err.context(format!(
                            "checking whether command {} is running",
                            resolved.target.id
                        )))
                    })?;
                (running, exec.is_hot_reload_capable())
            }
            None => (false, false),
        };
        let decision = decide(composite, running, hot_reload, exec_required);
        if !decision.exec {
            debug!(command = %resolved.target.id,
                   "command running and hot-reload capable, leaving it alone");
            return Ok(());
        }
        if decision.build {
            if let Some(build) = resolved.build {
                self.run_command(build).await?;
            }
        }
        self.run_command(resolved.target).await
    }

    /// Post-start lifecycle events, once per component lifetime.
    pub(crate) async fn run_post_start(
        &self,
        status: &mut ComponentStatus,
    ) -> Result<(), EngineError> {
        if status.post_start_events_done {
            return Ok(());
        }
        for command in self.devfile.post_start_commands()? {
            self.run_command(command).await?;
        }
        status.post_start_events_done = true;
        Ok(())
    }

    /// Runs one command: exec in its container, apply through the image or
    /// manifest path, composite by recursing over its children.
    fn run_command<'a>(&'a self, command: &'a Command) -> BoxFuture<'a, Result<(), EngineError>> {
        async move {
            if let Some(exec) = &command.exec {
                // run and debug processes stay alive past the call
                let background = matches!(
                    command.group_kind(),
                    Some(CommandGroupKind::Run | CommandGroupKind::Debug)
                );
                let spec = ExecSpec {
                    command_id: &command.id,
                    container_name: &exec.component,
                    command_line: &exec.command_line,
                    working_dir: exec.working_dir.as_deref(),
                    env: &exec.env,
                    background,
                };
                info!(command = %command.id, container = %exec.component, "executing command");
                return self
                    .runner
                    .execute(self.pod_name, &spec)
                    .await
                    .map_err(|err| {
                        EngineError::Other(
                            err.context(format!("executing command {}", command.id)),
                        )
                    });
            }
            if let Some(apply) = &command.apply {
                let component = self
                    .devfile
                    .component(&apply.component)
                    .ok_or_else(|| {
                        EngineError::Devfile(DevfileError::UnknownComponent(
                            command.id.clone(),
                            apply.component.clone(),
                        ))
                    })?;
                if let Some(image) = &component.image {
                    info!(command = %command.id, image = %image.image_name, "building applied image");
                    return self
                        .images
                        .build_and_push(&component.name, image, self.req.devfile_dir())
                        .await
                        .map_err(|err| {
                            EngineError::Other(
                                err.context(format!("applying image component {}", component.name)),
                            )
                        });
                }
                if let Some(k8s) = component.kubernetes.as_ref().or(component.openshift.as_ref()) {
                    return inline::apply_component(
                        self.cluster,
                        self.req,
                        self.devfile,
                        &component.name,
                        k8s,
                        self.owner,
                    )
                    .await;
                }
                return Err(EngineError::UnsupportedCommandType(command.id.clone()));
            }
            if let Some(composite) = &command.composite {
                let children = composite
                    .commands
                    .iter()
                    .map(|id| {
                        self.devfile
                            .command_by_id(id)
                            .ok_or_else(|| DevfileError::UnknownCommand(id.clone()))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                if composite.parallel.unwrap_or(false) {
                    try_join_all(children.into_iter().map(|child| self.run_command(child)))
                        .await?;
                } else {
                    for child in children {
                        self.run_command(child).await?;
                    }
                }
                return Ok(());
            }
            Err(EngineError::UnsupportedCommandType(command.id.clone()))
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_hot_reload_without_changes_is_a_no_op() {
        assert_eq!(
            decide(false, true, true, false),
            Decision {
                build: false,
                exec: false
            }
        );
    }

    #[test]
    fn stopped_process_builds_and_execs() {
        assert_eq!(
            decide(false, false, true, false),
            Decision {
                build: true,
                exec: true
            }
        );
        assert_eq!(
            decide(false, false, false, false),
            Decision {
                build: true,
                exec: true
            }
        );
    }

    #[test]
    fn running_without_hot_reload_restarts() {
        assert_eq!(
            decide(false, true, false, false),
            Decision {
                build: true,
                exec: true
            }
        );
    }

    #[test]
    fn synced_changes_force_a_restart() {
        assert_eq!(
            decide(false, true, true, true),
            Decision {
                build: true,
                exec: true
            }
        );
    }

    #[test]
    fn composite_targets_always_rerun() {
        assert_eq!(
            decide(true, true, true, false),
            Decision {
                build: true,
                exec: true
            }
        );
    }

    fn params(yaml: &str) -> PushParameters {
        PushParameters::new(Devfile::parse(yaml).unwrap(), ".")
    }

    #[test]
    fn resolve_requires_a_runnable_target() {
        let params = params(
            r#"
schemaVersion: 2.2.0
components:
  - name: job
    kubernetes: { inlined: "x" }
commands:
  - id: run
    apply:
      component: job
      group: { kind: run, isDefault: true }
"#,
        );
        assert!(matches!(
            resolve(&params),
            Err(EngineError::UnsupportedCommandType(id)) if id == "run"
        ));
    }

    #[test]
    fn resolve_tolerates_a_missing_default_build() {
        let params = params(
            r#"
schemaVersion: 2.2.0
components:
  - name: runtime
    container: { image: node:16 }
commands:
  - id: run
    exec:
      component: runtime
      commandLine: npm start
      group: { kind: run, isDefault: true }
"#,
        );
        let resolved = resolve(&params).unwrap();
        assert!(resolved.build.is_none());
        assert_eq!(resolved.target.id, "run");
    }

    #[test]
    fn resolve_fails_when_a_named_build_is_absent() {
        let mut params = params(
            r#"
schemaVersion: 2.2.0
components:
  - name: runtime
    container: { image: node:16 }
commands:
  - id: run
    exec:
      component: runtime
      commandLine: npm start
      group: { kind: run, isDefault: true }
"#,
        );
        params.build_command = Some("compile".to_string());
        assert!(resolve(&params).is_err());
    }

    #[test]
    fn resolve_picks_the_debug_command_in_debug_mode() {
        let mut params = params(
            r#"
schemaVersion: 2.2.0
components:
  - name: runtime
    container: { image: node:16 }
commands:
  - id: run
    exec:
      component: runtime
      commandLine: npm start
      group: { kind: run, isDefault: true }
  - id: debug
    exec:
      component: runtime
      commandLine: npm run debug
      group: { kind: debug, isDefault: true }
"#,
        );
        params.debug = true;
        let resolved = resolve(&params).unwrap();
        assert_eq!(resolved.target.id, "debug");
    }
}
