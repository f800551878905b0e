//! Runs devfile commands inside containers through pod exec. Resident
//! commands write a pid file so later passes can tell whether the process
//! they started is still alive.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use kube::api::AttachParams;
use kube::Client;
use tracing::{debug, info, warn};

use devloop_devfile::EnvVar;
use devloop_engine::ports::{CommandRunner, ExecSpec};

use crate::exec;
use crate::SHELL;

/// Pid files live under /tmp so they survive as long as the container does
/// and no dedicated volume is needed.
const PID_FILE_DIR: &str = "/tmp";

pub struct RemoteCommandRunner {
    client: Client,
    namespace: String,
}

impl RemoteCommandRunner {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl CommandRunner for RemoteCommandRunner {
    async fn execute(&self, pod_name: &str, spec: &ExecSpec<'_>) -> Result<()> {
        let api = exec::pods(&self.client, &self.namespace);
        if spec.background {
            let command = vec![SHELL.to_string(), "-c".to_string(), background_line(spec)];
            let ap = AttachParams::default()
                .container(spec.container_name)
                .stdout(true)
                .stderr(true);
            let mut attached = api
                .exec(pod_name, command, &ap)
                .await
                .with_context(|| format!("starting command '{}' failed", spec.command_id))?;
            let status = attached.take_status();
            let command_id = spec.command_id.to_string();
            info!(command = %command_id, container = %spec.container_name, "started resident command");
            // The shell stays attached for as long as the process runs; watch
            // it from the side instead of blocking the pass.
            tokio::spawn(async move {
                let _ = attached.join().await;
                let failed = match status {
                    Some(fut) => fut
                        .await
                        .map(|s| s.status.as_deref() == Some("Failure"))
                        .unwrap_or(false),
                    None => false,
                };
                if failed {
                    warn!(command = %command_id, "resident command exited with failure");
                } else {
                    debug!(command = %command_id, "resident command session closed");
                }
            });
            return Ok(());
        }

        info!(command = %spec.command_id, container = %spec.container_name, "running command");
        let command = vec![SHELL.to_string(), "-c".to_string(), foreground_line(spec)];
        let out = exec::run_capture(&api, pod_name, spec.container_name, command).await?;
        if !out.success {
            bail!(
                "command '{}' failed: {}",
                spec.command_id,
                exec::tail(&out.stderr, 2048)
            );
        }
        Ok(())
    }

    async fn is_running(
        &self,
        pod_name: &str,
        command_id: &str,
        container_name: &str,
    ) -> Result<bool> {
        let api = exec::pods(&self.client, &self.namespace);
        let probe = format!("cat {} || true", pid_file(command_id));
        let out = exec::run_capture(
            &api,
            pod_name,
            container_name,
            vec![SHELL.to_string(), "-c".to_string(), probe],
        )
        .await?;
        let pid = parse_pid(&out.stdout)?;
        if pid <= 0 {
            return Ok(false);
        }

        let check = format!("kill -0 {pid}; echo $?");
        let out = exec::run_capture(
            &api,
            pod_name,
            container_name,
            vec![SHELL.to_string(), "-c".to_string(), check],
        )
        .await?;
        alive_from_probe(&out.stdout)
    }
}

fn pid_file(command_id: &str) -> String {
    format!("{PID_FILE_DIR}/.devloop_cmd_{command_id}.pid")
}

/// Shell line for a resident command. The shell pid lands in the pid file
/// before the command starts, and output goes to the container's main
/// streams so `kubectl logs` keeps working.
fn background_line(spec: &ExecSpec<'_>) -> String {
    let pid_writer = format!("echo $$ > {}", pid_file(spec.command_id));
    let redirect = "1>>/proc/1/fd/1 2>>/proc/1/fd/2";
    let line = with_env(spec.command_line, spec.env);
    match spec.working_dir {
        Some(dir) => format!("{pid_writer} && cd {dir} && ({line}) {redirect}"),
        None => format!("{pid_writer} && ({line}) {redirect}"),
    }
}

/// Shell line for a command that runs to completion, with output captured.
fn foreground_line(spec: &ExecSpec<'_>) -> String {
    let line = with_env(spec.command_line, spec.env);
    match spec.working_dir {
        Some(dir) => format!("cd {dir} && ({line})"),
        None => format!("({line})"),
    }
}

fn with_env(command_line: &str, env: &[EnvVar]) -> String {
    if env.is_empty() {
        return command_line.to_string();
    }
    let assignments: Vec<String> = env
        .iter()
        .map(|var| format!("{}=\"{}\"", var.name, var.value))
        .collect();
    format!("export {} && {command_line}", assignments.join(" "))
}

/// Pid file content: one numeric line. Missing or empty means the process
/// was never started, or already cleaned up.
fn parse_pid(stdout: &str) -> Result<i64> {
    let mut lines = stdout.lines().filter(|l| !l.trim().is_empty());
    let first = match lines.next() {
        None => return Ok(0),
        Some(line) => line.trim(),
    };
    if lines.next().is_some() {
        bail!("unexpected pid file content: {stdout:?}");
    }
    first
        .parse::<i64>()
        .with_context(|| format!("unexpected pid file content: {first:?}"))
}

/// `kill -0 <pid>; echo $?` prints 0 while the process exists.
fn alive_from_probe(stdout: &str) -> Result<bool> {
    let code = stdout.trim();
    match code.parse::<i32>() {
        Ok(0) => Ok(true),
        Ok(_) => Ok(false),
        Err(_) => bail!("unexpected liveness probe output: {code:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec<'a>(env: &'a [EnvVar], working_dir: Option<&'a str>, background: bool) -> ExecSpec<'a> {
        ExecSpec {
            command_id: "run",
            container_name: "runtime",
            command_line: "npm start",
            working_dir,
            env,
            background,
        }
    }

    #[test]
    fn background_line_writes_pid_then_redirects() {
        let line = background_line(&spec(&[], Some("/projects"), true));
        assert_eq!(
            line,
            "echo $$ > /tmp/.devloop_cmd_run.pid && cd /projects && (npm start) \
             1>>/proc/1/fd/1 2>>/proc/1/fd/2"
        );
    }

    #[test]
    fn background_line_without_workdir_skips_cd() {
        let line = background_line(&spec(&[], None, true));
        assert!(line.starts_with("echo $$ > /tmp/.devloop_cmd_run.pid && (npm start)"));
        assert!(!line.contains("cd "));
    }

    #[test]
    fn env_vars_are_exported_before_the_command() {
        let env = vec![
            EnvVar {
                name: "NODE_ENV".to_string(),
                value: "development".to_string(),
            },
            EnvVar {
                name: "PORT".to_string(),
                value: "3000".to_string(),
            },
        ];
        let line = foreground_line(&spec(&env, Some("/projects"), false));
        assert_eq!(
            line,
            "cd /projects && (export NODE_ENV=\"development\" PORT=\"3000\" && npm start)"
        );
    }

    #[test]
    fn pid_parse_handles_empty_and_garbage() {
        assert_eq!(parse_pid("").unwrap(), 0);
        assert_eq!(parse_pid("\n").unwrap(), 0);
        assert_eq!(parse_pid("  142\n").unwrap(), 142);
        assert!(parse_pid("not-a-pid\n").is_err());
        assert!(parse_pid("1\n2\n").is_err());
    }

    #[test]
    fn liveness_probe_output_maps_to_bool() {
        assert!(alive_from_probe("0\n").unwrap());
        assert!(!alive_from_probe("1\n").unwrap());
        assert!(alive_from_probe("sh: kill: usage").is_err());
    }
}
