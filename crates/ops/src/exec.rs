//! Low-level pod exec plumbing shared by the sync, runner and port checker
//! adapters.

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use kube::Client;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;

pub(crate) struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

pub(crate) fn pods(client: &Client, namespace: &str) -> Api<Pod> {
    Api::namespaced(client.clone(), namespace)
}

/// Run a command to completion inside a container and capture both output
/// streams. `success` reflects the exit status reported over the channel.
pub(crate) async fn run_capture(
    api: &Api<Pod>,
    pod_name: &str,
    container_name: &str,
    command: Vec<String>,
) -> Result<ExecOutput> {
    let ap = AttachParams::default()
        .container(container_name)
        .stdout(true)
        .stderr(true);
    let mut attached = api
        .exec(pod_name, command, &ap)
        .await
        .with_context(|| format!("exec into {pod_name}/{container_name} failed"))?;

    let status = attached.take_status();
    let out_task = attached.stdout().map(drain_to_string);
    let err_task = attached.stderr().map(drain_to_string);

    let _ = attached.join().await;

    let stdout = collect(out_task).await;
    let stderr = collect(err_task).await;
    let success = match status {
        Some(fut) => fut
            .await
            .map(|s| s.status.as_deref() != Some("Failure"))
            .unwrap_or(true),
        None => true,
    };
    Ok(ExecOutput {
        stdout,
        stderr,
        success,
    })
}

/// Run a command that reads its input from stdin; used for streaming tar
/// archives into a container. The writer is shut down once `input` is fully
/// written so the remote side sees EOF.
pub(crate) async fn run_with_stdin(
    api: &Api<Pod>,
    pod_name: &str,
    container_name: &str,
    command: Vec<String>,
    input: &[u8],
) -> Result<ExecOutput> {
    let ap = AttachParams::default()
        .container(container_name)
        .stdin(true)
        .stdout(true)
        .stderr(true);
    let mut attached = api
        .exec(pod_name, command, &ap)
        .await
        .with_context(|| format!("exec into {pod_name}/{container_name} failed"))?;

    let status = attached.take_status();
    let mut writer = attached
        .stdin()
        .ok_or_else(|| anyhow!("exec stdin writer missing"))?;
    let out_task = attached.stdout().map(drain_to_string);
    let err_task = attached.stderr().map(drain_to_string);

    writer
        .write_all(input)
        .await
        .context("writing exec stdin")?;
    writer.shutdown().await.context("closing exec stdin")?;
    drop(writer);

    let _ = attached.join().await;

    let stdout = collect(out_task).await;
    let stderr = collect(err_task).await;
    let success = match status {
        Some(fut) => fut
            .await
            .map(|s| s.status.as_deref() != Some("Failure"))
            .unwrap_or(true),
        None => true,
    };
    Ok(ExecOutput {
        stdout,
        stderr,
        success,
    })
}

fn drain_to_string(reader: impl tokio::io::AsyncRead + Unpin + Send + 'static) -> JoinHandle<String> {
    let mut stream = ReaderStream::new(reader);
    tokio::spawn(async move {
        let mut buf = String::new();
        while let Some(Ok(bytes)) = stream.next().await {
            buf.push_str(&String::from_utf8_lossy(&bytes));
        }
        buf
    })
}

async fn collect(task: Option<JoinHandle<String>>) -> String {
    match task {
        Some(t) => t.await.unwrap_or_default(),
        None => String::new(),
    }
}

/// Last `limit` bytes of `s`, aligned to a character boundary. Keeps error
/// messages bounded when a build command dumps a full log on stderr.
pub(crate) fn tail(s: &str, limit: usize) -> &str {
    if s.len() <= limit {
        return s;
    }
    let mut start = s.len() - limit;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
