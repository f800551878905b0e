//! Local TCP listeners bridged into pod ports through the API server's
//! port-forward subresource.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::Client;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use devloop_engine::ports::{ForwardedPort, PortForwarder};

use crate::exec;

/// First local port tried; forwards count up from here, skipping ports that
/// are already taken.
const BASE_PORT: u16 = 20001;
const BASE_PORT_ENV: &str = "DEVLOOP_FORWARD_BASE_PORT";
const BIND_ENV: &str = "DEVLOOP_FORWARD_BIND";

struct Session {
    pod_name: String,
    mapping: BTreeMap<String, Vec<u16>>,
    forwards: Vec<ForwardedPort>,
    cancels: Vec<oneshot::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct PortForwardManager {
    client: Client,
    namespace: String,
    session: Mutex<Option<Session>>,
}

impl PortForwardManager {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            session: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Session>> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Local/remote pairs currently served, with the local port each one got.
    pub fn active_forwards(&self) -> Vec<ForwardedPort> {
        self.lock()
            .as_ref()
            .map(|s| s.forwards.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PortForwarder for PortForwardManager {
    async fn start(
        &self,
        pod_name: &str,
        ports: &BTreeMap<String, Vec<u16>>,
    ) -> Result<Vec<ForwardedPort>> {
        if let Some(active) = self.lock().as_ref() {
            if active.pod_name == pod_name && active.mapping == *ports {
                debug!(pod = %pod_name, "forwards already in place");
                return Ok(active.forwards.clone());
            }
        }
        self.stop().await;
        if ports.is_empty() {
            return Ok(Vec::new());
        }

        let api = exec::pods(&self.client, &self.namespace);
        let bind_addr = std::env::var(BIND_ENV).unwrap_or_else(|_| "127.0.0.1".to_string());
        let mut next_port = base_port();
        let mut forwards = Vec::new();
        let mut cancels: Vec<oneshot::Sender<()>> = Vec::new();
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        for (container, remote) in flatten_mapping(ports) {
            let (listener, local) = match bind_next(&bind_addr, &mut next_port).await {
                Ok(bound) => bound,
                Err(e) => {
                    for cancel in cancels {
                        let _ = cancel.send(());
                    }
                    for task in &tasks {
                        task.abort();
                    }
                    return Err(e);
                }
            };
            let (cancel_tx, cancel_rx) = oneshot::channel();
            cancels.push(cancel_tx);
            tasks.push(tokio::spawn(serve(
                api.clone(),
                pod_name.to_string(),
                remote,
                listener,
                cancel_rx,
            )));
            info!(pod = %pod_name, container = %container, local, remote, "forwarding port");
            forwards.push(ForwardedPort {
                container_name: container,
                local_port: local,
                remote_port: remote,
            });
        }

        *self.lock() = Some(Session {
            pod_name: pod_name.to_string(),
            mapping: ports.clone(),
            forwards: forwards.clone(),
            cancels,
            tasks,
        });
        Ok(forwards)
    }

    async fn stop(&self) {
        let session = self.lock().take();
        if let Some(session) = session {
            info!(pod = %session.pod_name, count = session.forwards.len(), "stopping port forwards");
            for cancel in session.cancels {
                let _ = cancel.send(());
            }
            for task in session.tasks {
                task.abort();
            }
        }
    }

    fn forwarded_ports(&self) -> BTreeMap<String, Vec<u16>> {
        self.lock()
            .as_ref()
            .map(|s| s.mapping.clone())
            .unwrap_or_default()
    }
}

async fn serve(
    api: Api<Pod>,
    pod_name: String,
    remote: u16,
    listener: TcpListener,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut cancel_rx => {
                debug!(pod = %pod_name, port = remote, "forward listener closed");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((inbound, peer)) => {
                        debug!(pod = %pod_name, port = remote, peer = %peer, "forward connection accepted");
                        let api = api.clone();
                        let pod = pod_name.clone();
                        tokio::spawn(async move {
                            if let Err(e) = bridge(api, &pod, remote, inbound).await {
                                warn!(pod = %pod, port = remote, error = %e, "forward connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(port = remote, error = %e, "accept failed");
                        break;
                    }
                }
            }
        }
    }
}

/// Streams handed out by the API server are single use, so every accepted
/// connection opens its own forward.
async fn bridge(api: Api<Pod>, pod_name: &str, remote: u16, mut inbound: TcpStream) -> Result<()> {
    let mut pf = api
        .portforward(pod_name, &[remote])
        .await
        .context("opening port forward")?;
    let mut upstream = pf
        .take_stream(remote)
        .ok_or_else(|| anyhow!("forward stream missing for port {remote}"))?;
    let _ = tokio::io::copy_bidirectional(&mut inbound, &mut upstream).await;
    drop(upstream);
    let _ = pf.join().await;
    Ok(())
}

async fn bind_next(bind_addr: &str, next: &mut u16) -> Result<(TcpListener, u16)> {
    loop {
        let candidate = *next;
        *next = next
            .checked_add(1)
            .ok_or_else(|| anyhow!("ran out of local ports"))?;
        match TcpListener::bind((bind_addr, candidate)).await {
            Ok(listener) => return Ok((listener, candidate)),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("binding {bind_addr}:{candidate}"))
            }
        }
    }
}

/// (container, remote port) pairs in mapping order, which is stable because
/// the mapping is a BTreeMap.
fn flatten_mapping(ports: &BTreeMap<String, Vec<u16>>) -> Vec<(String, u16)> {
    ports
        .iter()
        .flat_map(|(container, remotes)| {
            remotes.iter().map(move |&remote| (container.clone(), remote))
        })
        .collect()
}

fn base_port() -> u16 {
    parse_base_port(std::env::var(BASE_PORT_ENV).ok().as_deref())
}

fn parse_base_port(raw: Option<&str>) -> u16 {
    raw.and_then(|v| v.parse().ok()).unwrap_or(BASE_PORT)
}
