//! Deployment and pod watchers that nudge the dev loop when cluster state moves.

use futures::TryStreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::{Client, Resource};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentEventKind {
    Deployment,
    Pod,
}

/// A change to one of the component's objects. Carries just enough for the
/// dev loop to log what woke it; reconciliation re-reads the cluster anyway.
#[derive(Debug, Clone)]
pub struct ComponentEvent {
    pub kind: ComponentEventKind,
    pub name: String,
}

/// Start label-filtered watchers on the component's Deployments and Pods,
/// sending nudges into `tx`. Tasks end when the stream errors out; the
/// periodic resync tick keeps the loop alive after that.
pub fn start_component_watchers(
    client: Client,
    namespace: &str,
    selector: &str,
    tx: mpsc::Sender<ComponentEvent>,
) -> Vec<JoinHandle<()>> {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let pods: Api<Pod> = Api::namespaced(client, namespace);
    let cfg = watcher::Config::default().labels(selector);

    let mut tasks = Vec::new();
    let dep_tx = tx.clone();
    let dep_cfg = cfg.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(err) = pump(deployments, ComponentEventKind::Deployment, dep_cfg, dep_tx).await {
            warn!(error = %err, "deployment watcher ended");
        }
    }));
    tasks.push(tokio::spawn(async move {
        if let Err(err) = pump(pods, ComponentEventKind::Pod, cfg, tx).await {
            warn!(error = %err, "pod watcher ended");
        }
    }));
    tasks
}

async fn pump<K>(
    api: Api<K>,
    kind: ComponentEventKind,
    cfg: watcher::Config,
    tx: mpsc::Sender<ComponentEvent>,
) -> anyhow::Result<()>
where
    K: Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug + Send + 'static,
{
    let stream = watcher::watcher(api, cfg);
    futures::pin_mut!(stream);
    info!(kind = ?kind, "watcher started");
    while let Some(ev) = stream.try_next().await? {
        match ev {
            Event::Applied(o) | Event::Deleted(o) => {
                let name = o.meta().name.clone().unwrap_or_default();
                let _ = tx.send(ComponentEvent { kind, name }).await;
            }
            Event::Restarted(list) => {
                debug!(kind = ?kind, count = list.len(), "watch restart");
                let _ = tx
                    .send(ComponentEvent {
                        kind,
                        name: String::new(),
                    })
                    .await;
            }
        }
    }
    warn!(kind = ?kind, "watcher stream ended");
    Ok(())
}
