//! Cluster-level volumes flagged for mounting into every workspace
//! container, discovered by label.

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::{Api, ListParams};
use kube::Client;
use kube::ResourceExt;

use devloop_engine::ports::{AutomountProvider, AutomountVolume};

const MOUNT_LABEL: &str = "devloop.dev/auto-mount";
const MOUNT_PATH_ANNOTATION: &str = "devloop.dev/mount-path";
const READ_ONLY_ANNOTATION: &str = "devloop.dev/read-only";

pub struct KubeAutomounts {
    client: Client,
    namespace: String,
}

impl KubeAutomounts {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl AutomountProvider for KubeAutomounts {
    async fn volumes(&self) -> Result<Vec<AutomountVolume>> {
        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &self.namespace);
        let lp = ListParams::default().labels(&format!("{MOUNT_LABEL}=true"));
        let list = api.list(&lp).await.context("listing automount volumes")?;
        Ok(list.into_iter().map(|pvc| automount_volume(&pvc)).collect())
    }
}

fn automount_volume(pvc: &PersistentVolumeClaim) -> AutomountVolume {
    let name = pvc.name_any();
    let annotations = pvc.annotations();
    AutomountVolume {
        volume_name: format!("auto-pvc-{name}"),
        pvc_name: name.clone(),
        mount_path: annotations
            .get(MOUNT_PATH_ANNOTATION)
            .cloned()
            .unwrap_or_else(|| format!("/tmp/{name}")),
        read_only: annotations
            .get(READ_ONLY_ANNOTATION)
            .map(|v| v == "true")
            .unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn pvc(name: &str, annotations: &[(&str, &str)]) -> PersistentVolumeClaim {
        let mut pvc = PersistentVolumeClaim::default();
        pvc.metadata.name = Some(name.to_string());
        if !annotations.is_empty() {
            pvc.metadata.annotations = Some(
                annotations
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            );
        }
        pvc
    }

    #[test]
    fn defaults_mount_under_tmp_read_write() {
        let vol = automount_volume(&pvc("shared-cache", &[]));
        assert_eq!(vol.volume_name, "auto-pvc-shared-cache");
        assert_eq!(vol.pvc_name, "shared-cache");
        assert_eq!(vol.mount_path, "/tmp/shared-cache");
        assert!(!vol.read_only);
    }

    #[test]
    fn annotations_override_path_and_access() {
        let vol = automount_volume(&pvc(
            "certs",
            &[
                ("devloop.dev/mount-path", "/etc/certs"),
                ("devloop.dev/read-only", "true"),
            ],
        ));
        assert_eq!(vol.mount_path, "/etc/certs");
        assert!(vol.read_only);
    }
}
