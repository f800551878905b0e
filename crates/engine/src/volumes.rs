//! Storage provisioning: the source volume, devfile volumes and automounted
//! PVCs, wired into the pod the synthesizer builds.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info};

use devloop_cluster::{owner_reference_for, ClusterClient};
use devloop_core::labels::{self};
use devloop_core::{object_name, ReconcileRequest};
use devloop_devfile::{ContainerComponent, Devfile};

use crate::ports::AutomountProvider;
use crate::synth::PROJECTS_ROOT;
use crate::EngineError;

/// Name of the volume holding synced project sources.
pub(crate) const SOURCE_VOLUME: &str = "devloop-projects";
const SOURCE_PVC_SIZE: &str = "2Gi";
const DEFAULT_VOLUME_SIZE: &str = "1Gi";

enum VolumeBacking {
    Pvc { claim: String, read_only: bool },
    Ephemeral,
}

/// Attaches every volume the component needs and returns the pod volume
/// list. Containers that mount sources get the source volume; devfile
/// volume mounts resolve against devfile volume components; automounted
/// PVCs land in every container.
pub(crate) async fn attach(
    cluster: &dyn ClusterClient,
    automounts: &dyn AutomountProvider,
    req: &ReconcileRequest,
    devfile: &Devfile,
    containers: &mut Vec<Container>,
    init_containers: &mut Vec<Container>,
    ephemeral_source: bool,
) -> Result<Vec<Volume>, EngineError> {
    let mut volumes: Vec<Volume> = Vec::new();

    let source_backing = if ephemeral_source {
        VolumeBacking::Ephemeral
    } else {
        let claim =
            ensure_pvc(cluster, req, devfile, SOURCE_VOLUME, SOURCE_PVC_SIZE, true).await?;
        VolumeBacking::Pvc {
            claim,
            read_only: false,
        }
    };
    volumes.push(pod_volume(SOURCE_VOLUME, &source_backing));

    // devfile volume components, keyed by name for mount resolution
    let mut named: BTreeMap<&str, ()> = BTreeMap::new();
    for (name, vc) in devfile.volume_components() {
        let backing = if vc.is_ephemeral() {
            VolumeBacking::Ephemeral
        } else {
            let size = vc.size.as_deref().unwrap_or(DEFAULT_VOLUME_SIZE);
            let claim = ensure_pvc(cluster, req, devfile, name, size, false).await?;
            VolumeBacking::Pvc {
                claim,
                read_only: false,
            }
        };
        volumes.push(pod_volume(name, &backing));
        named.insert(name, ());
    }

    let auto = automounts
        .volumes()
        .await
        .map_err(EngineError::Other)?;
    for volume in &auto {
        volumes.push(pod_volume(
            &volume.volume_name,
            &VolumeBacking::Pvc {
                claim: volume.pvc_name.clone(),
                read_only: volume.read_only,
            },
        ));
    }

    let components: BTreeMap<&str, &ContainerComponent> =
        devfile.container_components().collect();
    for container in containers.iter_mut() {
        let Some(cc) = components.get(container.name.as_str()) else {
            continue;
        };
        let mut mounts: Vec<VolumeMount> = Vec::new();
        if cc.mounts_sources() {
            let path = cc
                .source_mapping
                .clone()
                .unwrap_or_else(|| PROJECTS_ROOT.to_string());
            mounts.push(VolumeMount {
                name: SOURCE_VOLUME.to_string(),
                mount_path: path,
                ..Default::default()
            });
        }
        for vm in &cc.volume_mounts {
            if !named.contains_key(vm.name.as_str()) {
                return Err(EngineError::Other(anyhow::anyhow!(
                    "container {} mounts unknown volume {}",
                    container.name,
                    vm.name
                )));
            }
            mounts.push(VolumeMount {
                name: vm.name.clone(),
                mount_path: vm.mount_path(),
                ..Default::default()
            });
        }
        for volume in &auto {
            mounts.push(VolumeMount {
                name: volume.volume_name.clone(),
                mount_path: volume.mount_path.clone(),
                read_only: volume.read_only.then_some(true),
                ..Default::default()
            });
        }
        if !mounts.is_empty() {
            container.volume_mounts = Some(mounts);
        }
    }

    for container in init_containers.iter_mut() {
        let mut mounts = vec![VolumeMount {
            name: SOURCE_VOLUME.to_string(),
            mount_path: PROJECTS_ROOT.to_string(),
            ..Default::default()
        }];
        for volume in &auto {
            mounts.push(VolumeMount {
                name: volume.volume_name.clone(),
                mount_path: volume.mount_path.clone(),
                read_only: volume.read_only.then_some(true),
                ..Default::default()
            });
        }
        container.volume_mounts = Some(mounts);
    }

    Ok(volumes)
}

fn pod_volume(name: &str, backing: &VolumeBacking) -> Volume {
    match backing {
        VolumeBacking::Pvc { claim, read_only } => Volume {
            name: name.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.clone(),
                read_only: read_only.then_some(true),
            }),
            ..Default::default()
        },
        VolumeBacking::Ephemeral => Volume {
            name: name.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    }
}

/// Finds the PVC backing `storage_name`, creating it when the component has
/// never run here before. Returns the claim name.
async fn ensure_pvc(
    cluster: &dyn ClusterClient,
    req: &ReconcileRequest,
    devfile: &Devfile,
    storage_name: &str,
    size: &str,
    source_volume: bool,
) -> Result<String, EngineError> {
    let component = req.component_name();
    let app = req.app_name();
    let selector = format!(
        "{},{}={}",
        labels::selector(component, app, labels::MODE_DEV, true),
        labels::STORAGE_NAME_LABEL,
        storage_name
    );
    let existing = cluster
        .list_pvcs(&selector)
        .await
        .map_err(EngineError::cluster(format!(
            "listing volumes for {storage_name}"
        )))?;
    if let Some(pvc) = existing.into_iter().next() {
        if let Some(name) = pvc.metadata.name {
            debug!(pvc = %name, storage = storage_name, "reusing volume");
            return Ok(name);
        }
    }

    let name = object_name(&format!("{storage_name}-{component}"), app)?;
    let pvc = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(req.namespace().to_string()),
            labels: Some(labels::storage_labels(
                component,
                app,
                devfile.runtime(),
                storage_name,
                source_volume,
            )),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(size.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    let created = cluster
        .create_pvc(pvc)
        .await
        .map_err(EngineError::cluster(format!("creating volume {name}")))?;
    info!(pvc = %name, storage = storage_name, size, "created volume");
    Ok(created.metadata.name.unwrap_or(name))
}

/// Points every unowned devloop PVC at the Deployment so namespace cleanup
/// collects them with it. PVCs already owned or being deleted are left
/// alone.
pub(crate) async fn adopt_pvcs(
    cluster: &dyn ClusterClient,
    req: &ReconcileRequest,
    deployment: &Deployment,
) -> Result<(), EngineError> {
    let selector = labels::selector(req.component_name(), req.app_name(), labels::MODE_DEV, true);
    let pvcs = cluster
        .list_pvcs(&selector)
        .await
        .map_err(EngineError::cluster("listing component volumes"))?;
    for pvc in pvcs {
        if pvc.metadata.deletion_timestamp.is_some() {
            continue;
        }
        if pvc
            .metadata
            .owner_references
            .as_ref()
            .is_some_and(|refs| !refs.is_empty())
        {
            continue;
        }
        let Some(name) = pvc.metadata.name else {
            continue;
        };
        let owner = owner_reference_for(deployment, true)
            .map_err(EngineError::cluster("building volume owner reference"))?;
        match cluster.set_pvc_owner(&name, owner).await {
            Ok(()) => debug!(pvc = %name, "adopted volume"),
            Err(err) if err.is_forbidden() => {
                // some clusters refuse blockOwnerDeletion on namespaced owners
                let owner = owner_reference_for(deployment, false)
                    .map_err(EngineError::cluster("building volume owner reference"))?;
                cluster
                    .set_pvc_owner(&name, owner)
                    .await
                    .map_err(EngineError::cluster(format!("adopting volume {name}")))?;
            }
            Err(err) => {
                return Err(EngineError::cluster(format!("adopting volume {name}"))(err))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use devloop_cluster::mock::MockCluster;
    use crate::ports::NoAutomounts;

    fn request() -> ReconcileRequest {
        ReconcileRequest::new("backend", "app", "test", "devfile.yaml").unwrap()
    }

    fn containers_for(devfile: &Devfile) -> Vec<Container> {
        devfile
            .container_components()
            .map(|(name, _)| Container {
                name: name.to_string(),
                ..Default::default()
            })
            .collect()
    }

    #[tokio::test]
    async fn ephemeral_source_uses_an_empty_dir() {
        let cluster = MockCluster::new();
        let devfile = Devfile::parse(
            r#"
schemaVersion: 2.2.0
components:
  - name: runtime
    container: { image: node:16 }
"#,
        )
        .unwrap();
        let mut containers = containers_for(&devfile);
        let mut init = Vec::new();
        let volumes = attach(
            &cluster,
            &NoAutomounts,
            &request(),
            &devfile,
            &mut containers,
            &mut init,
            true,
        )
        .await
        .unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].name, SOURCE_VOLUME);
        assert!(volumes[0].empty_dir.is_some());
        assert!(cluster.stored_pvcs().is_empty());
        let mounts = containers[0].volume_mounts.as_ref().unwrap();
        assert_eq!(mounts[0].mount_path, "/projects");
    }

    #[tokio::test]
    async fn devfile_volumes_become_pvcs_once() {
        let cluster = MockCluster::new();
        let devfile = Devfile::parse(
            r#"
schemaVersion: 2.2.0
components:
  - name: runtime
    container:
      image: maven:3
      volumeMounts:
        - name: m2
          path: /home/user/.m2
  - name: m2
    volume: { size: 3Gi }
"#,
        )
        .unwrap();
        let req = request();
        for _ in 0..2 {
            let mut containers = containers_for(&devfile);
            let mut init = Vec::new();
            attach(
                &cluster,
                &NoAutomounts,
                &req,
                &devfile,
                &mut containers,
                &mut init,
                false,
            )
            .await
            .unwrap();
        }
        let pvcs = cluster.stored_pvcs();
        assert_eq!(pvcs.len(), 2);
        let names: Vec<_> = pvcs
            .iter()
            .filter_map(|p| p.metadata.name.as_deref())
            .collect();
        assert!(names.contains(&"devloop-projects-backend-app"));
        assert!(names.contains(&"m2-backend-app"));
    }

    #[tokio::test]
    async fn unknown_volume_mounts_are_rejected() {
        let cluster = MockCluster::new();
        let devfile = Devfile::parse(
            r#"
schemaVersion: 2.2.0
components:
  - name: runtime
    container:
      image: node:16
      volumeMounts:
        - name: missing
"#,
        )
        .unwrap();
        let mut containers = containers_for(&devfile);
        let mut init = Vec::new();
        let err = attach(
            &cluster,
            &NoAutomounts,
            &request(),
            &devfile,
            &mut containers,
            &mut init,
            true,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("unknown volume"));
    }

    #[tokio::test]
    async fn adoption_skips_owned_volumes() {
        let cluster = MockCluster::new();
        let req = request();
        let devfile = Devfile::parse(
            r#"
schemaVersion: 2.2.0
components:
  - name: runtime
    container: { image: node:16 }
"#,
        )
        .unwrap();
        let mut containers = containers_for(&devfile);
        let mut init = Vec::new();
        attach(
            &cluster,
            &NoAutomounts,
            &req,
            &devfile,
            &mut containers,
            &mut init,
            false,
        )
        .await
        .unwrap();

        let deployment = Deployment {
            metadata: ObjectMeta {
                name: Some("backend-app".to_string()),
                uid: Some("uid-backend-app".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        adopt_pvcs(&cluster, &req, &deployment).await.unwrap();
        let pvcs = cluster.stored_pvcs();
        let owners = pvcs[0].metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners[0].name, "backend-app");

        // a second pass leaves the adopted volume alone
        cluster.clear_calls();
        adopt_pvcs(&cluster, &req, &deployment).await.unwrap();
        assert!(cluster.mutating_calls().is_empty());
    }
}
