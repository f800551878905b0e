//! Devfile-declared Kubernetes and OpenShift manifests, applied with the
//! component's identity attached so the pruner can find them again.

use anyhow::Context as _;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::DynamicObject;
use tracing::{debug, info};

use devloop_cluster::{owner_reference_for, ClusterClient};
use devloop_core::labels;
use devloop_core::ReconcileRequest;
use devloop_devfile::manifest::{self, Manifest};
use devloop_devfile::{Devfile, KubernetesComponent};

use crate::EngineError;

/// Applies every inline component except the ones deferred to an apply
/// command, which run when their command does.
pub(crate) async fn push_inline_components(
    cluster: &dyn ClusterClient,
    req: &ReconcileRequest,
    devfile: &Devfile,
    owner: &Deployment,
) -> Result<(), EngineError> {
    for (name, component) in devfile.inline_components_to_push(false) {
        apply_component(cluster, req, devfile, name, component, owner).await?;
    }
    Ok(())
}

/// Applies one named inline component's manifests. ServiceBinding manifests
/// belong to the binding subsystem and are not pushed from here.
pub(crate) async fn apply_component(
    cluster: &dyn ClusterClient,
    req: &ReconcileRequest,
    devfile: &Devfile,
    component_name: &str,
    component: &KubernetesComponent,
    owner: &Deployment,
) -> Result<(), EngineError> {
    let manifests = manifest::expand(component_name, component, req.devfile_dir())?;
    for m in manifests {
        if m.kind == "ServiceBinding" {
            debug!(resource = %m.name, "leaving service binding to the binding subsystem");
            continue;
        }
        apply_manifest(cluster, req, devfile, &m, owner).await?;
    }
    Ok(())
}

async fn apply_manifest(
    cluster: &dyn ClusterClient,
    req: &ReconcileRequest,
    devfile: &Devfile,
    m: &Manifest,
    owner: &Deployment,
) -> Result<(), EngineError> {
    let mut object: DynamicObject = serde_json::from_value(m.object.clone())
        .with_context(|| format!("decoding manifest {}/{}", m.kind, m.name))?;

    let runtime = devfile.runtime();
    let merged = object.metadata.labels.get_or_insert_with(Default::default);
    for (k, v) in labels::labels_for(
        req.component_name(),
        req.app_name(),
        runtime,
        labels::MODE_DEV,
        false,
    ) {
        merged.insert(k, v);
    }
    let annotations = object.metadata.annotations.get_or_insert_with(Default::default);
    labels::set_project_type(annotations, runtime.unwrap_or_default());
    object
        .metadata
        .owner_references
        .get_or_insert_with(Default::default)
        .push(
            owner_reference_for(owner, false)
                .map_err(EngineError::cluster("building manifest owner reference"))?,
        );

    let gvk = kube::api::GroupVersionKind::gvk(&m.group, &m.version, &m.kind);
    let resource = cluster
        .api_resource_for(&gvk)
        .await
        .map_err(EngineError::cluster(format!(
            "resolving api for {}/{}",
            m.kind, m.name
        )))?;
    cluster
        .apply_dynamic_resource(object, &resource)
        .await
        .map_err(EngineError::cluster(format!(
            "applying {}/{}",
            m.kind, m.name
        )))?;
    info!(kind = %m.kind, name = %m.name, "applied devfile resource");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use devloop_cluster::mock::MockCluster;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn request() -> ReconcileRequest {
        ReconcileRequest::new("backend", "app", "test", "devfile.yaml").unwrap()
    }

    fn owner() -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("backend-app".to_string()),
                uid: Some("uid-backend-app".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn inline_resources_get_labels_and_an_owner() {
        let cluster = MockCluster::new();
        let devfile = Devfile::parse(
            r#"
schemaVersion: 2.2.0
metadata: { projectType: nodejs }
components:
  - name: settings
    kubernetes:
      inlined: |
        apiVersion: v1
        kind: ConfigMap
        metadata:
          name: app-settings
        data:
          MODE: dev
"#,
        )
        .unwrap();
        push_inline_components(&cluster, &request(), &devfile, &owner())
            .await
            .unwrap();
        let stored = cluster.resources_for_selector("app=app").await.unwrap();
        let cm = stored
            .iter()
            .find(|o| o.metadata.name.as_deref() == Some("app-settings"))
            .unwrap();
        let obj_labels = cm.metadata.labels.as_ref().unwrap();
        assert_eq!(
            obj_labels.get(labels::MODE_LABEL).map(String::as_str),
            Some(labels::MODE_DEV)
        );
        assert!(!labels::is_core_component(obj_labels));
        let owners = cm.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners[0].name, "backend-app");
        let annotations = cm.metadata.annotations.as_ref().unwrap();
        assert!(labels::is_project_type_set(annotations));
    }

    #[tokio::test]
    async fn service_bindings_are_not_pushed() {
        let cluster = MockCluster::new();
        let devfile = Devfile::parse(
            r#"
schemaVersion: 2.2.0
components:
  - name: binding
    kubernetes:
      inlined: |
        apiVersion: binding.operators.coreos.com/v1alpha1
        kind: ServiceBinding
        metadata:
          name: redis-binding
"#,
        )
        .unwrap();
        push_inline_components(&cluster, &request(), &devfile, &owner())
            .await
            .unwrap();
        assert!(cluster.dynamic_names().is_empty());
    }

    #[tokio::test]
    async fn apply_referenced_components_wait_for_their_command() {
        let cluster = MockCluster::new();
        let devfile = Devfile::parse(
            r#"
schemaVersion: 2.2.0
components:
  - name: job
    kubernetes:
      inlined: |
        apiVersion: batch/v1
        kind: Job
        metadata:
          name: migrate
commands:
  - id: migrate
    apply: { component: job }
"#,
        )
        .unwrap();
        push_inline_components(&cluster, &request(), &devfile, &owner())
            .await
            .unwrap();
        assert!(cluster.dynamic_names().is_empty());
    }
}
