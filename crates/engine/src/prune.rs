//! Remote diff and pruning: everything on the cluster carrying the
//! component's labels that the devfile no longer declares gets deleted.

use std::collections::HashSet;
use std::sync::Arc;

use kube::api::DynamicObject;
use metrics::counter;
use tracing::{debug, info};

use devloop_cluster::{gvk_of, ClusterClient};
use devloop_core::labels;
use devloop_core::ReconcileRequest;
use devloop_devfile::manifest::{self, Manifest};
use devloop_devfile::Devfile;

use crate::ports::BindingClient;
use crate::EngineError;

/// The two deletion classes a diff produces. Binding secrets go through the
/// unbind path so the application loses its injected credentials cleanly;
/// everything else is deleted directly.
pub(crate) struct RemoteDiff {
    pub orphans: Vec<DynamicObject>,
    pub binding_secrets: Vec<DynamicObject>,
}

/// Diffs the live resource set against the devfile-declared one. Matching is
/// by GroupKind and name; the served API version may drift between passes
/// and is ignored. Core workload objects, resources owned by something else
/// in the remote set, and resources another controller is already finalizing
/// stay untouched.
pub(crate) async fn remote_resources_not_in_devfile(
    cluster: &dyn ClusterClient,
    req: &ReconcileRequest,
    devfile: &Devfile,
    selector: &str,
) -> Result<RemoteDiff, EngineError> {
    let live = cluster
        .resources_for_selector(selector)
        .await
        .map_err(EngineError::cluster("fetching remote resources"))?;

    let mut declared: Vec<Manifest> = Vec::new();
    for (name, component) in devfile.inline_components_to_push(true) {
        declared.extend(manifest::expand(name, component, req.devfile_dir())?);
    }

    let sbo_supported = cluster
        .is_service_binding_supported()
        .await
        .map_err(EngineError::cluster(
            "determining service binding operator support",
        ))?;

    let live_uids: HashSet<&str> = live
        .iter()
        .filter_map(|o| o.metadata.uid.as_deref())
        .collect();

    let mut orphans = Vec::new();
    let mut binding_secrets = Vec::new();
    for obj in &live {
        let obj_labels = obj.metadata.labels.clone().unwrap_or_default();
        if labels::is_core_component(&obj_labels) {
            continue;
        }
        let annotations = obj.metadata.annotations.clone().unwrap_or_default();
        // a resource being finalized without our annotation belongs to some
        // other controller that merely shares the labels
        if obj.metadata.deletion_timestamp.is_some()
            && !labels::is_project_type_set(&annotations)
        {
            continue;
        }
        let Some(gvk) = gvk_of(obj) else {
            debug!(name = %obj.metadata.name.as_deref().unwrap_or_default(),
                   "skipping remote object without type information");
            continue;
        };
        let name = obj.metadata.name.as_deref().unwrap_or_default();

        let matched = declared.iter().any(|m| {
            let (group, kind) = m.group_kind();
            group == gvk.group && kind == gvk.kind && m.name == name
        });
        if matched {
            continue;
        }

        if owned_by_remote_set(obj, &live_uids) {
            debug!(resource = name, "skipping owned resource, its owner decides its fate");
            continue;
        }

        if !sbo_supported
            && gvk.group.is_empty()
            && gvk.kind == "Secret"
            && is_devfile_binding_secret(devfile, &obj_labels)
        {
            binding_secrets.push(obj.clone());
        } else {
            orphans.push(obj.clone());
        }
    }
    Ok(RemoteDiff {
        orphans,
        binding_secrets,
    })
}

fn owned_by_remote_set(obj: &DynamicObject, live_uids: &HashSet<&str>) -> bool {
    obj.metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| live_uids.contains(r.uid.as_str())))
}

/// A link secret still belongs to the devfile when the component it names is
/// present and targeted by an apply command.
fn is_devfile_binding_secret(devfile: &Devfile, obj_labels: &labels::LabelSet) -> bool {
    let Some(target) = labels::link_target(obj_labels) else {
        return false;
    };
    devfile.component(target).is_some() && devfile.referenced_by_apply_command(target)
}

/// Deletes every orphan, one task per resource. `NotFound` and
/// `MethodNotSupported` count as success; other failures are collected per
/// resource so a single stubborn object does not hide the rest.
pub(crate) async fn delete_orphans(
    cluster: Arc<dyn ClusterClient>,
    orphans: Vec<DynamicObject>,
) -> Result<(), EngineError> {
    if orphans.is_empty() {
        return Ok(());
    }
    let described: Vec<String> = orphans.iter().map(describe).collect();
    info!(count = orphans.len(), resources = %described.join(", "),
          "deleting resources absent from the devfile");

    let mut tasks = Vec::with_capacity(orphans.len());
    for obj in orphans {
        let cluster = Arc::clone(&cluster);
        tasks.push(tokio::spawn(async move {
            delete_one(cluster.as_ref(), &obj).await
        }));
    }

    let mut failures = Vec::new();
    for task in tasks {
        match task.await {
            Ok(Ok(())) => counter!("orphans_deleted_total", 1u64),
            Ok(Err(line)) => failures.push(line),
            Err(err) => failures.push(format!("failed to delete resource: {err}")),
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Prune(failures))
    }
}

async fn delete_one(cluster: &dyn ClusterClient, obj: &DynamicObject) -> Result<(), String> {
    let label = describe(obj);
    let name = obj.metadata.name.as_deref().unwrap_or_default();
    let Some(gvk) = gvk_of(obj) else {
        return Err(format!("failed to delete {label}: unknown group/version/kind"));
    };
    let resource = cluster
        .api_resource_for(&gvk)
        .await
        .map_err(|err| format!("failed to delete {label}: {err}"))?;
    match cluster.delete_dynamic_resource(name, &resource, true).await {
        Ok(()) => Ok(()),
        Err(err) if err.is_not_found() || err.is_method_not_supported() => {
            debug!(resource = %label, "delete skipped, resource gone or kind not deletable");
            Ok(())
        }
        Err(err) => Err(format!("failed to delete {label}: {err}")),
    }
}

fn describe(obj: &DynamicObject) -> String {
    let kind = obj
        .types
        .as_ref()
        .map(|t| t.kind.as_str())
        .unwrap_or("Unknown");
    format!("{kind}/{}", obj.metadata.name.as_deref().unwrap_or_default())
}

/// Binding secrets are unbound from the workload before the secret itself
/// goes away, sequentially: unbinding rewrites the Deployment and must not
/// race itself.
pub(crate) async fn delete_binding_secrets(
    cluster: &dyn ClusterClient,
    bindings: &dyn BindingClient,
    secrets: Vec<DynamicObject>,
) -> Result<(), EngineError> {
    for secret in secrets {
        let name = secret
            .metadata
            .name
            .clone()
            .unwrap_or_default();
        info!(secret = %name, "removing service binding secret");
        bindings
            .unbind(&name)
            .await
            .map_err(|err| EngineError::Other(err.context(format!("unbinding secret {name}"))))?;
        match cluster.delete_secret(&name).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                debug!(secret = %name, "secret already gone");
            }
            Err(err) => {
                return Err(EngineError::cluster(format!("deleting secret {name}"))(err))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use devloop_cluster::mock::MockCluster;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};

    fn request() -> ReconcileRequest {
        ReconcileRequest::new("backend", "app", "test", "devfile.yaml").unwrap()
    }

    fn component_labels() -> labels::LabelSet {
        labels::labels_for("backend", "app", None, labels::MODE_DEV, false)
    }

    fn dynamic(api_version: &str, kind: &str, name: &str) -> DynamicObject {
        let value = serde_json::json!({
            "apiVersion": api_version,
            "kind": kind,
            "metadata": { "name": name, "uid": format!("uid-{name}"), "labels": component_labels() },
        });
        serde_json::from_value(value).unwrap()
    }

    fn devfile_with_configmap() -> Devfile {
        Devfile::parse(
            r#"
schemaVersion: 2.2.0
components:
  - name: settings
    kubernetes:
      inlined: |
        apiVersion: v1
        kind: ConfigMap
        metadata:
          name: app-settings
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn unmatched_resources_become_orphans() {
        let cluster = MockCluster::new();
        cluster.insert_dynamic(dynamic("v1", "ConfigMap", "app-settings"));
        cluster.insert_dynamic(dynamic("v1", "ConfigMap", "leftover"));
        let diff = remote_resources_not_in_devfile(
            &cluster,
            &request(),
            &devfile_with_configmap(),
            "app=app",
        )
        .await
        .unwrap();
        let names: Vec<_> = diff
            .orphans
            .iter()
            .map(|o| o.metadata.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["leftover"]);
        assert!(diff.binding_secrets.is_empty());
    }

    #[tokio::test]
    async fn matching_ignores_api_version() {
        let cluster = MockCluster::new();
        // served under a different version than the devfile declares
        cluster.insert_dynamic(dynamic("v2", "ConfigMap", "app-settings"));
        let diff = remote_resources_not_in_devfile(
            &cluster,
            &request(),
            &devfile_with_configmap(),
            "app=app",
        )
        .await
        .unwrap();
        assert!(diff.orphans.is_empty());
    }

    #[tokio::test]
    async fn owned_resources_are_left_to_their_owner() {
        let cluster = MockCluster::new();
        let parent = dynamic("batch/v1", "CronJob", "parent");
        let mut child = dynamic("batch/v1", "Job", "child");
        child.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "batch/v1".to_string(),
            kind: "CronJob".to_string(),
            name: "parent".to_string(),
            uid: "uid-parent".to_string(),
            ..Default::default()
        }]);
        cluster.insert_dynamic(parent);
        cluster.insert_dynamic(child);
        let diff = remote_resources_not_in_devfile(
            &cluster,
            &request(),
            &devfile_with_configmap(),
            "app=app",
        )
        .await
        .unwrap();
        let names: Vec<_> = diff
            .orphans
            .iter()
            .map(|o| o.metadata.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["parent"]);
    }

    #[tokio::test]
    async fn finalizing_resources_without_our_annotation_are_skipped() {
        let cluster = MockCluster::new();
        let now = Time(k8s_openapi::chrono::Utc::now());
        let mut finalizing = dynamic("v1", "ConfigMap", "finalizing");
        finalizing.metadata.deletion_timestamp = Some(now.clone());
        let mut ours = dynamic("v1", "ConfigMap", "ours");
        ours.metadata.deletion_timestamp = Some(now);
        let mut annotations = labels::LabelSet::new();
        labels::set_project_type(&mut annotations, "nodejs");
        ours.metadata.annotations = Some(annotations);
        cluster.insert_dynamic(finalizing);
        cluster.insert_dynamic(ours);
        let diff = remote_resources_not_in_devfile(
            &cluster,
            &request(),
            &devfile_with_configmap(),
            "app=app",
        )
        .await
        .unwrap();
        let names: Vec<_> = diff
            .orphans
            .iter()
            .map(|o| o.metadata.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["ours"]);
    }

    #[tokio::test]
    async fn core_components_are_never_candidates() {
        let cluster = MockCluster::new();
        let mut core = dynamic("apps/v1", "Deployment", "backend-app");
        core.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(labels::COMPONENT_LABEL.to_string(), "backend".to_string());
        cluster.insert_dynamic(core);
        let diff = remote_resources_not_in_devfile(
            &cluster,
            &request(),
            &devfile_with_configmap(),
            "app=app",
        )
        .await
        .unwrap();
        assert!(diff.orphans.is_empty());
    }

    #[tokio::test]
    async fn unmatched_link_secrets_take_the_unbind_path() {
        let cluster = MockCluster::new();
        let mut secret = dynamic("v1", "Secret", "backend-redis-link");
        secret
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(labels::LINK_LABEL.to_string(), "redis-binding".to_string());
        cluster.insert_dynamic(secret);
        let devfile = Devfile::parse(
            r#"
schemaVersion: 2.2.0
components:
  - name: redis-binding
    kubernetes:
      inlined: |
        apiVersion: binding.operators.coreos.com/v1alpha1
        kind: ServiceBinding
        metadata:
          name: redis-binding
commands:
  - id: bind
    apply: { component: redis-binding }
"#,
        )
        .unwrap();
        let diff = remote_resources_not_in_devfile(&cluster, &request(), &devfile, "app=app")
            .await
            .unwrap();
        assert!(diff.orphans.is_empty());
        assert_eq!(diff.binding_secrets.len(), 1);
    }

    #[tokio::test]
    async fn deletion_tolerates_missing_resources() {
        let cluster = Arc::new(MockCluster::new());
        let never_stored = dynamic("v1", "ConfigMap", "already-gone");
        delete_orphans(cluster.clone() as Arc<dyn ClusterClient>, vec![never_stored])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn deletion_failures_are_collected_per_resource() {
        let cluster = Arc::new(MockCluster::new());
        cluster.insert_dynamic(dynamic("v1", "ConfigMap", "stubborn"));
        cluster.inject_error("delete_dynamic_resource", "server on fire");
        let err = delete_orphans(
            cluster.clone() as Arc<dyn ClusterClient>,
            vec![dynamic("v1", "ConfigMap", "stubborn")],
        )
        .await
        .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("failed to delete"), "{text}");
        assert!(text.contains("ConfigMap/stubborn"), "{text}");
    }
}
