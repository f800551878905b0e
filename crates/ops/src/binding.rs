//! Service binding status checks and teardown.
//!
//! Two binding API flavors exist in the wild: the operator's own group and
//! the portable spec group. Both surface an `InjectionReady` condition once
//! the binding has landed in the workload.

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, ListParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;
use kube::ResourceExt;
use tracing::{debug, info};

use devloop_core::labels;
use devloop_engine::ports::BindingClient;

const BINDING_GROUPS: &[(&str, &str)] = &[
    ("binding.operators.coreos.com", "v1alpha1"),
    ("servicebinding.io", "v1alpha3"),
];

pub struct OperatorBindingClient {
    client: Client,
    namespace: String,
    /// Workload the bindings inject into; references are stripped from it
    /// when a binding secret goes away.
    deployment_name: String,
}

impl OperatorBindingClient {
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        deployment_name: impl Into<String>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            deployment_name: deployment_name.into(),
        }
    }
}

#[async_trait]
impl BindingClient for OperatorBindingClient {
    async fn injection_done(&self, component_name: &str, app_name: &str) -> Result<bool> {
        let selector = labels::selector(component_name, app_name, labels::MODE_DEV, false);
        let lp = ListParams::default().labels(&selector);
        for (group, version) in BINDING_GROUPS {
            let gvk = GroupVersionKind::gvk(group, version, "ServiceBinding");
            let ar = ApiResource::from_gvk(&gvk);
            let api: Api<DynamicObject> =
                Api::namespaced_with(self.client.clone(), &self.namespace, &ar);
            let list = match api.list(&lp).await {
                Ok(list) => list,
                // This binding flavor is not installed on the cluster.
                Err(kube::Error::Api(ae)) if ae.code == 404 => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("listing {group} service bindings"))
                }
            };
            for item in list {
                if !injection_ready(&item.data) {
                    debug!(binding = %item.name_any(), "binding not injected yet");
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    async fn unbind(&self, secret_name: &str) -> Result<()> {
        // The deployment spec is rebuilt from the devfile on the next pass;
        // dropping the references now keeps the current pod from crash
        // looping on a secret that is about to disappear.
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut deployment = match api.get(&self.deployment_name).await {
            Ok(deployment) => deployment,
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
            Err(e) => return Err(e).context("fetching deployment for unbind"),
        };
        if !strip_secret_references(&mut deployment, secret_name) {
            return Ok(());
        }
        info!(secret = %secret_name, deployment = %self.deployment_name, "detaching binding secret");
        api.replace(&self.deployment_name, &PostParams::default(), &deployment)
            .await
            .context("updating deployment after unbind")?;
        Ok(())
    }
}

fn injection_ready(data: &serde_json::Value) -> bool {
    data.pointer("/status/conditions")
        .and_then(|v| v.as_array())
        .map(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(|t| t.as_str()) == Some("InjectionReady")
                    && c.get("status").and_then(|s| s.as_str()) == Some("True")
            })
        })
        .unwrap_or(false)
}

/// Remove envFrom entries and secret volumes referring to `secret_name`.
/// Returns whether anything changed.
fn strip_secret_references(deployment: &mut Deployment, secret_name: &str) -> bool {
    let pod_spec = match deployment
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
    {
        Some(spec) => spec,
        None => return false,
    };

    let mut changed = false;
    let mut removed_volumes = Vec::new();
    if let Some(volumes) = pod_spec.volumes.as_mut() {
        volumes.retain(|v| {
            let from_secret =
                v.secret.as_ref().and_then(|s| s.secret_name.as_deref()) == Some(secret_name);
            if from_secret {
                removed_volumes.push(v.name.clone());
            }
            !from_secret
        });
        changed |= !removed_volumes.is_empty();
    }
    for container in pod_spec.containers.iter_mut() {
        if let Some(env_from) = container.env_from.as_mut() {
            let before = env_from.len();
            env_from.retain(|e| {
                e.secret_ref.as_ref().and_then(|s| s.name.as_deref()) != Some(secret_name)
            });
            changed |= env_from.len() != before;
        }
        if let Some(mounts) = container.volume_mounts.as_mut() {
            let before = mounts.len();
            mounts.retain(|m| !removed_volumes.contains(&m.name));
            changed |= mounts.len() != before;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        Container, EnvFromSource, PodSpec, PodTemplateSpec, SecretEnvSource, SecretVolumeSource,
        Volume, VolumeMount,
    };
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use serde_json::json;

    #[test]
    fn injection_ready_requires_a_true_condition() {
        let ready = json!({
            "status": {"conditions": [{"type": "InjectionReady", "status": "True"}]}
        });
        let pending = json!({
            "status": {"conditions": [{"type": "InjectionReady", "status": "False"}]}
        });
        let silent = json!({"status": {}});
        assert!(injection_ready(&ready));
        assert!(!injection_ready(&pending));
        assert!(!injection_ready(&silent));
    }

    fn deployment_with_binding(secret: &str) -> Deployment {
        Deployment {
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "runtime".to_string(),
                            env_from: Some(vec![EnvFromSource {
                                secret_ref: Some(SecretEnvSource {
                                    name: Some(secret.to_string()),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            }]),
                            volume_mounts: Some(vec![VolumeMount {
                                name: format!("{secret}-volume"),
                                mount_path: "/bindings".to_string(),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }],
                        volumes: Some(vec![Volume {
                            name: format!("{secret}-volume"),
                            secret: Some(SecretVolumeSource {
                                secret_name: Some(secret.to_string()),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn unbind_strips_env_from_and_volumes() {
        let mut deployment = deployment_with_binding("backend-redis-link");
        assert!(strip_secret_references(&mut deployment, "backend-redis-link"));

        let pod_spec = deployment.spec.unwrap().template.spec.unwrap();
        assert!(pod_spec.volumes.unwrap().is_empty());
        let container = &pod_spec.containers[0];
        assert!(container.env_from.as_ref().unwrap().is_empty());
        assert!(container.volume_mounts.as_ref().unwrap().is_empty());
    }

    #[test]
    fn unrelated_secrets_are_left_alone() {
        let mut deployment = deployment_with_binding("backend-redis-link");
        assert!(!strip_secret_references(&mut deployment, "other-secret"));
        let pod_spec = deployment.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod_spec.volumes.unwrap().len(), 1);
    }
}
