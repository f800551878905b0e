//! devloop cluster port: typed Kubernetes access behind one trait, plus the
//! kube-rs implementation, discovery helpers and watch wiring.

#![forbid(unsafe_code)]

pub mod mock;
pub mod watch;

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, PropagationPolicy};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta};
use kube::discovery::{verbs, Discovery, Scope};
use kube::Client;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Field manager stamped on every server-side apply issued by devloop.
pub const FIELD_MANAGER: &str = "devloop";

/// API group served by the service-binding operator when it is installed.
pub const BINDING_OPERATOR_GROUP: &str = "binding.operators.coreos.com";

/// Pod security admission level enforced on the target namespace, read from
/// the `pod-security.kubernetes.io/enforce` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PodSecurityLevel {
    #[default]
    Privileged,
    Baseline,
    Restricted,
}

impl PodSecurityLevel {
    pub fn parse(value: &str) -> Self {
        match value {
            "restricted" => PodSecurityLevel::Restricted,
            "baseline" => PodSecurityLevel::Baseline,
            _ => PodSecurityLevel::Privileged,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("method not supported: {0}")]
    MethodNotSupported(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("expected at most one {kind} matching {selector:?}, found {count}")]
    TooManyMatches {
        kind: &'static str,
        selector: String,
        count: usize,
    },
    #[error("no served API resource for {0}")]
    UnknownGvk(String),
    #[error("{0}")]
    Internal(String),
    #[error(transparent)]
    Api(kube::Error),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    pub fn is_method_not_supported(&self) -> bool {
        matches!(self, ClusterError::MethodNotSupported(_))
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self, ClusterError::Forbidden(_))
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) => match ae.code {
                404 => ClusterError::NotFound(ae.message),
                405 => ClusterError::MethodNotSupported(ae.message),
                403 => ClusterError::Forbidden(ae.message),
                409 => ClusterError::Conflict(ae.message),
                _ => ClusterError::Api(kube::Error::Api(ae)),
            },
            other => ClusterError::Api(other),
        }
    }
}

/// Everything the reconciler needs from a live cluster. One implementation
/// talks to Kubernetes ([`KubeCluster`]); [`mock::MockCluster`] serves tests.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    fn namespace(&self) -> &str;

    async fn namespace_policy(&self) -> Result<PodSecurityLevel, ClusterError>;

    /// Server-side apply support: servers from 1.16 on. Cached after the
    /// first call; version-parse failures count as supported.
    async fn is_ssa_supported(&self) -> bool;

    /// Whether the service-binding operator serves its API group.
    async fn is_service_binding_supported(&self) -> Result<bool, ClusterError>;

    /// The single Deployment matching `selector`, if any. More than one
    /// match is an error, not a choice.
    async fn deployment_for_selector(
        &self,
        selector: &str,
    ) -> Result<Option<Deployment>, ClusterError>;

    async fn create_deployment(&self, deployment: Deployment) -> Result<Deployment, ClusterError>;

    async fn update_deployment(&self, deployment: Deployment) -> Result<Deployment, ClusterError>;

    /// Server-side apply with devloop's field manager, forcing conflicts.
    async fn apply_deployment(&self, deployment: Deployment) -> Result<Deployment, ClusterError>;

    async fn service_for_component(
        &self,
        component_name: &str,
        app_name: &str,
    ) -> Result<Option<Service>, ClusterError>;

    async fn create_service(&self, service: Service) -> Result<Service, ClusterError>;

    async fn update_service(&self, service: Service) -> Result<Service, ClusterError>;

    async fn delete_service(&self, name: &str) -> Result<(), ClusterError>;

    /// Every namespaced, listable object carrying `selector`, across all
    /// served kinds. Kinds the caller may not list are skipped.
    async fn resources_for_selector(
        &self,
        selector: &str,
    ) -> Result<Vec<DynamicObject>, ClusterError>;

    async fn api_resource_for(&self, gvk: &GroupVersionKind) -> Result<ApiResource, ClusterError>;

    async fn apply_dynamic_resource(
        &self,
        object: DynamicObject,
        resource: &ApiResource,
    ) -> Result<DynamicObject, ClusterError>;

    /// Foreground deletion when `wait`, background otherwise.
    async fn delete_dynamic_resource(
        &self,
        name: &str,
        resource: &ApiResource,
        wait: bool,
    ) -> Result<(), ClusterError>;

    async fn delete_secret(&self, name: &str) -> Result<(), ClusterError>;

    async fn list_pvcs(&self, selector: &str) -> Result<Vec<PersistentVolumeClaim>, ClusterError>;

    async fn create_pvc(
        &self,
        pvc: PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, ClusterError>;

    async fn set_pvc_owner(&self, name: &str, owner: OwnerReference) -> Result<(), ClusterError>;

    /// The running pod backing the component, if one exists yet.
    async fn running_pod_for_component(
        &self,
        component_name: &str,
        app_name: &str,
    ) -> Result<Option<Pod>, ClusterError>;
}

/// kube-rs implementation of [`ClusterClient`], bound to one namespace.
pub struct KubeCluster {
    client: Client,
    namespace: String,
    ssa_supported: OnceCell<bool>,
    binding_supported: OnceCell<bool>,
}

impl KubeCluster {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            ssa_supported: OnceCell::new(),
            binding_supported: OnceCell::new(),
        }
    }

    /// Connects with the ambient kubeconfig; `namespace` falls back to the
    /// config's default when not given.
    pub async fn try_default(namespace: Option<&str>) -> anyhow::Result<Self> {
        let client = Client::try_default().await?;
        let namespace = namespace
            .map(str::to_string)
            .unwrap_or_else(|| client.default_namespace().to_string());
        Ok(Self::new(client, namespace))
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pvcs(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn server_supports_ssa(&self) -> bool {
        let info = match self.client.apiserver_version().await {
            Ok(info) => info,
            Err(err) => {
                warn!(error = %err, "could not read server version; assuming server-side apply");
                return true;
            }
        };
        match (parse_version_part(&info.major), parse_version_part(&info.minor)) {
            (Some(major), Some(minor)) => (major, minor) >= (1, 16),
            _ => {
                warn!(major = %info.major, minor = %info.minor, "unparseable server version; assuming server-side apply");
                true
            }
        }
    }
}

fn parse_version_part(part: &str) -> Option<u32> {
    let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

#[async_trait::async_trait]
impl ClusterClient for KubeCluster {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn namespace_policy(&self) -> Result<PodSecurityLevel, ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = api.get(&self.namespace).await?;
        let level = ns
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get("pod-security.kubernetes.io/enforce"))
            .map(|v| PodSecurityLevel::parse(v))
            .unwrap_or_default();
        Ok(level)
    }

    async fn is_ssa_supported(&self) -> bool {
        *self
            .ssa_supported
            .get_or_init(|| self.server_supports_ssa())
            .await
    }

    async fn is_service_binding_supported(&self) -> Result<bool, ClusterError> {
        let supported = self
            .binding_supported
            .get_or_try_init(|| async {
                let discovery = Discovery::new(self.client.clone())
                    .filter(&[BINDING_OPERATOR_GROUP])
                    .run()
                    .await
                    .map_err(ClusterError::from)?;
                let found = discovery
                    .groups()
                    .any(|g| g.name() == BINDING_OPERATOR_GROUP);
                Ok::<bool, ClusterError>(found)
            })
            .await?;
        Ok(*supported)
    }

    async fn deployment_for_selector(
        &self,
        selector: &str,
    ) -> Result<Option<Deployment>, ClusterError> {
        let lp = ListParams::default().labels(selector);
        let mut items = self.deployments().list(&lp).await?.items;
        match items.len() {
            0 => Ok(None),
            1 => Ok(Some(items.remove(0))),
            count => Err(ClusterError::TooManyMatches {
                kind: "Deployment",
                selector: selector.to_string(),
                count,
            }),
        }
    }

    async fn create_deployment(&self, deployment: Deployment) -> Result<Deployment, ClusterError> {
        Ok(self
            .deployments()
            .create(&PostParams::default(), &deployment)
            .await?)
    }

    async fn update_deployment(&self, deployment: Deployment) -> Result<Deployment, ClusterError> {
        let name = require_name(&deployment.metadata.name, "Deployment")?;
        Ok(self
            .deployments()
            .replace(&name, &PostParams::default(), &deployment)
            .await?)
    }

    async fn apply_deployment(&self, deployment: Deployment) -> Result<Deployment, ClusterError> {
        let name = require_name(&deployment.metadata.name, "Deployment")?;
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        Ok(self
            .deployments()
            .patch(&name, &pp, &Patch::Apply(&deployment))
            .await?)
    }

    async fn service_for_component(
        &self,
        component_name: &str,
        app_name: &str,
    ) -> Result<Option<Service>, ClusterError> {
        let selector = devloop_core::labels::selector(
            component_name,
            app_name,
            devloop_core::labels::MODE_DEV,
            true,
        );
        let lp = ListParams::default().labels(&selector);
        let mut items = self.services().list(&lp).await?.items;
        match items.len() {
            0 => Ok(None),
            1 => Ok(Some(items.remove(0))),
            count => Err(ClusterError::TooManyMatches {
                kind: "Service",
                selector,
                count,
            }),
        }
    }

    async fn create_service(&self, service: Service) -> Result<Service, ClusterError> {
        Ok(self
            .services()
            .create(&PostParams::default(), &service)
            .await?)
    }

    async fn update_service(&self, service: Service) -> Result<Service, ClusterError> {
        let name = require_name(&service.metadata.name, "Service")?;
        Ok(self
            .services()
            .replace(&name, &PostParams::default(), &service)
            .await?)
    }

    async fn delete_service(&self, name: &str) -> Result<(), ClusterError> {
        self.services()
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn resources_for_selector(
        &self,
        selector: &str,
    ) -> Result<Vec<DynamicObject>, ClusterError> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        let lp = ListParams::default().labels(selector);
        let mut out = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if !matches!(caps.scope, Scope::Namespaced) || !caps.supports_operation(verbs::LIST)
                {
                    continue;
                }
                let api: Api<DynamicObject> =
                    Api::namespaced_with(self.client.clone(), &self.namespace, &ar);
                let list = match api.list(&lp).await {
                    Ok(list) => list,
                    Err(err) => {
                        let err = ClusterError::from(err);
                        if err.is_forbidden() || err.is_not_found() || err.is_method_not_supported()
                        {
                            debug!(group = %ar.group, kind = %ar.kind, error = %err, "skipping unlistable kind");
                            continue;
                        }
                        return Err(err);
                    }
                };
                for mut obj in list.items {
                    // list items frequently come back without type metadata
                    if obj.types.is_none() {
                        obj.types = Some(TypeMeta {
                            api_version: ar.api_version.clone(),
                            kind: ar.kind.clone(),
                        });
                    }
                    out.push(obj);
                }
            }
        }
        Ok(out)
    }

    async fn api_resource_for(&self, gvk: &GroupVersionKind) -> Result<ApiResource, ClusterError> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        for group in discovery.groups() {
            for (ar, _caps) in group.recommended_resources() {
                if ar.group == gvk.group && ar.kind == gvk.kind {
                    return Ok(ar.clone());
                }
            }
        }
        Err(ClusterError::UnknownGvk(format!(
            "{}/{}/{}",
            gvk.group, gvk.version, gvk.kind
        )))
    }

    async fn apply_dynamic_resource(
        &self,
        object: DynamicObject,
        resource: &ApiResource,
    ) -> Result<DynamicObject, ClusterError> {
        let name = require_name(&object.metadata.name, &resource.kind)?;
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &self.namespace, resource);
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        Ok(api.patch(&name, &pp, &Patch::Apply(&object)).await?)
    }

    async fn delete_dynamic_resource(
        &self,
        name: &str,
        resource: &ApiResource,
        wait: bool,
    ) -> Result<(), ClusterError> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &self.namespace, resource);
        let dp = DeleteParams {
            propagation_policy: Some(if wait {
                PropagationPolicy::Foreground
            } else {
                PropagationPolicy::Background
            }),
            ..Default::default()
        };
        api.delete(name, &dp).await?;
        Ok(())
    }

    async fn delete_secret(&self, name: &str) -> Result<(), ClusterError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn list_pvcs(&self, selector: &str) -> Result<Vec<PersistentVolumeClaim>, ClusterError> {
        let lp = ListParams::default().labels(selector);
        Ok(self.pvcs().list(&lp).await?.items)
    }

    async fn create_pvc(
        &self,
        pvc: PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, ClusterError> {
        Ok(self.pvcs().create(&PostParams::default(), &pvc).await?)
    }

    async fn set_pvc_owner(&self, name: &str, owner: OwnerReference) -> Result<(), ClusterError> {
        let patch = serde_json::json!({ "metadata": { "ownerReferences": [owner] } });
        self.pvcs()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn running_pod_for_component(
        &self,
        component_name: &str,
        app_name: &str,
    ) -> Result<Option<Pod>, ClusterError> {
        let selector = devloop_core::labels::selector(
            component_name,
            app_name,
            devloop_core::labels::MODE_DEV,
            true,
        );
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let lp = ListParams::default()
            .labels(&selector)
            .fields("status.phase=Running");
        let mut pods = api.list(&lp).await?.items;
        // newest pod wins when a rollout briefly leaves two running
        pods.sort_by_key(|p| p.metadata.creation_timestamp.as_ref().map(|t| t.0));
        Ok(pods.pop())
    }
}

fn require_name(name: &Option<String>, kind: &str) -> Result<String, ClusterError> {
    name.clone()
        .ok_or_else(|| ClusterError::Internal(format!("{kind} object has no metadata.name")))
}

/// Owner reference pointing at the component's Deployment.
pub fn owner_reference_for(
    deployment: &Deployment,
    block_owner_deletion: bool,
) -> Result<OwnerReference, ClusterError> {
    let name = require_name(&deployment.metadata.name, "Deployment")?;
    let uid = deployment
        .metadata
        .uid
        .clone()
        .ok_or_else(|| ClusterError::Internal("Deployment object has no metadata.uid".into()))?;
    Ok(OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: "Deployment".to_string(),
        name,
        uid,
        controller: Some(true),
        block_owner_deletion: Some(block_owner_deletion),
    })
}

/// GVK of a dynamic object, from its type metadata.
pub fn gvk_of(obj: &DynamicObject) -> Option<GroupVersionKind> {
    let types = obj.types.as_ref()?;
    let (group, version) = match types.api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), types.api_version.clone()),
    };
    Some(GroupVersionKind {
        group,
        version,
        kind: types.kind.clone(),
    })
}

/// True when every `key=value` pair of the selector is present in `labels`.
pub fn selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector
        .split(',')
        .filter(|pair| !pair.is_empty())
        .all(|pair| match pair.split_once('=') {
            Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
            None => false,
        })
}
