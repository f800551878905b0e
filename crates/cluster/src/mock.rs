//! In-memory [`ClusterClient`] for tests: stores objects, records calls,
//! bumps Deployment generations only when the spec actually changes.

use std::collections::HashMap;
use std::sync::Mutex;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, PodSpec, PodStatus, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta};

use crate::{selector_matches, ClusterClient, ClusterError, PodSecurityLevel};

#[derive(Default)]
struct State {
    deployments: Vec<Deployment>,
    services: Vec<Service>,
    pods: Vec<Pod>,
    pvcs: Vec<PersistentVolumeClaim>,
    dynamic: Vec<DynamicObject>,
    calls: Vec<String>,
    injected: HashMap<String, String>,
}

pub struct MockCluster {
    namespace: String,
    ssa: bool,
    binding: bool,
    policy: PodSecurityLevel,
    state: Mutex<State>,
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCluster {
    pub fn new() -> Self {
        Self {
            namespace: "test".to_string(),
            ssa: true,
            binding: false,
            policy: PodSecurityLevel::Privileged,
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_ssa(mut self, ssa: bool) -> Self {
        self.ssa = ssa;
        self
    }

    pub fn with_binding_support(mut self, binding: bool) -> Self {
        self.binding = binding;
        self
    }

    pub fn with_policy(mut self, policy: PodSecurityLevel) -> Self {
        self.policy = policy;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record(&self, call: String) {
        self.lock().calls.push(call);
    }

    fn take_injected(&self, method: &str) -> Result<(), ClusterError> {
        if let Some(message) = self.lock().injected.remove(method) {
            return Err(ClusterError::Internal(message));
        }
        Ok(())
    }

    /// Make the next call of `method` fail with an internal error.
    pub fn inject_error(&self, method: &str, message: &str) {
        self.lock()
            .injected
            .insert(method.to_string(), message.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Calls that change cluster state; reads are filtered out.
    pub fn mutating_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| {
                c.starts_with("create")
                    || c.starts_with("update")
                    || c.starts_with("apply")
                    || c.starts_with("delete")
                    || c.starts_with("set_pvc_owner")
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn stored_deployment(&self, name: &str) -> Option<Deployment> {
        self.lock()
            .deployments
            .iter()
            .find(|d| d.metadata.name.as_deref() == Some(name))
            .cloned()
    }

    pub fn stored_service(&self, name: &str) -> Option<Service> {
        self.lock()
            .services
            .iter()
            .find(|s| s.metadata.name.as_deref() == Some(name))
            .cloned()
    }

    pub fn stored_pvcs(&self) -> Vec<PersistentVolumeClaim> {
        self.lock().pvcs.clone()
    }

    pub fn dynamic_names(&self) -> Vec<String> {
        self.lock()
            .dynamic
            .iter()
            .filter_map(|o| o.metadata.name.clone())
            .collect()
    }

    pub fn insert_dynamic(&self, obj: DynamicObject) {
        self.lock().dynamic.push(obj);
    }

    pub fn insert_pod(&self, pod: Pod) {
        self.lock().pods.push(pod);
    }

    pub fn insert_pvc(&self, pvc: PersistentVolumeClaim) {
        self.lock().pvcs.push(pvc);
    }

    /// Mark the stored deployment ready, the way a completed rollout would.
    pub fn set_ready_replicas(&self, name: &str, ready: i32) {
        let mut state = self.lock();
        if let Some(dep) = state
            .deployments
            .iter_mut()
            .find(|d| d.metadata.name.as_deref() == Some(name))
        {
            let status = dep.status.get_or_insert_with(Default::default);
            status.ready_replicas = Some(ready);
        }
    }

    /// A running pod labelled like the component, with one container per name.
    pub fn running_pod(component_name: &str, app_name: &str, containers: &[&str]) -> Pod {
        let labels = devloop_core::labels::labels_for(
            component_name,
            app_name,
            None,
            devloop_core::labels::MODE_DEV,
            true,
        );
        Pod {
            metadata: ObjectMeta {
                name: Some(format!("{component_name}-{app_name}-7f9b")),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: containers
                    .iter()
                    .map(|name| k8s_openapi::api::core::v1::Container {
                        name: (*name).to_string(),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
        }
    }
}

fn spec_changed(old: &Deployment, new: &Deployment) -> bool {
    let old_spec = serde_json::to_value(&old.spec).unwrap_or_default();
    let new_spec = serde_json::to_value(&new.spec).unwrap_or_default();
    old_spec != new_spec
}

fn to_dynamic<K: serde::Serialize>(
    obj: &K,
    api_version: &str,
    kind: &str,
) -> Result<DynamicObject, ClusterError> {
    let mut value =
        serde_json::to_value(obj).map_err(|e| ClusterError::Internal(e.to_string()))?;
    if let Some(map) = value.as_object_mut() {
        map.insert("apiVersion".into(), api_version.into());
        map.insert("kind".into(), kind.into());
    }
    serde_json::from_value(value).map_err(|e| ClusterError::Internal(e.to_string()))
}

fn labels_of(meta: &ObjectMeta) -> std::collections::BTreeMap<String, String> {
    meta.labels.clone().unwrap_or_default()
}

#[async_trait::async_trait]
impl ClusterClient for MockCluster {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn namespace_policy(&self) -> Result<PodSecurityLevel, ClusterError> {
        Ok(self.policy)
    }

    async fn is_ssa_supported(&self) -> bool {
        self.ssa
    }

    async fn is_service_binding_supported(&self) -> Result<bool, ClusterError> {
        Ok(self.binding)
    }

    async fn deployment_for_selector(
        &self,
        selector: &str,
    ) -> Result<Option<Deployment>, ClusterError> {
        self.record(format!("deployment_for_selector({selector})"));
        let state = self.lock();
        let mut matches: Vec<_> = state
            .deployments
            .iter()
            .filter(|d| selector_matches(selector, &labels_of(&d.metadata)))
            .cloned()
            .collect();
        match matches.len() {
            0 => Ok(None),
            1 => Ok(Some(matches.remove(0))),
            count => Err(ClusterError::TooManyMatches {
                kind: "Deployment",
                selector: selector.to_string(),
                count,
            }),
        }
    }

    async fn create_deployment(&self, mut deployment: Deployment) -> Result<Deployment, ClusterError> {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        self.record(format!("create_deployment({name})"));
        self.take_injected("create_deployment")?;
        deployment.metadata.uid = Some(format!("uid-{name}"));
        deployment.metadata.generation = Some(1);
        self.lock().deployments.push(deployment.clone());
        Ok(deployment)
    }

    async fn update_deployment(&self, deployment: Deployment) -> Result<Deployment, ClusterError> {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        self.record(format!("update_deployment({name})"));
        self.take_injected("update_deployment")?;
        self.upsert(deployment)
    }

    async fn apply_deployment(&self, deployment: Deployment) -> Result<Deployment, ClusterError> {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        self.record(format!("apply_deployment({name})"));
        self.take_injected("apply_deployment")?;
        self.upsert(deployment)
    }

    async fn service_for_component(
        &self,
        component_name: &str,
        app_name: &str,
    ) -> Result<Option<Service>, ClusterError> {
        self.record(format!("service_for_component({component_name})"));
        let selector = devloop_core::labels::selector(
            component_name,
            app_name,
            devloop_core::labels::MODE_DEV,
            true,
        );
        let state = self.lock();
        let mut matches: Vec<_> = state
            .services
            .iter()
            .filter(|s| selector_matches(&selector, &labels_of(&s.metadata)))
            .cloned()
            .collect();
        match matches.len() {
            0 => Ok(None),
            1 => Ok(Some(matches.remove(0))),
            count => Err(ClusterError::TooManyMatches {
                kind: "Service",
                selector,
                count,
            }),
        }
    }

    async fn create_service(&self, mut service: Service) -> Result<Service, ClusterError> {
        let name = service.metadata.name.clone().unwrap_or_default();
        self.record(format!("create_service({name})"));
        self.take_injected("create_service")?;
        service.metadata.uid = Some(format!("uid-{name}"));
        service.metadata.resource_version = Some("1".to_string());
        self.lock().services.push(service.clone());
        Ok(service)
    }

    async fn update_service(&self, service: Service) -> Result<Service, ClusterError> {
        let name = service.metadata.name.clone().unwrap_or_default();
        self.record(format!("update_service({name})"));
        self.take_injected("update_service")?;
        let mut state = self.lock();
        match state
            .services
            .iter_mut()
            .find(|s| s.metadata.name == service.metadata.name)
        {
            Some(stored) => {
                *stored = service.clone();
                Ok(service)
            }
            None => Err(ClusterError::NotFound(format!("services {name:?}"))),
        }
    }

    async fn delete_service(&self, name: &str) -> Result<(), ClusterError> {
        self.record(format!("delete_service({name})"));
        self.take_injected("delete_service")?;
        let mut state = self.lock();
        let before = state.services.len();
        state
            .services
            .retain(|s| s.metadata.name.as_deref() != Some(name));
        if state.services.len() == before {
            return Err(ClusterError::NotFound(format!("services {name:?}")));
        }
        Ok(())
    }

    async fn resources_for_selector(
        &self,
        selector: &str,
    ) -> Result<Vec<DynamicObject>, ClusterError> {
        self.record(format!("resources_for_selector({selector})"));
        let state = self.lock();
        let mut out = Vec::new();
        for d in &state.deployments {
            if selector_matches(selector, &labels_of(&d.metadata)) {
                out.push(to_dynamic(d, "apps/v1", "Deployment")?);
            }
        }
        for s in &state.services {
            if selector_matches(selector, &labels_of(&s.metadata)) {
                out.push(to_dynamic(s, "v1", "Service")?);
            }
        }
        for p in &state.pvcs {
            if selector_matches(selector, &labels_of(&p.metadata)) {
                out.push(to_dynamic(p, "v1", "PersistentVolumeClaim")?);
            }
        }
        for obj in &state.dynamic {
            if selector_matches(selector, &labels_of(&obj.metadata)) {
                out.push(obj.clone());
            }
        }
        Ok(out)
    }

    async fn api_resource_for(&self, gvk: &GroupVersionKind) -> Result<ApiResource, ClusterError> {
        Ok(ApiResource::from_gvk(gvk))
    }

    async fn apply_dynamic_resource(
        &self,
        object: DynamicObject,
        resource: &ApiResource,
    ) -> Result<DynamicObject, ClusterError> {
        let name = object.metadata.name.clone().unwrap_or_default();
        self.record(format!("apply_dynamic_resource({}/{name})", resource.kind));
        self.take_injected("apply_dynamic_resource")?;
        let mut state = self.lock();
        let same = |o: &DynamicObject| {
            o.metadata.name == object.metadata.name
                && o.types.as_ref().map(|t| t.kind.as_str()) == Some(resource.kind.as_str())
        };
        state.dynamic.retain(|o| !same(o));
        let mut object = object;
        if object.types.is_none() {
            object.types = Some(TypeMeta {
                api_version: resource.api_version.clone(),
                kind: resource.kind.clone(),
            });
        }
        state.dynamic.push(object.clone());
        Ok(object)
    }

    async fn delete_dynamic_resource(
        &self,
        name: &str,
        resource: &ApiResource,
        _wait: bool,
    ) -> Result<(), ClusterError> {
        self.record(format!("delete_dynamic_resource({}/{name})", resource.kind));
        self.take_injected("delete_dynamic_resource")?;
        let mut state = self.lock();
        let before = state.dynamic.len();
        state.dynamic.retain(|o| {
            !(o.metadata.name.as_deref() == Some(name)
                && o.types.as_ref().map(|t| t.kind.as_str()) == Some(resource.kind.as_str()))
        });
        if state.dynamic.len() == before {
            return Err(ClusterError::NotFound(format!(
                "{} {name:?}",
                resource.kind
            )));
        }
        Ok(())
    }

    async fn delete_secret(&self, name: &str) -> Result<(), ClusterError> {
        self.record(format!("delete_secret({name})"));
        self.take_injected("delete_secret")?;
        let mut state = self.lock();
        let before = state.dynamic.len();
        state.dynamic.retain(|o| {
            !(o.metadata.name.as_deref() == Some(name)
                && o.types.as_ref().map(|t| t.kind.as_str()) == Some("Secret"))
        });
        if state.dynamic.len() == before {
            return Err(ClusterError::NotFound(format!("secrets {name:?}")));
        }
        Ok(())
    }

    async fn list_pvcs(&self, selector: &str) -> Result<Vec<PersistentVolumeClaim>, ClusterError> {
        self.record(format!("list_pvcs({selector})"));
        let state = self.lock();
        Ok(state
            .pvcs
            .iter()
            .filter(|p| selector_matches(selector, &labels_of(&p.metadata)))
            .cloned()
            .collect())
    }

    async fn create_pvc(
        &self,
        mut pvc: PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, ClusterError> {
        let name = pvc.metadata.name.clone().unwrap_or_default();
        self.record(format!("create_pvc({name})"));
        self.take_injected("create_pvc")?;
        pvc.metadata.uid = Some(format!("uid-{name}"));
        self.lock().pvcs.push(pvc.clone());
        Ok(pvc)
    }

    async fn set_pvc_owner(&self, name: &str, owner: OwnerReference) -> Result<(), ClusterError> {
        self.record(format!("set_pvc_owner({name})"));
        self.take_injected("set_pvc_owner")?;
        let mut state = self.lock();
        match state
            .pvcs
            .iter_mut()
            .find(|p| p.metadata.name.as_deref() == Some(name))
        {
            Some(pvc) => {
                pvc.metadata.owner_references = Some(vec![owner]);
                Ok(())
            }
            None => Err(ClusterError::NotFound(format!(
                "persistentvolumeclaims {name:?}"
            ))),
        }
    }

    async fn running_pod_for_component(
        &self,
        component_name: &str,
        app_name: &str,
    ) -> Result<Option<Pod>, ClusterError> {
        self.record(format!("running_pod_for_component({component_name})"));
        let selector = devloop_core::labels::selector(
            component_name,
            app_name,
            devloop_core::labels::MODE_DEV,
            true,
        );
        let state = self.lock();
        Ok(state
            .pods
            .iter()
            .find(|p| {
                selector_matches(&selector, &labels_of(&p.metadata))
                    && p.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
            })
            .cloned())
    }
}

impl MockCluster {
    fn upsert(&self, mut deployment: Deployment) -> Result<Deployment, ClusterError> {
        let mut state = self.lock();
        match state
            .deployments
            .iter_mut()
            .find(|d| d.metadata.name == deployment.metadata.name)
        {
            Some(stored) => {
                let generation = stored.metadata.generation.unwrap_or(1)
                    + i64::from(spec_changed(stored, &deployment));
                deployment.metadata.uid = stored.metadata.uid.clone();
                deployment.metadata.generation = Some(generation);
                deployment.status = stored.status.clone();
                *stored = deployment.clone();
                Ok(deployment)
            }
            None => {
                let name = deployment.metadata.name.clone().unwrap_or_default();
                deployment.metadata.uid = Some(format!("uid-{name}"));
                deployment.metadata.generation = Some(1);
                state.deployments.push(deployment.clone());
                Ok(deployment)
            }
        }
    }
}

/// A typed Secret as a dynamic object, for staging into the mock store.
pub fn secret_as_dynamic(secret: &Secret) -> Result<DynamicObject, ClusterError> {
    to_dynamic(secret, "v1", "Secret")
}
