//! Resource synthesis: the Deployment and Service a devfile describes,
//! reconciled against what the cluster already holds.

use std::collections::{BTreeMap, HashSet};

use anyhow::Context as _;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EnvVar as KubeEnvVar, PodSecurityContext, PodSpec,
    PodTemplateSpec, ResourceRequirements, SeccompProfile, SecurityContext, Service, ServicePort,
    ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::{debug, info};

use devloop_cluster::{owner_reference_for, ClusterClient, PodSecurityLevel};
use devloop_core::labels::{self, LabelSet};
use devloop_core::ReconcileRequest;
use devloop_devfile::{ContainerComponent, Devfile, EndpointExposure};

use crate::ports::AutomountProvider;
use crate::{volumes, EngineError};

/// Annotation recording what devloop last applied. A live object whose
/// annotation matches the freshly computed payload needs no write this pass.
pub(crate) const LAST_APPLIED_ANNOTATION: &str = "devloop.dev/last-applied";

pub(crate) const PROJECTS_ROOT: &str = "/projects";

/// Annotations the service-binding operator reads off the component service.
const BINDING_IP_ANNOTATION: (&str, &str) =
    ("service.binding/backend_ip", "path={.spec.clusterIP}");
const BINDING_PORT_ANNOTATION: (&str, &str) = (
    "service.binding/backend_port",
    "path={.spec.ports},elementType=sliceOfMaps,sourceKey=name,sourceValue=port",
);

/// Creates or updates the component Deployment and its Service, returning
/// the live Deployment and whether its generation moved (a spec change the
/// caller must wait out).
#[allow(clippy::too_many_arguments)]
pub(crate) async fn create_or_update_component(
    cluster: &dyn ClusterClient,
    automounts: &dyn AutomountProvider,
    req: &ReconcileRequest,
    devfile: &Devfile,
    existing: Option<Deployment>,
    ephemeral_source: bool,
    default_name: &str,
) -> Result<(Deployment, bool), EngineError> {
    let component = req.component_name();
    let app = req.app_name();
    let runtime = devfile.runtime();

    let mut containers = build_containers(devfile)?;
    let mut init_containers: Vec<Container> = Vec::new();

    let policy = cluster
        .namespace_policy()
        .await
        .map_err(EngineError::cluster("reading namespace pod security policy"))?;

    let pod_volumes = volumes::attach(
        cluster,
        automounts,
        req,
        devfile,
        &mut containers,
        &mut init_containers,
        ephemeral_source,
    )
    .await?;

    if policy == PodSecurityLevel::Restricted {
        harden_containers(&mut containers);
        harden_containers(&mut init_containers);
    }

    let name = existing
        .as_ref()
        .and_then(|d| d.metadata.name.clone())
        .unwrap_or_else(|| default_name.to_string());

    let object_labels = labels::labels_for(component, app, runtime, labels::MODE_DEV, true);
    // the runtime label stays off the template so a devfile metadata edit
    // does not roll every pod
    let template_labels = labels::labels_for(component, app, None, labels::MODE_DEV, true);
    let mut annotations = LabelSet::new();
    labels::set_project_type(&mut annotations, runtime.unwrap_or_default());

    let match_labels = BTreeMap::from([(
        labels::COMPONENT_LABEL.to_string(),
        component.to_string(),
    )]);

    let pod_spec = PodSpec {
        containers,
        init_containers: (!init_containers.is_empty()).then_some(init_containers),
        volumes: (!pod_volumes.is_empty()).then_some(pod_volumes),
        security_context: (policy == PodSecurityLevel::Restricted).then(|| PodSecurityContext {
            run_as_non_root: Some(true),
            seccomp_profile: Some(SeccompProfile {
                type_: "RuntimeDefault".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    let spec = DeploymentSpec {
        replicas: Some(1),
        selector: LabelSelector {
            match_labels: Some(match_labels.clone()),
            ..Default::default()
        },
        strategy: Some(DeploymentStrategy {
            type_: Some("Recreate".to_string()),
            ..Default::default()
        }),
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(template_labels),
                ..Default::default()
            }),
            spec: Some(pod_spec),
        },
        ..Default::default()
    };

    let mut metadata = ObjectMeta {
        name: Some(name.clone()),
        namespace: Some(req.namespace().to_string()),
        labels: Some(object_labels),
        annotations: Some(annotations),
        ..Default::default()
    };
    let payload = last_applied_payload(&metadata, &spec)?;
    let unchanged = existing
        .as_ref()
        .and_then(|d| d.metadata.annotations.as_ref())
        .and_then(|a| a.get(LAST_APPLIED_ANNOTATION))
        == Some(&payload);
    if let Some(annotations) = metadata.annotations.as_mut() {
        annotations.insert(LAST_APPLIED_ANNOTATION.to_string(), payload);
    }
    let desired = Deployment {
        metadata,
        spec: Some(spec),
        ..Default::default()
    };

    let original_generation = existing.as_ref().and_then(|d| d.metadata.generation);
    let (deployment, updated) = match existing {
        Some(live) if unchanged => {
            debug!(deployment = %name, "deployment unchanged, skipping write");
            (live, false)
        }
        Some(live) => {
            let written = if cluster.is_ssa_supported().await {
                cluster.apply_deployment(desired).await
            } else {
                let mut desired = desired;
                desired.metadata.resource_version = live.metadata.resource_version.clone();
                cluster.update_deployment(desired).await
            }
            .map_err(EngineError::cluster(format!("updating deployment {name}")))?;
            let updated = written.metadata.generation != original_generation;
            (written, updated)
        }
        None => {
            let written = if cluster.is_ssa_supported().await {
                cluster.apply_deployment(desired).await
            } else {
                cluster.create_deployment(desired).await
            }
            .map_err(EngineError::cluster(format!("creating deployment {name}")))?;
            info!(deployment = %name, "created deployment");
            (written, true)
        }
    };

    reconcile_service(cluster, req, devfile, &deployment, &match_labels).await?;

    Ok((deployment, updated))
}

/// Containers straight from the devfile, with entrypoints of command-target
/// containers rewritten to block so the exec'd command is the effective
/// process.
fn build_containers(devfile: &Devfile) -> Result<Vec<Container>, EngineError> {
    let command_targets: HashSet<&str> = devfile
        .commands
        .iter()
        .filter_map(|c| c.exec.as_ref())
        .map(|e| e.component.as_str())
        .collect();

    let mut containers = Vec::new();
    for (name, cc) in devfile.container_components() {
        let mut container = Container {
            name: name.to_string(),
            image: Some(cc.image.clone()),
            command: (!cc.command.is_empty()).then(|| cc.command.clone()),
            args: (!cc.args.is_empty()).then(|| cc.args.clone()),
            env: Some(container_env(cc)),
            ports: container_ports(cc),
            resources: container_resources(cc),
            ..Default::default()
        };
        if command_targets.contains(name) && container.command.is_none() && container.args.is_none()
        {
            container.command = Some(vec!["tail".to_string()]);
            container.args = Some(vec!["-f".to_string(), "/dev/null".to_string()]);
        }
        containers.push(container);
    }
    if containers.is_empty() {
        return Err(EngineError::NoValidComponents);
    }
    Ok(containers)
}

fn container_env(cc: &ContainerComponent) -> Vec<KubeEnvVar> {
    let mut env: Vec<KubeEnvVar> = cc
        .env
        .iter()
        .map(|e| KubeEnvVar {
            name: e.name.clone(),
            value: Some(e.value.clone()),
            ..Default::default()
        })
        .collect();
    if cc.mounts_sources() {
        let source = cc
            .source_mapping
            .clone()
            .unwrap_or_else(|| PROJECTS_ROOT.to_string());
        env.push(KubeEnvVar {
            name: "PROJECTS_ROOT".to_string(),
            value: Some(PROJECTS_ROOT.to_string()),
            ..Default::default()
        });
        env.push(KubeEnvVar {
            name: "PROJECT_SOURCE".to_string(),
            value: Some(source),
            ..Default::default()
        });
    }
    env
}

fn container_ports(cc: &ContainerComponent) -> Option<Vec<ContainerPort>> {
    let ports: Vec<ContainerPort> = cc
        .endpoints
        .iter()
        .map(|e| ContainerPort {
            name: Some(e.name.clone()),
            container_port: i32::from(e.target_port),
            protocol: Some(port_protocol(e.protocol.as_deref())),
            ..Default::default()
        })
        .collect();
    (!ports.is_empty()).then_some(ports)
}

fn container_resources(cc: &ContainerComponent) -> Option<ResourceRequirements> {
    let mut limits = BTreeMap::new();
    if let Some(memory) = &cc.memory_limit {
        limits.insert("memory".to_string(), Quantity(memory.clone()));
    }
    if let Some(cpu) = &cc.cpu_limit {
        limits.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    let mut requests = BTreeMap::new();
    if let Some(memory) = &cc.memory_request {
        requests.insert("memory".to_string(), Quantity(memory.clone()));
    }
    if let Some(cpu) = &cc.cpu_request {
        requests.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if limits.is_empty() && requests.is_empty() {
        return None;
    }
    Some(ResourceRequirements {
        limits: (!limits.is_empty()).then_some(limits),
        requests: (!requests.is_empty()).then_some(requests),
        ..Default::default()
    })
}

fn port_protocol(protocol: Option<&str>) -> String {
    match protocol {
        Some("udp") => "UDP".to_string(),
        _ => "TCP".to_string(),
    }
}

fn harden_containers(containers: &mut [Container]) {
    for container in containers {
        container.security_context = Some(SecurityContext {
            allow_privilege_escalation: Some(false),
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
}

/// Service reconciliation, after the Deployment is settled: create when
/// ports appeared, update in place keeping the allocated cluster IP, delete
/// when the devfile stopped exposing anything.
async fn reconcile_service(
    cluster: &dyn ClusterClient,
    req: &ReconcileRequest,
    devfile: &Devfile,
    deployment: &Deployment,
    selector_labels: &BTreeMap<String, String>,
) -> Result<(), EngineError> {
    let component = req.component_name();
    let app = req.app_name();
    let ports = service_ports(devfile);

    let existing = cluster
        .service_for_component(component, app)
        .await
        .map_err(EngineError::cluster(format!(
            "getting service for component {component}"
        )))?;

    if ports.is_empty() {
        if let Some(old) = existing {
            let old_name = old.metadata.name.as_deref().unwrap_or_default().to_string();
            match cluster.delete_service(&old_name).await {
                Ok(()) => {
                    info!(service = %old_name, "deleted service, devfile no longer declares endpoints");
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    return Err(EngineError::cluster(format!(
                        "deleting service {old_name}"
                    ))(err))
                }
            }
        }
        return Ok(());
    }

    let name = deployment
        .metadata
        .name
        .clone()
        .unwrap_or_else(|| component.to_string());
    let object_labels = labels::labels_for(component, app, devfile.runtime(), labels::MODE_DEV, true);
    let mut annotations = LabelSet::new();
    labels::set_project_type(&mut annotations, devfile.runtime().unwrap_or_default());
    annotations.insert(
        BINDING_IP_ANNOTATION.0.to_string(),
        BINDING_IP_ANNOTATION.1.to_string(),
    );
    annotations.insert(
        BINDING_PORT_ANNOTATION.0.to_string(),
        BINDING_PORT_ANNOTATION.1.to_string(),
    );

    let mut spec = ServiceSpec {
        selector: Some(selector_labels.clone()),
        ports: Some(ports),
        ..Default::default()
    };
    let mut metadata = ObjectMeta {
        name: Some(name.clone()),
        namespace: Some(req.namespace().to_string()),
        labels: Some(object_labels),
        annotations: Some(annotations),
        ..Default::default()
    };
    // the cluster IP is server-owned; keep it out of the change detection
    let payload = last_applied_payload(&metadata, &spec)?;

    match existing {
        Some(old) => {
            let unchanged = old
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(LAST_APPLIED_ANNOTATION))
                == Some(&payload);
            if unchanged {
                debug!(service = %name, "service unchanged, skipping write");
                return Ok(());
            }
            spec.cluster_ip = old.spec.as_ref().and_then(|s| s.cluster_ip.clone());
            if let Some(annotations) = metadata.annotations.as_mut() {
                annotations.insert(LAST_APPLIED_ANNOTATION.to_string(), payload);
            }
            metadata.resource_version = old.metadata.resource_version.clone();
            metadata.owner_references = Some(vec![owner_reference_for(deployment, false)
                .map_err(EngineError::cluster("building service owner reference"))?]);
            let service = Service {
                metadata,
                spec: Some(spec),
                ..Default::default()
            };
            cluster
                .update_service(service)
                .await
                .map_err(EngineError::cluster(format!("updating service {name}")))?;
        }
        None => {
            if let Some(annotations) = metadata.annotations.as_mut() {
                annotations.insert(LAST_APPLIED_ANNOTATION.to_string(), payload);
            }
            metadata.owner_references = Some(vec![owner_reference_for(deployment, true)
                .map_err(EngineError::cluster("building service owner reference"))?]);
            let service = Service {
                metadata,
                spec: Some(spec),
                ..Default::default()
            };
            match cluster.create_service(service.clone()).await {
                Ok(_) => {}
                Err(err) if err.is_forbidden() => {
                    // some clusters refuse blockOwnerDeletion on namespaced owners
                    let mut service = service;
                    service.metadata.owner_references =
                        Some(vec![owner_reference_for(deployment, false)
                            .map_err(EngineError::cluster("building service owner reference"))?]);
                    cluster
                        .create_service(service)
                        .await
                        .map_err(EngineError::cluster(format!("creating service {name}")))?;
                }
                Err(err) => {
                    return Err(EngineError::cluster(format!("creating service {name}"))(err))
                }
            }
            info!(service = %name, "created service");
        }
    }
    Ok(())
}

fn service_ports(devfile: &Devfile) -> Vec<ServicePort> {
    let mut seen = HashSet::new();
    let mut ports = Vec::new();
    for (_, cc) in devfile.container_components() {
        for endpoint in &cc.endpoints {
            if endpoint.exposure() == EndpointExposure::None {
                continue;
            }
            if !seen.insert(endpoint.target_port) {
                continue;
            }
            ports.push(ServicePort {
                name: Some(endpoint.name.clone()),
                port: i32::from(endpoint.target_port),
                target_port: Some(IntOrString::Int(i32::from(endpoint.target_port))),
                protocol: Some(port_protocol(endpoint.protocol.as_deref())),
                ..Default::default()
            });
        }
    }
    ports
}

/// What "we applied this" means for change detection: our labels, our
/// annotations (minus the marker itself) and the spec, serialized stably.
fn last_applied_payload<S: serde::Serialize>(
    metadata: &ObjectMeta,
    spec: &S,
) -> Result<String, EngineError> {
    let mut annotations = metadata.annotations.clone().unwrap_or_default();
    annotations.remove(LAST_APPLIED_ANNOTATION);
    let probe = serde_json::json!({
        "labels": metadata.labels,
        "annotations": annotations,
        "spec": spec,
    });
    Ok(serde_json::to_string(&probe).context("serializing last-applied payload")?)
}
