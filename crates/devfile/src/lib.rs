//! Devfile object model: containers, volumes, images, inline manifests,
//! commands and lifecycle events, plus the lookups the reconciler needs.

#![forbid(unsafe_code)]

pub mod manifest;

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DevfileError {
    #[error("failed to parse devfile: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("duplicate component name {0:?}")]
    DuplicateComponent(String),
    #[error("duplicate command id {0:?}")]
    DuplicateCommand(String),
    #[error("command {0:?} references unknown component {1:?}")]
    UnknownComponent(String, String),
    #[error("no command with id {0:?} found in the devfile")]
    UnknownCommand(String),
    #[error("command {id:?} is not in the {group} group")]
    WrongGroup { id: String, group: CommandGroupKind },
    #[error("no default {0} command found in the devfile")]
    CommandNotFound(CommandGroupKind),
    #[error("more than one default {0} command found in the devfile")]
    MultipleDefaultCommands(CommandGroupKind),
    #[error("component {0:?} carries neither an inlined manifest nor a uri")]
    EmptyManifest(String),
    #[error("manifest in component {0:?} is missing apiVersion, kind or metadata.name")]
    InvalidManifest(String),
}

// ---- model ----

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Devfile {
    pub schema_version: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub components: Vec<Component>,
    #[serde(default)]
    pub commands: Vec<Command>,
    #[serde(default)]
    pub events: Events,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub project_type: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

/// A devfile component is a union: exactly one of the typed fields is set.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerComponent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumeComponent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageComponent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<KubernetesComponent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openshift: Option<KubernetesComponent>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerComponent {
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub memory_limit: Option<String>,
    #[serde(default)]
    pub memory_request: Option<String>,
    #[serde(default)]
    pub cpu_limit: Option<String>,
    #[serde(default)]
    pub cpu_request: Option<String>,
    #[serde(default)]
    pub mount_sources: Option<bool>,
    #[serde(default)]
    pub source_mapping: Option<String>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
}

impl ContainerComponent {
    /// Sources are mounted unless explicitly disabled.
    pub fn mounts_sources(&self) -> bool {
        self.mount_sources.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub name: String,
    pub target_port: u16,
    #[serde(default)]
    pub exposure: Option<EndpointExposure>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub secure: Option<bool>,
}

impl Endpoint {
    pub fn exposure(&self) -> EndpointExposure {
        self.exposure.unwrap_or(EndpointExposure::Public)
    }

    /// Endpoints named `debug`/`debug-…` only matter in debug mode.
    pub fn is_debug(&self) -> bool {
        self.name == "debug" || self.name.starts_with("debug-")
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EndpointExposure {
    Public,
    Internal,
    None,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct VolumeMount {
    pub name: String,
    #[serde(default)]
    pub path: Option<String>,
}

impl VolumeMount {
    /// Devfile default: a mount without a path lands under `/<name>`.
    pub fn mount_path(&self) -> String {
        match &self.path {
            Some(p) => p.clone(),
            None => format!("/{}", self.name),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeComponent {
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub ephemeral: Option<bool>,
}

impl VolumeComponent {
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageComponent {
    pub image_name: String,
    #[serde(default)]
    pub auto_build: Option<bool>,
    #[serde(default)]
    pub dockerfile: Option<Dockerfile>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Dockerfile {
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub build_context: Option<String>,
    #[serde(default)]
    pub root_required: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesComponent {
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub inlined: Option<String>,
    #[serde(default)]
    pub deploy_by_default: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite: Option<CompositeCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply: Option<ApplyCommand>,
}

impl Command {
    pub fn group_kind(&self) -> Option<CommandGroupKind> {
        self.group().and_then(|g| g.kind)
    }

    pub fn group(&self) -> Option<&CommandGroup> {
        if let Some(exec) = &self.exec {
            return exec.group.as_ref();
        }
        if let Some(composite) = &self.composite {
            return composite.group.as_ref();
        }
        if let Some(apply) = &self.apply {
            return apply.group.as_ref();
        }
        None
    }

    pub fn is_default(&self) -> bool {
        self.group().map(|g| g.is_default.unwrap_or(false)).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecCommand {
    pub command_line: String,
    pub component: String,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub hot_reload_capable: Option<bool>,
    #[serde(default)]
    pub group: Option<CommandGroup>,
}

impl ExecCommand {
    pub fn is_hot_reload_capable(&self) -> bool {
        self.hot_reload_capable.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompositeCommand {
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub parallel: Option<bool>,
    #[serde(default)]
    pub group: Option<CommandGroup>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplyCommand {
    pub component: String,
    #[serde(default)]
    pub group: Option<CommandGroup>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandGroup {
    #[serde(default)]
    pub kind: Option<CommandGroupKind>,
    #[serde(default)]
    pub is_default: Option<bool>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CommandGroupKind {
    Build,
    Run,
    Debug,
    Test,
    Deploy,
}

impl fmt::Display for CommandGroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandGroupKind::Build => write!(f, "build"),
            CommandGroupKind::Run => write!(f, "run"),
            CommandGroupKind::Debug => write!(f, "debug"),
            CommandGroupKind::Test => write!(f, "test"),
            CommandGroupKind::Deploy => write!(f, "deploy"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Events {
    #[serde(default)]
    pub post_start: Vec<String>,
    #[serde(default)]
    pub pre_stop: Vec<String>,
}

// ---- parsing and lookups ----

impl Devfile {
    pub fn parse(yaml: &str) -> Result<Self, DevfileError> {
        let devfile: Devfile = serde_yaml::from_str(yaml)?;
        devfile.validate()?;
        Ok(devfile)
    }

    pub fn from_path(path: &Path) -> Result<Self, DevfileError> {
        let yaml = std::fs::read_to_string(path).map_err(|source| DevfileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&yaml)
    }

    fn validate(&self) -> Result<(), DevfileError> {
        let mut names = HashSet::new();
        for component in &self.components {
            if !names.insert(component.name.as_str()) {
                return Err(DevfileError::DuplicateComponent(component.name.clone()));
            }
        }
        let mut ids = HashSet::new();
        for command in &self.commands {
            if !ids.insert(command.id.as_str()) {
                return Err(DevfileError::DuplicateCommand(command.id.clone()));
            }
            let target = match (&command.exec, &command.apply) {
                (Some(exec), _) => Some(&exec.component),
                (_, Some(apply)) => Some(&apply.component),
                _ => None,
            };
            if let Some(target) = target {
                if !names.contains(target.as_str()) {
                    return Err(DevfileError::UnknownComponent(
                        command.id.clone(),
                        target.clone(),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn name(&self) -> Option<&str> {
        self.metadata.name.as_deref()
    }

    pub fn project_type(&self) -> Option<&str> {
        self.metadata.project_type.as_deref()
    }

    /// Runtime hint for labels; `projectType` wins over `language`.
    pub fn runtime(&self) -> Option<&str> {
        self.project_type().or(self.metadata.language.as_deref())
    }

    pub fn container_components(&self) -> impl Iterator<Item = (&str, &ContainerComponent)> {
        self.components
            .iter()
            .filter_map(|c| c.container.as_ref().map(|cc| (c.name.as_str(), cc)))
    }

    pub fn volume_components(&self) -> impl Iterator<Item = (&str, &VolumeComponent)> {
        self.components
            .iter()
            .filter_map(|c| c.volume.as_ref().map(|v| (c.name.as_str(), v)))
    }

    pub fn image_components(&self) -> impl Iterator<Item = (&str, &ImageComponent)> {
        self.components
            .iter()
            .filter_map(|c| c.image.as_ref().map(|i| (c.name.as_str(), i)))
    }

    /// Kubernetes and OpenShift components share one treatment everywhere.
    pub fn inline_components(&self) -> impl Iterator<Item = (&str, &KubernetesComponent)> {
        self.components.iter().filter_map(|c| {
            c.kubernetes
                .as_ref()
                .or(c.openshift.as_ref())
                .map(|k| (c.name.as_str(), k))
        })
    }

    pub fn component(&self, name: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.name == name)
    }

    pub fn command_by_id(&self, id: &str) -> Option<&Command> {
        self.commands.iter().find(|c| c.id == id)
    }

    /// Whether any apply command targets the named component.
    pub fn referenced_by_apply_command(&self, component_name: &str) -> bool {
        self.commands
            .iter()
            .filter_map(|c| c.apply.as_ref())
            .any(|a| a.component == component_name)
    }

    /// Image components applied at dev start without an explicit command:
    /// `autoBuild: true`, or unset and not referenced by any apply command.
    pub fn image_components_to_push_automatically(
        &self,
    ) -> Vec<(&str, &ImageComponent)> {
        self.image_components()
            .filter(|(name, image)| match image.auto_build {
                Some(auto) => auto,
                None => !self.referenced_by_apply_command(name),
            })
            .collect()
    }

    /// Inline components that belong on the cluster: `deployByDefault: true`,
    /// or unset and not referenced by any apply command. With
    /// `include_apply_referenced` the apply-referenced ones count too (the
    /// diffing side wants the complete declared set).
    pub fn inline_components_to_push(
        &self,
        include_apply_referenced: bool,
    ) -> Vec<(&str, &KubernetesComponent)> {
        self.inline_components()
            .filter(|(name, k8s)| match k8s.deploy_by_default {
                Some(deploy) => deploy || (include_apply_referenced && self.referenced_by_apply_command(name)),
                None => include_apply_referenced || !self.referenced_by_apply_command(name),
            })
            .collect()
    }

    /// Looks a command up by explicit id, or falls back to the group's
    /// default. An explicit id must exist and belong to the group.
    pub fn command(
        &self,
        id: Option<&str>,
        group: CommandGroupKind,
    ) -> Result<&Command, DevfileError> {
        if let Some(id) = id.filter(|id| !id.is_empty()) {
            let command = self
                .command_by_id(id)
                .ok_or_else(|| DevfileError::UnknownCommand(id.to_string()))?;
            if command.group_kind() != Some(group) {
                return Err(DevfileError::WrongGroup {
                    id: id.to_string(),
                    group,
                });
            }
            return Ok(command);
        }
        let in_group: Vec<&Command> = self
            .commands
            .iter()
            .filter(|c| c.group_kind() == Some(group))
            .collect();
        match in_group.len() {
            0 => Err(DevfileError::CommandNotFound(group)),
            1 => Ok(in_group[0]),
            _ => {
                let defaults: Vec<&&Command> =
                    in_group.iter().filter(|c| c.is_default()).collect();
                match defaults.len() {
                    1 => Ok(defaults[0]),
                    0 => Err(DevfileError::CommandNotFound(group)),
                    _ => Err(DevfileError::MultipleDefaultCommands(group)),
                }
            }
        }
    }

    /// Container name -> declared container ports, the mapping both the
    /// port-forwarder and the listen check consume. Ports with exposure
    /// `none` are skipped, debug endpoints only included when debugging.
    pub fn container_endpoint_mapping(&self, debug: bool) -> std::collections::BTreeMap<String, Vec<u16>> {
        let mut mapping = std::collections::BTreeMap::new();
        for (name, container) in self.container_components() {
            let mut ports: Vec<u16> = container
                .endpoints
                .iter()
                .filter(|e| e.exposure() != EndpointExposure::None)
                .filter(|e| debug || !e.is_debug())
                .map(|e| e.target_port)
                .collect();
            ports.sort_unstable();
            ports.dedup();
            mapping.insert(name.to_string(), ports);
        }
        mapping
    }

    /// Commands to run after the first successful sync, in event order.
    pub fn post_start_commands(&self) -> Result<Vec<&Command>, DevfileError> {
        self.events
            .post_start
            .iter()
            .map(|id| {
                self.command_by_id(id)
                    .ok_or_else(|| DevfileError::UnknownCommand(id.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
schemaVersion: 2.2.0
metadata:
  name: my-node-app
  projectType: nodejs
components:
  - name: runtime
    container:
      image: registry.access.redhat.com/ubi8/nodejs-16:latest
      memoryLimit: 1024Mi
      mountSources: true
      endpoints:
        - name: http-3000
          targetPort: 3000
        - name: debug
          targetPort: 5858
          exposure: none
  - name: m2
    volume:
      size: 3Gi
  - name: scratch
    volume:
      ephemeral: true
  - name: outerloop-build
    image:
      imageName: quay.io/example/my-node-app
      autoBuild: false
      dockerfile:
        uri: Dockerfile
  - name: extra-redis
    kubernetes:
      inlined: |
        apiVersion: redis.redis.opstreelabs.in/v1beta1
        kind: Redis
        metadata:
          name: my-redis
commands:
  - id: install
    exec:
      component: runtime
      commandLine: npm install
      workingDir: ${PROJECT_SOURCE}
      group:
        kind: build
        isDefault: true
  - id: run
    exec:
      component: runtime
      commandLine: npm start
      workingDir: ${PROJECT_SOURCE}
      group:
        kind: run
        isDefault: true
  - id: debug
    exec:
      component: runtime
      commandLine: npm run debug
      hotReloadCapable: true
      group:
        kind: debug
        isDefault: true
events:
  postStart:
    - install
"#;

    #[test]
    fn parses_a_complete_devfile() {
        let devfile = Devfile::parse(SAMPLE).unwrap();
        assert_eq!(devfile.name(), Some("my-node-app"));
        assert_eq!(devfile.runtime(), Some("nodejs"));
        assert_eq!(devfile.container_components().count(), 1);
        assert_eq!(devfile.volume_components().count(), 2);
        assert_eq!(devfile.inline_components().count(), 1);
    }

    #[test]
    fn rejects_duplicate_components() {
        let yaml = r#"
schemaVersion: 2.2.0
components:
  - name: runtime
    container: { image: a }
  - name: runtime
    container: { image: b }
"#;
        assert!(matches!(
            Devfile::parse(yaml),
            Err(DevfileError::DuplicateComponent(_))
        ));
    }

    #[test]
    fn rejects_commands_on_unknown_components() {
        let yaml = r#"
schemaVersion: 2.2.0
components:
  - name: runtime
    container: { image: a }
commands:
  - id: run
    exec:
      component: missing
      commandLine: npm start
"#;
        assert!(matches!(
            Devfile::parse(yaml),
            Err(DevfileError::UnknownComponent(_, _))
        ));
    }

    #[test]
    fn command_lookup_by_explicit_id_checks_group() {
        let devfile = Devfile::parse(SAMPLE).unwrap();
        let cmd = devfile.command(Some("run"), CommandGroupKind::Run).unwrap();
        assert_eq!(cmd.id, "run");
        assert!(matches!(
            devfile.command(Some("run"), CommandGroupKind::Build),
            Err(DevfileError::WrongGroup { .. })
        ));
        assert!(matches!(
            devfile.command(Some("nope"), CommandGroupKind::Run),
            Err(DevfileError::UnknownCommand(_))
        ));
    }

    #[test]
    fn command_lookup_falls_back_to_group_default() {
        let devfile = Devfile::parse(SAMPLE).unwrap();
        let cmd = devfile.command(None, CommandGroupKind::Run).unwrap();
        assert_eq!(cmd.id, "run");
        let build = devfile.command(None, CommandGroupKind::Build).unwrap();
        assert_eq!(build.id, "install");
    }

    #[test]
    fn missing_group_is_an_error() {
        let devfile = Devfile::parse(SAMPLE).unwrap();
        assert!(matches!(
            devfile.command(None, CommandGroupKind::Deploy),
            Err(DevfileError::CommandNotFound(CommandGroupKind::Deploy))
        ));
    }

    #[test]
    fn two_defaults_are_rejected() {
        let yaml = r#"
schemaVersion: 2.2.0
components:
  - name: runtime
    container: { image: a }
commands:
  - id: run-a
    exec:
      component: runtime
      commandLine: a
      group: { kind: run, isDefault: true }
  - id: run-b
    exec:
      component: runtime
      commandLine: b
      group: { kind: run, isDefault: true }
"#;
        let devfile = Devfile::parse(yaml).unwrap();
        assert!(matches!(
            devfile.command(None, CommandGroupKind::Run),
            Err(DevfileError::MultipleDefaultCommands(CommandGroupKind::Run))
        ));
    }

    #[test]
    fn endpoint_mapping_skips_debug_unless_debugging() {
        let devfile = Devfile::parse(SAMPLE).unwrap();
        let mapping = devfile.container_endpoint_mapping(false);
        assert_eq!(mapping["runtime"], vec![3000]);
        // the debug endpoint in the sample is exposure: none, so it stays
        // hidden even in debug mode
        let mapping = devfile.container_endpoint_mapping(true);
        assert_eq!(mapping["runtime"], vec![3000]);
    }

    #[test]
    fn debug_endpoints_show_up_in_debug_mode() {
        let yaml = r#"
schemaVersion: 2.2.0
components:
  - name: runtime
    container:
      image: a
      endpoints:
        - name: http
          targetPort: 8080
        - name: debug-node
          targetPort: 5858
"#;
        let devfile = Devfile::parse(yaml).unwrap();
        assert_eq!(devfile.container_endpoint_mapping(false)["runtime"], vec![8080]);
        assert_eq!(
            devfile.container_endpoint_mapping(true)["runtime"],
            vec![5858, 8080]
        );
    }

    #[test]
    fn auto_image_components_respect_auto_build_and_apply_references() {
        let yaml = r#"
schemaVersion: 2.2.0
components:
  - name: img-auto
    image: { imageName: quay.io/a, autoBuild: true }
  - name: img-off
    image: { imageName: quay.io/b, autoBuild: false }
  - name: img-unset
    image: { imageName: quay.io/c }
  - name: img-applied
    image: { imageName: quay.io/d }
commands:
  - id: apply-img
    apply:
      component: img-applied
"#;
        let devfile = Devfile::parse(yaml).unwrap();
        let auto: Vec<&str> = devfile
            .image_components_to_push_automatically()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(auto, vec!["img-auto", "img-unset"]);
    }

    #[test]
    fn inline_components_to_push_honours_deploy_by_default() {
        let yaml = r#"
schemaVersion: 2.2.0
components:
  - name: k-on
    kubernetes: { inlined: "x", deployByDefault: true }
  - name: k-off
    kubernetes: { inlined: "x", deployByDefault: false }
  - name: k-unset
    kubernetes: { inlined: "x" }
  - name: k-applied
    kubernetes: { inlined: "x" }
commands:
  - id: apply-k
    apply:
      component: k-applied
"#;
        let devfile = Devfile::parse(yaml).unwrap();
        let pushed: Vec<&str> = devfile
            .inline_components_to_push(false)
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(pushed, vec!["k-on", "k-unset"]);
        let declared: Vec<&str> = devfile
            .inline_components_to_push(true)
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(declared, vec!["k-on", "k-unset", "k-applied"]);
    }

    #[test]
    fn post_start_commands_resolve_ids() {
        let devfile = Devfile::parse(SAMPLE).unwrap();
        let cmds = devfile.post_start_commands().unwrap();
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].id, "install");
    }
}
