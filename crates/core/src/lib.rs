//! devloop core types: component status, reconcile request, name validation.

#![forbid(unsafe_code)]

pub mod labels;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Progress of a component through one dev session, as seen by the watch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentState {
    /// Sources changed (or nothing pushed yet); the next pass must sync.
    SyncOutdated,
    /// The workload was just created/updated or is not ready; the pass exits
    /// early and waits for the next cluster event.
    WaitDeployment,
    /// Steady state: resources, sources, commands and forwards are all current.
    Ready,
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentState::SyncOutdated => write!(f, "SyncOutdated"),
            ComponentState::WaitDeployment => write!(f, "WaitDeployment"),
            ComponentState::Ready => write!(f, "Ready"),
        }
    }
}

/// Mutable session status owned by the caller and threaded through every
/// reconciliation pass. Nothing here is persisted; a new dev session starts
/// from `ComponentStatus::new()`.
#[derive(Debug, Clone)]
pub struct ComponentStatus {
    state: ComponentState,
    /// Image-component name -> image spec applied last, used to skip
    /// redundant image builds across passes.
    pub image_components_auto_applied: HashMap<String, serde_json::Value>,
    /// True once post-start lifecycle events ran for the current pod.
    pub post_start_events_done: bool,
    /// Container name -> container ports currently forwarded.
    pub endpoints_forwarded: BTreeMap<String, Vec<u16>>,
}

impl ComponentStatus {
    /// A fresh session starts with everything outdated: nothing has been
    /// synced into any pod yet.
    pub fn new() -> Self {
        Self {
            state: ComponentState::SyncOutdated,
            image_components_auto_applied: HashMap::new(),
            post_start_events_done: false,
            endpoints_forwarded: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> ComponentState {
        self.state
    }

    pub fn set_state(&mut self, next: ComponentState) {
        if next != self.state {
            debug!(from = %self.state, to = %next, "component state changed");
        }
        self.state = next;
    }
}

impl Default for ComponentStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of the component being reconciled, validated at construction so
/// the engine never has to deal with a half-filled request.
#[derive(Debug, Clone)]
pub struct ReconcileRequest {
    component_name: String,
    app_name: String,
    namespace: String,
    devfile_path: PathBuf,
}

impl ReconcileRequest {
    pub fn new(
        component_name: impl Into<String>,
        app_name: impl Into<String>,
        namespace: impl Into<String>,
        devfile_path: impl Into<PathBuf>,
    ) -> Result<Self, NameError> {
        let component_name = component_name.into();
        let app_name = app_name.into();
        let namespace = namespace.into();
        validate_resource_name("component name", &component_name)?;
        validate_resource_name("application name", &app_name)?;
        validate_resource_name("namespace", &namespace)?;
        Ok(Self {
            component_name,
            app_name,
            namespace,
            devfile_path: devfile_path.into(),
        })
    }

    pub fn component_name(&self) -> &str {
        &self.component_name
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn devfile_path(&self) -> &Path {
        &self.devfile_path
    }

    /// Directory the devfile lives in; relative manifest URIs resolve here.
    pub fn devfile_dir(&self) -> &Path {
        self.devfile_path.parent().unwrap_or_else(|| Path::new("."))
    }
}

#[derive(Debug, Error)]
#[error("{kind} {value:?} is not a valid Kubernetes resource name: {reason}")]
pub struct NameError {
    pub kind: &'static str,
    pub value: String,
    pub reason: &'static str,
}

/// RFC 1123 DNS label check, the same rule the API server applies to
/// resource names: 1..=63 lowercase alphanumerics or '-', starting and
/// ending with an alphanumeric.
pub fn validate_resource_name(kind: &'static str, value: &str) -> Result<(), NameError> {
    let err = |reason: &'static str| NameError {
        kind,
        value: value.to_string(),
        reason,
    };
    if value.is_empty() {
        return Err(err("must not be empty"));
    }
    if value.len() > 63 {
        return Err(err("must be at most 63 characters"));
    }
    let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    if !value.chars().all(|c| alnum(c) || c == '-') {
        return Err(err(
            "must contain only lowercase alphanumeric characters or '-'",
        ));
    }
    if !value.starts_with(alnum) || !value.ends_with(alnum) {
        return Err(err("must start and end with an alphanumeric character"));
    }
    Ok(())
}

/// Joins component and application name into the stable workload name,
/// truncated to fit the 63-character label/name limit.
pub fn object_name(component_name: &str, app_name: &str) -> Result<String, NameError> {
    let mut name = format!("{component_name}-{app_name}");
    if name.len() > 63 {
        name.truncate(63);
        while name.ends_with('-') {
            name.pop();
        }
    }
    validate_resource_name("object name", &name)?;
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_dns_labels() {
        assert!(validate_resource_name("component name", "my-app-2").is_ok());
        assert!(validate_resource_name("component name", "").is_err());
        assert!(validate_resource_name("component name", "My-App").is_err());
        assert!(validate_resource_name("component name", "-lead").is_err());
        assert!(validate_resource_name("component name", "trail-").is_err());
        assert!(validate_resource_name("component name", "under_score").is_err());
        let long = "a".repeat(64);
        assert!(validate_resource_name("component name", &long).is_err());
    }

    #[test]
    fn name_error_names_the_field() {
        let err = validate_resource_name("namespace", "Bad%").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("namespace"), "{msg}");
        assert!(msg.contains("Bad%"), "{msg}");
    }

    #[test]
    fn request_rejects_invalid_identity() {
        assert!(ReconcileRequest::new("comp", "app", "ns", "devfile.yaml").is_ok());
        assert!(ReconcileRequest::new("", "app", "ns", "devfile.yaml").is_err());
        assert!(ReconcileRequest::new("comp", "app", "Bad_NS", "devfile.yaml").is_err());
    }

    #[test]
    fn request_devfile_dir_defaults_to_current() {
        let req = ReconcileRequest::new("c", "app", "ns", "devfile.yaml").unwrap();
        assert_eq!(req.devfile_dir(), Path::new("."));
        let req = ReconcileRequest::new("c", "app", "ns", "/work/proj/devfile.yaml").unwrap();
        assert_eq!(req.devfile_dir(), Path::new("/work/proj"));
    }

    #[test]
    fn object_name_joins_and_truncates() {
        assert_eq!(object_name("backend", "app").unwrap(), "backend-app");
        let long = "x".repeat(70);
        let name = object_name(&long, "app").unwrap();
        assert!(name.len() <= 63);
        assert!(!name.ends_with('-'));
    }

    #[test]
    fn fresh_status_is_sync_outdated() {
        let status = ComponentStatus::new();
        assert_eq!(status.state(), ComponentState::SyncOutdated);
        assert!(status.endpoints_forwarded.is_empty());
        assert!(!status.post_start_events_done);
    }

    #[test]
    fn set_state_overwrites() {
        let mut status = ComponentStatus::new();
        status.set_state(ComponentState::WaitDeployment);
        assert_eq!(status.state(), ComponentState::WaitDeployment);
        status.set_state(ComponentState::Ready);
        assert_eq!(status.state(), ComponentState::Ready);
    }
}
