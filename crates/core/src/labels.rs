//! Label and annotation scheme stamped on every resource devloop manages.
//!
//! Selection (diffing, pruning, watches) relies exclusively on the
//! component/app/mode triple; creation additionally stamps bookkeeping
//! labels (version, legacy `app`). The `component` label marks core
//! resources (deployment, service, PVCs) and is what keeps them out of the
//! pruner's way.

use std::collections::BTreeMap;

pub const KUBERNETES_INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
pub const KUBERNETES_PART_OF_LABEL: &str = "app.kubernetes.io/part-of";
pub const KUBERNETES_MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const KUBERNETES_MANAGED_BY_VERSION_LABEL: &str = "app.kubernetes.io/managed-by-version";
/// Legacy grouping label kept for console compatibility.
pub const APP_LABEL: &str = "app";
/// Marker carried only by the core resources of a component.
pub const COMPONENT_LABEL: &str = "component";
pub const OPENSHIFT_RUNTIME_LABEL: &str = "app.openshift.io/runtime";
pub const MODE_LABEL: &str = "devloop.dev/mode";
pub const STORAGE_NAME_LABEL: &str = "devloop.dev/storage-name";
pub const SOURCE_PVC_LABEL: &str = "devloop.dev/source-pvc";
/// Label a binding secret carries, naming the devfile link that produced it.
pub const LINK_LABEL: &str = "app.kubernetes.io/link-name";
pub const PROJECT_TYPE_ANNOTATION: &str = "devloop.dev/project-type";

pub const MANAGER: &str = "devloop";
pub const MODE_DEV: &str = "Dev";

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub type LabelSet = BTreeMap<String, String>;

/// Full label set stamped on created objects.
pub fn labels_for(
    component_name: &str,
    app_name: &str,
    runtime: Option<&str>,
    mode: &str,
    part_of_component: bool,
) -> LabelSet {
    let mut labels = base_labels(component_name, app_name, mode, part_of_component);
    labels.insert(APP_LABEL.into(), app_name.into());
    labels.insert(KUBERNETES_MANAGED_BY_VERSION_LABEL.into(), VERSION.into());
    if let Some(runtime) = runtime {
        // the console expects this one lowercase
        labels.insert(
            OPENSHIFT_RUNTIME_LABEL.into(),
            sanitize_label_value(&runtime.to_lowercase()),
        );
    }
    labels
}

/// Minimal label set used for selection; a subset of [`labels_for`].
pub fn selector_labels(
    component_name: &str,
    app_name: &str,
    mode: &str,
    part_of_component: bool,
) -> LabelSet {
    base_labels(component_name, app_name, mode, part_of_component)
}

fn base_labels(
    component_name: &str,
    app_name: &str,
    mode: &str,
    part_of_component: bool,
) -> LabelSet {
    let mut labels = LabelSet::new();
    labels.insert(KUBERNETES_INSTANCE_LABEL.into(), component_name.into());
    labels.insert(KUBERNETES_PART_OF_LABEL.into(), app_name.into());
    labels.insert(KUBERNETES_MANAGED_BY_LABEL.into(), MANAGER.into());
    labels.insert(MODE_LABEL.into(), mode.into());
    if part_of_component {
        labels.insert(COMPONENT_LABEL.into(), component_name.into());
    }
    labels
}

/// `key=value,key=value` selector string over the minimal label set.
/// BTreeMap ordering keeps it deterministic across passes.
pub fn selector(component_name: &str, app_name: &str, mode: &str, part_of_component: bool) -> String {
    selector_labels(component_name, app_name, mode, part_of_component)
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Labels for the PVCs devloop provisions.
pub fn storage_labels(
    component_name: &str,
    app_name: &str,
    runtime: Option<&str>,
    storage_name: &str,
    source_volume: bool,
) -> LabelSet {
    let mut labels = labels_for(component_name, app_name, runtime, MODE_DEV, true);
    labels.insert(STORAGE_NAME_LABEL.into(), storage_name.into());
    if source_volume {
        labels.insert(SOURCE_PVC_LABEL.into(), storage_name.into());
    }
    labels
}

pub fn component_name(labels: &LabelSet) -> Option<&str> {
    labels.get(KUBERNETES_INSTANCE_LABEL).map(String::as_str)
}

pub fn app_name(labels: &LabelSet) -> Option<&str> {
    labels.get(KUBERNETES_PART_OF_LABEL).map(String::as_str)
}

pub fn is_managed(labels: &LabelSet) -> bool {
    labels.get(KUBERNETES_MANAGED_BY_LABEL).map(String::as_str) == Some(MANAGER)
}

/// Core resources (the ones carrying the `component` marker) are never
/// candidates for pruning.
pub fn is_core_component(labels: &LabelSet) -> bool {
    labels.contains_key(COMPONENT_LABEL)
}

pub fn is_link_secret(labels: &LabelSet) -> bool {
    labels.contains_key(LINK_LABEL)
}

pub fn link_target(labels: &LabelSet) -> Option<&str> {
    labels.get(LINK_LABEL).map(String::as_str)
}

pub fn is_project_type_set(annotations: &LabelSet) -> bool {
    annotations.contains_key(PROJECT_TYPE_ANNOTATION)
}

pub fn set_project_type(annotations: &mut LabelSet, project_type: &str) {
    annotations.insert(PROJECT_TYPE_ANNOTATION.into(), project_type.into());
}

pub fn project_type<'a>(labels: &'a LabelSet, annotations: &'a LabelSet) -> Option<&'a str> {
    annotations
        .get(PROJECT_TYPE_ANNOTATION)
        .or_else(|| labels.get(PROJECT_TYPE_ANNOTATION))
        .map(String::as_str)
}

/// Coerces an arbitrary string into a valid label value: invalid characters
/// become '-', non-alphanumeric edges are trimmed, length capped at 63.
pub fn sanitize_label_value(value: &str) -> String {
    let mut out: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    out.truncate(63);
    let trimmed = out.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creation_labels_carry_the_full_set() {
        let labels = labels_for("backend", "app", Some("Node.js"), MODE_DEV, false);
        assert_eq!(labels[KUBERNETES_INSTANCE_LABEL], "backend");
        assert_eq!(labels[KUBERNETES_PART_OF_LABEL], "app");
        assert_eq!(labels[KUBERNETES_MANAGED_BY_LABEL], "devloop");
        assert_eq!(labels[MODE_LABEL], "Dev");
        assert_eq!(labels[APP_LABEL], "app");
        assert_eq!(labels[OPENSHIFT_RUNTIME_LABEL], "node.js");
        assert!(labels.contains_key(KUBERNETES_MANAGED_BY_VERSION_LABEL));
        assert!(!labels.contains_key(COMPONENT_LABEL));
    }

    #[test]
    fn selector_is_the_minimal_triple() {
        let sel = selector("backend", "app", MODE_DEV, false);
        assert!(sel.contains("app.kubernetes.io/instance=backend"));
        assert!(sel.contains("app.kubernetes.io/part-of=app"));
        assert!(sel.contains("devloop.dev/mode=Dev"));
        assert!(!sel.contains("managed-by-version"));
        assert!(!sel.contains("component="));
    }

    #[test]
    fn core_selector_adds_the_marker() {
        let sel = selector("backend", "app", MODE_DEV, true);
        assert!(sel.contains("component=backend"));
    }

    #[test]
    fn selector_is_deterministic() {
        assert_eq!(
            selector("c", "a", MODE_DEV, false),
            selector("c", "a", MODE_DEV, false)
        );
    }

    #[test]
    fn core_component_detection() {
        let mut labels = LabelSet::new();
        assert!(!is_core_component(&labels));
        labels.insert(COMPONENT_LABEL.into(), "backend".into());
        assert!(is_core_component(&labels));
    }

    #[test]
    fn sanitize_label_values() {
        assert_eq!(sanitize_label_value("Node.js"), "Node.js");
        assert_eq!(sanitize_label_value("spring boot"), "spring-boot");
        assert_eq!(sanitize_label_value("##x##"), "x");
        let long = "y".repeat(80);
        assert_eq!(sanitize_label_value(&long).len(), 63);
    }

    #[test]
    fn project_type_round_trip() {
        let mut annotations = LabelSet::new();
        assert!(!is_project_type_set(&annotations));
        set_project_type(&mut annotations, "nodejs");
        assert!(is_project_type_set(&annotations));
        assert_eq!(
            project_type(&LabelSet::new(), &annotations),
            Some("nodejs")
        );
    }
}
