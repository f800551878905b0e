//! Expansion of kubernetes/openshift components into concrete manifests.
//!
//! A component carries either an `inlined` YAML string or a `uri` relative
//! to the devfile directory; both may hold multiple YAML documents.

use std::path::Path;

use serde::Deserialize;
use serde_json::Value as Json;

use crate::{DevfileError, KubernetesComponent};

/// One concrete object declared by an inline component.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub name: String,
    pub object: Json,
}

impl Manifest {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Matching key for the pruner: version is deliberately left out, it
    /// may drift between what the devfile pins and what the cluster serves.
    pub fn group_kind(&self) -> (String, String) {
        (self.group.clone(), self.kind.clone())
    }
}

/// Reads and expands one component into its manifest list.
pub fn expand(
    component_name: &str,
    component: &KubernetesComponent,
    devfile_dir: &Path,
) -> Result<Vec<Manifest>, DevfileError> {
    let content = match (&component.inlined, &component.uri) {
        (Some(inlined), _) => inlined.clone(),
        (None, Some(uri)) => {
            let path = devfile_dir.join(uri);
            std::fs::read_to_string(&path)
                .map_err(|source| DevfileError::Io { path, source })?
        }
        (None, None) => {
            return Err(DevfileError::EmptyManifest(component_name.to_string()))
        }
    };
    parse_manifests(component_name, &content)
}

fn parse_manifests(component_name: &str, content: &str) -> Result<Vec<Manifest>, DevfileError> {
    let mut manifests = Vec::new();
    for document in serde_yaml::Deserializer::from_str(content) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        let object: Json = serde_json::to_value(value)
            .map_err(|_| DevfileError::InvalidManifest(component_name.to_string()))?;
        manifests.push(manifest_target(component_name, object)?);
    }
    Ok(manifests)
}

fn manifest_target(component_name: &str, object: Json) -> Result<Manifest, DevfileError> {
    let invalid = || DevfileError::InvalidManifest(component_name.to_string());
    let api_version = object
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .ok_or_else(invalid)?
        .to_string();
    let kind = object
        .get("kind")
        .and_then(|v| v.as_str())
        .ok_or_else(invalid)?
        .to_string();
    let name = object
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str())
        .ok_or_else(invalid)?
        .to_string();
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version),
    };
    Ok(Manifest {
        group,
        version,
        kind,
        name,
        object,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn component(inlined: &str) -> KubernetesComponent {
        KubernetesComponent {
            uri: None,
            inlined: Some(inlined.to_string()),
            deploy_by_default: None,
        }
    }

    #[test]
    fn expands_a_single_document() {
        let manifests = expand(
            "redis",
            &component(
                "apiVersion: redis.redis.opstreelabs.in/v1beta1\nkind: Redis\nmetadata:\n  name: my-redis\n",
            ),
            &PathBuf::from("."),
        )
        .unwrap();
        assert_eq!(manifests.len(), 1);
        assert_eq!(manifests[0].group, "redis.redis.opstreelabs.in");
        assert_eq!(manifests[0].version, "v1beta1");
        assert_eq!(manifests[0].kind, "Redis");
        assert_eq!(manifests[0].name, "my-redis");
        assert_eq!(manifests[0].api_version(), "redis.redis.opstreelabs.in/v1beta1");
    }

    #[test]
    fn expands_multiple_documents() {
        let manifests = expand(
            "pair",
            &component(
                "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: one\n---\napiVersion: v1\nkind: Secret\nmetadata:\n  name: two\n",
            ),
            &PathBuf::from("."),
        )
        .unwrap();
        assert_eq!(manifests.len(), 2);
        assert_eq!(manifests[0].kind, "ConfigMap");
        assert_eq!(manifests[1].kind, "Secret");
        // core-group objects have an empty group
        assert_eq!(manifests[0].group, "");
        assert_eq!(manifests[0].api_version(), "v1");
    }

    #[test]
    fn rejects_manifests_without_identity() {
        let err = expand(
            "anon",
            &component("kind: ConfigMap\nmetadata:\n  name: one\n"),
            &PathBuf::from("."),
        )
        .unwrap_err();
        assert!(matches!(err, DevfileError::InvalidManifest(_)));
    }

    #[test]
    fn component_without_content_is_an_error() {
        let empty = KubernetesComponent {
            uri: None,
            inlined: None,
            deploy_by_default: None,
        };
        assert!(matches!(
            expand("empty", &empty, &PathBuf::from(".")),
            Err(DevfileError::EmptyManifest(_))
        ));
    }
}
