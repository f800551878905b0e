//! Tar-over-exec file sync with a local modification index, so steady-state
//! passes ship only what changed since the last push.
//!
//! Watch-reported paths are used directly when present; otherwise the source
//! tree is diffed against the index written after the previous push. A forced
//! push ignores the index entirely and ships the whole tree.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use devloop_engine::ports::{FileSyncer, SyncOutcome, SyncRequest};

use crate::exec;

/// Where sources land unless the devfile maps them elsewhere.
const DEFAULT_SOURCE_MOUNT: &str = "/projects";
/// Local bookkeeping folder inside the project tree.
const INDEX_DIR: &str = ".devloop";
const INDEX_FILE: &str = "file-index.json";
/// Never shipped to the container.
const ALWAYS_IGNORED: &[&str] = &[".git", INDEX_DIR];

#[derive(Debug, Default, Serialize, Deserialize)]
struct FileIndex {
    files: BTreeMap<String, FileAttributes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct FileAttributes {
    size: u64,
    modified_ms: u64,
}

struct SyncPlan {
    /// Paths relative to the source dir, to archive and extract remotely.
    changed: Vec<PathBuf>,
    /// Relative paths to remove remotely.
    deleted: Vec<String>,
    /// Index to persist once the push lands.
    next: FileIndex,
}

pub struct TarSyncer {
    client: Client,
    namespace: String,
}

impl TarSyncer {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl FileSyncer for TarSyncer {
    async fn sync(&self, request: &SyncRequest<'_>) -> Result<SyncOutcome> {
        let index_path = index_path(request.source_dir);
        let prior = if request.force_push {
            FileIndex::default()
        } else {
            load_index(&index_path)
        };

        let watch_driven = !request.force_push
            && (!request.changed_files.is_empty() || !request.deleted_files.is_empty());
        let plan = if watch_driven {
            plan_from_watch(request, prior)
        } else {
            plan_from_index(request, prior)?
        };

        if plan.changed.is_empty() && plan.deleted.is_empty() && !request.force_push {
            debug!(pod = %request.pod_name, "sources unchanged, nothing to sync");
            return Ok(SyncOutcome {
                exec_required: false,
            });
        }

        info!(
            pod = %request.pod_name,
            container = %request.container_name,
            changed = plan.changed.len(),
            deleted = plan.deleted.len(),
            force = request.force_push,
            "syncing sources"
        );

        let api = exec::pods(&self.client, &self.namespace);
        if request.dest_dir != DEFAULT_SOURCE_MOUNT {
            run_remote(
                &api,
                request,
                vec![
                    "mkdir".to_string(),
                    "-p".to_string(),
                    request.dest_dir.to_string(),
                ],
            )
            .await?;
        }

        if !plan.deleted.is_empty() {
            let mut command = vec!["rm".to_string(), "-rf".to_string()];
            command.extend(
                plan.deleted
                    .iter()
                    .map(|rel| join_dest(request.dest_dir, rel)),
            );
            run_remote(&api, request, command).await?;
        }

        if !plan.changed.is_empty() {
            let source = request.source_dir.to_path_buf();
            let files = plan.changed.clone();
            let archive = tokio::task::spawn_blocking(move || build_archive(&source, &files))
                .await
                .context("archive build interrupted")??;
            let extract = vec![
                "tar".to_string(),
                "xf".to_string(),
                "-".to_string(),
                "-C".to_string(),
                request.dest_dir.to_string(),
                "--no-same-owner".to_string(),
            ];
            let out = exec::run_with_stdin(
                &api,
                request.pod_name,
                request.container_name,
                extract,
                &archive,
            )
            .await?;
            if !out.success {
                bail!(
                    "tar extract failed in {}: {}",
                    request.container_name,
                    exec::tail(&out.stderr, 2048)
                );
            }
        }

        save_index(&index_path, &plan.next)?;
        Ok(SyncOutcome {
            exec_required: true,
        })
    }
}

async fn run_remote(api: &Api<Pod>, request: &SyncRequest<'_>, command: Vec<String>) -> Result<()> {
    let rendered = command.join(" ");
    let out = exec::run_capture(api, request.pod_name, request.container_name, command).await?;
    if !out.success {
        bail!(
            "`{rendered}` failed in {}: {}",
            request.container_name,
            exec::tail(&out.stderr, 2048)
        );
    }
    Ok(())
}

/// Plan a push from watcher notifications, folding them into the prior index.
fn plan_from_watch(request: &SyncRequest<'_>, mut prior: FileIndex) -> SyncPlan {
    let mut changed = Vec::new();
    for path in request.changed_files {
        let rel = relative_to(path, request.source_dir);
        let rel_str = rel_name(&rel);
        if is_ignored(&rel_str, request.ignore_paths) {
            continue;
        }
        match fs::metadata(request.source_dir.join(&rel)) {
            Ok(meta) if meta.is_file() => {
                prior.files.insert(rel_str, attributes(&meta));
                changed.push(rel);
            }
            // Vanished between the event and this pass; a later deletion
            // event covers it.
            _ => {}
        }
    }

    let mut deleted = Vec::new();
    for path in request.deleted_files {
        let rel = relative_to(path, request.source_dir);
        let rel_str = rel_name(&rel);
        if is_ignored(&rel_str, request.ignore_paths) {
            continue;
        }
        let nested = format!("{rel_str}/");
        prior
            .files
            .retain(|k, _| k != &rel_str && !k.starts_with(&nested));
        deleted.push(rel_str);
    }

    SyncPlan {
        changed,
        deleted,
        next: prior,
    }
}

/// Plan a push by diffing the tree on disk against the last pushed index.
fn plan_from_index(request: &SyncRequest<'_>, prior: FileIndex) -> Result<SyncPlan> {
    let current = walk_tree(request.source_dir, request.ignore_paths)?;
    let mut changed = Vec::new();
    for (rel, attrs) in &current {
        if prior.files.get(rel) != Some(attrs) {
            changed.push(PathBuf::from(rel));
        }
    }
    let deleted = prior
        .files
        .keys()
        .filter(|k| !current.contains_key(*k))
        .cloned()
        .collect();
    Ok(SyncPlan {
        changed,
        deleted,
        next: FileIndex { files: current },
    })
}

fn walk_tree(root: &Path, ignores: &[String]) -> Result<BTreeMap<String, FileAttributes>> {
    let mut out = BTreeMap::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries =
            fs::read_dir(&dir).with_context(|| format!("reading {}", dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("reading {}", dir.display()))?;
            let path = entry.path();
            let rel = match path.strip_prefix(root) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => continue,
            };
            let rel_str = rel_name(&rel);
            if is_ignored(&rel_str, ignores) {
                continue;
            }
            let meta = entry
                .metadata()
                .with_context(|| format!("stat {}", path.display()))?;
            if meta.is_dir() {
                stack.push(path);
            } else if meta.is_file() {
                out.insert(rel_str, attributes(&meta));
            }
            // Symlinks and special files stay local.
        }
    }
    Ok(out)
}

fn build_archive(source_dir: &Path, files: &[PathBuf]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for rel in files {
        let full = source_dir.join(rel);
        builder
            .append_path_with_name(&full, rel)
            .with_context(|| format!("archiving {}", full.display()))?;
    }
    builder.into_inner().context("finalizing archive")
}

fn is_ignored(rel: &str, ignores: &[String]) -> bool {
    let covered = |pattern: &str| {
        let pattern = pattern
            .trim_start_matches("./")
            .trim_start_matches('/')
            .trim_end_matches('/');
        !pattern.is_empty() && (rel == pattern || rel.starts_with(&format!("{pattern}/")))
    };
    ALWAYS_IGNORED.iter().any(|p| covered(p)) || ignores.iter().any(|p| covered(p))
}

fn relative_to(path: &Path, root: &Path) -> PathBuf {
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| path.to_path_buf())
}

fn rel_name(rel: &Path) -> String {
    rel.to_string_lossy().into_owned()
}

fn join_dest(dest: &str, rel: &str) -> String {
    format!("{}/{}", dest.trim_end_matches('/'), rel)
}

fn attributes(meta: &fs::Metadata) -> FileAttributes {
    let modified_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    FileAttributes {
        size: meta.len(),
        modified_ms,
    }
}

fn index_path(source_dir: &Path) -> PathBuf {
    source_dir.join(INDEX_DIR).join(INDEX_FILE)
}

fn load_index(path: &Path) -> FileIndex {
    // A missing or unreadable index degrades to a full push.
    fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_default()
}

fn save_index(path: &Path, index: &FileIndex) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let bytes = serde_json::to_vec(index).context("encoding file index")?;
    fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>(
        source_dir: &'a Path,
        changed: &'a [PathBuf],
        deleted: &'a [PathBuf],
        ignores: &'a [String],
    ) -> SyncRequest<'a> {
        SyncRequest {
            pod_name: "backend-app-7f9b",
            container_name: "runtime",
            source_dir,
            dest_dir: "/projects",
            changed_files: changed,
            deleted_files: deleted,
            ignore_paths: ignores,
            force_push: false,
        }
    }

    #[test]
    fn index_diff_detects_new_modified_and_deleted() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("package.json"), b"{}").unwrap();
        fs::write(dir.path().join("src/server.js"), b"listen(3000)").unwrap();

        let req = request(dir.path(), &[], &[], &[]);
        let first = plan_from_index(&req, FileIndex::default()).unwrap();
        let mut changed = first.changed.clone();
        changed.sort();
        assert_eq!(
            changed,
            vec![PathBuf::from("package.json"), PathBuf::from("src/server.js")]
        );
        assert!(first.deleted.is_empty());

        // Size change dodges mtime granularity.
        fs::write(dir.path().join("src/server.js"), b"listen(8080) // longer").unwrap();
        fs::remove_file(dir.path().join("package.json")).unwrap();
        let second = plan_from_index(&req, first.next).unwrap();
        assert_eq!(second.changed, vec![PathBuf::from("src/server.js")]);
        assert_eq!(second.deleted, vec!["package.json".to_string()]);
    }

    #[test]
    fn ignored_paths_stay_local() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/config"), b"[core]").unwrap();
        fs::create_dir_all(dir.path().join("node_modules/leftpad")).unwrap();
        fs::write(dir.path().join("node_modules/leftpad/index.js"), b"x").unwrap();
        fs::write(dir.path().join("app.js"), b"x").unwrap();

        let ignores = vec!["node_modules".to_string()];
        let tree = walk_tree(dir.path(), &ignores).unwrap();
        assert_eq!(tree.keys().collect::<Vec<_>>(), vec!["app.js"]);
    }

    #[test]
    fn watch_plan_resolves_paths_against_the_source_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/server.js"), b"listen(3000)").unwrap();

        let changed = vec![dir.path().join("src/server.js")];
        let deleted = vec![PathBuf::from("src/old.js")];
        let req = request(dir.path(), &changed, &deleted, &[]);

        let mut prior = FileIndex::default();
        prior.files.insert(
            "src/old.js".to_string(),
            FileAttributes {
                size: 1,
                modified_ms: 1,
            },
        );
        let plan = plan_from_watch(&req, prior);
        assert_eq!(plan.changed, vec![PathBuf::from("src/server.js")]);
        assert_eq!(plan.deleted, vec!["src/old.js".to_string()]);
        assert!(plan.next.files.contains_key("src/server.js"));
        assert!(!plan.next.files.contains_key("src/old.js"));
    }

    #[test]
    fn deleting_a_directory_drops_nested_index_entries() {
        let dir = tempfile::tempdir().unwrap();
        let deleted = vec![PathBuf::from("src")];
        let req = request(dir.path(), &[], &deleted, &[]);

        let mut prior = FileIndex::default();
        for key in ["src/a.js", "src/lib/b.js", "srcmain.js"] {
            prior.files.insert(
                key.to_string(),
                FileAttributes {
                    size: 1,
                    modified_ms: 1,
                },
            );
        }
        let plan = plan_from_watch(&req, prior);
        assert_eq!(plan.deleted, vec!["src".to_string()]);
        // The sibling whose name merely shares the prefix survives.
        assert_eq!(plan.next.files.keys().collect::<Vec<_>>(), vec!["srcmain.js"]);
    }

    #[test]
    fn archive_preserves_relative_names() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/app.js"), b"console.log(1)").unwrap();

        let bytes = build_archive(dir.path(), &[PathBuf::from("src/app.js")]).unwrap();
        let mut archive = tar::Archive::new(bytes.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| {
                e.unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        assert_eq!(names, vec!["src/app.js".to_string()]);
    }

    #[test]
    fn corrupt_index_degrades_to_full_push() {
        let dir = tempfile::tempdir().unwrap();
        let path = index_path(dir.path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"not json").unwrap();
        assert!(load_index(&path).files.is_empty());
    }
}
