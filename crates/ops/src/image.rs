//! Builds devfile image components by shelling out to podman or docker.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use devloop_devfile::ImageComponent;
use devloop_engine::ports::ImageBackend;

use crate::exec;

const CMD_ENV: &str = "DEVLOOP_IMAGE_CMD";
const CANDIDATES: &[&str] = &["podman", "docker"];

pub struct ShellImageBackend {
    binary: String,
}

impl ShellImageBackend {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Pick the first container tool that answers, honoring the env
    /// override.
    pub async fn detect() -> Result<Self> {
        if let Ok(binary) = std::env::var(CMD_ENV) {
            return Ok(Self::new(binary));
        }
        for candidate in CANDIDATES {
            let probe = Command::new(candidate).arg("version").output().await;
            if matches!(probe, Ok(out) if out.status.success()) {
                return Ok(Self::new(*candidate));
            }
        }
        bail!("no container tool found; install podman or docker, or set {CMD_ENV}")
    }
}

#[async_trait]
impl ImageBackend for ShellImageBackend {
    async fn build_and_push(
        &self,
        component_name: &str,
        image: &ImageComponent,
        context_dir: &Path,
    ) -> Result<()> {
        let (dockerfile, context) = build_inputs(image, context_dir);
        info!(
            component = %component_name,
            image = %image.image_name,
            tool = %self.binary,
            "building image"
        );
        run(&self.binary, &build_args(&image.image_name, &dockerfile, &context)).await?;
        info!(component = %component_name, image = %image.image_name, "pushing image");
        run(&self.binary, &push_args(&image.image_name)).await?;
        Ok(())
    }
}

fn build_inputs(image: &ImageComponent, context_dir: &Path) -> (PathBuf, PathBuf) {
    let dockerfile = image
        .dockerfile
        .as_ref()
        .and_then(|d| d.uri.as_deref())
        .unwrap_or("Dockerfile");
    let context = image
        .dockerfile
        .as_ref()
        .and_then(|d| d.build_context.as_deref())
        .unwrap_or(".");
    (context_dir.join(dockerfile), context_dir.join(context))
}

fn build_args(image_name: &str, dockerfile: &Path, context: &Path) -> Vec<String> {
    vec![
        "build".to_string(),
        "-t".to_string(),
        image_name.to_string(),
        "-f".to_string(),
        dockerfile.display().to_string(),
        context.display().to_string(),
    ]
}

fn push_args(image_name: &str) -> Vec<String> {
    vec!["push".to_string(), image_name.to_string()]
}

async fn run(binary: &str, args: &[String]) -> Result<()> {
    let output = Command::new(binary)
        .args(args)
        .output()
        .await
        .with_context(|| format!("spawning {binary}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "`{binary} {}` failed: {}",
            args.join(" "),
            exec::tail(&stderr, 2048)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use devloop_devfile::Dockerfile;

    #[test]
    fn build_args_resolve_dockerfile_against_the_context_dir() {
        let image = ImageComponent {
            image_name: "registry.example/web:latest".to_string(),
            auto_build: None,
            dockerfile: Some(Dockerfile {
                uri: Some("docker/Dockerfile.dev".to_string()),
                build_context: Some("src".to_string()),
                root_required: None,
            }),
        };
        let (dockerfile, context) = build_inputs(&image, Path::new("/work/web"));
        let args = build_args(&image.image_name, &dockerfile, &context);
        assert_eq!(
            args,
            vec![
                "build",
                "-t",
                "registry.example/web:latest",
                "-f",
                "/work/web/docker/Dockerfile.dev",
                "/work/web/src",
            ]
        );
    }

    #[test]
    fn missing_dockerfile_section_uses_defaults() {
        let image = ImageComponent {
            image_name: "registry.example/web:latest".to_string(),
            auto_build: None,
            dockerfile: None,
        };
        let (dockerfile, context) = build_inputs(&image, Path::new("/work/web"));
        assert_eq!(dockerfile, Path::new("/work/web/Dockerfile"));
        assert_eq!(context, Path::new("/work/web/."));
    }
}
