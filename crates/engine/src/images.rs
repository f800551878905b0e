//! Image components applied at the start of a pass, cached by spec so an
//! unchanged image is not rebuilt on every file event.

use anyhow::Context as _;
use tracing::debug;

use devloop_core::{ComponentStatus, ReconcileRequest};
use devloop_devfile::Devfile;

use crate::ports::ImageBackend;
use crate::EngineError;

/// Builds and pushes every auto-applied image component whose spec differs
/// from the last applied one, then drops cache entries for components the
/// devfile no longer declares.
pub(crate) async fn push_auto_images(
    images: &dyn ImageBackend,
    req: &ReconcileRequest,
    devfile: &Devfile,
    status: &mut ComponentStatus,
) -> Result<(), EngineError> {
    let components = devfile.image_components_to_push_automatically();
    for (name, image) in &components {
        let spec = serde_json::to_value(image)
            .with_context(|| format!("serializing image component {name}"))?;
        if status.image_components_auto_applied.get(*name) == Some(&spec) {
            debug!(component = name, "image unchanged, skipping build");
            continue;
        }
        images
            .build_and_push(name, image, req.devfile_dir())
            .await
            .map_err(|err| {
                EngineError::Other(err.context(format!("building image component {name}")))
            })?;
        status
            .image_components_auto_applied
            .insert((*name).to_string(), spec);
    }
    status
        .image_components_auto_applied
        .retain(|cached, _| components.iter().any(|(name, _)| name == cached));
    Ok(())
}
