//! Output sink: what happens to the images once they are built.
//!
//! Three targets: leave them tagged in the engine's store, export them as
//! local `.tar` files, or stream them into the object store. Object-store
//! uploads go writer-to-stream with no full in-memory buffering; the small
//! tag-reference objects that accompany them are best-effort.

use crate::engine::ContainerEngine;
use crate::error::{KilnError, Result};
use crate::notify::BuildLogger;
use crate::spec::{BuildResult, BuildSpec, OutputTarget};
use crate::store::ObjectStore;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::instrument;

/// Result of the output phase.
#[derive(Debug, Default)]
pub struct OutputOutcome {
    /// Canonical reference of the primary artifact: a tag, an absolute
    /// local path, or an object-store path.
    pub artifact_ref: Option<String>,
    /// Tags applied per service.
    pub tag_table: HashMap<String, Vec<String>>,
    /// Non-fatal problems (tag-reference upload failures and the like),
    /// surfaced in the trailing status message.
    pub warnings: Vec<String>,
}

/// Tag, save, or upload every built image according to the output target.
#[instrument(skip_all, fields(target = ?spec.build_config.output_target))]
pub async fn store_outputs(
    engine: &dyn ContainerEngine,
    store: Option<&dyn ObjectStore>,
    spec: &BuildSpec,
    result: &mut BuildResult,
    output_base: &Path,
    logger: &BuildLogger,
) -> Result<OutputOutcome> {
    let mut outcome = OutputOutcome::default();
    let is_compose = spec.build_config.compose_file.is_some();

    // Resolve and apply the final tag set.
    for (service, output) in &result.service_outputs {
        if output.image_id.is_empty() {
            continue;
        }
        let tags = resolve_tags(spec, service, is_compose);
        for tag in &tags {
            match engine.image_tag(&output.image_id, tag).await {
                Ok(()) => logger.system(&format!("Tagged image {} as {}", output.image_id, tag)),
                Err(e) => {
                    let warning =
                        format!("failed to tag image {} as {}: {}", output.image_id, tag, e);
                    logger.system(&format!("Warning: {}", warning));
                    outcome.warnings.push(warning);
                }
            }
        }
        outcome.tag_table.insert(service.clone(), tags);
    }

    logger.system(&format!(
        "Handling build output target: {:?}",
        spec.build_config.output_target
    ));

    match spec.build_config.output_target {
        OutputTarget::Engine => {
            // Images are already in the engine's store, tagged.
            let main_tags = outcome.tag_table.get(&spec.name).or_else(|| {
                outcome.tag_table.values().next()
            });
            outcome.artifact_ref = main_tags
                .and_then(|tags| tags.first().cloned())
                .or_else(|| result.primary_service(&spec.name).map(|s| s.image_id.clone()));
        }

        OutputTarget::Local => {
            for (service, output) in result.service_outputs.clone() {
                if output.image_id.is_empty() {
                    continue;
                }
                let file_name = format!("{}_{}.tar", spec.name, service);
                let target = output_base.join(&file_name);
                logger.system(&format!(
                    "Saving image for service '{}' to {}",
                    service,
                    target.display()
                ));
                save_image_locally(engine, &output.image_id, &target).await?;
                if service == spec.name || outcome.artifact_ref.is_none() {
                    outcome.artifact_ref = Some(target.to_string_lossy().to_string());
                }
                result.local_image_paths.insert(service, target);
            }
        }

        OutputTarget::ObjectStore => {
            let store = store.ok_or_else(|| KilnError::OutputFailed {
                reason: "output target is the object store but no store is configured"
                    .to_string(),
            })?;
            for (service, output) in result.service_outputs.clone() {
                if output.image_id.is_empty() {
                    continue;
                }
                let object_path = format!("{}/{}-{}.tar", spec.name, service, spec.version);
                logger.system(&format!(
                    "Uploading image for service '{}' to {}",
                    service, object_path
                ));
                upload_image(engine, store, &output.image_id, &object_path).await?;
                result.remote_objects.push(object_path.clone());
                if service == spec.name || outcome.artifact_ref.is_none() {
                    outcome.artifact_ref = Some(object_path.clone());
                }

                // Tag references are small text objects mapping tag to the
                // primary object. Their failure does not fail the build.
                let tags = outcome.tag_table.get(&service).cloned().unwrap_or_default();
                for tag in tags {
                    if let Err(e) = upload_tag_reference(
                        store,
                        &tag,
                        &output.image_id,
                        &spec.version,
                        &service,
                        &object_path,
                        result,
                    )
                    .await
                    {
                        let warning = format!("failed to upload tag reference for '{}': {}", tag, e);
                        logger.system(&format!("Warning: {}", warning));
                        outcome.warnings.push(warning);
                    }
                }
            }
        }
    }

    Ok(outcome)
}

/// The tags a service's image receives: spec tags when supplied, otherwise
/// `{name}:{version}` for single-image builds and `{name}_{service}:latest`
/// for compose builds.
fn resolve_tags(spec: &BuildSpec, service: &str, is_compose: bool) -> Vec<String> {
    if is_compose {
        vec![format!("{}_{}:latest", spec.name, service)]
    } else if !spec.build_config.tags.is_empty() {
        spec.build_config.tags.clone()
    } else {
        vec![format!("{}:{}", spec.name, spec.version)]
    }
}

/// Stream an engine export into a local file.
async fn save_image_locally(
    engine: &dyn ContainerEngine,
    image_id: &str,
    target: &Path,
) -> Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| KilnError::io(parent, e))?;
    }
    let mut stream = engine.image_save(image_id).await?;
    let mut file = tokio::fs::File::create(target)
        .await
        .map_err(|e| KilnError::io(target, e))?;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| KilnError::OutputFailed {
            reason: format!("image export stream failed: {}", e),
        })?;
        file.write_all(&chunk).await.map_err(|e| KilnError::io(target, e))?;
    }
    file.flush().await.map_err(|e| KilnError::io(target, e))?;
    Ok(())
}

/// Stream an engine export straight into an object writer.
async fn upload_image(
    engine: &dyn ContainerEngine,
    store: &dyn ObjectStore,
    image_id: &str,
    object_path: &str,
) -> Result<()> {
    let mut stream = engine.image_save(image_id).await?;
    let mut writer = store.object_writer(object_path).await?;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| KilnError::OutputFailed {
            reason: format!("image export stream failed: {}", e),
        })?;
        writer.write_all(&chunk).await.map_err(|e| KilnError::OutputFailed {
            reason: format!("object-store write failed for '{}': {}", object_path, e),
        })?;
    }
    writer.shutdown().await.map_err(|e| KilnError::OutputFailed {
        reason: format!("object-store upload of '{}' did not finalize: {}", object_path, e),
    })?;
    Ok(())
}

async fn upload_tag_reference(
    store: &dyn ObjectStore,
    tag: &str,
    image_id: &str,
    version: &str,
    service: &str,
    main_object: &str,
    result: &mut BuildResult,
) -> Result<()> {
    let clean_tag = tag.replace(':', "-").replace('/', "_");
    let ref_path = format!("{}.ref.txt", clean_tag);
    let content = format!(
        "ImageID: {}\nTag: {}\nVersion: {}\nServiceName: {}\nMainObject: {}\n",
        image_id, tag, version, service, main_object
    );
    let mut writer = store.object_writer(&ref_path).await?;
    writer.write_all(content.as_bytes()).await.map_err(|e| KilnError::OutputFailed {
        reason: format!("writing tag reference '{}' failed: {}", ref_path, e),
    })?;
    writer.shutdown().await.map_err(|e| KilnError::OutputFailed {
        reason: format!("finalizing tag reference '{}' failed: {}", ref_path, e),
    })?;
    result.remote_objects.push(ref_path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with(tags: Vec<String>, compose: bool) -> BuildSpec {
        let mut spec = BuildSpec { name: "demo".into(), version: "1".into(), ..Default::default() };
        spec.build_config.tags = tags;
        if compose {
            spec.build_config.compose_file = Some("docker-compose.yml".into());
        }
        spec
    }

    #[test]
    fn test_resolve_tags_spec_tags_win() {
        let spec = spec_with(vec!["demo:1".into(), "demo:latest".into()], false);
        assert_eq!(resolve_tags(&spec, "demo", false), vec!["demo:1", "demo:latest"]);
    }

    #[test]
    fn test_resolve_tags_single_default() {
        let spec = spec_with(vec![], false);
        assert_eq!(resolve_tags(&spec, "demo", false), vec!["demo:1"]);
    }

    #[test]
    fn test_resolve_tags_compose_default() {
        let spec = spec_with(vec![], true);
        assert_eq!(resolve_tags(&spec, "web", true), vec!["demo_web:latest"]);
    }
}
