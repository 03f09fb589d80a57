//! Single-image build driver.

use super::{demux_engine_stream, pack_context};
use crate::engine::{is_modern_builder_error, BuilderKind, ContainerEngine, ImageBuildOptions};
use crate::error::{KilnError, Result};
use crate::notify::BuildLogger;
use crate::spec::{BuildConfig, BuilderPreference};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, instrument, warn};

/// One image build: a context directory, a Dockerfile inside it, and the
/// effective build options.
#[derive(Debug, Clone)]
pub struct SingleBuild {
    /// Dockerfile name relative to the context root.
    pub dockerfile: String,
    pub tags: Vec<String>,
    pub build_args: HashMap<String, String>,
    pub target: Option<String>,
    pub no_cache: bool,
    pub pull: bool,
    pub platforms: Vec<String>,
    pub builder_preference: BuilderPreference,
}

impl SingleBuild {
    /// Derive the options from a spec-level build config, with an explicit
    /// tag set (steps and compose services override the spec tags).
    pub fn from_config(config: &BuildConfig, dockerfile: String, tags: Vec<String>) -> Self {
        Self {
            dockerfile,
            tags,
            build_args: config.args.clone(),
            target: config.target.clone(),
            no_cache: config.no_cache,
            pull: config.pull,
            platforms: config.platforms.clone(),
            builder_preference: config.builder_preference,
        }
    }

    fn engine_options(&self, builder: BuilderKind) -> ImageBuildOptions {
        ImageBuildOptions {
            dockerfile: self.dockerfile.clone(),
            tags: self.tags.clone(),
            build_args: self.build_args.clone(),
            target: self.target.clone(),
            no_cache: self.no_cache,
            pull: self.pull,
            platforms: self.platforms.clone(),
            builder,
        }
    }
}

/// Build one image from `context_dir` and return its id.
///
/// The modern builder is preferred; a modern-builder-specific failure is
/// retried once with the legacy builder. If the stream produces no image id
/// but a tag was requested, the id is resolved by inspecting the tag.
#[instrument(skip(engine, build, logger), fields(context = %context_dir.display()))]
pub async fn build_single_image(
    engine: &dyn ContainerEngine,
    context_dir: &Path,
    build: &SingleBuild,
    logger: &BuildLogger,
) -> Result<String> {
    let context_tar = pack_context(context_dir)?;
    logger.system(&format!(
        "Starting image build (Dockerfile: {}, context: {})",
        build.dockerfile,
        context_dir.display()
    ));

    let preferred = match build.builder_preference {
        BuilderPreference::Modern => BuilderKind::Modern,
        BuilderPreference::Legacy => BuilderKind::Legacy,
    };

    let stream = match engine.image_build(context_tar.clone(), &build.engine_options(preferred)).await
    {
        Ok(stream) => stream,
        Err(KilnError::EngineFailed { reason })
            if preferred == BuilderKind::Modern && is_modern_builder_error(&reason) =>
        {
            warn!(reason = %reason, "Modern builder unavailable, retrying with legacy builder");
            logger.system("Modern builder failed, retrying with legacy builder");
            engine
                .image_build(context_tar, &build.engine_options(BuilderKind::Legacy))
                .await?
        }
        Err(other) => return Err(other),
    };

    let image_id = demux_engine_stream(stream, logger).await?;

    let image_id = match image_id {
        Some(id) => id,
        None => {
            // The modern builder does not always emit an id in the stream.
            let Some(tag) = build.tags.first() else {
                return Err(KilnError::BuildFailed {
                    reason: "build finished but no image id could be determined (no tags to \
                             inspect)"
                        .to_string(),
                });
            };
            debug!(tag = %tag, "No image id in stream, resolving via tag inspection");
            let inspected = engine.image_inspect(tag).await.map_err(|e| KilnError::BuildFailed {
                reason: format!(
                    "build finished but no image id could be determined (tag inspection failed: \
                     {})",
                    e
                ),
            })?;
            logger.system(&format!("Image id resolved via tag inspection: {}", inspected.id));
            inspected.id
        }
    };

    let image_id = image_id.trim_start_matches("sha256:").to_string();
    logger.system(&format!("Build successful. Image id: {}", image_id));
    Ok(image_id)
}
