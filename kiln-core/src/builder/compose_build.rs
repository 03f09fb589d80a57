//! Multi-service (compose) build driver.
//!
//! Services are built in dependency order. A service with a `build` section
//! goes through the single-image driver and is tagged
//! `{spec_name}_{service}:latest`; a service with only an `image` is pulled
//! if absent from the engine's store. Per-service failures are collected and
//! reported together; the overall build fails if any service failed.

use super::{build_single_image, demux_engine_stream, SingleBuild};
use crate::compose::ComposeProject;
use crate::engine::ContainerEngine;
use crate::error::{KilnError, Result};
use crate::notify::BuildLogger;
use crate::spec::{BuildResult, BuildSpec, ServiceOutput};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::instrument;

/// Build every service of a compose project. Returns the per-service error
/// messages; an empty vector means full success.
#[instrument(skip_all, fields(services = project.services.len()))]
pub async fn build_compose_project(
    engine: &dyn ContainerEngine,
    build_dir: &Path,
    compose_file: &str,
    project: &ComposeProject,
    spec: &BuildSpec,
    result: &mut BuildResult,
    logger: &BuildLogger,
) -> Result<Vec<String>> {
    let compose_dir = build_dir
        .join(compose_file)
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| build_dir.to_path_buf());

    let order = dependency_order(project)?;
    let mut errors = Vec::new();

    for service_name in order {
        let service = &project.services[&service_name];

        let Some(build) = &service.build else {
            if service.image.is_empty() {
                logger.system(&format!(
                    "Service '{}' has no build section and no image. Skipping.",
                    service_name
                ));
                continue;
            }
            // Image-only service: make sure the image is present.
            if let Err(e) = ensure_image(engine, &service.image, logger).await {
                let message =
                    format!("failed to pull image '{}' for service '{}': {}", service.image, service_name, e);
                logger.system(&format!("Warning: {}", message));
            }
            continue;
        };

        logger.system(&format!("--- Building service: {} ---", service_name));

        // Context and Dockerfile resolve relative to the compose file's dir.
        let context_rel = build.context();
        let context_dir = if context_rel == "." || context_rel.is_empty() {
            compose_dir.clone()
        } else if Path::new(context_rel).is_absolute() {
            return Err(KilnError::InvalidSpec {
                reason: format!(
                    "compose service '{}' uses an absolute build context '{}'",
                    service_name, context_rel
                ),
            });
        } else {
            crate::archive::sanitize_entry_path(&compose_dir, Path::new(context_rel))?
        };

        // Compose args override spec args.
        let mut build_args: HashMap<String, String> = spec.build_config.args.clone();
        build_args.extend(build.args());

        let tag = format!("{}_{}:latest", spec.name, service_name);
        let single = SingleBuild {
            dockerfile: build.dockerfile().to_string(),
            tags: vec![tag],
            build_args,
            target: build.target().map(str::to_string),
            no_cache: spec.build_config.no_cache,
            pull: spec.build_config.pull,
            platforms: spec.build_config.platforms.clone(),
            builder_preference: spec.build_config.builder_preference,
        };

        match build_single_image(engine, &context_dir, &single, logger).await {
            Ok(image_id) => {
                let image_size = engine
                    .image_inspect(&image_id)
                    .await
                    .map(|i| i.size)
                    .unwrap_or_default();
                result.image_ids.insert(service_name.clone(), image_id.clone());
                result.image_sizes.insert(service_name.clone(), image_size);
                result.service_outputs.insert(
                    service_name.clone(),
                    ServiceOutput { image_id, image_size, logs: logger.transcript() },
                );
                logger.system(&format!("--- Finished service: {} ---", service_name));
            }
            Err(e) => {
                let message = format!("service '{}' build failed: {}", service_name, e);
                logger.system(&message);
                errors.push(message);
                result
                    .service_outputs
                    .insert(service_name.clone(), ServiceOutput::default());
            }
        }
    }

    Ok(errors)
}

/// Pull an image unless the engine already has it.
async fn ensure_image(
    engine: &dyn ContainerEngine,
    image: &str,
    logger: &BuildLogger,
) -> Result<()> {
    if engine.image_inspect(image).await.is_ok() {
        logger.system(&format!("Image '{}' already present in engine store", image));
        return Ok(());
    }
    logger.system(&format!("Pulling image '{}'", image));
    let stream = engine.image_pull(image).await?;
    demux_engine_stream(stream, logger).await?;
    logger.system(&format!("Image '{}' pulled successfully", image));
    Ok(())
}

/// Topological order over `depends_on`, with stable alphabetical tiebreaks.
/// Unknown dependencies and cycles are spec errors.
fn dependency_order(project: &ComposeProject) -> Result<Vec<String>> {
    let mut names: Vec<&String> = project.services.keys().collect();
    names.sort();

    for (name, service) in &project.services {
        for dep in &service.depends_on {
            if !project.services.contains_key(dep) {
                return Err(KilnError::InvalidSpec {
                    reason: format!(
                        "compose service '{}' depends on '{}', which does not exist",
                        name, dep
                    ),
                });
            }
        }
    }

    let mut order = Vec::with_capacity(names.len());
    let mut done: HashSet<String> = HashSet::new();
    let mut in_progress: HashSet<String> = HashSet::new();

    fn visit(
        name: &str,
        project: &ComposeProject,
        done: &mut HashSet<String>,
        in_progress: &mut HashSet<String>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        if done.contains(name) {
            return Ok(());
        }
        if !in_progress.insert(name.to_string()) {
            return Err(KilnError::InvalidSpec {
                reason: format!("circular dependency detected in compose service '{}'", name),
            });
        }
        let mut deps = project.services[name].depends_on.clone();
        deps.sort();
        for dep in deps {
            visit(&dep, project, done, in_progress, order)?;
        }
        in_progress.remove(name);
        done.insert(name.to_string());
        order.push(name.to_string());
        Ok(())
    }

    for name in names {
        visit(name, project, &mut done, &mut in_progress, &mut order)?;
    }
    Ok(order)
}
