//! Build step sequencer.
//!
//! Steps run strictly in spec order. A step may consume a binary stashed by
//! an earlier step (written into its codebase with executable mode before
//! building) and may publish one by naming a path inside its built image,
//! which is copied out through a transient container.

use super::{build_single_image, SingleBuild};
use crate::engine::ContainerEngine;
use crate::error::{KilnError, Result};
use crate::notify::BuildLogger;
use crate::spec::{BuildSpec, Codebase};
use futures::StreamExt;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use tracing::instrument;

/// Execute every build step. Returns the binaries stashed by steps that
/// declare `outputs_binary_path`, keyed by step name.
#[instrument(skip_all, fields(steps = spec.build_steps.len()))]
pub async fn run_build_steps(
    engine: &dyn ContainerEngine,
    build_dir: &Path,
    spec: &BuildSpec,
    logger: &BuildLogger,
) -> Result<HashMap<String, Vec<u8>>> {
    let codebases: HashMap<&str, &Codebase> =
        spec.codebases.iter().map(|c| (c.name.as_str(), c)).collect();
    let mut binaries: HashMap<String, Vec<u8>> = HashMap::new();

    for step in &spec.build_steps {
        logger.system(&format!("--- Build step: {} ---", step.name));

        let codebase = codebases.get(step.codebase_name.as_str()).ok_or_else(|| {
            KilnError::InvalidSpec {
                reason: format!(
                    "build step '{}' references unknown codebase '{}'",
                    step.name, step.codebase_name
                ),
            }
        })?;
        let step_dir = build_dir.join(
            codebase.target_in_host.as_deref().unwrap_or(codebase.name.as_str()),
        );

        // Thread in a binary produced by an earlier step.
        if let Some(producer) = &step.use_binary_from_step {
            let data = binaries.get(producer).ok_or_else(|| KilnError::BuildFailed {
                reason: format!(
                    "build step '{}' requires the binary of step '{}', which was not produced",
                    step.name, producer
                ),
            })?;
            let target_rel = step.binary_target_path.as_deref().ok_or_else(|| {
                KilnError::InvalidSpec {
                    reason: format!("build step '{}' sets no binary_target_path", step.name),
                }
            })?;
            let target = crate::archive::sanitize_entry_path(&step_dir, Path::new(target_rel))?;
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| KilnError::io(parent, e))?;
            }
            logger.system(&format!(
                "Injecting binary from step '{}' at {}",
                producer,
                target.display()
            ));
            std::fs::write(&target, data).map_err(|e| KilnError::io(&target, e))?;
            make_executable(&target);
        }

        let dockerfile = step_dir.join("Dockerfile");
        if !dockerfile.exists() {
            return Err(KilnError::BuildFailed {
                reason: format!(
                    "no Dockerfile found for build step '{}' (expected {})",
                    step.name,
                    dockerfile.display()
                ),
            });
        }

        // Step images get a disposable tag; they may be garbage-collected
        // after the main build.
        let step_tag = format!("{}-{}-step-{}:latest", spec.name, spec.version, step.name);
        let single = SingleBuild::from_config(
            &spec.build_config,
            "Dockerfile".to_string(),
            vec![step_tag],
        );
        let image_id = build_single_image(engine, &step_dir, &single, logger).await?;
        logger.system(&format!("Step '{}' built successfully, image id: {}", step.name, image_id));

        if let Some(binary_path) = &step.outputs_binary_path {
            logger.system(&format!(
                "Extracting binary '{}' from step '{}' image",
                binary_path, step.name
            ));
            let data = extract_from_container(engine, &image_id, binary_path).await?;
            logger.system(&format!("Binary extracted successfully ({} bytes)", data.len()));
            binaries.insert(step.name.clone(), data);
        }
        logger.system(&format!("--- End build step: {} ---", step.name));
    }

    Ok(binaries)
}

/// Copy a single file out of an image by way of a transient container.
/// The container is removed on every exit path.
pub async fn extract_from_container(
    engine: &dyn ContainerEngine,
    image: &str,
    path: &str,
) -> Result<Vec<u8>> {
    let container = engine.container_create(image).await?;
    let extracted = copy_file_from(engine, &container, path).await;
    // Best-effort removal; the extraction result takes precedence.
    if let Err(e) = engine.container_remove(&container).await {
        tracing::warn!(container = %container, error = %e, "Failed to remove transient container");
    }
    extracted
}

async fn copy_file_from(
    engine: &dyn ContainerEngine,
    container: &str,
    path: &str,
) -> Result<Vec<u8>> {
    // The engine returns the path wrapped in a tar archive.
    let mut stream = engine.container_copy_from(container, path).await?;
    let mut tar_bytes = Vec::new();
    while let Some(chunk) = stream.next().await {
        tar_bytes.extend_from_slice(&chunk?);
    }

    let mut archive = tar::Archive::new(std::io::Cursor::new(tar_bytes));
    let entries = archive.entries().map_err(|e| KilnError::EngineFailed {
        reason: format!("invalid archive copied from container: {}", e),
    })?;
    for entry in entries {
        let mut entry = entry.map_err(|e| KilnError::EngineFailed {
            reason: format!("error reading archive from container: {}", e),
        })?;
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }
        let mut data = Vec::new();
        entry.read_to_end(&mut data).map_err(|e| KilnError::EngineFailed {
            reason: format!("error reading '{}' from container archive: {}", path, e),
        })?;
        return Ok(data);
    }

    Err(KilnError::EngineFailed {
        reason: format!("path '{}' copied from container contained no regular file", path),
    })
}

#[cfg(unix)]
fn make_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755));
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) {}
