//! Build spec loading and validation.
//!
//! Specs are accepted in YAML or JSON. The loader tries YAML first (the
//! canonical on-disk and on-wire format) and falls back to JSON, applies
//! defaults, then validates the invariants of the data model.

use super::types::*;
use crate::error::{KilnError, Result};
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use tracing::instrument;

/// Load and validate a spec from a file, choosing the parser by extension.
#[instrument]
pub fn load_from_file<P: AsRef<Path> + std::fmt::Debug>(path: P) -> Result<BuildSpec> {
    let path = path.as_ref();
    let data = std::fs::read(path).map_err(|e| KilnError::InvalidSpec {
        reason: format!("cannot read build spec '{}': {}", path.display(), e),
    })?;
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
    load_from_bytes(&data, ext)
}

/// Load and validate a spec from raw bytes, with a format hint ("json",
/// "yaml", "yml", or anything else to auto-detect).
pub fn load_from_bytes(data: &[u8], format: &str) -> Result<BuildSpec> {
    let spec: BuildSpec = match format {
        "json" => serde_json::from_slice(data).map_err(|e| KilnError::InvalidSpec {
            reason: format!("JSON parse error: {}", e),
        })?,
        "yaml" | "yml" => serde_yaml::from_slice(data).map_err(|e| KilnError::InvalidSpec {
            reason: format!("YAML parse error: {}", e),
        })?,
        _ => match serde_yaml::from_slice(data) {
            Ok(spec) => spec,
            Err(yaml_err) => serde_json::from_slice(data).map_err(|json_err| {
                KilnError::InvalidSpec {
                    reason: format!(
                        "unrecognized format. YAML error: {}; JSON error: {}",
                        yaml_err, json_err
                    ),
                }
            })?,
        },
    };

    validate(&spec)?;
    Ok(spec)
}

/// Load and validate a spec from a string (YAML with JSON fallback).
pub fn load_from_str(text: &str) -> Result<BuildSpec> {
    load_from_bytes(text.as_bytes(), "")
}

/// Validate the spec invariants and cross-references.
fn validate(spec: &BuildSpec) -> Result<()> {
    if spec.name.is_empty() || spec.version.is_empty() {
        return Err(KilnError::InvalidSpec {
            reason: "the fields 'name' and 'version' are required".to_string(),
        });
    }

    let has_dockerfile = spec.build_config.dockerfile.as_deref().is_some_and(|d| !d.is_empty());
    let has_compose = spec.build_config.compose_file.as_deref().is_some_and(|c| !c.is_empty());

    if spec.codebases.is_empty() && spec.build_steps.is_empty() && !has_dockerfile && !has_compose {
        return Err(KilnError::InvalidSpec {
            reason: "no codebase, build step, dockerfile or compose file specified".to_string(),
        });
    }
    if has_dockerfile && has_compose {
        return Err(KilnError::InvalidSpec {
            reason: "'dockerfile' and 'compose_file' are mutually exclusive".to_string(),
        });
    }

    let mut codebase_names = HashSet::new();
    for codebase in &spec.codebases {
        if codebase.name.is_empty() {
            return Err(KilnError::InvalidSpec {
                reason: "every codebase needs a name".to_string(),
            });
        }
        if !codebase_names.insert(codebase.name.as_str()) {
            return Err(KilnError::InvalidSpec {
                reason: format!("duplicate codebase name '{}'", codebase.name),
            });
        }
        match codebase.source_kind {
            SourceKind::Buffer => {
                if codebase.content.is_empty() {
                    return Err(KilnError::InvalidSpec {
                        reason: format!(
                            "buffer codebase '{}' has empty content",
                            codebase.name
                        ),
                    });
                }
            }
            _ => {
                if codebase.source.is_empty() {
                    return Err(KilnError::InvalidSpec {
                        reason: format!("codebase '{}' has no source", codebase.name),
                    });
                }
            }
        }
    }

    // Build steps: codebase references must resolve, binary plumbing must be
    // consistent, and a consumed step must appear earlier in the list.
    let mut seen_steps: HashMap<&str, &BuildStep> = HashMap::new();
    for step in &spec.build_steps {
        if !codebase_names.contains(step.codebase_name.as_str()) {
            return Err(KilnError::InvalidSpec {
                reason: format!(
                    "build step '{}' references unknown codebase '{}'",
                    step.name, step.codebase_name
                ),
            });
        }
        if let Some(producer) = &step.use_binary_from_step {
            let Some(producing_step) = seen_steps.get(producer.as_str()) else {
                return Err(KilnError::InvalidSpec {
                    reason: format!(
                        "build step '{}' consumes step '{}', which does not appear earlier",
                        step.name, producer
                    ),
                });
            };
            if producing_step.outputs_binary_path.is_none() {
                return Err(KilnError::InvalidSpec {
                    reason: format!(
                        "build step '{}' consumes step '{}', which declares no outputs_binary_path",
                        step.name, producer
                    ),
                });
            }
            if step.binary_target_path.is_none() {
                return Err(KilnError::InvalidSpec {
                    reason: format!(
                        "build step '{}' consumes a binary but sets no binary_target_path",
                        step.name
                    ),
                });
            }
        }
        seen_steps.insert(step.name.as_str(), step);
    }

    for resource in &spec.resources {
        if resource.url.is_empty() || resource.target_path.is_empty() {
            return Err(KilnError::InvalidSpec {
                reason: "resources need both a url and a target_path".to_string(),
            });
        }
    }

    Ok(())
}

/// Parse a dotenv-style file: `KEY=VALUE` per line, `#` comments, optional
/// `export ` prefix and surrounding quotes on the value.
pub fn parse_env_file(content: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else { continue };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    vars
}
