//! Runtime manifest synthesis.
//!
//! After a successful build KILN emits a language-neutral "how to run this"
//! document (`*.run.yml`): one service per compose service, or a single
//! service named after the spec. Image references depend on where the
//! artifacts were stored; environment values are literal, with no
//! shell-style interpolation.

use crate::compose::ComposeProject;
use crate::error::{KilnError, Result};
use crate::spec::{ArtifactStorage, BuildResult, BuildSpec};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{instrument, warn};

/// Manifest format version.
pub const MANIFEST_VERSION: &str = "1.0";

/// The generated runtime manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub version: String,
    pub services: BTreeMap<String, RunService>,
}

/// One runnable service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunService {
    /// Tag in the engine store, or the basename of the exported tar.
    pub image: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,

    /// "host:container" pairs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub restart: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

/// Derive the manifest from the build.
///
/// With a compose project, every compose service becomes a `RunService`
/// inheriting command, entrypoint, ports, volumes, depends_on and restart;
/// its environment starts from the merged runtime env and is overlaid with
/// the service's own literal values. Without one, a single service keyed by
/// the spec name carries the merged runtime env.
#[instrument(skip_all)]
pub fn synthesize(
    spec: &BuildSpec,
    result: &BuildResult,
    runtime_env: &HashMap<String, String>,
    tag_table: &HashMap<String, Vec<String>>,
    compose: Option<&ComposeProject>,
) -> RunManifest {
    let mut services = BTreeMap::new();

    if let Some(project) = compose {
        for (name, service) in &project.services {
            let mut environment: BTreeMap<String, String> =
                runtime_env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            for (key, value) in service.environment.to_map() {
                environment.insert(key, value);
            }

            services.insert(
                name.clone(),
                RunService {
                    image: image_ref_for(
                        name,
                        spec.run_config.artifact_storage,
                        result,
                        tag_table,
                    ),
                    command: service.command.clone().unwrap_or_default(),
                    entrypoint: service.entrypoint.clone().unwrap_or_default(),
                    environment,
                    ports: service.ports.clone(),
                    volumes: service.volumes.clone(),
                    restart: service.restart.clone(),
                    depends_on: service.depends_on.clone(),
                },
            );
        }
    } else {
        services.insert(
            spec.name.clone(),
            RunService {
                image: image_ref_for(
                    &spec.name,
                    spec.run_config.artifact_storage,
                    result,
                    tag_table,
                ),
                command: spec.run_config.commands.clone(),
                environment: runtime_env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                ..Default::default()
            },
        );
    }

    if services.is_empty() {
        warn!("No services could be added to the runtime manifest");
    }

    RunManifest { version: MANIFEST_VERSION.to_string(), services }
}

/// Pick the image reference for one service.
///
/// Local storage references the exported tar by basename. Engine storage
/// prefers the first tag, falls back to the image id, and finally to a
/// default `{service}:latest`.
pub fn image_ref_for(
    service: &str,
    storage: ArtifactStorage,
    result: &BuildResult,
    tag_table: &HashMap<String, Vec<String>>,
) -> String {
    match storage {
        ArtifactStorage::Local => match result.local_image_paths.get(service) {
            Some(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.to_string_lossy().to_string()),
            None => {
                warn!(service = %service, "No local image path recorded for service");
                format!("local:{}_image_not_found.tar", service)
            }
        },
        ArtifactStorage::Engine => {
            if let Some(tag) = tag_table.get(service).and_then(|tags| tags.first()) {
                return tag.clone();
            }
            if let Some(id) = result.image_ids.get(service).filter(|id| !id.is_empty()) {
                return id.clone();
            }
            warn!(service = %service, "Neither tag nor image id recorded for service");
            format!("{}:latest", service)
        }
    }
}

/// Serialize the manifest as YAML at `path`.
pub fn write_manifest(manifest: &RunManifest, path: &Path) -> Result<()> {
    let yaml = serde_yaml::to_string(manifest).map_err(|e| KilnError::Internal(format!(
        "failed to serialize runtime manifest: {}",
        e
    )))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| KilnError::io(parent, e))?;
    }
    std::fs::write(path, yaml).map_err(|e| KilnError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::ComposeParser;
    use std::path::PathBuf;

    fn demo_spec() -> BuildSpec {
        BuildSpec { name: "demo".into(), version: "1".into(), ..Default::default() }
    }

    #[test]
    fn test_single_service_manifest() {
        let spec = demo_spec();
        let mut result = BuildResult::default();
        result.image_ids.insert("demo".into(), "abc123".into());
        let env = HashMap::from([("PORT".to_string(), "8080".to_string())]);
        let tags = HashMap::from([("demo".to_string(), vec!["demo:1".to_string()])]);

        let manifest = synthesize(&spec, &result, &env, &tags, None);
        assert_eq!(manifest.version, "1.0");
        assert_eq!(manifest.services.len(), 1);
        let service = &manifest.services["demo"];
        assert_eq!(service.image, "demo:1");
        assert_eq!(service.environment.get("PORT").map(String::as_str), Some("8080"));
    }

    #[test]
    fn test_compose_manifest_inherits_topology() {
        let project = ComposeParser::parse(
            "services:\n  web:\n    image: w\n    ports: ['8080:80']\n    depends_on: [api]\n    restart: always\n    environment:\n      WEB_ONLY: '1'\n  api:\n    image: a\n",
        )
        .unwrap();
        let mut spec = demo_spec();
        spec.build_config.compose_file = Some("docker-compose.yml".into());
        let mut result = BuildResult::default();
        result.image_ids.insert("web".into(), "id-web".into());
        result.image_ids.insert("api".into(), "id-api".into());
        let env = HashMap::from([("SHARED".to_string(), "yes".to_string())]);
        let tags = HashMap::from([
            ("web".to_string(), vec!["demo_web:latest".to_string()]),
            ("api".to_string(), vec!["demo_api:latest".to_string()]),
        ]);

        let manifest = synthesize(&spec, &result, &env, &tags, Some(&project));
        assert_eq!(manifest.services.len(), 2);
        let web = &manifest.services["web"];
        assert_eq!(web.image, "demo_web:latest");
        assert_eq!(web.ports, vec!["8080:80"]);
        assert_eq!(web.depends_on, vec!["api"]);
        assert_eq!(web.restart, "always");
        // merged env plus the literal per-service overlay
        assert_eq!(web.environment.get("SHARED").map(String::as_str), Some("yes"));
        assert_eq!(web.environment.get("WEB_ONLY").map(String::as_str), Some("1"));
        assert!(!manifest.services["api"].environment.contains_key("WEB_ONLY"));
    }

    #[test]
    fn test_image_ref_local_uses_basename() {
        let mut result = BuildResult::default();
        result
            .local_image_paths
            .insert("web".into(), PathBuf::from("/builds/b-1/demo_web.tar"));
        let image = image_ref_for("web", ArtifactStorage::Local, &result, &HashMap::new());
        assert_eq!(image, "demo_web.tar");
    }

    #[test]
    fn test_image_ref_engine_fallbacks() {
        let mut result = BuildResult::default();
        // no tag, no id -> default
        assert_eq!(
            image_ref_for("web", ArtifactStorage::Engine, &result, &HashMap::new()),
            "web:latest"
        );
        // id but no tag -> id
        result.image_ids.insert("web".into(), "cafe".into());
        assert_eq!(
            image_ref_for("web", ArtifactStorage::Engine, &result, &HashMap::new()),
            "cafe"
        );
    }

    #[test]
    fn test_manifest_yaml_roundtrip() {
        let spec = demo_spec();
        let result = BuildResult::default();
        let manifest = synthesize(&spec, &result, &HashMap::new(), &HashMap::new(), None);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo-1.run.yml");
        write_manifest(&manifest, &path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("version: '1.0'") || text.contains("version: \"1.0\""));
        let back: RunManifest = serde_yaml::from_str(&text).unwrap();
        assert_eq!(back.services.len(), 1);
    }
}
