//! Build spec data model.
//!
//! A [`BuildSpec`] describes what to build and how: where the sources come
//! from, how the image(s) are produced, and where the artifacts go.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// The declarative build specification submitted by a client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Service name. Required.
    pub name: String,

    /// Version of the software; semver or any opaque string. Required.
    pub version: String,

    /// Source trees feeding the build.
    #[serde(default)]
    pub codebases: Vec<Codebase>,

    /// Remote resources to download into the build root before building.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Resource>,

    /// Sequenced intermediate builds, used to thread a binary produced by
    /// one step into a later step's build context.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub build_steps: Vec<BuildStep>,

    /// Image build configuration.
    #[serde(default)]
    pub build_config: BuildConfig,

    /// Environment variables available at runtime (and merged into the
    /// generated run manifest).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// Paths of dotenv-style files to load, relative to the build root.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_files: Vec<String>,

    /// Secrets to fetch from the secret provider before building.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<SecretSpec>,

    /// Controls generation of the runtime manifest.
    #[serde(default)]
    pub run_config: RunConfigDef,
}

/// Where a codebase comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Local,
    Git,
    Archive,
    Buffer,
}

/// A named source tree feeding the build.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Codebase {
    /// Name of the codebase; also its default directory under the build root.
    pub name: String,

    #[serde(default)]
    pub source_kind: SourceKind,

    /// Git URL, local path, or archive path depending on `source_kind`.
    #[serde(default)]
    pub source: String,

    /// Git branch to clone (shallow, single-branch).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    /// Specific commit to check out after cloning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,

    /// Subpath within the source to use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// In-memory archive bytes when `source_kind == Buffer`. Never
    /// serialized; buffers arrive out of band.
    #[serde(skip)]
    pub content: Vec<u8>,

    /// The codebase only participates in build steps and is excluded from
    /// the runtime manifest.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub build_only: bool,

    /// Directory under the build root to place the codebase in, instead of
    /// the default directory named after the codebase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_in_host: Option<String>,
}

/// A remote resource downloaded into the build root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub url: String,

    /// Destination relative to the build root, sanitized against traversal.
    pub target_path: String,

    /// Extract the downloaded archive in place and remove it.
    #[serde(default)]
    pub extract: bool,
}

/// A sequenced intermediate build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStep {
    pub name: String,

    /// References a codebase by name.
    pub codebase_name: String,

    /// Path *inside the built container* of a binary to extract and stash
    /// under this step's name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs_binary_path: Option<String>,

    /// Name of an earlier step whose stashed binary this step consumes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_binary_from_step: Option<String>,

    /// Where to write the consumed binary, relative to this step's codebase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_target_path: Option<String>,
}

/// Where the produced images end up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputTarget {
    /// Images stay in the engine's local store, tagged.
    #[default]
    Engine,
    /// Images exported as `.tar` files next to the build.
    Local,
    /// Images streamed into the object store.
    ObjectStore,
}

/// Which engine builder to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuilderPreference {
    /// BuildKit-style builder, with a one-shot legacy fallback on
    /// modern-builder-specific failures.
    #[default]
    Modern,
    Legacy,
}

/// Image build configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,

    /// Relative path of the Dockerfile, or its inline content (detected by
    /// the presence of a newline). Mutually exclusive with `compose_file`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,

    /// Relative path of a compose file describing a multi-service build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose_file: Option<String>,

    /// Target stage for multi-stage builds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Build args injected into the image build.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub args: HashMap<String, String>,

    /// Tags for the final image (or the principal image for compose builds).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Cross-platform targets. Passed through to the engine; multi-platform
    /// orchestration is the engine's concern.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub platforms: Vec<String>,

    #[serde(default)]
    pub no_cache: bool,

    #[serde(default)]
    pub output_target: OutputTarget,

    /// Output directory when `output_target == Local`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,

    /// Attempt to pull base images before building.
    #[serde(default)]
    pub pull: bool,

    #[serde(default)]
    pub builder_preference: BuilderPreference,
}

/// How a secret value reaches the build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InjectMethod {
    /// The secret becomes a runtime environment variable named `name`.
    #[default]
    Env,
    /// The secret is written into the build root at the path `name`
    /// (mode 0600) and does not enter the runtime environment.
    File,
}

/// A secret to fetch from the secret provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretSpec {
    /// Variable name (or file path for `InjectMethod::File`).
    pub name: String,

    /// Opaque key passed to the secret provider.
    pub source: String,

    #[serde(default)]
    pub inject_method: InjectMethod,
}

/// Where the run manifest points its image references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactStorage {
    /// Reference images by tag in the engine's store.
    #[default]
    Engine,
    /// Reference exported `.tar` files by basename.
    Local,
}

/// Parameters for runtime manifest generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfigDef {
    /// Whether to generate the manifest at all.
    pub generate: bool,

    #[serde(default)]
    pub artifact_storage: ArtifactStorage,

    /// Default command for the single-service manifest.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
}

impl Default for RunConfigDef {
    fn default() -> Self {
        Self { generate: true, artifact_storage: ArtifactStorage::default(), commands: Vec::new() }
    }
}

/// Per-service output of a build.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceOutput {
    pub image_id: String,
    pub image_size: i64,
    pub logs: String,
}

/// Aggregate result of one build job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildResult {
    pub success: bool,

    /// Total build time in seconds.
    pub duration_secs: f64,

    /// Image id per service.
    #[serde(default)]
    pub image_ids: HashMap<String, String>,

    /// Image size per service, in bytes.
    #[serde(default)]
    pub image_sizes: HashMap<String, i64>,

    #[serde(default)]
    pub service_outputs: HashMap<String, ServiceOutput>,

    /// Exported tar path per service when the output target is local.
    #[serde(default)]
    pub local_image_paths: HashMap<String, PathBuf>,

    /// Object paths written when the output target is the object store.
    #[serde(default)]
    pub remote_objects: Vec<String>,

    /// Path of the generated runtime manifest, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_path: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Accumulated human-readable build log.
    #[serde(default)]
    pub logs: String,
}

impl BuildResult {
    /// The tags applied per service, filled in by the output sink.
    /// Kept out of serde; it is intermediate state for manifest synthesis.
    pub fn primary_service<'a>(&'a self, spec_name: &str) -> Option<&'a ServiceOutput> {
        self.service_outputs.get(spec_name).or_else(|| self.service_outputs.values().next())
    }
}
