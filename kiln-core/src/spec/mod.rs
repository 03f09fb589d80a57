//! Build specification model: the declarative input to the orchestrator.

mod loader;
mod types;

pub use loader::{load_from_bytes, load_from_file, load_from_str, parse_env_file};
pub use types::{
    ArtifactStorage, BuildConfig, BuildResult, BuildSpec, BuildStep, BuilderPreference, Codebase,
    InjectMethod, OutputTarget, Resource, RunConfigDef, SecretSpec, ServiceOutput, SourceKind,
};
