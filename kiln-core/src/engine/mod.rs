//! Container engine collaborator.
//!
//! The orchestrator drives an external engine through this narrow interface:
//! build an image from a context tar, save/tag/pull/inspect images, and
//! create throwaway containers for binary extraction. Streams are raw byte
//! streams; the build executor owns the demultiplexing of the engine's JSON
//! progress stream.

mod docker;

pub use docker::DockerEngine;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::HashMap;

/// A streaming engine response body.
pub type EngineStream = BoxStream<'static, Result<Bytes>>;

/// Which builder generation to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuilderKind {
    #[default]
    Modern,
    Legacy,
}

/// Options for a single image build.
#[derive(Debug, Clone, Default)]
pub struct ImageBuildOptions {
    /// Dockerfile name relative to the context root.
    pub dockerfile: String,

    /// Tags to apply to the built image.
    pub tags: Vec<String>,

    pub build_args: HashMap<String, String>,

    /// Target stage for multi-stage builds.
    pub target: Option<String>,

    pub no_cache: bool,

    /// Attempt to pull newer base images.
    pub pull: bool,

    /// Cross-platform targets, passed through verbatim.
    pub platforms: Vec<String>,

    pub builder: BuilderKind,
}

/// Result of an image inspection.
#[derive(Debug, Clone, Default)]
pub struct ImageInspect {
    /// Canonical image id, without the digest-algorithm prefix.
    pub id: String,
    /// Image size in bytes.
    pub size: i64,
}

/// Operations the orchestrator requires from a container engine.
///
/// Implementations must be safe to share across concurrently running jobs.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Start an image build from a tarred context. Returns the engine's
    /// streamed JSON progress body.
    async fn image_build(
        &self,
        context_tar: Bytes,
        options: &ImageBuildOptions,
    ) -> Result<EngineStream>;

    /// Export an image as a tar stream.
    async fn image_save(&self, image: &str) -> Result<EngineStream>;

    /// Apply a tag (`repo:tag`) to an image.
    async fn image_tag(&self, image: &str, tag: &str) -> Result<()>;

    /// Pull an image from its registry. Returns the streamed progress body.
    async fn image_pull(&self, reference: &str) -> Result<EngineStream>;

    /// Inspect an image by id or tag.
    async fn image_inspect(&self, reference: &str) -> Result<ImageInspect>;

    /// Create (but do not start) a container from an image; returns its id.
    async fn container_create(&self, image: &str) -> Result<String>;

    /// Copy a path out of a container as a tar stream.
    async fn container_copy_from(&self, container: &str, path: &str) -> Result<EngineStream>;

    /// Force-remove a container.
    async fn container_remove(&self, container: &str) -> Result<()>;
}

/// Whether an engine error is specific to the modern builder, in which case
/// the executor retries once with the legacy builder.
pub fn is_modern_builder_error(reason: &str) -> bool {
    let reason = reason.to_ascii_lowercase();
    reason.contains("buildkit") || reason.contains("session") && reason.contains("grpc")
}
