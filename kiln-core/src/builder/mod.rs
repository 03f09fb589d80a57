//! Build executor: drives the container engine from a materialized build
//! context.
//!
//! Three drivers share the plumbing here: the single-image build, the
//! multi-service (compose) build, and the step sequencer that threads
//! binaries between intermediate builds.

mod compose_build;
mod context;
mod single;
mod steps;
mod stream;

pub use compose_build::build_compose_project;
pub use context::pack_context;
pub use single::{build_single_image, SingleBuild};
pub use steps::run_build_steps;
pub use stream::demux_engine_stream;
