//! reconflow library interface
//!
//! Per-subject recon-all orchestration: locate each subject's scans,
//! resolve site-specific parameters, wire the stages into a validated graph
//! and hand the realized graphs to an execution backend.

pub mod app;
pub mod backend;
pub mod graph;
pub mod locator;
pub mod logging;
pub mod pipeline;
pub mod worklist;

pub use app::{run, RunOptions};
pub use backend::{BackendKind, ExecutionBackend, SubmissionError, SubmissionHandle};
pub use graph::{GraphValidationError, InstantiationError, PipelineGraph, RealizedGraph};
pub use locator::{FileLocator, FileSet, LocateError};
pub use pipeline::{SubjectAssembler, SubjectError};

/// Version, git hash and build time of this binary
pub fn build_info() -> String {
    format!(
        "{} (git {}, built {}, {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    )
}
