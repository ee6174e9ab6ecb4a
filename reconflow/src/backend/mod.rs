//! Execution backends
//!
//! A backend takes the realized graphs of one run (one per subject) and
//! hands their command stages to something that runs them, preserving the
//! stage order of each subject. Submission is fire-and-forget: the returned
//! [`SubmissionHandle`] records what was handed over, and waiting or retrying
//! is left to the scheduler.
//!
//! # Variants
//! - [`LocalBackend`]: runs stages on this machine, in order
//! - [`ClusterBackend<PbsDialect>`]: PBS/Torque `qsub` with `afterok` dependencies
//! - [`ClusterBackend<SgeDialect>`]: Grid Engine `qsub` with `-hold_jid`

mod cluster;
mod local;
mod pbs;
mod script;
mod sge;

pub use cluster::{ClusterBackend, JobRequest, SchedulerDialect};
pub use local::LocalBackend;
pub use pbs::PbsDialect;
pub use script::{job_name, render_script, shell_quote};
pub use sge::SgeDialect;

use crate::graph::RealizedGraph;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Scheduler program used when none is configured
pub const DEFAULT_SCHEDULER_PROGRAM: &str = "qsub";

/// Which backend receives the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Run every stage on this machine
    Local,
    /// PBS/Torque cluster
    Pbs,
    /// Sun/Son of Grid Engine cluster
    Sge,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Local => "local",
            BackendKind::Pbs => "pbs",
            BackendKind::Sge => "sge",
        })
    }
}

/// Submission failures
#[derive(Debug, Error)]
pub enum SubmissionError {
    /// Writing job scripts or launching the scheduler failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Scheduler rejected a job
    #[error("Scheduler rejected {stage} ({status}): {stderr}")]
    Scheduler {
        stage: String,
        status: String,
        stderr: String,
    },

    /// Scheduler accepted a job but printed no id to depend on
    #[error("No job id returned for {stage}")]
    MissingJobId { stage: String },

    /// Job template could not be read
    #[error("Job template error: {0}")]
    Template(String),

    /// Submission record could not be written
    #[error("Cannot serialize submission record: {0}")]
    Record(#[from] serde_json::Error),

    /// Submission stopped after some jobs were already queued
    ///
    /// `handle` lists the queued jobs and, in `unsubmitted`, the subjects
    /// not fully handed over.
    #[error("Submission stopped after {} queued job(s): {source}", .handle.jobs.len())]
    Partial {
        handle: Box<SubmissionHandle>,
        source: Box<SubmissionError>,
    },
}

/// Header prepended to every cluster job script
///
/// Typically loads environment modules so jobs see the same tools as the
/// submitting shell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceTemplate {
    pub header: Option<String>,
}

impl ResourceTemplate {
    pub fn load(path: &Path) -> Result<Self, SubmissionError> {
        let header = std::fs::read_to_string(path).map_err(|e| {
            SubmissionError::Template(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Ok(Self {
            header: Some(header),
        })
    }
}

/// Settings shared by every backend
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Root for job scripts, stage logs and submission records
    pub work_dir: PathBuf,
    pub scheduler_program: String,
    pub template: ResourceTemplate,
}

impl BackendOptions {
    pub fn new(work_dir: PathBuf) -> Self {
        Self {
            work_dir,
            scheduler_program: DEFAULT_SCHEDULER_PROGRAM.to_string(),
            template: ResourceTemplate::default(),
        }
    }
}

/// State of one stage as far as the orchestrator knows
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    /// Handed to a scheduler
    Queued,
    Succeeded,
    /// `code` is absent when the process could not start or was killed
    Failed { code: Option<i32> },
    /// Not run because a predecessor did not succeed
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRecord {
    pub subject: String,
    pub stage: String,
    /// Scheduler job id (cluster backends only)
    pub job_id: Option<String>,
    pub status: JobStatus,
}

/// What one submission handed over
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionHandle {
    pub id: Uuid,
    pub backend: BackendKind,
    pub submitted_at: DateTime<Utc>,
    /// `build_info()` of the submitting binary
    pub submitted_by: String,
    pub jobs: Vec<JobRecord>,
    /// Subjects with at least one stage not handed over
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unsubmitted: Vec<String>,
}

impl SubmissionHandle {
    pub fn new(backend: BackendKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            backend,
            submitted_at: Utc::now(),
            submitted_by: crate::build_info(),
            jobs: Vec::new(),
            unsubmitted: Vec::new(),
        }
    }

    pub fn job(&self, subject: &str, stage: &str) -> Option<&JobRecord> {
        self.jobs
            .iter()
            .find(|j| j.subject == subject && j.stage == stage)
    }

    pub fn count(&self, status: &JobStatus) -> usize {
        self.jobs.iter().filter(|j| &j.status == status).count()
    }

    /// Jobs that failed or were skipped
    pub fn unsuccessful(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| matches!(j.status, JobStatus::Failed { .. } | JobStatus::Skipped))
            .count()
    }

    /// Write the handle as JSON to `<dir>/<id>.json`
    pub fn save(&self, dir: &Path) -> Result<PathBuf, SubmissionError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.json", self.id));
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }
}

/// Runs or schedules realized graphs
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Hand over every subject's graph
    ///
    /// A stage never starts before all its predecessors succeeded for the
    /// same subject. Subjects share no state.
    async fn submit(&self, graphs: Vec<RealizedGraph>) -> Result<SubmissionHandle, SubmissionError>;
}

pub fn create_backend(kind: BackendKind, options: BackendOptions) -> Box<dyn ExecutionBackend> {
    match kind {
        BackendKind::Local => Box::new(LocalBackend::new(options.work_dir)),
        BackendKind::Pbs => Box::new(ClusterBackend::new(PbsDialect, options)),
        BackendKind::Sge => Box::new(ClusterBackend::new(SgeDialect, options)),
    }
}

/// Submit `graphs` to a backend of the given kind
pub async fn submit(
    graphs: Vec<RealizedGraph>,
    kind: BackendKind,
    options: BackendOptions,
) -> Result<SubmissionHandle, SubmissionError> {
    create_backend(kind, options).submit(graphs).await
}
