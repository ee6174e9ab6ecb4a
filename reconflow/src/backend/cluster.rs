//! Batch scheduler submission
//!
//! Every command stage becomes one job script under
//! `<work>/jobs/<subject>/`, submitted with the scheduler's own dependency
//! syntax so a stage is held until its predecessors finish successfully.
//! Dialects differ only in how the submit command line is spelled and how
//! the job id comes back.

use super::script::{job_name, render_script, write_script};
use super::{
    BackendKind, BackendOptions, ExecutionBackend, JobRecord, JobStatus, SubmissionError,
    SubmissionHandle,
};
use crate::graph::RealizedGraph;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, error, info};

/// One job as the scheduler sees it
#[derive(Debug, Clone)]
pub struct JobRequest<'a> {
    pub name: &'a str,
    pub cores: Option<u32>,
    /// Scheduler ids of jobs that must succeed first
    pub depends_on: &'a [String],
    pub script: &'a Path,
    /// Directory receiving the job's stdout/stderr
    pub log_dir: &'a Path,
}

/// Scheduler-specific spelling of a submission
pub trait SchedulerDialect: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Arguments passed to the submit program
    fn submit_args(&self, job: &JobRequest<'_>) -> Vec<String>;

    /// Job id from the submit program's stdout
    fn parse_job_id(&self, stdout: &str) -> Option<String>;

    /// Exit code a failed command is mapped to, if the scheduler needs one
    fn failure_exit_code(&self) -> Option<i32> {
        None
    }
}

pub struct ClusterBackend<D> {
    dialect: D,
    options: BackendOptions,
}

impl<D: SchedulerDialect> ClusterBackend<D> {
    pub fn new(dialect: D, options: BackendOptions) -> Self {
        Self { dialect, options }
    }

    async fn submit_subject(
        &self,
        graph: &RealizedGraph,
        handle: &mut SubmissionHandle,
    ) -> Result<(), SubmissionError> {
        let subject = graph.subject.to_string();
        let job_dir = self.options.work_dir.join("jobs").join(&subject);
        let log_dir = job_dir.join("logs");
        std::fs::create_dir_all(&log_dir)?;

        let mut job_ids: BTreeMap<&str, String> = BTreeMap::new();
        for stage in &graph.stages {
            let name = job_name(&subject, &stage.name);
            let contents = render_script(
                &self.options.template,
                &subject,
                stage,
                self.dialect.failure_exit_code(),
            );
            let script = write_script(&job_dir, &stage.name, &contents)?;

            let depends_on: Vec<String> = stage
                .predecessors
                .iter()
                .filter_map(|p| job_ids.get(p.as_str()).cloned())
                .collect();
            let request = JobRequest {
                name: &name,
                cores: stage.resource_hints.cores,
                depends_on: &depends_on,
                script: &script,
                log_dir: &log_dir,
            };
            let args = self.dialect.submit_args(&request);
            debug!("{} {}", self.options.scheduler_program, args.join(" "));

            let output = Command::new(&self.options.scheduler_program)
                .args(&args)
                .output()
                .await?;
            if !output.status.success() {
                return Err(SubmissionError::Scheduler {
                    stage: name,
                    status: output.status.to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }

            let stdout = String::from_utf8_lossy(&output.stdout);
            let job_id = self
                .dialect
                .parse_job_id(&stdout)
                .ok_or_else(|| SubmissionError::MissingJobId { stage: name.clone() })?;
            info!("Submitted {} as job {}", name, job_id);

            handle.jobs.push(JobRecord {
                subject: subject.clone(),
                stage: stage.name.clone(),
                job_id: Some(job_id.clone()),
                status: JobStatus::Queued,
            });
            job_ids.insert(stage.name.as_str(), job_id);
        }
        Ok(())
    }
}

#[async_trait]
impl<D: SchedulerDialect> ExecutionBackend for ClusterBackend<D> {
    fn kind(&self) -> BackendKind {
        self.dialect.kind()
    }

    async fn submit(&self, graphs: Vec<RealizedGraph>) -> Result<SubmissionHandle, SubmissionError> {
        let mut handle = SubmissionHandle::new(self.kind());
        for (index, graph) in graphs.iter().enumerate() {
            if let Err(e) = self.submit_subject(graph, &mut handle).await {
                if handle.jobs.is_empty() {
                    return Err(e);
                }
                handle.unsubmitted = graphs[index..]
                    .iter()
                    .map(|g| g.subject.to_string())
                    .collect();
                let mut queued: Vec<&str> = handle.jobs.iter().map(|j| j.subject.as_str()).collect();
                queued.dedup();
                error!(
                    "Submission stopped at {}: {}. Jobs already queued for: {}. Not queued: {}",
                    graph.subject,
                    e,
                    queued.join(", "),
                    handle.unsubmitted.join(", ")
                );
                return Err(SubmissionError::Partial {
                    handle: Box::new(handle),
                    source: Box::new(e),
                });
            }
        }
        info!(
            "Queued {} job(s) for {} subject(s) on {}",
            handle.jobs.len(),
            graphs.len(),
            self.kind()
        );
        Ok(handle)
    }
}

/// First non-empty line of scheduler output
pub(super) fn first_line(stdout: &str) -> Option<&str> {
    stdout.lines().map(str::trim).find(|l| !l.is_empty())
}
