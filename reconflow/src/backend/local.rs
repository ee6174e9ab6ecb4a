//! Local execution
//!
//! Runs each subject's command stages on this machine, one at a time, in
//! dependency order. Output of every stage goes to
//! `<work>/logs/<subject>/<stage>.log`. A stage whose predecessor did not
//! succeed is skipped; a failing subject does not stop the others.

use super::{BackendKind, ExecutionBackend, JobRecord, JobStatus, SubmissionError, SubmissionHandle};
use crate::graph::{RealizedGraph, RealizedStage};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, info_span, warn, Instrument};

pub struct LocalBackend {
    work_dir: PathBuf,
}

impl LocalBackend {
    pub fn new(work_dir: PathBuf) -> Self {
        Self { work_dir }
    }

    async fn run_subject(&self, graph: &RealizedGraph) -> Result<Vec<JobRecord>, SubmissionError> {
        let subject = graph.subject.to_string();
        let log_dir = self.work_dir.join("logs").join(&subject);
        tokio::fs::create_dir_all(&log_dir).await?;

        let mut statuses: BTreeMap<&str, JobStatus> = BTreeMap::new();
        let mut records = Vec::with_capacity(graph.stages.len());
        for stage in &graph.stages {
            let blocked = stage
                .predecessors
                .iter()
                .any(|p| statuses.get(p.as_str()) != Some(&JobStatus::Succeeded));

            let status = if blocked {
                warn!("Skipping {}: a predecessor did not succeed", stage.name);
                JobStatus::Skipped
            } else {
                run_stage(stage, &log_dir.join(format!("{}.log", stage.name))).await
            };

            statuses.insert(stage.name.as_str(), status.clone());
            records.push(JobRecord {
                subject: subject.clone(),
                stage: stage.name.clone(),
                job_id: None,
                status,
            });
        }
        Ok(records)
    }
}

async fn run_stage(stage: &RealizedStage, log_path: &Path) -> JobStatus {
    let Some((program, args)) = stage.command.split_first() else {
        warn!("Stage {} has an empty command", stage.name);
        return JobStatus::Failed { code: None };
    };

    let stdio = File::create(log_path).and_then(|out| Ok((out.try_clone()?, out)));
    let (stdout, stderr) = match stdio {
        Ok(pair) => pair,
        Err(e) => {
            warn!("Cannot open log {}: {}", log_path.display(), e);
            return JobStatus::Failed { code: None };
        }
    };

    info!("Running {}", stage.name);
    let result = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .status()
        .await;

    match result {
        Ok(status) if status.success() => {
            info!("{} finished", stage.name);
            JobStatus::Succeeded
        }
        Ok(status) => {
            warn!(
                "{} failed ({}), see {}",
                stage.name,
                status,
                log_path.display()
            );
            JobStatus::Failed {
                code: status.code(),
            }
        }
        Err(e) => {
            warn!("Cannot start {}: {}", program, e);
            JobStatus::Failed { code: None }
        }
    }
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn submit(&self, graphs: Vec<RealizedGraph>) -> Result<SubmissionHandle, SubmissionError> {
        let mut handle = SubmissionHandle::new(BackendKind::Local);
        for graph in &graphs {
            let span = info_span!("subject", id = %graph.subject);
            let records = self.run_subject(graph).instrument(span).await?;
            handle.jobs.extend(records);
        }
        info!(
            "Ran {} stage(s) for {} subject(s): {} unsuccessful",
            handle.jobs.len(),
            graphs.len(),
            handle.unsuccessful()
        );
        Ok(handle)
    }
}
