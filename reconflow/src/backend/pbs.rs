//! PBS/Torque dialect
//!
//! `qsub -N <name> -l nodes=1:ppn=<cores> -W depend=afterok:<id>:<id> script`,
//! job id printed on stdout (e.g. `1234.headnode`).

use super::cluster::{first_line, JobRequest, SchedulerDialect};
use super::BackendKind;

#[derive(Debug, Clone, Copy, Default)]
pub struct PbsDialect;

impl SchedulerDialect for PbsDialect {
    fn kind(&self) -> BackendKind {
        BackendKind::Pbs
    }

    fn submit_args(&self, job: &JobRequest<'_>) -> Vec<String> {
        let log_dir = job.log_dir.to_string_lossy().into_owned();
        let mut args = vec![
            "-N".to_string(),
            job.name.to_string(),
            "-l".to_string(),
            format!("nodes=1:ppn={}", job.cores.unwrap_or(1)),
            "-o".to_string(),
            log_dir.clone(),
            "-e".to_string(),
            log_dir,
        ];
        if !job.depends_on.is_empty() {
            args.push("-W".to_string());
            args.push(format!("depend=afterok:{}", job.depends_on.join(":")));
        }
        args.push(job.script.to_string_lossy().into_owned());
        args
    }

    fn parse_job_id(&self, stdout: &str) -> Option<String> {
        first_line(stdout).map(str::to_string)
    }
}
