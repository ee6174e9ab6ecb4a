//! Grid Engine dialect
//!
//! `qsub -terse -N <name> -pe smp <cores> -hold_jid <id>,<id> script`.
//! A held job is released when its predecessors finish whatever their exit
//! status, unless a predecessor exits with 100, which keeps dependents held.
//! Scripts therefore map command failure to exit 100.

use super::cluster::{first_line, JobRequest, SchedulerDialect};
use super::BackendKind;

/// Exit code that puts a job into error state and holds its dependents
pub const HOLD_DEPENDENTS_EXIT: i32 = 100;

#[derive(Debug, Clone, Copy, Default)]
pub struct SgeDialect;

impl SchedulerDialect for SgeDialect {
    fn kind(&self) -> BackendKind {
        BackendKind::Sge
    }

    fn submit_args(&self, job: &JobRequest<'_>) -> Vec<String> {
        let log_dir = job.log_dir.to_string_lossy().into_owned();
        let mut args = vec![
            "-terse".to_string(),
            "-N".to_string(),
            job.name.to_string(),
            "-S".to_string(),
            "/bin/bash".to_string(),
            "-o".to_string(),
            log_dir.clone(),
            "-e".to_string(),
            log_dir,
        ];
        if let Some(cores) = job.cores {
            args.extend(["-pe".to_string(), "smp".to_string(), cores.to_string()]);
        }
        if !job.depends_on.is_empty() {
            args.push("-hold_jid".to_string());
            args.push(job.depends_on.join(","));
        }
        args.push(job.script.to_string_lossy().into_owned());
        args
    }

    /// `-terse` prints the bare id; array jobs append `.<range>`
    fn parse_job_id(&self, stdout: &str) -> Option<String> {
        first_line(stdout)
            .and_then(|line| line.split('.').next())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    }

    fn failure_exit_code(&self) -> Option<i32> {
        Some(HOLD_DEPENDENTS_EXIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_submit_args() {
        let deps = vec!["501".to_string(), "502".to_string()];
        let job = JobRequest {
            name: "recon_all_SPN01_CMH_0001_01",
            cores: Some(8),
            depends_on: &deps,
            script: Path::new("/w/recon_all.sh"),
            log_dir: Path::new("/w/logs"),
        };
        let args = SgeDialect.submit_args(&job);
        assert_eq!(&args[..3], ["-terse", "-N", "recon_all_SPN01_CMH_0001_01"]);
        let joined = args.join(" ");
        assert!(joined.contains("-pe smp 8"));
        assert!(joined.contains("-hold_jid 501,502"));
        assert_eq!(args.last().map(String::as_str), Some("/w/recon_all.sh"));
    }

    #[test]
    fn test_parse_terse_ids() {
        assert_eq!(SgeDialect.parse_job_id("4242\n"), Some("4242".to_string()));
        assert_eq!(SgeDialect.parse_job_id("4243.1-10:1\n"), Some("4243".to_string()));
        assert_eq!(SgeDialect.parse_job_id(""), None);
    }
}
