//! One orchestration run for a study

use crate::backend::{
    self, BackendKind, BackendOptions, ResourceTemplate, SubmissionError, SubmissionHandle,
};
use crate::locator::FileLocator;
use crate::pipeline::{self, ReconAllOptions, SubjectAssembler};
use crate::worklist;
use anyhow::{Context, Result};
use reconflow_common::{Config, Error as ConfigError, ParameterResolver, SystemConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Working directory, relative to the study base, when `paths.work` is unset
pub const DEFAULT_WORK_DIR: &str = "pipelines/workingdir_reconflow";

/// What to run, as requested on the command line
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub study: String,
    pub backend: BackendKind,
    pub job_template: Option<PathBuf>,
    pub scheduler_program: String,
    /// Restrict the run to these subject ids
    pub subjects: Vec<String>,
    /// Assemble and log, submit nothing
    pub dry_run: bool,
}

/// Assemble every subject of the study and submit them
///
/// Returns `None` when nothing was submitted (dry run, or every subject
/// excluded or already processed).
pub async fn run(system: SystemConfig, options: &RunOptions) -> Result<Option<SubmissionHandle>> {
    let config = match Config::from_system(system, &options.study) {
        Ok(config) => config,
        Err(e @ ConfigError::StudyNotFound(_)) => {
            error!("Study {} not defined", options.study);
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };
    info!("Study {} ({})", config.study(), config.get_study_base().display());

    let nii_dir = config.get_path("nii")?;
    let subjects_dir = config.get_path("freesurfer")?;
    let work_dir = config
        .get_path("work")
        .unwrap_or_else(|_| config.get_study_base().join(DEFAULT_WORK_DIR));

    // recon-all fails if the subjects dir doesn't exist
    std::fs::create_dir_all(&subjects_dir).with_context(|| {
        format!("Failed to create output folder: {}", subjects_dir.display())
    })?;

    let common_tags = config.get_common_scan_tags();
    info!("Scan types common to all sites: {}", common_tags.join(", "));
    let capabilities = pipeline::capabilities(&common_tags);

    let parameters = ParameterResolver::new(Arc::new(config.system().clone()));
    let recon_options = ReconAllOptions::for_study(&parameters, config.study());
    info!(
        "recon-all version {} with {} core(s)",
        recon_options.version, recon_options.cores
    );

    let graph = pipeline::build_pipeline(&capabilities, &recon_options).with_context(|| {
        format!("Cannot build pipeline for study {}", config.study())
    })?;

    let locator = FileLocator::new(
        pipeline::file_templates(&capabilities),
        Arc::new(config.clone()),
    );
    let assembler = SubjectAssembler::new(
        graph,
        locator,
        parameters,
        recon_options,
        nii_dir.clone(),
        subjects_dir,
    );

    let subjects = worklist::build_worklist(&nii_dir, &options.subjects)
        .with_context(|| format!("Cannot list subjects in {}", nii_dir.display()))?;
    info!("{} subject(s) in worklist", subjects.len());

    let assembly = assembler.assemble_all(&subjects);

    if options.dry_run {
        for realized in &assembly.realized {
            for stage in &realized.stages {
                info!(
                    "[dry run] {} {}: {} (after: {})",
                    realized.subject,
                    stage.name,
                    stage.command.join(" "),
                    stage.predecessors.join(", ")
                );
            }
        }
        return Ok(None);
    }

    if assembly.realized.is_empty() {
        info!("Nothing to submit");
        return Ok(None);
    }

    let template = match &options.job_template {
        Some(path) => ResourceTemplate::load(path)?,
        None => ResourceTemplate::default(),
    };
    let backend_options = BackendOptions {
        work_dir: work_dir.clone(),
        scheduler_program: options.scheduler_program.clone(),
        template,
    };

    let records = work_dir.join("submissions");
    let handle = match backend::submit(assembly.realized, options.backend, backend_options).await
    {
        Ok(handle) => handle,
        Err(SubmissionError::Partial { handle, source }) => {
            // Jobs already queued stay queued; keep their ids
            let record = handle.save(&records)?;
            error!(
                "Submission {} incomplete, {} queued job(s) recorded in {}",
                handle.id,
                handle.jobs.len(),
                record.display()
            );
            return Err(anyhow::Error::new(SubmissionError::Partial { handle, source })
                .context("Submission failed"));
        }
        Err(e) => return Err(anyhow::Error::new(e).context("Submission failed")),
    };
    let record = handle.save(&records)?;
    info!("Submission {} recorded in {}", handle.id, record.display());

    Ok(Some(handle))
}
