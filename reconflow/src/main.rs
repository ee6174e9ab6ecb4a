//! reconflow - recon-all pipeline orchestrator
//!
//! Finds every subject of a study, checks their scans against the site
//! export tables and submits one recon-all + Enigma summaries graph per
//! subject to the chosen backend.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use reconflow::backend::DEFAULT_SCHEDULER_PROGRAM;
use reconflow::logging::{self, RemoteLogging};
use reconflow::{BackendKind, RunOptions};
use reconflow_common::config::resolve_config_path;
use reconflow_common::SystemConfig;
use tracing::{info, warn};

/// Command-line arguments for reconflow
#[derive(Parser, Debug)]
#[command(name = "reconflow")]
#[command(about = "Run the FreeSurfer recon-all pipeline on a study")]
#[command(version)]
struct Args {
    /// Study name (or alias) defined in the config file
    study: String,

    /// Config file (default: $RECONFLOW_CONFIG, then the user and system config dirs)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(long)]
    debug: bool,

    /// Also send log lines to the configured log server
    #[arg(long)]
    log_to_server: bool,

    /// Where stages run
    #[arg(short, long, value_enum, default_value_t = BackendKind::Local)]
    backend: BackendKind,

    /// Header for cluster job scripts (e.g. environment module loads)
    #[arg(long)]
    job_template: Option<PathBuf>,

    /// Scheduler submit program
    #[arg(long, default_value = DEFAULT_SCHEDULER_PROGRAM, env = "RECONFLOW_QSUB")]
    scheduler: String,

    /// Only process these subjects (repeatable)
    #[arg(short, long = "subject", value_name = "ID")]
    subjects: Vec<String>,

    /// Assemble and log every subject's commands without submitting
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = resolve_config_path(args.config.as_deref())?;
    let system = SystemConfig::load(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;

    let log_server = system.log_server().filter(|_| args.log_to_server);
    match logging::init(args.debug, log_server).context("Failed to initialize logging")? {
        RemoteLogging::Disabled if args.log_to_server => {
            warn!("--log-to-server given but no log_server configured")
        }
        RemoteLogging::Disabled => {}
        RemoteLogging::Connected(address) => info!("Shipping logs to {}", address),
        RemoteLogging::Failed { address, error } => {
            warn!("Cannot reach log server {}: {}", address, error)
        }
    }

    info!("Starting reconflow {}", reconflow::build_info());
    info!("Config: {}", config_path.display());

    let options = RunOptions {
        study: args.study,
        backend: args.backend,
        job_template: args.job_template,
        scheduler_program: args.scheduler,
        subjects: args.subjects,
        dry_run: args.dry_run,
    };

    match reconflow::run(system, &options).await? {
        Some(handle) => info!(
            "Submission {} on {}: {} job(s)",
            handle.id,
            handle.backend,
            handle.jobs.len()
        ),
        None => info!("No submission made"),
    }
    Ok(())
}
