//! recon-all pipeline definition and per-subject assembly
//!
//! Stage graph, built once per run:
//!
//! ```text
//! subject ──────┬───────────────► recon_all ──► enigma_summaries
//! select_files ─┤                     ▲
//! parameters ───┴─────────────────────┘
//! ```
//!
//! `subject`, `select_files` and `parameters` are source stages bound per
//! subject from the worklist, the [`FileLocator`] and the
//! [`ParameterResolver`]. The optional T2 edge into `recon_all` exists only
//! when every site of the study exports T2 scans.

use crate::graph::{
    Arg, Bindings, Capabilities, GraphValidationError, InstantiationError, PipelineGraph,
    RealizedGraph, ResourceHints, StageSpec, Value,
};
use crate::locator::{FileLocator, FileSet, LocateError};
use reconflow_common::params::{NU_ITERATIONS, RECON_ALL_CORES, RECON_ALL_VERSION};
use reconflow_common::{ParameterResolver, SubjectIdentity};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, info_span, warn};

/// Scan tag every subject needs
pub const MANDATORY_MODALITY: &str = "T1";

/// Optional secondary modality used for pial surface refinement
pub const SECONDARY_MODALITY: &str = "T2";

pub const FLAIR: &str = "FLAIR";

/// Stage whose named outputs mark a subject as already processed
pub const COMPLETION_STAGE: &str = "recon_all";

pub const RECON_ALL_PROGRAM: &str = "recon-all";
pub const ENIGMA_PROGRAM: &str = "Enigma_Summaries_nipype_launcher.sh";

pub const THICKNESS_FILE: &str = "CorticalMeasuresENIGMA_ThickAvg.csv";
pub const SURFACE_FILE: &str = "CorticalMeasuresENIGMA_SurfAvg.csv";
pub const SUBCORTICAL_FILE: &str = "LandRvolumes.csv";

/// Failure to assemble one subject; the subject is excluded, the run goes on
#[derive(Debug, Error)]
pub enum SubjectError {
    #[error(transparent)]
    Locate(#[from] LocateError),

    #[error("No {tag} files found")]
    MissingMandatoryFiles { tag: String },

    #[error(transparent)]
    Instantiation(#[from] InstantiationError),
}

/// Run-wide recon-all settings
///
/// Version and core count shape the job layout, so they are fixed for the
/// whole submission rather than resolved per subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconAllOptions {
    /// Major version of the installed recon-all
    pub version: i64,
    pub cores: u32,
}

impl Default for ReconAllOptions {
    fn default() -> Self {
        Self {
            version: 6,
            cores: 24,
        }
    }
}

impl ReconAllOptions {
    pub fn for_study(parameters: &ParameterResolver, study: &str) -> Self {
        let defaults = Self::default();
        let version = parameters.resolve_study_integer(&RECON_ALL_VERSION, study);
        let cores = u32::try_from(parameters.resolve_study_integer(&RECON_ALL_CORES, study))
            .ok()
            .filter(|c| *c > 0)
            .unwrap_or(defaults.cores);
        Self { version, cores }
    }

    /// Releases before 6 take `-nuiterations` and reject `-parallel`
    pub fn uses_nu_iterations(&self) -> bool {
        self.version < 6
    }
}

/// Capabilities for a run, from the study's common scan tags
pub fn capabilities(common_tags: &[String]) -> Capabilities {
    if common_tags.iter().any(|t| t == FLAIR) {
        debug!("FLAIR processing not yet implemented");
    }
    Capabilities::from_tags(common_tags.iter().cloned())
}

/// File templates, relative to the nii directory, keyed by tag
pub fn file_templates(capabilities: &Capabilities) -> BTreeMap<String, String> {
    let template = |tag: &str| format!("{{dm_subject_id}}/{{dm_subject_id}}_??_{}_??*.nii.gz", tag);
    let mut templates = BTreeMap::new();
    templates.insert(MANDATORY_MODALITY.to_string(), template(MANDATORY_MODALITY));
    if capabilities.contains(SECONDARY_MODALITY) {
        templates.insert(SECONDARY_MODALITY.to_string(), template(SECONDARY_MODALITY));
    }
    templates
}

/// Stage declarations for the recon-all pipeline
pub fn recon_all_stages(capabilities: &Capabilities, options: &ReconAllOptions) -> Vec<StageSpec> {
    let mut select_files = StageSpec::source("select_files").bound_output(MANDATORY_MODALITY);
    if capabilities.contains(SECONDARY_MODALITY) {
        select_files = select_files.bound_output(SECONDARY_MODALITY);
    }

    let recon_all = StageSpec::command(COMPLETION_STAGE, RECON_ALL_PROGRAM)
        .requires(MANDATORY_MODALITY)
        .input("subject_id", "subject", "subject_id")
        .input("subjects_dir", "subject", "subjects_dir")
        .input(MANDATORY_MODALITY, "select_files", MANDATORY_MODALITY)
        .optional_input(SECONDARY_MODALITY, "select_files", SECONDARY_MODALITY, SECONDARY_MODALITY)
        .input("recon_flags", "parameters", "recon_flags")
        .arg(Arg::Literal("-all".into()))
        .arg(Arg::Flagged {
            flag: "-subjid".into(),
            input: "subject_id".into(),
        })
        .arg(Arg::Flagged {
            flag: "-sd".into(),
            input: "subjects_dir".into(),
        })
        .arg(Arg::Flagged {
            flag: "-i".into(),
            input: MANDATORY_MODALITY.into(),
        })
        .arg(Arg::Flagged {
            flag: "-T2".into(),
            input: SECONDARY_MODALITY.into(),
        })
        .arg(Arg::IfPresent {
            input: SECONDARY_MODALITY.into(),
            arg: "-T2pial".into(),
        })
        .arg(Arg::Input("recon_flags".into()))
        .passthrough_output("subject_id", "subject_id")
        .passthrough_output("subjects_dir", "subjects_dir")
        .file_output("done_file", "subjects_dir", "{subject_id}/scripts/recon-all.done")
        .hints(ResourceHints {
            cores: Some(options.cores),
        });

    // Summaries are written next to the subjects
    let enigma = StageSpec::command("enigma_summaries", ENIGMA_PROGRAM)
        .input("subjects_dir", COMPLETION_STAGE, "subjects_dir")
        .input("subject_id", COMPLETION_STAGE, "subject_id")
        .input("output_path", COMPLETION_STAGE, "subjects_dir")
        .arg(Arg::Input("subjects_dir".into()))
        .arg(Arg::Input("subject_id".into()))
        .arg(Arg::Input("output_path".into()))
        .file_output("thickness_file", "output_path", THICKNESS_FILE)
        .file_output("surface_file", "output_path", SURFACE_FILE)
        .file_output("subcortical_file", "output_path", SUBCORTICAL_FILE);

    vec![
        StageSpec::source("subject")
            .bound_output("subject_id")
            .bound_output("subjects_dir"),
        select_files,
        StageSpec::source("parameters").bound_output("recon_flags"),
        recon_all,
        enigma,
    ]
}

/// Validate and freeze the recon-all graph for a run
///
/// Fails when the study lacks the mandatory modality at any site.
pub fn build_pipeline(
    capabilities: &Capabilities,
    options: &ReconAllOptions,
) -> Result<PipelineGraph, GraphValidationError> {
    PipelineGraph::build(recon_all_stages(capabilities, options), capabilities)
}

/// Outcome of assembling every subject in a worklist
#[derive(Debug, Default)]
pub struct Assembly {
    /// Ready for submission
    pub realized: Vec<RealizedGraph>,
    /// Failed assembly; excluded from submission
    pub excluded: Vec<(SubjectIdentity, SubjectError)>,
    /// Already processed
    pub skipped: Vec<SubjectIdentity>,
}

/// Binds per-subject files and parameters into the shared graph
pub struct SubjectAssembler {
    graph: PipelineGraph,
    locator: FileLocator,
    parameters: ParameterResolver,
    options: ReconAllOptions,
    nii_dir: PathBuf,
    subjects_dir: PathBuf,
}

impl SubjectAssembler {
    pub fn new(
        graph: PipelineGraph,
        locator: FileLocator,
        parameters: ParameterResolver,
        options: ReconAllOptions,
        nii_dir: PathBuf,
        subjects_dir: PathBuf,
    ) -> Self {
        Self {
            graph,
            locator,
            parameters,
            options,
            nii_dir,
            subjects_dir,
        }
    }

    pub fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    /// recon-all flags for one subject
    pub fn recon_flags(&self, identity: &SubjectIdentity) -> Vec<String> {
        if self.options.uses_nu_iterations() {
            let iterations = self.parameters.resolve_integer(&NU_ITERATIONS, identity);
            vec!["-nuiterations".to_string(), iterations.to_string()]
        } else {
            vec!["-parallel".to_string()]
        }
    }

    /// Locate files, resolve parameters and realize one subject's graph
    pub fn assemble(&self, identity: &SubjectIdentity) -> Result<RealizedGraph, SubjectError> {
        let subject_id = identity.to_string();
        let mut files = self.locator.locate(&subject_id, &self.nii_dir)?;

        let t1 = files.remove(MANDATORY_MODALITY).unwrap_or_default();
        if t1.is_empty() {
            return Err(SubjectError::MissingMandatoryFiles {
                tag: MANDATORY_MODALITY.to_string(),
            });
        }
        debug!("Found {} {} file(s)", t1.len(), MANDATORY_MODALITY);

        let mut bindings = Bindings::new();
        bindings
            .bind("subject", "subject_id", Value::Text(subject_id))
            .bind(
                "subject",
                "subjects_dir",
                Value::Path(self.subjects_dir.clone()),
            )
            .bind("select_files", MANDATORY_MODALITY, Value::Files(t1))
            .bind(
                "parameters",
                "recon_flags",
                Value::Args(self.recon_flags(identity)),
            );

        // recon-all takes a single T2 volume
        if let Some(mut t2) = files.remove(SECONDARY_MODALITY) {
            if t2.is_empty() {
                warn!("No {} files found, running without", SECONDARY_MODALITY);
            } else if let [first, _, ..] = t2.paths() {
                let first = first.clone();
                warn!(
                    "{} {} files found, using {}",
                    t2.len(),
                    SECONDARY_MODALITY,
                    first.display()
                );
                t2 = FileSet::from(first);
            }
            bindings.bind("select_files", SECONDARY_MODALITY, Value::Files(t2));
        }

        Ok(self.graph.instantiate(identity, &bindings)?)
    }

    /// Assemble every subject; failures exclude only the failing subject
    pub fn assemble_all(&self, subjects: &[SubjectIdentity]) -> Assembly {
        let mut assembly = Assembly::default();
        for identity in subjects {
            let span = info_span!("subject", id = %identity);
            let _guard = span.enter();

            match self.assemble(identity) {
                Ok(realized) => {
                    let complete = realized
                        .stage(COMPLETION_STAGE)
                        .is_some_and(|stage| stage.is_complete());
                    if complete {
                        info!("Already processed, skipping");
                        assembly.skipped.push(identity.clone());
                    } else {
                        assembly.realized.push(realized);
                    }
                }
                Err(e) => {
                    warn!("Excluding subject {}: {}", identity, e);
                    assembly.excluded.push((identity.clone(), e));
                }
            }
        }

        info!(
            "Assembled {} subject(s): {} excluded, {} already processed",
            assembly.realized.len(),
            assembly.excluded.len(),
            assembly.skipped.len()
        );
        assembly
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(tags: &[&str]) -> Capabilities {
        Capabilities::from_tags(tags.iter().copied())
    }

    #[test]
    fn test_templates_follow_capabilities() {
        let t1_only = file_templates(&caps(&["RST", "T1"]));
        assert_eq!(t1_only.len(), 1);
        assert_eq!(
            t1_only["T1"],
            "{dm_subject_id}/{dm_subject_id}_??_T1_??*.nii.gz"
        );

        let both = file_templates(&caps(&["T1", "T2"]));
        assert_eq!(
            both["T2"],
            "{dm_subject_id}/{dm_subject_id}_??_T2_??*.nii.gz"
        );
    }

    #[test]
    fn test_build_without_t1_fails() {
        let err = build_pipeline(&caps(&["T2"]), &ReconAllOptions::default()).unwrap_err();
        assert_eq!(
            err,
            GraphValidationError::MissingCapability {
                stage: COMPLETION_STAGE.into(),
                capability: MANDATORY_MODALITY.into(),
            }
        );
    }

    #[test]
    fn test_t2_edge_only_with_capability() {
        let options = ReconAllOptions::default();
        let graph = build_pipeline(&caps(&["T1"]), &options).unwrap();
        let recon = graph.stage(COMPLETION_STAGE).unwrap();
        assert!(!recon.inputs.contains_key(SECONDARY_MODALITY));

        let graph = build_pipeline(&caps(&["T1", "T2"]), &options).unwrap();
        let recon = graph.stage(COMPLETION_STAGE).unwrap();
        assert_eq!(recon.inputs[SECONDARY_MODALITY].producer, "select_files");
        assert_eq!(recon.resource_hints, ResourceHints { cores: Some(24) });
    }

    #[test]
    fn test_version_selects_flag_set() {
        assert!(!ReconAllOptions::default().uses_nu_iterations());
        assert!(ReconAllOptions { version: 5, cores: 1 }.uses_nu_iterations());
    }
}
