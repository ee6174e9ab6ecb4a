//! Configuration loading and study/site queries
//!
//! One TOML file describes every project: where its data lives, which scan
//! tags each site exports (with expected file counts), and per-project
//! pipeline settings. The file is read once; everything after that is a
//! read-only query.
//!
//! Config file resolution priority:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`RECONFLOW_CONFIG`)
//! 3. User config directory (`~/.config/reconflow/config.toml` on Linux)
//! 4. System-wide `/etc/reconflow/config.toml`

use crate::{Error, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "RECONFLOW_CONFIG";

/// Acquisition metadata for one scan tag at one site
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TagInfo {
    /// Expected number of files for this tag. `None` means no count policy.
    #[serde(default, alias = "Count")]
    pub count: Option<usize>,

    /// Any other acquisition metadata (pattern, series description, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

/// Per-site table mapping scan tag to its acquisition metadata
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct ExportInfo {
    tags: BTreeMap<String, TagInfo>,
}

impl ExportInfo {
    pub fn get_tag_info(&self, tag: &str) -> Option<&TagInfo> {
        self.tags.get(tag)
    }

    /// Expected file count for `tag`, if the site defines one
    pub fn expected_count(&self, tag: &str) -> Option<usize> {
        self.get_tag_info(tag).and_then(|info| info.count)
    }

    /// Tags exported by this site, in lexicographic order
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.tags.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SiteConfig {
    #[serde(default, alias = "ExportInfo")]
    pub export_info: ExportInfo,
}

/// One project (study) entry
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    /// Root folder of the study; relative `paths` entries are joined to it
    pub study_base: PathBuf,

    /// Other study codes (as they appear in subject identifiers) for this project
    #[serde(default)]
    pub aliases: Vec<String>,

    /// Per-project path overrides
    #[serde(default)]
    pub paths: BTreeMap<String, PathBuf>,

    #[serde(default)]
    pub sites: BTreeMap<String, SiteConfig>,

    /// Free-form pipeline settings (e.g. `[settings.freesurfer]`)
    #[serde(default)]
    pub settings: toml::Table,
}

/// Whole config file, covering every project
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemConfig {
    /// Host (optionally `host:port`) receiving shipped log lines
    #[serde(default)]
    pub log_server: Option<String>,

    /// Default path layout shared by all projects
    #[serde(default)]
    pub paths: BTreeMap<String, PathBuf>,

    /// Settings applying to every project unless the project overrides them
    #[serde(default)]
    pub settings: toml::Table,

    #[serde(default)]
    pub projects: BTreeMap<String, ProjectConfig>,
}

impl SystemConfig {
    /// Read and parse a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Cannot read config file {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn log_server(&self) -> Option<&str> {
        self.log_server.as_deref()
    }

    /// Map a study code (project name or one of its aliases) to the project name
    pub fn map_alias_to_project(&self, code: &str) -> Result<&str> {
        if let Some((name, _)) = self.projects.get_key_value(code) {
            return Ok(name.as_str());
        }
        self.projects
            .iter()
            .find(|(_, project)| project.aliases.iter().any(|alias| alias == code))
            .map(|(name, _)| name.as_str())
            .ok_or_else(|| Error::StudyNotFound(code.to_string()))
    }

    /// Project entry for a study code (name or alias)
    pub fn project(&self, code: &str) -> Result<&ProjectConfig> {
        let name = self.map_alias_to_project(code)?;
        self.projects
            .get(name)
            .ok_or_else(|| Error::StudyNotFound(code.to_string()))
    }

    /// Scan tags exported by every site of a study, sorted
    ///
    /// A study with no sites yields an empty list.
    pub fn common_scan_tags(&self, study: &str) -> Result<Vec<String>> {
        let project = self.project(study)?;
        Ok(intersect_site_tags(project.sites.values()))
    }
}

fn intersect_site_tags<'a>(sites: impl Iterator<Item = &'a SiteConfig>) -> Vec<String> {
    let mut common: Option<BTreeSet<&str>> = None;
    for site in sites {
        let tags: BTreeSet<&str> = site.export_info.tags().collect();
        common = Some(match common {
            Some(acc) => acc.intersection(&tags).copied().collect(),
            None => tags,
        });
    }
    common
        .unwrap_or_default()
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Configuration with a current study selected
#[derive(Debug, Clone)]
pub struct Config {
    system: SystemConfig,
    study: String,
    project: ProjectConfig,
}

impl Config {
    /// Load the config file and select `study`
    ///
    /// Fails with [`Error::StudyNotFound`] when the study is not defined.
    pub fn load(path: &Path, study: &str) -> Result<Self> {
        let system = SystemConfig::load(path)?;
        Self::from_system(system, study)
    }

    pub fn from_system(system: SystemConfig, study: &str) -> Result<Self> {
        let project = system.project(study)?.clone();
        let study = system.map_alias_to_project(study)?.to_string();
        Ok(Self {
            system,
            study,
            project,
        })
    }

    /// Switch the current study (name or alias)
    pub fn set_study(&mut self, study: &str) -> Result<()> {
        self.project = self.system.project(study)?.clone();
        self.study = self.system.map_alias_to_project(study)?.to_string();
        debug!("Current study set to {}", self.study);
        Ok(())
    }

    /// Canonical name of the current study
    pub fn study(&self) -> &str {
        &self.study
    }

    pub fn system(&self) -> &SystemConfig {
        &self.system
    }

    pub fn get_study_base(&self) -> &Path {
        &self.project.study_base
    }

    /// Site codes of the current study, sorted
    pub fn sites(&self) -> Vec<&str> {
        self.project.sites.keys().map(String::as_str).collect()
    }

    /// Export table for `site` within `study` (name or alias)
    pub fn get_export_info(&self, site: &str, study: &str) -> Result<&ExportInfo> {
        let project = self.system.project(study)?;
        project
            .sites
            .get(site)
            .map(|s| &s.export_info)
            .ok_or_else(|| Error::NotFound(format!("site {} in study {}", site, study)))
    }

    /// Scan tags present at every site of the current study, sorted
    pub fn get_common_scan_tags(&self) -> Vec<String> {
        intersect_site_tags(self.project.sites.values())
    }

    /// Setting value: current project first, then the file-wide settings
    pub fn get_key(&self, key: &str) -> Option<&toml::Value> {
        self.project
            .settings
            .get(key)
            .or_else(|| self.system.settings.get(key))
    }

    /// Named path for the current study
    ///
    /// Project overrides win over the shared layout; relative paths are
    /// joined to the study base.
    pub fn get_path(&self, name: &str) -> Result<PathBuf> {
        let path = self
            .project
            .paths
            .get(name)
            .or_else(|| self.system.paths.get(name))
            .ok_or_else(|| Error::Config(format!("paths:{} not defined in config", name)))?;
        if path.is_absolute() {
            Ok(path.clone())
        } else {
            Ok(self.project.study_base.join(path))
        }
    }
}

/// Locate the config file following the documented priority order
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Result<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Ok(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Ok(PathBuf::from(path));
        }
    }

    // Priority 3: User config directory
    if let Some(path) = dirs::config_dir().map(|d| d.join("reconflow").join("config.toml")) {
        if path.exists() {
            return Ok(path);
        }
    }

    // Priority 4: System-wide config
    let system_config = PathBuf::from("/etc/reconflow/config.toml");
    if system_config.exists() {
        return Ok(system_config);
    }

    Err(Error::Config(format!(
        "No config file found (use --config or set {})",
        CONFIG_ENV_VAR
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const SAMPLE: &str = r#"
        log_server = "10.0.0.5"

        [paths]
        nii = "data/nii"
        freesurfer = "pipelines/freesurfer"

        [settings.freesurfer]
        version = 6

        [projects.SPINS]
        study_base = "/archive/data/SPINS"
        aliases = ["SPN01"]

        [projects.SPINS.paths]
        freesurfer = "/scratch/freesurfer/SPINS"

        [projects.SPINS.sites.CMH.export_info]
        T1 = { count = 1 }
        T2 = { Count = 1, pattern = "T2w" }
        RST = {}

        [projects.SPINS.sites.MRC.export_info]
        T1 = { count = 2 }
        RST = { count = 1 }

        [projects.SPINS.settings.freesurfer]
        nu_iter = { CMH = 4, DEFAULT = 8 }

        [projects.EMPTY]
        study_base = "/archive/data/EMPTY"
    "#;

    fn sample() -> Config {
        Config::from_system(SystemConfig::parse(SAMPLE).unwrap(), "SPINS").unwrap()
    }

    #[test]
    fn test_load_unknown_study_fails() {
        let system = SystemConfig::parse(SAMPLE).unwrap();
        let err = Config::from_system(system, "NOPE").unwrap_err();
        assert!(matches!(err, Error::StudyNotFound(s) if s == "NOPE"));
    }

    #[test]
    fn test_alias_maps_to_project() {
        let system = SystemConfig::parse(SAMPLE).unwrap();
        assert_eq!(system.map_alias_to_project("SPN01").unwrap(), "SPINS");
        assert_eq!(system.map_alias_to_project("SPINS").unwrap(), "SPINS");

        let config = Config::from_system(system, "SPN01").unwrap();
        assert_eq!(config.study(), "SPINS");
    }

    #[test]
    fn test_export_info_counts() {
        let config = sample();
        let cmh = config.get_export_info("CMH", "SPN01").unwrap();
        assert_eq!(cmh.expected_count("T1"), Some(1));
        assert_eq!(cmh.expected_count("T2"), Some(1));
        assert_eq!(cmh.expected_count("RST"), None);
        assert_eq!(cmh.expected_count("DTI60-1000"), None);
        assert_eq!(
            cmh.get_tag_info("T2").unwrap().extra.get("pattern"),
            Some(&toml::Value::String("T2w".to_string()))
        );

        assert!(matches!(
            config.get_export_info("XYZ", "SPINS"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_common_scan_tags_is_intersection() {
        let config = sample();
        assert_eq!(config.get_common_scan_tags(), vec!["RST", "T1"]);
    }

    #[test]
    fn test_common_scan_tags_zero_sites_is_empty() {
        let system = SystemConfig::parse(SAMPLE).unwrap();
        assert!(system.common_scan_tags("EMPTY").unwrap().is_empty());
    }

    #[test]
    fn test_get_path_relative_and_override() {
        let config = sample();
        assert_eq!(
            config.get_path("nii").unwrap(),
            PathBuf::from("/archive/data/SPINS/data/nii")
        );
        assert_eq!(
            config.get_path("freesurfer").unwrap(),
            PathBuf::from("/scratch/freesurfer/SPINS")
        );
        assert!(matches!(config.get_path("qc"), Err(Error::Config(_))));
    }

    #[test]
    fn test_get_key_falls_back_to_shared_settings() {
        let mut config = sample();
        let fs = config.get_key("freesurfer").unwrap();
        assert!(fs.get("nu_iter").is_some());

        config.set_study("EMPTY").unwrap();
        let fs = config.get_key("freesurfer").unwrap();
        assert_eq!(fs.get("version").and_then(|v| v.as_integer()), Some(6));
        assert!(config.get_key("missing").is_none());
    }

    #[test]
    fn test_log_server() {
        assert_eq!(sample().system().log_server(), Some("10.0.0.5"));
        assert_eq!(SystemConfig::parse("").unwrap().log_server(), None);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = Config::load(&path, "SPINS").unwrap();
        assert_eq!(config.sites(), vec!["CMH", "MRC"]);
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("nope.toml"), "SPINS").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    #[serial]
    fn test_resolve_config_path_cli_wins() {
        std::env::set_var(CONFIG_ENV_VAR, "/from/env.toml");
        let path = resolve_config_path(Some(Path::new("/from/cli.toml"))).unwrap();
        assert_eq!(path, PathBuf::from("/from/cli.toml"));
        std::env::remove_var(CONFIG_ENV_VAR);
    }

    #[test]
    #[serial]
    fn test_resolve_config_path_env_fallback() {
        std::env::set_var(CONFIG_ENV_VAR, "/from/env.toml");
        let path = resolve_config_path(None).unwrap();
        assert_eq!(path, PathBuf::from("/from/env.toml"));
        std::env::remove_var(CONFIG_ENV_VAR);
    }
}
