//! Site-aware pipeline parameters
//!
//! A parameter lives under a settings section of a project, e.g.
//!
//! ```toml
//! [projects.SPINS.settings.freesurfer]
//! nu_iter = { CMH = 4, DEFAULT = 8 }   # keyed by site
//! cores = 16                           # bare scalar, every site
//! ```
//!
//! Resolution for a subject, in order:
//! 1. Map the subject's study code to its project; unknown → fallback
//! 2. Look up the parameter in the project's settings, then in the
//!    file-wide `[settings]` table; absent from both → fallback
//! 3. Site-keyed table containing the subject's site → that value
//! 4. Site-keyed table containing `DEFAULT` → that value
//! 5. Bare scalar → that value
//!
//! Anything else (a table with neither key, an array, a nested table in a
//! value position) resolves to the parameter's hard-coded fallback, so the
//! pipeline stays runnable for studies and sites with no configuration.

use crate::config::SystemConfig;
use crate::scanid::SubjectIdentity;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Key naming the site-independent entry of a site-keyed table
pub const DEFAULT_KEY: &str = "DEFAULT";

/// Resolved scalar parameter value
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    Integer(i64),
    Float(f64),
    Text(String),
    Bool(bool),
}

impl ParameterValue {
    /// Convert a TOML scalar; tables, arrays and datetimes are not parameter values
    fn from_toml(value: &toml::Value) -> Option<Self> {
        match value {
            toml::Value::Integer(i) => Some(Self::Integer(*i)),
            toml::Value::Float(f) => Some(Self::Float(*f)),
            toml::Value::String(s) => Some(Self::Text(s.clone())),
            toml::Value::Boolean(b) => Some(Self::Bool(*b)),
            _ => None,
        }
    }

    /// Integer view; numeric strings are accepted
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(s) => f.write_str(s),
            Self::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// Typed descriptor of a tunable parameter
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    /// Settings section holding the parameter (e.g. `freesurfer`)
    pub section: &'static str,
    pub key: &'static str,
    /// Returned whenever no configuration applies
    pub fallback: ParameterValue,
}

impl Parameter {
    pub const fn integer(section: &'static str, key: &'static str, fallback: i64) -> Self {
        Self {
            section,
            key,
            fallback: ParameterValue::Integer(fallback),
        }
    }
}

/// N3 intensity-correction iterations passed to recon-all 5.x
pub const NU_ITERATIONS: Parameter = Parameter::integer("freesurfer", "nu_iter", 4);

/// Cores requested for a recon-all job
pub const RECON_ALL_CORES: Parameter = Parameter::integer("freesurfer", "cores", 24);

/// Major version of the installed recon-all (selects the flag set)
pub const RECON_ALL_VERSION: Parameter = Parameter::integer("freesurfer", "version", 6);

fn find_setting<'a>(settings: &'a toml::Table, parameter: &Parameter) -> Option<&'a toml::Value> {
    settings
        .get(parameter.section)
        .and_then(|section| section.get(parameter.key))
}

/// Resolves parameters per subject against the whole config file
///
/// Holds the file-wide config rather than a single study because a
/// subject's study code may be an alias of another project.
#[derive(Debug, Clone)]
pub struct ParameterResolver {
    config: Arc<SystemConfig>,
}

impl ParameterResolver {
    pub fn new(config: Arc<SystemConfig>) -> Self {
        Self { config }
    }

    /// Raw setting for `parameter`: the project's own settings first, then
    /// the file-wide ones
    fn lookup(&self, parameter: &Parameter, study: &str) -> Option<&toml::Value> {
        let project = self.config.project(study).ok()?;
        find_setting(&project.settings, parameter)
            .or_else(|| find_setting(&self.config.settings, parameter))
    }

    /// Resolve `parameter` for one subject; never fails
    pub fn resolve(&self, parameter: &Parameter, identity: &SubjectIdentity) -> ParameterValue {
        if self.config.project(&identity.study).is_err() {
            debug!(
                "Study {} not defined in config, {}.{} = {} (fallback)",
                identity.study, parameter.section, parameter.key, parameter.fallback
            );
            return parameter.fallback.clone();
        }

        let Some(setting) = self.lookup(parameter, &identity.study) else {
            debug!(
                "Setting {}.{} not found for study {}, using fallback {}",
                parameter.section, parameter.key, identity.study, parameter.fallback
            );
            return parameter.fallback.clone();
        };

        let chosen = match setting {
            toml::Value::Table(by_site) => by_site
                .get(identity.site.as_str())
                .or_else(|| by_site.get(DEFAULT_KEY)),
            scalar => Some(scalar),
        };

        match chosen.and_then(ParameterValue::from_toml) {
            Some(value) => value,
            None => {
                debug!(
                    "Setting {}.{} has no usable entry for site {}, using fallback {}",
                    parameter.section, parameter.key, identity.site, parameter.fallback
                );
                parameter.fallback.clone()
            }
        }
    }

    /// Resolve a run-wide parameter for a study, ignoring per-site entries
    ///
    /// Used for values that cannot differ between subjects of one run, such
    /// as the recon-all version. A site-keyed table contributes only its
    /// `DEFAULT` entry.
    pub fn resolve_for_study(&self, parameter: &Parameter, study: &str) -> ParameterValue {
        let chosen = match self.lookup(parameter, study) {
            Some(toml::Value::Table(by_site)) => by_site.get(DEFAULT_KEY),
            other => other,
        };
        chosen
            .and_then(ParameterValue::from_toml)
            .unwrap_or_else(|| parameter.fallback.clone())
    }

    pub fn resolve_study_integer(&self, parameter: &Parameter, study: &str) -> i64 {
        let fallback = parameter.fallback.as_integer().unwrap_or_default();
        self.resolve_for_study(parameter, study)
            .as_integer()
            .unwrap_or(fallback)
    }

    /// Resolve an integer parameter, falling back when the value is not an integer
    pub fn resolve_integer(&self, parameter: &Parameter, identity: &SubjectIdentity) -> i64 {
        let fallback = parameter.fallback.as_integer().unwrap_or_default();
        self.resolve(parameter, identity)
            .as_integer()
            .unwrap_or(fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [settings.freesurfer]
        version = 5
        nu_iter = { siteA = 10, DEFAULT = 2 }

        [projects.SPINS]
        study_base = "/archive/data/SPINS"
        aliases = ["SPN01"]
        [projects.SPINS.settings.freesurfer]
        nu_iter = { siteA = 8, DEFAULT = 4 }
        cores = { CMH = "12" }

        [projects.BARE]
        study_base = "/archive/data/BARE"
        [projects.BARE.settings.freesurfer]
        nu_iter = 6
        cores = [1, 2]

        [projects.NESTED]
        study_base = "/archive/data/NESTED"
        [projects.NESTED.settings.freesurfer]
        nu_iter = { siteA = { deep = 1 } }

        [projects.EMPTY]
        study_base = "/archive/data/EMPTY"

        [projects.OWNVERSION]
        study_base = "/archive/data/OWNVERSION"
        [projects.OWNVERSION.settings.freesurfer]
        version = 6
    "#;

    fn resolver() -> ParameterResolver {
        ParameterResolver::new(Arc::new(SystemConfig::parse(SAMPLE).unwrap()))
    }

    fn ident(raw: &str) -> SubjectIdentity {
        SubjectIdentity::parse(raw).unwrap()
    }

    #[test]
    fn test_site_key_wins_over_default() {
        let r = resolver();
        assert_eq!(
            r.resolve(&NU_ITERATIONS, &ident("SPN01_siteA_0001_01")),
            ParameterValue::Integer(8)
        );
        assert_eq!(
            r.resolve(&NU_ITERATIONS, &ident("SPN01_siteB_0001_01")),
            ParameterValue::Integer(4)
        );
    }

    #[test]
    fn test_bare_scalar_applies_to_every_site() {
        let r = resolver();
        for raw in ["BARE_siteA_0001_01", "BARE_CMH_0002_01"] {
            assert_eq!(r.resolve(&NU_ITERATIONS, &ident(raw)), ParameterValue::Integer(6));
        }
    }

    #[test]
    fn test_unconfigured_study_returns_fallback() {
        let r = resolver();
        assert_eq!(
            r.resolve(&NU_ITERATIONS, &ident("UNKNOWN_CMH_0001_01")),
            ParameterValue::Integer(4)
        );
        assert_eq!(r.resolve_study_integer(&RECON_ALL_VERSION, "UNKNOWN"), 6);
        for raw in ["EMPTY_CMH_0001_01", "UNKNOWN_CMH_0001_01"] {
            assert_eq!(r.resolve_integer(&RECON_ALL_CORES, &ident(raw)), 24);
        }
    }

    #[test]
    fn test_file_wide_settings_apply_without_project_override() {
        let r = resolver();
        // Project without settings takes the file-wide values
        assert_eq!(r.resolve_study_integer(&RECON_ALL_VERSION, "EMPTY"), 5);
        assert_eq!(r.resolve_integer(&NU_ITERATIONS, &ident("EMPTY_siteA_0001_01")), 10);
        assert_eq!(r.resolve_integer(&NU_ITERATIONS, &ident("EMPTY_CMH_0001_01")), 2);
        // Project override wins over the file-wide value
        assert_eq!(r.resolve_study_integer(&RECON_ALL_VERSION, "OWNVERSION"), 6);
        assert_eq!(r.resolve_integer(&NU_ITERATIONS, &ident("SPN01_siteA_0001_01")), 8);
        // Absent from both: hard-coded fallback
        assert_eq!(r.resolve_integer(&RECON_ALL_CORES, &ident("OWNVERSION_CMH_0001_01")), 24);
    }

    #[test]
    fn test_malformed_shapes_take_fallback() {
        let r = resolver();
        // Table without the site or DEFAULT
        assert_eq!(r.resolve_integer(&RECON_ALL_CORES, &ident("SPN01_MRC_0001_01")), 24);
        // Array in a value position
        assert_eq!(r.resolve_integer(&RECON_ALL_CORES, &ident("BARE_CMH_0001_01")), 24);
        // Nested table under the site key
        assert_eq!(
            r.resolve(&NU_ITERATIONS, &ident("NESTED_siteA_0001_01")),
            ParameterValue::Integer(4)
        );
    }

    #[test]
    fn test_numeric_text_resolves_as_integer() {
        let r = resolver();
        assert_eq!(r.resolve_integer(&RECON_ALL_CORES, &ident("SPN01_CMH_0001_01")), 12);
    }

    #[test]
    fn test_study_wide_resolution_uses_default_entry() {
        let r = resolver();
        assert_eq!(r.resolve_study_integer(&NU_ITERATIONS, "SPN01"), 4);
        assert_eq!(r.resolve_study_integer(&NU_ITERATIONS, "BARE"), 6);
        // No DEFAULT entry
        assert_eq!(r.resolve_study_integer(&RECON_ALL_CORES, "SPINS"), 24);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let r = resolver();
        let subject = ident("EMPTY_CMH_0001_01");
        let first = r.resolve(&NU_ITERATIONS, &subject);
        for _ in 0..10 {
            assert_eq!(r.resolve(&NU_ITERATIONS, &subject), first);
        }
    }
}
