//! Subject identifier parsing
//!
//! Identifiers follow `STUDY_SITE_SUBJECT_SESSION` (e.g. `SPN01_CMH_0001_01`).
//! Phantom (calibration/QA) scans use `STUDY_SITE_PHA_<CODE>`; their subject
//! number is `PHA_<CODE>` and they carry no session.

use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Subject number prefix marking a phantom
pub const PHANTOM_PREFIX: &str = "PHA";

const DELIMITER: char = '_';

/// Structured subject identifier, used as a lookup key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubjectIdentity {
    pub study: String,
    pub site: String,
    pub subject_number: String,
    /// Empty for phantoms
    pub session: String,
}

impl SubjectIdentity {
    /// Parse an identifier, failing closed on any deviation from the grammar
    pub fn parse(raw_id: &str) -> Result<Self> {
        let malformed = || Error::MalformedIdentifier(raw_id.to_string());
        let tokens: Vec<&str> = raw_id.split(DELIMITER).collect();
        let valid = |t: &&str| !t.is_empty() && t.chars().all(|c| c.is_ascii_alphanumeric());
        let [study, site, third, fourth] = tokens.as_slice() else {
            return Err(malformed());
        };
        if !tokens.iter().all(valid) {
            return Err(malformed());
        }
        let (study, site) = (study.to_string(), site.to_string());

        if *third == PHANTOM_PREFIX {
            return Ok(Self {
                study,
                site,
                subject_number: format!("{}_{}", PHANTOM_PREFIX, fourth),
                session: String::new(),
            });
        }

        if !fourth.chars().all(|c| c.is_ascii_digit()) {
            return Err(malformed());
        }

        Ok(Self {
            study,
            site,
            subject_number: third.to_string(),
            session: fourth.to_string(),
        })
    }

    /// Calibration/QA subjects, excluded from batch processing
    pub fn is_phantom(&self) -> bool {
        self.subject_number
            .strip_prefix(PHANTOM_PREFIX)
            .is_some_and(|rest| rest.starts_with('_'))
    }
}

/// Convenience predicate on a raw identifier; unparseable ids are not phantoms
pub fn is_phantom(raw_id: &str) -> bool {
    SubjectIdentity::parse(raw_id)
        .map(|ident| ident.is_phantom())
        .unwrap_or(false)
}

impl fmt::Display for SubjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_phantom() {
            write!(f, "{}_{}_{}", self.study, self.site, self.subject_number)
        } else {
            write!(
                f,
                "{}_{}_{}_{}",
                self.study, self.site, self.subject_number, self.session
            )
        }
    }
}

impl FromStr for SubjectIdentity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
