//! Subject worklist
//!
//! Subjects are the directories under the study's nii folder whose names
//! parse as identifiers. Phantoms never enter the worklist.

use reconflow_common::{Result, SubjectIdentity};
use std::path::Path;
use tracing::{debug, warn};

/// Non-phantom subjects found under `nii_dir`, sorted
pub fn discover_subjects(nii_dir: &Path) -> Result<Vec<SubjectIdentity>> {
    let mut subjects = Vec::new();
    for entry in std::fs::read_dir(nii_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            debug!("Skipping non-UTF-8 entry {:?}", entry.path());
            continue;
        };
        match SubjectIdentity::parse(name) {
            Ok(identity) if identity.is_phantom() => {
                debug!("Skipping phantom {}", name);
            }
            Ok(identity) => subjects.push(identity),
            Err(e) => debug!("Skipping {}: {}", name, e),
        }
    }
    subjects.sort();
    Ok(subjects)
}

/// Worklist for a run
///
/// With no explicit `requested` ids every discovered subject is processed.
/// Requested ids that fail to parse or name phantoms are dropped with a
/// warning.
pub fn build_worklist(nii_dir: &Path, requested: &[String]) -> Result<Vec<SubjectIdentity>> {
    if requested.is_empty() {
        return discover_subjects(nii_dir);
    }

    let mut subjects = Vec::new();
    for raw in requested {
        match SubjectIdentity::parse(raw) {
            Ok(identity) if identity.is_phantom() => {
                warn!("Ignoring phantom {}", raw);
            }
            Ok(identity) => subjects.push(identity),
            Err(e) => warn!("Ignoring requested subject: {}", e),
        }
    }
    subjects.sort();
    subjects.dedup();
    Ok(subjects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_discover_excludes_phantoms_and_junk() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "SPN01_MRC_0002_01",
            "SPN01_CMH_0001_01",
            "SPN01_CMH_PHA_FBN0001",
            "logs",
        ] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        fs::write(dir.path().join("SPN01_CMH_0003_01"), b"not a dir").unwrap();

        let subjects = discover_subjects(dir.path()).unwrap();
        let ids: Vec<String> = subjects.iter().map(|s| s.to_string()).collect();
        assert_eq!(ids, vec!["SPN01_CMH_0001_01", "SPN01_MRC_0002_01"]);
    }

    #[test]
    fn test_discover_missing_dir_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover_subjects(&dir.path().join("absent")).is_err());
    }

    #[test]
    fn test_requested_subjects_restrict_worklist() {
        let dir = tempfile::tempdir().unwrap();
        let requested = vec![
            "SPN01_MRC_0002_01".to_string(),
            "SPN01_CMH_PHA_FBN0001".to_string(),
            "garbage".to_string(),
            "SPN01_MRC_0002_01".to_string(),
        ];
        let subjects = build_worklist(dir.path(), &requested).unwrap();
        assert_eq!(subjects.len(), 1);
        assert_eq!(subjects[0].to_string(), "SPN01_MRC_0002_01");
    }
}
