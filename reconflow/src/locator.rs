//! Templated scan file discovery
//!
//! Each template (one per scan tag) is expanded for a subject, globbed under
//! a base directory, and the number of matches is checked against the
//! site's expected count for that tag.
//!
//! # Error Handling
//! - A tag with no count policy is never an error, however many files match
//! - More files than expected is [`LocateError::FileCountExceeded`]
//! - An identifier that does not parse disables count checking; the
//!   unvalidated listing is still returned. Templates needing `{study}`,
//!   `{site}`, `{subject}` or `{session}` yield no files for such an identifier

use reconflow_common::{Config, SubjectIdentity};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Placeholder replaced by the raw subject identifier
pub const SUBJECT_FIELD: &str = "dm_subject_id";

/// Placeholders filled from a parsed identifier
const IDENTITY_FIELDS: [&str; 4] = ["study", "site", "subject", "session"];

/// File discovery errors
#[derive(Debug, Error, PartialEq)]
pub enum LocateError {
    /// More files matched than the site expects for this tag
    #[error("Found {found} {tag} files, expected {expected}")]
    FileCountExceeded {
        tag: String,
        found: usize,
        expected: usize,
    },

    /// Template could not be turned into a glob pattern
    #[error("Invalid pattern for {tag} ({pattern}): {message}")]
    Pattern {
        tag: String,
        pattern: String,
        message: String,
    },

    /// Directory entry could not be read while globbing
    #[error("Cannot read {path}: {message}")]
    Glob { path: PathBuf, message: String },
}

/// Ordered absolute paths matched by one template for one subject
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSet(Vec<PathBuf>);

impl FileSet {
    pub fn new(mut paths: Vec<PathBuf>) -> Self {
        paths.sort();
        Self(paths)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PathBuf> {
        self.0.iter()
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.0
    }
}

impl From<PathBuf> for FileSet {
    fn from(path: PathBuf) -> Self {
        Self(vec![path])
    }
}

impl<'a> IntoIterator for &'a FileSet {
    type Item = &'a PathBuf;
    type IntoIter = std::slice::Iter<'a, PathBuf>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Source of expected file counts
///
/// `None` means no policy is defined for the tag, not "zero expected".
pub trait CountPolicy: Send + Sync {
    fn expected_count(&self, identity: &SubjectIdentity, tag: &str) -> Option<usize>;
}

impl CountPolicy for Config {
    fn expected_count(&self, identity: &SubjectIdentity, tag: &str) -> Option<usize> {
        match self.get_export_info(&identity.site, &identity.study) {
            Ok(export_info) => export_info.expected_count(tag),
            Err(e) => {
                debug!("No export info for {}: {}", identity, e);
                None
            }
        }
    }
}

/// Fixed tag → count table applied to every subject
#[derive(Debug, Clone, Default)]
pub struct CountTable(BTreeMap<String, usize>);

impl CountTable {
    pub fn new(counts: impl IntoIterator<Item = (String, usize)>) -> Self {
        Self(counts.into_iter().collect())
    }
}

impl CountPolicy for CountTable {
    fn expected_count(&self, _identity: &SubjectIdentity, tag: &str) -> Option<usize> {
        self.0.get(tag).copied()
    }
}

/// Finds a subject's scan files from per-tag templates
pub struct FileLocator {
    templates: BTreeMap<String, String>,
    policy: Arc<dyn CountPolicy>,
}

impl FileLocator {
    /// Create a locator from a tag → template table and a count policy
    ///
    /// Templates are relative to the base directory given to [`locate`](Self::locate)
    /// and may use `{dm_subject_id}`, `{study}`, `{site}`, `{subject}` and
    /// `{session}` placeholders plus glob syntax (`?`, `*`, `[...]`).
    pub fn new(templates: BTreeMap<String, String>, policy: Arc<dyn CountPolicy>) -> Self {
        Self { templates, policy }
    }

    pub fn templates(&self) -> &BTreeMap<String, String> {
        &self.templates
    }

    /// Discover files for `subject_id` under `base_dir`, keyed by tag
    pub fn locate(
        &self,
        subject_id: &str,
        base_dir: &Path,
    ) -> Result<BTreeMap<String, FileSet>, LocateError> {
        let identity = match SubjectIdentity::parse(subject_id) {
            Ok(identity) => Some(identity),
            Err(e) => {
                warn!("{}; file counts will not be checked", e);
                None
            }
        };

        let mut found = BTreeMap::new();
        for (tag, template) in &self.templates {
            let Some(pattern) = expand_template(tag, template, subject_id, identity.as_ref())?
            else {
                warn!(
                    "{}: template {} needs identifier fields, no {} files listed",
                    subject_id, template, tag
                );
                found.insert(tag.clone(), FileSet::default());
                continue;
            };
            let files = glob_files(tag, base_dir, &pattern)?;
            debug!("{}: {} {} file(s) for {}", subject_id, files.len(), tag, pattern);
            found.insert(tag.clone(), files);
        }

        if let Some(identity) = &identity {
            for (tag, files) in &found {
                self.check_count(identity, tag, files)?;
            }
        }

        Ok(found)
    }

    fn check_count(
        &self,
        identity: &SubjectIdentity,
        tag: &str,
        files: &FileSet,
    ) -> Result<(), LocateError> {
        let Some(expected) = self.policy.expected_count(identity, tag) else {
            debug!("Count value for tag:{} not found.", tag);
            return Ok(());
        };

        let found = files.len();
        if found > expected {
            return Err(LocateError::FileCountExceeded {
                tag: tag.to_string(),
                found,
                expected,
            });
        }
        Ok(())
    }
}

/// Substitute identifier fields into a template
///
/// Substituted values are glob-escaped. Returns `None` when the template
/// uses identity fields and the identifier did not parse.
fn expand_template(
    tag: &str,
    template: &str,
    subject_id: &str,
    identity: Option<&SubjectIdentity>,
) -> Result<Option<String>, LocateError> {
    let placeholder = |field: &str| format!("{{{}}}", field);
    let mut pattern = template.replace(
        &placeholder(SUBJECT_FIELD),
        &glob::Pattern::escape(subject_id),
    );
    match identity {
        Some(identity) => {
            for (field, value) in IDENTITY_FIELDS.iter().zip([
                &identity.study,
                &identity.site,
                &identity.subject_number,
                &identity.session,
            ]) {
                pattern = pattern.replace(&placeholder(*field), &glob::Pattern::escape(value));
            }
        }
        None => {
            if IDENTITY_FIELDS
                .iter()
                .any(|field| pattern.contains(&placeholder(*field)))
            {
                return Ok(None);
            }
        }
    }

    if let Some(start) = pattern.find('{') {
        let field = pattern[start..]
            .split_once('}')
            .map(|(field, _)| format!("{}}}", field))
            .unwrap_or_else(|| pattern[start..].to_string());
        return Err(LocateError::Pattern {
            tag: tag.to_string(),
            pattern: template.to_string(),
            message: format!("unresolved field {}", field),
        });
    }
    Ok(Some(pattern))
}

/// Glob `pattern` rooted at `base_dir`; the base directory itself is matched literally
fn glob_files(tag: &str, base_dir: &Path, pattern: &str) -> Result<FileSet, LocateError> {
    let base = std::path::absolute(base_dir).map_err(|e| LocateError::Glob {
        path: base_dir.to_path_buf(),
        message: e.to_string(),
    })?;
    let base_str = base.to_str().ok_or_else(|| LocateError::Pattern {
        tag: tag.to_string(),
        pattern: pattern.to_string(),
        message: format!("base directory {} is not valid UTF-8", base.display()),
    })?;
    let full = format!("{}/{}", glob::Pattern::escape(base_str), pattern);

    let entries = glob::glob(&full).map_err(|e| LocateError::Pattern {
        tag: tag.to_string(),
        pattern: pattern.to_string(),
        message: e.to_string(),
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| LocateError::Glob {
            path: e.path().to_path_buf(),
            message: e.error().to_string(),
        })?;
        files.push(path);
    }
    Ok(FileSet::new(files))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const SUBJECT: &str = "SPN01_CMH_0001_01";
    const T1_TEMPLATE: &str = "{dm_subject_id}/{dm_subject_id}_??_T1_??*.nii.gz";

    fn subject_dir(root: &Path, files: &[&str]) {
        let dir = root.join(SUBJECT);
        fs::create_dir_all(&dir).unwrap();
        for name in files {
            fs::write(dir.join(name), b"").unwrap();
        }
    }

    fn locator(policy: Arc<dyn CountPolicy>) -> FileLocator {
        let templates = BTreeMap::from([("T1".to_string(), T1_TEMPLATE.to_string())]);
        FileLocator::new(templates, policy)
    }

    fn expect_t1(n: usize) -> Arc<dyn CountPolicy> {
        Arc::new(CountTable::new([("T1".to_string(), n)]))
    }

    #[test]
    fn test_locate_matches_template() {
        let root = tempfile::tempdir().unwrap();
        subject_dir(
            root.path(),
            &[
                "SPN01_CMH_0001_01_01_T1_02_SagT1.nii.gz",
                "SPN01_CMH_0001_01_01_T2_03_T2w.nii.gz",
                "SPN01_CMH_0001_01_01_T1_02_SagT1.json",
            ],
        );

        let found = locator(expect_t1(1)).locate(SUBJECT, root.path()).unwrap();
        let t1 = &found["T1"];
        assert_eq!(t1.len(), 1);
        assert!(t1.paths()[0].is_absolute());
        assert!(t1.paths()[0].ends_with("SPN01_CMH_0001_01_01_T1_02_SagT1.nii.gz"));
    }

    #[test]
    fn test_count_at_or_below_expected_is_ok() {
        let root = tempfile::tempdir().unwrap();
        subject_dir(root.path(), &["SPN01_CMH_0001_01_01_T1_02_A.nii.gz"]);
        assert!(locator(expect_t1(1)).locate(SUBJECT, root.path()).is_ok());
        assert!(locator(expect_t1(2)).locate(SUBJECT, root.path()).is_ok());
    }

    #[test]
    fn test_count_above_expected_fails() {
        let root = tempfile::tempdir().unwrap();
        subject_dir(
            root.path(),
            &[
                "SPN01_CMH_0001_01_01_T1_02_A.nii.gz",
                "SPN01_CMH_0001_01_01_T1_05_B.nii.gz",
            ],
        );
        let err = locator(expect_t1(1)).locate(SUBJECT, root.path()).unwrap_err();
        assert_eq!(
            err,
            LocateError::FileCountExceeded {
                tag: "T1".to_string(),
                found: 2,
                expected: 1,
            }
        );
    }

    #[test]
    fn test_no_count_policy_never_fails() {
        let no_policy: Arc<dyn CountPolicy> = Arc::new(CountTable::default());
        for n in 0..3 {
            let root = tempfile::tempdir().unwrap();
            let names: Vec<String> = (0..n)
                .map(|i| format!("SPN01_CMH_0001_01_01_T1_0{}_X.nii.gz", i))
                .collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            subject_dir(root.path(), &refs);

            let found = locator(no_policy.clone()).locate(SUBJECT, root.path()).unwrap();
            assert_eq!(found["T1"].len(), n);
        }
    }

    #[test]
    fn test_unparseable_subject_skips_validation() {
        let root = tempfile::tempdir().unwrap();
        let raw = "not-a-subject";
        let dir = root.path().join(raw);
        fs::create_dir_all(&dir).unwrap();
        for name in ["not-a-subject_01_T1_02_A.nii.gz", "not-a-subject_01_T1_03_B.nii.gz"] {
            fs::write(dir.join(name), b"").unwrap();
        }

        let found = locator(expect_t1(1)).locate(raw, root.path()).unwrap();
        assert_eq!(found["T1"].len(), 2);
    }

    #[test]
    fn test_unparseable_subject_with_identity_template_lists_nothing() {
        let root = tempfile::tempdir().unwrap();
        let raw = "junk-id";
        let dir = root.path().join(raw);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("junk-id_01_T1_02_A.nii.gz"), b"").unwrap();

        let templates = BTreeMap::from([
            ("T1".to_string(), T1_TEMPLATE.to_string()),
            ("T2".to_string(), "{site}/{dm_subject_id}/*_T1.nii.gz".to_string()),
        ]);
        let found = FileLocator::new(templates, expect_t1(1))
            .locate(raw, root.path())
            .unwrap();
        assert_eq!(found["T1"].len(), 1);
        assert!(found["T2"].is_empty());
    }

    #[test]
    fn test_raw_subject_id_glob_characters_are_literal() {
        let root = tempfile::tempdir().unwrap();
        for raw in ["junk[1]", "junk1"] {
            let dir = root.path().join(raw);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join(format!("{}_01_T1_02_A.nii.gz", raw)), b"").unwrap();
        }

        let found = locator(expect_t1(1)).locate("junk[1]", root.path()).unwrap();
        assert_eq!(found["T1"].len(), 1);
        assert!(found["T1"].paths()[0].starts_with(root.path().join("junk[1]")));
    }

    #[test]
    fn test_identity_fields_expand() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("CMH").join("0001");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("session01_T1.nii.gz"), b"").unwrap();

        let templates = BTreeMap::from([(
            "T1".to_string(),
            "{site}/{subject}/session{session}_T1.nii.gz".to_string(),
        )]);
        let found = FileLocator::new(templates, expect_t1(1))
            .locate(SUBJECT, root.path())
            .unwrap();
        assert_eq!(found["T1"].len(), 1);
    }

    #[test]
    fn test_unknown_field_is_pattern_error() {
        let root = tempfile::tempdir().unwrap();
        let templates = BTreeMap::from([("T1".to_string(), "{scanner}/*.nii.gz".to_string())]);
        let err = FileLocator::new(templates, expect_t1(1))
            .locate(SUBJECT, root.path())
            .unwrap_err();
        assert!(matches!(err, LocateError::Pattern { ref message, .. } if message.contains("{scanner}")));
    }

    #[test]
    fn test_base_dir_glob_characters_are_literal() {
        let root = tempfile::tempdir().unwrap();
        let base = root.path().join("data[1]");
        subject_dir(&base, &["SPN01_CMH_0001_01_01_T1_02_A.nii.gz"]);
        let found = locator(expect_t1(1)).locate(SUBJECT, &base).unwrap();
        assert_eq!(found["T1"].len(), 1);
    }
}
