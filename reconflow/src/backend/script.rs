//! Job script rendering

use super::ResourceTemplate;
use crate::graph::RealizedStage;
use std::io;
use std::path::{Path, PathBuf};

const SHEBANG: &str = "#!/bin/bash";

/// Scheduler job name for one stage of one subject
pub fn job_name(subject: &str, stage: &str) -> String {
    format!("{}_{}", stage, subject)
}

/// Quote `arg` for a POSIX shell; plain words are left alone
pub fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Job script for one stage
///
/// With `failure_exit` set, a failing command exits with that code instead
/// of its own (Grid Engine holds dependents of a job exiting with 100).
pub fn render_script(
    template: &ResourceTemplate,
    subject: &str,
    stage: &RealizedStage,
    failure_exit: Option<i32>,
) -> String {
    let mut script = String::new();
    let header = template.header.as_deref().unwrap_or_default();
    if !header.starts_with("#!") {
        script.push_str(SHEBANG);
        script.push('\n');
    }
    if !header.is_empty() {
        script.push_str(header.trim_end());
        script.push('\n');
    }

    script.push_str(&format!("\n# reconflow: {} for {}\n", stage.name, subject));
    let command = stage
        .command
        .iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ");
    script.push_str(&command);
    if let Some(code) = failure_exit {
        script.push_str(&format!(" || exit {}", code));
    }
    script.push('\n');
    script
}

/// Write an executable script, replacing any previous one
pub fn write_script(dir: &Path, name: &str, contents: &str) -> io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.sh", name));
    std::fs::write(&path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceHints;
    use std::collections::BTreeMap;

    fn stage(command: &[&str]) -> RealizedStage {
        RealizedStage {
            name: "recon_all".into(),
            command: command.iter().map(|s| s.to_string()).collect(),
            predecessors: Vec::new(),
            resource_hints: ResourceHints::default(),
            outputs: BTreeMap::new(),
            output_files: BTreeMap::new(),
        }
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("-parallel"), "-parallel");
        assert_eq!(shell_quote("/data/a_b.nii.gz"), "/data/a_b.nii.gz");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("*.nii"), "'*.nii'");
    }

    #[test]
    fn test_script_uses_template_header() {
        let template = ResourceTemplate {
            header: Some("#!/bin/sh\nmodule load freesurfer/6.0.0\n".into()),
        };
        let script = render_script(&template, "SPN01_CMH_0001_01", &stage(&["recon-all", "-all"]), None);
        assert!(script.starts_with("#!/bin/sh\nmodule load freesurfer/6.0.0\n"));
        assert!(!script.contains(SHEBANG));
        assert!(script.ends_with("recon-all -all\n"));
    }

    #[test]
    fn test_script_failure_exit() {
        let script = render_script(
            &ResourceTemplate::default(),
            "SPN01_CMH_0001_01",
            &stage(&["recon-all", "dir with space"]),
            Some(100),
        );
        assert!(script.starts_with(SHEBANG));
        assert!(script.ends_with("recon-all 'dir with space' || exit 100\n"));
    }

    #[test]
    fn test_write_script_creates_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(&dir.path().join("jobs/s1"), "job", "echo hi\n").unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "echo hi\n");
    }
}
