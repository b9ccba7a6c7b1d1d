//! The calibration step abstraction.

use anyhow::{ensure, Result};
use calo_calib_core::CalibrationDocument;

use crate::options::{RequiredArg, RunOptions};

/// One named unit of the calibration pipeline.
///
/// The manager drives each selected step through `prepare` →
/// `read_cmd_line` → `init` → `run` → `write_output`, sharing one
/// [`CalibrationDocument`]. A step either commits its whole output node
/// or, on any error, commits nothing; partial outputs are never written.
pub trait CalibrationStep {
    /// Unique step name; also the `step` element name in the document.
    fn name(&self) -> &str;

    /// Operator-facing one-liner for `--show-steps`.
    fn description(&self) -> String;

    /// Names of earlier steps whose outputs this step loads. Validated
    /// against the registration order before anything runs.
    fn dependencies(&self) -> &[String] {
        &[]
    }

    /// Command-line values this step cannot run without. The manager
    /// unions these over the selected range before running.
    fn required_args(&self) -> Vec<RequiredArg> {
        Vec::new()
    }

    /// Early hook, run before the argument contract is checked. Used by
    /// selector steps to resolve their alternative and by steps whose
    /// requirements depend on mode flags.
    fn prepare(&mut self, _options: &RunOptions) -> Result<()> {
        Ok(())
    }

    /// Capture step-specific configuration from the command line. No
    /// side effects beyond local state.
    fn read_cmd_line(&mut self, options: &RunOptions) -> Result<()>;

    /// Remove this step's stale record from the document and load the
    /// required inputs from the `input` section and the declared
    /// dependency outputs.
    fn init(&mut self, document: &mut CalibrationDocument) -> Result<()>;

    /// Execute the step's convergence loop(s) or closed-form
    /// computation. Iteration diagnostics are checkpointed into the
    /// document as they happen.
    fn run(&mut self, document: &mut CalibrationDocument) -> Result<()>;

    /// Commit the converged constants into the document. Idempotent:
    /// re-invoking with the same converged state produces the same
    /// output node.
    fn write_output(&self, document: &mut CalibrationDocument) -> Result<()>;
}

/// Expand sample-file patterns, keeping only files with the given
/// extension when one is supplied.
///
/// # Errors
///
/// When the patterns match no file at all.
pub fn expand_file_patterns(patterns: &[String], extension: Option<&str>) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for pattern in patterns {
        let matches =
            glob::glob(pattern).map_err(|error| anyhow::anyhow!("bad file pattern '{pattern}': {error}"))?;
        for path in matches {
            let path = path?;
            if let Some(extension) = extension {
                if path.extension().and_then(|e| e.to_str()) != Some(extension) {
                    continue;
                }
            }
            files.push(path.to_string_lossy().into_owned());
        }
    }
    ensure!(
        !files.is_empty(),
        "no input files matched {:?}{}",
        patterns,
        extension.map(|e| format!(" with extension '.{e}'")).unwrap_or_default()
    );
    Ok(files)
}

/// Space-join a constant vector the way the steering dialect expects.
pub(crate) fn join_values(values: &[f64]) -> String {
    values
        .iter()
        .map(|value| value.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// `barrel` → `Barrel`, for iteration-record field names.
pub(crate) fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn expands_and_filters_by_extension() {
        let directory = tempfile::tempdir().unwrap();
        fs::write(directory.path().join("a.slcio"), "").unwrap();
        fs::write(directory.path().join("b.slcio"), "").unwrap();
        fs::write(directory.path().join("c.root"), "").unwrap();

        let pattern = directory
            .path()
            .join("*")
            .to_string_lossy()
            .into_owned();
        let mut files = expand_file_patterns(&[pattern], Some("slcio")).unwrap();
        files.sort();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("a.slcio"));
        assert!(files[1].ends_with("b.slcio"));
    }

    #[test]
    fn no_match_is_an_error() {
        let directory = tempfile::tempdir().unwrap();
        let pattern = directory
            .path()
            .join("*.slcio")
            .to_string_lossy()
            .into_owned();
        assert!(expand_file_patterns(&[pattern], None).is_err());
    }

    #[test]
    fn join_and_capitalize() {
        assert_eq!(join_values(&[42.91, 93.81]), "42.91 93.81");
        assert_eq!(capitalize("barrel"), "Barrel");
        assert_eq!(capitalize(""), "");
    }
}
