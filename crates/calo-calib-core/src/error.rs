use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias over the shared error taxonomy.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by the calibration pipeline.
///
/// Nothing in the pipeline is retried: any of these aborts the enclosing
/// step, and the manager halts the remaining step sequence on the first
/// one it sees.
#[derive(Debug, Error)]
pub enum Error {
    /// An external program exited with a nonzero status.
    #[error("command '{command}' exited with status {status}")]
    ExternalProcess { command: String, status: i32 },

    /// An external program could not be started at all.
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// A required named value is absent from the user input section and
    /// from the declared dependency step output.
    #[error("parameter '{name}' not found in user input{}", dependency_note(.step))]
    MissingParameter { name: String, step: Option<String> },

    /// A named value exists but cannot be interpreted as a number.
    #[error("parameter '{name}': cannot parse '{value}' as a number")]
    InvalidParameter { name: String, value: String },

    /// A convergence loop exhausted its iteration bound without reaching
    /// the target precision.
    #[error("step '{step}': target precision {target} not reached after {iterations} iterations")]
    Convergence {
        step: String,
        target: f64,
        iterations: usize,
    },

    /// Malformed start/end step selection.
    #[error("invalid step range {start}..={end} for {count} registered steps")]
    InvalidRange {
        start: usize,
        end: usize,
        count: usize,
    },

    /// A step declares a dependency that is not registered before it.
    #[error("step '{step}' depends on '{dependency}', which is not registered before it")]
    InvalidDependency { step: String, dependency: String },

    /// Command-line values required by the selected step range are absent.
    #[error("missing required command-line arguments: {}", .flags.join(", "))]
    MissingArguments { flags: Vec<String> },

    /// An analysis report does not match its expected positional layout.
    #[error("malformed report '{path}': {detail}")]
    Report { path: PathBuf, detail: String },

    /// XML parsing or serialization failed.
    #[error("xml error: {detail}")]
    Xml { detail: String },

    /// Filesystem access failed.
    #[error("i/o error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn dependency_note(step: &Option<String>) -> String {
    match step {
        Some(step) => format!(" nor in the output of step '{step}'"),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_parameter_mentions_dependency() {
        let plain = Error::MissingParameter {
            name: "ecalFactors".into(),
            step: None,
        };
        assert_eq!(
            plain.to_string(),
            "parameter 'ecalFactors' not found in user input"
        );

        let with_step = Error::MissingParameter {
            name: "hcalBarrelMip".into(),
            step: Some("MipScale".into()),
        };
        assert!(with_step.to_string().contains("step 'MipScale'"));
    }

    #[test]
    fn missing_arguments_lists_flags() {
        let error = Error::MissingArguments {
            flags: vec!["--compact-file".into(), "--steering-file".into()],
        };
        assert_eq!(
            error.to_string(),
            "missing required command-line arguments: --compact-file, --steering-file"
        );
    }
}
