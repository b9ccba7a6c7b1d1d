//! Adapter around the analysis extraction binaries.
//!
//! Every binary follows the same shape: positional flags, an output-path
//! prefix, and a small text report written at `<prefix>Calibration.txt`.
//! The reports are *appended* across invocations, so a stale file from a
//! previous (possibly failed) run must be deleted before the binary runs,
//! and the report must be deleted again right after extraction. Both are
//! enforced here, in one place.

use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use calo_calib_core::{process, Report};

/// One analysis binary invocation with its flag set and report location.
#[derive(Debug, Clone)]
pub struct AnalysisTool {
    name: String,
    executable: PathBuf,
    arguments: Vec<(String, Option<String>)>,
    report_path: PathBuf,
}

impl AnalysisTool {
    /// Configure a binary from the analysis install prefix. `output_flag`
    /// is the flag carrying `output_prefix`; the report is expected at
    /// `<output_prefix>Calibration.txt`.
    pub fn new(
        analysis_dir: &Path,
        binary: &str,
        output_flag: &str,
        output_prefix: &str,
    ) -> Self {
        Self {
            name: binary.to_string(),
            executable: analysis_dir.join("bin").join(binary),
            arguments: vec![(output_flag.to_string(), Some(output_prefix.to_string()))],
            report_path: PathBuf::from(format!("{output_prefix}Calibration.txt")),
        }
    }

    /// Insert or replace a flag with a value.
    pub fn set_argument(&mut self, flag: &str, value: impl ToString) {
        let value = Some(value.to_string());
        match self.arguments.iter_mut().find(|(f, _)| f == flag) {
            Some(slot) => slot.1 = value,
            None => self.arguments.push((flag.to_string(), value)),
        }
    }

    /// Insert a value-less switch flag.
    pub fn set_switch(&mut self, flag: &str) {
        if !self.arguments.iter().any(|(f, _)| f == flag) {
            self.arguments.push((flag.to_string(), None));
        }
    }

    /// Where this tool writes its report.
    pub fn report_path(&self) -> &Path {
        &self.report_path
    }

    /// Run the binary and return its parsed report. The report file is
    /// deleted both before the run and after extraction.
    pub fn run(&self) -> Result<Report> {
        remove_if_exists(&self.report_path)?;

        let mut args: Vec<OsString> = Vec::new();
        for (flag, value) in &self.arguments {
            args.push(flag.into());
            if let Some(value) = value {
                args.push(value.into());
            }
        }
        process::run(&self.executable, &args)
            .with_context(|| format!("analysis binary '{}'", self.name))?;

        let report = Report::load(&self.report_path)
            .with_context(|| format!("'{}' produced no readable report", self.name));
        remove_if_exists(&self.report_path)?;
        report
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
        Err(error) => {
            Err(error).with_context(|| format!("removing stale report '{}'", path.display()))
        }
    }
}
