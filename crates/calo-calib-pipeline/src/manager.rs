//! The pipeline manager: sequences the registered steps over one shared
//! calibration document.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use calo_calib_core::{CalibrationDocument, Error};

use crate::options::RunOptions;
use crate::step::CalibrationStep;

/// File name the partial document is flushed to when a run fails.
pub const FAILURE_DOCUMENT: &str = "calibration_failed.xml";

/// Where the failure artifact for a given output path lands: same
/// directory, fixed name.
pub fn failure_document_path(output: &Path) -> PathBuf {
    match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(FAILURE_DOCUMENT),
        _ => PathBuf::from(FAILURE_DOCUMENT),
    }
}

/// Ordered list of calibration steps plus the selected execution range.
#[derive(Default)]
pub struct CalibrationManager {
    steps: Vec<Box<dyn CalibrationStep>>,
    start: usize,
    end: Option<usize>,
}

impl CalibrationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step. Execution order is registration order; there is no
    /// topological solver.
    pub fn add_step(&mut self, step: Box<dyn CalibrationStep>) {
        self.steps.push(step);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Select the `start..=end` sub-range to execute. `end` of `None`
    /// means the last step; an `end` beyond the last step is clamped to
    /// it.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRange`] when the pipeline is empty, `start` is
    /// past the last step, or `start > end`.
    pub fn select_range(&mut self, start: usize, end: Option<usize>) -> Result<()> {
        let count = self.steps.len();
        let Some(last) = count.checked_sub(1) else {
            return Err(Error::InvalidRange {
                start,
                end: end.unwrap_or(0),
                count,
            }
            .into());
        };
        let end = end.map_or(last, |end| end.min(last));
        if start > end {
            return Err(Error::InvalidRange { start, end, count }.into());
        }
        self.start = start;
        self.end = Some(end);
        Ok(())
    }

    /// Operator-facing listing of the registered steps.
    pub fn describe_steps(&self) -> String {
        let mut listing = String::new();
        let _ = writeln!(listing, "Registered steps ({}):", self.steps.len());
        for (index, step) in self.steps.iter().enumerate() {
            let _ = writeln!(listing, " => {index}) {} : {}", step.name(), step.description());
        }
        listing
    }

    /// Check that every declared dependency names a step registered
    /// earlier in the list, before anything runs.
    pub fn validate_dependencies(&self) -> Result<()> {
        for index in 0..self.steps.len() {
            for dependency in self.steps[index].dependencies() {
                let satisfied = self.steps[..index]
                    .iter()
                    .any(|step| step.name() == dependency.as_str());
                if !satisfied {
                    return Err(Error::InvalidDependency {
                        step: self.steps[index].name().to_string(),
                        dependency: dependency.clone(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Run the selected steps in order over the shared document,
    /// stopping at the first failure.
    pub fn run(&mut self, options: &RunOptions, document: &mut CalibrationDocument) -> Result<()> {
        self.validate_dependencies()?;
        let (start, end) = self.selected_range()?;

        for index in start..=end {
            self.steps[index].prepare(options)?;
        }

        let mut missing = BTreeSet::new();
        for index in start..=end {
            for arg in self.steps[index].required_args() {
                if !arg.is_provided(options) {
                    missing.insert(arg.flag().to_string());
                }
            }
        }
        if !missing.is_empty() {
            return Err(Error::MissingArguments {
                flags: missing.into_iter().collect(),
            }
            .into());
        }

        for index in start..=end {
            let step = &mut self.steps[index];
            let name = step.name().to_string();
            log::info!("running step {index}: {name}");
            step.read_cmd_line(options)
                .with_context(|| format!("step '{name}': reading command line"))?;
            step.init(document)
                .with_context(|| format!("step '{name}': initialization"))?;
            step.run(document)
                .with_context(|| format!("step '{name}': execution"))?;
            step.write_output(document)
                .with_context(|| format!("step '{name}': writing output"))?;
            log::info!("step {index} ({name}) done");
        }
        Ok(())
    }

    /// Run the selected steps, then persist the document to
    /// `output_path`. On failure the partial document is flushed to the
    /// failure artifact next to `output_path` before the causing error
    /// is returned, so the partial state is never lost.
    pub fn execute(
        &mut self,
        options: &RunOptions,
        document: &mut CalibrationDocument,
        output_path: &Path,
    ) -> Result<()> {
        match self.run(options, document) {
            Ok(()) => {
                document.save(output_path)?;
                log::info!("calibration document written to {}", output_path.display());
                Ok(())
            }
            Err(error) => {
                let failure_path = failure_document_path(output_path);
                log::error!(
                    "calibration failed: {error:#}; flushing partial document to {}",
                    failure_path.display()
                );
                if let Err(save_error) = document.save(&failure_path) {
                    log::error!("could not persist the failure document: {save_error}");
                }
                Err(error)
            }
        }
    }

    fn selected_range(&self) -> Result<(usize, usize)> {
        let last = self.steps.len().checked_sub(1).ok_or(Error::InvalidRange {
            start: self.start,
            end: self.end.unwrap_or(usize::MAX),
            count: 0,
        })?;
        Ok((self.start, self.end.unwrap_or(last)))
    }
}
