//! Selector wrapping alternative implementations of one stage.
//!
//! Some physical quantities can be calibrated in more than one way (e.g.
//! against different digitization chains). A [`SwitchStep`] registers the
//! alternatives under one pipeline slot and forwards the whole stage
//! contract to exactly one of them, chosen with `--select NAME=INDEX`
//! (index 0 by default).

use anyhow::{bail, Context, Result};
use calo_calib_core::CalibrationDocument;

use crate::options::{RequiredArg, RunOptions};
use crate::step::CalibrationStep;

/// A stage slot with selectable alternatives.
pub struct SwitchStep {
    name: String,
    alternatives: Vec<Box<dyn CalibrationStep>>,
    selected: Option<usize>,
}

impl SwitchStep {
    pub fn new(name: impl Into<String>, alternatives: Vec<Box<dyn CalibrationStep>>) -> Self {
        Self {
            name: name.into(),
            alternatives,
            selected: None,
        }
    }

    fn selected_step(&self) -> Result<&dyn CalibrationStep> {
        let index = self.selected.context("no alternative selected yet")?;
        Ok(self.alternatives[index].as_ref())
    }

    fn selected_step_mut(&mut self) -> Result<&mut Box<dyn CalibrationStep>> {
        let index = self.selected.context("no alternative selected yet")?;
        Ok(&mut self.alternatives[index])
    }
}

impl CalibrationStep for SwitchStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        match self.selected_step() {
            Ok(step) => step.description(),
            // Not selected yet: list the alternatives for --show-steps.
            Err(_) => {
                let mut listing = String::from("one of:");
                for (index, step) in self.alternatives.iter().enumerate() {
                    listing.push_str(&format!(
                        "\n      {index}) {} : {}",
                        step.name(),
                        step.description()
                    ));
                }
                listing
            }
        }
    }

    fn dependencies(&self) -> &[String] {
        match self.selected {
            Some(index) => self.alternatives[index].dependencies(),
            None => &[],
        }
    }

    fn required_args(&self) -> Vec<RequiredArg> {
        match self.selected {
            Some(index) => self.alternatives[index].required_args(),
            None => Vec::new(),
        }
    }

    fn prepare(&mut self, options: &RunOptions) -> Result<()> {
        if self.alternatives.is_empty() {
            bail!("switch step '{}' has no alternatives", self.name);
        }
        let index = options.selections.get(&self.name).copied().unwrap_or(0);
        if index >= self.alternatives.len() {
            bail!(
                "switch step '{}': selection {index} out of range (have {} alternatives)",
                self.name,
                self.alternatives.len()
            );
        }
        self.selected = Some(index);
        self.alternatives[index].prepare(options)
    }

    fn read_cmd_line(&mut self, options: &RunOptions) -> Result<()> {
        self.selected_step_mut()?.read_cmd_line(options)
    }

    fn init(&mut self, document: &mut CalibrationDocument) -> Result<()> {
        self.selected_step_mut()?.init(document)
    }

    fn run(&mut self, document: &mut CalibrationDocument) -> Result<()> {
        self.selected_step_mut()?.run(document)
    }

    fn write_output(&self, document: &mut CalibrationDocument) -> Result<()> {
        self.selected_step()?.write_output(document)
    }
}
