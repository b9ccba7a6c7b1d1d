//! Variants of the Pandora reconstruction settings.
//!
//! Some stages run the reconstruction with a modified Pandora settings
//! file: the EM/hadronic-scale calibrations need the hadronic
//! energy-correction plugins removed, and the software-compensation
//! training needs a training algorithm appended with a per-energy ROOT
//! output. The template is loaded once and variants are rendered to
//! transient files owned by the calling stage.

use std::path::Path;

use anyhow::{Context, Result};
use calo_calib_core::Element;
use tempfile::NamedTempFile;

const TRAINING_ALGORITHM: &str = "TrainingSoftwareCompensation";

/// A Pandora settings template plus the requested modifications.
#[derive(Debug, Clone)]
pub struct PandoraSettings {
    settings: Element,
}

impl PandoraSettings {
    /// Load a settings file; the root element must be `pandora`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let settings = Element::load(path)
            .with_context(|| format!("loading pandora settings '{}'", path.display()))?;
        anyhow::ensure!(
            settings.name() == "pandora",
            "pandora settings '{}' has root '{}', expected 'pandora'",
            path.display(),
            settings.name()
        );
        Ok(Self { settings })
    }

    /// Drop the hadronic energy-correction plugins so the raw calorimeter
    /// response is measured.
    pub fn remove_energy_corrections(&mut self) {
        self.settings
            .retain_children(|child| child.name() != "HadronicEnergyCorrectionPlugins");
    }

    /// Append the software-compensation training algorithm, replacing any
    /// existing one, writing its training tree to `root_file`.
    pub fn set_soft_comp_training(&mut self, root_file: &str, tree_name: &str) {
        self.settings.retain_children(|child| {
            !(child.name() == "algorithm" && child.attribute("type") == Some(TRAINING_ALGORITHM))
        });
        let mut algorithm = Element::new("algorithm");
        algorithm.set_attribute("type", TRAINING_ALGORITHM);
        algorithm.push_child(Element::with_text("MyRootFileName", root_file));
        algorithm.push_child(Element::with_text("SoftCompTrainingTreeName", tree_name));
        self.settings.push_child(algorithm);
    }

    /// Render the current settings to a transient file. The returned
    /// handle owns the file: keep it alive for as long as the
    /// reconstruction references it.
    pub fn write_temp(&self) -> Result<NamedTempFile> {
        let file = tempfile::Builder::new()
            .prefix("pandora-settings-")
            .suffix(".xml")
            .tempfile()
            .context("creating transient pandora settings file")?;
        self.settings.save(file.path())?;
        Ok(file)
    }
}
