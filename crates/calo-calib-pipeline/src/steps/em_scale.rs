//! Pandora electromagnetic-scale calibration.
//!
//! Converges the (ecal, hcal) EM-scale constant pair against the injected
//! photon energy. Both constants are rescaled by the same factor each
//! iteration: the photon deposits almost entirely in the ecal, so one
//! measurement constrains the pair. The reconstruction runs with the
//! hadronic energy-correction plugins removed from the Pandora settings
//! so the raw electromagnetic response is measured.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use calo_calib_core::report::fields;
use calo_calib_core::{CalibrationDocument, IterationRecord};
use tempfile::NamedTempFile;

use crate::analysis::AnalysisTool;
use crate::convergence::{converge, IterationDriver, Track};
use crate::marlin::Marlin;
use crate::options::{RequiredArg, RunOptions};
use crate::pandora::PandoraSettings;
use crate::step::CalibrationStep;

use super::{reconstruction_from_options, PANDORA_PROCESSOR, PFO_ANALYSIS_PROCESSOR};

const ECAL_PARAMETER: &str = "ECalToEMGeVCalibration";
const HCAL_PARAMETER: &str = "HCalToEMGeVCalibration";

/// Processor bindings for the EM-scale calibration.
#[derive(Debug, Clone)]
pub struct EmScaleConfig {
    pub pandora_processor: String,
    pub pfo_analysis_processor: String,
    /// Processors left active for the reconstruction passes; empty means
    /// the full chain.
    pub run_processors: Vec<String>,
    pub output_prefix: String,
}

impl Default for EmScaleConfig {
    fn default() -> Self {
        Self {
            pandora_processor: PANDORA_PROCESSOR.into(),
            pfo_analysis_processor: PFO_ANALYSIS_PROCESSOR.into(),
            run_processors: Vec::new(),
            output_prefix: "./PandoraEMScale_".into(),
        }
    }
}

/// The Pandora EM-scale stage.
pub struct EmScaleStep {
    config: EmScaleConfig,
    dependencies: Vec<String>,
    marlin: Option<Marlin>,
    analysis_dir: Option<PathBuf>,
    // Keeps the rendered Pandora settings alive while the engine uses them.
    settings_file: Option<NamedTempFile>,
    max_iterations: usize,
    accuracy: f64,
    photon_energy: f64,
    initial_constants: Vec<f64>,
    output: Option<(f64, f64)>,
}

impl EmScaleStep {
    pub const NAME: &'static str = "PandoraEMScale";

    pub fn new(config: EmScaleConfig) -> Self {
        Self {
            config,
            dependencies: Vec::new(),
            marlin: None,
            analysis_dir: None,
            settings_file: None,
            max_iterations: 5,
            accuracy: 0.01,
            photon_energy: 10.0,
            initial_constants: Vec::new(),
            output: None,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

struct EmScaleDriver<'a> {
    config: &'a EmScaleConfig,
    marlin: &'a mut Marlin,
    document: &'a mut CalibrationDocument,
    analysis_dir: &'a Path,
    photon_energy: f64,
}

impl IterationDriver for EmScaleDriver<'_> {
    fn apply_and_run(&mut self, iteration: usize, tracks: &[Track]) -> Result<PathBuf> {
        let constants = tracks[0].constants();
        self.marlin.set_processor_parameter(
            &self.config.pandora_processor,
            ECAL_PARAMETER,
            constants[0],
        )?;
        self.marlin.set_processor_parameter(
            &self.config.pandora_processor,
            HCAL_PARAMETER,
            constants[1],
        )?;
        let output = format!("./PfoAnalysis_{}_iter{iteration}.root", EmScaleStep::NAME);
        self.marlin.set_processor_parameter(
            &self.config.pfo_analysis_processor,
            "RootFile",
            &output,
        )?;
        self.marlin.run()?;
        Ok(PathBuf::from(output))
    }

    fn measure(&mut self, run_output: &Path, _track: &Track) -> Result<f64> {
        let mut extractor = AnalysisTool::new(
            self.analysis_dir,
            "PandoraPFACalibrate_EMScale",
            "-d",
            &self.config.output_prefix,
        );
        extractor.set_argument("-a", run_output.display());
        extractor.set_argument("-b", self.photon_energy);
        let report = extractor.run()?;
        Ok(report.value(&fields::ECAL_TO_EM_MEAN)?)
    }

    fn checkpoint(&mut self, iteration: usize, tracks: &[Track]) -> Result<()> {
        let track = &tracks[0];
        self.document.step_entry(EmScaleStep::NAME).push_iteration(
            IterationRecord::new(iteration)
                .with_field("precision", track.precision())
                .with_field("rescale", track.rescale())
                .with_field("newPhotonEnergy", track.measured()),
        );
        Ok(())
    }
}

impl CalibrationStep for EmScaleStep {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> String {
        "Converge the Pandora electromagnetic-scale constants against the injected \
         photon energy; outputs ECalToEMGeVCalibration and HCalToEMGeVCalibration"
            .to_string()
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    fn required_args(&self) -> Vec<RequiredArg> {
        vec![
            RequiredArg::CompactFile,
            RequiredArg::SteeringFile,
            RequiredArg::AnalysisDir,
            RequiredArg::PhotonFiles,
        ]
    }

    fn read_cmd_line(&mut self, options: &RunOptions) -> Result<()> {
        let mut marlin = reconstruction_from_options(options, &options.photon_files)?;

        // Run Pandora without the hadronic energy corrections.
        let settings_path = marlin
            .processor_parameter(&self.config.pandora_processor, "PandoraSettingsXmlFile")?;
        let mut settings = PandoraSettings::load(settings_path.trim())?;
        settings.remove_energy_corrections();
        let settings_file = settings.write_temp()?;
        marlin.set_processor_parameter(
            &self.config.pandora_processor,
            "PandoraSettingsXmlFile",
            settings_file.path().display(),
        )?;

        self.marlin = Some(marlin);
        self.settings_file = Some(settings_file);
        self.analysis_dir = Some(options.require_analysis_dir()?.to_path_buf());
        self.max_iterations = options.max_iterations;
        self.accuracy = options.ecal_accuracy;
        Ok(())
    }

    fn init(&mut self, document: &mut CalibrationDocument) -> Result<()> {
        document.remove_step(Self::NAME);
        let marlin = self.marlin.as_mut().context("command line not read")?;
        marlin.load_input_parameters(document)?;
        for dependency in &self.dependencies {
            marlin.load_step_output(document, dependency)?;
        }
        if !self.config.run_processors.is_empty() {
            marlin.run_only(&self.config.run_processors);
        }

        self.photon_energy = document.input_f64_or("photonEnergy", 10.0)?;
        let ecal = marlin
            .processor_parameter(&self.config.pandora_processor, ECAL_PARAMETER)?
            .trim()
            .parse::<f64>()
            .context("bad ECalToEMGeVCalibration starting value")?;
        let hcal = marlin
            .processor_parameter(&self.config.pandora_processor, HCAL_PARAMETER)?
            .trim()
            .parse::<f64>()
            .context("bad HCalToEMGeVCalibration starting value")?;
        self.initial_constants = vec![ecal, hcal];
        Ok(())
    }

    fn run(&mut self, document: &mut CalibrationDocument) -> Result<()> {
        let marlin = self.marlin.as_mut().context("command line not read")?;
        let analysis_dir = self.analysis_dir.as_deref().context("command line not read")?;

        let mut tracks = vec![Track::new(
            "emScale",
            self.initial_constants.clone(),
            self.photon_energy,
            self.accuracy,
        )?];
        let mut driver = EmScaleDriver {
            config: &self.config,
            marlin,
            document,
            analysis_dir,
            photon_energy: self.photon_energy,
        };
        converge(Self::NAME, self.max_iterations, &mut tracks, &mut driver)?;

        let constants = tracks[0].constants();
        self.output = Some((constants[0], constants[1]));
        Ok(())
    }

    fn write_output(&self, document: &mut CalibrationDocument) -> Result<()> {
        let (ecal, hcal) = self.output.context("step has not converged")?;
        let output = document.step_entry(Self::NAME).output_mut();
        output.set_processor(&self.config.pandora_processor, ECAL_PARAMETER, ecal);
        output.set_processor(&self.config.pandora_processor, HCAL_PARAMETER, hcal);
        Ok(())
    }
}
