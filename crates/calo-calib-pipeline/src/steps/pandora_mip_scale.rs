//! Pandora mip-response calibration.
//!
//! One reconstruction pass over the muon sample with the digitization
//! chain active, then one extraction of the mean reconstructed energy of
//! a mip hit in each detector. No convergence loop. The results feed the
//! Pandora processor's mip-to-GeV conversion constants.

use std::path::PathBuf;

use anyhow::{Context, Result};
use calo_calib_core::report::fields;
use calo_calib_core::CalibrationDocument;

use crate::analysis::AnalysisTool;
use crate::marlin::Marlin;
use crate::options::{RequiredArg, RunOptions};
use crate::step::CalibrationStep;

use super::{reconstruction_from_options, PANDORA_PROCESSOR, PFO_ANALYSIS_PROCESSOR};

/// Processor bindings for the Pandora mip extraction.
#[derive(Debug, Clone)]
pub struct PandoraMipScaleConfig {
    /// Processors left active for the reconstruction pass; empty means
    /// the full chain.
    pub run_processors: Vec<String>,
    pub pandora_processor: String,
    pub pfo_analysis_processor: String,
    /// Injected muon energy in GeV.
    pub muon_energy: f64,
}

impl Default for PandoraMipScaleConfig {
    fn default() -> Self {
        Self {
            run_processors: Vec::new(),
            pandora_processor: PANDORA_PROCESSOR.into(),
            pfo_analysis_processor: PFO_ANALYSIS_PROCESSOR.into(),
            muon_energy: 10.0,
        }
    }
}

/// The Pandora mip-scale stage.
pub struct PandoraMipScaleStep {
    config: PandoraMipScaleConfig,
    dependencies: Vec<String>,
    marlin: Option<Marlin>,
    analysis_dir: Option<PathBuf>,
    pfo_output: String,
    ecal_to_gev_mip: f64,
    hcal_to_gev_mip: f64,
    muon_to_gev_mip: f64,
}

impl PandoraMipScaleStep {
    pub const NAME: &'static str = "PandoraMipScale";

    pub fn new(config: PandoraMipScaleConfig) -> Self {
        Self {
            config,
            dependencies: Vec::new(),
            marlin: None,
            analysis_dir: None,
            pfo_output: format!("./PfoAnalysis_{}.root", Self::NAME),
            ecal_to_gev_mip: 0.0,
            hcal_to_gev_mip: 0.0,
            muon_to_gev_mip: 0.0,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

impl CalibrationStep for PandoraMipScaleStep {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> String {
        "Extract the mean reconstructed energy of a mip hit in the ecal, hcal and \
         muon chambers; outputs the Pandora mip-to-GeV conversion constants"
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
            RequiredArg::MuonFiles,
        ]
    }

    fn read_cmd_line(&mut self, options: &RunOptions) -> Result<()> {
        let mut marlin = reconstruction_from_options(options, &options.muon_files)?;
        marlin.set_processor_parameter(
            &self.config.pfo_analysis_processor,
            "RootFile",
            &self.pfo_output,
        )?;
        self.marlin = Some(marlin);
        self.analysis_dir = Some(options.require_analysis_dir()?.to_path_buf());
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
        Ok(())
    }

    fn run(&mut self, _document: &mut CalibrationDocument) -> Result<()> {
        let marlin = self.marlin.as_ref().context("command line not read")?;
        let analysis_dir = self.analysis_dir.as_deref().context("command line not read")?;
        marlin.run()?;

        let mut extractor = AnalysisTool::new(
            analysis_dir,
            "PandoraPFACalibrate_MipResponse",
            "-c",
            "./PandoraMipScale_",
        );
        extractor.set_argument("-a", &self.pfo_output);
        extractor.set_argument("-b", self.config.muon_energy);
        let report = extractor.run()?;

        self.ecal_to_gev_mip = report.value(&fields::ECAL_TO_GEV_MIP)?;
        self.hcal_to_gev_mip = report.value(&fields::HCAL_TO_GEV_MIP)?;
        self.muon_to_gev_mip = report.value(&fields::MUON_TO_GEV_MIP)?;
        log::info!(
            "pandora mip scale: ecal={} hcal={} muon={}",
            self.ecal_to_gev_mip,
            self.hcal_to_gev_mip,
            self.muon_to_gev_mip
        );
        Ok(())
    }

    fn write_output(&self, document: &mut CalibrationDocument) -> Result<()> {
        let output = document.step_entry(Self::NAME).output_mut();
        output.set_processor(
            &self.config.pandora_processor,
            "ECalToMipCalibration",
            self.ecal_to_gev_mip,
        );
        output.set_processor(
            &self.config.pandora_processor,
            "HCalToMipCalibration",
            self.hcal_to_gev_mip,
        );
        output.set_processor(
            &self.config.pandora_processor,
            "MuonToMipCalibration",
            self.muon_to_gev_mip,
        );
        Ok(())
    }
}
