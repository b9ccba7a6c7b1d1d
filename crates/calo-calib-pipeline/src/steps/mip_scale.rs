//! Per-cell minimum-ionizing-particle response calibration.
//!
//! A single reconstruction pass over the muon sample with only the
//! geometry and analysis processors active, followed by one extraction of
//! the mip peak positions for every calorimeter region. No convergence
//! loop: the mip values are read directly from the simulated hit energy
//! distributions.

use std::path::PathBuf;

use anyhow::{Context, Result};
use calo_calib_core::report::fields;
use calo_calib_core::CalibrationDocument;

use crate::analysis::AnalysisTool;
use crate::marlin::Marlin;
use crate::options::{RequiredArg, RunOptions};
use crate::step::CalibrationStep;

use super::{reconstruction_from_options, PFO_ANALYSIS_PROCESSOR};

/// Processor bindings for the mip extraction.
#[derive(Debug, Clone)]
pub struct MipScaleConfig {
    /// Processors left active for the reconstruction pass.
    pub run_processors: Vec<String>,
    /// Ecal digitizers receiving the shared ecal mip.
    pub ecal_digitizers: Vec<String>,
    pub hcal_barrel_digitizer: String,
    pub hcal_endcap_digitizer: String,
    pub hcal_ring_digitizer: String,
    pub pfo_analysis_processor: String,
    /// Injected muon energy in GeV.
    pub muon_energy: f64,
}

impl Default for MipScaleConfig {
    fn default() -> Self {
        Self {
            run_processors: vec!["InitDD4hep".into(), PFO_ANALYSIS_PROCESSOR.into()],
            ecal_digitizers: vec![
                "MyEcalBarrelDigi".into(),
                "MyEcalEndcapDigi".into(),
                "MyEcalRingDigi".into(),
            ],
            hcal_barrel_digitizer: "MyHcalBarrelDigi".into(),
            hcal_endcap_digitizer: "MyHcalEndcapDigi".into(),
            hcal_ring_digitizer: "MyHcalRingDigi".into(),
            pfo_analysis_processor: PFO_ANALYSIS_PROCESSOR.into(),
            muon_energy: 10.0,
        }
    }
}

/// The mip calibration stage.
pub struct MipScaleStep {
    config: MipScaleConfig,
    marlin: Option<Marlin>,
    analysis_dir: Option<PathBuf>,
    pfo_output: String,
    ecal_mip: f64,
    hcal_barrel_mip: f64,
    hcal_endcap_mip: f64,
    hcal_ring_mip: f64,
}

impl MipScaleStep {
    pub const NAME: &'static str = "MipScale";

    pub fn new(config: MipScaleConfig) -> Self {
        Self {
            config,
            marlin: None,
            analysis_dir: None,
            pfo_output: format!("./PfoAnalysis_{}.root", Self::NAME),
            ecal_mip: 0.0,
            hcal_barrel_mip: 0.0,
            hcal_endcap_mip: 0.0,
            hcal_ring_mip: 0.0,
        }
    }
}

impl CalibrationStep for MipScaleStep {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> String {
        "Extract the mip response of every calorimeter region from the muon sample; \
         outputs the ecal, hcal barrel, hcal endcap and hcal ring mip constants"
            .to_string()
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
        marlin.run_only(&self.config.run_processors);
        Ok(())
    }

    fn run(&mut self, _document: &mut CalibrationDocument) -> Result<()> {
        let marlin = self.marlin.as_ref().context("command line not read")?;
        let analysis_dir = self.analysis_dir.as_deref().context("command line not read")?;
        marlin.run()?;

        let mut extractor = AnalysisTool::new(
            analysis_dir,
            "SimCaloHitEnergyDistribution",
            "-c",
            "./SimCaloHitEnergyDistribution_",
        );
        extractor.set_argument("-a", &self.pfo_output);
        extractor.set_argument("-b", self.config.muon_energy);
        let report = extractor.run()?;

        self.hcal_barrel_mip = report.value(&fields::HCAL_BARREL_MIP)?;
        self.hcal_endcap_mip = report.value(&fields::HCAL_ENDCAP_MIP)?;
        self.hcal_ring_mip = report.value(&fields::HCAL_RING_MIP)?;
        self.ecal_mip = report.value(&fields::ECAL_MIP)?;
        log::info!(
            "mip constants: ecal={} hcalBarrel={} hcalEndcap={} hcalRing={}",
            self.ecal_mip,
            self.hcal_barrel_mip,
            self.hcal_endcap_mip,
            self.hcal_ring_mip
        );
        Ok(())
    }

    fn write_output(&self, document: &mut CalibrationDocument) -> Result<()> {
        let output = document.step_entry(Self::NAME).output_mut();
        output.set("ecalMip", self.ecal_mip);
        output.set("hcalBarrelMip", self.hcal_barrel_mip);
        output.set("hcalEndcapMip", self.hcal_endcap_mip);
        output.set("hcalRingMip", self.hcal_ring_mip);
        for digitizer in &self.config.ecal_digitizers {
            output.set_processor(digitizer, "calibration_mip", self.ecal_mip);
        }
        output.set_processor(
            &self.config.hcal_barrel_digitizer,
            "calibration_mip",
            self.hcal_barrel_mip,
        );
        output.set_processor(
            &self.config.hcal_endcap_digitizer,
            "calibration_mip",
            self.hcal_endcap_mip,
        );
        output.set_processor(
            &self.config.hcal_ring_digitizer,
            "calibration_mip",
            self.hcal_ring_mip,
        );
        Ok(())
    }
}
