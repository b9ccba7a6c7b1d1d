//! Ecal energy-scale calibration.
//!
//! Converges the two-component ecal factor vector (barrel/endcap layer
//! groups) against the known injected photon energy: each iteration runs
//! the reconstruction over the photon sample with the current factors on
//! every ecal reconstruction processor, extracts the mean digitized
//! photon energy, and rescales.

use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use calo_calib_core::report::fields;
use calo_calib_core::{CalibrationDocument, IterationRecord};

use crate::analysis::AnalysisTool;
use crate::convergence::{converge, IterationDriver, Track};
use crate::marlin::Marlin;
use crate::options::{RequiredArg, RunOptions};
use crate::step::{join_values, CalibrationStep};

use super::{reconstruction_from_options, PFO_ANALYSIS_PROCESSOR};

/// Processor bindings for the ecal energy calibration.
#[derive(Debug, Clone)]
pub struct EcalEnergyConfig {
    /// Ecal reconstruction processors receiving the factor vector.
    pub reco_processors: Vec<String>,
    /// Processors left active for the reconstruction passes; empty means
    /// the full chain.
    pub run_processors: Vec<String>,
    pub pfo_analysis_processor: String,
    /// Output-path prefix of the digitisation extraction report.
    pub output_prefix: String,
}

impl Default for EcalEnergyConfig {
    fn default() -> Self {
        Self {
            reco_processors: vec![
                "MyEcalBarrelReco".into(),
                "MyEcalEndcapReco".into(),
                "MyEcalRingReco".into(),
            ],
            run_processors: Vec::new(),
            pfo_analysis_processor: PFO_ANALYSIS_PROCESSOR.into(),
            output_prefix: "./ECalDigit_".into(),
        }
    }
}

#[derive(Debug, Clone)]
struct EcalEnergyOutput {
    factors: Vec<f64>,
    photon_energy: f64,
    rescale: f64,
    precision: f64,
}

/// The ecal energy-scale stage.
pub struct EcalEnergyStep {
    config: EcalEnergyConfig,
    dependencies: Vec<String>,
    marlin: Option<Marlin>,
    analysis_dir: Option<PathBuf>,
    max_iterations: usize,
    accuracy: f64,
    photon_energy: f64,
    factors: Vec<f64>,
    output: Option<EcalEnergyOutput>,
}

impl EcalEnergyStep {
    pub const NAME: &'static str = "EcalEnergy";

    pub fn new(config: EcalEnergyConfig) -> Self {
        Self {
            config,
            dependencies: Vec::new(),
            marlin: None,
            analysis_dir: None,
            max_iterations: 5,
            accuracy: 0.01,
            photon_energy: 10.0,
            factors: Vec::new(),
            output: None,
        }
    }

    /// Declare the earlier steps whose outputs are loaded at `init`.
    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

struct EcalDriver<'a> {
    config: &'a EcalEnergyConfig,
    marlin: &'a mut Marlin,
    document: &'a mut CalibrationDocument,
    analysis_dir: &'a Path,
    photon_energy: f64,
}

impl IterationDriver for EcalDriver<'_> {
    fn apply_and_run(&mut self, iteration: usize, tracks: &[Track]) -> Result<PathBuf> {
        let factors = join_values(tracks[0].constants());
        for processor in &self.config.reco_processors {
            self.marlin
                .set_processor_parameter(processor, "calibration_factorsMipGev", &factors)?;
        }
        let output = format!("./PfoAnalysis_{}_iter{iteration}.root", EcalEnergyStep::NAME);
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
            "ECalDigitisation_ContainedEvents",
            "-d",
            &self.config.output_prefix,
        );
        extractor.set_argument("-a", run_output.display());
        extractor.set_argument("-b", self.photon_energy);
        let report = extractor.run()?;
        Ok(report.value(&fields::ECAL_DIGI_MEAN)?)
    }

    fn checkpoint(&mut self, iteration: usize, tracks: &[Track]) -> Result<()> {
        let track = &tracks[0];
        log::info!(
            "iteration {iteration}: factors [{}], rescale {}, photon energy {} GeV, precision {}",
            join_values(track.constants()),
            track.rescale(),
            track.measured(),
            track.precision()
        );
        self.document.step_entry(EcalEnergyStep::NAME).push_iteration(
            IterationRecord::new(iteration)
                .with_field("precision", track.precision())
                .with_field("rescale", track.rescale())
                .with_field("newPhotonEnergy", track.measured()),
        );
        Ok(())
    }
}

impl CalibrationStep for EcalEnergyStep {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> String {
        "Converge the ecal energy factors (unit GeV per mip) against the injected \
         photon energy; outputs the ecalFactors vector"
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
        self.marlin = Some(reconstruction_from_options(options, &options.photon_files)?);
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

        self.factors = document.f64_list_from("ecalFactors", None)?;
        ensure!(
            !self.factors.is_empty(),
            "input 'ecalFactors' is empty"
        );
        self.photon_energy = document.input_f64_or("photonEnergy", 10.0)?;
        Ok(())
    }

    fn run(&mut self, document: &mut CalibrationDocument) -> Result<()> {
        let marlin = self.marlin.as_mut().context("command line not read")?;
        let analysis_dir = self.analysis_dir.as_deref().context("command line not read")?;

        let mut tracks = vec![Track::new(
            "ecal",
            self.factors.clone(),
            self.photon_energy,
            self.accuracy,
        )?];
        let mut driver = EcalDriver {
            config: &self.config,
            marlin,
            document,
            analysis_dir,
            photon_energy: self.photon_energy,
        };
        converge(Self::NAME, self.max_iterations, &mut tracks, &mut driver)?;

        let track = &tracks[0];
        self.output = Some(EcalEnergyOutput {
            factors: track.constants().to_vec(),
            photon_energy: track.measured(),
            rescale: track.rescale_cumul(),
            precision: track.precision(),
        });
        Ok(())
    }

    fn write_output(&self, document: &mut CalibrationDocument) -> Result<()> {
        let converged = self.output.as_ref().context("step has not converged")?;
        let output = document.step_entry(Self::NAME).output_mut();
        output.set("photonEnergy", converged.photon_energy);
        output.set("rescale", converged.rescale);
        output.set("precision", converged.precision);
        output.set("ecalFactors", join_values(&converged.factors));
        for processor in &self.config.reco_processors {
            output.set_processor(
                processor,
                "calibration_factorsMipGev",
                join_values(&converged.factors),
            );
        }
        Ok(())
    }
}
