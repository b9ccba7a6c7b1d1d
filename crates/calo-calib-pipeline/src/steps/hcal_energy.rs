//! Hcal energy-scale calibration.
//!
//! Barrel and endcap are calibrated as independent tracks from the same
//! reconstruction runs over the neutral-kaon sample: the two regions are
//! separated by angular cuts applied in the extraction, so one pass per
//! iteration feeds both. A region that reaches its target precision is
//! frozen while the other keeps iterating.
//!
//! The ring region sits at too shallow an angle for a contained-event
//! measurement; its factors are derived in closed form from the endcap
//! result, the mip ratio of the two digitizers, the mean direction
//! corrections of the last reconstruction output and the ring geometry
//! factor.

use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use calo_calib_core::report::fields;
use calo_calib_core::{CalibrationDocument, IterationRecord};

use crate::analysis::AnalysisTool;
use crate::convergence::{converge, IterationDriver, Track};
use crate::marlin::Marlin;
use crate::options::{RequiredArg, RunOptions};
use crate::step::{capitalize, join_values, CalibrationStep};

use super::{reconstruction_from_options, PFO_ANALYSIS_PROCESSOR};

const BARREL: &str = "barrel";
const ENDCAP: &str = "endcap";

/// Processor bindings and region switches for the hcal calibration.
#[derive(Debug, Clone)]
pub struct HcalEnergyConfig {
    /// Barrel reconstruction processor; `None` disables the region.
    pub barrel_reco: Option<String>,
    /// Endcap reconstruction processor; `None` disables the region.
    pub endcap_reco: Option<String>,
    /// Ring reconstruction processor; `None` disables the derivation.
    pub ring_reco: Option<String>,
    pub endcap_digitizer: String,
    pub ring_digitizer: String,
    /// Processors left active for the reconstruction passes; empty means
    /// the full chain.
    pub run_processors: Vec<String>,
    pub pfo_analysis_processor: String,
    pub run_ring_calibration: bool,
    pub output_prefix: String,
    pub ring_output_prefix: String,
}

impl Default for HcalEnergyConfig {
    fn default() -> Self {
        Self {
            barrel_reco: Some("MyHcalBarrelReco".into()),
            endcap_reco: Some("MyHcalEndcapReco".into()),
            ring_reco: Some("MyHcalRingReco".into()),
            endcap_digitizer: "MyHcalEndcapDigi".into(),
            ring_digitizer: "MyHcalRingDigi".into(),
            run_processors: Vec::new(),
            pfo_analysis_processor: PFO_ANALYSIS_PROCESSOR.into(),
            run_ring_calibration: true,
            output_prefix: "./HcalEnergyCalibration_".into(),
            ring_output_prefix: "./HcalRingEnergyCalibration_".into(),
        }
    }
}

impl HcalEnergyConfig {
    fn reco_for(&self, region: &str) -> Option<&str> {
        match region {
            BARREL => self.barrel_reco.as_deref(),
            ENDCAP => self.endcap_reco.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct HcalEnergyOutput {
    barrel_factors: Vec<f64>,
    endcap_factors: Vec<f64>,
    ring_factors: Option<Vec<f64>>,
}

/// The hcal energy-scale stage.
pub struct HcalEnergyStep {
    config: HcalEnergyConfig,
    dependencies: Vec<String>,
    marlin: Option<Marlin>,
    analysis_dir: Option<PathBuf>,
    max_iterations: usize,
    accuracy: f64,
    kaon_energy: f64,
    barrel_cut: (f64, f64),
    endcap_cut: (f64, f64),
    ring_geometry_factor: f64,
    initial_factors: Vec<(String, Vec<f64>)>,
    output: Option<HcalEnergyOutput>,
}

impl HcalEnergyStep {
    pub const NAME: &'static str = "HcalEnergy";

    pub fn new(config: HcalEnergyConfig) -> Self {
        Self {
            config,
            dependencies: Vec::new(),
            marlin: None,
            analysis_dir: None,
            max_iterations: 5,
            accuracy: 0.01,
            kaon_energy: 20.0,
            barrel_cut: (0.0, 0.78),
            endcap_cut: (0.78, 0.98),
            ring_geometry_factor: 1.0,
            initial_factors: Vec::new(),
            output: None,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    fn digitizer_mip(&self, marlin: &Marlin, digitizer: &str) -> Result<f64> {
        let value = marlin.processor_parameter(digitizer, "calibration_mip")?;
        value
            .trim()
            .parse()
            .with_context(|| format!("digitizer '{digitizer}': bad mip value '{value}'"))
    }
}

struct HcalDriver<'a> {
    config: &'a HcalEnergyConfig,
    marlin: &'a mut Marlin,
    document: &'a mut CalibrationDocument,
    analysis_dir: &'a Path,
    kaon_energy: f64,
    barrel_cut: (f64, f64),
    endcap_cut: (f64, f64),
}

impl IterationDriver for HcalDriver<'_> {
    fn apply_and_run(&mut self, iteration: usize, tracks: &[Track]) -> Result<PathBuf> {
        for track in tracks {
            let Some(processor) = self.config.reco_for(track.name()) else {
                bail!("no reconstruction processor for region '{}'", track.name());
            };
            self.marlin.set_processor_parameter(
                processor,
                "calibration_factorsMipGev",
                join_values(track.constants()),
            )?;
        }
        let output = format!("./PfoAnalysis_{}_iter{iteration}.root", HcalEnergyStep::NAME);
        self.marlin.set_processor_parameter(
            &self.config.pfo_analysis_processor,
            "RootFile",
            &output,
        )?;
        self.marlin.run()?;
        Ok(PathBuf::from(output))
    }

    fn measure(&mut self, run_output: &Path, track: &Track) -> Result<f64> {
        let (region, cut) = match track.name() {
            BARREL => ("Barrel", self.barrel_cut),
            ENDCAP => ("EndCap", self.endcap_cut),
            other => bail!("unknown hcal region '{other}'"),
        };
        let mut extractor = AnalysisTool::new(
            self.analysis_dir,
            "HCalDigitisation_ContainedEvents",
            "-c",
            &self.config.output_prefix,
        );
        extractor.set_argument("-a", run_output.display());
        extractor.set_argument("-b", self.kaon_energy);
        extractor.set_argument("-g", region);
        extractor.set_argument("-i", cut.0);
        extractor.set_argument("-j", cut.1);
        let report = extractor.run()?;
        Ok(report.value(&fields::HCAL_DIGI_MEAN)?)
    }

    fn checkpoint(&mut self, iteration: usize, tracks: &[Track]) -> Result<()> {
        let mut record = IterationRecord::new(iteration);
        for track in tracks {
            let region = track.name();
            log::info!(
                "iteration {iteration}, {region}: factors [{}], rescale {}, kaon energy {} GeV, precision {}",
                join_values(track.constants()),
                track.rescale(),
                track.measured(),
                track.precision()
            );
            record = record
                .with_field(format!("{region}Precision"), track.precision())
                .with_field(format!("{region}Rescale"), track.rescale())
                .with_field(
                    format!("new{}Kaon0LEnergy", capitalize(region)),
                    track.measured(),
                );
        }
        self.document
            .step_entry(HcalEnergyStep::NAME)
            .push_iteration(record);
        Ok(())
    }
}

impl CalibrationStep for HcalEnergyStep {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> String {
        "Converge the hcal barrel and endcap energy factors (unit GeV per mip) \
         against the injected neutral-kaon energy and derive the ring factors; \
         outputs the hcal factor vectors"
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
            RequiredArg::Kaon0LFiles,
        ]
    }

    fn read_cmd_line(&mut self, options: &RunOptions) -> Result<()> {
        self.marlin = Some(reconstruction_from_options(options, &options.kaon0l_files)?);
        self.analysis_dir = Some(options.require_analysis_dir()?.to_path_buf());
        self.max_iterations = options.max_iterations;
        self.accuracy = options.hcal_accuracy;
        if self.config.run_ring_calibration && self.config.ring_reco.is_some() {
            ensure!(
                self.config.endcap_reco.is_some(),
                "ring calibration is derived from the endcap region, which is disabled"
            );
        }
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

        self.kaon_energy = document.input_f64_or("kaon0LEnergy", 20.0)?;
        self.barrel_cut = document.input_f64_pair_or("hcalBarrelCosThetaRange", (0.0, 0.78))?;
        self.endcap_cut = document.input_f64_pair_or("hcalEndcapCosThetaRange", (0.78, 0.98))?;
        self.ring_geometry_factor = document.input_f64_or("hcalRingGeometryFactor", 1.0)?;

        // Starting factor vectors come from the (already overridden)
        // steering configuration.
        self.initial_factors.clear();
        for (region, reco) in [
            (BARREL, self.config.barrel_reco.clone()),
            (ENDCAP, self.config.endcap_reco.clone()),
        ] {
            let Some(reco) = reco else { continue };
            let raw = marlin.processor_parameter(&reco, "calibration_factorsMipGev")?;
            let factors: Vec<f64> = raw
                .split_whitespace()
                .map(|token| {
                    token
                        .parse()
                        .with_context(|| format!("processor '{reco}': bad factor '{token}'"))
                })
                .collect::<Result<_>>()?;
            ensure!(
                !factors.is_empty(),
                "processor '{reco}' has no calibration factors to start from"
            );
            self.initial_factors.push((region.to_string(), factors));
        }
        ensure!(
            !self.initial_factors.is_empty(),
            "hcal calibration has no active region"
        );
        Ok(())
    }

    fn run(&mut self, document: &mut CalibrationDocument) -> Result<()> {
        let marlin = self.marlin.as_mut().context("command line not read")?;
        let analysis_dir = self.analysis_dir.as_deref().context("command line not read")?;

        let mut tracks = self
            .initial_factors
            .iter()
            .map(|(region, factors)| {
                Track::new(region.clone(), factors.clone(), self.kaon_energy, self.accuracy)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut driver = HcalDriver {
            config: &self.config,
            marlin,
            document,
            analysis_dir,
            kaon_energy: self.kaon_energy,
            barrel_cut: self.barrel_cut,
            endcap_cut: self.endcap_cut,
        };
        let last_output = converge(Self::NAME, self.max_iterations, &mut tracks, &mut driver)?;

        let mut output = HcalEnergyOutput::default();
        for track in &tracks {
            match track.name() {
                BARREL => output.barrel_factors = track.constants().to_vec(),
                ENDCAP => output.endcap_factors = track.constants().to_vec(),
                _ => {}
            }
        }

        if self.config.run_ring_calibration && self.config.ring_reco.is_some() {
            let marlin = self.marlin.as_ref().context("command line not read")?;
            output.ring_factors =
                Some(self.derive_ring_factors(marlin, analysis_dir, &last_output, &output.endcap_factors)?);
        }
        self.output = Some(output);
        Ok(())
    }

    fn write_output(&self, document: &mut CalibrationDocument) -> Result<()> {
        let converged = self.output.as_ref().context("step has not converged")?;
        let output = document.step_entry(Self::NAME).output_mut();
        if let Some(reco) = &self.config.barrel_reco {
            output.set_processor(
                reco,
                "calibration_factorsMipGev",
                join_values(&converged.barrel_factors),
            );
        }
        if let Some(reco) = &self.config.endcap_reco {
            output.set_processor(
                reco,
                "calibration_factorsMipGev",
                join_values(&converged.endcap_factors),
            );
        }
        if let (Some(reco), Some(ring_factors)) =
            (&self.config.ring_reco, &converged.ring_factors)
        {
            output.set_processor(reco, "calibration_factorsMipGev", join_values(ring_factors));
        }
        Ok(())
    }
}

impl HcalEnergyStep {
    /// Closed-form ring factors from the converged endcap result:
    /// direction-correction ratio × mip ratio × endcap factor × geometry
    /// factor, measured on the last iteration's reconstruction output.
    fn derive_ring_factors(
        &self,
        marlin: &Marlin,
        analysis_dir: &Path,
        last_output: &Path,
        endcap_factors: &[f64],
    ) -> Result<Vec<f64>> {
        let mut extractor = AnalysisTool::new(
            analysis_dir,
            "HCalDigitisation_DirectionCorrectionDistribution",
            "-c",
            &self.config.ring_output_prefix,
        );
        extractor.set_argument("-a", last_output.display());
        extractor.set_argument("-b", self.kaon_energy);
        let report = extractor.run()?;

        let endcap_correction = report.value(&fields::HCAL_ENDCAP_DIR_CORRECTION)?;
        let ring_correction = report.value(&fields::HCAL_RING_DIR_CORRECTION)?;
        ensure!(
            ring_correction > 0.0,
            "ring mean direction correction is non-positive ({ring_correction})"
        );
        let correction_ratio = endcap_correction / ring_correction;

        let endcap_mip = self.digitizer_mip(marlin, &self.config.endcap_digitizer)?;
        let ring_mip = self.digitizer_mip(marlin, &self.config.ring_digitizer)?;
        ensure!(ring_mip > 0.0, "ring mip is non-positive ({ring_mip})");
        let mip_ratio = endcap_mip / ring_mip;

        let ring_factors: Vec<f64> = endcap_factors
            .iter()
            .map(|factor| correction_ratio * mip_ratio * factor * self.ring_geometry_factor)
            .collect();
        log::info!("hcal ring factors: [{}]", join_values(&ring_factors));
        Ok(ring_factors)
    }
}
