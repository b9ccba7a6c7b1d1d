//! Pandora hadronic-scale calibration.
//!
//! Two independent tracks converge against the injected neutral-kaon
//! energy from the same reconstruction per iteration: the ecal track
//! carries the (barrel, endcap) constant pair, the hcal track a single
//! constant, each with its own accuracy target. As in the EM-scale stage
//! the Pandora settings run without hadronic energy corrections.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use calo_calib_core::report::fields;
use calo_calib_core::{CalibrationDocument, IterationRecord};
use tempfile::NamedTempFile;

use crate::analysis::AnalysisTool;
use crate::convergence::{converge, IterationDriver, Track};
use crate::marlin::Marlin;
use crate::options::{RequiredArg, RunOptions};
use crate::pandora::PandoraSettings;
use crate::step::{capitalize, CalibrationStep};

use super::{reconstruction_from_options, PANDORA_PROCESSOR, PFO_ANALYSIS_PROCESSOR};

const ECAL_BARREL_PARAMETER: &str = "ECalToHadGeVCalibrationBarrel";
const ECAL_ENDCAP_PARAMETER: &str = "ECalToHadGeVCalibrationEndCap";
const HCAL_PARAMETER: &str = "HCalToHadGeVCalibration";

/// Processor bindings for the hadronic-scale calibration.
#[derive(Debug, Clone)]
pub struct HadScaleConfig {
    pub pandora_processor: String,
    pub pfo_analysis_processor: String,
    /// Processors left active for the reconstruction passes; empty means
    /// the full chain.
    pub run_processors: Vec<String>,
    pub output_prefix: String,
}

impl Default for HadScaleConfig {
    fn default() -> Self {
        Self {
            pandora_processor: PANDORA_PROCESSOR.into(),
            pfo_analysis_processor: PFO_ANALYSIS_PROCESSOR.into(),
            run_processors: Vec::new(),
            output_prefix: "./PandoraHadScale_".into(),
        }
    }
}

#[derive(Debug, Clone)]
struct HadScaleOutput {
    ecal_barrel: f64,
    ecal_endcap: f64,
    hcal: f64,
}

/// The Pandora hadronic-scale stage.
pub struct HadScaleStep {
    config: HadScaleConfig,
    dependencies: Vec<String>,
    marlin: Option<Marlin>,
    analysis_dir: Option<PathBuf>,
    settings_file: Option<NamedTempFile>,
    max_iterations: usize,
    ecal_accuracy: f64,
    hcal_accuracy: f64,
    kaon_energy: f64,
    initial_ecal: Vec<f64>,
    initial_hcal: f64,
    output: Option<HadScaleOutput>,
}

impl HadScaleStep {
    pub const NAME: &'static str = "PandoraHadScale";

    pub fn new(config: HadScaleConfig) -> Self {
        Self {
            config,
            dependencies: Vec::new(),
            marlin: None,
            analysis_dir: None,
            settings_file: None,
            max_iterations: 5,
            ecal_accuracy: 0.01,
            hcal_accuracy: 0.01,
            kaon_energy: 20.0,
            initial_ecal: Vec::new(),
            initial_hcal: 0.0,
            output: None,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

struct HadScaleDriver<'a> {
    config: &'a HadScaleConfig,
    marlin: &'a mut Marlin,
    document: &'a mut CalibrationDocument,
    analysis_dir: &'a Path,
    kaon_energy: f64,
}

impl IterationDriver for HadScaleDriver<'_> {
    fn apply_and_run(&mut self, iteration: usize, tracks: &[Track]) -> Result<PathBuf> {
        for track in tracks {
            match track.name() {
                "ecal" => {
                    let constants = track.constants();
                    self.marlin.set_processor_parameter(
                        &self.config.pandora_processor,
                        ECAL_BARREL_PARAMETER,
                        constants[0],
                    )?;
                    self.marlin.set_processor_parameter(
                        &self.config.pandora_processor,
                        ECAL_ENDCAP_PARAMETER,
                        constants[1],
                    )?;
                }
                "hcal" => {
                    self.marlin.set_processor_parameter(
                        &self.config.pandora_processor,
                        HCAL_PARAMETER,
                        track.constants()[0],
                    )?;
                }
                other => bail!("unknown hadronic-scale track '{other}'"),
            }
        }
        let output = format!("./PfoAnalysis_{}_iter{iteration}.root", HadScaleStep::NAME);
        self.marlin.set_processor_parameter(
            &self.config.pfo_analysis_processor,
            "RootFile",
            &output,
        )?;
        self.marlin.run()?;
        Ok(PathBuf::from(output))
    }

    fn measure(&mut self, run_output: &Path, track: &Track) -> Result<f64> {
        let mut extractor = AnalysisTool::new(
            self.analysis_dir,
            "PandoraPFACalibrate_HadronicScale_ChiSquareMethod",
            "-d",
            &self.config.output_prefix,
        );
        extractor.set_argument("-a", run_output.display());
        extractor.set_argument("-b", self.kaon_energy);
        let report = extractor.run()?;
        let field = match track.name() {
            "ecal" => &fields::ECAL_TO_HAD_MEAN,
            "hcal" => &fields::HCAL_TO_HAD_MEAN,
            other => bail!("unknown hadronic-scale track '{other}'"),
        };
        Ok(report.value(field)?)
    }

    fn checkpoint(&mut self, iteration: usize, tracks: &[Track]) -> Result<()> {
        let mut record = IterationRecord::new(iteration);
        for track in tracks {
            let name = track.name();
            record = record
                .with_field(format!("{name}Precision"), track.precision())
                .with_field(format!("{name}Rescale"), track.rescale())
                .with_field(
                    format!("new{}Kaon0LEnergy", capitalize(name)),
                    track.measured(),
                );
        }
        self.document
            .step_entry(HadScaleStep::NAME)
            .push_iteration(record);
        Ok(())
    }
}

impl CalibrationStep for HadScaleStep {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> String {
        "Converge the Pandora hadronic-scale constants of the ecal and the hcal \
         against the injected neutral-kaon energy; outputs the \
         ECalToHadGeVCalibration pair and HCalToHadGeVCalibration"
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
        let mut marlin = reconstruction_from_options(options, &options.kaon0l_files)?;

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
        self.ecal_accuracy = options.ecal_accuracy;
        self.hcal_accuracy = options.hcal_accuracy;
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
        let read = |parameter: &str| -> Result<f64> {
            marlin
                .processor_parameter(&self.config.pandora_processor, parameter)?
                .trim()
                .parse()
                .with_context(|| format!("bad {parameter} starting value"))
        };
        self.initial_ecal = vec![read(ECAL_BARREL_PARAMETER)?, read(ECAL_ENDCAP_PARAMETER)?];
        self.initial_hcal = read(HCAL_PARAMETER)?;
        Ok(())
    }

    fn run(&mut self, document: &mut CalibrationDocument) -> Result<()> {
        let marlin = self.marlin.as_mut().context("command line not read")?;
        let analysis_dir = self.analysis_dir.as_deref().context("command line not read")?;

        let mut tracks = vec![
            Track::new(
                "ecal",
                self.initial_ecal.clone(),
                self.kaon_energy,
                self.ecal_accuracy,
            )?,
            Track::new(
                "hcal",
                vec![self.initial_hcal],
                self.kaon_energy,
                self.hcal_accuracy,
            )?,
        ];
        let mut driver = HadScaleDriver {
            config: &self.config,
            marlin,
            document,
            analysis_dir,
            kaon_energy: self.kaon_energy,
        };
        converge(Self::NAME, self.max_iterations, &mut tracks, &mut driver)?;

        let ecal = tracks[0].constants();
        self.output = Some(HadScaleOutput {
            ecal_barrel: ecal[0],
            ecal_endcap: ecal[1],
            hcal: tracks[1].constants()[0],
        });
        Ok(())
    }

    fn write_output(&self, document: &mut CalibrationDocument) -> Result<()> {
        let converged = self.output.as_ref().context("step has not converged")?;
        let output = document.step_entry(Self::NAME).output_mut();
        output.set_processor(
            &self.config.pandora_processor,
            ECAL_BARREL_PARAMETER,
            converged.ecal_barrel,
        );
        output.set_processor(
            &self.config.pandora_processor,
            ECAL_ENDCAP_PARAMETER,
            converged.ecal_endcap,
        );
        output.set_processor(&self.config.pandora_processor, HCAL_PARAMETER, converged.hcal);
        Ok(())
    }
}
