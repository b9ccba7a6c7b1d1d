//! Pandora software-compensation weight calibration.
//!
//! Not iterative. One reconstruction per configured energy point writes a
//! software-compensation training tree to a pre-assigned ROOT file; the
//! batch runs on a bounded worker pool since the instances are fully
//! independent. A single minimization binary then fits the nine
//! energy-density weights over the aggregated trees.
//!
//! The reconstruction batch and the minimizer can be skipped
//! individually, so an already-produced set of training files can be
//! re-minimized without re-running the chain.

use std::path::PathBuf;

use anyhow::{bail, ensure, Context, Result};
use calo_calib_core::CalibrationDocument;
use tempfile::NamedTempFile;

use crate::analysis::AnalysisTool;
use crate::marlin::Marlin;
use crate::options::{RequiredArg, RunOptions};
use crate::pandora::PandoraSettings;
use crate::parallel::run_batch;
use crate::step::{expand_file_patterns, join_values, CalibrationStep};

use super::{reconstruction_from_options, PANDORA_PROCESSOR, PFO_ANALYSIS_PROCESSOR};

const ENERGY_TAG: &str = "%{energy}";
/// Weight row of the minimizer report: nine tokens from token 1 of line 2.
const WEIGHTS_LINE: usize = 2;
const WEIGHTS_TOKEN: usize = 1;
const WEIGHTS_LEN: usize = 9;

/// Processor bindings for the software-compensation calibration.
#[derive(Debug, Clone)]
pub struct SoftCompConfig {
    pub pandora_processor: String,
    pub pfo_analysis_processor: String,
    pub training_tree: String,
    pub output_prefix: String,
}

impl Default for SoftCompConfig {
    fn default() -> Self {
        Self {
            pandora_processor: PANDORA_PROCESSOR.into(),
            pfo_analysis_processor: PFO_ANALYSIS_PROCESSOR.into(),
            training_tree: "SoftwareCompensationTrainingTree".into(),
            output_prefix: "./SoftComp_".into(),
        }
    }
}

/// The software-compensation stage.
pub struct SoftCompStep {
    config: SoftCompConfig,
    dependencies: Vec<String>,
    run_reconstruction: bool,
    run_minimizer: bool,
    energies: Vec<String>,
    root_pattern: Option<String>,
    max_parallel: usize,
    analysis_dir: Option<PathBuf>,
    reconstructions: Vec<Marlin>,
    // One rendered Pandora settings file per energy point, kept alive for
    // the whole batch.
    settings_files: Vec<NamedTempFile>,
    weights: Option<Vec<f64>>,
}

impl SoftCompStep {
    pub const NAME: &'static str = "PandoraSoftComp";

    pub fn new(config: SoftCompConfig) -> Self {
        Self {
            config,
            dependencies: Vec::new(),
            run_reconstruction: true,
            run_minimizer: true,
            energies: Vec::new(),
            root_pattern: None,
            max_parallel: 1,
            analysis_dir: None,
            reconstructions: Vec::new(),
            settings_files: Vec::new(),
            weights: None,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

impl CalibrationStep for SoftCompStep {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> String {
        "Run one reconstruction per energy point in a bounded parallel batch and \
         minimize the Pandora software-compensation energy-correction weights over \
         the aggregated training trees"
            .to_string()
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    fn required_args(&self) -> Vec<RequiredArg> {
        let mut required = vec![RequiredArg::Energies, RequiredArg::RootFilePattern];
        if self.run_reconstruction {
            required.extend([
                RequiredArg::CompactFile,
                RequiredArg::SteeringFile,
                RequiredArg::LcioFilePattern,
            ]);
        }
        if self.run_minimizer {
            required.push(RequiredArg::AnalysisDir);
        }
        required
    }

    fn prepare(&mut self, options: &RunOptions) -> Result<()> {
        self.run_reconstruction = options.run_reconstruction;
        self.run_minimizer = options.run_minimizer;
        if !self.run_reconstruction && !self.run_minimizer {
            bail!("both the reconstruction batch and the minimizer are disabled; nothing to run");
        }
        Ok(())
    }

    fn read_cmd_line(&mut self, options: &RunOptions) -> Result<()> {
        self.energies = options.energies.clone();
        self.max_parallel = options.max_parallel;

        let root_pattern = options.require_root_pattern()?;
        ensure!(
            root_pattern.contains(ENERGY_TAG),
            "root file pattern '{root_pattern}' has no '{ENERGY_TAG}' tag"
        );
        self.root_pattern = Some(root_pattern.to_string());

        if self.run_minimizer {
            self.analysis_dir = Some(options.require_analysis_dir()?.to_path_buf());
        }
        if !self.run_reconstruction {
            return Ok(());
        }

        let lcio_pattern = options.require_lcio_pattern()?;
        ensure!(
            lcio_pattern.contains(ENERGY_TAG),
            "lcio file pattern '{lcio_pattern}' has no '{ENERGY_TAG}' tag"
        );

        // One reconstruction instance per energy point, each with its own
        // sample files, training output and Pandora settings variant.
        let base = reconstruction_from_options(options, &[lcio_pattern.replace(ENERGY_TAG, "*")])?;
        let settings_path =
            base.processor_parameter(&self.config.pandora_processor, "PandoraSettingsXmlFile")?;

        self.reconstructions.clear();
        self.settings_files.clear();
        for energy in &self.energies {
            let lcio_files =
                expand_file_patterns(&[lcio_pattern.replace(ENERGY_TAG, energy)], Some("slcio"))
                    .with_context(|| format!("energy point {energy} GeV"))?;
            let root_file = root_pattern.replace(ENERGY_TAG, energy);

            let mut settings = PandoraSettings::load(settings_path.trim())?;
            settings.set_soft_comp_training(&root_file, &self.config.training_tree);
            let settings_file = settings.write_temp()?;

            let mut marlin = base.clone();
            marlin.set_input_files(lcio_files);
            marlin.set_processor_parameter(
                &self.config.pandora_processor,
                "PandoraSettingsXmlFile",
                settings_file.path().display(),
            )?;
            if marlin.has_processor_parameter(&self.config.pfo_analysis_processor, "RootFile") {
                let analysis_output = format!(
                    "{}_PfoAnalysis.root",
                    root_file.trim_end_matches(".root")
                );
                marlin.set_processor_parameter(
                    &self.config.pfo_analysis_processor,
                    "RootFile",
                    analysis_output,
                )?;
            }
            self.reconstructions.push(marlin);
            self.settings_files.push(settings_file);
        }
        Ok(())
    }

    fn init(&mut self, document: &mut CalibrationDocument) -> Result<()> {
        document.remove_step(Self::NAME);
        for marlin in &mut self.reconstructions {
            marlin.load_input_parameters(document)?;
            for dependency in &self.dependencies {
                marlin.load_step_output(document, dependency)?;
            }
        }
        Ok(())
    }

    fn run(&mut self, _document: &mut CalibrationDocument) -> Result<()> {
        if self.run_reconstruction {
            log::info!(
                "running {} reconstruction instances, at most {} in parallel",
                self.reconstructions.len(),
                self.max_parallel
            );
            // Convert the geometry up front: the batch instances share
            // the gear file and must not race over its creation.
            if let Some(first) = self.reconstructions.first() {
                first.ensure_gear()?;
            }
            let jobs: Vec<_> = self
                .reconstructions
                .iter()
                .map(|marlin| move || marlin.run())
                .collect();
            run_batch(self.max_parallel, jobs)?;
        }

        if self.run_minimizer {
            let analysis_dir = self.analysis_dir.as_deref().context("command line not read")?;
            let root_pattern = self.root_pattern.as_deref().context("command line not read")?;
            let mut minimizer = AnalysisTool::new(
                analysis_dir,
                "PandoraPFACalibrate_SoftwareCompensation",
                "-d",
                &self.config.output_prefix,
            );
            minimizer.set_argument("-e", self.energies.join(":"));
            minimizer.set_argument("-f", root_pattern);
            minimizer.set_argument("-t", &self.config.training_tree);
            let report = minimizer.run()?;
            let weights = report.vector(WEIGHTS_LINE, WEIGHTS_TOKEN, WEIGHTS_LEN)?;
            log::info!("software compensation weights: [{}]", join_values(&weights));
            self.weights = Some(weights);
        }
        Ok(())
    }

    fn write_output(&self, document: &mut CalibrationDocument) -> Result<()> {
        // Without the minimizer there is nothing to commit; the training
        // files on disk are the only product.
        let Some(weights) = &self.weights else {
            return Ok(());
        };
        document.step_entry(Self::NAME).output_mut().set_processor(
            &self.config.pandora_processor,
            "SoftwareCompensationWeights",
            join_values(weights),
        );
        Ok(())
    }
}
