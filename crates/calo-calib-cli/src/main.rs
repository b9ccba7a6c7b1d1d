//! `calo-calibrate`: drive the full calorimeter calibration pipeline.

use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use calo_calib_core::CalibrationDocument;
use calo_calib_pipeline::steps::{
    EcalEnergyConfig, EcalEnergyStep, EmScaleConfig, EmScaleStep, HadScaleConfig, HadScaleStep,
    HcalEnergyConfig, HcalEnergyStep, MipScaleConfig, MipScaleStep, PandoraMipScaleConfig,
    PandoraMipScaleStep, SoftCompConfig, SoftCompStep,
};
use calo_calib_pipeline::{CalibrationManager, CalibrationStep, RunOptions};

/// Calibration runner for the simulation/reconstruction chain.
#[derive(Debug, Parser)]
#[command(author, version, about = "Iterative calorimeter calibration runner")]
struct Args {
    /// Print the registered steps and exit.
    #[arg(long)]
    show_steps: bool,

    /// The XML calibration document to read (and, by default, rewrite).
    #[arg(long)]
    input_calibration_file: Option<PathBuf>,

    /// Where to write the final document (defaults to the input file).
    #[arg(long)]
    output_calibration_file: Option<PathBuf>,

    /// Index of the first step to run.
    #[arg(long, default_value_t = 0)]
    start_step: usize,

    /// Index of the last step to run (clamped to the last registered
    /// step).
    #[arg(long)]
    end_step: Option<usize>,

    /// The compact detector description.
    #[arg(long)]
    compact_file: Option<PathBuf>,

    /// The reconstruction steering file.
    #[arg(long)]
    steering_file: Option<PathBuf>,

    /// Install prefix of the analysis package (binaries under bin/).
    #[arg(long)]
    analysis_dir: Option<PathBuf>,

    /// Maximum number of records to process per reconstruction (0 = all).
    #[arg(long, default_value_t = 0)]
    max_record_number: u64,

    /// Number of records to skip per reconstruction.
    #[arg(long, default_value_t = 0)]
    skip_events: u64,

    /// Iteration bound of every convergence loop.
    #[arg(long, default_value_t = 5)]
    max_iterations: usize,

    /// Target fractional precision for the ecal scales.
    #[arg(long, default_value_t = 0.01)]
    ecal_accuracy: f64,

    /// Target fractional precision for the hcal scales.
    #[arg(long, default_value_t = 0.01)]
    hcal_accuracy: f64,

    /// Photon sample file pattern(s).
    #[arg(long = "lcio-photon-file")]
    lcio_photon_file: Vec<String>,

    /// Neutral-kaon sample file pattern(s).
    #[arg(long = "lcio-kaon0l-file")]
    lcio_kaon0l_file: Vec<String>,

    /// Muon sample file pattern(s).
    #[arg(long = "lcio-muon-file")]
    lcio_muon_file: Vec<String>,

    /// Energy points for the software-compensation batch, in GeV
    /// (repeatable).
    #[arg(long)]
    energies: Vec<String>,

    /// LCIO file pattern with an %{energy} tag.
    #[arg(long)]
    lcio_file_pattern: Option<String>,

    /// ROOT file pattern with an %{energy} tag.
    #[arg(long)]
    root_file_pattern: Option<String>,

    /// Maximum number of parallel reconstruction processes.
    #[arg(long, default_value_t = 1)]
    max_parallel: usize,

    /// Skip the software-compensation reconstruction batch.
    #[arg(long)]
    no_reconstruction: bool,

    /// Skip the software-compensation minimizer.
    #[arg(long)]
    no_minimizer: bool,

    /// Switch-step selection, as NAME=INDEX (repeatable).
    #[arg(long = "select", value_parser = parse_selection)]
    select: Vec<(String, usize)>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write the log to a file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn parse_selection(raw: &str) -> Result<(String, usize), String> {
    let (name, index) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=INDEX, got '{raw}'"))?;
    let index = index
        .parse()
        .map_err(|_| format!("bad selection index '{index}' in '{raw}'"))?;
    Ok((name.to_string(), index))
}

/// Processors of the full reconstruction chain, for the stages that run
/// everything up to (but not including) particle flow.
fn digitization_chain() -> Vec<String> {
    [
        "MyAIDAProcessor",
        "InitDD4hep",
        "MyEcalBarrelDigi",
        "MyEcalBarrelReco",
        "MyEcalBarrelGapFiller",
        "MyEcalEndcapDigi",
        "MyEcalEndcapReco",
        "MyEcalEndcapGapFiller",
        "MyEcalRingDigi",
        "MyEcalRingReco",
        "MyHcalBarrelDigi",
        "MyHcalBarrelReco",
        "MyHcalEndcapDigi",
        "MyHcalEndcapReco",
        "MyHcalRingDigi",
        "MyHcalRingReco",
        "MySimpleBCalDigi",
        "MySimpleLCalDigi",
        "MySimpleLHCalDigi",
        "MySimpleMuonDigi",
        "MyPfoAnalysis",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Register the calibration stages in dependency order, each loading the
/// outputs of everything registered before it.
fn build_manager() -> CalibrationManager {
    let mut manager = CalibrationManager::new();
    let mut step_names: Vec<String> = Vec::new();

    let mip_scale = MipScaleStep::new(MipScaleConfig::default());
    step_names.push(mip_scale.name().to_string());
    manager.add_step(Box::new(mip_scale));

    let ecal_energy = EcalEnergyStep::new(EcalEnergyConfig {
        run_processors: digitization_chain(),
        ..EcalEnergyConfig::default()
    })
    .with_dependencies(step_names.clone());
    step_names.push(ecal_energy.name().to_string());
    manager.add_step(Box::new(ecal_energy));

    let hcal_energy = HcalEnergyStep::new(HcalEnergyConfig {
        run_processors: digitization_chain(),
        ..HcalEnergyConfig::default()
    })
    .with_dependencies(step_names.clone());
    step_names.push(hcal_energy.name().to_string());
    manager.add_step(Box::new(hcal_energy));

    let pandora_mip = PandoraMipScaleStep::new(PandoraMipScaleConfig {
        run_processors: digitization_chain(),
        ..PandoraMipScaleConfig::default()
    })
    .with_dependencies(step_names.clone());
    step_names.push(pandora_mip.name().to_string());
    manager.add_step(Box::new(pandora_mip));

    let em_scale = EmScaleStep::new(EmScaleConfig::default()).with_dependencies(step_names.clone());
    step_names.push(em_scale.name().to_string());
    manager.add_step(Box::new(em_scale));

    let had_scale =
        HadScaleStep::new(HadScaleConfig::default()).with_dependencies(step_names.clone());
    step_names.push(had_scale.name().to_string());
    manager.add_step(Box::new(had_scale));

    let soft_comp =
        SoftCompStep::new(SoftCompConfig::default()).with_dependencies(step_names.clone());
    manager.add_step(Box::new(soft_comp));

    manager
}

fn init_logging(args: &Args) -> Result<()> {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(args.log_level.clone()),
    );
    builder.format_timestamp_secs();
    if let Some(path) = &args.log_file {
        let file = File::create(path)
            .with_context(|| format!("creating log file '{}'", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder
        .try_init()
        .context("initializing the logging backend")?;
    Ok(())
}

fn run_options(args: &Args) -> RunOptions {
    RunOptions {
        compact_file: args.compact_file.clone(),
        steering_file: args.steering_file.clone(),
        analysis_dir: args.analysis_dir.clone(),
        max_record_number: args.max_record_number,
        skip_events: args.skip_events,
        max_iterations: args.max_iterations,
        ecal_accuracy: args.ecal_accuracy,
        hcal_accuracy: args.hcal_accuracy,
        photon_files: args.lcio_photon_file.clone(),
        kaon0l_files: args.lcio_kaon0l_file.clone(),
        muon_files: args.lcio_muon_file.clone(),
        energies: args.energies.clone(),
        lcio_file_pattern: args.lcio_file_pattern.clone(),
        root_file_pattern: args.root_file_pattern.clone(),
        max_parallel: args.max_parallel,
        run_reconstruction: !args.no_reconstruction,
        run_minimizer: !args.no_minimizer,
        selections: args.select.iter().cloned().collect(),
    }
}

fn try_main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let mut manager = build_manager();
    if args.show_steps {
        print!("{}", manager.describe_steps());
        return Ok(());
    }

    let input_path = args
        .input_calibration_file
        .clone()
        .context("--input-calibration-file is required")?;
    let output_path = args
        .output_calibration_file
        .clone()
        .unwrap_or_else(|| input_path.clone());

    let mut document = CalibrationDocument::load(&input_path)
        .with_context(|| format!("loading calibration document '{}'", input_path.display()))?;
    log::info!(
        "loaded calibration document '{}' ({} step records)",
        input_path.display(),
        document.steps().len()
    );

    manager.select_range(args.start_step, args.end_step)?;
    let options = run_options(&args);
    manager.execute(&options, &mut document, &output_path)
}

fn main() {
    if let Err(error) = try_main() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_parser() {
        assert_eq!(
            parse_selection("MipScale=1").unwrap(),
            ("MipScale".to_string(), 1)
        );
        assert!(parse_selection("MipScale").is_err());
        assert!(parse_selection("MipScale=x").is_err());
    }

    #[test]
    fn registered_pipeline_has_valid_dependencies() {
        let manager = build_manager();
        assert_eq!(manager.len(), 7);
        manager.validate_dependencies().unwrap();
    }

    #[test]
    fn listing_names_every_step() {
        let manager = build_manager();
        let listing = manager.describe_steps();
        for name in [
            "MipScale",
            "EcalEnergy",
            "HcalEnergy",
            "PandoraMipScale",
            "PandoraEMScale",
            "PandoraHadScale",
            "PandoraSoftComp",
        ] {
            assert!(listing.contains(name), "missing {name} in:\n{listing}");
        }
    }

    #[test]
    fn cli_arguments_parse() {
        let args = Args::parse_from([
            "calo-calibrate",
            "--input-calibration-file",
            "calibration.xml",
            "--compact-file",
            "detector.xml",
            "--start-step",
            "1",
            "--end-step",
            "2",
            "--select",
            "MipScale=1",
            "--lcio-muon-file",
            "muons-*.slcio",
            "--lcio-muon-file",
            "more-muons-*.slcio",
        ]);
        assert_eq!(args.start_step, 1);
        assert_eq!(args.end_step, Some(2));
        assert_eq!(args.select, vec![("MipScale".to_string(), 1)]);
        assert_eq!(args.lcio_muon_file.len(), 2);
        let options = run_options(&args);
        assert_eq!(options.selections.get("MipScale"), Some(&1));
        assert!(options.run_reconstruction);
    }
}
