//! End-to-end pipeline scenario with stubbed reconstruction/analysis:
//! a manager drives a convergence-loop stage over a real calibration
//! document, from input loading to persisted output.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use calo_calib_core::{CalibrationDocument, Error, IterationRecord};
use calo_calib_pipeline::{
    converge, failure_document_path, CalibrationManager, CalibrationStep, IterationDriver,
    RunOptions, Track,
};

/// A calibration stage whose "reconstruction + analysis" is a linear
/// detector-response stub: measured = 5 GeV per unit of the ecal
/// constant, true photon energy 10 GeV.
struct StubEcalStage {
    max_iterations: usize,
    accuracy: f64,
    initial_constant: f64,
    converged_constant: Option<f64>,
}

impl StubEcalStage {
    const NAME: &'static str = "EcalEnergy";

    fn new() -> Self {
        Self {
            max_iterations: 5,
            accuracy: 0.01,
            initial_constant: 0.0,
            converged_constant: None,
        }
    }
}

struct StubDriver<'a> {
    document: &'a mut CalibrationDocument,
    runs: usize,
}

impl IterationDriver for StubDriver<'_> {
    fn apply_and_run(&mut self, iteration: usize, _tracks: &[Track]) -> Result<PathBuf> {
        self.runs += 1;
        Ok(PathBuf::from(format!("stub_iter{iteration}.root")))
    }

    fn measure(&mut self, _run_output: &Path, track: &Track) -> Result<f64> {
        Ok(5.0 * track.constants()[0])
    }

    fn checkpoint(&mut self, iteration: usize, tracks: &[Track]) -> Result<()> {
        let track = &tracks[0];
        self.document.step_entry(StubEcalStage::NAME).push_iteration(
            IterationRecord::new(iteration)
                .with_field("precision", track.precision())
                .with_field("rescale", track.rescale())
                .with_field("newPhotonEnergy", track.measured()),
        );
        Ok(())
    }
}

impl CalibrationStep for StubEcalStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> String {
        "stubbed ecal energy stage".to_string()
    }

    fn read_cmd_line(&mut self, options: &RunOptions) -> Result<()> {
        self.max_iterations = options.max_iterations;
        self.accuracy = options.ecal_accuracy;
        Ok(())
    }

    fn init(&mut self, document: &mut CalibrationDocument) -> Result<()> {
        document.remove_step(Self::NAME);
        self.initial_constant = document.f64_from("ecalMip", None)?;
        Ok(())
    }

    fn run(&mut self, document: &mut CalibrationDocument) -> Result<()> {
        let mut tracks = vec![Track::new(
            "ecal",
            vec![self.initial_constant],
            10.0,
            self.accuracy,
        )?];
        let mut driver = StubDriver { document, runs: 0 };
        converge(Self::NAME, self.max_iterations, &mut tracks, &mut driver)?;
        self.converged_constant = Some(tracks[0].constants()[0]);
        Ok(())
    }

    fn write_output(&self, document: &mut CalibrationDocument) -> Result<()> {
        let constant = self.converged_constant.context("not converged")?;
        document
            .step_entry(Self::NAME)
            .output_mut()
            .set("ecalFactor", constant);
        Ok(())
    }
}

fn input_document() -> CalibrationDocument {
    CalibrationDocument::from_xml(
        "<calibration><input><ecalMip>1.0</ecalMip></input></calibration>",
    )
    .expect("valid input document")
}

#[test]
fn scenario_converges_and_persists() {
    let directory = tempfile::tempdir().unwrap();
    let output_path = directory.path().join("calibration.xml");

    let mut manager = CalibrationManager::new();
    manager.add_step(Box::new(StubEcalStage::new()));
    manager.select_range(0, None).unwrap();

    let options = RunOptions::default();
    let mut document = input_document();
    manager
        .execute(&options, &mut document, &output_path)
        .unwrap();

    let written = CalibrationDocument::load(&output_path).unwrap();
    let step = written.step("EcalEnergy").expect("step record");

    // Iteration 0: measured 5 GeV, rescale 2, precision 0.5.
    // Iteration 1: constant 2, measured 10 GeV, rescale 1, precision 0.
    let iterations = step.iterations();
    assert_eq!(iterations.len(), 2);
    assert_eq!(iterations[0].field("rescale"), Some(2.0));
    assert_eq!(iterations[0].field("precision"), Some(0.5));
    assert_eq!(iterations[0].field("newPhotonEnergy"), Some(5.0));
    assert_eq!(iterations[1].field("rescale"), Some(1.0));
    assert_eq!(iterations[1].field("precision"), Some(0.0));
    assert_eq!(iterations[1].field("newPhotonEnergy"), Some(10.0));

    assert_eq!(step.output().get("ecalFactor"), Some("2"));
}

#[test]
fn rerunning_replaces_the_step_record() {
    let mut manager = CalibrationManager::new();
    manager.add_step(Box::new(StubEcalStage::new()));

    let options = RunOptions::default();
    let mut document = input_document();
    manager.run(&options, &mut document).unwrap();
    manager.run(&options, &mut document).unwrap();

    let records: Vec<_> = document
        .steps()
        .iter()
        .filter(|step| step.name() == "EcalEnergy")
        .collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].iterations().len(), 2);
}

#[test]
fn write_output_twice_is_byte_identical() {
    let mut stage = StubEcalStage::new();
    let mut document = input_document();
    let options = RunOptions::default();
    stage.read_cmd_line(&options).unwrap();
    stage.init(&mut document).unwrap();
    stage.run(&mut document).unwrap();

    stage.write_output(&mut document).unwrap();
    let first = document.to_xml().unwrap();
    stage.write_output(&mut document).unwrap();
    let second = document.to_xml().unwrap();
    assert_eq!(first, second);
}

#[test]
fn missing_input_aborts_before_any_reconstruction() {
    let mut manager = CalibrationManager::new();
    manager.add_step(Box::new(StubEcalStage::new()));

    let options = RunOptions::default();
    // No ecalMip in the input section.
    let mut document = CalibrationDocument::new();
    let error = manager.run(&options, &mut document).unwrap_err();
    match error.downcast_ref::<Error>() {
        Some(Error::MissingParameter { name, .. }) => assert_eq!(name, "ecalMip"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn exhausted_loop_flushes_the_failure_document() {
    // A target precision no measurement can reach within the bound.
    struct NeverConverges;

    struct FlatDriver;
    impl IterationDriver for FlatDriver {
        fn apply_and_run(&mut self, iteration: usize, _tracks: &[Track]) -> Result<PathBuf> {
            Ok(PathBuf::from(format!("stub_iter{iteration}.root")))
        }
        fn measure(&mut self, _run_output: &Path, _track: &Track) -> Result<f64> {
            Ok(4.0)
        }
    }

    impl CalibrationStep for NeverConverges {
        fn name(&self) -> &str {
            "HcalEnergy"
        }
        fn description(&self) -> String {
            "never converges".to_string()
        }
        fn read_cmd_line(&mut self, _options: &RunOptions) -> Result<()> {
            Ok(())
        }
        fn init(&mut self, document: &mut CalibrationDocument) -> Result<()> {
            document.remove_step("HcalEnergy");
            Ok(())
        }
        fn run(&mut self, _document: &mut CalibrationDocument) -> Result<()> {
            let mut tracks = vec![Track::new("hcal", vec![1.0], 10.0, 0.01)?];
            converge("HcalEnergy", 3, &mut tracks, &mut FlatDriver)?;
            Ok(())
        }
        fn write_output(&self, _document: &mut CalibrationDocument) -> Result<()> {
            Ok(())
        }
    }

    let directory = tempfile::tempdir().unwrap();
    let output_path = directory.path().join("calibration.xml");

    let mut manager = CalibrationManager::new();
    manager.add_step(Box::new(StubEcalStage::new()));
    manager.add_step(Box::new(NeverConverges));

    let options = RunOptions::default();
    let mut document = input_document();
    let error = manager
        .execute(&options, &mut document, &output_path)
        .unwrap_err();
    assert!(matches!(
        error.downcast_ref::<Error>(),
        Some(Error::Convergence { iterations: 3, .. })
    ));

    // The partial document survived under the failure name, with the
    // first step's committed output intact.
    assert!(!output_path.exists());
    let recovered = CalibrationDocument::load(failure_document_path(&output_path)).unwrap();
    assert_eq!(
        recovered.step("EcalEnergy").unwrap().output().get("ecalFactor"),
        Some("2")
    );
    assert!(recovered.step("HcalEnergy").is_none());
}
