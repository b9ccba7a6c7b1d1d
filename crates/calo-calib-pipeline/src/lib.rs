//! The calibration pipeline: external-tool adapters, the iterative
//! convergence engine, the calibration stages and the manager that
//! sequences them.
//!
//! A pipeline run looks like this:
//!
//! ```no_run
//! use calo_calib_core::CalibrationDocument;
//! use calo_calib_pipeline::{CalibrationManager, RunOptions};
//! use calo_calib_pipeline::steps::{MipScaleConfig, MipScaleStep};
//! # fn main() -> anyhow::Result<()> {
//! let mut manager = CalibrationManager::new();
//! manager.add_step(Box::new(MipScaleStep::new(MipScaleConfig::default())));
//!
//! let mut document = CalibrationDocument::load("calibration.xml")?;
//! let options = RunOptions::default();
//! manager.select_range(0, None)?;
//! manager.execute(&options, &mut document, "calibration.xml".as_ref())?;
//! # Ok(())
//! # }
//! ```
//!
//! Each step loads its inputs from the shared [`CalibrationDocument`],
//! drives zero or more convergence loops (two external-process calls per
//! iteration: reconstruction, then analysis extraction) and commits its
//! converged constants back into the document. The first failure anywhere
//! aborts the remaining steps and the partial document is flushed to a
//! distinguished failure file.
//!
//! [`CalibrationDocument`]: calo_calib_core::CalibrationDocument

/// Analysis-binary adapter.
pub mod analysis;
/// The iterative rescaling engine.
pub mod convergence;
/// Pipeline manager.
pub mod manager;
/// Reconstruction-engine adapter.
pub mod marlin;
/// Command-line value store and per-step argument contract.
pub mod options;
/// Pandora settings variants.
pub mod pandora;
/// Bounded parallel batch runner.
pub mod parallel;
/// The step abstraction.
pub mod step;
/// Concrete calibration stages.
pub mod steps;

pub use analysis::AnalysisTool;
pub use convergence::{converge, IterationDriver, Track};
pub use manager::{failure_document_path, CalibrationManager, FAILURE_DOCUMENT};
pub use marlin::Marlin;
pub use options::{RequiredArg, RunOptions};
pub use pandora::PandoraSettings;
pub use step::CalibrationStep;
