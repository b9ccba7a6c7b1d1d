//! Core building blocks for the `calo-calib` pipeline.
//!
//! This crate contains:
//! - the XML-backed calibration document (`document`), the single ledger
//!   holding user inputs, per-step outputs and per-iteration diagnostics,
//! - named-field extraction over the positional text reports produced by
//!   the analysis binaries (`report`),
//! - the blocking external-process runner (`process`),
//! - a small owned XML element tree shared by every XML dialect the
//!   pipeline touches (`xml`).

/// Calibration document model and (de)serialization.
pub mod document;
/// Shared error taxonomy.
pub mod error;
/// External process runner.
pub mod process;
/// Positional text-report extraction.
pub mod report;
/// Owned XML element tree.
pub mod xml;

pub use document::{CalibrationDocument, IterationRecord, ParameterSet, StepRecord};
pub use error::{Error, Result};
pub use report::{Report, ReportField};
pub use xml::Element;
