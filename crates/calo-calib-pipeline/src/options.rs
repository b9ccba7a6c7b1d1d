//! Parsed command-line values shared by all steps, and the per-step
//! argument contract.
//!
//! Every value flag is optional at parse time. Before a run, the manager
//! unions the [`RequiredArg`] sets of the selected steps and rejects the
//! run with one error listing every missing flag, so the operator fixes
//! the command line once instead of flag by flag.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use calo_calib_core::Error;

/// Command-line values as seen by the steps.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub compact_file: Option<PathBuf>,
    pub steering_file: Option<PathBuf>,
    /// Install prefix of the analysis package (binaries under `bin/`).
    pub analysis_dir: Option<PathBuf>,
    pub max_record_number: u64,
    pub skip_events: u64,
    pub max_iterations: usize,
    pub ecal_accuracy: f64,
    pub hcal_accuracy: f64,
    /// Photon sample file patterns.
    pub photon_files: Vec<String>,
    /// Neutral-kaon sample file patterns.
    pub kaon0l_files: Vec<String>,
    /// Muon sample file patterns.
    pub muon_files: Vec<String>,
    /// Energy points for the software-compensation batch.
    pub energies: Vec<String>,
    /// LCIO file pattern with an `%{energy}` tag.
    pub lcio_file_pattern: Option<String>,
    /// ROOT file pattern with an `%{energy}` tag.
    pub root_file_pattern: Option<String>,
    pub max_parallel: usize,
    pub run_reconstruction: bool,
    pub run_minimizer: bool,
    /// Switch-step selections, step name → alternative index.
    pub selections: BTreeMap<String, usize>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            compact_file: None,
            steering_file: None,
            analysis_dir: None,
            max_record_number: 0,
            skip_events: 0,
            max_iterations: 5,
            ecal_accuracy: 0.01,
            hcal_accuracy: 0.01,
            photon_files: Vec::new(),
            kaon0l_files: Vec::new(),
            muon_files: Vec::new(),
            energies: Vec::new(),
            lcio_file_pattern: None,
            root_file_pattern: None,
            max_parallel: 1,
            run_reconstruction: true,
            run_minimizer: true,
            selections: BTreeMap::new(),
        }
    }
}

impl RunOptions {
    pub fn require_compact(&self) -> Result<&Path> {
        require(&self.compact_file, RequiredArg::CompactFile)
    }

    pub fn require_steering(&self) -> Result<&Path> {
        require(&self.steering_file, RequiredArg::SteeringFile)
    }

    pub fn require_analysis_dir(&self) -> Result<&Path> {
        require(&self.analysis_dir, RequiredArg::AnalysisDir)
    }

    pub fn require_lcio_pattern(&self) -> Result<&str> {
        require_str(&self.lcio_file_pattern, RequiredArg::LcioFilePattern)
    }

    pub fn require_root_pattern(&self) -> Result<&str> {
        require_str(&self.root_file_pattern, RequiredArg::RootFilePattern)
    }
}

fn require(value: &Option<PathBuf>, arg: RequiredArg) -> Result<&Path> {
    value.as_deref().ok_or_else(|| missing(arg))
}

fn require_str(value: &Option<String>, arg: RequiredArg) -> Result<&str> {
    value.as_deref().ok_or_else(|| missing(arg))
}

fn missing(arg: RequiredArg) -> anyhow::Error {
    Error::MissingArguments {
        flags: vec![arg.flag().to_string()],
    }
    .into()
}

/// A command-line value a step declares as mandatory. Only values without
/// a usable default appear here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RequiredArg {
    CompactFile,
    SteeringFile,
    AnalysisDir,
    PhotonFiles,
    Kaon0LFiles,
    MuonFiles,
    Energies,
    LcioFilePattern,
    RootFilePattern,
}

impl RequiredArg {
    /// The command-line flag satisfying this requirement.
    pub fn flag(self) -> &'static str {
        match self {
            Self::CompactFile => "--compact-file",
            Self::SteeringFile => "--steering-file",
            Self::AnalysisDir => "--analysis-dir",
            Self::PhotonFiles => "--lcio-photon-file",
            Self::Kaon0LFiles => "--lcio-kaon0l-file",
            Self::MuonFiles => "--lcio-muon-file",
            Self::Energies => "--energies",
            Self::LcioFilePattern => "--lcio-file-pattern",
            Self::RootFilePattern => "--root-file-pattern",
        }
    }

    /// Whether the options carry a value for this requirement.
    pub fn is_provided(self, options: &RunOptions) -> bool {
        match self {
            Self::CompactFile => options.compact_file.is_some(),
            Self::SteeringFile => options.steering_file.is_some(),
            Self::AnalysisDir => options.analysis_dir.is_some(),
            Self::PhotonFiles => !options.photon_files.is_empty(),
            Self::Kaon0LFiles => !options.kaon0l_files.is_empty(),
            Self::MuonFiles => !options.muon_files.is_empty(),
            Self::Energies => !options.energies.is_empty(),
            Self::LcioFilePattern => options.lcio_file_pattern.is_some(),
            Self::RootFilePattern => options.root_file_pattern.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let options = RunOptions::default();
        assert_eq!(options.max_iterations, 5);
        assert_eq!(options.ecal_accuracy, 0.01);
        assert_eq!(options.hcal_accuracy, 0.01);
        assert_eq!(options.max_parallel, 1);
        assert!(options.run_reconstruction);
        assert!(options.run_minimizer);
    }

    #[test]
    fn require_reports_the_flag() {
        let options = RunOptions::default();
        let error = options.require_compact().unwrap_err();
        assert!(error.to_string().contains("--compact-file"));
    }

    #[test]
    fn provided_flags_are_detected() {
        let mut options = RunOptions::default();
        assert!(!RequiredArg::MuonFiles.is_provided(&options));
        options.muon_files.push("muons-*.slcio".into());
        assert!(RequiredArg::MuonFiles.is_provided(&options));
    }
}
