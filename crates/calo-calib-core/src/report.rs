//! Extraction of values from the text reports written by the analysis
//! binaries.
//!
//! The binaries append a small fixed-format report; values are addressed
//! by line and token position. That coupling is brittle, so every position
//! the pipeline relies on is declared once here as a named [`ReportField`]
//! and the rest of the code never touches raw line numbers.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// A named value position inside an analysis report: 1-based line,
/// 0-based whitespace-separated token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportField {
    pub name: &'static str,
    pub line: usize,
    pub token: usize,
}

/// Positions of every report value consumed by the calibration stages.
pub mod fields {
    use super::ReportField;

    const fn field(name: &'static str, line: usize, token: usize) -> ReportField {
        ReportField { name, line, token }
    }

    // SimCaloHitEnergyDistribution
    pub const HCAL_BARREL_MIP: ReportField = field("hcalBarrelMip", 7, 5);
    pub const HCAL_ENDCAP_MIP: ReportField = field("hcalEndcapMip", 8, 5);
    pub const HCAL_RING_MIP: ReportField = field("hcalRingMip", 9, 5);
    pub const ECAL_MIP: ReportField = field("ecalMip", 10, 4);

    // ECalDigitisation_ContainedEvents
    pub const ECAL_DIGI_MEAN: ReportField = field("ecalDigiMean", 9, 4);

    // HCalDigitisation_ContainedEvents
    pub const HCAL_DIGI_MEAN: ReportField = field("hcalDigiMean", 9, 5);

    // HCalDigitisation_DirectionCorrectionDistribution
    pub const HCAL_ENDCAP_DIR_CORRECTION: ReportField = field("hcalEndcapDirCorrection", 4, 5);
    pub const HCAL_RING_DIR_CORRECTION: ReportField = field("hcalRingDirCorrection", 9, 5);

    // PandoraPFACalibrate_MipResponse
    pub const ECAL_TO_GEV_MIP: ReportField = field("ecalToGeVMip", 8, 2);
    pub const HCAL_TO_GEV_MIP: ReportField = field("hcalToGeVMip", 16, 2);
    pub const MUON_TO_GEV_MIP: ReportField = field("muonToGeVMip", 24, 2);

    // PandoraPFACalibrate_EMScale
    pub const ECAL_TO_EM_MEAN: ReportField = field("ecalToEMMean", 9, 3);

    // PandoraPFACalibrate_HadronicScale_ChiSquareMethod
    pub const ECAL_TO_HAD_MEAN: ReportField = field("ecalToHadMean", 5, 2);
    pub const HCAL_TO_HAD_MEAN: ReportField = field("hcalToHadMean", 6, 2);
}

/// An analysis report loaded into memory.
#[derive(Debug, Clone)]
pub struct Report {
    path: PathBuf,
    lines: Vec<String>,
}

impl Report {
    /// Load a report file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::parse(path, &content))
    }

    /// Build a report from raw text; `path` is only used in error messages.
    pub fn parse(path: impl Into<PathBuf>, content: &str) -> Self {
        Self {
            path: path.into(),
            lines: content.lines().map(str::to_string).collect(),
        }
    }

    /// Extract one named field.
    pub fn value(&self, field: &ReportField) -> Result<f64> {
        let token = self.token(field.line, field.token, field.name)?;
        token.parse().map_err(|_| self.error(format!(
            "field '{}': cannot parse '{token}' as a number (line {}, token {})",
            field.name, field.line, field.token
        )))
    }

    /// Extract `len` consecutive numbers starting at `token` of `line`.
    pub fn vector(&self, line: usize, token: usize, len: usize) -> Result<Vec<f64>> {
        (0..len)
            .map(|offset| {
                let raw = self.token(line, token + offset, "vector")?;
                raw.parse().map_err(|_| {
                    self.error(format!(
                        "cannot parse '{raw}' as a number (line {line}, token {})",
                        token + offset
                    ))
                })
            })
            .collect()
    }

    fn token(&self, line: usize, token: usize, name: &str) -> Result<&str> {
        let content = self
            .lines
            .get(line.wrapping_sub(1))
            .ok_or_else(|| self.error(format!("field '{name}': line {line} is missing")))?;
        content.split_whitespace().nth(token).ok_or_else(|| {
            self.error(format!(
                "field '{name}': line {line} has no token {token}: '{content}'"
            ))
        })
    }

    fn error(&self, detail: String) -> Error {
        Error::Report {
            path: self.path.clone(),
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Calibration of the simulated calorimeter response
-------------------------------------------------
For Muon energy = 10 GeV :
The true muon energy is : 10 GeV
-------------------------------------------------
-------------------------------------------------
HCAL Barrel mip: mean = 0.0004925 GeV
HCAL Endcap mip: mean = 0.0004725 GeV
HCAL Ring mip: mean = 0.0004825 GeV
ECAL mip: mean = 0.0001575 GeV
";

    #[test]
    fn extracts_named_fields() {
        let report = Report::parse("test.txt", SAMPLE);
        assert_eq!(report.value(&fields::HCAL_BARREL_MIP).unwrap(), 0.0004925);
        assert_eq!(report.value(&fields::HCAL_ENDCAP_MIP).unwrap(), 0.0004725);
        assert_eq!(report.value(&fields::HCAL_RING_MIP).unwrap(), 0.0004825);
        assert_eq!(report.value(&fields::ECAL_MIP).unwrap(), 0.0001575);
    }

    #[test]
    fn missing_line_is_an_error() {
        let report = Report::parse("short.txt", "only one line\n");
        let error = report.value(&fields::HCAL_BARREL_MIP).unwrap_err();
        assert!(error.to_string().contains("line 7 is missing"));
    }

    #[test]
    fn missing_token_is_an_error() {
        let report = Report::parse("test.txt", "a\nb\nc\nd\ne\nf\nshort line\n");
        let error = report.value(&fields::HCAL_BARREL_MIP).unwrap_err();
        assert!(error.to_string().contains("no token 5"));
    }

    #[test]
    fn non_numeric_token_is_an_error() {
        let sample = SAMPLE.replace("0.0004925", "nan-ish");
        let report = Report::parse("test.txt", &sample);
        let error = report.value(&fields::HCAL_BARREL_MIP).unwrap_err();
        assert!(error.to_string().contains("cannot parse 'nan-ish'"));
    }

    #[test]
    fn extracts_vectors() {
        let report = Report::parse(
            "weights.txt",
            "software compensation weights\nweights: 1.6 -0.07 0.0007 -0.04 0.0009 -9e-05 0.16 0.26 1.4\n",
        );
        let weights = report.vector(2, 1, 9).unwrap();
        assert_eq!(weights.len(), 9);
        assert_eq!(weights[0], 1.6);
        assert_eq!(weights[8], 1.4);
    }
}
