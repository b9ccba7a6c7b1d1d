//! Concrete calibration stages.
//!
//! Every stage is one parameterized type holding a small configuration
//! struct (processor-name bindings, region names, angular cuts) instead
//! of a subclass per detector flavor; alternative implementations of the
//! same physical quantity are grouped under a [`SwitchStep`].

mod ecal_energy;
mod em_scale;
mod had_scale;
mod hcal_energy;
mod mip_scale;
mod pandora_mip_scale;
mod soft_comp;
mod switch;

pub use ecal_energy::{EcalEnergyConfig, EcalEnergyStep};
pub use em_scale::{EmScaleConfig, EmScaleStep};
pub use had_scale::{HadScaleConfig, HadScaleStep};
pub use hcal_energy::{HcalEnergyConfig, HcalEnergyStep};
pub use mip_scale::{MipScaleConfig, MipScaleStep};
pub use pandora_mip_scale::{PandoraMipScaleConfig, PandoraMipScaleStep};
pub use soft_comp::{SoftCompConfig, SoftCompStep};
pub use switch::SwitchStep;

use anyhow::Result;

use crate::marlin::Marlin;
use crate::options::RunOptions;
use crate::step::expand_file_patterns;

/// Default Pandora processor name in the reconstruction chain.
pub(crate) const PANDORA_PROCESSOR: &str = "MyDDMarlinPandora";
/// Default particle-flow analysis processor name.
pub(crate) const PFO_ANALYSIS_PROCESSOR: &str = "MyPfoAnalysis";

/// Build a reconstruction instance the way every stage does it: steering
/// template, gear conversion, compact geometry, record bounds and the
/// expanded sample-file list.
pub(crate) fn reconstruction_from_options(
    options: &RunOptions,
    input_patterns: &[String],
) -> Result<Marlin> {
    let steering = options.require_steering()?;
    let compact = options.require_compact()?;

    let mut marlin = Marlin::from_steering_file(steering)?;
    marlin.set_gear_from_compact(compact)?;
    marlin.set_compact_file(compact)?;
    marlin.set_max_record_number(options.max_record_number);
    marlin.set_skip_events(options.skip_events);
    marlin.set_input_files(expand_file_patterns(input_patterns, Some("slcio"))?);
    Ok(marlin)
}
