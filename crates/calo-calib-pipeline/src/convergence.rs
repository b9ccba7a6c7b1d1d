//! The iterative rescaling engine shared by every calibration stage.
//!
//! Each stage owns one or more calibration constants whose effect on the
//! reconstructed energy is, to first order, linear. The loop exploits
//! that: run the reconstruction with the current constants, measure the
//! physical quantity, rescale the constants by `true / measured`, and
//! repeat until the fractional precision `|1 - 1/rescale|` drops below
//! the target. Linearity is only approximate, so overshoot and
//! oscillation are possible; the iteration bound turns a non-converging
//! configuration into a hard [`Convergence`] error instead of an endless
//! run.
//!
//! A stage may calibrate several regions from the *same* reconstruction
//! output (e.g. barrel and endcap, separated by angular cuts). Each
//! region is a [`Track`]: once a track reaches its target precision it is
//! frozen (its constants are never rescaled again) while the shared
//! reconstruction keeps running until every track has converged.
//!
//! [`Convergence`]: calo_calib_core::Error::Convergence

use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Result};
use calo_calib_core::Error;

/// One independently converging set of constants.
#[derive(Debug, Clone)]
pub struct Track {
    name: String,
    constants: Vec<f64>,
    true_value: f64,
    target_precision: f64,
    rescale: f64,
    rescale_cumul: f64,
    precision: f64,
    measured: f64,
    converged: bool,
}

impl Track {
    /// Create a track from its initial constants, the known injected
    /// physical quantity and the target fractional precision.
    pub fn new(
        name: impl Into<String>,
        constants: Vec<f64>,
        true_value: f64,
        target_precision: f64,
    ) -> Result<Self> {
        let name = name.into();
        ensure!(!constants.is_empty(), "track '{name}': no initial constants");
        ensure!(
            true_value > 0.0,
            "track '{name}': true value must be positive, got {true_value}"
        );
        ensure!(
            target_precision > 0.0,
            "track '{name}': target precision must be positive, got {target_precision}"
        );
        Ok(Self {
            name,
            constants,
            true_value,
            target_precision,
            rescale: 1.0,
            rescale_cumul: 1.0,
            precision: 0.0,
            measured: 0.0,
            converged: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current constants; frozen once the track has converged.
    pub fn constants(&self) -> &[f64] {
        &self.constants
    }

    /// Rescale factor of the latest measurement.
    pub fn rescale(&self) -> f64 {
        self.rescale
    }

    /// Product of all rescale factors applied so far.
    pub fn rescale_cumul(&self) -> f64 {
        self.rescale_cumul
    }

    /// Fractional precision of the latest measurement.
    pub fn precision(&self) -> f64 {
        self.precision
    }

    /// Latest measured physical quantity.
    pub fn measured(&self) -> f64 {
        self.measured
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    pub fn target_precision(&self) -> f64 {
        self.target_precision
    }

    fn apply_rescale(&mut self) {
        for constant in &mut self.constants {
            *constant *= self.rescale;
        }
    }

    fn update(&mut self, measured: f64) -> Result<()> {
        if measured <= 0.0 {
            bail!(
                "track '{}': non-physical measurement {measured} (expected a positive energy)",
                self.name
            );
        }
        self.measured = measured;
        self.rescale = self.true_value / measured;
        self.rescale_cumul *= self.rescale;
        self.precision = (1.0 - 1.0 / self.rescale).abs();
        Ok(())
    }
}

/// What a stage plugs into the loop: how to apply the constants and run
/// the reconstruction, how to measure one track from the run output, and
/// how to checkpoint an iteration into the calibration document.
pub trait IterationDriver {
    /// Apply every track's current constants to the reconstruction
    /// configuration and run it once. Returns the produced output file.
    fn apply_and_run(&mut self, iteration: usize, tracks: &[Track]) -> Result<PathBuf>;

    /// Measure the physical quantity for `track` from the run output.
    fn measure(&mut self, run_output: &Path, track: &Track) -> Result<f64>;

    /// Record one iteration's diagnostics. Called after every track has
    /// been measured, before convergence is re-evaluated.
    fn checkpoint(&mut self, _iteration: usize, _tracks: &[Track]) -> Result<()> {
        Ok(())
    }
}

/// Run the convergence loop for `step` until every track reaches its
/// target precision. Returns the output file of the last reconstruction
/// run, for derived closed-form calibrations.
///
/// # Errors
///
/// [`Error::Convergence`] after exactly `max_iterations` iterations if
/// any track is still above its target precision, plus whatever the
/// driver's external calls surface.
pub fn converge(
    step: &str,
    max_iterations: usize,
    tracks: &mut [Track],
    driver: &mut dyn IterationDriver,
) -> Result<PathBuf> {
    ensure!(max_iterations > 0, "step '{step}': max iterations must be positive");
    ensure!(!tracks.is_empty(), "step '{step}': no tracks to calibrate");

    let mut last_output = PathBuf::new();
    for iteration in 0..max_iterations {
        // First iteration runs with the unmodified initial constants
        // (rescale starts at 1); converged tracks stay frozen.
        for track in tracks.iter_mut().filter(|track| !track.converged) {
            track.apply_rescale();
        }

        last_output = driver.apply_and_run(iteration, tracks)?;

        for index in 0..tracks.len() {
            if tracks[index].converged {
                continue;
            }
            let measured = driver.measure(&last_output, &tracks[index])?;
            tracks[index].update(measured)?;
        }

        driver.checkpoint(iteration, tracks)?;

        for track in tracks.iter_mut().filter(|track| !track.converged) {
            if track.precision < track.target_precision {
                log::info!(
                    "step '{step}': track '{}' reached precision {:.6} at iteration {iteration}",
                    track.name,
                    track.precision
                );
                track.converged = true;
            }
        }

        if tracks.iter().all(|track| track.converged) {
            return Ok(last_output);
        }
    }

    let worst = tracks
        .iter()
        .filter(|track| !track.converged)
        .map(|track| track.target_precision)
        .fold(f64::INFINITY, f64::min);
    Err(Error::Convergence {
        step: step.to_string(),
        target: worst,
        iterations: max_iterations,
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Synthetic driver: the measured quantity for a track is
    /// `response(constant)` as provided per track, and reconstruction
    /// invocations are counted.
    struct StubDriver<F: FnMut(&Track) -> f64> {
        runs: usize,
        measurements: Vec<(String, usize)>,
        response: F,
    }

    impl<F: FnMut(&Track) -> f64> StubDriver<F> {
        fn new(response: F) -> Self {
            Self {
                runs: 0,
                measurements: Vec::new(),
                response,
            }
        }
    }

    impl<F: FnMut(&Track) -> f64> IterationDriver for StubDriver<F> {
        fn apply_and_run(&mut self, iteration: usize, _tracks: &[Track]) -> Result<PathBuf> {
            self.runs += 1;
            Ok(PathBuf::from(format!("stub_iter{iteration}.root")))
        }

        fn measure(&mut self, _run_output: &Path, track: &Track) -> Result<f64> {
            self.measurements
                .push((track.name().to_string(), track.constants().len()));
            Ok((self.response)(track))
        }
    }

    #[test]
    fn perfect_response_converges_in_one_iteration() {
        // A detector that already measures the true value converges on
        // the first iteration regardless of how tight the target is.
        let mut tracks = vec![Track::new("ecal", vec![1.7], 10.0, 1e-9).unwrap()];
        let mut driver = StubDriver::new(|_| 10.0);
        converge("Test", 5, &mut tracks, &mut driver).unwrap();
        assert_eq!(driver.runs, 1);
        assert!(tracks[0].converged());
        assert_eq!(tracks[0].constants(), &[1.7]);
        assert_eq!(tracks[0].rescale(), 1.0);
        assert_eq!(tracks[0].precision(), 0.0);
    }

    #[test]
    fn linear_response_follows_the_textbook_scenario() {
        // Measured 5 GeV at constant 1, true value 10 GeV: iteration 0
        // rescales by 2 with precision 0.5, iteration 1 measures 10 GeV
        // and converges with the constant frozen at 2.
        let mut tracks = vec![Track::new("ecal", vec![1.0], 10.0, 0.01).unwrap()];
        let mut driver = StubDriver::new(|track| 5.0 * track.constants()[0]);
        converge("Test", 5, &mut tracks, &mut driver).unwrap();

        assert_eq!(driver.runs, 2);
        assert_eq!(tracks[0].constants(), &[2.0]);
        assert_eq!(tracks[0].measured(), 10.0);
        assert_eq!(tracks[0].rescale(), 1.0);
        assert_eq!(tracks[0].rescale_cumul(), 2.0);
        assert_eq!(tracks[0].precision(), 0.0);
    }

    #[test]
    fn exhaustion_runs_exactly_max_iterations() {
        // A measurement unrelated to the constants never converges.
        let mut tracks = vec![Track::new("ecal", vec![1.0], 10.0, 0.01).unwrap()];
        let mut driver = StubDriver::new(|_| 4.0);
        let error = converge("Test", 5, &mut tracks, &mut driver).unwrap_err();

        assert_eq!(driver.runs, 5);
        match error.downcast_ref::<Error>() {
            Some(Error::Convergence {
                step, iterations, ..
            }) => {
                assert_eq!(step, "Test");
                assert_eq!(*iterations, 5);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn converged_tracks_freeze_while_others_continue() {
        // Track "fast" converges at iteration 0; "slow" approaches the
        // true value over three iterations. The shared reconstruction
        // must run three times, and "fast" must never be rescaled or
        // measured again.
        let slow_measurements = [15.0, 18.0, 20.0];
        let mut tracks = vec![
            Track::new("fast", vec![3.0], 10.0, 0.01).unwrap(),
            Track::new("slow", vec![1.0], 20.0, 0.01).unwrap(),
        ];
        let mut iteration = 0usize;
        let mut driver = StubDriver::new(move |track| {
            if track.name() == "fast" {
                10.0
            } else {
                let measured = slow_measurements[iteration];
                iteration += 1;
                measured
            }
        });
        converge("Test", 5, &mut tracks, &mut driver).unwrap();

        assert_eq!(driver.runs, 3);
        assert_eq!(tracks[0].constants(), &[3.0]);
        assert!(tracks[0].converged());
        assert!(tracks[1].converged());
        // "fast" measured once, "slow" three times.
        let fast = driver.measurements.iter().filter(|(n, _)| n == "fast").count();
        let slow = driver.measurements.iter().filter(|(n, _)| n == "slow").count();
        assert_eq!(fast, 1);
        assert_eq!(slow, 3);
    }

    #[test]
    fn vector_constants_rescale_together() {
        let mut tracks = vec![Track::new("ecal", vec![40.0, 90.0], 10.0, 0.01).unwrap()];
        let mut driver = StubDriver::new(|track| 5.0 * track.constants()[0] / 40.0);
        converge("Test", 5, &mut tracks, &mut driver).unwrap();
        assert_eq!(tracks[0].constants(), &[80.0, 180.0]);
    }

    #[test]
    fn non_physical_measurement_is_an_error() {
        let mut tracks = vec![Track::new("ecal", vec![1.0], 10.0, 0.01).unwrap()];
        let mut driver = StubDriver::new(|_| 0.0);
        let error = converge("Test", 5, &mut tracks, &mut driver).unwrap_err();
        assert!(error.to_string().contains("non-physical measurement"));
    }

    #[test]
    fn invalid_track_parameters_are_rejected() {
        assert!(Track::new("x", vec![], 10.0, 0.01).is_err());
        assert!(Track::new("x", vec![1.0], 0.0, 0.01).is_err());
        assert!(Track::new("x", vec![1.0], 10.0, 0.0).is_err());
    }
}
