//! Flat-field (lens-shading) calibration loop.
//!
//! The sensor must be looking at as uniform a scene as can be arranged (blank slide,
//! diffuser, no sample). That precondition is not checked.
//!
//! Each iteration captures with the current table applied, measures the mean of every
//! region, and stops if the relative spread `(max - min) / target` is within tolerance.
//! Otherwise each factor is pulled towards `target / mean` and clamped. The target is
//! the mean of the brightest `brightest_fraction` of regions, so the brightest area is
//! never amplified into saturation.
//!
//! With `per_channel` set, the table carries one plane per colour channel and every
//! channel is measured and corrected on its own; the loop converges once the least
//! uniform channel is within tolerance.
//!
//! The stage is never touched.

use crate::calibration::{GainClamp, GainTable};
use crate::error::{AppResult, MicroscopeError};
use crate::hardware::{CaptureSettings, Sensor};
use ndarray::{Array3, Axis as NdAxis};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Colour planes in a per-channel table.
pub const COLOUR_CHANNELS: usize = 3;

/// Flat-field loop parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlatFieldConfig {
    /// Converged once `(max - min) / target` is at or below this
    pub uniformity_tolerance: f64,
    /// Iteration cap used by [`FlatFieldCalibrator::run`]
    pub max_iterations: usize,
    /// Region edge length in sensor pixels
    pub bin_size: usize,
    /// Lower clamp on every correction factor
    pub min_gain: f64,
    /// Upper clamp on every correction factor
    pub max_gain: f64,
    /// Share of regions (brightest first) averaged into the target
    pub brightest_fraction: f64,
    /// Exponent on `target / mean`; below one applies only part of each correction
    pub damping: f64,
    /// Captures averaged per iteration
    pub frames_to_average: usize,
    /// Correct each colour channel with its own table plane
    pub per_channel: bool,
}

impl Default for FlatFieldConfig {
    fn default() -> Self {
        Self {
            uniformity_tolerance: 0.05,
            max_iterations: 10,
            bin_size: 16,
            min_gain: 0.1,
            max_gain: 10.0,
            brightest_fraction: 0.1,
            damping: 1.0,
            frames_to_average: 1,
            per_channel: false,
        }
    }
}

impl FlatFieldConfig {
    /// Factor limits as a [`GainClamp`].
    pub fn clamp(&self) -> GainClamp {
        GainClamp {
            min: self.min_gain,
            max: self.max_gain,
        }
    }
}

/// Measurements taken in one iteration, before correction.
///
/// For a per-channel table these are the figures of the least uniform channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationIteration {
    /// 1-based
    pub iteration: usize,
    /// Level the regions are pulled towards
    pub target: f64,
    /// Dimmest region mean
    pub min_mean: f64,
    /// Brightest region mean
    pub max_mean: f64,
    /// `(max_mean - min_mean) / target`
    pub spread: f64,
}

/// Runs the flat-field feedback loop against a sensor.
///
/// # Example
///
/// ```rust,ignore
/// let table = FlatFieldCalibrator::new(&mut sensor).calibrate(0.02, 8)?;
/// let settings = CaptureSettings::default().with_gain_table(table);
/// ```
pub struct FlatFieldCalibrator<'a, C: Sensor + ?Sized> {
    sensor: &'a mut C,
    config: FlatFieldConfig,
    capture: CaptureSettings,
    initial: Option<GainTable>,
    working: GainTable,
    history: Vec<CalibrationIteration>,
}

impl<'a, C: Sensor + ?Sized> FlatFieldCalibrator<'a, C> {
    /// Calibrator with the default configuration and a neutral starting table.
    pub fn new(sensor: &'a mut C) -> Self {
        let config = FlatFieldConfig::default();
        let (width, height) = sensor.resolution();
        let working = GainTable::for_sensor(width, height, config.bin_size);
        Self {
            sensor,
            config,
            capture: CaptureSettings::default(),
            initial: None,
            working,
            history: Vec::new(),
        }
    }

    /// Replace the configuration; the working table is reset to neutral.
    pub fn with_config(mut self, config: FlatFieldConfig) -> Self {
        self.config = config;
        self.working = self.neutral_table();
        self
    }

    /// Exposure, gain and white balance to calibrate under. Any table or region in
    /// `capture` is ignored.
    pub fn with_capture_settings(mut self, capture: CaptureSettings) -> Self {
        self.capture = CaptureSettings {
            region: None,
            ..capture.without_gain_table()
        };
        self
    }

    /// Start from `table` instead of neutral, e.g. to resume a saved calibration.
    pub fn with_initial_table(mut self, table: GainTable) -> Self {
        self.initial = Some(table);
        self
    }

    /// Per-iteration measurements of the last run.
    pub fn history(&self) -> &[CalibrationIteration] {
        &self.history
    }

    /// Table the loop is currently holding: the converged table after success,
    /// neutral after a failed run.
    pub fn working_table(&self) -> &GainTable {
        &self.working
    }

    /// Run with the configured tolerance and iteration cap.
    pub fn run(&mut self) -> AppResult<GainTable> {
        self.calibrate(self.config.uniformity_tolerance, self.config.max_iterations)
    }

    /// Iterate until the region spread is within `uniformity_tolerance`.
    ///
    /// Returns [`MicroscopeError::CalibrationDidNotConverge`] with the lowest-spread
    /// table seen if `max_iterations` pass without converging.
    pub fn calibrate(
        &mut self,
        uniformity_tolerance: f64,
        max_iterations: usize,
    ) -> AppResult<GainTable> {
        if max_iterations == 0 {
            return Err(MicroscopeError::Configuration(
                "calibration needs at least one iteration".to_string(),
            ));
        }
        if uniformity_tolerance.is_nan() || uniformity_tolerance < 0.0 {
            return Err(MicroscopeError::Configuration(format!(
                "uniformity tolerance must be non-negative, got {uniformity_tolerance}"
            )));
        }

        self.history.clear();
        self.working = self.starting_table();
        let clamp = self.config.clamp();
        let mut best: Option<(GainTable, f64)> = None;
        info!(
            rows = self.working.rows(),
            cols = self.working.cols(),
            planes = self.working.planes(),
            tolerance = uniformity_tolerance,
            max_iterations,
            "FlatField: starting calibration"
        );

        for iteration in 1..=max_iterations {
            let means = self.measure()?;
            let targets: Vec<f64> = means
                .axis_iter(NdAxis(0))
                .map(|plane| brightest_target(&plane, self.config.brightest_fraction))
                .collect();
            let (target, min_mean, max_mean, spread) = least_uniform(&means, &targets);
            self.history.push(CalibrationIteration {
                iteration,
                target,
                min_mean,
                max_mean,
                spread,
            });
            debug!(iteration, target, min_mean, max_mean, spread, "FlatField: measured");

            if best.as_ref().map_or(true, |(_, s)| spread < *s) {
                best = Some((self.working.clone(), spread));
            }
            if spread <= uniformity_tolerance {
                info!(iteration, spread, "FlatField: converged");
                return Ok(self.working.clone());
            }
            self.working = self
                .working
                .corrected(&means, &targets, clamp, self.config.damping);
        }

        let improving = still_improving(&self.history);
        self.working = self.neutral_table();
        let (best_table, best_spread) = match best {
            Some(best) => best,
            None => (self.neutral_table(), f64::INFINITY),
        };
        warn!(max_iterations, best_spread, improving, "FlatField: did not converge");
        Err(MicroscopeError::CalibrationDidNotConverge {
            best_table: Box::new(best_table),
            best_spread,
            iterations: max_iterations,
            improving,
        })
    }

    /// Region means with the working table applied, averaged over several captures.
    fn measure(&mut self) -> AppResult<Array3<f64>> {
        let settings = self.capture.with_gain_table(self.working.clone());
        let frames = self.config.frames_to_average.max(1);
        let mut total = Array3::<f64>::zeros(self.working.shape());
        for _ in 0..frames {
            let frame = self.sensor.capture(&settings)?;
            total += &self.working.region_means(&frame);
        }
        Ok(total / frames as f64)
    }

    fn neutral_table(&self) -> GainTable {
        let (width, height) = self.sensor.resolution();
        let planes = if self.config.per_channel { COLOUR_CHANNELS } else { 1 };
        GainTable::for_sensor_per_channel(width, height, self.config.bin_size, planes)
    }

    fn starting_table(&self) -> GainTable {
        let neutral = self.neutral_table();
        match &self.initial {
            Some(table) if table.shape() == neutral.shape() => table.clone(),
            Some(table) => {
                warn!(
                    rows = table.rows(),
                    cols = table.cols(),
                    planes = table.planes(),
                    "FlatField: initial table does not fit the sensor, starting from neutral"
                );
                neutral
            }
            None => neutral,
        }
    }
}

/// Mean of the brightest `ceil(fraction * n)` regions (at least one).
pub fn brightest_target<'m>(means: impl IntoIterator<Item = &'m f64>, fraction: f64) -> f64 {
    let mut sorted: Vec<f64> = means.into_iter().copied().collect();
    if sorted.is_empty() {
        return 0.0;
    }
    sorted.sort_by(|a, b| b.total_cmp(a));
    let count = ((fraction * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
    sorted[..count].iter().sum::<f64>() / count as f64
}

fn extremes<'m>(means: impl IntoIterator<Item = &'m f64>) -> (f64, f64) {
    means
        .into_iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &m| {
            (lo.min(m), hi.max(m))
        })
}

/// `(target, min_mean, max_mean, spread)` of the plane with the largest spread.
fn least_uniform(means: &Array3<f64>, targets: &[f64]) -> (f64, f64, f64, f64) {
    let mut worst = (0.0, 0.0, 0.0, f64::NEG_INFINITY);
    for (plane, &target) in means.axis_iter(NdAxis(0)).zip(targets) {
        let (min_mean, max_mean) = extremes(&plane);
        let spread = if target > 0.0 {
            (max_mean - min_mean) / target
        } else {
            f64::INFINITY
        };
        if spread > worst.3 {
            worst = (target, min_mean, max_mean, spread);
        }
    }
    worst
}

/// Spread strictly decreased across the final three measurements.
fn still_improving(history: &[CalibrationIteration]) -> bool {
    let tail = &history[history.len().saturating_sub(3)..];
    tail.len() >= 2 && tail.windows(2).all(|w| w[1].spread < w[0].spread)
}
