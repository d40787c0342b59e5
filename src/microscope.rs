//! Microscope façade.
//!
//! [`Microscope`] owns one stage and one sensor together with the capture settings
//! currently in force. Every engine run borrows the hardware for its duration, so
//! focus, calibration and scans never overlap.

use crate::calibration::exposure::{POST_CALIBRATION_PEAK, PRE_CALIBRATION_PEAK};
use crate::calibration::{
    auto_expose, white_balance, CalibrationIteration, FlatFieldCalibrator, FlatFieldConfig,
    GainTable,
};
use crate::config::{ControllerConfig, SimulationConfig};
use crate::core::{Axis, CancelToken, Position};
use crate::error::AppResult;
use crate::experiment::{AcquisitionResult, ScanConfig, ScanOrchestrator, ScanPlan};
use crate::focus::{AutofocusConfig, AutofocusEngine, FocusReport};
use crate::hardware::mock::{Shading, SimulatedSensor, SimulatedStage};
use crate::hardware::{CaptureSettings, ChannelGains, Frame, Sensor, Stage};
use crate::settings::MicroscopeSettings;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Iterations allowed for each auto-exposure pass.
const AUTO_EXPOSE_ITERATIONS: usize = 8;

/// Outcome of a full [`Microscope::calibrate`] run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    /// Converged flat-field table, now active
    pub table: GainTable,
    /// Per-iteration measurements of the flat-field loop
    pub history: Vec<CalibrationIteration>,
    /// Exposure after the final auto-exposure pass
    pub exposure_us: u32,
    /// White balance after shading correction
    pub channel_gains: ChannelGains,
}

impl CalibrationReport {
    /// Spread of the final flat-field measurement.
    pub fn final_spread(&self) -> Option<f64> {
        self.history.last().map(|it| it.spread)
    }
}

/// A stage, a sensor and the settings used to capture through them.
pub struct Microscope<S: Stage, C: Sensor> {
    stage: S,
    sensor: C,
    capture: CaptureSettings,
    autofocus: AutofocusConfig,
    calibration: FlatFieldConfig,
    scan: ScanConfig,
    cancel: CancelToken,
}

impl<S: Stage, C: Sensor> Microscope<S, C> {
    /// Microscope with default engine configuration.
    pub fn new(stage: S, sensor: C) -> Self {
        Self {
            stage,
            sensor,
            capture: CaptureSettings::default(),
            autofocus: AutofocusConfig::default(),
            calibration: FlatFieldConfig::default(),
            scan: ScanConfig::default(),
            cancel: CancelToken::new(),
        }
    }

    /// Microscope configured from the engine and capture sections of `config`.
    pub fn from_config(stage: S, sensor: C, config: &ControllerConfig) -> Self {
        Self {
            capture: config.capture.to_settings(),
            autofocus: config.autofocus.clone(),
            calibration: config.calibration.clone(),
            scan: config.scan.clone(),
            ..Self::new(stage, sensor)
        }
    }

    /// Start from `capture` instead of the configured settings.
    pub fn with_capture_settings(mut self, capture: CaptureSettings) -> Self {
        self.capture = capture;
        self
    }

    /// Token shared with every engine run; cancelling it stops the current run
    /// between steps.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Settings used for every capture, gain table included.
    pub fn capture_settings(&self) -> &CaptureSettings {
        &self.capture
    }

    /// Scan parameters from the configuration.
    pub fn scan_config(&self) -> &ScanConfig {
        &self.scan
    }

    /// The stage.
    pub fn stage(&self) -> &S {
        &self.stage
    }

    /// The stage, mutably.
    pub fn stage_mut(&mut self) -> &mut S {
        &mut self.stage
    }

    /// The sensor.
    pub fn sensor(&self) -> &C {
        &self.sensor
    }

    /// Hand back the hardware.
    pub fn into_parts(self) -> (S, C) {
        (self.stage, self.sensor)
    }

    /// Position the stage reports.
    pub fn position(&mut self) -> AppResult<Position> {
        Ok(self.stage.position()?)
    }

    /// One frame with the active settings.
    pub fn capture(&mut self) -> AppResult<Frame> {
        Ok(self.sensor.capture(&self.capture)?)
    }

    /// Autofocus on Z. Unset range or step fall back to the configured defaults.
    pub fn autofocus(&mut self, range: Option<u32>, step: Option<u32>) -> AppResult<FocusReport> {
        let range = range.unwrap_or(self.autofocus.default_range);
        let step = step.unwrap_or(self.autofocus.default_step);
        AutofocusEngine::new(&mut self.stage, &mut self.sensor)
            .with_config(self.autofocus.clone())
            .with_capture_settings(self.capture.clone())
            .with_cancel_token(self.cancel.clone())
            .search(Axis::Z, range, step)
    }

    /// Flat-field loop only. On success the table becomes active; on failure the
    /// active settings are untouched.
    ///
    /// An already active table of the right shape is used as the starting point.
    pub fn flat_field(
        &mut self,
        tolerance: f64,
        max_iterations: usize,
    ) -> AppResult<(GainTable, Vec<CalibrationIteration>)> {
        let mut calibrator = FlatFieldCalibrator::new(&mut self.sensor)
            .with_config(self.calibration.clone())
            .with_capture_settings(self.capture.clone());
        if let Some(table) = self.capture.gain_table.as_deref() {
            calibrator = calibrator.with_initial_table(table.clone());
        }
        let table = calibrator.calibrate(tolerance, max_iterations)?;
        let history = calibrator.history().to_vec();
        self.capture = self.capture.with_gain_table(table.clone());
        Ok((table, history))
    }

    /// Full illumination calibration:
    ///
    /// 1. expose for [`PRE_CALIBRATION_PEAK`] without correction
    /// 2. run the flat-field loop
    /// 3. white-balance the corrected image
    /// 4. expose again for [`POST_CALIBRATION_PEAK`]
    ///
    /// If any stage fails the previous capture settings are restored.
    pub fn calibrate(
        &mut self,
        tolerance: f64,
        max_iterations: usize,
    ) -> AppResult<CalibrationReport> {
        let previous = self.capture.clone();
        let report = self.calibrate_inner(tolerance, max_iterations);
        if report.is_err() {
            self.capture = previous;
        }
        report
    }

    fn calibrate_inner(
        &mut self,
        tolerance: f64,
        max_iterations: usize,
    ) -> AppResult<CalibrationReport> {
        let mut uncorrected = self.capture.without_gain_table();
        auto_expose(
            &mut self.sensor,
            &mut uncorrected,
            PRE_CALIBRATION_PEAK,
            AUTO_EXPOSE_ITERATIONS,
        )?;
        self.capture.exposure_us = uncorrected.exposure_us;

        let (table, history) = self.flat_field(tolerance, max_iterations)?;

        let frame = self.capture()?;
        self.capture.channel_gains = white_balance(&frame, self.capture.channel_gains)?;
        auto_expose(
            &mut self.sensor,
            &mut self.capture,
            POST_CALIBRATION_PEAK,
            AUTO_EXPOSE_ITERATIONS,
        )?;

        info!(
            iterations = history.len(),
            exposure_us = self.capture.exposure_us,
            red = self.capture.channel_gains.red,
            blue = self.capture.channel_gains.blue,
            "Microscope: calibration complete"
        );
        Ok(CalibrationReport {
            table,
            history,
            exposure_us: self.capture.exposure_us,
            channel_gains: self.capture.channel_gains,
        })
    }

    /// Run a scan plan with the active settings.
    pub fn run_plan(&mut self, plan: &ScanPlan) -> AppResult<AcquisitionResult> {
        ScanOrchestrator::new(&mut self.stage, &mut self.sensor)
            .with_autofocus_config(self.autofocus.clone())
            .with_capture_settings(self.capture.clone())
            .with_cancel_token(self.cancel.clone())
            .return_to_start(self.scan.return_to_start)
            .run(plan)
    }

    /// Snapshot of the settings worth persisting.
    pub fn settings(&self) -> MicroscopeSettings {
        MicroscopeSettings::from(&self.capture)
    }

    /// Make saved settings active. A table that does not fit the sensor is dropped by
    /// the next calibration run.
    pub fn apply_settings(&mut self, settings: &MicroscopeSettings) {
        settings.apply_to(&mut self.capture);
        info!(
            exposure_us = settings.exposure_us,
            calibrated = settings.gain_table.is_some(),
            "Microscope: settings applied"
        );
    }
}

impl Microscope<SimulatedStage, SimulatedSensor> {
    /// Synthetic microscope built from the `simulation` section of `config`.
    pub fn simulated(config: &ControllerConfig) -> Self {
        let (stage, sensor) = simulated_hardware(&config.simulation);
        Self::from_config(stage, sensor, config)
    }
}

/// Simulated stage and a sensor looking through it.
pub fn simulated_hardware(config: &SimulationConfig) -> (SimulatedStage, SimulatedSensor) {
    let stage = SimulatedStage::new().with_backlash(config.backlash);
    let sensor = SimulatedSensor::new(config.width, config.height, stage.position_handle())
        .with_focus_z(config.focus_z)
        .with_depth_of_field(config.depth_of_field)
        .with_channel_response(config.channel_response)
        .with_shading(Shading::Vignette {
            strength: config.vignette,
        })
        .with_noise(config.noise, config.seed);
    (stage, sensor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MicroscopeError;
    use tracing_test::traced_test;

    fn quiet_config() -> ControllerConfig {
        let mut config = ControllerConfig::default();
        config.simulation.noise = 0.0;
        config
    }

    #[test]
    fn test_autofocus_uses_configured_defaults() {
        let mut config = quiet_config();
        config.simulation.focus_z = 80;
        let mut scope = Microscope::simulated(&config);
        let report = scope.autofocus(None, None).unwrap();
        assert!((report.best.z - 80).abs() <= 20, "best {}", report.best);
        assert_eq!(scope.position().unwrap(), report.best);
    }

    #[traced_test]
    #[test]
    fn test_calibrate_activates_table_and_balances_colour() {
        let mut scope = Microscope::simulated(&quiet_config());
        let report = scope.calibrate(0.05, 10).unwrap();

        assert!(report.final_spread().unwrap() <= 0.05);
        let active = scope.capture_settings().gain_table.as_deref().unwrap();
        assert_eq!(active, &report.table);
        // Red reads high and blue low in the simulation
        assert!(report.channel_gains.red < 1.0);
        assert!(report.channel_gains.blue > 1.0);
        assert!(logs_contain("Microscope: calibration complete"));
    }

    #[test]
    fn test_failed_calibration_restores_settings() {
        let mut scope = Microscope::simulated(&quiet_config());
        let before = scope.capture_settings().clone();
        let result = scope.calibrate(0.0, 0);
        assert!(matches!(result, Err(MicroscopeError::Configuration(_))));
        assert_eq!(scope.capture_settings(), &before);
    }

    #[test]
    fn test_settings_round_trip_through_facade() {
        let mut scope = Microscope::simulated(&quiet_config());
        scope.flat_field(0.05, 10).unwrap();
        let saved = scope.settings();
        assert!(saved.gain_table.is_some());

        let mut fresh = Microscope::simulated(&quiet_config());
        fresh.apply_settings(&saved);
        assert_eq!(fresh.settings(), saved);
    }

    #[test]
    fn test_run_plan_uses_scan_config() {
        let mut scope = Microscope::simulated(&quiet_config());
        let plan = scope.scan_config().raster_plan();
        let result = scope.run_plan(&plan).unwrap();
        assert_eq!(result.len(), 5);
        assert_eq!(result.positions().last().unwrap().x, 160);
    }
}
