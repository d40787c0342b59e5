//! Autofocus engine.
//!
//! A coarse, exhaustive sweep along one axis followed by at most three halving
//! refinement sweeps around the best position found so far. The sweep never
//! follows the gradient, so a non-convex sharpness curve (dust, noise, a second
//! reflective surface) cannot trap it in a local peak inside the swept range.
//!
//! The engine leaves the stage at the winning position. A cancelled search stops
//! where it is and returns the samples taken so far in
//! [`MicroscopeError::FocusCancelled`].

use crate::core::{Axis, CancelToken, Position};
use crate::error::{ActuatorFault, AppResult, MicroscopeError};
use crate::focus::FocusMetric;
use crate::hardware::{CaptureSettings, Sensor, Stage};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Hard ceiling on refinement sweeps after the coarse pass.
pub const MAX_REFINE_PASSES: u32 = 3;

/// Autofocus parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutofocusConfig {
    /// Sweep range used when a request does not specify one (steps)
    pub default_range: u32,
    /// Sweep step used when a request does not specify one (steps)
    pub default_step: u32,
    /// Refinement stops once the step is at or below this
    pub min_refine_step: u32,
    /// Refinement sweeps after the coarse pass, capped at [`MAX_REFINE_PASSES`]
    pub max_refine_passes: u32,
    /// Sharpness metric
    pub metric: FocusMetric,
}

impl Default for AutofocusConfig {
    fn default() -> Self {
        Self {
            default_range: 400,
            default_step: 40,
            min_refine_step: 5,
            max_refine_passes: MAX_REFINE_PASSES,
            metric: FocusMetric::default(),
        }
    }
}

/// One captured point of a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FocusSample {
    /// Where the stage reported it was when the frame was captured
    pub position: Position,
    /// Sharpness of the frame
    pub score: f64,
}

/// Outcome of a focus search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FocusReport {
    /// Position of the highest score, where the stage was left
    pub best: Position,
    /// Sharpness at `best`
    pub best_score: f64,
    /// Every sample in capture order, all passes
    pub samples: Vec<FocusSample>,
    /// Sweeps performed, coarse pass included
    pub passes: u32,
}

/// Validate a sweep request: both values positive, step partitions range.
pub fn validate_search(range: u32, step: u32) -> AppResult<()> {
    let reason = if range == 0 {
        "range must be positive"
    } else if step == 0 {
        "step must be positive"
    } else if range % step != 0 {
        "step must evenly divide range"
    } else {
        return Ok(());
    };
    Err(MicroscopeError::InvalidSearchRange {
        range,
        step,
        reason,
    })
}

/// Drives a stage and a sensor to find the sharpest position along one axis.
///
/// # Example
///
/// ```rust,ignore
/// let mut engine = AutofocusEngine::new(&mut stage, &mut sensor);
/// let best = engine.find_best_focus(Axis::Z, 100, 10)?;
/// ```
pub struct AutofocusEngine<'a, S: Stage + ?Sized, C: Sensor + ?Sized> {
    stage: &'a mut S,
    sensor: &'a mut C,
    config: AutofocusConfig,
    capture: CaptureSettings,
    cancel: CancelToken,
}

impl<'a, S: Stage + ?Sized, C: Sensor + ?Sized> AutofocusEngine<'a, S, C> {
    /// Engine with default configuration and capture settings.
    pub fn new(stage: &'a mut S, sensor: &'a mut C) -> Self {
        Self {
            stage,
            sensor,
            config: AutofocusConfig::default(),
            capture: CaptureSettings::default(),
            cancel: CancelToken::new(),
        }
    }

    /// Replace the search parameters.
    pub fn with_config(mut self, config: AutofocusConfig) -> Self {
        self.config = config;
        self
    }

    /// Settings for every sweep capture.
    pub fn with_capture_settings(mut self, capture: CaptureSettings) -> Self {
        self.capture = capture;
        self
    }

    /// Token polled before every sample.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Active search parameters.
    pub fn config(&self) -> &AutofocusConfig {
        &self.config
    }

    /// Sweep `axis` and return the best position. The stage is left there.
    pub fn find_best_focus(&mut self, axis: Axis, range: u32, step: u32) -> AppResult<Position> {
        self.search(axis, range, step).map(|report| report.best)
    }

    /// [`search`](Self::search) with the configured default range and step.
    pub fn search_default(&mut self, axis: Axis) -> AppResult<FocusReport> {
        self.search(axis, self.config.default_range, self.config.default_step)
    }

    /// Full search with every sample recorded.
    pub fn search(&mut self, axis: Axis, range: u32, step: u32) -> AppResult<FocusReport> {
        validate_search(range, step)?;
        let start = self.stage.position()?;
        info!(%axis, range, step, start = %start, "Autofocus: starting sweep");

        let mut samples = Vec::new();
        let mut degenerate = 0usize;
        let centre = start.get(axis);
        let coarse = match self.sweep(
            axis,
            centre,
            i64::from(range),
            i64::from(step),
            &mut samples,
            Some(&mut degenerate),
        ) {
            Ok(pass) => pass,
            Err(err) => return Err(interrupted(err, axis, start, samples, 0)),
        };
        if degenerate == coarse.len() {
            warn!(%axis, samples = coarse.len(), "Autofocus: every frame featureless");
            return Err(MicroscopeError::NoFocusSignal {
                samples: coarse.len(),
            });
        }

        let mut best = pick_best(&coarse, axis, centre);
        self.settle(axis, best.position.get(axis))?;
        let mut passes = 1;

        let mut current_step = step;
        let refine_limit = self.config.max_refine_passes.min(MAX_REFINE_PASSES);
        while passes <= refine_limit && current_step > self.config.min_refine_step {
            current_step /= 2;
            if current_step == 0 {
                break;
            }
            let pass_centre = best.position.get(axis);
            let span = 4 * i64::from(current_step);
            let pass_step = i64::from(current_step);
            let pass = match self.sweep(axis, pass_centre, span, pass_step, &mut samples, None) {
                Ok(pass) => pass,
                Err(err) => return Err(interrupted(err, axis, start, samples, passes)),
            };
            let candidate = pick_best(&pass, axis, pass_centre);
            if candidate.score > best.score {
                best = candidate;
            }
            self.settle(axis, best.position.get(axis))?;
            passes += 1;
            debug!(%axis, pass = passes, step = current_step, best = %best.position, score = best.score, "Autofocus: refinement pass done");
        }

        info!(%axis, best = %best.position, score = best.score, passes, samples = samples.len(), "Autofocus: complete");
        Ok(FocusReport {
            best: best.position,
            best_score: best.score,
            samples,
            passes,
        })
    }

    /// Sample `centre - range/2 + k*step` for `k = 0..=range/step`.
    fn sweep(
        &mut self,
        axis: Axis,
        centre: i64,
        range: i64,
        step: i64,
        samples: &mut Vec<FocusSample>,
        mut degenerate: Option<&mut usize>,
    ) -> AppResult<Vec<FocusSample>> {
        let low = centre - range / 2;
        let count = range / step;
        let mut pass = Vec::new();
        for k in 0..=count {
            if self.cancel.is_cancelled() {
                info!(%axis, samples = samples.len(), "Autofocus: cancelled");
                return Err(MicroscopeError::Cancelled);
            }
            let target = low + k * step;
            let position = self.settle(axis, target)?;
            let frame = self.sensor.capture(&self.capture)?;
            if frame.is_degenerate() {
                if let Some(count) = degenerate.as_deref_mut() {
                    *count += 1;
                }
            }
            let score = self.config.metric.score(&frame);
            debug!(%axis, position = target, score, "Autofocus: sample");
            let sample = FocusSample { position, score };
            pass.push(sample);
            samples.push(sample);
        }
        Ok(pass)
    }

    /// Move along `axis` to coordinate `target` and confirm the stage got there.
    fn settle(&mut self, axis: Axis, target: i64) -> AppResult<Position> {
        let current = self.stage.position()?;
        let delta = target - current.get(axis);
        let reached = if delta == 0 {
            current
        } else {
            self.stage.move_relative(axis, delta)?
        };
        if reached.get(axis) != target {
            return Err(ActuatorFault::on_axis(
                axis,
                format!("stage reported {} after move, expected {target}", reached.get(axis)),
            )
            .into());
        }
        Ok(reached)
    }
}

/// Turn a cancellation inside a sweep into [`MicroscopeError::FocusCancelled`]
/// carrying what was sampled. Other errors pass through.
fn interrupted(
    err: MicroscopeError,
    axis: Axis,
    start: Position,
    samples: Vec<FocusSample>,
    passes: u32,
) -> MicroscopeError {
    if !matches!(err, MicroscopeError::Cancelled) {
        return err;
    }
    let (best, best_score) = if samples.is_empty() {
        (start, 0.0)
    } else {
        let best = pick_best(&samples, axis, start.get(axis));
        (best.position, best.score)
    };
    MicroscopeError::FocusCancelled {
        partial: Box::new(FocusReport {
            best,
            best_score,
            samples,
            passes,
        }),
    }
}

/// Highest score; exact ties go to the sample nearest `midpoint`, then the lower one.
fn pick_best(pass: &[FocusSample], axis: Axis, midpoint: i64) -> FocusSample {
    let mut best = pass[0];
    for sample in &pass[1..] {
        let here = sample.position.get(axis);
        let there = best.position.get(axis);
        let better = sample.score > best.score
            || (sample.score == best.score
                && ((here - midpoint).abs(), here) < ((there - midpoint).abs(), there));
        if better {
            best = *sample;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{SimulatedSensor, SimulatedStage};

    fn sample(z: i64, score: f64) -> FocusSample {
        FocusSample {
            position: Position::new(0, 0, z),
            score,
        }
    }

    #[test]
    fn test_rejects_bad_ranges() {
        assert!(matches!(
            validate_search(100, 30),
            Err(MicroscopeError::InvalidSearchRange { range: 100, step: 30, .. })
        ));
        assert!(validate_search(0, 10).is_err());
        assert!(validate_search(100, 0).is_err());
        assert!(validate_search(100, 10).is_ok());
    }

    #[test]
    fn test_tie_prefers_sample_nearest_midpoint() {
        let pass = [sample(0, 5.0), sample(40, 5.0), sample(50, 1.0), sample(70, 5.0)];
        assert_eq!(pick_best(&pass, Axis::Z, 50).position.z, 40);
    }

    #[test]
    fn test_equidistant_tie_prefers_lower_position() {
        let pass = [sample(60, 2.0), sample(40, 2.0)];
        assert_eq!(pick_best(&pass, Axis::Z, 50).position.z, 40);
    }

    #[test]
    fn test_strictly_higher_score_wins_over_tie_rule() {
        let pass = [sample(50, 1.0), sample(0, 1.5)];
        assert_eq!(pick_best(&pass, Axis::Z, 50).position.z, 0);
    }

    #[test]
    fn test_finds_peak_and_leaves_stage_there() {
        let mut stage = SimulatedStage::at(Position::new(0, 0, 40));
        let mut sensor = SimulatedSensor::new(32, 32, stage.position_handle()).with_focus_z(53);

        let report = AutofocusEngine::new(&mut stage, &mut sensor)
            .search(Axis::Z, 100, 10)
            .unwrap();

        assert!((report.best.z - 53).abs() <= 10);
        assert_eq!(stage.position().unwrap(), report.best);
        assert!(report.passes >= 2);
        assert!(report
            .samples
            .iter()
            .all(|s| s.score <= report.best_score));
    }

    #[test]
    fn test_refinement_respects_pass_cap() {
        let mut stage = SimulatedStage::new();
        let mut sensor = SimulatedSensor::new(16, 16, stage.position_handle()).with_focus_z(7);
        let config = AutofocusConfig {
            min_refine_step: 0,
            max_refine_passes: 10,
            ..AutofocusConfig::default()
        };
        let report = AutofocusEngine::new(&mut stage, &mut sensor)
            .with_config(config)
            .search(Axis::Z, 320, 32)
            .unwrap();
        assert_eq!(report.passes, 1 + MAX_REFINE_PASSES);
    }

    #[test]
    fn test_featureless_sweep_reports_no_signal() {
        let mut stage = SimulatedStage::new();
        let mut sensor = SimulatedSensor::new(16, 16, stage.position_handle()).uniform_scene();
        let err = AutofocusEngine::new(&mut stage, &mut sensor)
            .search(Axis::Z, 40, 10)
            .unwrap_err();
        assert!(matches!(err, MicroscopeError::NoFocusSignal { samples: 5 }));
    }

    #[test]
    fn test_cancelled_before_first_sample() {
        let mut stage = SimulatedStage::new();
        let mut sensor = SimulatedSensor::new(8, 8, stage.position_handle());
        let token = CancelToken::new();
        token.cancel();
        let err = AutofocusEngine::new(&mut stage, &mut sensor)
            .with_cancel_token(token)
            .search(Axis::Z, 40, 10)
            .unwrap_err();
        match err {
            MicroscopeError::FocusCancelled { partial } => {
                assert!(partial.samples.is_empty());
                assert_eq!(partial.passes, 0);
                assert_eq!(partial.best, Position::origin());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(sensor.frames_captured(), 0);
        assert_eq!(stage.move_count(), 0);
    }

    #[test]
    fn test_wide_sweep_does_not_overflow() {
        let focus = 1_i64 << 30;
        let mut stage = SimulatedStage::new();
        let mut sensor = SimulatedSensor::new(8, 8, stage.position_handle()).with_focus_z(focus);

        let report = AutofocusEngine::new(&mut stage, &mut sensor)
            .search(Axis::Z, 1 << 31, 1 << 31)
            .unwrap();

        assert_eq!(report.best.z, focus);
        assert_eq!(report.passes, 1 + MAX_REFINE_PASSES);
        // Refinement reaches 3 * 2^30, beyond what a u32 span could describe
        assert!(report.samples.iter().any(|s| s.position.z == 3 * focus));
    }

    #[test]
    fn test_stage_slip_is_an_actuator_fault() {
        let mut stage = SimulatedStage::new().slip_on_move(2, 1);
        let mut sensor = SimulatedSensor::new(8, 8, stage.position_handle());
        let err = AutofocusEngine::new(&mut stage, &mut sensor)
            .search(Axis::Z, 40, 10)
            .unwrap_err();
        assert!(matches!(err, MicroscopeError::Actuator(_)));
    }

    #[test]
    fn test_sensor_fault_propagates_unchanged() {
        let mut stage = SimulatedStage::new();
        let mut sensor = SimulatedSensor::new(8, 8, stage.position_handle()).fail_on_capture(3);
        let err = AutofocusEngine::new(&mut stage, &mut sensor)
            .search(Axis::Z, 40, 10)
            .unwrap_err();
        assert!(matches!(err, MicroscopeError::Sensor(_)));
    }
}
