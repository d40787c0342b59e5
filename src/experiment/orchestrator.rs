//! Scan orchestrator.
//!
//! Executes a [`ScanPlan`] step by step against a stage and a sensor:
//!
//! 1. if the step requests it, move by the autofocus approach and autofocus on Z
//! 2. move by the step's delta
//! 3. capture one frame
//! 4. append `(position, frame)` to the result
//!
//! Every move is confirmed against the position the stage reports. Any failure stops
//! the run: the remaining steps are skipped and the error is returned as
//! [`MicroscopeError::PlanAborted`] carrying the frames acquired so far. Nothing is
//! retried. A failed return to the origin after the last step is reported the same
//! way, with `step` equal to the plan length and every frame kept.

use crate::core::{Axis, CancelToken, Displacement, Position};
use crate::error::{ActuatorFault, AppResult, MicroscopeError};
use crate::experiment::document::AcquisitionResult;
use crate::experiment::plans::{dz_array, log_dz_array, AutofocusRequest, ScanPlan, ScanStep};
use crate::focus::{AutofocusConfig, AutofocusEngine};
use crate::hardware::{CaptureSettings, Frame, Sensor, Stage};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Scan parameters, including the defaults the CLI builds plans from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Move back to the plan origin after a successful run
    pub return_to_start: bool,
    /// Sites in a raster scan
    pub raster_points: usize,
    /// Raster step vector `[dx, dy]`
    pub raster_step: [i64; 2],
    /// Planes in a Z-stack
    pub z_stack_points: usize,
    /// Z spacing of a Z-stack
    pub z_stack_step: i64,
    /// Lateral shift for three-site edge scans; `None` scans the centre only
    pub edge_shift: Option<[i64; 2]>,
    /// Planes in each edge-scan stack
    pub edge_points: usize,
    /// Innermost Z spacing of the edge-scan stack
    pub edge_min_step: f64,
    /// Growth of the Z spacing away from focus; 1.0 gives an even stack
    pub edge_log_factor: f64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            return_to_start: false,
            raster_points: 5,
            raster_step: [40, 0],
            z_stack_points: 11,
            z_stack_step: 20,
            edge_shift: None,
            edge_points: 15,
            edge_min_step: 30.0,
            edge_log_factor: 1.2,
        }
    }
}

impl ScanConfig {
    /// Raster with the configured points and step.
    pub fn raster_plan(&self) -> ScanPlan {
        ScanPlan::raster(self.raster_points, self.raster_step[0], self.raster_step[1])
    }

    /// Z-stack with the configured points and step.
    pub fn z_stack_plan(&self) -> ScanPlan {
        ScanPlan::z_stack(self.z_stack_points, self.z_stack_step)
    }

    /// Edge scan with the configured shift and stack, autofocusing with `focus`.
    pub fn edge_scan_plan(&self, focus: AutofocusRequest) -> ScanPlan {
        let offsets = if self.edge_log_factor == 1.0 {
            dz_array(self.edge_min_step.round() as i64, self.edge_points)
        } else {
            log_dz_array(self.edge_min_step, self.edge_log_factor, self.edge_points)
        };
        ScanPlan::edge_scan(self.edge_shift.map(|[dx, dy]| (dx, dy)), &offsets, focus)
    }
}

/// Runs scan plans.
///
/// # Example
///
/// ```rust,ignore
/// let mut orchestrator = ScanOrchestrator::new(&mut stage, &mut sensor);
/// let result = orchestrator.run(&ScanPlan::raster(5, 40, 0))?;
/// assert_eq!(result.len(), 5);
/// ```
pub struct ScanOrchestrator<'a, S: Stage + ?Sized, C: Sensor + ?Sized> {
    stage: &'a mut S,
    sensor: &'a mut C,
    autofocus: AutofocusConfig,
    capture: CaptureSettings,
    cancel: CancelToken,
    return_to_start: bool,
}

impl<'a, S: Stage + ?Sized, C: Sensor + ?Sized> ScanOrchestrator<'a, S, C> {
    /// Orchestrator with default autofocus and capture settings.
    pub fn new(stage: &'a mut S, sensor: &'a mut C) -> Self {
        Self {
            stage,
            sensor,
            autofocus: AutofocusConfig::default(),
            capture: CaptureSettings::default(),
            cancel: CancelToken::new(),
            return_to_start: false,
        }
    }

    /// Defaults for autofocus requests that leave range or step unset.
    pub fn with_autofocus_config(mut self, config: AutofocusConfig) -> Self {
        self.autofocus = config;
        self
    }

    /// Settings for every capture, autofocus sweeps included.
    pub fn with_capture_settings(mut self, capture: CaptureSettings) -> Self {
        self.capture = capture;
        self
    }

    /// Token polled before each step and each autofocus sample.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Move back to the origin once every step has been captured.
    pub fn return_to_start(mut self, enabled: bool) -> Self {
        self.return_to_start = enabled;
        self
    }

    /// Execute `plan` in order.
    pub fn run(&mut self, plan: &ScanPlan) -> AppResult<AcquisitionResult> {
        let origin = self.stage.position()?;
        let mut result = AcquisitionResult::new(plan, origin);
        let mut believed = origin;
        info!(plan = plan.name(), kind = %plan.kind(), steps = plan.len(), origin = %origin, uid = %result.uid, "Scan: starting");

        for (index, step) in plan.steps().iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!(step = index, "Scan: cancelled");
                return Err(aborted(index, result, MicroscopeError::Cancelled));
            }
            match self.execute(index, step, &mut believed) {
                Ok((position, frame)) => result.push(index, position, frame),
                Err(source) => {
                    warn!(step = index, completed = result.len(), error = %source, "Scan: aborting");
                    return Err(aborted(index, result, source));
                }
            }
        }

        if self.return_to_start {
            if let Err(source) = self.move_confirmed(believed.displacement_to(origin), &mut believed) {
                warn!(completed = result.len(), error = %source, "Scan: return to start failed");
                return Err(aborted(plan.len(), result, source));
            }
        }
        result.finish();
        info!(plan = plan.name(), frames = result.len(), "Scan: complete");
        Ok(result)
    }

    fn execute(
        &mut self,
        index: usize,
        step: &ScanStep,
        believed: &mut Position,
    ) -> AppResult<(Position, Frame)> {
        if let Some(request) = &step.autofocus {
            self.move_confirmed(request.approach, believed)?;
            let range = request.search_range.unwrap_or(self.autofocus.default_range);
            let step_size = request.step_size.unwrap_or(self.autofocus.default_step);
            let report = AutofocusEngine::new(&mut *self.stage, &mut *self.sensor)
                .with_config(self.autofocus.clone())
                .with_capture_settings(self.capture.clone())
                .with_cancel_token(self.cancel.clone())
                .search(Axis::Z, range, step_size)?;
            *believed = report.best;
        }

        self.move_confirmed(step.delta, believed)?;
        let frame = self.sensor.capture(&self.capture)?;
        debug!(step = index, position = %believed, frame = frame.metadata().frame_number, "Scan: captured");
        Ok((*believed, frame))
    }

    /// Move by `delta` and check the stage landed where the controller expects.
    fn move_confirmed(&mut self, delta: Displacement, believed: &mut Position) -> AppResult<()> {
        let expected = believed.offset(delta);
        let reported = self.stage.move_by(delta)?;
        if reported != expected {
            return Err(ActuatorFault::general(format!(
                "stage reported {reported}, expected {expected}"
            ))
            .into());
        }
        *believed = reported;
        Ok(())
    }
}

fn aborted(step: usize, mut partial: AcquisitionResult, source: MicroscopeError) -> MicroscopeError {
    partial.abort();
    MicroscopeError::PlanAborted {
        step,
        partial: Box::new(partial),
        source: Box::new(source),
    }
}
