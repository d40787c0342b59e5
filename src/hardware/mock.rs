//! Simulated Hardware Implementations
//!
//! Provides synthetic devices for testing and dry runs without physical hardware.
//! Both devices are deterministic for a given seed and share the stage position
//! through a [`SharedPosition`] handle, so the sensor "sees" the focus the stage is at.
//!
//! # Available Mocks
//!
//! - `SimulatedStage` - three-axis stepper stage with optional backlash, travel
//!   limits, slip and fault injection
//! - `SimulatedSensor` - camera rendering a checkerboard target that blurs away
//!   from a focal plane, with shading defects, noise and fault injection
//!
//! # Optical Model
//!
//! Target contrast falls off as a Lorentzian of the defocus:
//! `contrast = 1 / (1 + ((z - focus_z) / depth_of_field)^2)`. Every pixel is
//! `illumination * shading * channel_response * pattern * gain_table`, clipped to
//! the saturation level, plus uniform noise.

use crate::calibration::GainTable;
use crate::core::{Axis, Displacement, Position};
use crate::error::{ActuatorFault, SensorFault};
use crate::hardware::{CaptureSettings, Frame, FrameMetadata, RegionOfInterest, Sensor, Stage};
use chrono::Utc;
use ndarray::{Array2, Array3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::Cell;
use std::rc::Rc;
use tracing::debug;

/// Stage position shared between a simulated stage and the sensor looking through it.
pub type SharedPosition = Rc<Cell<Position>>;

// =============================================================================
// SimulatedStage
// =============================================================================

/// Simulated three-axis stepper stage.
///
/// Moves complete instantly. With backlash configured, negative moves overshoot by
/// the backlash and come back up, so every target is approached from below; the
/// individual motor moves are recorded in [`motor_log`](Self::motor_log).
///
/// # Example
///
/// ```rust,ignore
/// let mut stage = SimulatedStage::new().with_backlash(128);
/// stage.move_relative(Axis::Z, -500)?; // motor: -628 then +128
/// assert_eq!(stage.position()?.z, -500);
/// ```
#[derive(Debug)]
pub struct SimulatedStage {
    position: SharedPosition,
    backlash: i64,
    travel_limit: Option<i64>,
    moves: usize,
    fail_on_move: Option<usize>,
    slip: Option<(usize, i64)>,
    motor_log: Vec<(Axis, i64)>,
}

impl SimulatedStage {
    /// Create a stage at the origin.
    pub fn new() -> Self {
        Self::at(Position::origin())
    }

    /// Create a stage at `position`.
    pub fn at(position: Position) -> Self {
        Self {
            position: Rc::new(Cell::new(position)),
            backlash: 0,
            travel_limit: None,
            moves: 0,
            fail_on_move: None,
            slip: None,
            motor_log: Vec::new(),
        }
    }

    /// Approach every target from below, overshooting negative moves by `steps`.
    pub fn with_backlash(mut self, steps: i64) -> Self {
        self.backlash = steps.max(0);
        self
    }

    /// Refuse moves that would leave `[-limit, limit]` on any axis.
    pub fn with_travel_limit(mut self, limit: i64) -> Self {
        self.travel_limit = Some(limit.abs());
        self
    }

    /// Fail the `n`th move (1-based) with an actuator fault.
    pub fn fail_on_move(mut self, n: usize) -> Self {
        self.fail_on_move = Some(n);
        self
    }

    /// On the `n`th move (1-based), land `steps` away from the commanded target.
    pub fn slip_on_move(mut self, n: usize, steps: i64) -> Self {
        self.slip = Some((n, steps));
        self
    }

    /// Handle through which a [`SimulatedSensor`] follows this stage.
    pub fn position_handle(&self) -> SharedPosition {
        Rc::clone(&self.position)
    }

    /// Number of `move_relative` calls so far.
    pub fn move_count(&self) -> usize {
        self.moves
    }

    /// Individual motor moves, including backlash overshoots.
    pub fn motor_log(&self) -> &[(Axis, i64)] {
        &self.motor_log
    }

    fn drive(&mut self, axis: Axis, steps: i64) {
        self.motor_log.push((axis, steps));
        let current = self.position.get();
        self.position
            .set(current.offset(Displacement::along(axis, steps)));
    }
}

impl Default for SimulatedStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for SimulatedStage {
    fn move_relative(&mut self, axis: Axis, delta: i64) -> Result<Position, ActuatorFault> {
        self.moves += 1;
        if self.fail_on_move == Some(self.moves) {
            return Err(ActuatorFault::on_axis(
                axis,
                format!("simulated fault on move {}", self.moves),
            ));
        }

        let target = self.position.get().get(axis) + delta;
        if let Some(limit) = self.travel_limit {
            if target.abs() > limit {
                return Err(ActuatorFault::on_axis(
                    axis,
                    format!("target {target} outside travel limit ±{limit}"),
                ));
            }
        }

        if delta < 0 && self.backlash > 0 {
            self.drive(axis, delta - self.backlash);
            self.drive(axis, self.backlash);
        } else if delta != 0 {
            self.drive(axis, delta);
        }

        if let Some((n, steps)) = self.slip {
            if n == self.moves {
                self.drive(axis, steps);
            }
        }

        let reached = self.position.get();
        debug!(%axis, delta, position = %reached, "SimulatedStage: move complete");
        Ok(reached)
    }

    fn position(&mut self) -> Result<Position, ActuatorFault> {
        Ok(self.position.get())
    }
}

// =============================================================================
// SimulatedSensor
// =============================================================================

/// Illumination non-uniformity seen by the sensor.
#[derive(Debug, Clone, PartialEq)]
pub enum Shading {
    /// Perfectly even illumination
    Flat,
    /// Piecewise-constant defects on a coarse grid stretched over the sensor
    Regions(Array2<f64>),
    /// Piecewise-constant defects per colour channel, `channels x rows x cols`
    ChannelRegions(Array3<f64>),
    /// Radial fall-off: `1 - strength * (r / r_corner)^2`
    Vignette {
        /// Relative loss at the corners (0..1)
        strength: f64,
    },
}

impl Shading {
    fn at(&self, channel: usize, row: usize, col: usize, height: usize, width: usize) -> f64 {
        match self {
            Shading::Flat => 1.0,
            Shading::Regions(gains) => {
                let (r, c) = grid_cell(gains.dim(), row, col, height, width);
                gains[[r, c]]
            }
            Shading::ChannelRegions(gains) => {
                let (planes, rows, cols) = gains.dim();
                let (r, c) = grid_cell((rows, cols), row, col, height, width);
                gains[[channel.min(planes.saturating_sub(1)), r, c]]
            }
            Shading::Vignette { strength } => {
                let cy = (height as f64 - 1.0) / 2.0;
                let cx = (width as f64 - 1.0) / 2.0;
                let corner = (cy * cy + cx * cx).max(f64::EPSILON);
                let dy = row as f64 - cy;
                let dx = col as f64 - cx;
                1.0 - strength * (dy * dy + dx * dx) / corner
            }
        }
    }
}

fn grid_cell(
    (rows, cols): (usize, usize),
    row: usize,
    col: usize,
    height: usize,
    width: usize,
) -> (usize, usize) {
    let r = (row * rows / height.max(1)).min(rows.saturating_sub(1));
    let c = (col * cols / width.max(1)).min(cols.saturating_sub(1));
    (r, c)
}

/// Simulated RGB camera looking at a checkerboard target through the stage.
///
/// # Example
///
/// ```rust,ignore
/// let stage = SimulatedStage::new();
/// let mut sensor = SimulatedSensor::new(64, 48, stage.position_handle()).with_focus_z(50);
/// let frame = sensor.capture(&CaptureSettings::default())?;
/// ```
#[derive(Debug)]
pub struct SimulatedSensor {
    width: usize,
    height: usize,
    stage: SharedPosition,
    focus_z: i64,
    depth_of_field: f64,
    /// Checker square size in pixels; `None` shows a blank uniform field
    checker_period: Option<usize>,
    modulation: f64,
    /// Signal level per millisecond of exposure at unity gain
    brightness: f64,
    channel_response: [f64; 3],
    shading: Shading,
    saturation: f32,
    noise: f32,
    rng: StdRng,
    frames_captured: u64,
    fail_on_capture: Option<u64>,
}

impl SimulatedSensor {
    /// Create a `width x height` sensor following `stage`.
    pub fn new(width: usize, height: usize, stage: SharedPosition) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            stage,
            focus_z: 0,
            depth_of_field: 20.0,
            checker_period: Some(2),
            modulation: 0.5,
            brightness: 10.0,
            channel_response: [1.0, 1.0, 1.0],
            shading: Shading::Flat,
            saturation: 255.0,
            noise: 0.0,
            rng: StdRng::seed_from_u64(0),
            frames_captured: 0,
            fail_on_capture: None,
        }
    }

    /// Z position of best focus.
    pub fn with_focus_z(mut self, z: i64) -> Self {
        self.focus_z = z;
        self
    }

    /// Defocus (in steps) at which contrast halves.
    pub fn with_depth_of_field(mut self, steps: f64) -> Self {
        self.depth_of_field = steps.max(f64::EPSILON);
        self
    }

    /// Replace the target with a blank, evenly lit field (calibration setup).
    pub fn uniform_scene(mut self) -> Self {
        self.checker_period = None;
        self
    }

    /// Checkerboard square size in pixels.
    pub fn with_checker_period(mut self, pixels: usize) -> Self {
        self.checker_period = Some(pixels.max(1));
        self
    }

    /// Signal level per millisecond of exposure at unity gain.
    pub fn with_brightness(mut self, level_per_ms: f64) -> Self {
        self.brightness = level_per_ms;
        self
    }

    /// Relative sensitivity of the red, green and blue channels.
    pub fn with_channel_response(mut self, response: [f64; 3]) -> Self {
        self.channel_response = response;
        self
    }

    /// Illumination non-uniformity.
    pub fn with_shading(mut self, shading: Shading) -> Self {
        self.shading = shading;
        self
    }

    /// Clip level of the sensor.
    pub fn with_saturation(mut self, level: f32) -> Self {
        self.saturation = level;
        self
    }

    /// Uniform noise of `±amplitude`, seeded for reproducibility.
    pub fn with_noise(mut self, amplitude: f32, seed: u64) -> Self {
        self.noise = amplitude.abs();
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Fail the `n`th capture (1-based) with a sensor fault.
    pub fn fail_on_capture(mut self, n: u64) -> Self {
        self.fail_on_capture = Some(n);
        self
    }

    /// Number of capture attempts so far.
    pub fn frames_captured(&self) -> u64 {
        self.frames_captured
    }

    /// Target contrast at stage height `z`.
    pub fn contrast_at(&self, z: i64) -> f64 {
        let defocus = (z - self.focus_z) as f64 / self.depth_of_field;
        1.0 / (1.0 + defocus * defocus)
    }

    fn pattern(&self, row: usize, col: usize, contrast: f64) -> f64 {
        match self.checker_period {
            Some(period) => {
                let sign = if (row / period + col / period) % 2 == 0 {
                    1.0
                } else {
                    -1.0
                };
                1.0 + self.modulation * contrast * sign
            }
            None => 1.0,
        }
    }
}

impl Sensor for SimulatedSensor {
    fn capture(&mut self, settings: &CaptureSettings) -> Result<Frame, SensorFault> {
        self.frames_captured += 1;
        if self.fail_on_capture == Some(self.frames_captured) {
            return Err(SensorFault::new(format!(
                "simulated fault on capture {}",
                self.frames_captured
            )));
        }

        let full = RegionOfInterest::full_sensor(self.width, self.height);
        let region = match settings.region {
            Some(roi) => roi.clipped(self.width, self.height).ok_or_else(|| {
                SensorFault::new(format!(
                    "region {roi:?} lies outside the {}x{} sensor",
                    self.width, self.height
                ))
            })?,
            None => full,
        };

        let contrast = self.contrast_at(self.stage.get().z);
        let signal =
            self.brightness * f64::from(settings.exposure_us) / 1000.0 * settings.analog_gain;

        let mut samples = Array3::<f32>::zeros((region.height, region.width, 3));
        for ((r, c, ch), sample) in samples.indexed_iter_mut() {
            let row = region.y + r;
            let col = region.x + c;
            let value = signal
                * self.shading.at(ch, row, col, self.height, self.width)
                * self.channel_response[ch]
                * settings.channel_gains.for_channel(ch)
                * self.pattern(row, col, contrast);
            *sample = value as f32;
        }

        if let Some(table) = settings.gain_table.as_deref() {
            table.apply(&mut samples, (region.y, region.x), (self.height, self.width));
        }

        let noise = self.noise;
        let saturation = self.saturation;
        for sample in samples.iter_mut() {
            let jitter = if noise > 0.0 {
                self.rng.gen_range(-noise..=noise)
            } else {
                0.0
            };
            *sample = (*sample + jitter).clamp(0.0, saturation);
        }

        let metadata = FrameMetadata {
            frame_number: self.frames_captured,
            exposure_us: settings.exposure_us,
            analog_gain: settings.analog_gain,
            gain_table_applied: settings.gain_table.is_some(),
            region: settings.region.map(|_| region),
            captured_at: Utc::now(),
        };
        Ok(Frame::new(samples, metadata))
    }

    fn resolution(&self) -> (usize, usize) {
        (self.width, self.height)
    }
}

/// Gain table that exactly cancels `Shading::Regions(gains)` on a sensor whose
/// table has the same shape. Test helper.
pub fn inverse_of(gains: &Array2<f64>) -> Option<GainTable> {
    GainTable::from_factors(gains.mapv(|g| 1.0 / g)).ok()
}

// =============================================================================
// Unit Tests
// =============================================================================
