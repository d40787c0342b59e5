//! Hardware ports consumed by the engines.
//!
//! The controller talks to exactly two collaborators:
//!
//! - [`Stage`]: a three-axis stepper stage. Moves are relative and blocking; the call
//!   returns once motion has settled, together with the position the stage reports.
//! - [`Sensor`]: a camera that captures one [`Frame`] under a given
//!   [`CaptureSettings`], including the flat-field [`GainTable`] to apply.
//!
//! Backlash compensation belongs to the stage implementation. Engines only issue
//! deltas and trust the reported position.
//!
//! # Implementations
//!
//! - [`mock::SimulatedStage`] / [`mock::SimulatedSensor`] - synthetic hardware for tests
//!   and dry runs
//! - [`openflexure::OpenFlexureStage`] - OpenFlexure motor board over a line transport

pub mod frame;
pub mod mock;
pub mod openflexure;

pub use frame::{Frame, FrameMetadata};

use crate::calibration::GainTable;
use crate::core::{Axis, Displacement, Position};
use crate::error::{ActuatorFault, SensorFault};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Capture configuration
// =============================================================================

/// Region of interest in sensor pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionOfInterest {
    /// Left column
    pub x: usize,
    /// Top row
    pub y: usize,
    /// Width in pixels
    pub width: usize,
    /// Height in pixels
    pub height: usize,
}

impl RegionOfInterest {
    /// Region covering a whole sensor.
    pub fn full_sensor(width: usize, height: usize) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    /// Clip the region to a `width` x `height` sensor. Returns `None` if nothing remains.
    pub fn clipped(&self, width: usize, height: usize) -> Option<Self> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let clipped = Self {
            x: self.x,
            y: self.y,
            width: self.width.min(width - self.x),
            height: self.height.min(height - self.y),
        };
        (clipped.width > 0 && clipped.height > 0).then_some(clipped)
    }
}

/// Red and blue white-balance gains relative to green.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelGains {
    /// Red gain
    pub red: f64,
    /// Blue gain
    pub blue: f64,
}

impl Default for ChannelGains {
    fn default() -> Self {
        Self {
            red: 1.0,
            blue: 1.0,
        }
    }
}

impl ChannelGains {
    /// Gain for an RGB channel index (0 = red, 1 = green, 2 = blue).
    pub fn for_channel(&self, channel: usize) -> f64 {
        match channel {
            0 => self.red,
            2 => self.blue,
            _ => 1.0,
        }
    }
}

/// Everything a sensor needs to take one exposure.
///
/// The gain table is shared behind an `Arc`: once calibration freezes a table it is
/// handed unchanged to every subsequent capture.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSettings {
    /// Exposure time in microseconds
    pub exposure_us: u32,
    /// Analogue gain multiplier
    pub analog_gain: f64,
    /// White-balance gains
    pub channel_gains: ChannelGains,
    /// Flat-field correction, `None` for an uncorrected capture
    pub gain_table: Option<Arc<GainTable>>,
    /// Readout window, `None` for the full sensor
    pub region: Option<RegionOfInterest>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            exposure_us: 10_000,
            analog_gain: 1.0,
            channel_gains: ChannelGains::default(),
            gain_table: None,
            region: None,
        }
    }
}

impl CaptureSettings {
    /// Copy of these settings with `table` applied.
    pub fn with_gain_table(&self, table: GainTable) -> Self {
        Self {
            gain_table: Some(Arc::new(table)),
            ..self.clone()
        }
    }

    /// Copy of these settings with no flat-field correction.
    pub fn without_gain_table(&self) -> Self {
        Self {
            gain_table: None,
            ..self.clone()
        }
    }
}

// =============================================================================
// Ports
// =============================================================================

/// A three-axis stepper stage.
///
/// Every call blocks until the motion has settled.
pub trait Stage {
    /// Move one axis by `delta` steps and report the resulting position.
    fn move_relative(&mut self, axis: Axis, delta: i64) -> Result<Position, ActuatorFault>;

    /// Query the current position.
    fn position(&mut self) -> Result<Position, ActuatorFault>;

    /// Apply a multi-axis displacement, one blocking move per non-zero axis (X, Y, Z).
    fn move_by(&mut self, delta: Displacement) -> Result<Position, ActuatorFault> {
        let mut reached = None;
        for (axis, steps) in delta.components() {
            reached = Some(self.move_relative(axis, steps)?);
        }
        match reached {
            Some(position) => Ok(position),
            None => self.position(),
        }
    }

    /// Move to an absolute position.
    fn move_to(&mut self, target: Position) -> Result<Position, ActuatorFault> {
        let current = self.position()?;
        self.move_by(current.displacement_to(target))
    }
}

/// A camera.
pub trait Sensor {
    /// Capture one frame.
    fn capture(&mut self, settings: &CaptureSettings) -> Result<Frame, SensorFault>;

    /// Full sensor size as `(width, height)` in pixels.
    fn resolution(&self) -> (usize, usize);
}

impl<S: Stage + ?Sized> Stage for Box<S> {
    fn move_relative(&mut self, axis: Axis, delta: i64) -> Result<Position, ActuatorFault> {
        (**self).move_relative(axis, delta)
    }

    fn position(&mut self) -> Result<Position, ActuatorFault> {
        (**self).position()
    }
}

impl<C: Sensor + ?Sized> Sensor for Box<C> {
    fn capture(&mut self, settings: &CaptureSettings) -> Result<Frame, SensorFault> {
        (**self).capture(settings)
    }

    fn resolution(&self) -> (usize, usize) {
        (**self).resolution()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingStage {
        position: Position,
        moves: Vec<(Axis, i64)>,
    }

    impl Stage for CountingStage {
        fn move_relative(&mut self, axis: Axis, delta: i64) -> Result<Position, ActuatorFault> {
            self.moves.push((axis, delta));
            self.position = self.position.offset(Displacement::along(axis, delta));
            Ok(self.position)
        }

        fn position(&mut self) -> Result<Position, ActuatorFault> {
            Ok(self.position)
        }
    }

    #[test]
    fn test_move_by_issues_one_move_per_axis() {
        let mut stage = CountingStage {
            position: Position::origin(),
            moves: Vec::new(),
        };
        let reached = stage.move_by(Displacement::new(40, 0, -10)).unwrap();
        assert_eq!(reached, Position::new(40, 0, -10));
        assert_eq!(stage.moves, vec![(Axis::X, 40), (Axis::Z, -10)]);
    }

    #[test]
    fn test_zero_move_only_queries_position() {
        let mut stage = CountingStage {
            position: Position::new(1, 2, 3),
            moves: Vec::new(),
        };
        assert_eq!(
            stage.move_by(Displacement::zero()).unwrap(),
            Position::new(1, 2, 3)
        );
        assert!(stage.moves.is_empty());
    }

    #[test]
    fn test_move_to_is_relative_to_current() {
        let mut stage = CountingStage {
            position: Position::new(100, 100, 0),
            moves: Vec::new(),
        };
        stage.move_to(Position::new(50, 100, 20)).unwrap();
        assert_eq!(stage.moves, vec![(Axis::X, -50), (Axis::Z, 20)]);
    }

    #[test]
    fn test_region_clipping() {
        let roi = RegionOfInterest {
            x: 50,
            y: 10,
            width: 100,
            height: 100,
        };
        let clipped = roi.clipped(64, 48).unwrap();
        assert_eq!((clipped.width, clipped.height), (14, 38));
        assert!(roi.clipped(40, 48).is_none());
    }

    #[test]
    fn test_channel_gains_lookup() {
        let gains = ChannelGains {
            red: 1.5,
            blue: 0.8,
        };
        assert_eq!(gains.for_channel(0), 1.5);
        assert_eq!(gains.for_channel(1), 1.0);
        assert_eq!(gains.for_channel(2), 0.8);
    }
}
