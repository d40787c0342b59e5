//! Common test utilities for microscope_daq integration tests
//!
//! This module provides reusable rigs built from the simulated hardware:
//! - a focus rig (stage plus a sensor with a checkerboard target)
//! - a shaded rig (uniform field behind per-region illumination defects)
//! - a sensor wrapper that fires a cancel token after a set number of captures

#![allow(dead_code)] // Not every test binary uses every helper

use microscope_daq::core::{CancelToken, Position};
use microscope_daq::error::SensorFault;
use microscope_daq::hardware::mock::{Shading, SimulatedSensor, SimulatedStage};
use microscope_daq::hardware::{CaptureSettings, Frame, Sensor};
use ndarray::Array2;

/// Sensor size shared by the rigs. With 16 pixel bins it yields a 3 x 4 gain table.
pub const WIDTH: usize = 64;
pub const HEIGHT: usize = 48;
pub const BIN_SIZE: usize = 16;

/// Noise-free stage and sensor with best focus at `focus_z`.
pub fn focus_rig(start: Position, focus_z: i64) -> (SimulatedStage, SimulatedSensor) {
    let stage = SimulatedStage::at(start);
    let sensor = SimulatedSensor::new(WIDTH, HEIGHT, stage.position_handle())
        .with_focus_z(focus_z)
        .with_depth_of_field(20.0);
    (stage, sensor)
}

/// Uniform field behind `defects`, one factor per gain-table region.
pub fn shaded_rig(defects: Array2<f64>) -> (SimulatedStage, SimulatedSensor) {
    let stage = SimulatedStage::new();
    let sensor = SimulatedSensor::new(WIDTH, HEIGHT, stage.position_handle())
        .uniform_scene()
        .with_shading(Shading::Regions(defects));
    (stage, sensor)
}

/// Assert `actual` is within `tolerance` of `expected`.
pub fn assert_within(actual: i64, expected: i64, tolerance: i64, context: &str) {
    assert!(
        (actual - expected).abs() <= tolerance,
        "{context}: {actual} not within {tolerance} of {expected}"
    );
}

/// Sensor that cancels `token` once it has delivered `after` frames.
pub struct CancelAfter<C> {
    inner: C,
    token: CancelToken,
    after: usize,
    captured: usize,
}

impl<C: Sensor> CancelAfter<C> {
    pub fn new(inner: C, token: CancelToken, after: usize) -> Self {
        Self {
            inner,
            token,
            after,
            captured: 0,
        }
    }

    pub fn captured(&self) -> usize {
        self.captured
    }
}

impl<C: Sensor> Sensor for CancelAfter<C> {
    fn capture(&mut self, settings: &CaptureSettings) -> Result<Frame, SensorFault> {
        let frame = self.inner.capture(settings)?;
        self.captured += 1;
        if self.captured >= self.after {
            self.token.cancel();
        }
        Ok(frame)
    }

    fn resolution(&self) -> (usize, usize) {
        self.inner.resolution()
    }
}
