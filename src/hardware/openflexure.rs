//! OpenFlexure motor board driver.
//!
//! The board speaks a newline-terminated text protocol at 115200 baud, 8N1. Every
//! command is answered with exactly one line.
//!
//! | Command          | Reply                   |
//! |------------------|-------------------------|
//! | `mrx <n>` etc.   | acknowledgement         |
//! | `p?`             | `<x> <y> <z>`           |
//! | `ramp_time?`     | `ramp time <us>`        |
//! | `dt?`            | `minimum step delay <us>` |
//! | `release`        | acknowledgement         |
//!
//! On power-up the board prints a banner starting with [`BANNER`].
//!
//! Backlash is corrected here, not in the engines: negative moves overshoot by the
//! axis backlash and come back, so every target is approached from below.

use crate::adapters::LineTransport;
use crate::core::{Axis, Position};
use crate::error::{ActuatorFault, AppResult, MicroscopeError};
use crate::hardware::Stage;
use tracing::{debug, info};

/// Start of the power-up banner.
pub const BANNER: &str = "OpenFlexure Motor Board";

/// Baud rate of the board.
pub const BAUD_RATE: u32 = 115_200;

/// Motor board on a line transport.
pub struct OpenFlexureStage<T: LineTransport> {
    transport: T,
    backlash: [i64; 3],
}

impl<T: LineTransport> OpenFlexureStage<T> {
    /// Wait for the banner and wrap the transport.
    pub fn connect(mut transport: T) -> AppResult<Self> {
        let banner = transport.read_line()?;
        if !banner.starts_with(BANNER) {
            return Err(MicroscopeError::Protocol(format!(
                "unexpected banner from motor board: '{banner}'"
            )));
        }
        info!(%banner, "OpenFlexure: connected");
        Ok(Self {
            transport,
            backlash: [0; 3],
        })
    }

    /// Same backlash correction on every axis.
    pub fn with_backlash(self, steps: i64) -> Self {
        self.with_axis_backlash([steps; 3])
    }

    /// Per-axis backlash correction, X, Y, Z.
    pub fn with_axis_backlash(mut self, steps: [i64; 3]) -> Self {
        self.backlash = steps.map(|s| s.max(0));
        self
    }

    /// Backlash correction on `axis` in steps.
    pub fn backlash(&self, axis: Axis) -> i64 {
        self.backlash[axis_index(axis)]
    }

    /// De-energise the motor coils.
    pub fn release_motors(&mut self) -> AppResult<()> {
        self.transport.query("release")?;
        Ok(())
    }

    /// Acceleration ramp time in microseconds.
    pub fn ramp_time(&mut self) -> AppResult<i64> {
        let reply = self.transport.query("ramp_time?")?;
        parse_labelled(&reply, "ramp time")
    }

    /// Set the acceleration ramp; negative disables acceleration.
    pub fn set_ramp_time(&mut self, us: i64) -> AppResult<()> {
        self.transport.query(&format!("ramp_time {us}"))?;
        Ok(())
    }

    /// Minimum delay between steps in microseconds.
    pub fn step_time(&mut self) -> AppResult<i64> {
        let reply = self.transport.query("dt?")?;
        parse_labelled(&reply, "minimum step delay")
    }

    /// Set the minimum delay between steps.
    pub fn set_step_time(&mut self, us: i64) -> AppResult<()> {
        self.transport.query(&format!("dt {us}"))?;
        Ok(())
    }

    /// Underlying line transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Give back the transport.
    pub fn into_inner(self) -> T {
        self.transport
    }

    fn raw_move(&mut self, axis: Axis, steps: i64) -> Result<(), ActuatorFault> {
        let command = format!("mr{axis} {steps}");
        let reply = self
            .transport
            .query(&command)
            .map_err(|e| ActuatorFault::on_axis(axis, e.to_string()))?;
        debug!(%command, %reply, "OpenFlexure: move acknowledged");
        Ok(())
    }
}

impl<T: LineTransport> Stage for OpenFlexureStage<T> {
    fn move_relative(&mut self, axis: Axis, delta: i64) -> Result<Position, ActuatorFault> {
        let backlash = self.backlash(axis);
        if delta < 0 && backlash > 0 {
            self.raw_move(axis, delta - backlash)?;
            self.raw_move(axis, backlash)?;
        } else if delta != 0 {
            self.raw_move(axis, delta)?;
        }
        self.position()
    }

    fn position(&mut self) -> Result<Position, ActuatorFault> {
        let reply = self
            .transport
            .query("p?")
            .map_err(|e| ActuatorFault::general(e.to_string()))?;
        parse_position(&reply).map_err(|e| ActuatorFault::general(e.to_string()))
    }
}

fn axis_index(axis: Axis) -> usize {
    match axis {
        Axis::X => 0,
        Axis::Y => 1,
        Axis::Z => 2,
    }
}

/// Parse a `"<x> <y> <z>"` position reply.
pub fn parse_position(reply: &str) -> AppResult<Position> {
    let values: Vec<i64> = reply
        .split_whitespace()
        .map(str::parse)
        .collect::<Result<_, _>>()
        .map_err(|_| MicroscopeError::Protocol(format!("malformed position reply: '{reply}'")))?;
    match values.as_slice() {
        [x, y, z] => Ok(Position::new(*x, *y, *z)),
        _ => Err(MicroscopeError::Protocol(format!(
            "expected three coordinates, got '{reply}'"
        ))),
    }
}

fn parse_labelled(reply: &str, label: &str) -> AppResult<i64> {
    reply
        .strip_prefix(label)
        .and_then(|rest| rest.trim().parse().ok())
        .ok_or_else(|| MicroscopeError::Protocol(format!("expected '{label} <n>', got '{reply}'")))
}
