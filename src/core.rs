//! Core data types shared by every engine in the controller.
//!
//! The stage works in integer motor steps, so positions and displacements are
//! plain `i64` triples. Moves are always issued as [`Displacement`]s; the stage
//! reports back the resulting [`Position`], which is the only source of truth
//! for where the stage is.
//!
//! # Cancellation
//!
//! Long-running sweeps and scans poll a [`CancelToken`] between steps. A
//! cancelled token never interrupts a move or capture that is already in
//! flight.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Neg, Sub};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// =============================================================================
// Axes
// =============================================================================

/// A stage axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    /// Lateral X
    X,
    /// Lateral Y
    Y,
    /// Focus axis
    Z,
}

impl Axis {
    /// All axes in the order moves are issued.
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    /// Lowercase axis name, as used by the motor board protocol.
    pub fn as_str(&self) -> &'static str {
        match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Positions and displacements
// =============================================================================

/// Absolute stage position in motor steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Position {
    /// X steps
    pub x: i64,
    /// Y steps
    pub y: i64,
    /// Z steps
    pub z: i64,
}

impl Position {
    /// Create a position from its three components.
    pub const fn new(x: i64, y: i64, z: i64) -> Self {
        Self { x, y, z }
    }

    /// The origin `(0, 0, 0)`.
    pub const fn origin() -> Self {
        Self::new(0, 0, 0)
    }

    /// Component along `axis`.
    pub fn get(&self, axis: Axis) -> i64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    /// Copy of this position with the `axis` component replaced.
    pub fn with(mut self, axis: Axis, value: i64) -> Self {
        match axis {
            Axis::X => self.x = value,
            Axis::Y => self.y = value,
            Axis::Z => self.z = value,
        }
        self
    }

    /// Position reached by applying `delta`.
    pub fn offset(&self, delta: Displacement) -> Self {
        Self::new(self.x + delta.dx, self.y + delta.dy, self.z + delta.dz)
    }

    /// Displacement that moves from `self` to `target`.
    pub fn displacement_to(&self, target: Position) -> Displacement {
        Displacement::new(target.x - self.x, target.y - self.y, target.z - self.z)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Relative move in motor steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Displacement {
    /// X steps
    pub dx: i64,
    /// Y steps
    pub dy: i64,
    /// Z steps
    pub dz: i64,
}

impl Displacement {
    /// Create a displacement from its three components.
    pub const fn new(dx: i64, dy: i64, dz: i64) -> Self {
        Self { dx, dy, dz }
    }

    /// The null displacement.
    pub const fn zero() -> Self {
        Self::new(0, 0, 0)
    }

    /// A displacement of `steps` along a single axis.
    pub fn along(axis: Axis, steps: i64) -> Self {
        match axis {
            Axis::X => Self::new(steps, 0, 0),
            Axis::Y => Self::new(0, steps, 0),
            Axis::Z => Self::new(0, 0, steps),
        }
    }

    /// Component along `axis`.
    pub fn get(&self, axis: Axis) -> i64 {
        match axis {
            Axis::X => self.dx,
            Axis::Y => self.dy,
            Axis::Z => self.dz,
        }
    }

    /// True when no axis moves.
    pub fn is_zero(&self) -> bool {
        self.dx == 0 && self.dy == 0 && self.dz == 0
    }

    /// Non-zero components in X, Y, Z order.
    pub fn components(&self) -> Vec<(Axis, i64)> {
        Axis::ALL
            .iter()
            .map(|&axis| (axis, self.get(axis)))
            .filter(|&(_, steps)| steps != 0)
            .collect()
    }

    /// Scale every component by an integer factor.
    pub fn scaled(&self, factor: i64) -> Self {
        Self::new(self.dx * factor, self.dy * factor, self.dz * factor)
    }
}

impl Add for Displacement {
    type Output = Displacement;

    fn add(self, rhs: Displacement) -> Displacement {
        Displacement::new(self.dx + rhs.dx, self.dy + rhs.dy, self.dz + rhs.dz)
    }
}

impl Sub for Displacement {
    type Output = Displacement;

    fn sub(self, rhs: Displacement) -> Displacement {
        Displacement::new(self.dx - rhs.dx, self.dy - rhs.dy, self.dz - rhs.dz)
    }
}

impl Neg for Displacement {
    type Output = Displacement;

    fn neg(self) -> Displacement {
        Displacement::new(-self.dx, -self.dy, -self.dz)
    }
}

impl fmt::Display for Displacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:+}, {:+}, {:+}]", self.dx, self.dy, self.dz)
    }
}

// =============================================================================
// Cancellation
// =============================================================================

/// Cooperative cancellation flag shared between a caller and a running engine.
///
/// Cloning yields a handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Takes effect at the next step boundary.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
