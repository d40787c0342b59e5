//! Error types for the controller.
//!
//! This module defines the primary error type, `MicroscopeError`, for the whole crate.
//! Using the `thiserror` crate, it provides one place where every failure of the
//! acquisition and calibration engines is described.
//!
//! ## Error Hierarchy
//!
//! - **`InvalidSearchRange`**: bad autofocus parameters. A caller error; never retried.
//! - **`NoFocusSignal`**: every frame of an autofocus sweep was featureless. Usually the
//!   target is outside the sweep range.
//! - **`CalibrationDidNotConverge`**: the flat-field loop ran out of iterations. The best
//!   table seen is attached so the caller can decide whether to keep it.
//! - **`Actuator`** / **`Sensor`**: hardware faults, wrapping [`ActuatorFault`] and
//!   [`SensorFault`]. They are propagated unchanged and never retried inside the crate,
//!   because repeating a move after an unconfirmed fault can damage the mechanics.
//! - **`PlanAborted`**: a scan stopped early. Carries the frames acquired before the
//!   failure together with the failure itself.
//! - **`Cancelled`**: the caller's [`CancelToken`](crate::core::CancelToken) fired
//!   between steps.
//! - **`FocusCancelled`**: the token fired during an autofocus sweep. Carries the
//!   samples captured before it fired.
//! - Ambient variants for configuration, settings files and serial protocol errors.
//!
//! By using `#[from]`, the hardware faults and the I/O and parsing errors convert into
//! `MicroscopeError` with the `?` operator.

use crate::calibration::GainTable;
use crate::core::Axis;
use crate::experiment::AcquisitionResult;
use crate::focus::FocusReport;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, MicroscopeError>;

/// Failure reported by a stage while moving or reporting its position.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("actuator fault{}: {message}", .axis.map(|a| format!(" on {a} axis")).unwrap_or_default())]
pub struct ActuatorFault {
    /// Axis that faulted, when known.
    pub axis: Option<Axis>,
    /// Human readable description from the driver.
    pub message: String,
}

impl ActuatorFault {
    /// Fault on a specific axis.
    pub fn on_axis(axis: Axis, message: impl Into<String>) -> Self {
        Self {
            axis: Some(axis),
            message: message.into(),
        }
    }

    /// Fault not tied to one axis (e.g. lost communication).
    pub fn general(message: impl Into<String>) -> Self {
        Self {
            axis: None,
            message: message.into(),
        }
    }
}

/// Failure reported by a sensor while capturing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("sensor fault: {message}")]
pub struct SensorFault {
    /// Human readable description from the driver.
    pub message: String,
}

impl SensorFault {
    /// Create a sensor fault.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Primary error type for the controller.
#[derive(Error, Debug)]
pub enum MicroscopeError {
    /// Autofocus range and step do not describe a sweep.
    #[error("invalid autofocus search: range {range} with step {step} ({reason})")]
    InvalidSearchRange {
        /// Requested sweep range
        range: u32,
        /// Requested sweep step
        step: u32,
        /// Which rule the pair broke
        reason: &'static str,
    },

    /// Every frame of the coarse sweep was featureless.
    #[error("no focus signal: all {samples} frames in the sweep were featureless")]
    NoFocusSignal {
        /// Frames captured in the sweep
        samples: usize,
    },

    #[error(
        "flat-field calibration did not converge after {iterations} iterations \
         (best spread {best_spread:.4}, improving: {improving})"
    )]
    /// The flat-field loop hit its iteration cap.
    CalibrationDidNotConverge {
        /// Lowest-spread table measured during the run.
        best_table: Box<GainTable>,
        /// Spread measured with `best_table` applied
        best_spread: f64,
        /// Iterations run
        iterations: usize,
        /// Spread was still decreasing monotonically over the final three iterations.
        improving: bool,
    },

    /// Stage fault.
    #[error(transparent)]
    Actuator(#[from] ActuatorFault),

    /// Sensor fault.
    #[error(transparent)]
    Sensor(#[from] SensorFault),

    /// A scan stopped before its last step completed.
    #[error("plan aborted at step {step} after {} completed entries: {source}", .partial.len())]
    PlanAborted {
        /// Zero-based index of the step that failed.
        step: usize,
        /// Entries acquired before the failure, in plan order.
        partial: Box<AcquisitionResult>,
        /// What stopped the scan
        source: Box<MicroscopeError>,
    },

    /// The cancel token fired between steps.
    #[error("operation cancelled")]
    Cancelled,

    /// The cancel token fired during an autofocus sweep.
    #[error("autofocus cancelled after {} samples", .partial.samples.len())]
    FocusCancelled {
        /// Samples captured so far and the best of them. The stage is left where
        /// the sweep stopped, not at `partial.best`.
        partial: Box<FocusReport>,
    },

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration loaded but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings file could not be parsed or written.
    #[error("settings file error: {0}")]
    Settings(#[from] serde_yaml::Error),

    /// JSON encoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A device replied with something the driver does not understand.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The operation needs a cargo feature this build lacks.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl MicroscopeError {
    /// True for faults raised by the hardware layer.
    pub fn is_hardware_fault(&self) -> bool {
        match self {
            MicroscopeError::Actuator(_) | MicroscopeError::Sensor(_) => true,
            MicroscopeError::PlanAborted { source, .. } => source.is_hardware_fault(),
            _ => false,
        }
    }

    /// True when a cancel token stopped the operation, directly or inside a scan.
    pub fn is_cancellation(&self) -> bool {
        match self {
            MicroscopeError::Cancelled | MicroscopeError::FocusCancelled { .. } => true,
            MicroscopeError::PlanAborted { source, .. } => source.is_cancellation(),
            _ => false,
        }
    }

    /// Partial acquisition carried by a `PlanAborted` error.
    pub fn partial_result(&self) -> Option<&AcquisitionResult> {
        match self {
            MicroscopeError::PlanAborted { partial, .. } => Some(partial),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MicroscopeError::from(ActuatorFault::on_axis(Axis::Z, "limit switch"));
        assert_eq!(err.to_string(), "actuator fault on z axis: limit switch");

        let err = MicroscopeError::from(SensorFault::new("readout timeout"));
        assert_eq!(err.to_string(), "sensor fault: readout timeout");
    }

    #[test]
    fn test_general_actuator_fault_has_no_axis() {
        let fault = ActuatorFault::general("port closed");
        assert_eq!(fault.to_string(), "actuator fault: port closed");
    }

    #[test]
    fn test_hardware_fault_classification() {
        assert!(MicroscopeError::from(SensorFault::new("x")).is_hardware_fault());
        assert!(!MicroscopeError::Cancelled.is_hardware_fault());
        assert!(!MicroscopeError::NoFocusSignal { samples: 3 }.is_hardware_fault());
    }

    #[test]
    fn test_cancellation_classification() {
        assert!(MicroscopeError::Cancelled.is_cancellation());
        assert!(!MicroscopeError::from(SensorFault::new("x")).is_cancellation());
    }

    #[test]
    fn test_invalid_search_range_message() {
        let err = MicroscopeError::InvalidSearchRange {
            range: 100,
            step: 30,
            reason: "step must evenly divide range",
        };
        assert!(err.to_string().contains("range 100 with step 30"));
    }
}
