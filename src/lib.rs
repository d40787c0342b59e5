//! Core library for the microscope_daq controller.
//!
//! This library contains the hardware ports, the closed-loop engines (autofocus,
//! flat-field calibration, scan orchestration) and the configuration and settings
//! layers around them. It is used by the `microscope_daq` command-line binary.
//!
//! Everything runs on the caller's thread: one engine drives the stage and sensor
//! at a time, and every hardware call blocks until it completes.

pub mod adapters;
pub mod calibration;
pub mod config;
pub mod core;
pub mod error;
pub mod experiment;
pub mod focus;
pub mod hardware;
pub mod logging;
pub mod microscope;
pub mod settings;

pub use error::{AppResult, MicroscopeError};
pub use microscope::Microscope;
