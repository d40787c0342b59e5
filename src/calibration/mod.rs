//! Sensor calibration.
//!
//! - [`gain_table`]: the per-region correction table handed to the sensor with every capture
//! - [`flat_field`]: the closed-loop lens-shading calibration that produces it
//! - [`exposure`]: auto-exposure and white-balance helpers run around calibration

pub mod exposure;
pub mod flat_field;
pub mod gain_table;

pub use exposure::{auto_expose, white_balance};
pub use flat_field::{CalibrationIteration, FlatFieldCalibrator, FlatFieldConfig};
pub use gain_table::{GainClamp, GainTable};
