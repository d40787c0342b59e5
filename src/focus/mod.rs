//! Focus measurement and search.
//!
//! - [`metric`]: sharpness scores computed from a single frame
//! - [`autofocus`]: the sweep engine that drives the stage to the sharpest position

pub mod autofocus;
pub mod metric;

pub use autofocus::{AutofocusConfig, AutofocusEngine, FocusReport, FocusSample};
pub use metric::FocusMetric;
