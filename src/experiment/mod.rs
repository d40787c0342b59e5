//! Scan plans and their execution.
//!
//! - **Plans**: immutable sequences of relative steps (raster, Z-stack, edge scan)
//! - **Orchestrator**: drives the stage and sensor through a plan, autofocusing where
//!   a step asks for it
//! - **Documents**: the ordered frames of a run plus a serializable summary
//!
//! # Example
//!
//! ```rust,ignore
//! use microscope_daq::experiment::{ScanOrchestrator, ScanPlan};
//!
//! let mut orchestrator = ScanOrchestrator::new(&mut stage, &mut sensor);
//! let result = orchestrator.run(&ScanPlan::z_stack(11, 20))?;
//! println!("{}", serde_json::to_string_pretty(&result.summary())?);
//! ```

pub mod document;
pub mod orchestrator;
pub mod plans;

pub use document::{AcquiredFrame, AcquisitionResult, AcquisitionSummary, EntrySummary, ExitStatus};
pub use orchestrator::{ScanConfig, ScanOrchestrator};
pub use plans::{dz_array, log_dz_array, AutofocusRequest, PlanKind, ScanPlan, ScanStep};
