//! Acquisition results.
//!
//! An [`AcquisitionResult`] is the in-memory record of one plan run: a run header
//! (uid, plan, timestamps, origin) followed by the captured frames in plan order.
//! Writing frames to disk is left to the caller; [`AcquisitionResult::summary`]
//! gives a pixel-free view that serializes cleanly.
//!
//! # Document Flow
//!
//! ```text
//! AcquisitionResult::new   (run header, status Running)
//!    │
//!    ├── push               (one AcquiredFrame per completed step)
//!    │
//! finish / abort            (finished_at + exit status)
//! ```

use crate::core::{Displacement, Position};
use crate::experiment::plans::{PlanKind, ScanPlan};
use crate::hardware::Frame;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Generate a new unique run ID
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    /// Still executing
    Running,
    /// Every step captured
    Success,
    /// Stopped early by a fault or cancellation
    Abort,
}

/// One captured step.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquiredFrame {
    /// Zero-based plan step
    pub index: usize,
    /// Position reported by the stage at capture time
    pub position: Position,
    /// Captured image
    pub frame: Frame,
}

/// Frames of one plan run, in plan order.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionResult {
    /// Unique run identifier
    pub uid: String,
    /// Name of the plan that ran
    pub plan_name: String,
    /// Shape of the plan
    pub kind: PlanKind,
    /// Parameters the plan was built from
    pub plan_args: BTreeMap<String, String>,
    /// When the first step started
    pub started_at: DateTime<Utc>,
    /// When the run ended, if it has
    pub finished_at: Option<DateTime<Utc>>,
    /// How the run ended
    pub exit_status: ExitStatus,
    /// Stage position before the first step
    pub origin: Position,
    /// Captured steps in plan order
    pub entries: Vec<AcquiredFrame>,
}

impl AcquisitionResult {
    /// Empty result for a run of `plan` starting at `origin`.
    pub fn new(plan: &ScanPlan, origin: Position) -> Self {
        Self {
            uid: new_uid(),
            plan_name: plan.name().to_string(),
            kind: plan.kind(),
            plan_args: plan.args().clone(),
            started_at: Utc::now(),
            finished_at: None,
            exit_status: ExitStatus::Running,
            origin,
            entries: Vec::with_capacity(plan.len()),
        }
    }

    /// Append the capture for step `index`.
    pub fn push(&mut self, index: usize, position: Position, frame: Frame) {
        self.entries.push(AcquiredFrame {
            index,
            position,
            frame,
        });
    }

    /// Mark the run complete.
    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
        self.exit_status = ExitStatus::Success;
    }

    /// Mark the run stopped early. Entries so far are kept.
    pub fn abort(&mut self) {
        self.finished_at = Some(Utc::now());
        self.exit_status = ExitStatus::Abort;
    }

    /// Number of captured steps.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Absolute capture positions in plan order.
    pub fn positions(&self) -> Vec<Position> {
        self.entries.iter().map(|e| e.position).collect()
    }

    /// Capture positions relative to the origin.
    pub fn relative_positions(&self) -> Vec<Displacement> {
        self.entries
            .iter()
            .map(|e| self.origin.displacement_to(e.position))
            .collect()
    }

    /// Captured frames in plan order.
    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.entries.iter().map(|e| &e.frame)
    }

    /// Pixel-free description of the run.
    pub fn summary(&self) -> AcquisitionSummary {
        AcquisitionSummary {
            uid: self.uid.clone(),
            plan_name: self.plan_name.clone(),
            kind: self.kind,
            plan_args: self.plan_args.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            exit_status: self.exit_status,
            origin: self.origin,
            entries: self
                .entries
                .iter()
                .map(|e| EntrySummary {
                    index: e.index,
                    position: e.position,
                    relative: self.origin.displacement_to(e.position),
                    frame_number: e.frame.metadata().frame_number,
                    exposure_us: e.frame.metadata().exposure_us,
                    mean: e.frame.mean(),
                    max: e.frame.max_value(),
                })
                .collect(),
        }
    }
}

/// Serializable view of an [`AcquisitionResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionSummary {
    /// Run identifier
    pub uid: String,
    /// Name of the plan that ran
    pub plan_name: String,
    /// Shape of the plan
    pub kind: PlanKind,
    /// Parameters the plan was built from
    pub plan_args: BTreeMap<String, String>,
    /// When the first step started
    pub started_at: DateTime<Utc>,
    /// When the run ended, if it has
    pub finished_at: Option<DateTime<Utc>>,
    /// How the run ended
    pub exit_status: ExitStatus,
    /// Stage position before the first step
    pub origin: Position,
    /// One line per captured step
    pub entries: Vec<EntrySummary>,
}

/// Per-frame line of an [`AcquisitionSummary`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySummary {
    /// Zero-based plan step
    pub index: usize,
    /// Absolute capture position
    pub position: Position,
    /// Capture position relative to the origin
    pub relative: Displacement,
    /// Sensor frame counter
    pub frame_number: u64,
    /// Exposure time in microseconds
    pub exposure_us: u32,
    /// Mean luminance
    pub mean: f64,
    /// Brightest sample
    pub max: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::FrameMetadata;
    use ndarray::Array2;

    fn frame(value: f32) -> Frame {
        Frame::from_luminance(Array2::from_elem((2, 2), value), FrameMetadata::default())
    }

    #[test]
    fn test_new_result_records_plan() {
        let plan = ScanPlan::raster(3, 40, 0);
        let result = AcquisitionResult::new(&plan, Position::new(5, 5, 5));

        assert_eq!(result.plan_name, "raster");
        assert_eq!(result.kind, PlanKind::Raster);
        assert_eq!(result.exit_status, ExitStatus::Running);
        assert!(result.is_empty());
        assert_eq!(result.plan_args.get("n"), Some(&"3".to_string()));
        assert!(Uuid::parse_str(&result.uid).is_ok());
    }

    #[test]
    fn test_relative_positions() {
        let plan = ScanPlan::raster(2, 40, 0);
        let mut result = AcquisitionResult::new(&plan, Position::new(100, 0, 0));
        result.push(0, Position::new(100, 0, 0), frame(1.0));
        result.push(1, Position::new(140, 0, 0), frame(2.0));
        result.finish();

        assert_eq!(
            result.relative_positions(),
            vec![Displacement::zero(), Displacement::new(40, 0, 0)]
        );
        assert_eq!(result.exit_status, ExitStatus::Success);
        assert!(result.finished_at.is_some());
    }

    #[test]
    fn test_summary_serializes_without_pixels() {
        let plan = ScanPlan::z_stack(1, 10);
        let mut result = AcquisitionResult::new(&plan, Position::origin());
        result.push(0, Position::origin(), frame(7.0));
        result.abort();

        let summary = result.summary();
        assert_eq!(summary.entries.len(), 1);
        assert_eq!(summary.entries[0].mean, 7.0);

        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"exit_status\":\"abort\""));
        assert!(json.contains("\"kind\":\"z_stack\""));
        let back: AcquisitionSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(back, summary);
    }

    #[test]
    fn test_uids_are_unique() {
        assert_ne!(new_uid(), new_uid());
    }
}
