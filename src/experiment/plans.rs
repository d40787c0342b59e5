//! Scan plans.
//!
//! A [`ScanPlan`] is an ordered list of [`ScanStep`]s. Every step is relative: a
//! displacement from wherever the previous step left the stage, optionally preceded by
//! an autofocus. A plan therefore composes regardless of the absolute start position,
//! and the orchestrator only ever iterates it.
//!
//! # Standard shapes
//!
//! - [`ScanPlan::raster`]: N captures along a fixed lateral vector, no autofocus
//! - [`ScanPlan::z_stack`]: N captures along Z at a fixed spacing, no autofocus
//! - [`ScanPlan::edge_scan`]: one or three lateral sites, each autofocused and then
//!   imaged through a short Z-stack around the focus found there
//!
//! Offset generators ([`dz_array`], [`log_dz_array`]) produce absolute Z offsets that
//! [`ScanPlan::from_offsets`] turns into relative steps.

use crate::core::{Axis, Displacement};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Shape of a plan, recorded with its results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    /// Evenly spaced lateral sites
    Raster,
    /// Evenly spaced focal planes
    ZStack,
    /// Autofocused Z-stacks at up to three sites
    EdgeScan,
    /// Hand-built step list
    Custom,
}

impl fmt::Display for PlanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlanKind::Raster => "raster",
            PlanKind::ZStack => "z_stack",
            PlanKind::EdgeScan => "edge_scan",
            PlanKind::Custom => "custom",
        };
        f.write_str(name)
    }
}

/// Autofocus to run before a step's move.
///
/// The stage first moves by `approach`, then the Z axis is swept. Range and step fall
/// back to the orchestrator's autofocus defaults when unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AutofocusRequest {
    /// Move made before the sweep
    pub approach: Displacement,
    /// Sweep range in steps
    pub search_range: Option<u32>,
    /// Sweep step in steps
    pub step_size: Option<u32>,
}

impl AutofocusRequest {
    /// Sweep `range` in increments of `step`.
    pub fn with_search(range: u32, step: u32) -> Self {
        Self {
            approach: Displacement::zero(),
            search_range: Some(range),
            step_size: Some(step),
        }
    }

    /// Move by `approach` before sweeping.
    pub fn with_approach(mut self, approach: Displacement) -> Self {
        self.approach = approach;
        self
    }
}

/// One step of a plan: optional autofocus, a relative move, one capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStep {
    /// Relative move before the capture
    pub delta: Displacement,
    /// Autofocus to run before the move
    pub autofocus: Option<AutofocusRequest>,
}

impl ScanStep {
    /// Move by `delta` and capture.
    pub fn move_by(delta: Displacement) -> Self {
        Self {
            delta,
            autofocus: None,
        }
    }

    /// Autofocus, move by `delta`, capture.
    pub fn focus_then_move(request: AutofocusRequest, delta: Displacement) -> Self {
        Self {
            delta,
            autofocus: Some(request),
        }
    }
}

/// An ordered, immutable acquisition sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanPlan {
    name: String,
    kind: PlanKind,
    steps: Vec<ScanStep>,
    /// Parameters the plan was built from, recorded with the results
    args: BTreeMap<String, String>,
}

impl ScanPlan {
    /// Plan from explicit steps.
    pub fn new(name: impl Into<String>, kind: PlanKind, steps: Vec<ScanStep>) -> Self {
        Self {
            name: name.into(),
            kind,
            steps,
            args: BTreeMap::new(),
        }
    }

    /// Record a build parameter.
    pub fn with_arg(mut self, key: &str, value: impl ToString) -> Self {
        self.args.insert(key.to_string(), value.to_string());
        self
    }

    /// Plan visiting absolute `offsets` from the start position in order.
    pub fn from_offsets(name: impl Into<String>, kind: PlanKind, offsets: &[Displacement]) -> Self {
        let steps = offsets_to_deltas(offsets)
            .into_iter()
            .map(ScanStep::move_by)
            .collect();
        Self::new(name, kind, steps)
    }

    /// `n` captures along `(dx, dy)`, the first at the start position.
    pub fn raster(n: usize, dx: i64, dy: i64) -> Self {
        let vector = Displacement::new(dx, dy, 0);
        let steps = (0..n)
            .map(|i| ScanStep::move_by(if i == 0 { Displacement::zero() } else { vector }))
            .collect();
        Self::new("raster", PlanKind::Raster, steps)
            .with_arg("n", n)
            .with_arg("dx", dx)
            .with_arg("dy", dy)
    }

    /// `n` captures along `(dx, dy)`, symmetric about the start position.
    pub fn centred_raster(n: usize, dx: i64, dy: i64) -> Self {
        let offsets: Vec<Displacement> = centred_multiples(n)
            .map(|k| {
                Displacement::new((k * dx as f64).round() as i64, (k * dy as f64).round() as i64, 0)
            })
            .collect();
        Self::from_offsets("centred_raster", PlanKind::Raster, &offsets)
            .with_arg("n", n)
            .with_arg("dx", dx)
            .with_arg("dy", dy)
    }

    /// `n` captures `step` apart along Z, the first at the start position.
    pub fn z_stack(n: usize, step: i64) -> Self {
        let vector = Displacement::along(Axis::Z, step);
        let steps = (0..n)
            .map(|i| ScanStep::move_by(if i == 0 { Displacement::zero() } else { vector }))
            .collect();
        Self::new("z_stack", PlanKind::ZStack, steps)
            .with_arg("n", n)
            .with_arg("step", step)
    }

    /// Captures at absolute Z `offsets` from the start position.
    pub fn centred_z_stack(offsets: &[i64]) -> Self {
        let offsets: Vec<Displacement> = offsets
            .iter()
            .map(|&dz| Displacement::along(Axis::Z, dz))
            .collect();
        Self::from_offsets("centred_z_stack", PlanKind::ZStack, &offsets)
            .with_arg("n", offsets.len())
    }

    /// Edge scan over one site (the start) or three (start - shift, start, start + shift).
    ///
    /// At each site the stage is autofocused with `focus` and then imaged at every
    /// Z offset in `z_offsets`, relative to the focus found there. Between sites the Z
    /// axis is first brought back to the previous site's focus height so each
    /// autofocus sweep starts near focus.
    pub fn edge_scan(shift: Option<(i64, i64)>, z_offsets: &[i64], focus: AutofocusRequest) -> Self {
        let sites: Vec<Displacement> = match shift {
            Some((dx, dy)) => {
                let shift = Displacement::new(dx, dy, 0);
                vec![-shift, Displacement::zero(), shift]
            }
            None => vec![Displacement::zero()],
        };

        let mut steps = Vec::with_capacity(sites.len() * z_offsets.len());
        let mut previous_site = Displacement::zero();
        let mut previous_offset = 0;
        for site in &sites {
            let approach = *site - previous_site + Displacement::along(Axis::Z, -previous_offset);
            let mut last = 0;
            for (i, &offset) in z_offsets.iter().enumerate() {
                let delta = Displacement::along(Axis::Z, offset - last);
                steps.push(if i == 0 {
                    ScanStep::focus_then_move(focus.with_approach(approach), delta)
                } else {
                    ScanStep::move_by(delta)
                });
                last = offset;
            }
            previous_site = *site;
            previous_offset = last;
        }

        let mut plan = Self::new("edge_scan", PlanKind::EdgeScan, steps)
            .with_arg("sites", sites.len())
            .with_arg("z_points", z_offsets.len());
        if let Some((dx, dy)) = shift {
            plan = plan.with_arg("shift", format!("{dx},{dy}"));
        }
        plan
    }

    /// Plan name, recorded with the results.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shape of the plan.
    pub fn kind(&self) -> PlanKind {
        self.kind
    }

    /// Steps in execution order.
    pub fn steps(&self) -> &[ScanStep] {
        &self.steps
    }

    /// Parameters recorded with the results.
    pub fn args(&self) -> &BTreeMap<String, String> {
        &self.args
    }

    /// Number of steps, which is also the number of frames a full run captures.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True for a plan with no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Sum of all step deltas and autofocus approaches (autofocus corrections excluded).
    pub fn nominal_travel(&self) -> Displacement {
        self.steps.iter().fold(Displacement::zero(), |acc, step| {
            let approach = step.autofocus.map(|a| a.approach).unwrap_or_default();
            acc + approach + step.delta
        })
    }
}

/// `k - (n - 1) / 2` for `k = 0..n`.
fn centred_multiples(n: usize) -> impl Iterator<Item = f64> {
    let middle = (n as f64 - 1.0) / 2.0;
    (0..n).map(move |k| k as f64 - middle)
}

/// First delta is the first offset; each later delta is the difference to the previous.
pub fn offsets_to_deltas(offsets: &[Displacement]) -> Vec<Displacement> {
    let mut previous = Displacement::zero();
    offsets
        .iter()
        .map(|&offset| {
            let delta = offset - previous;
            previous = offset;
            delta
        })
        .collect()
}

/// `n` Z offsets spaced `step` apart, centred on zero.
pub fn dz_array(step: i64, n: usize) -> Vec<i64> {
    centred_multiples(n)
        .map(|k| (k * step as f64).round() as i64)
        .collect()
}

/// `n` Z offsets centred on zero whose spacing grows by `factor` away from the centre.
///
/// The innermost spacing is `min_step`. For even `n` the two innermost points sit at
/// `±min_step / 2`.
pub fn log_dz_array(min_step: f64, factor: f64, n: usize) -> Vec<i64> {
    let half = n / 2;
    let mut half_dz: Vec<f64> = (0..half)
        .scan(0.0, |total, i| {
            *total += min_step * factor.powi(i as i32);
            Some(*total)
        })
        .collect();

    let mut offsets: Vec<f64> = Vec::with_capacity(n);
    if n % 2 == 1 {
        offsets.extend(half_dz.iter().rev().map(|d| -d));
        offsets.push(0.0);
        offsets.extend(half_dz.iter().copied());
    } else {
        if let Some(first) = half_dz.first_mut() {
            *first /= 2.0;
        }
        offsets.extend(half_dz.iter().rev().map(|d| -d));
        offsets.extend(half_dz.iter().copied());
    }
    offsets.into_iter().map(|d| d.round() as i64).collect()
}
