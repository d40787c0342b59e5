//! Captured frames.
//!
//! A [`Frame`] is an immutable `rows x cols x channels` grid of intensity samples
//! together with the settings it was captured under. Engines only ever read frames.

use crate::hardware::RegionOfInterest;
use chrono::{DateTime, Utc};
use ndarray::{Array2, Array3, Axis as NdAxis};
use serde::{Deserialize, Serialize};

/// Below this luminance variance a frame is treated as featureless.
pub const DEGENERATE_VARIANCE: f64 = 1e-12;

/// Capture conditions recorded with each frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    /// Sensor frame counter
    pub frame_number: u64,
    /// Exposure time in microseconds
    pub exposure_us: u32,
    /// Analogue gain multiplier
    pub analog_gain: f64,
    /// Whether a flat-field table was applied
    pub gain_table_applied: bool,
    /// Readout window, if not the full sensor
    pub region: Option<RegionOfInterest>,
    /// Capture timestamp
    pub captured_at: DateTime<Utc>,
}

impl Default for FrameMetadata {
    fn default() -> Self {
        Self {
            frame_number: 0,
            exposure_us: 0,
            analog_gain: 1.0,
            gain_table_applied: false,
            region: None,
            captured_at: Utc::now(),
        }
    }
}

/// One captured image.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    samples: Array3<f32>,
    metadata: FrameMetadata,
}

impl Frame {
    /// Wrap a `rows x cols x channels` sample array.
    pub fn new(samples: Array3<f32>, metadata: FrameMetadata) -> Self {
        Self { samples, metadata }
    }

    /// Single-channel frame from a 2-D grid.
    pub fn from_luminance(samples: Array2<f32>, metadata: FrameMetadata) -> Self {
        Self::new(samples.insert_axis(NdAxis(2)), metadata)
    }

    /// Raw samples, `rows x cols x channels`.
    pub fn samples(&self) -> &Array3<f32> {
        &self.samples
    }

    /// Capture conditions.
    pub fn metadata(&self) -> &FrameMetadata {
        &self.metadata
    }

    /// Number of rows.
    pub fn height(&self) -> usize {
        self.samples.dim().0
    }

    /// Number of columns.
    pub fn width(&self) -> usize {
        self.samples.dim().1
    }

    /// Number of colour channels.
    pub fn channels(&self) -> usize {
        self.samples.dim().2
    }

    /// Per-pixel mean over channels.
    pub fn luminance(&self) -> Array2<f64> {
        let (rows, cols, _) = self.samples.dim();
        self.samples
            .mapv(f64::from)
            .mean_axis(NdAxis(2))
            .unwrap_or_else(|| Array2::zeros((rows, cols)))
    }

    /// Mean of each channel over the whole frame.
    pub fn channel_means(&self) -> Vec<f64> {
        self.samples
            .axis_iter(NdAxis(2))
            .map(|plane| plane.mapv(f64::from).mean().unwrap_or(0.0))
            .collect()
    }

    /// Mean luminance.
    pub fn mean(&self) -> f64 {
        self.luminance().mean().unwrap_or(0.0)
    }

    /// Population variance of the luminance.
    pub fn variance(&self) -> f64 {
        let luminance = self.luminance();
        if luminance.is_empty() {
            return 0.0;
        }
        luminance.var(0.0)
    }

    /// Brightest sample over all channels.
    pub fn max_value(&self) -> f32 {
        self.samples.iter().copied().fold(0.0, f32::max)
    }

    /// True when the frame carries no spatial information.
    pub fn is_degenerate(&self) -> bool {
        self.variance() <= DEGENERATE_VARIANCE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_luminance_averages_channels() {
        let mut samples = Array3::<f32>::zeros((2, 2, 3));
        samples[[0, 0, 0]] = 30.0;
        samples[[0, 0, 1]] = 60.0;
        samples[[0, 0, 2]] = 90.0;
        let frame = Frame::new(samples, FrameMetadata::default());
        let luminance = frame.luminance();
        assert!((luminance[[0, 0]] - 60.0).abs() < 1e-9);
        assert_eq!(luminance[[1, 1]], 0.0);
        assert_eq!(frame.channels(), 3);
    }

    #[test]
    fn test_uniform_frame_is_degenerate() {
        let frame = Frame::from_luminance(Array2::from_elem((8, 8), 120.0), FrameMetadata::default());
        assert!(frame.is_degenerate());
        assert_eq!(frame.max_value(), 120.0);
        assert!((frame.mean() - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_textured_frame_has_variance() {
        let frame = Frame::from_luminance(
            array![[0.0, 10.0], [10.0, 0.0]],
            FrameMetadata::default(),
        );
        assert!(!frame.is_degenerate());
        assert!((frame.variance() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_channel_means() {
        let mut samples = Array3::<f32>::zeros((2, 2, 3));
        samples.index_axis_mut(NdAxis(2), 0).fill(4.0);
        samples.index_axis_mut(NdAxis(2), 2).fill(8.0);
        let frame = Frame::new(samples, FrameMetadata::default());
        assert_eq!(frame.channel_means(), vec![4.0, 0.0, 8.0]);
    }
}
