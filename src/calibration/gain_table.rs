//! Flat-field gain table.
//!
//! A [`GainTable`] is a coarse `rows x cols` grid of multiplicative correction
//! factors covering the whole sensor. Pixel `(r, c)` of an `height x width` frame
//! belongs to region `(r * rows / height, c * cols / width)`; the same mapping is
//! used when measuring a frame and when a sensor applies the table, so the two
//! always agree.
//!
//! A table holds one plane of factors shared by every colour channel, or one plane
//! per channel. A per-channel table corrects colour shading as well as brightness
//! shading; it is measured on each channel separately instead of on luminance.

use crate::error::{AppResult, MicroscopeError};
use crate::hardware::Frame;
use ndarray::{Array2, Array3, ArrayView2, Axis as NdAxis};
use serde::{Deserialize, Serialize};

/// Allowed range for a single correction factor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GainClamp {
    /// Smallest factor
    pub min: f64,
    /// Largest factor
    pub max: f64,
}

impl Default for GainClamp {
    fn default() -> Self {
        Self {
            min: 0.1,
            max: 10.0,
        }
    }
}

impl GainClamp {
    /// Clamp `factor` into range.
    pub fn apply(&self, factor: f64) -> f64 {
        factor.clamp(self.min, self.max)
    }
}

/// Per-region multiplicative correction factors.
///
/// Stored as `planes x rows x cols`. Plane `p` corrects colour channel `p`; a table
/// with a single plane applies it to every channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GainTable {
    factors: Array3<f64>,
}

impl GainTable {
    /// Table of `rows x cols` regions, all at unity gain, shared by every channel.
    pub fn neutral(rows: usize, cols: usize) -> Self {
        Self::neutral_per_channel(rows, cols, 1)
    }

    /// Neutral table with one plane per colour channel.
    pub fn neutral_per_channel(rows: usize, cols: usize, channels: usize) -> Self {
        Self {
            factors: Array3::ones((channels.max(1), rows.max(1), cols.max(1))),
        }
    }

    /// Neutral table for a `width x height` sensor binned in `bin_size` pixel squares.
    pub fn for_sensor(width: usize, height: usize, bin_size: usize) -> Self {
        Self::for_sensor_per_channel(width, height, bin_size, 1)
    }

    /// [`for_sensor`](Self::for_sensor) with `channels` planes.
    pub fn for_sensor_per_channel(
        width: usize,
        height: usize,
        bin_size: usize,
        channels: usize,
    ) -> Self {
        let bin = bin_size.max(1);
        Self::neutral_per_channel(height.div_ceil(bin), width.div_ceil(bin), channels)
    }

    /// Wrap explicit factors shared by every channel. Every factor must be finite and
    /// positive.
    pub fn from_factors(factors: Array2<f64>) -> AppResult<Self> {
        Self::from_channel_factors(factors.insert_axis(NdAxis(0)))
    }

    /// Wrap explicit `planes x rows x cols` factors.
    pub fn from_channel_factors(factors: Array3<f64>) -> AppResult<Self> {
        if factors.is_empty() {
            return Err(MicroscopeError::Configuration(
                "gain table must have at least one region".to_string(),
            ));
        }
        if factors.iter().any(|f| !f.is_finite() || *f <= 0.0) {
            return Err(MicroscopeError::Configuration(
                "gain table factors must be finite and positive".to_string(),
            ));
        }
        Ok(Self { factors })
    }

    /// Number of factor planes: one for a shared table, one per channel otherwise.
    pub fn planes(&self) -> usize {
        self.factors.dim().0
    }

    /// True when each colour channel has its own plane.
    pub fn is_per_channel(&self) -> bool {
        self.planes() > 1
    }

    /// Number of region rows.
    pub fn rows(&self) -> usize {
        self.factors.dim().1
    }

    /// Number of region columns.
    pub fn cols(&self) -> usize {
        self.factors.dim().2
    }

    /// `(planes, rows, cols)`.
    pub fn shape(&self) -> (usize, usize, usize) {
        self.factors.dim()
    }

    /// Factors of the first plane, which is the whole table unless it is per-channel.
    pub fn factors(&self) -> ArrayView2<'_, f64> {
        self.plane(0)
    }

    /// Factors applied to colour channel `channel`.
    pub fn plane(&self, channel: usize) -> ArrayView2<'_, f64> {
        self.factors.index_axis(NdAxis(0), self.plane_index(channel))
    }

    /// Every plane, `planes x rows x cols`.
    pub fn channel_factors(&self) -> &Array3<f64> {
        &self.factors
    }

    /// Factor for region `(row, col)` of the first plane.
    pub fn factor(&self, row: usize, col: usize) -> f64 {
        self.channel_factor(0, row, col)
    }

    /// Factor for region `(row, col)` as applied to `channel`.
    pub fn channel_factor(&self, channel: usize, row: usize, col: usize) -> f64 {
        self.factors[[self.plane_index(channel), row, col]]
    }

    /// True when every factor is exactly one.
    pub fn is_neutral(&self) -> bool {
        self.factors.iter().all(|&f| f == 1.0)
    }

    /// Region containing pixel `(row, col)` of a `height x width` frame.
    pub fn region_of(&self, row: usize, col: usize, height: usize, width: usize) -> (usize, usize) {
        region_index(row, col, height, width, self.rows(), self.cols())
    }

    /// Multiply every sample in place by the factor of its region.
    ///
    /// `origin` is the sensor coordinate of `samples[[0, 0, _]]` and `sensor` the
    /// full `(height, width)`, so a cropped readout is corrected with the factors of
    /// the regions it was cut from.
    pub fn apply(&self, samples: &mut Array3<f32>, origin: (usize, usize), sensor: (usize, usize)) {
        let (sensor_height, sensor_width) = sensor;
        for ((r, c, ch), sample) in samples.indexed_iter_mut() {
            let (region_row, region_col) =
                self.region_of(origin.0 + r, origin.1 + c, sensor_height, sensor_width);
            let factor = self.factors[[self.plane_index(ch), region_row, region_col]];
            *sample = (f64::from(*sample) * factor) as f32;
        }
    }

    /// Region means of `frame`, one plane per table plane.
    ///
    /// A shared table is measured on luminance, a per-channel table on each channel.
    pub fn region_means(&self, frame: &Frame) -> Array3<f64> {
        let (rows, cols) = (self.rows(), self.cols());
        if !self.is_per_channel() {
            return region_means(frame, rows, cols).insert_axis(NdAxis(0));
        }
        let mut means = Array3::<f64>::zeros(self.factors.dim());
        for (plane, mut out) in means.axis_iter_mut(NdAxis(0)).enumerate() {
            out.assign(&channel_region_means(frame, plane, rows, cols));
        }
        means
    }

    /// Next table in the feedback loop: `old * (target / mean)^damping`, clamped.
    ///
    /// `region_means` has the table's shape and `targets` one entry per plane.
    /// Regions with no signal get the clamp's maximum factor.
    pub fn corrected(
        &self,
        region_means: &Array3<f64>,
        targets: &[f64],
        clamp: GainClamp,
        damping: f64,
    ) -> GainTable {
        let mut factors = self.factors.clone();
        for ((p, r, c), factor) in factors.indexed_iter_mut() {
            let mean = region_means[[p, r, c]];
            let target = targets.get(p).copied().unwrap_or(0.0);
            let next = if mean > 0.0 {
                *factor * (target / mean).powf(damping)
            } else {
                clamp.max
            };
            *factor = clamp.apply(next);
        }
        GainTable { factors }
    }

    /// Largest absolute factor difference to `other`. Infinite if shapes differ.
    pub fn max_deviation(&self, other: &GainTable) -> f64 {
        if self.factors.dim() != other.factors.dim() {
            return f64::INFINITY;
        }
        self.factors
            .iter()
            .zip(other.factors.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }

    fn plane_index(&self, channel: usize) -> usize {
        channel.min(self.planes() - 1)
    }
}

fn region_index(
    row: usize,
    col: usize,
    height: usize,
    width: usize,
    rows: usize,
    cols: usize,
) -> (usize, usize) {
    let region_row = (row * rows / height.max(1)).min(rows - 1);
    let region_col = (col * cols / width.max(1)).min(cols - 1);
    (region_row, region_col)
}

/// Mean luminance of each of `rows x cols` regions of `frame`.
///
/// Regions that receive no pixels (more regions than pixels) report zero.
pub fn region_means(frame: &Frame, rows: usize, cols: usize) -> Array2<f64> {
    binned_means(frame.luminance().view(), rows, cols)
}

/// Mean of colour channel `channel` over each of `rows x cols` regions of `frame`.
///
/// A frame with fewer channels is measured on its last one.
pub fn channel_region_means(frame: &Frame, channel: usize, rows: usize, cols: usize) -> Array2<f64> {
    let samples = frame.samples();
    if samples.is_empty() {
        return Array2::zeros((rows.max(1), cols.max(1)));
    }
    let index = channel.min(frame.channels() - 1);
    let plane = samples.index_axis(NdAxis(2), index).mapv(f64::from);
    binned_means(plane.view(), rows, cols)
}

fn binned_means(values: ArrayView2<'_, f64>, rows: usize, cols: usize) -> Array2<f64> {
    let rows = rows.max(1);
    let cols = cols.max(1);
    let (height, width) = values.dim();
    let mut sums = Array2::<f64>::zeros((rows, cols));
    let mut counts = Array2::<f64>::zeros((rows, cols));
    for ((r, c), value) in values.indexed_iter() {
        let idx = region_index(r, c, height, width, rows, cols);
        sums[idx] += value;
        counts[idx] += 1.0;
    }
    sums.zip_mut_with(&counts, |sum, &count| {
        *sum = if count > 0.0 { *sum / count } else { 0.0 };
    });
    sums
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::FrameMetadata;
    use ndarray::array;

    #[test]
    fn test_table_shape_rounds_up() {
        let table = GainTable::for_sensor(64, 50, 8);
        assert_eq!((table.rows(), table.cols()), (7, 8));
        assert!(table.is_neutral());
    }

    #[test]
    fn test_region_mapping_matches_bins() {
        let table = GainTable::neutral(6, 8);
        assert_eq!(table.region_of(0, 0, 48, 64), (0, 0));
        assert_eq!(table.region_of(7, 7, 48, 64), (0, 0));
        assert_eq!(table.region_of(8, 8, 48, 64), (1, 1));
        assert_eq!(table.region_of(47, 63, 48, 64), (5, 7));
    }

    #[test]
    fn test_region_means_of_quadrants() {
        let frame = Frame::from_luminance(
            array![
                [10.0, 10.0, 20.0, 20.0],
                [10.0, 10.0, 20.0, 20.0],
                [30.0, 30.0, 40.0, 40.0],
                [30.0, 30.0, 40.0, 40.0]
            ],
            FrameMetadata::default(),
        );
        let means = region_means(&frame, 2, 2);
        assert_eq!(means, array![[10.0, 20.0], [30.0, 40.0]]);
    }

    #[test]
    fn test_correction_moves_regions_to_target_and_clamps() {
        let table = GainTable::neutral(1, 3);
        let means = array![[50.0, 100.0, 0.5]].insert_axis(NdAxis(0));
        let next = table.corrected(&means, &[100.0], GainClamp::default(), 1.0);
        assert_eq!(next.factor(0, 0), 2.0);
        assert_eq!(next.factor(0, 1), 1.0);
        // 200x would be needed; clamped to the maximum
        assert_eq!(next.factor(0, 2), 10.0);
    }

    #[test]
    fn test_damped_correction_is_partial() {
        let table = GainTable::neutral(1, 1);
        let means = array![[25.0]].insert_axis(NdAxis(0));
        let next = table.corrected(&means, &[100.0], GainClamp::default(), 0.5);
        assert!((next.factor(0, 0) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_apply_uses_sensor_coordinates_for_crops() {
        let table = GainTable::from_factors(array![[1.0, 2.0], [3.0, 4.0]]).unwrap();
        let mut crop = Array3::<f32>::ones((2, 2, 1));
        // Bottom-right quadrant of a 4x4 sensor
        table.apply(&mut crop, (2, 2), (4, 4));
        assert!(crop.iter().all(|&v| v == 4.0));
    }

    #[test]
    fn test_rejects_non_positive_factors() {
        assert!(GainTable::from_factors(array![[1.0, 0.0]]).is_err());
        assert!(GainTable::from_factors(array![[1.0, f64::NAN]]).is_err());
    }

    #[test]
    fn test_max_deviation() {
        let a = GainTable::neutral(2, 2);
        let b = GainTable::from_factors(array![[1.0, 1.2], [0.9, 1.0]]).unwrap();
        assert!((a.max_deviation(&b) - 0.2).abs() < 1e-12);
        assert!(a.max_deviation(&GainTable::neutral(3, 2)).is_infinite());
    }

    #[test]
    fn test_per_channel_table_applies_each_plane() {
        let mut factors = Array3::<f64>::ones((3, 1, 2));
        factors[[0, 0, 1]] = 2.0;
        factors[[2, 0, 0]] = 0.5;
        let table = GainTable::from_channel_factors(factors).unwrap();
        assert!(table.is_per_channel());

        let mut samples = Array3::<f32>::from_elem((1, 2, 3), 10.0);
        table.apply(&mut samples, (0, 0), (1, 2));
        assert_eq!(samples[[0, 1, 0]], 20.0);
        assert_eq!(samples[[0, 0, 2]], 5.0);
        assert_eq!(samples[[0, 0, 1]], 10.0);
    }

    #[test]
    fn test_per_channel_means_and_correction() {
        let mut samples = Array3::<f32>::zeros((2, 2, 3));
        samples.index_axis_mut(NdAxis(2), 0).fill(50.0);
        samples.index_axis_mut(NdAxis(2), 1).fill(100.0);
        samples.index_axis_mut(NdAxis(2), 2).fill(25.0);
        let frame = Frame::new(samples, FrameMetadata::default());

        let table = GainTable::neutral_per_channel(1, 1, 3);
        let means = table.region_means(&frame);
        assert_eq!(means.iter().copied().collect::<Vec<_>>(), vec![50.0, 100.0, 25.0]);

        let next = table.corrected(&means, &[100.0, 100.0, 100.0], GainClamp::default(), 1.0);
        assert_eq!(next.channel_factor(0, 0, 0), 2.0);
        assert_eq!(next.channel_factor(1, 0, 0), 1.0);
        assert_eq!(next.channel_factor(2, 0, 0), 4.0);
    }

    #[test]
    fn test_shared_table_serves_every_channel() {
        let table = GainTable::from_factors(array![[1.5]]).unwrap();
        assert_eq!(table.shape(), (1, 1, 1));
        assert_eq!(table.channel_factor(2, 0, 0), 1.5);
    }
}
