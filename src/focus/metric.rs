//! Image sharpness metrics.
//!
//! All metrics are pure functions of a frame's luminance. They grow with
//! high-frequency content and return zero for a featureless frame.

use crate::hardware::Frame;
use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};

/// Frames larger than this (in either dimension) are decimated before the
/// Laplacian is taken.
pub const MAX_METRIC_DIMENSION: usize = 1000;

/// Sharpness metric used by the autofocus engine.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FocusMetric {
    /// Mean fourth power of the 4-neighbour Laplacian. General purpose.
    #[default]
    LaplacianFourth,
    /// Summed squared response of a `[-1; n] ++ [1; n]` step kernel, horizontally and
    /// vertically. Suited to line and edge targets.
    EdgeEnergy {
        /// Kernel half width `n`
        half_width: usize,
    },
    /// Luminance variance.
    Variance,
}

impl FocusMetric {
    /// Sharpness score of `frame`.
    pub fn score(&self, frame: &Frame) -> f64 {
        let luminance = frame.luminance();
        match *self {
            FocusMetric::LaplacianFourth => laplacian_fourth(&decimate(&luminance)),
            FocusMetric::EdgeEnergy { half_width } => edge_energy(&luminance, half_width.max(1)),
            FocusMetric::Variance => {
                if luminance.is_empty() {
                    0.0
                } else {
                    luminance.var(0.0)
                }
            }
        }
    }
}

/// Keep every `k`th row and column so neither dimension exceeds
/// [`MAX_METRIC_DIMENSION`].
fn decimate(image: &Array2<f64>) -> Array2<f64> {
    let (rows, cols) = image.dim();
    let stride = rows.max(cols).div_ceil(MAX_METRIC_DIMENSION).max(1);
    if stride == 1 {
        return image.clone();
    }
    let step = stride as isize;
    image.slice(s![..;step, ..;step]).to_owned()
}

/// Mean of `laplace(image)^4`, with edge-replicated borders.
fn laplacian_fourth(image: &Array2<f64>) -> f64 {
    let (rows, cols) = image.dim();
    if rows == 0 || cols == 0 {
        return 0.0;
    }
    let at = |r: isize, c: isize| -> f64 {
        let r = r.clamp(0, rows as isize - 1) as usize;
        let c = c.clamp(0, cols as isize - 1) as usize;
        image[[r, c]]
    };
    let mut total = 0.0;
    for r in 0..rows as isize {
        for c in 0..cols as isize {
            let lap = at(r - 1, c) + at(r + 1, c) + at(r, c - 1) + at(r, c + 1) - 4.0 * at(r, c);
            total += lap.powi(4);
        }
    }
    total / (rows * cols) as f64
}

/// Summed squared step-kernel response over the valid region of each direction.
fn edge_energy(image: &Array2<f64>, half_width: usize) -> f64 {
    let horizontal: f64 = image
        .rows()
        .into_iter()
        .map(|line| line_energy(&line.to_vec(), half_width))
        .sum();
    let vertical: f64 = image
        .columns()
        .into_iter()
        .map(|line| line_energy(&line.to_vec(), half_width))
        .sum();
    horizontal + vertical
}

/// Energy of `sum(right window) - sum(left window)` along one line, via prefix sums.
fn line_energy(line: &[f64], n: usize) -> f64 {
    if line.len() < 2 * n {
        return 0.0;
    }
    let mut prefix = Vec::with_capacity(line.len() + 1);
    prefix.push(0.0);
    for value in line {
        let last = prefix[prefix.len() - 1];
        prefix.push(last + value);
    }
    (0..=line.len() - 2 * n)
        .map(|start| {
            let left = prefix[start + n] - prefix[start];
            let right = prefix[start + 2 * n] - prefix[start + n];
            (right - left).powi(2)
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::FrameMetadata;

    fn checkerboard(size: usize, amplitude: f32) -> Frame {
        let image = Array2::from_shape_fn((size, size), |(r, c)| {
            if (r + c) % 2 == 0 {
                100.0 + amplitude
            } else {
                100.0 - amplitude
            }
        });
        Frame::from_luminance(image, FrameMetadata::default())
    }

    fn flat(size: usize) -> Frame {
        Frame::from_luminance(Array2::from_elem((size, size), 80.0), FrameMetadata::default())
    }

    #[test]
    fn test_flat_frame_scores_zero() {
        for metric in [
            FocusMetric::LaplacianFourth,
            FocusMetric::EdgeEnergy { half_width: 2 },
            FocusMetric::Variance,
        ] {
            assert_eq!(metric.score(&flat(16)), 0.0, "{metric:?}");
        }
    }

    #[test]
    fn test_scores_increase_with_contrast() {
        for metric in [
            FocusMetric::LaplacianFourth,
            FocusMetric::EdgeEnergy { half_width: 1 },
            FocusMetric::Variance,
        ] {
            let soft = metric.score(&checkerboard(16, 5.0));
            let sharp = metric.score(&checkerboard(16, 20.0));
            assert!(sharp > soft, "{metric:?}: {sharp} <= {soft}");
        }
    }

    #[test]
    fn test_laplacian_of_checkerboard_interior() {
        // Interior pixels: laplacian = ±8a, a = 1 -> 4096 per interior pixel
        let score = laplacian_fourth(&Array2::from_shape_fn((3, 3), |(r, c)| {
            if (r + c) % 2 == 0 {
                1.0
            } else {
                -1.0
            }
        }));
        assert!(score > 0.0);
        assert!(score <= 4096.0);
    }

    #[test]
    fn test_edge_energy_of_single_step() {
        // One step of height 10 with n = 1: responses [0, 10, 0] -> energy 100
        assert_eq!(line_energy(&[0.0, 0.0, 10.0, 10.0], 1), 100.0);
        assert_eq!(line_energy(&[1.0], 1), 0.0);
    }

    #[test]
    fn test_decimation_bounds_dimensions() {
        let big = Array2::<f64>::zeros((2500, 1200));
        let small = decimate(&big);
        assert!(small.nrows() <= MAX_METRIC_DIMENSION);
        assert!(small.ncols() <= MAX_METRIC_DIMENSION);
        assert_eq!(decimate(&Array2::<f64>::zeros((10, 10))).dim(), (10, 10));
    }

    #[test]
    fn test_metric_serde_tagging() {
        let json = serde_json::to_string(&FocusMetric::EdgeEnergy { half_width: 20 }).unwrap();
        assert_eq!(json, r#"{"kind":"edge_energy","half_width":20}"#);
        let parsed: FocusMetric = serde_json::from_str(r#"{"kind":"variance"}"#).unwrap();
        assert_eq!(parsed, FocusMetric::Variance);
    }
}
