//! Exposure and white-balance helpers used around flat-field calibration.
//!
//! A calibration run is usually bracketed by these: expose so the brightest pixels
//! sit well below saturation, calibrate the shading, neutralise the colour balance,
//! then expose again for the corrected image.

use crate::error::{AppResult, MicroscopeError};
use crate::hardware::{CaptureSettings, ChannelGains, Frame, Sensor};
use tracing::{debug, info};

/// Peak level to expose for before shading correction (8-bit scale).
pub const PRE_CALIBRATION_PEAK: f32 = 150.0;

/// Peak level to expose for once the shading is corrected (8-bit scale).
pub const POST_CALIBRATION_PEAK: f32 = 230.0;

/// Shortest exposure the helpers will set, in microseconds.
pub const MIN_EXPOSURE_US: u32 = 10;

/// Longest exposure the helpers will set, in microseconds.
pub const MAX_EXPOSURE_US: u32 = 2_000_000;

/// Largest factor applied to the exposure in one iteration. Bounds the correction
/// when the frame is black or clipped.
const MAX_EXPOSURE_STEP: f64 = 4.0;

/// Scale `settings.exposure_us` until the brightest sample is close to `target_peak`.
///
/// Each iteration captures one frame and multiplies the exposure by
/// `target_peak / peak`. Returns the final exposure, which is also left in `settings`.
pub fn auto_expose<C: Sensor + ?Sized>(
    sensor: &mut C,
    settings: &mut CaptureSettings,
    target_peak: f32,
    iterations: usize,
) -> AppResult<u32> {
    if target_peak.is_nan() || target_peak <= 0.0 {
        return Err(MicroscopeError::Configuration(format!(
            "target peak must be positive, got {target_peak}"
        )));
    }
    for iteration in 1..=iterations {
        let frame = sensor.capture(settings)?;
        let peak = frame.max_value();
        let ratio = if peak > 0.0 {
            f64::from(target_peak / peak)
        } else {
            MAX_EXPOSURE_STEP
        };
        let ratio = ratio.clamp(1.0 / MAX_EXPOSURE_STEP, MAX_EXPOSURE_STEP);
        let next = (f64::from(settings.exposure_us) * ratio).round();
        let next = next.clamp(f64::from(MIN_EXPOSURE_US), f64::from(MAX_EXPOSURE_US)) as u32;
        debug!(iteration, peak, exposure_us = next, "AutoExpose: adjusted");
        let settled = next == settings.exposure_us;
        settings.exposure_us = next;
        if settled {
            break;
        }
    }
    info!(exposure_us = settings.exposure_us, target_peak, "AutoExpose: done");
    Ok(settings.exposure_us)
}

/// Red and blue gains that bring both channel means to the green mean.
///
/// `current` are the gains `frame` was captured with; the result replaces them.
pub fn white_balance(frame: &Frame, current: ChannelGains) -> AppResult<ChannelGains> {
    if frame.channels() < 3 {
        return Err(MicroscopeError::Configuration(format!(
            "white balance needs an RGB frame, got {} channel(s)",
            frame.channels()
        )));
    }
    let means = frame.channel_means();
    let (red, green, blue) = (means[0], means[1], means[2]);
    if red <= 0.0 || blue <= 0.0 {
        return Err(MicroscopeError::Configuration(
            "white balance needs signal in the red and blue channels".to_string(),
        ));
    }
    let gains = ChannelGains {
        red: green / red * current.red,
        blue: green / blue * current.blue,
    };
    info!(red = gains.red, blue = gains.blue, "WhiteBalance: gains computed");
    Ok(gains)
}
