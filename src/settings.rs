//! Persisted camera settings.
//!
//! A calibration is only useful if it survives a restart: [`MicroscopeSettings`]
//! captures exposure, gains and the flat-field table, and round-trips through YAML.

use crate::calibration::GainTable;
use crate::error::AppResult;
use crate::hardware::{CaptureSettings, ChannelGains};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Camera settings worth keeping between sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MicroscopeSettings {
    /// Exposure time in microseconds
    pub exposure_us: u32,
    /// Analogue gain multiplier
    pub analog_gain: f64,
    /// White-balance gains
    pub channel_gains: ChannelGains,
    /// Flat-field correction, if calibrated
    #[serde(default)]
    pub gain_table: Option<GainTable>,
}

impl From<&CaptureSettings> for MicroscopeSettings {
    fn from(capture: &CaptureSettings) -> Self {
        Self {
            exposure_us: capture.exposure_us,
            analog_gain: capture.analog_gain,
            channel_gains: capture.channel_gains,
            gain_table: capture.gain_table.as_deref().cloned(),
        }
    }
}

impl MicroscopeSettings {
    /// Overwrite the persisted fields of `capture`. The readout region is left alone.
    pub fn apply_to(&self, capture: &mut CaptureSettings) {
        capture.exposure_us = self.exposure_us;
        capture.analog_gain = self.analog_gain;
        capture.channel_gains = self.channel_gains;
        capture.gain_table = self.gain_table.clone().map(Arc::new);
    }

    /// Parse settings from a YAML document.
    pub fn from_yaml(text: &str) -> AppResult<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Render as YAML.
    pub fn to_yaml(&self) -> AppResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Load settings from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let settings = Self::from_yaml(&fs::read_to_string(path)?)?;
        info!(path = %path.display(), "Settings: loaded");
        Ok(settings)
    }

    /// Write settings to a YAML file, creating parent directories as needed.
    pub fn save(&self, path: impl AsRef<Path>) -> AppResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_yaml()?)?;
        info!(path = %path.display(), "Settings: saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MicroscopeError;
    use ndarray::array;

    fn calibrated() -> MicroscopeSettings {
        MicroscopeSettings {
            exposure_us: 12_500,
            analog_gain: 2.0,
            channel_gains: ChannelGains { red: 1.25, blue: 0.75 },
            gain_table: Some(GainTable::from_factors(array![[1.0, 1.5], [2.0, 0.5]]).unwrap()),
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.yaml");
        let settings = calibrated();
        settings.save(&path).unwrap();
        assert_eq!(MicroscopeSettings::load(&path).unwrap(), settings);
    }

    #[test]
    fn test_missing_gain_table_defaults_to_none() {
        let yaml = "exposure_us: 100\nanalog_gain: 1.0\nchannel_gains:\n  red: 1.0\n  blue: 1.0\n";
        let settings = MicroscopeSettings::from_yaml(yaml).unwrap();
        assert!(settings.gain_table.is_none());
    }

    #[test]
    fn test_malformed_yaml_is_a_settings_error() {
        let result = MicroscopeSettings::from_yaml("exposure_us: [not a number");
        assert!(matches!(result, Err(MicroscopeError::Settings(_))));
    }

    #[test]
    fn test_capture_round_trip_keeps_region() {
        let mut capture = CaptureSettings {
            region: Some(crate::hardware::RegionOfInterest::full_sensor(8, 8)),
            ..CaptureSettings::default()
        };
        let settings = calibrated();
        settings.apply_to(&mut capture);
        assert_eq!(capture.exposure_us, 12_500);
        assert!(capture.region.is_some());
        assert_eq!(MicroscopeSettings::from(&capture), settings);
    }
}
