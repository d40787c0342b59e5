//! Controller configuration using Figment
//!
//! Configuration is layered, lowest precedence first:
//! 1. built-in defaults
//! 2. `config/microscope.toml` (or an explicit path); a missing file is skipped
//! 3. environment variables prefixed with `SCOPEDAQ_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! SCOPEDAQ_APPLICATION__LOG_LEVEL=debug
//! SCOPEDAQ_AUTOFOCUS__DEFAULT_RANGE=800
//! SCOPEDAQ_STAGE__PORT=/dev/ttyUSB0
//! ```
//!
//! # Example
//!
//! ```no_run
//! use microscope_daq::config::ControllerConfig;
//!
//! let config = ControllerConfig::load()?;
//! println!("Log level: {}", config.application.log_level);
//! # Ok::<(), microscope_daq::error::MicroscopeError>(())
//! ```

use crate::calibration::FlatFieldConfig;
use crate::error::{AppResult, MicroscopeError};
use crate::experiment::ScanConfig;
use crate::focus::autofocus::{validate_search, AutofocusConfig};
use crate::hardware::{CaptureSettings, ChannelGains};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/microscope.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "SCOPEDAQ_";

/// Top-level controller configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Autofocus defaults
    pub autofocus: AutofocusConfig,
    /// Flat-field loop parameters
    pub calibration: FlatFieldConfig,
    /// Scan defaults
    pub scan: ScanConfig,
    /// Exposure and colour settings for every capture
    pub capture: CaptureConfig,
    /// Motor board connection
    pub stage: StageConfig,
    /// Synthetic hardware used when no stage port is configured
    pub simulation: SimulationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit logs as JSON lines
    pub json_logs: bool,
    /// Directory for run summaries and settings files
    pub output_dir: PathBuf,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "microscope_daq".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
            output_dir: PathBuf::from("data"),
        }
    }
}

/// Capture settings as configured
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Exposure time in microseconds
    pub exposure_us: u32,
    /// Analogue gain multiplier
    pub analog_gain: f64,
    /// White-balance gain on the red channel
    pub red_gain: f64,
    /// White-balance gain on the blue channel
    pub blue_gain: f64,
    /// Saved settings (exposure, gains, gain table) to start from
    pub settings_file: Option<PathBuf>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        let settings = CaptureSettings::default();
        Self {
            exposure_us: settings.exposure_us,
            analog_gain: settings.analog_gain,
            red_gain: settings.channel_gains.red,
            blue_gain: settings.channel_gains.blue,
            settings_file: None,
        }
    }
}

impl CaptureConfig {
    /// Capture settings without a gain table.
    pub fn to_settings(&self) -> CaptureSettings {
        CaptureSettings {
            exposure_us: self.exposure_us,
            analog_gain: self.analog_gain,
            channel_gains: ChannelGains {
                red: self.red_gain,
                blue: self.blue_gain,
            },
            gain_table: None,
            region: None,
        }
    }
}

/// OpenFlexure motor board connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Serial port; `None` runs against the simulated stage
    pub port: Option<String>,
    /// Line speed
    pub baud_rate: u32,
    /// Reply timeout in milliseconds
    pub timeout_ms: u64,
    /// Backlash correction in steps, all axes
    pub backlash: i64,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: crate::hardware::openflexure::BAUD_RATE,
            timeout_ms: 10_000,
            backlash: 128,
        }
    }
}

/// Synthetic stage and sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Sensor width in pixels
    pub width: usize,
    /// Sensor height in pixels
    pub height: usize,
    /// Z of best focus, relative to the stage origin
    pub focus_z: i64,
    /// Defocus in steps at which contrast halves
    pub depth_of_field: f64,
    /// Relative light loss at the sensor corners
    pub vignette: f64,
    /// Red, green and blue sensitivity
    pub channel_response: [f64; 3],
    /// Uniform noise amplitude
    pub noise: f32,
    /// Noise generator seed
    pub seed: u64,
    /// Stage backlash in steps
    pub backlash: i64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            width: 128,
            height: 96,
            focus_z: 120,
            depth_of_field: 40.0,
            vignette: 0.3,
            channel_response: [1.15, 1.0, 0.85],
            noise: 0.5,
            seed: 0,
            backlash: 0,
        }
    }
}

impl ControllerConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// # Errors
    ///
    /// Returns an error if the file is malformed or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Self::figment(path.as_ref()).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Provider stack, exposed so callers can merge further overrides.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(ControllerConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Render as TOML, e.g. to write a starting config file.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| MicroscopeError::Configuration(format!("cannot render config: {e}")))
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Autofocus default step partitions the default range
    /// - Calibration clamp, target fraction, bin size and averaging are usable
    /// - Exposure and gains are positive
    /// - Simulated sensor has a non-empty frame
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        validate_search(self.autofocus.default_range, self.autofocus.default_step)
            .map_err(|e| invalid(format!("autofocus defaults: {e}")))?;

        let cal = &self.calibration;
        if !(cal.min_gain > 0.0 && cal.min_gain < cal.max_gain) {
            return Err(invalid(format!(
                "Invalid gain clamp [{}, {}]. Need 0 < min_gain < max_gain",
                cal.min_gain, cal.max_gain
            )));
        }
        if !(cal.brightest_fraction > 0.0 && cal.brightest_fraction <= 1.0) {
            return Err(invalid(format!(
                "Invalid brightest_fraction {}. Must be in (0, 1]",
                cal.brightest_fraction
            )));
        }
        if cal.bin_size == 0 {
            return Err(invalid("calibration bin_size must be > 0".to_string()));
        }
        if cal.frames_to_average == 0 {
            return Err(invalid("calibration frames_to_average must be > 0".to_string()));
        }
        if cal.max_iterations == 0 {
            return Err(invalid("calibration max_iterations must be > 0".to_string()));
        }
        if !(cal.damping > 0.0 && cal.damping <= 1.0) {
            return Err(invalid(format!(
                "Invalid damping {}. Must be in (0, 1]",
                cal.damping
            )));
        }
        if cal.uniformity_tolerance.is_nan() || cal.uniformity_tolerance < 0.0 {
            return Err(invalid(format!(
                "Invalid uniformity_tolerance {}",
                cal.uniformity_tolerance
            )));
        }

        let capture = &self.capture;
        if capture.exposure_us == 0 {
            return Err(invalid("capture exposure_us must be > 0".to_string()));
        }
        if [capture.analog_gain, capture.red_gain, capture.blue_gain]
            .iter()
            .any(|g| !(*g > 0.0))
        {
            return Err(invalid("capture gains must be positive".to_string()));
        }

        if self.scan.edge_points == 0 || self.scan.edge_min_step <= 0.0 {
            return Err(invalid("edge scan needs points and a positive step".to_string()));
        }
        if self.scan.edge_log_factor < 1.0 {
            return Err(invalid(format!(
                "Invalid edge_log_factor {}. Must be >= 1",
                self.scan.edge_log_factor
            )));
        }

        if self.simulation.width == 0 || self.simulation.height == 0 {
            return Err(invalid("simulated sensor size must be > 0".to_string()));
        }

        Ok(())
    }
}

fn invalid(message: String) -> MicroscopeError {
    MicroscopeError::Configuration(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        assert!(ControllerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_invalid_log_level() {
        let mut config = ControllerConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(matches!(
            config.validate(),
            Err(MicroscopeError::Configuration(msg)) if msg.contains("log_level")
        ));
    }

    #[test]
    fn test_rejects_non_partitioning_autofocus_step() {
        let mut config = ControllerConfig::default();
        config.autofocus.default_range = 100;
        config.autofocus.default_step = 30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_clamp() {
        let mut config = ControllerConfig::default();
        config.calibration.min_gain = 2.0;
        config.calibration.max_gain = 2.0;
        assert!(config.validate().is_err());

        let mut config = ControllerConfig::default();
        config.calibration.brightest_fraction = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[autofocus]
default_range = 200
default_step = 20

[calibration]
bin_size = 32

[scan]
edge_shift = [500, 0]
"#
        )
        .unwrap();

        let config = ControllerConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.autofocus.default_range, 200);
        assert_eq!(config.calibration.bin_size, 32);
        assert_eq!(config.scan.edge_shift, Some([500, 0]));
        // Untouched sections keep their defaults
        assert_eq!(config.stage, StageConfig::default());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ControllerConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.autofocus, AutofocusConfig::default());
    }

    #[test]
    fn test_invalid_file_values_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[calibration]\nframes_to_average = 0").unwrap();
        assert!(ControllerConfig::load_from(file.path()).is_err());
    }

    #[test]
    fn test_toml_rendering_round_trips() {
        let config = ControllerConfig::default();
        let rendered = config.to_toml().unwrap();
        let parsed: ControllerConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_capture_settings_conversion() {
        let capture = CaptureConfig {
            exposure_us: 5_000,
            red_gain: 1.4,
            ..CaptureConfig::default()
        };
        let settings = capture.to_settings();
        assert_eq!(settings.exposure_us, 5_000);
        assert_eq!(settings.channel_gains.red, 1.4);
        assert!(settings.gain_table.is_none());
    }
}
