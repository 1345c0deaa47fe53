//! Flyscan configuration using Figment
//!
//! Configuration is layered, last one wins:
//! 1. Built-in defaults ([`FlyscanConfig::default`])
//! 2. `flyscan.toml` (or an explicit path)
//! 3. Environment variables prefixed with `FLYSCAN_`, using `__` between
//!    section and key (e.g. `FLYSCAN_TRIGGER__REFERENCE_CLOCK_HZ=10000000`)
//!
//! # Example
//! ```no_run
//! use beamline_flyscan::config::FlyscanConfig;
//!
//! let config = FlyscanConfig::load()?;
//! println!("Reference clock: {} Hz", config.trigger.reference_clock_hz);
//! # Ok::<(), beamline_flyscan::error::FlyscanError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FlyscanError, FlyscanResult};

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "flyscan.toml";

/// Top-level flyscan configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlyscanConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Trigger generator timing constants
    #[serde(default)]
    pub trigger: TriggerConfig,
    /// File layout settings
    #[serde(default)]
    pub storage: StorageConfig,
    /// Completion and connection timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "flyscan".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Trigger generator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Reference clock feeding the pulse dividers, in Hz
    #[serde(default = "default_reference_clock")]
    pub reference_clock_hz: f64,
    /// Time the reset line is held high, in seconds
    #[serde(default = "default_reset_settle")]
    pub reset_settle_s: f64,
    /// Position samples buffered per packet by the position stream.
    ///
    /// Used to size the drain wait after motion ends. The historical value is
    /// 1e5/8; whether it holds for every trigger period is not established.
    #[serde(default = "default_points_per_packet")]
    pub drain_points_per_packet: f64,
    /// Fixed margin added to the drain wait, in seconds
    #[serde(default = "default_drain_margin")]
    pub drain_margin_s: f64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            reference_clock_hz: default_reference_clock(),
            reset_settle_s: default_reset_settle(),
            drain_points_per_packet: default_points_per_packet(),
            drain_margin_s: default_drain_margin(),
        }
    }
}

/// File layout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Data root used when no experiment directory service is configured
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,
    /// Suffix appended to the master file stem
    #[serde(default = "default_master_suffix")]
    pub master_suffix: String,
    /// Master file extension (without the dot)
    #[serde(default = "default_master_extension")]
    pub master_extension: String,
    /// Suffix appended to the position stream file stem
    #[serde(default = "default_position_suffix")]
    pub position_suffix: String,
    /// How long the master file writer waits for each writer to close, in seconds
    #[serde(default = "default_writer_timeout")]
    pub writer_timeout_s: f64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            master_suffix: default_master_suffix(),
            master_extension: default_master_extension(),
            position_suffix: default_position_suffix(),
            writer_timeout_s: default_writer_timeout(),
        }
    }
}

/// Timeouts applied to asynchronous completions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Channel connection timeout, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_s: f64,
    /// Position stream status transition timeout, in seconds
    #[serde(default = "default_stream_status_timeout")]
    pub stream_status_s: f64,
    /// Single motor move timeout, in seconds
    #[serde(default = "default_motion_timeout")]
    pub motion_s: f64,
    /// Extra time allowed per frame on top of the trigger period, in seconds
    #[serde(default = "default_frame_timeout")]
    pub frame_s: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_s: default_connect_timeout(),
            stream_status_s: default_stream_status_timeout(),
            motion_s: default_motion_timeout(),
            frame_s: default_frame_timeout(),
        }
    }
}

impl TimeoutConfig {
    /// Connection timeout as a `Duration`
    pub fn connect(&self) -> Duration {
        Duration::from_secs_f64(self.connect_s)
    }

    /// Position stream status timeout as a `Duration`
    pub fn stream_status(&self) -> Duration {
        Duration::from_secs_f64(self.stream_status_s)
    }

    /// Motion timeout as a `Duration`
    pub fn motion(&self) -> Duration {
        Duration::from_secs_f64(self.motion_s)
    }

    /// Per-frame slack as a `Duration`
    pub fn frame(&self) -> Duration {
        Duration::from_secs_f64(self.frame_s)
    }
}

fn default_reference_clock() -> f64 {
    1.0e7
}

fn default_reset_settle() -> f64 {
    0.2
}

fn default_points_per_packet() -> f64 {
    1.0e5 / 8.0
}

fn default_drain_margin() -> f64 {
    0.1
}

fn default_base_path() -> PathBuf {
    PathBuf::from("data")
}

fn default_master_suffix() -> String {
    "master".to_string()
}

fn default_master_extension() -> String {
    "hdf".to_string()
}

fn default_position_suffix() -> String {
    "positions".to_string()
}

fn default_writer_timeout() -> f64 {
    30.0
}

fn default_connect_timeout() -> f64 {
    5.0
}

fn default_stream_status_timeout() -> f64 {
    10.0
}

fn default_motion_timeout() -> f64 {
    60.0
}

fn default_frame_timeout() -> f64 {
    2.0
}

impl FlyscanConfig {
    /// Load configuration from `flyscan.toml` and environment variables
    pub fn load() -> FlyscanResult<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> FlyscanResult<Self> {
        let config: Self = Self::figment(path.as_ref()).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Build the layered figment without extracting it
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(FlyscanConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("FLYSCAN_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> FlyscanResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(FlyscanError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if !(self.trigger.reference_clock_hz > 0.0) {
            return Err(FlyscanError::Configuration(format!(
                "Invalid reference_clock_hz {}. Must be positive",
                self.trigger.reference_clock_hz
            )));
        }

        if !(self.trigger.drain_points_per_packet > 0.0) {
            return Err(FlyscanError::Configuration(format!(
                "Invalid drain_points_per_packet {}. Must be positive",
                self.trigger.drain_points_per_packet
            )));
        }

        if self.trigger.reset_settle_s < 0.0 || self.trigger.drain_margin_s < 0.0 {
            return Err(FlyscanError::Configuration(
                "reset_settle_s and drain_margin_s must not be negative".to_string(),
            ));
        }

        if self.storage.master_extension.trim().is_empty() {
            return Err(FlyscanError::Configuration(
                "master_extension must not be empty".to_string(),
            ));
        }

        let timeouts = [
            ("connect_s", self.timeouts.connect_s),
            ("stream_status_s", self.timeouts.stream_status_s),
            ("motion_s", self.timeouts.motion_s),
            ("frame_s", self.timeouts.frame_s),
            ("writer_timeout_s", self.storage.writer_timeout_s),
        ];
        for (name, value) in timeouts {
            if !(value > 0.0) {
                return Err(FlyscanError::Configuration(format!(
                    "Invalid {name} {value}. Must be positive"
                )));
            }
        }

        Ok(())
    }
}
