//! Error types for the flyscan subsystem.
//!
//! `FlyscanError` is the single error type returned by the orchestrator, the
//! device adapters and the master file writer. Its variants follow the failure
//! classes a flyscan can hit:
//!
//! - **Precondition violations** (`InvalidTiming`, `InvalidTriggerPlan`,
//!   `FileExists`, `DuplicatePath`, `MissingExperiment`, `EmptyPath`,
//!   `UnknownMotor`, `DeviceUnavailable`, `HardwareBusy`): raised before any
//!   hardware is armed and never retried. See [`FlyscanError::is_precondition`].
//! - **Channel failures** (`Channel`): wrap [`ChannelError`] from the
//!   control-system layer.
//! - **Staging failures** (`Staging`): carry the device name and the cause; the
//!   orchestrator unstages everything staged so far before returning them.
//! - **Completion failures** (`Timeout`, `ReadbackMismatch`): a status channel
//!   never reached the expected value, or a register read back differently.
//! - **Writer failures** (`WriterNotClosed`, `LinkBackend`): the master file
//!   could not be committed.
//!
//! By using `#[from]`, I/O, JSON, configuration and channel errors convert with `?`.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the flyscan error type.
pub type FlyscanResult<T> = std::result::Result<T, FlyscanError>;

/// Errors raised by the control-system channel layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    /// The channel exists but is not connected
    #[error("Channel '{0}' is not connected")]
    NotConnected(String),

    /// Connection did not complete in time
    #[error("Timed out after {timeout:?} connecting to channel '{pv}'")]
    ConnectTimeout {
        /// Channel name
        pv: String,
        /// Connect timeout that elapsed
        timeout: Duration,
    },

    /// The server dropped the channel (monitor closed)
    #[error("Channel '{0}' disconnected")]
    Disconnected(String),

    /// The value could not be read as the requested type
    #[error("Channel '{pv}' holds a value that is not {expected}")]
    TypeMismatch {
        /// Channel name
        pv: String,
        /// Requested type
        expected: &'static str,
    },
}

/// Errors raised while preparing, running or recording a flyscan.
#[derive(Error, Debug)]
pub enum FlyscanError {
    /// Detector exposure is longer than the trigger period
    #[error("Collection time {collection_time}s exceeds trigger period {period}s")]
    InvalidTiming {
        /// Requested exposure (s)
        collection_time: f64,
        /// Requested trigger period (s)
        period: f64,
    },

    /// Timing the trigger generator cannot produce
    #[error("Invalid trigger plan: {0}")]
    InvalidTriggerPlan(String),

    /// A run file is already on disk
    #[error("File already exists: {}", .0.display())]
    FileExists(PathBuf),

    /// Two writers of one run resolve to the same file
    #[error("Path is used by more than one writer: {}", .0.display())]
    DuplicatePath(PathBuf),

    /// The experiment directory does not know the experiment
    #[error("Experiment '{0}' is not set up")]
    MissingExperiment(String),

    /// The path has no points
    #[error("Acquisition path has no points")]
    EmptyPath,

    /// A path names a motor the orchestrator does not have
    #[error("Path references unknown motor '{0}'")]
    UnknownMotor(String),

    /// A placeholder stands where the device should be
    #[error("Device '{name}' is unavailable: {reason}")]
    DeviceUnavailable {
        /// Device name
        name: String,
        /// Why it did not connect
        reason: String,
    },

    /// Another flyscan holds the trigger lease
    #[error("Flyscan hardware is already owned by another scan")]
    HardwareBusy,

    /// Channel layer failure
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// A device failed to stage; everything staged before it is unstaged
    #[error("Staging '{device}' failed: {source}")]
    Staging {
        /// Device that failed
        device: String,
        /// Underlying failure
        #[source]
        source: Box<FlyscanError>,
    },

    /// A completion did not resolve in time
    #[error("Timed out after {after:?} waiting for {what}")]
    Timeout {
        /// What was awaited
        what: String,
        /// Timeout that elapsed
        after: Duration,
    },

    /// A register read back differently from what was written
    #[error("Register '{register}' read back {actual}, expected {expected}")]
    ReadbackMismatch {
        /// Register channel
        register: String,
        /// Value written
        expected: String,
        /// Value read back
        actual: String,
    },

    /// The run was interrupted
    #[error("Flyscan aborted: {0}")]
    Aborted(String),

    /// Linking was attempted before the writer closed its file
    #[error("Writer '{0}' has not closed its file")]
    WriterNotClosed(String),

    /// The master file could not be written
    #[error("Master file backend error: {0}")]
    LinkBackend(String),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration or setup values are inconsistent
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding failure
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlyscanError {
    /// True for failures detected before any hardware is touched.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            FlyscanError::InvalidTiming { .. }
                | FlyscanError::InvalidTriggerPlan(_)
                | FlyscanError::FileExists(_)
                | FlyscanError::DuplicatePath(_)
                | FlyscanError::MissingExperiment(_)
                | FlyscanError::EmptyPath
                | FlyscanError::UnknownMotor(_)
                | FlyscanError::DeviceUnavailable { .. }
                | FlyscanError::HardwareBusy
        )
    }

    /// Wrap `self` as a staging failure of `device`.
    pub fn staging(device: impl Into<String>, source: FlyscanError) -> Self {
        FlyscanError::Staging {
            device: device.into(),
            source: Box::new(source),
        }
    }

    /// Timeout helper used by completion waits.
    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        FlyscanError::Timeout {
            what: what.into(),
            after,
        }
    }
}

impl From<figment::Error> for FlyscanError {
    fn from(value: figment::Error) -> Self {
        FlyscanError::Config(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_preconditions() {
        assert!(FlyscanError::InvalidTiming {
            collection_time: 0.03,
            period: 0.02
        }
        .is_precondition());
        assert!(FlyscanError::FileExists(PathBuf::from("/data/a.h5")).is_precondition());
        assert!(FlyscanError::HardwareBusy.is_precondition());

        let staging = FlyscanError::staging(
            "eiger",
            FlyscanError::FileExists(PathBuf::from("/data/a.h5")),
        );
        assert!(!staging.is_precondition());
        assert!(!FlyscanError::Aborted("operator".into()).is_precondition());
    }

    #[test]
    fn staging_error_names_device_and_cause() {
        let err = FlyscanError::staging(
            "vortex",
            ChannelError::Disconnected("vortex:HDF1:Capture".into()).into(),
        );
        let msg = err.to_string();
        assert!(msg.contains("vortex"));
        assert!(msg.contains("disconnected"));
    }

    #[test]
    fn channel_error_converts() {
        let err: FlyscanError = ChannelError::NotConnected("sg:enable".into()).into();
        match err {
            FlyscanError::Channel(ChannelError::NotConnected(pv)) => assert_eq!(pv, "sg:enable"),
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
