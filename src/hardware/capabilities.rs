//! Hardware Capabilities
//!
//! Small capability traits implemented by the channel-backed devices. The
//! orchestrator is written against these traits only, so simulated and real
//! devices are interchangeable:
//!
//! - A stepper motor implements `Movable + VelocityControl + Stageable`
//! - An area detector implements [`AreaDetector`]
//! - A scaler channel implements `Readable`
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Returns [`FlyscanResult`]
//!
//! # Example
//!
//! ```rust,ignore
//! async fn step_through<M: Movable + ?Sized>(motor: &M, points: &[f64]) -> FlyscanResult<()> {
//!     for &position in points {
//!         motor.move_abs(position).await?;
//!         motor.wait_settled().await?;
//!     }
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::FlyscanResult;
use crate::hardware::completion::WriterCompletion;

/// Anything bound to named control-system channels
pub trait Device: Send + Sync {
    /// Device name used in logs, metadata and run documents
    fn name(&self) -> &str;

    /// Channels that must connect before the device is usable
    fn channel_names(&self) -> Vec<String>;
}

/// Capability: Motion Control
///
/// # Contract
/// - Positions are in device-native units
/// - `move_abs` initiates motion and may return before completion
/// - `wait_settled` blocks until motion completes (with an internal timeout)
#[async_trait]
pub trait Movable: Device {
    /// Start a move to an absolute position
    async fn move_abs(&self, position: f64) -> FlyscanResult<()>;

    /// Current readback position
    async fn position(&self) -> FlyscanResult<f64>;

    /// Wait until the last move has finished
    async fn wait_settled(&self) -> FlyscanResult<()>;

    /// Stop motion immediately
    async fn stop(&self) -> FlyscanResult<()>;

    /// Move and wait for the move to finish
    async fn move_and_wait(&self, position: f64) -> FlyscanResult<()> {
        self.move_abs(position).await?;
        self.wait_settled().await
    }
}

/// Capability: Velocity Control
///
/// `stage_velocity` records a velocity that is applied when the device is
/// staged and reverted when it is unstaged.
#[async_trait]
pub trait VelocityControl: Send + Sync {
    /// Set velocity now
    async fn set_velocity(&self, velocity: f64) -> FlyscanResult<()>;

    /// Current velocity setting
    async fn velocity(&self) -> FlyscanResult<f64>;

    /// Velocity to apply at the next `stage()`; `None` clears it
    fn stage_velocity(&self, velocity: Option<f64>);
}

/// Capability: Staging
///
/// `stage` brackets the start of an acquisition, `unstage` restores the
/// device defaults. `unstage` is best-effort and must be safe to call after a
/// failed or partial `stage`.
#[async_trait]
pub trait Stageable: Device {
    /// Prepare for acquisition
    async fn stage(&self) -> FlyscanResult<()>;

    /// Restore defaults after acquisition
    async fn unstage(&self) -> FlyscanResult<()>;
}

/// Combined trait for motors used in flyscan paths
pub trait Motor: Movable + VelocityControl + Stageable {}

impl<T: Movable + VelocityControl + Stageable> Motor for T {}

/// Capability: Scalar Readout
#[async_trait]
pub trait Readable: Device {
    /// Read current value
    async fn read(&self) -> FlyscanResult<f64>;
}

/// Detector trigger source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Detector free-runs on its own timer (step scans, alignment)
    Internal,
    /// Each frame is gated by the external trigger line (flyscans)
    ExternalGated,
}

/// One captured frame, as handed to the run document stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    /// Position of this frame in the staged acquisition, starting at 0
    pub point_number: u64,
    /// Capture time, seconds since the Unix epoch
    pub timestamp: f64,
    /// Key of the file the frame was written to
    pub file_key: String,
    /// Extra datum keys; always contains `point_number`
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Receives one [`FrameRecord`] per captured frame
pub type DatumSink = mpsc::UnboundedSender<FrameRecord>;

/// Capability: area detector with a file-writing plugin.
///
/// Detector families differ only in how trigger modes map to driver values,
/// so one implementation serves all of them; see
/// [`crate::hardware::detector::DetectorKind`].
#[async_trait]
pub trait AreaDetector: Stageable {
    /// Switch between internal and externally gated triggering
    async fn set_trigger_mode(&self, mode: TriggerMode) -> FlyscanResult<()>;

    /// Trigger mode the detector is configured for
    fn trigger_mode(&self) -> TriggerMode;

    /// Exposure per frame, in seconds
    async fn set_acquire_time(&self, seconds: f64) -> FlyscanResult<()>;

    /// Paths the detector would write for this run, without touching hardware.
    ///
    /// Returns `(full_path, relative_path)` where the relative path is
    /// relative to `base_path`.
    fn planned_paths(
        &self,
        base_path: &Path,
        folder: &Path,
        name_base: &str,
        file_number: u64,
    ) -> (PathBuf, PathBuf);

    /// Point the file writer at `{base_path}/{folder}/{detector}/` and pick
    /// the trigger mode. Returns `(full_path, relative_path)`.
    async fn setup_images(
        &self,
        base_path: &Path,
        folder: &Path,
        name_base: &str,
        file_number: u64,
        flyscan: bool,
    ) -> FlyscanResult<(PathBuf, PathBuf)>;

    /// Expand the file template from the values the device currently holds.
    ///
    /// Returns `(write_path, read_path)`; fails with `FileExists` when the
    /// target already exists.
    async fn make_write_read_paths(&self) -> FlyscanResult<(PathBuf, PathBuf)>;

    /// Number the next frame and forward it to the datum sink
    fn generate_datum(
        &self,
        key: &str,
        timestamp: f64,
        extra: BTreeMap<String, serde_json::Value>,
    ) -> FrameRecord;

    /// Frames numbered since the last `stage()`
    fn frame_records(&self) -> Vec<FrameRecord>;

    /// Whether `stage()` completed and `unstage()` has not run since
    fn is_staged(&self) -> bool;

    /// Wait until at least `count` frames have been numbered
    async fn wait_for_frames(&self, count: u64, timeout: Duration) -> FlyscanResult<()>;

    /// Completion signal for the file written by the last acquisition
    fn file_completion(&self) -> Option<WriterCompletion>;

    /// Route frame records to `sink` (or stop routing with `None`)
    fn attach_datum_sink(&self, sink: Option<DatumSink>);
}
