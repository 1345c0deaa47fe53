//! Position-stream recorder adapter.
//!
//! An external process samples encoder positions on the trigger clock and
//! streams them to a file. Its state machine is `Idle → Acquiring → Idle`;
//! start/stop commands return before the process changes state, so both
//! return a [`StatusCompletion`] that resolves on the status channel.
//!
//! The completion is subscribed before the command is written, so a fast
//! transition cannot be missed. Waiting requires a timeout.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::channel::{ChannelAccess, ChannelValue};
use crate::error::{FlyscanError, FlyscanResult};
use crate::hardware::capabilities::{Device, Stageable};
use crate::hardware::completion::{StatusCompletion, WriterCompletion};

/// Status string while streaming
pub const STATUS_ACQUIRING: &str = "Acquiring";
/// Status string while stopped
pub const STATUS_IDLE: &str = "Idle";

/// Adapter for the position streaming process
pub struct PositionStreamRecorder {
    name: String,
    prefix: String,
    channels: Arc<dyn ChannelAccess>,
    file: Mutex<Option<PathBuf>>,
    staged: AtomicBool,
}

impl PositionStreamRecorder {
    /// Recorder with channels `{prefix}Acquire`, `{prefix}Status`, `{prefix}FileName`
    pub fn new(name: impl Into<String>, prefix: impl Into<String>, channels: Arc<dyn ChannelAccess>) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
            channels,
            file: Mutex::new(None),
            staged: AtomicBool::new(false),
        }
    }

    fn pv(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix, suffix)
    }

    /// Choose the output file for the next stream
    pub fn setup_file(&self, path: impl Into<PathBuf>) {
        *self.file.lock() = Some(path.into());
    }

    /// Output file of the current or last stream
    pub fn file(&self) -> Option<PathBuf> {
        self.file.lock().clone()
    }

    /// Whether `stage()` completed and `unstage()` has not run since
    pub fn is_staged(&self) -> bool {
        self.staged.load(Ordering::SeqCst)
    }

    /// Current status string
    pub async fn status(&self) -> FlyscanResult<String> {
        Ok(self.channels.get(&self.pv("Status")).await?.to_string())
    }

    async fn command(&self, acquire: i64, expected: &str) -> FlyscanResult<StatusCompletion> {
        let rx = self.channels.monitor(&self.pv("Status"))?;
        let done = StatusCompletion::string_equals(
            format!("{} status '{}'", self.name, expected),
            rx,
            expected,
        );
        self.channels
            .put(&self.pv("Acquire"), ChannelValue::Int(acquire))
            .await?;
        Ok(done)
    }

    /// Start streaming; resolves when the status reads `Acquiring`
    #[instrument(skip(self), fields(recorder = %self.name))]
    pub async fn start_stream(&self) -> FlyscanResult<StatusCompletion> {
        let done = self.command(1, STATUS_ACQUIRING).await?;
        info!("Position stream start requested");
        Ok(done)
    }

    /// Stop streaming; resolves when the status reads `Idle`
    #[instrument(skip(self), fields(recorder = %self.name))]
    pub async fn stop_stream(&self) -> FlyscanResult<StatusCompletion> {
        let done = self.command(0, STATUS_IDLE).await?;
        info!("Position stream stop requested");
        Ok(done)
    }

    /// Completion for the stream file: status `Idle` and the file on disk
    pub fn file_completion(&self) -> FlyscanResult<Option<WriterCompletion>> {
        let Some(file) = self.file() else {
            return Ok(None);
        };
        let rx = self.channels.monitor(&self.pv("Status"))?;
        let status = StatusCompletion::string_equals(format!("{} idle", self.name), rx, STATUS_IDLE);
        Ok(Some(WriterCompletion::new(self.name.clone(), file, status)))
    }
}

impl Device for PositionStreamRecorder {
    fn name(&self) -> &str {
        &self.name
    }

    fn channel_names(&self) -> Vec<String> {
        vec![self.pv("Acquire"), self.pv("Status"), self.pv("FileName")]
    }
}

#[async_trait]
impl Stageable for PositionStreamRecorder {
    async fn stage(&self) -> FlyscanResult<()> {
        let file = self.file().ok_or_else(|| {
            FlyscanError::Configuration(format!("{}: no stream file set", self.name))
        })?;
        if file.exists() {
            return Err(FlyscanError::FileExists(file));
        }
        self.channels
            .put(
                &self.pv("FileName"),
                ChannelValue::Str(file.to_string_lossy().into_owned()),
            )
            .await?;
        self.staged.store(true, Ordering::SeqCst);
        debug!(recorder = %self.name, file = %file.display(), "Position stream staged");
        Ok(())
    }

    async fn unstage(&self) -> FlyscanResult<()> {
        self.staged.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// File name a stream uses inside `dir`
pub fn stream_file_path(dir: &Path, stem: &str, suffix: &str) -> PathBuf {
    dir.join(format!("{stem}_{suffix}.h5"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SimChannelLayer;
    use crate::hardware::mock::{self, StreamSimOptions};
    use std::time::Duration;

    fn recorder(sim: &SimChannelLayer) -> PositionStreamRecorder {
        PositionStreamRecorder::new("positions", "pos:", Arc::new(sim.clone()))
    }

    #[tokio::test]
    async fn start_and_stop_resolve_on_status() {
        let sim = SimChannelLayer::new();
        mock::install_position_stream(&sim, "pos:", StreamSimOptions::default());
        let dir = tempfile::tempdir().unwrap();
        let rec = recorder(&sim);
        rec.setup_file(stream_file_path(dir.path(), "scan_1", "positions"));
        rec.stage().await.unwrap();

        let mut started = rec.start_stream().await.unwrap();
        started.wait(Duration::from_secs(2)).await.unwrap();
        assert_eq!(rec.status().await.unwrap(), STATUS_ACQUIRING);

        let mut stopped = rec.stop_stream().await.unwrap();
        stopped.wait(Duration::from_secs(2)).await.unwrap();
        assert_eq!(rec.status().await.unwrap(), STATUS_IDLE);

        let mut written = rec.file_completion().unwrap().unwrap();
        written.wait(Duration::from_secs(2)).await.unwrap();
        assert!(dir.path().join("scan_1_positions.h5").exists());
    }

    #[tokio::test]
    async fn stuck_status_times_out() {
        let sim = SimChannelLayer::new();
        mock::install_position_stream(
            &sim,
            "pos:",
            StreamSimOptions {
                stuck: true,
                ..StreamSimOptions::default()
            },
        );
        let rec = recorder(&sim);

        let mut started = rec.start_stream().await.unwrap();
        let err = started.wait(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, FlyscanError::Timeout { .. }));
    }

    #[tokio::test]
    async fn stage_rejects_existing_file() {
        let sim = SimChannelLayer::new();
        mock::install_position_stream(&sim, "pos:", StreamSimOptions::default());
        let dir = tempfile::tempdir().unwrap();
        let path = stream_file_path(dir.path(), "scan_1", "positions");
        std::fs::write(&path, b"").unwrap();

        let rec = recorder(&sim);
        rec.setup_file(&path);
        assert!(matches!(rec.stage().await, Err(FlyscanError::FileExists(_))));
        assert!(sim.puts_to("pos:FileName").is_empty());
    }
}
