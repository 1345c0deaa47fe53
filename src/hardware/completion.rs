//! Completion signals for asynchronous device operations.
//!
//! A completion is a subscription to a status channel plus the predicate that
//! marks the operation done. Waiting always takes a timeout; dropping the
//! completion drops the subscription.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::channel::ChannelValue;
use crate::error::{ChannelError, FlyscanError, FlyscanResult};

type Predicate = Arc<dyn Fn(&ChannelValue) -> bool + Send + Sync>;

/// Resolves when a status channel satisfies a predicate
#[derive(Clone)]
pub struct StatusCompletion {
    what: String,
    rx: watch::Receiver<ChannelValue>,
    predicate: Predicate,
}

impl fmt::Debug for StatusCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusCompletion")
            .field("what", &self.what)
            .field("current", &*self.rx.borrow())
            .finish()
    }
}

impl StatusCompletion {
    /// Build a completion from a monitor subscription
    pub fn new<F>(what: impl Into<String>, rx: watch::Receiver<ChannelValue>, predicate: F) -> Self
    where
        F: Fn(&ChannelValue) -> bool + Send + Sync + 'static,
    {
        Self {
            what: what.into(),
            rx,
            predicate: Arc::new(predicate),
        }
    }

    /// Completion that resolves when a string channel reads `expected`
    pub fn string_equals(
        what: impl Into<String>,
        rx: watch::Receiver<ChannelValue>,
        expected: &str,
    ) -> Self {
        let expected = expected.to_string();
        Self::new(what, rx, move |v| v.as_str() == Some(expected.as_str()))
    }

    /// What this completion waits for
    pub fn what(&self) -> &str {
        &self.what
    }

    /// Whether the predicate holds right now
    pub fn is_done(&self) -> bool {
        (self.predicate)(&self.rx.borrow())
    }

    /// Wait for the predicate to hold, failing with `Timeout` after `timeout`
    pub async fn wait(&mut self, timeout: Duration) -> FlyscanResult<()> {
        let predicate = self.predicate.clone();
        match tokio::time::timeout(timeout, self.rx.wait_for(|v| predicate(v))).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(ChannelError::Disconnected(self.what.clone()).into()),
            Err(_) => Err(FlyscanError::timeout(self.what.clone(), timeout)),
        }
    }
}

/// Resolves when a file writer reports idle and its file is on disk
#[derive(Debug, Clone)]
pub struct WriterCompletion {
    writer: String,
    file: PathBuf,
    status: StatusCompletion,
}

impl WriterCompletion {
    const FILE_POLL: Duration = Duration::from_millis(10);

    /// Completion for `writer` producing `file`
    pub fn new(writer: impl Into<String>, file: impl Into<PathBuf>, status: StatusCompletion) -> Self {
        Self {
            writer: writer.into(),
            file: file.into(),
            status,
        }
    }

    /// Name of the writer
    pub fn writer(&self) -> &str {
        &self.writer
    }

    /// File the writer produces
    pub fn file(&self) -> &Path {
        &self.file
    }

    /// Whether the writer has released the file
    pub fn is_closed(&self) -> bool {
        self.status.is_done() && self.file.exists()
    }

    /// Wait for the writer to release its file
    pub async fn wait(&mut self, timeout: Duration) -> FlyscanResult<()> {
        let deadline = Instant::now() + timeout;
        self.status.wait(timeout).await?;

        // The status can flip before the file is visible to this host
        while !self.file.exists() {
            if Instant::now() >= deadline {
                return Err(FlyscanError::timeout(
                    format!("{} to write {}", self.writer, self.file.display()),
                    timeout,
                ));
            }
            tokio::time::sleep(Self::FILE_POLL).await;
        }
        Ok(())
    }
}
