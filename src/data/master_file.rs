//! Master File Writer
//!
//! After a run, one master file is written next to the run's data. It holds
//! external links to each detector file and to the position stream file, so
//! a reader opens a single file and sees the whole run.
//!
//! # Ordering
//!
//! A link must never be created before its target file has been closed by
//! the writer that produces it. This is enforced by types:
//!
//! 1. [`MasterFileWriter::begin_run`] records the run's files.
//! 2. [`MasterFileWriter::register_writer`] attaches each writer's
//!    [`WriterCompletion`].
//! 3. [`MasterFileWriter::wait_for_writers`] blocks until every writer has
//!    closed (or timed out) and returns a [`WritersReady`] token.
//! 4. [`MasterFileWriter::commit_links`] requires that token. Writers that
//!    did not close are left unlinked and listed in the `missing_files`
//!    attribute instead of failing the whole write.
//!
//! [`MasterFileWriter::try_commit_links`] is the non-blocking variant and is
//! rejected with `WriterNotClosed` while any writer is still open.
//!
//! After a commit the per-run state (external files, position file name,
//! writers) is cleared so nothing leaks into the next run.
//!
//! # Backends
//!
//! - [`Hdf5LinkBackend`] (feature `storage_hdf5`): NeXus-style HDF5 file with
//!   an `/entry` group of external links.
//! - [`JsonLinkBackend`]: the same link table as JSON; used when the crate is
//!   built without native HDF5.

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::error::{FlyscanError, FlyscanResult};
use crate::experiment::metadata::{RunFileSet, RunMetadata};
use crate::hardware::completion::WriterCompletion;

/// Link name used for the position stream file
pub const POSITION_LINK: &str = "positions";

/// Path inside each target file that links point to
pub const TARGET_ENTRY: &str = "/entry";

/// Opens the root container of a new master file
pub trait LinkBackend: Send + Sync {
    /// Create `path`; fails if it already exists
    fn open_root(&self, path: &Path) -> FlyscanResult<Box<dyn RootContainer>>;
}

/// An open master file
pub trait RootContainer: Send {
    /// Link `name` to `target_path` inside `target_file`
    fn create_external_link(&mut self, name: &str, target_file: &Path, target_path: &str) -> FlyscanResult<()>;

    /// Attach a string attribute to the root entry
    fn set_attribute(&mut self, name: &str, value: &str) -> FlyscanResult<()>;

    /// Flush and close
    fn close(self: Box<Self>) -> FlyscanResult<()>;
}

// =============================================================================
// JSON backend
// =============================================================================

/// Writes the link table as a JSON document
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonLinkBackend;

/// One external link as stored by [`JsonLinkBackend`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalLink {
    /// File linked to, relative to `link_root`
    pub target_file: String,
    /// Object inside the target file
    pub target_path: String,
}

/// Contents of a JSON master file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JsonMasterFile {
    /// Link name to target
    pub links: BTreeMap<String, ExternalLink>,
    /// Root attributes (`link_root`, `missing_files`, run metadata)
    pub attributes: BTreeMap<String, String>,
}

struct JsonRoot {
    file: std::fs::File,
    contents: JsonMasterFile,
}

impl LinkBackend for JsonLinkBackend {
    fn open_root(&self, path: &Path) -> FlyscanResult<Box<dyn RootContainer>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => FlyscanError::FileExists(path.to_path_buf()),
                _ => e.into(),
            })?;
        Ok(Box::new(JsonRoot {
            file,
            contents: JsonMasterFile::default(),
        }))
    }
}

impl RootContainer for JsonRoot {
    fn create_external_link(&mut self, name: &str, target_file: &Path, target_path: &str) -> FlyscanResult<()> {
        self.contents.links.insert(
            name.to_string(),
            ExternalLink {
                target_file: target_file.to_string_lossy().into_owned(),
                target_path: target_path.to_string(),
            },
        );
        Ok(())
    }

    fn set_attribute(&mut self, name: &str, value: &str) -> FlyscanResult<()> {
        self.contents
            .attributes
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn close(mut self: Box<Self>) -> FlyscanResult<()> {
        serde_json::to_writer_pretty(&mut self.file, &self.contents)?;
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

// =============================================================================
// HDF5 backend
// =============================================================================

/// Writes a NeXus-style HDF5 master file with external links under `/entry`
#[cfg(feature = "storage_hdf5")]
#[derive(Debug, Default, Clone, Copy)]
pub struct Hdf5LinkBackend;

#[cfg(feature = "storage_hdf5")]
struct Hdf5Root {
    file: hdf5::File,
    entry: hdf5::Group,
}

#[cfg(feature = "storage_hdf5")]
fn hdf5_error(e: hdf5::Error) -> FlyscanError {
    FlyscanError::LinkBackend(e.to_string())
}

#[cfg(feature = "storage_hdf5")]
fn write_group_attr(group: &hdf5::Group, name: &str, value: &str) -> FlyscanResult<()> {
    use hdf5::types::VarLenUnicode;
    let value = value
        .parse::<VarLenUnicode>()
        .map_err(|e| FlyscanError::LinkBackend(format!("attribute '{name}': {e}")))?;
    group
        .new_attr::<VarLenUnicode>()
        .create(name)
        .and_then(|attr| attr.write_scalar(&value))
        .map_err(hdf5_error)
}

#[cfg(feature = "storage_hdf5")]
impl LinkBackend for Hdf5LinkBackend {
    fn open_root(&self, path: &Path) -> FlyscanResult<Box<dyn RootContainer>> {
        if path.exists() {
            return Err(FlyscanError::FileExists(path.to_path_buf()));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = hdf5::File::create_excl(path).map_err(hdf5_error)?;
        let entry = file.create_group("entry").map_err(hdf5_error)?;
        write_group_attr(&entry, "NX_class", "NXentry")?;
        Ok(Box::new(Hdf5Root { file, entry }))
    }
}

#[cfg(feature = "storage_hdf5")]
impl RootContainer for Hdf5Root {
    fn create_external_link(&mut self, name: &str, target_file: &Path, target_path: &str) -> FlyscanResult<()> {
        self.entry
            .link_external(&target_file.to_string_lossy(), target_path, name)
            .map_err(hdf5_error)
    }

    fn set_attribute(&mut self, name: &str, value: &str) -> FlyscanResult<()> {
        write_group_attr(&self.entry, name, value)
    }

    fn close(self: Box<Self>) -> FlyscanResult<()> {
        self.file.flush().map_err(hdf5_error)?;
        let Hdf5Root { file, entry } = *self;
        drop(entry);
        file.close().map_err(hdf5_error)
    }
}

// =============================================================================
// MasterFileWriter
// =============================================================================

/// Proof that [`MasterFileWriter::wait_for_writers`] has resolved for the
/// current run. Only the writer can create one.
#[derive(Debug)]
pub struct WritersReady {
    generation: u64,
    closed: BTreeSet<String>,
    missing: BTreeSet<String>,
}

impl WritersReady {
    /// Writers whose files are closed
    pub fn closed(&self) -> &BTreeSet<String> {
        &self.closed
    }

    /// Writers that did not close in time or never reported
    pub fn missing(&self) -> &BTreeSet<String> {
        &self.missing
    }
}

/// Outcome of a master file commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterFileReport {
    /// File written
    pub master_file_path: PathBuf,
    /// Link names created
    pub linked: Vec<String>,
    /// Link names left out because their file was not closed
    pub missing: Vec<String>,
}

struct PendingRun {
    generation: u64,
    run_uid: String,
    master_file_path: PathBuf,
    base_path: PathBuf,
    /// Link name to path relative to the data root
    external_files: BTreeMap<String, PathBuf>,
    position_file_name: Option<PathBuf>,
    writers: BTreeMap<String, WriterCompletion>,
    metadata: RunMetadata,
}

/// Collects a run's files and writes its master file
pub struct MasterFileWriter {
    backend: Arc<dyn LinkBackend>,
    pending: Mutex<Option<PendingRun>>,
    generation: AtomicU64,
}

impl Default for MasterFileWriter {
    fn default() -> Self {
        Self::new(Arc::new(JsonLinkBackend))
    }
}

impl MasterFileWriter {
    /// Writer committing through `backend`
    pub fn new(backend: Arc<dyn LinkBackend>) -> Self {
        Self {
            backend,
            pending: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// HDF5 backend when built with `storage_hdf5`, JSON otherwise
    pub fn with_default_backend() -> Self {
        #[cfg(feature = "storage_hdf5")]
        {
            Self::new(Arc::new(Hdf5LinkBackend))
        }
        #[cfg(not(feature = "storage_hdf5"))]
        {
            Self::new(Arc::new(JsonLinkBackend))
        }
    }

    /// Record the files of a new run, replacing any uncommitted run
    pub fn begin_run(&self, run_uid: &str, files: &RunFileSet, metadata: RunMetadata) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let external_files = files
            .detector_file_paths
            .iter()
            .map(|(name, f)| (name.clone(), f.relative_path.clone()))
            .collect();

        let mut pending = self.pending.lock();
        if let Some(stale) = pending.as_ref() {
            warn!(run_uid = %stale.run_uid, "Discarding uncommitted master file state");
        }
        *pending = Some(PendingRun {
            generation,
            run_uid: run_uid.to_string(),
            master_file_path: files.master_file_path.clone(),
            base_path: files.base_path.clone(),
            external_files,
            position_file_name: Some(files.relative(&files.position_stream_file_path)),
            writers: BTreeMap::new(),
            metadata,
        });
    }

    /// Attach the completion signal of the writer behind link `name`
    pub fn register_writer(&self, name: &str, completion: WriterCompletion) -> FlyscanResult<()> {
        let mut pending = self.pending.lock();
        let run = pending
            .as_mut()
            .ok_or_else(|| FlyscanError::LinkBackend("no run in progress".to_string()))?;
        let known = run.external_files.contains_key(name)
            || (name == POSITION_LINK && run.position_file_name.is_some());
        if !known {
            return Err(FlyscanError::LinkBackend(format!(
                "'{name}' is not a file of run {}",
                run.run_uid
            )));
        }
        run.writers.insert(name.to_string(), completion);
        Ok(())
    }

    /// Detector link name to relative path, for the current run
    pub fn external_files(&self) -> BTreeMap<String, PathBuf> {
        self.pending
            .lock()
            .as_ref()
            .map(|r| r.external_files.clone())
            .unwrap_or_default()
    }

    /// Relative position stream file, for the current run
    pub fn position_file_name(&self) -> Option<PathBuf> {
        self.pending
            .lock()
            .as_ref()
            .and_then(|r| r.position_file_name.clone())
    }

    fn link_names(run: &PendingRun) -> Vec<String> {
        let mut names: Vec<String> = run.external_files.keys().cloned().collect();
        if run.position_file_name.is_some() {
            names.push(POSITION_LINK.to_string());
        }
        names
    }

    /// Wait for every registered writer to close its file.
    ///
    /// Writers that time out, fail, or were never registered are reported as
    /// missing; waiting itself only fails when no run is in progress.
    #[instrument(skip(self))]
    pub async fn wait_for_writers(&self, timeout: Duration) -> FlyscanResult<WritersReady> {
        let (generation, names, writers) = {
            let pending = self.pending.lock();
            let run = pending
                .as_ref()
                .ok_or_else(|| FlyscanError::LinkBackend("no run in progress".to_string()))?;
            (run.generation, Self::link_names(run), run.writers.clone())
        };

        let waits = writers.into_iter().map(|(name, mut completion)| async move {
            let result = completion.wait(timeout).await;
            (name, result)
        });

        let mut closed = BTreeSet::new();
        for (name, result) in join_all(waits).await {
            match result {
                Ok(()) => {
                    closed.insert(name);
                }
                Err(e) => warn!(writer = %name, error = %e, "Writer did not close its file"),
            }
        }
        let missing: BTreeSet<String> = names
            .into_iter()
            .filter(|n| !closed.contains(n))
            .collect();

        Ok(WritersReady {
            generation,
            closed,
            missing,
        })
    }

    /// Write the master file for the run `ready` was issued for, then clear
    /// the per-run state.
    #[instrument(skip(self, ready))]
    pub async fn commit_links(&self, ready: WritersReady) -> FlyscanResult<MasterFileReport> {
        let run = {
            let mut pending = self.pending.lock();
            let current = pending
                .as_ref()
                .map_or(false, |run| run.generation == ready.generation);
            if current {
                pending.take()
            } else {
                None
            }
        }
        .ok_or_else(|| {
            FlyscanError::LinkBackend("writer readiness belongs to a different run".to_string())
        })?;

        let backend = self.backend.clone();
        let report = tokio::task::spawn_blocking(move || write_master(backend.as_ref(), run, ready))
            .await
            .map_err(|e| FlyscanError::LinkBackend(format!("master file task failed: {e}")))??;

        info!(
            master = %report.master_file_path.display(),
            linked = report.linked.len(),
            missing = report.missing.len(),
            "Master file written"
        );
        Ok(report)
    }

    /// Commit only if every writer has already closed; otherwise reject with
    /// `WriterNotClosed` and keep the run pending.
    pub async fn try_commit_links(&self) -> FlyscanResult<MasterFileReport> {
        let ready = {
            let pending = self.pending.lock();
            let run = pending
                .as_ref()
                .ok_or_else(|| FlyscanError::LinkBackend("no run in progress".to_string()))?;
            let mut closed = BTreeSet::new();
            for name in Self::link_names(run) {
                match run.writers.get(&name) {
                    Some(w) if w.is_closed() => {
                        closed.insert(name);
                    }
                    _ => return Err(FlyscanError::WriterNotClosed(name)),
                }
            }
            WritersReady {
                generation: run.generation,
                closed,
                missing: BTreeSet::new(),
            }
        };
        self.commit_links(ready).await
    }
}

fn write_master(
    backend: &dyn LinkBackend,
    run: PendingRun,
    ready: WritersReady,
) -> FlyscanResult<MasterFileReport> {
    let mut root = backend.open_root(&run.master_file_path)?;

    let mut targets = run.external_files.clone();
    if let Some(position) = &run.position_file_name {
        targets.insert(POSITION_LINK.to_string(), position.clone());
    }

    let mut linked = Vec::new();
    for (name, relative) in &targets {
        if ready.closed.contains(name) {
            root.create_external_link(name, relative, TARGET_ENTRY)?;
            linked.push(name.clone());
        }
    }
    let missing: Vec<String> = ready.missing.iter().cloned().collect();

    root.set_attribute("run_uid", &run.run_uid)?;
    root.set_attribute("link_root", &run.base_path.to_string_lossy())?;
    root.set_attribute("metadata", &serde_json::to_string(&run.metadata)?)?;
    if !missing.is_empty() {
        let files: Vec<String> = missing
            .iter()
            .filter_map(|n| targets.get(n))
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        root.set_attribute("missing_files", &serde_json::to_string(&files)?)?;
        warn!(?files, "Master file written without some links");
    }
    root.close()?;

    Ok(MasterFileReport {
        master_file_path: run.master_file_path,
        linked,
        missing,
    })
}
