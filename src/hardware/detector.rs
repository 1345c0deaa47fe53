//! Area detector with an HDF5 file-writing plugin.
//!
//! One [`FileWriterDetector`] type serves every detector family. The family
//! only decides which driver value selects internal or externally gated
//! triggering ([`DetectorKind`]); everything else is the common areaDetector
//! cam + file plugin record set.
//!
//! Paths exist in two views: the *write* path the IOC uses and the *read*
//! path this host (and later analysis) sees. They differ when the detector
//! server mounts the data volume somewhere else; see
//! [`FileWriterDetector::with_path_roots`].
//!
//! While staged, a watcher task follows the plugin's captured-frame counter
//! and numbers each frame through [`AreaDetector::generate_datum`]. Point
//! numbers start at 0 on every `stage()` and are independent per detector:
//! align detectors by the shared trigger clock or by timestamp, never by
//! point number.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::channel::{wait_for_value, ChannelAccess, ChannelValue};
use crate::error::{FlyscanError, FlyscanResult};
use crate::hardware::capabilities::{
    AreaDetector, DatumSink, Device, FrameRecord, Stageable, TriggerMode,
};
use crate::hardware::completion::{StatusCompletion, WriterCompletion};

/// Default file template: `{path}{name}_{number:06}.h5`
pub const DEFAULT_FILE_TEMPLATE: &str = "%s%s_%6.6d.h5";

/// HDF plugin `FileWriteMode` value for streaming capture
const WRITE_MODE_STREAM: i64 = 2;

/// Frames requested from the cam in externally gated mode; the trigger
/// generator decides how many actually arrive.
const EXTERNAL_FRAME_CAPACITY: i64 = 1_000_000;

/// Detector family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    /// Dectris Eiger (`Internal Series` / `External Enable`)
    Eiger,
    /// X-Spectrum Lambda (`Internal` / `External_SequencePer`)
    Lambda,
    /// Vortex fluorescence detector via Xspress (`Internal` / `TTL Veto Only`)
    Vortex,
    /// Generic areaDetector driver (`Internal` / `External`)
    Generic,
}

impl DetectorKind {
    /// Driver enum value selecting `mode`
    pub fn trigger_value(&self, mode: TriggerMode) -> i64 {
        match (self, mode) {
            (DetectorKind::Eiger, TriggerMode::Internal) => 0,
            (DetectorKind::Eiger, TriggerMode::ExternalGated) => 3,
            (DetectorKind::Lambda, TriggerMode::Internal) => 0,
            (DetectorKind::Lambda, TriggerMode::ExternalGated) => 2,
            (DetectorKind::Vortex, TriggerMode::Internal) => 1,
            (DetectorKind::Vortex, TriggerMode::ExternalGated) => 3,
            (DetectorKind::Generic, TriggerMode::Internal) => 0,
            (DetectorKind::Generic, TriggerMode::ExternalGated) => 1,
        }
    }
}

impl std::str::FromStr for DetectorKind {
    type Err = FlyscanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "eiger" => Ok(DetectorKind::Eiger),
            "lambda" => Ok(DetectorKind::Lambda),
            "vortex" => Ok(DetectorKind::Vortex),
            "generic" => Ok(DetectorKind::Generic),
            other => Err(FlyscanError::Configuration(format!(
                "unknown detector kind '{other}'"
            ))),
        }
    }
}

enum TemplateArg<'a> {
    Str(&'a str),
    Int(u64),
}

impl std::fmt::Display for TemplateArg<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateArg::Str(s) => f.write_str(s),
            TemplateArg::Int(n) => write!(f, "{n}"),
        }
    }
}

fn take_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Option<usize> {
    let mut digits = String::new();
    while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
        digits.push(c);
        chars.next();
    }
    digits.parse().ok()
}

/// Expand an areaDetector file template with `(path, name, number)`.
///
/// Supports the printf subset the plugins accept: `%s`, `%d` with the `0`
/// and `-` flags, field width, precision, and `%%`.
pub fn expand_file_template(template: &str, path: &str, name: &str, number: u64) -> String {
    let args = [
        TemplateArg::Str(path),
        TemplateArg::Str(name),
        TemplateArg::Int(number),
    ];
    let mut args = args.iter();
    let mut out = String::with_capacity(template.len() + path.len() + name.len() + 8);
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }

        let mut zero_pad = false;
        let mut left_align = false;
        while let Some(&flag) = chars.peek() {
            match flag {
                '0' => zero_pad = true,
                '-' => left_align = true,
                _ => break,
            }
            chars.next();
        }
        let width = take_number(&mut chars).unwrap_or(0);
        let precision = if chars.peek() == Some(&'.') {
            chars.next();
            Some(take_number(&mut chars).unwrap_or(0))
        } else {
            None
        };
        let Some(conversion) = chars.next() else {
            break;
        };
        let Some(arg) = args.next() else {
            out.push('%');
            out.push(conversion);
            continue;
        };

        let numeric = matches!(conversion, 'd' | 'i' | 'u');
        let body = match (conversion, arg, precision) {
            ('d' | 'i' | 'u', TemplateArg::Int(n), Some(p)) => format!("{n:0>p$}"),
            ('s', a, Some(p)) => a.to_string().chars().take(p).collect(),
            (_, a, _) => a.to_string(),
        };

        if body.len() >= width {
            out.push_str(&body);
        } else if left_align {
            out.push_str(&format!("{body:<width$}"));
        } else if zero_pad && numeric && precision.is_none() {
            out.push_str(&format!("{body:0>width$}"));
        } else {
            out.push_str(&format!("{body:>width$}"));
        }
    }
    out
}

fn dir_string(dir: &Path) -> String {
    let mut s = dir.to_string_lossy().into_owned();
    if !s.ends_with(std::path::MAIN_SEPARATOR) {
        s.push(std::path::MAIN_SEPARATOR);
    }
    s
}

fn now_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1e6
}

/// Frame numbering shared between the adapter and its watcher task
struct FrameCounter {
    name: String,
    next_point: Mutex<u64>,
    records: Mutex<Vec<FrameRecord>>,
    frames: watch::Sender<u64>,
    sink: Mutex<Option<DatumSink>>,
}

impl FrameCounter {
    fn new(name: &str) -> Self {
        let (frames, _) = watch::channel(0);
        Self {
            name: name.to_string(),
            next_point: Mutex::new(0),
            records: Mutex::new(Vec::new()),
            frames,
            sink: Mutex::new(None),
        }
    }

    fn reset(&self, clear_records: bool) {
        let mut next = self.next_point.lock();
        *next = 0;
        if clear_records {
            self.records.lock().clear();
        }
        self.frames.send_replace(0);
    }

    fn generate(
        &self,
        key: &str,
        timestamp: f64,
        mut extra: BTreeMap<String, serde_json::Value>,
    ) -> FrameRecord {
        let mut next = self.next_point.lock();
        let point_number = *next;
        *next += 1;

        extra.insert("point_number".to_string(), serde_json::json!(point_number));
        let record = FrameRecord {
            point_number,
            timestamp,
            file_key: key.to_string(),
            extra,
        };
        self.records.lock().push(record.clone());
        self.frames.send_replace(point_number + 1);

        if let Some(sink) = self.sink.lock().as_ref() {
            if sink.send(record.clone()).is_err() {
                debug!(detector = %self.name, "Datum sink closed");
            }
        }
        record
    }
}

struct FilePlan {
    full_path: PathBuf,
    relative_path: PathBuf,
}

/// Area detector driven through its cam and HDF file plugin records
pub struct FileWriterDetector {
    name: String,
    cam: String,
    hdf: String,
    kind: DetectorKind,
    channels: Arc<dyn ChannelAccess>,
    file_template: String,
    roots: Option<(PathBuf, PathBuf)>,
    capture_timeout: Duration,
    trigger_mode: Mutex<TriggerMode>,
    plan: Mutex<Option<FilePlan>>,
    current_file: Mutex<Option<PathBuf>>,
    touched: AtomicBool,
    staged: AtomicBool,
    watcher: Mutex<Option<JoinHandle<()>>>,
    counter: Arc<FrameCounter>,
}

impl FileWriterDetector {
    /// Detector with records `{prefix}cam1:` and `{prefix}HDF1:`
    pub fn new(
        name: impl Into<String>,
        prefix: &str,
        kind: DetectorKind,
        channels: Arc<dyn ChannelAccess>,
    ) -> Self {
        let name = name.into();
        let counter = Arc::new(FrameCounter::new(&name));
        Self {
            name,
            cam: format!("{prefix}cam1:"),
            hdf: format!("{prefix}HDF1:"),
            kind,
            channels,
            file_template: DEFAULT_FILE_TEMPLATE.to_string(),
            roots: None,
            capture_timeout: Duration::from_secs(5),
            trigger_mode: Mutex::new(TriggerMode::Internal),
            plan: Mutex::new(None),
            current_file: Mutex::new(None),
            touched: AtomicBool::new(false),
            staged: AtomicBool::new(false),
            watcher: Mutex::new(None),
            counter,
        }
    }

    /// Use a different file template
    pub fn with_file_template(mut self, template: impl Into<String>) -> Self {
        self.file_template = template.into();
        self
    }

    /// The IOC sees `read_root` as `write_root`
    pub fn with_path_roots(mut self, write_root: impl Into<PathBuf>, read_root: impl Into<PathBuf>) -> Self {
        self.roots = Some((write_root.into(), read_root.into()));
        self
    }

    /// How long to wait for the plugin to acknowledge capture
    pub fn with_capture_timeout(mut self, timeout: Duration) -> Self {
        self.capture_timeout = timeout;
        self
    }

    /// Detector family
    pub fn kind(&self) -> DetectorKind {
        self.kind
    }

    /// Full name of a cam record field
    pub fn cam_pv(&self, field: &str) -> String {
        format!("{}{}", self.cam, field)
    }

    /// Full name of an HDF plugin record field
    pub fn hdf_pv(&self, field: &str) -> String {
        format!("{}{}", self.hdf, field)
    }

    /// Relative path recorded by the last `setup_images`
    pub fn relative_path(&self) -> Option<PathBuf> {
        self.plan.lock().as_ref().map(|p| p.relative_path.clone())
    }

    fn to_write_side(&self, read_path: &Path) -> PathBuf {
        match &self.roots {
            Some((write_root, read_root)) => match read_path.strip_prefix(read_root) {
                Ok(rest) => write_root.join(rest),
                Err(_) => read_path.to_path_buf(),
            },
            None => read_path.to_path_buf(),
        }
    }

    fn to_read_side(&self, write_path: &Path) -> PathBuf {
        match &self.roots {
            Some((write_root, read_root)) => match write_path.strip_prefix(write_root) {
                Ok(rest) => read_root.join(rest),
                Err(_) => write_path.to_path_buf(),
            },
            None => write_path.to_path_buf(),
        }
    }

    async fn put(&self, pv: String, value: impl Into<ChannelValue>) -> FlyscanResult<()> {
        self.channels.put(&pv, value.into()).await?;
        Ok(())
    }

    fn spawn_watcher(&self, file_key: String) -> FlyscanResult<JoinHandle<()>> {
        let mut rx = self.channels.monitor(&self.hdf_pv("NumCaptured_RBV"))?;
        let counter = self.counter.clone();
        let mut seen = rx.borrow_and_update().as_i64().unwrap_or(0).max(0) as u64;

        Ok(tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let captured = rx.borrow_and_update().as_i64().unwrap_or(0).max(0) as u64;
                if captured < seen {
                    seen = captured;
                }
                while seen < captured {
                    seen += 1;
                    counter.generate(&file_key, now_seconds(), BTreeMap::new());
                }
            }
        }))
    }
}

impl Device for FileWriterDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn channel_names(&self) -> Vec<String> {
        let cam = ["TriggerMode", "Acquire", "AcquireTime", "NumImages", "ArrayCounter", "ArrayCounter_RBV"];
        let hdf = [
            "FilePath",
            "FileName",
            "FileNumber",
            "FileTemplate",
            "FullFileName_RBV",
            "AutoIncrement",
            "FileWriteMode",
            "NumCapture",
            "Capture",
            "Capture_RBV",
            "NumCaptured_RBV",
            "FilePathExists_RBV",
        ];
        cam.iter()
            .map(|f| self.cam_pv(f))
            .chain(hdf.iter().map(|f| self.hdf_pv(f)))
            .collect()
    }
}

#[async_trait]
impl Stageable for FileWriterDetector {
    #[instrument(skip(self), fields(detector = %self.name))]
    async fn stage(&self) -> FlyscanResult<()> {
        if self.staged.load(Ordering::SeqCst) {
            return Ok(());
        }

        // Only reads happen before this point
        let (write_path, read_path) = self.make_write_read_paths().await?;
        self.touched.store(true, Ordering::SeqCst);

        let dir_ok = self
            .channels
            .get_i64(&self.hdf_pv("FilePathExists_RBV"))
            .await?;
        if dir_ok != 1 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("IOC cannot write to {}", write_path.display()),
            )
            .into());
        }

        self.counter.reset(true);
        let mode = self.trigger_mode();
        let images = match mode {
            TriggerMode::ExternalGated => EXTERNAL_FRAME_CAPACITY,
            TriggerMode::Internal => 1,
        };
        self.put(self.cam_pv("NumImages"), images).await?;
        self.put(self.cam_pv("ArrayCounter"), 0_i64).await?;
        self.put(self.hdf_pv("FileWriteMode"), WRITE_MODE_STREAM).await?;
        self.put(self.hdf_pv("NumCapture"), 0_i64).await?;
        self.put(self.hdf_pv("Capture"), 1_i64).await?;
        wait_for_value(
            self.channels.as_ref(),
            &self.hdf_pv("Capture_RBV"),
            self.capture_timeout,
            |v| v.as_i64() == Some(1),
        )
        .await?;

        let file_key = read_path.to_string_lossy().into_owned();
        let watcher = self.spawn_watcher(file_key)?;
        if let Some(old) = self.watcher.lock().replace(watcher) {
            old.abort();
        }
        *self.current_file.lock() = Some(read_path.clone());

        if mode == TriggerMode::ExternalGated {
            self.put(self.cam_pv("Acquire"), 1_i64).await?;
        }

        self.staged.store(true, Ordering::SeqCst);
        info!(file = %read_path.display(), ?mode, "Detector staged");
        Ok(())
    }

    #[instrument(skip(self), fields(detector = %self.name))]
    async fn unstage(&self) -> FlyscanResult<()> {
        if !self.touched.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }

        let internal = self.kind.trigger_value(TriggerMode::Internal);
        let restore = [
            (self.cam_pv("Acquire"), ChannelValue::Int(0)),
            (self.hdf_pv("Capture"), ChannelValue::Int(0)),
            (self.cam_pv("TriggerMode"), ChannelValue::Int(internal)),
            (self.cam_pv("NumImages"), ChannelValue::Int(1)),
        ];
        let mut first_error = None;
        for (pv, value) in restore {
            if let Err(e) = self.channels.put(&pv, value).await {
                warn!(pv = %pv, error = %e, "Restore failed during unstage");
                first_error.get_or_insert(e);
            }
        }

        *self.trigger_mode.lock() = TriggerMode::Internal;
        self.counter.reset(false);
        self.staged.store(false, Ordering::SeqCst);
        debug!("Detector unstaged");

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl AreaDetector for FileWriterDetector {
    async fn set_trigger_mode(&self, mode: TriggerMode) -> FlyscanResult<()> {
        self.touched.store(true, Ordering::SeqCst);
        self.put(self.cam_pv("TriggerMode"), self.kind.trigger_value(mode))
            .await?;
        *self.trigger_mode.lock() = mode;
        Ok(())
    }

    fn trigger_mode(&self) -> TriggerMode {
        *self.trigger_mode.lock()
    }

    async fn set_acquire_time(&self, seconds: f64) -> FlyscanResult<()> {
        self.put(self.cam_pv("AcquireTime"), seconds).await
    }

    fn planned_paths(
        &self,
        base_path: &Path,
        folder: &Path,
        name_base: &str,
        file_number: u64,
    ) -> (PathBuf, PathBuf) {
        let dir = base_path.join(folder).join(&self.name);
        let full = PathBuf::from(expand_file_template(
            &self.file_template,
            &dir_string(&dir),
            name_base,
            file_number,
        ));
        let relative = full
            .strip_prefix(base_path)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| full.clone());
        (full, relative)
    }

    #[instrument(skip(self, base_path, folder), fields(detector = %self.name))]
    async fn setup_images(
        &self,
        base_path: &Path,
        folder: &Path,
        name_base: &str,
        file_number: u64,
        flyscan: bool,
    ) -> FlyscanResult<(PathBuf, PathBuf)> {
        let (full_path, relative_path) =
            self.planned_paths(base_path, folder, name_base, file_number);
        let write_dir = self.to_write_side(&base_path.join(folder).join(&self.name));

        self.touched.store(true, Ordering::SeqCst);
        *self.current_file.lock() = None;
        self.put(self.hdf_pv("FilePath"), dir_string(&write_dir)).await?;
        self.put(self.hdf_pv("FileName"), name_base).await?;
        self.put(self.hdf_pv("FileNumber"), file_number).await?;
        self.put(self.hdf_pv("FileTemplate"), self.file_template.as_str())
            .await?;
        self.put(self.hdf_pv("AutoIncrement"), 0_i64).await?;

        let mode = if flyscan {
            TriggerMode::ExternalGated
        } else {
            TriggerMode::Internal
        };
        self.set_trigger_mode(mode).await?;

        *self.plan.lock() = Some(FilePlan {
            full_path: full_path.clone(),
            relative_path: relative_path.clone(),
        });
        debug!(full = %full_path.display(), relative = %relative_path.display(), "File writer configured");
        Ok((full_path, relative_path))
    }

    async fn make_write_read_paths(&self) -> FlyscanResult<(PathBuf, PathBuf)> {
        let dir = self.channels.get_string(&self.hdf_pv("FilePath")).await?;
        let name = self.channels.get_string(&self.hdf_pv("FileName")).await?;
        let number = self.channels.get_i64(&self.hdf_pv("FileNumber")).await?;
        let template = self
            .channels
            .get_string(&self.hdf_pv("FileTemplate"))
            .await?;

        let dir = dir_string(Path::new(&dir));
        let write_path = PathBuf::from(expand_file_template(
            &template,
            &dir,
            &name,
            u64::try_from(number).unwrap_or(0),
        ));
        let read_path = self.to_read_side(&write_path);

        if read_path.exists() {
            return Err(FlyscanError::FileExists(read_path));
        }
        if let Some(plan) = self.plan.lock().as_ref() {
            if plan.full_path != read_path {
                warn!(
                    planned = %plan.full_path.display(),
                    device = %read_path.display(),
                    "Detector file path differs from the reserved path"
                );
            }
        }
        Ok((write_path, read_path))
    }

    fn generate_datum(
        &self,
        key: &str,
        timestamp: f64,
        extra: BTreeMap<String, serde_json::Value>,
    ) -> FrameRecord {
        self.counter.generate(key, timestamp, extra)
    }

    fn frame_records(&self) -> Vec<FrameRecord> {
        self.counter.records.lock().clone()
    }

    fn is_staged(&self) -> bool {
        self.staged.load(Ordering::SeqCst)
    }

    async fn wait_for_frames(&self, count: u64, timeout: Duration) -> FlyscanResult<()> {
        let mut rx = self.counter.frames.subscribe();
        let result = match tokio::time::timeout(timeout, rx.wait_for(|n| *n >= count)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(FlyscanError::Aborted(format!("{} frame counter closed", self.name))),
            Err(_) => Err(FlyscanError::timeout(
                format!("{} frame {}", self.name, count),
                timeout,
            )),
        };
        result
    }

    fn file_completion(&self) -> Option<WriterCompletion> {
        let file = self.current_file.lock().clone()?;
        let pv = self.hdf_pv("Capture_RBV");
        match self.channels.monitor(&pv) {
            Ok(rx) => {
                let status = StatusCompletion::new(format!("{} capture done", self.name), rx, |v| {
                    v.as_i64() == Some(0)
                });
                Some(WriterCompletion::new(self.name.clone(), file, status))
            }
            Err(e) => {
                warn!(detector = %self.name, error = %e, "Cannot monitor file writer status");
                None
            }
        }
    }

    fn attach_datum_sink(&self, sink: Option<DatumSink>) {
        *self.counter.sink.lock() = sink;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SimChannelLayer;
    use crate::hardware::mock::{self, DetectorSimOptions};

    #[test]
    fn kind_names() {
        assert_eq!("Eiger".parse::<DetectorKind>().unwrap(), DetectorKind::Eiger);
        assert_eq!("vortex".parse::<DetectorKind>().unwrap(), DetectorKind::Vortex);
        assert!("pilatus".parse::<DetectorKind>().is_err());
    }

    #[test]
    fn template_expansion() {
        assert_eq!(
            expand_file_template(DEFAULT_FILE_TEMPLATE, "/data/s1/eiger/", "scan", 7),
            "/data/s1/eiger/scan_000007.h5"
        );
        assert_eq!(expand_file_template("%s%s_%04d.tif", "/d/", "a", 12), "/d/a_0012.tif");
        assert_eq!(expand_file_template("%s%s_%d%%.h5", "/d/", "a", 3), "/d/a_3%.h5");
        assert_eq!(expand_file_template("%s%s_%3d.h5", "/d/", "a", 3), "/d/a_  3.h5");
        assert_eq!(expand_file_template("%s%s_%6.6d.h5", "/d/", "a", 1_234_567), "/d/a_1234567.h5");
    }

    #[test]
    fn trigger_values_per_family() {
        assert_eq!(DetectorKind::Eiger.trigger_value(TriggerMode::ExternalGated), 3);
        assert_eq!(DetectorKind::Vortex.trigger_value(TriggerMode::Internal), 1);
        assert_ne!(
            DetectorKind::Generic.trigger_value(TriggerMode::Internal),
            DetectorKind::Generic.trigger_value(TriggerMode::ExternalGated)
        );
    }

    #[test]
    fn planned_paths_are_relative_to_base() {
        let sim = SimChannelLayer::new();
        let det = FileWriterDetector::new("eiger", "dp_eiger:", DetectorKind::Eiger, Arc::new(sim));
        let (full, relative) = det.planned_paths(Path::new("/data/exp1"), Path::new("sampleA"), "scan_12", 12);
        assert_eq!(full, PathBuf::from("/data/exp1/sampleA/eiger/scan_12_000012.h5"));
        assert_eq!(relative, PathBuf::from("sampleA/eiger/scan_12_000012.h5"));
    }

    #[tokio::test]
    async fn path_roots_map_write_and_read_views() {
        let sim = SimChannelLayer::new();
        mock::install_detector(&sim, "dp_lambda:", DetectorKind::Lambda, "sg:DetTrigger", DetectorSimOptions::default());
        let read_root = tempfile::tempdir().unwrap();
        let det = FileWriterDetector::new("lambda", "dp_lambda:", DetectorKind::Lambda, Arc::new(sim.clone()))
            .with_path_roots("/ioc/data", read_root.path());

        det.setup_images(read_root.path(), Path::new("s1"), "scan", 3, true)
            .await
            .unwrap();
        assert_eq!(
            sim.value_string("dp_lambda:HDF1:FilePath"),
            format!("/ioc/data/s1/lambda{}", std::path::MAIN_SEPARATOR)
        );

        let (write, read) = det.make_write_read_paths().await.unwrap();
        assert_eq!(write, PathBuf::from("/ioc/data/s1/lambda/scan_000003.h5"));
        assert_eq!(read, read_root.path().join("s1/lambda/scan_000003.h5"));
    }

    #[tokio::test]
    async fn stage_with_existing_file_mutates_nothing() {
        let sim = SimChannelLayer::new();
        mock::install_detector(&sim, "dp_eiger:", DetectorKind::Eiger, "sg:DetTrigger", DetectorSimOptions::default());
        let base = tempfile::tempdir().unwrap();
        let det = FileWriterDetector::new("eiger", "dp_eiger:", DetectorKind::Eiger, Arc::new(sim.clone()));

        let (full, _) = det
            .setup_images(base.path(), Path::new("s1"), "scan", 1, true)
            .await
            .unwrap();
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(&full, b"old run").unwrap();

        let before = sim.puts().len();
        for _ in 0..2 {
            let err = det.stage().await.unwrap_err();
            assert!(matches!(err, FlyscanError::FileExists(ref p) if p == &full));
            assert_eq!(sim.puts().len(), before);
        }
        assert!(!det.is_staged());
        assert_eq!(std::fs::read(&full).unwrap(), b"old run");
    }

    #[tokio::test]
    async fn point_numbers_restart_at_zero_each_stage() {
        let sim = SimChannelLayer::new();
        mock::install_detector(&sim, "dp_eiger:", DetectorKind::Eiger, "sg:DetTrigger", DetectorSimOptions::default());
        let base = tempfile::tempdir().unwrap();
        let det = FileWriterDetector::new("eiger", "dp_eiger:", DetectorKind::Eiger, Arc::new(sim.clone()));

        for run in 1..=2_u64 {
            det.setup_images(base.path(), Path::new("s1"), "scan", run, true)
                .await
                .unwrap();
            det.stage().await.unwrap();
            assert!(det.is_staged());

            let numbers: Vec<u64> = (0..3)
                .map(|_| det.generate_datum("key", 0.0, BTreeMap::new()).point_number)
                .collect();
            assert_eq!(numbers, vec![0, 1, 2]);
            let record = det.frame_records().pop().unwrap();
            assert_eq!(record.extra["point_number"], serde_json::json!(2));

            det.unstage().await.unwrap();
            assert!(!det.is_staged());
            assert_eq!(det.generate_datum("key", 0.0, BTreeMap::new()).point_number, 0);
        }
    }

    #[tokio::test]
    async fn frame_barrier_waits_for_the_count() {
        let sim = SimChannelLayer::new();
        mock::install_detector(&sim, "dp_eiger:", DetectorKind::Eiger, "sg:DetTrigger", DetectorSimOptions::default());
        let base = tempfile::tempdir().unwrap();
        let det = Arc::new(FileWriterDetector::new("eiger", "dp_eiger:", DetectorKind::Eiger, Arc::new(sim.clone())));
        det.setup_images(base.path(), Path::new("s1"), "scan", 1, true)
            .await
            .unwrap();
        det.stage().await.unwrap();

        assert!(matches!(
            det.wait_for_frames(1, Duration::from_millis(20)).await,
            Err(FlyscanError::Timeout { .. })
        ));

        let waiter = {
            let det = det.clone();
            tokio::spawn(async move { det.wait_for_frames(2, Duration::from_secs(2)).await })
        };
        det.generate_datum("key", 0.0, BTreeMap::new());
        det.generate_datum("key", 0.0, BTreeMap::new());
        waiter.await.unwrap().unwrap();

        det.unstage().await.unwrap();
    }

    #[tokio::test]
    async fn unstage_restores_internal_trigger() {
        let sim = SimChannelLayer::new();
        mock::install_detector(&sim, "dp_vortex:", DetectorKind::Vortex, "sg:DetTrigger", DetectorSimOptions::default());
        let base = tempfile::tempdir().unwrap();
        let det = FileWriterDetector::new("vortex", "dp_vortex:", DetectorKind::Vortex, Arc::new(sim.clone()));

        det.setup_images(base.path(), Path::new("s1"), "scan", 1, true)
            .await
            .unwrap();
        assert_eq!(sim.value_i64("dp_vortex:cam1:TriggerMode"), 3);

        // Nothing was captured yet, unstage still restores defaults
        det.unstage().await.unwrap();
        assert_eq!(sim.value_i64("dp_vortex:cam1:TriggerMode"), 1);
        assert_eq!(sim.value_i64("dp_vortex:HDF1:Capture"), 0);
        assert_eq!(det.trigger_mode(), TriggerMode::Internal);
    }

    #[tokio::test]
    async fn missing_ioc_directory_fails_stage() {
        let sim = SimChannelLayer::new();
        mock::install_detector(&sim, "dp_eiger:", DetectorKind::Eiger, "sg:DetTrigger", DetectorSimOptions::default());
        let base = tempfile::tempdir().unwrap();
        let det = FileWriterDetector::new("eiger", "dp_eiger:", DetectorKind::Eiger, Arc::new(sim.clone()));

        det.setup_images(base.path(), Path::new("s1"), "scan", 1, true)
            .await
            .unwrap();
        sim.set("dp_eiger:HDF1:FilePathExists_RBV", 0_i64);
        assert!(det.stage().await.is_err());
        det.unstage().await.unwrap();
        assert_eq!(sim.value_i64("dp_eiger:cam1:TriggerMode"), 0);
    }
}
