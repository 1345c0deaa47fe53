//! Run files and run metadata.
//!
//! [`RunFileSet`] is computed once per run, checked before any hardware is
//! armed, and then frozen. Layout under the experiment's data root:
//!
//! ```text
//! {base}/{sample}/{name_base}_{scan_id}_master.hdf
//! {base}/{sample}/{name_base}_{scan_id}_positions.h5
//! {base}/{sample}/{detector}/{name_base}_{scan_id:06}.h5
//! ```
//!
//! Relative paths are always relative to `{base}` so the `{sample}` folder
//! can be moved as a whole.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::StorageConfig;
use crate::error::{FlyscanError, FlyscanResult};
use crate::hardware::capabilities::AreaDetector;
use crate::hardware::position_stream::stream_file_path;

/// Free-form run metadata; later writes win
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunMetadata(BTreeMap<String, serde_json::Value>);

impl RunMetadata {
    /// Empty metadata
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key`, replacing any previous value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Serialize) -> FlyscanResult<()> {
        self.0.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Value stored under `key`
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    /// Apply `overrides` on top of `self`; override values replace existing keys
    pub fn merge(&mut self, overrides: &RunMetadata) {
        for (key, value) in &overrides.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no key is set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keys and values in key order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.0.iter()
    }
}

impl FromIterator<(String, serde_json::Value)> for RunMetadata {
    fn from_iter<T: IntoIterator<Item = (String, serde_json::Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Full and base-relative path of one detector file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorFiles {
    /// Path as written
    pub full_path: PathBuf,
    /// Path relative to the data root, as linked
    pub relative_path: PathBuf,
}

/// Every file one run will create
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFileSet {
    /// Experiment data root
    pub base_path: PathBuf,
    /// Master file linking everything else
    pub master_file_path: PathBuf,
    /// Detector name to its file
    pub detector_file_paths: BTreeMap<String, DetectorFiles>,
    /// Position stream output
    pub position_stream_file_path: PathBuf,
}

impl RunFileSet {
    /// Compute the run's paths. Nothing is checked or created.
    pub fn plan(
        base_path: &Path,
        sample: &str,
        name_base: &str,
        scan_id: u64,
        storage: &StorageConfig,
        detectors: &[Arc<dyn AreaDetector>],
    ) -> Self {
        let folder = PathBuf::from(sample);
        let dir = base_path.join(&folder);
        let stem = format!("{name_base}_{scan_id}");

        let master_file_path = dir.join(format!(
            "{stem}_{}.{}",
            storage.master_suffix, storage.master_extension
        ));
        let position_stream_file_path = stream_file_path(&dir, &stem, &storage.position_suffix);
        let detector_file_paths = detectors
            .iter()
            .map(|det| {
                let (full_path, relative_path) =
                    det.planned_paths(base_path, &folder, name_base, scan_id);
                (
                    det.name().to_string(),
                    DetectorFiles {
                        full_path,
                        relative_path,
                    },
                )
            })
            .collect();

        Self {
            base_path: base_path.to_path_buf(),
            master_file_path,
            detector_file_paths,
            position_stream_file_path,
        }
    }

    /// [`RunFileSet::plan`] followed by [`RunFileSet::preflight`]
    pub fn reserve(
        base_path: &Path,
        sample: &str,
        name_base: &str,
        scan_id: u64,
        storage: &StorageConfig,
        detectors: &[Arc<dyn AreaDetector>],
    ) -> FlyscanResult<Self> {
        let files = Self::plan(base_path, sample, name_base, scan_id, storage, detectors);
        files.preflight()?;
        Ok(files)
    }

    /// Fail if two writers share a path or any path already exists
    pub fn preflight(&self) -> FlyscanResult<()> {
        let mut seen = BTreeSet::new();
        for path in self.all_paths() {
            if !seen.insert(path.clone()) {
                return Err(FlyscanError::DuplicatePath(path));
            }
            if path.exists() {
                return Err(FlyscanError::FileExists(path));
            }
        }
        Ok(())
    }

    /// Master, position stream and detector files
    pub fn all_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![
            self.master_file_path.clone(),
            self.position_stream_file_path.clone(),
        ];
        paths.extend(
            self.detector_file_paths
                .values()
                .map(|f| f.full_path.clone()),
        );
        paths
    }

    /// `path` relative to the data root (unchanged when outside it)
    pub fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.base_path)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }

    /// Link targets for the master file: writer name to relative path
    pub fn link_templates(&self) -> BTreeMap<String, String> {
        let mut links: BTreeMap<String, String> = self
            .detector_file_paths
            .iter()
            .map(|(name, f)| (name.clone(), f.relative_path.to_string_lossy().into_owned()))
            .collect();
        links.insert(
            "positions".to_string(),
            self.relative(&self.position_stream_file_path)
                .to_string_lossy()
                .into_owned(),
        );
        links
    }
}
