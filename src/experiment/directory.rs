//! Experiment directory service.
//!
//! Resolves an experiment name to the data root its runs are written under.
//! The real service is the facility's data-management system; the crate only
//! needs the lookup.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{FlyscanError, FlyscanResult};

/// Resolves experiment names to data roots
#[async_trait]
pub trait ExperimentDirectory: Send + Sync {
    /// Data root of `experiment`, or `MissingExperiment`
    async fn base_path(&self, experiment: &str) -> FlyscanResult<PathBuf>;
}

/// Fixed table of experiments
#[derive(Debug, Default)]
pub struct StaticExperimentDirectory {
    experiments: RwLock<HashMap<String, PathBuf>>,
}

impl StaticExperimentDirectory {
    /// Directory with no experiments
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an experiment
    pub fn with_experiment(self, name: impl Into<String>, base_path: impl Into<PathBuf>) -> Self {
        self.register(name, base_path);
        self
    }

    /// Add or replace an experiment
    pub fn register(&self, name: impl Into<String>, base_path: impl Into<PathBuf>) {
        self.experiments
            .write()
            .insert(name.into(), base_path.into());
    }
}

#[async_trait]
impl ExperimentDirectory for StaticExperimentDirectory {
    async fn base_path(&self, experiment: &str) -> FlyscanResult<PathBuf> {
        self.experiments
            .read()
            .get(experiment)
            .cloned()
            .ok_or_else(|| FlyscanError::MissingExperiment(experiment.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_known_experiments_only() {
        let dir = StaticExperimentDirectory::new().with_experiment("polar-2026", "/data/polar");
        assert_eq!(
            dir.base_path("polar-2026").await.unwrap(),
            PathBuf::from("/data/polar")
        );
        assert!(matches!(
            dir.base_path("nope").await,
            Err(FlyscanError::MissingExperiment(name)) if name == "nope"
        ));
    }
}
