//! Shared setup for flyscan integration tests.

#![allow(dead_code)]

use beamline_flyscan::config::FlyscanConfig;
use beamline_flyscan::data::master_file::{JsonLinkBackend, JsonMasterFile, MasterFileWriter};
use beamline_flyscan::experiment::document::Document;
use beamline_flyscan::experiment::{FlyscanOrchestrator, StaticExperimentDirectory};
use beamline_flyscan::hardware::mock::{DetectorSimOptions, SimulatedBeamline, StreamSimOptions};
use beamline_flyscan::hardware::DetectorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Experiment name registered for every test beamline
pub const EXPERIMENT: &str = "polar";

pub const DETECTORS: [(&str, DetectorKind); 2] =
    [("eiger", DetectorKind::Eiger), ("vortex", DetectorKind::Vortex)];

/// Short timeouts so failure paths finish quickly
pub fn test_config() -> FlyscanConfig {
    let mut config = FlyscanConfig::default();
    config.storage.writer_timeout_s = 2.0;
    config.timeouts.stream_status_s = 1.0;
    config.trigger.reset_settle_s = 0.01;
    config
}

pub async fn beamline(base: &Path, config: &FlyscanConfig) -> (SimulatedBeamline, FlyscanOrchestrator) {
    beamline_with(base, config, StreamSimOptions::default()).await
}

pub async fn beamline_with(
    base: &Path,
    config: &FlyscanConfig,
    stream: StreamSimOptions,
) -> (SimulatedBeamline, FlyscanOrchestrator) {
    let beamline =
        SimulatedBeamline::with_options(config, &DETECTORS, &["x"], DetectorSimOptions::default(), stream);
    let orchestrator = orchestrator_for(&beamline, base, config).await;
    (beamline, orchestrator)
}

/// A fresh orchestrator over `beamline`, writing JSON master files
pub async fn orchestrator_for(
    beamline: &SimulatedBeamline,
    base: &Path,
    config: &FlyscanConfig,
) -> FlyscanOrchestrator {
    let directory = Arc::new(StaticExperimentDirectory::new().with_experiment(EXPERIMENT, base));
    beamline
        .orchestrator_builder(config.clone(), directory)
        .await
        .master_writer(Arc::new(MasterFileWriter::new(Arc::new(JsonLinkBackend))))
        .build()
        .expect("orchestrator builds")
}

/// Every document received so far
pub fn drain(rx: &mut broadcast::Receiver<Document>) -> Vec<Document> {
    let mut docs = Vec::new();
    while let Ok(doc) = rx.try_recv() {
        docs.push(doc);
    }
    docs
}

pub fn read_master(path: &Path) -> JsonMasterFile {
    let bytes = std::fs::read(path).expect("master file readable");
    serde_json::from_slice(&bytes).expect("master file is JSON")
}

/// Poll `check` until it holds or `within` elapses
pub async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check().await
}
