//! The master file never links a file before its writer has closed it.

mod common;

use beamline_flyscan::channel::ChannelValue;
use beamline_flyscan::data::master_file::{JsonLinkBackend, MasterFileWriter, POSITION_LINK};
use beamline_flyscan::experiment::metadata::DetectorFiles;
use beamline_flyscan::experiment::{RunFileSet, RunMetadata};
use beamline_flyscan::hardware::{StatusCompletion, WriterCompletion};
use beamline_flyscan::FlyscanError;
use common::read_master;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_test::{assert_pending, assert_ready};

fn run_files(base: &Path) -> RunFileSet {
    RunFileSet {
        base_path: base.to_path_buf(),
        master_file_path: base.join("s/fly_3_master.hdf"),
        detector_file_paths: BTreeMap::from([(
            "eiger".to_string(),
            DetectorFiles {
                full_path: base.join("s/eiger/fly_000003.h5"),
                relative_path: PathBuf::from("s/eiger/fly_000003.h5"),
            },
        )]),
        position_stream_file_path: base.join("s/fly_3_positions.h5"),
    }
}

/// A writer whose `Capture_RBV` the test controls
fn slow_writer(name: &str, file: &Path) -> (watch::Sender<ChannelValue>, WriterCompletion) {
    let (tx, rx) = watch::channel(ChannelValue::Int(1));
    let status = StatusCompletion::new(format!("{name} closed"), rx, |v| v.as_i64() == Some(0));
    (tx, WriterCompletion::new(name, file, status))
}

fn write(file: &Path) {
    std::fs::create_dir_all(file.parent().unwrap()).unwrap();
    std::fs::write(file, b"frames").unwrap();
}

#[tokio::test]
async fn test_links_wait_for_slow_writer() {
    let base = tempfile::tempdir().unwrap();
    let files = run_files(base.path());
    let writer = MasterFileWriter::new(Arc::new(JsonLinkBackend));
    writer.begin_run("run-3", &files, RunMetadata::new());

    let eiger_file = files.detector_file_paths["eiger"].full_path.clone();
    let (eiger_status, eiger) = slow_writer("eiger", &eiger_file);
    let (stream_status, stream) = slow_writer("positions", &files.position_stream_file_path);
    writer.register_writer("eiger", eiger).unwrap();
    writer.register_writer(POSITION_LINK, stream).unwrap();

    // Position stream finishes first
    write(&files.position_stream_file_path);
    stream_status.send_replace(ChannelValue::Int(0));

    let mut waiting = tokio_test::task::spawn(writer.wait_for_writers(Duration::from_secs(5)));
    assert_pending!(waiting.poll());
    assert!(matches!(
        writer.try_commit_links().await,
        Err(FlyscanError::WriterNotClosed(name)) if name == "eiger"
    ));
    assert!(!files.master_file_path.exists());

    // Status alone is not enough: the file must be on disk
    eiger_status.send_replace(ChannelValue::Int(0));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_pending!(waiting.poll());
    assert!(!files.master_file_path.exists());

    write(&eiger_file);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let ready = assert_ready!(waiting.poll()).unwrap();
    assert!(ready.missing().is_empty());
    assert_eq!(ready.closed().len(), 2);

    let report = writer.commit_links(ready).await.unwrap();
    assert_eq!(report.linked, vec!["eiger".to_string(), "positions".to_string()]);

    let master = read_master(&files.master_file_path);
    assert_eq!(master.links["eiger"].target_file, "s/eiger/fly_000003.h5");
    assert_eq!(master.links["positions"].target_file, "s/fly_3_positions.h5");
    assert_eq!(master.attributes["link_root"], base.path().to_string_lossy());

    // Per-run state is gone
    assert!(writer.external_files().is_empty());
    assert_eq!(writer.position_file_name(), None);
}

#[tokio::test]
async fn test_writer_that_never_closes_is_reported_missing() {
    let base = tempfile::tempdir().unwrap();
    let files = run_files(base.path());
    let writer = MasterFileWriter::new(Arc::new(JsonLinkBackend));
    writer.begin_run("run-3", &files, RunMetadata::new());

    let (_eiger_status, eiger) = slow_writer("eiger", &files.detector_file_paths["eiger"].full_path);
    writer.register_writer("eiger", eiger).unwrap();
    // The position stream never registers at all

    let ready = writer.wait_for_writers(Duration::from_millis(100)).await.unwrap();
    assert_eq!(ready.missing().len(), 2);
    let report = writer.commit_links(ready).await.unwrap();
    assert!(report.linked.is_empty());

    let master = read_master(&files.master_file_path);
    assert!(master.links.is_empty());
    let missing: Vec<String> = serde_json::from_str(&master.attributes["missing_files"]).unwrap();
    assert_eq!(
        missing,
        vec!["s/eiger/fly_000003.h5".to_string(), "s/fly_3_positions.h5".to_string()]
    );
}

#[tokio::test]
async fn test_readiness_from_an_earlier_run_is_rejected() {
    let base = tempfile::tempdir().unwrap();
    let files = run_files(base.path());
    let writer = MasterFileWriter::new(Arc::new(JsonLinkBackend));

    writer.begin_run("run-3", &files, RunMetadata::new());
    let stale = writer.wait_for_writers(Duration::from_millis(10)).await.unwrap();
    writer.begin_run("run-4", &files, RunMetadata::new());

    assert!(matches!(
        writer.commit_links(stale).await,
        Err(FlyscanError::LinkBackend(_))
    ));
    assert!(!files.master_file_path.exists());
}
