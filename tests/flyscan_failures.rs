//! Failure, cancellation and exclusion behaviour of the orchestrator.

mod common;

use beamline_flyscan::experiment::document::Document;
use beamline_flyscan::experiment::{AcquisitionPath, FlyscanRequest, FlyscanState};
use beamline_flyscan::config::FlyscanConfig;
use beamline_flyscan::hardware::mock::{DetectorSimOptions, SimulatedBeamline, StreamSimOptions};
use beamline_flyscan::hardware::{AreaDetector, Device};
use beamline_flyscan::FlyscanError;
use common::{
    beamline, beamline_with, drain, eventually, orchestrator_for, read_master, test_config,
    DETECTORS, EXPERIMENT,
};
use std::sync::Arc;
use std::time::Duration;

fn long_request(scan_id: u64) -> FlyscanRequest {
    FlyscanRequest::new(AcquisitionPath::line("x", 0.0, 2.0, 500), 0.02, 0.01)
        .experiment(EXPERIMENT)
        .scan_id(scan_id)
        .drain_points_per_packet(1.0)
}

#[tokio::test]
async fn test_abort_mid_acquisition_makes_hardware_safe() {
    let base = tempfile::tempdir().unwrap();
    let config = test_config();
    let (beamline, orchestrator) = beamline(base.path(), &config).await;
    let orchestrator = Arc::new(orchestrator);
    let mut docs = orchestrator.documents();
    let mut state = orchestrator.subscribe_state();

    let running = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run(long_request(1)).await })
    };
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == FlyscanState::Acquiring),
    )
    .await
    .expect("reached Acquiring")
    .unwrap();
    orchestrator.abort("operator");

    let result = running.await.unwrap();
    assert!(matches!(result, Err(FlyscanError::Aborted(reason)) if reason == "operator"));
    assert_eq!(orchestrator.state(), FlyscanState::Failed);

    assert_eq!(beamline.trigger.gate_states().await.unwrap(), (false, false));
    for detector in &beamline.detectors {
        assert!(!detector.is_staged(), "{} left staged", detector.name());
    }
    assert!(!beamline.recorder.is_staged());

    let docs = drain(&mut docs);
    match docs.last() {
        Some(Document::Stop(stop)) => {
            assert_eq!(stop.exit_status, "abort");
            assert!(stop.num_events < 500);
        }
        other => panic!("expected a stop document, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cancelled_run_future_tears_down_in_background() {
    let base = tempfile::tempdir().unwrap();
    let config = test_config();
    let (beamline, orchestrator) = beamline(base.path(), &config).await;
    let orchestrator = Arc::new(orchestrator);
    let mut state = orchestrator.subscribe_state();

    let running = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run(long_request(1)).await })
    };
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == FlyscanState::Acquiring),
    )
    .await
    .expect("reached Acquiring")
    .unwrap();
    running.abort();
    assert!(running.await.unwrap_err().is_cancelled());

    let trigger = beamline.trigger.clone();
    let detectors = beamline.detectors.clone();
    let safe = eventually(Duration::from_secs(3), || {
        let trigger = trigger.clone();
        let detectors = detectors.clone();
        async move {
            trigger.gate_states().await.ok() == Some((false, false))
                && detectors.iter().all(|d| !d.is_staged())
        }
    })
    .await;
    assert!(safe, "background teardown did not finish");

    // The lease is released once teardown is done
    let released = eventually(Duration::from_secs(3), || {
        let trigger = trigger.clone();
        async move { trigger.try_lease().is_ok() }
    })
    .await;
    assert!(released);
}

#[tokio::test]
async fn test_second_flyscan_on_same_hardware_is_busy() {
    let base = tempfile::tempdir().unwrap();
    let config = test_config();
    let (beamline, first) = beamline(base.path(), &config).await;
    let first = Arc::new(first);
    let second = orchestrator_for(&beamline, base.path(), &config).await;
    let mut state = first.subscribe_state();

    let running = {
        let first = first.clone();
        tokio::spawn(async move { first.run(long_request(1)).await })
    };
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == FlyscanState::Acquiring),
    )
    .await
    .expect("reached Acquiring")
    .unwrap();

    let err = second.run(long_request(2)).await.unwrap_err();
    assert!(matches!(err, FlyscanError::HardwareBusy));
    assert!(err.is_precondition());
    assert_eq!(second.state(), FlyscanState::Idle);
    assert_eq!(first.state(), FlyscanState::Acquiring);

    first.abort("test over");
    assert!(running.await.unwrap().is_err());
}

#[tokio::test]
async fn test_hardware_stays_leased_until_master_file_is_committed() {
    let base = tempfile::tempdir().unwrap();
    let config = test_config();
    let slow_close = DetectorSimOptions {
        close_delay: Duration::from_millis(600),
        ..DetectorSimOptions::default()
    };
    let beamline = SimulatedBeamline::with_options(
        &config,
        &DETECTORS,
        &["x"],
        slow_close,
        StreamSimOptions::default(),
    );
    let first = Arc::new(orchestrator_for(&beamline, base.path(), &config).await);
    let second = orchestrator_for(&beamline, base.path(), &config).await;
    let short = |scan_id| {
        FlyscanRequest::new(AcquisitionPath::line("x", 0.0, 1.0, 5), 0.02, 0.01)
            .experiment(EXPERIMENT)
            .scan_id(scan_id)
            .drain_points_per_packet(1.0)
    };

    let running = {
        let first = first.clone();
        tokio::spawn(async move { first.run(short(1)).await })
    };

    // Teardown is over while the detector files are still closing
    let detectors = beamline.detectors.clone();
    let unstaged = eventually(Duration::from_secs(5), || {
        let detectors = detectors.clone();
        async move { detectors.iter().all(|d| !d.is_staged() && d.frame_records().len() == 5) }
    })
    .await;
    assert!(unstaged, "first run never tore down");
    assert!(!running.is_finished());

    let err = second.run(short(2)).await.unwrap_err();
    assert!(matches!(err, FlyscanError::HardwareBusy), "got {err}");

    let report = running.await.unwrap().unwrap();
    let master = read_master(&report.files.master_file_path);
    assert!(master.links.contains_key("eiger"));
    assert!(master.links.contains_key("vortex"));
    assert!(report.master.missing.is_empty());

    second.run(short(2)).await.unwrap();
}

#[tokio::test]
async fn test_unknown_experiment_fails_before_hardware() {
    let base = tempfile::tempdir().unwrap();
    let config = test_config();
    let (beamline, orchestrator) = beamline(base.path(), &config).await;

    let request = long_request(1).experiment("no-such-experiment");
    let err = orchestrator.run(request).await.unwrap_err();
    assert!(matches!(err, FlyscanError::MissingExperiment(ref e) if e == "no-such-experiment"));
    assert!(err.is_precondition());
    assert!(beamline.sim.puts().is_empty());
}

#[tokio::test]
async fn test_existing_master_file_fails_before_hardware() {
    let base = tempfile::tempdir().unwrap();
    let config = test_config();
    let (beamline, orchestrator) = beamline(base.path(), &config).await;

    let sample_dir = base.path().join("sample");
    std::fs::create_dir_all(&sample_dir).unwrap();
    std::fs::write(sample_dir.join("flyscan_1_master.hdf"), b"old run").unwrap();

    let err = orchestrator.run(long_request(1)).await.unwrap_err();
    assert!(matches!(err, FlyscanError::FileExists(_)));
    assert!(beamline.sim.puts().is_empty());
    assert_eq!(
        std::fs::read(sample_dir.join("flyscan_1_master.hdf")).unwrap(),
        b"old run"
    );
}

#[tokio::test]
async fn test_unreachable_detector_is_a_placeholder() {
    let base = tempfile::tempdir().unwrap();
    let config = test_config();
    let beamline = beamline_with_disconnected_detector(&config);
    let orchestrator = orchestrator_for(&beamline, base.path(), &config).await;

    let err = orchestrator.run(long_request(1)).await.unwrap_err();
    assert!(matches!(err, FlyscanError::DeviceUnavailable { ref name, .. } if name == "vortex"));
    assert!(beamline.sim.puts().is_empty());
}

fn beamline_with_disconnected_detector(config: &FlyscanConfig) -> SimulatedBeamline {
    let beamline = SimulatedBeamline::new(config, &DETECTORS, &["x"]);
    beamline.sim.disconnect("sim:vortex:HDF1:Capture_RBV");
    beamline
}

#[tokio::test]
async fn test_stuck_position_stream_times_out_and_unstages() {
    let base = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.timeouts.stream_status_s = 0.2;
    config.storage.writer_timeout_s = 0.3;
    let stream = StreamSimOptions {
        stuck: true,
        ..StreamSimOptions::default()
    };
    let (beamline, orchestrator) = beamline_with(base.path(), &config, stream).await;

    let request = long_request(1);
    let err = orchestrator.run(request).await.unwrap_err();
    assert!(matches!(err, FlyscanError::Timeout { .. }), "got {err}");
    assert_eq!(orchestrator.state(), FlyscanState::Failed);

    assert_eq!(beamline.trigger.gate_states().await.unwrap(), (false, false));
    for detector in &beamline.detectors {
        assert!(!detector.is_staged());
    }
    assert!(!beamline.recorder.is_staged());

    // Best-effort master file: detectors linked, stream file reported missing
    let master_path = base.path().join("sample").join("flyscan_1_master.hdf");
    let master = read_master(&master_path);
    assert!(master.links.contains_key("eiger"));
    assert!(!master.links.contains_key("positions"));
    assert!(master.attributes["missing_files"].contains("flyscan_1_positions.h5"));
}
