//! Simulated IOCs
//!
//! Each `install_*` function seeds the records of one device in a
//! [`SimChannelLayer`] and registers put hooks that behave like the IOC
//! would. All timing uses `tokio::time`, so these must be installed from
//! inside a Tokio runtime.
//!
//! # Available Simulations
//!
//! - [`install_trigger`] - pulse train at `Divisor / clock`, honouring
//!   `PulseCount`, `Enable`, `DetGate` and `Reset`
//! - [`install_detector`] - cam + HDF plugin; counts one frame per detector
//!   trigger while capturing in external mode, writes its file on close
//! - [`install_position_stream`] - `Idle`/`Acquiring` status with delays,
//!   writes its file on stop; can be made to hang
//! - [`install_motor`] - motor record with `DMOV` and `STOP`
//!
//! [`SimulatedBeamline`] wires a complete flyscan setup together.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::{ChannelAccess, SimChannelLayer};
use crate::config::FlyscanConfig;
use crate::error::FlyscanResult;
use crate::experiment::directory::ExperimentDirectory;
use crate::experiment::flyscan::{FlyscanOrchestrator, FlyscanOrchestratorBuilder};
use crate::hardware::capabilities::{AreaDetector, Motor, Readable, TriggerMode};
use crate::hardware::detector::{expand_file_template, DetectorKind, FileWriterDetector, DEFAULT_FILE_TEMPLATE};
use crate::hardware::motor::ChannelMotor;
use crate::hardware::position_stream::{PositionStreamRecorder, STATUS_ACQUIRING, STATUS_IDLE};
use crate::hardware::scaler::ChannelReadout;
use crate::hardware::slot::connect_slot;
use crate::hardware::trigger::TriggerGenerator;

// =============================================================================
// Trigger generator
// =============================================================================

/// Simulate a pulse subsystem at `prefix` fed by a `clock_hz` reference.
///
/// `{prefix}DetTrigger` counts pulses that passed the detector gate; detector
/// simulations follow it.
pub fn install_trigger(sim: &SimChannelLayer, prefix: &str, clock_hz: f64) {
    let pv = |s: &str| format!("{prefix}{s}");
    for field in [
        "Divisor",
        "Width",
        "Delay",
        "PulseCount",
        "Reset",
        "Enable",
        "DetGate",
        "PulsesOut_RBV",
        "DetTriggers_RBV",
        "DetTrigger",
    ] {
        sim.set(&pv(field), 0_i64);
    }

    let pulses = pv("PulsesOut_RBV");
    let det_triggers = pv("DetTriggers_RBV");
    sim.on_put(&pv("Reset"), move |sim, value| {
        if value.is_on() {
            sim.set(&pulses, 0_i64);
            sim.set(&det_triggers, 0_i64);
        }
    });

    let task: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::new(Mutex::new(None));
    let prefix = prefix.to_string();
    sim.on_put(&pv("Enable"), move |sim, value| {
        let mut running = task.lock();
        if value.is_on() {
            if running.as_ref().map_or(true, |t| t.is_finished()) {
                *running = Some(tokio::spawn(pulse_train(sim.clone(), prefix.clone(), clock_hz)));
            }
        } else if let Some(t) = running.take() {
            t.abort();
        }
    });
}

async fn pulse_train(sim: SimChannelLayer, prefix: String, clock_hz: f64) {
    let pv = |s: &str| format!("{prefix}{s}");
    let mut emitted: u64 = 0;
    loop {
        let divisor = sim.value_f64(&pv("Divisor"));
        if divisor <= 0.0 {
            warn!(prefix = %prefix, "Pulse train enabled with zero divisor");
            return;
        }
        tokio::time::sleep(Duration::from_secs_f64(divisor / clock_hz)).await;

        if !sim.value(&pv("Enable")).map_or(false, |v| v.is_on()) {
            return;
        }
        let burst = sim.value_i64(&pv("PulseCount"));
        if burst > 0 && emitted >= burst as u64 {
            debug!(prefix = %prefix, emitted, "Burst complete");
            return;
        }
        emitted += 1;

        sim.set(&pv("PulsesOut_RBV"), sim.value_i64(&pv("PulsesOut_RBV")) + 1);
        if sim.value(&pv("DetGate")).map_or(false, |v| v.is_on()) {
            sim.set(&pv("DetTriggers_RBV"), sim.value_i64(&pv("DetTriggers_RBV")) + 1);
            sim.set(&pv("DetTrigger"), sim.value_i64(&pv("DetTrigger")) + 1);
        }
    }
}

// =============================================================================
// Area detector
// =============================================================================

/// Behaviour of a simulated detector
#[derive(Debug, Clone)]
pub struct DetectorSimOptions {
    /// Time between `Capture = 0` and the file being closed
    pub close_delay: Duration,
    /// Create the directory written to `FilePath`
    pub create_dirs: bool,
}

impl Default for DetectorSimOptions {
    fn default() -> Self {
        Self {
            close_delay: Duration::from_millis(10),
            create_dirs: true,
        }
    }
}

/// Simulate cam + HDF plugin records at `prefix`, triggered by `trigger_pv`
pub fn install_detector(
    sim: &SimChannelLayer,
    prefix: &str,
    kind: DetectorKind,
    trigger_pv: &str,
    options: DetectorSimOptions,
) {
    let cam = format!("{prefix}cam1:");
    let hdf = format!("{prefix}HDF1:");

    sim.set(&format!("{cam}TriggerMode"), kind.trigger_value(TriggerMode::Internal));
    for field in ["Acquire", "NumImages", "ArrayCounter", "ArrayCounter_RBV"] {
        sim.set(&format!("{cam}{field}"), 0_i64);
    }
    sim.set(&format!("{cam}AcquireTime"), 0.1);
    for field in ["FilePath", "FileName", "FullFileName_RBV"] {
        sim.set(&format!("{hdf}{field}"), "");
    }
    sim.set(&format!("{hdf}FileTemplate"), DEFAULT_FILE_TEMPLATE);
    for field in [
        "FileNumber",
        "AutoIncrement",
        "FileWriteMode",
        "NumCapture",
        "Capture",
        "Capture_RBV",
        "NumCaptured_RBV",
        "FilePathExists_RBV",
    ] {
        sim.set(&format!("{hdf}{field}"), 0_i64);
    }
    if sim.value(trigger_pv).is_none() {
        sim.set(trigger_pv, 0_i64);
    }

    let rbv = format!("{cam}ArrayCounter_RBV");
    sim.on_put(&format!("{cam}ArrayCounter"), move |sim, value| {
        sim.set(&rbv, value.clone());
    });

    let exists = format!("{hdf}FilePathExists_RBV");
    let create_dirs = options.create_dirs;
    sim.on_put(&format!("{hdf}FilePath"), move |sim, value| {
        let dir = PathBuf::from(value.to_string());
        let ok = if create_dirs {
            std::fs::create_dir_all(&dir).is_ok()
        } else {
            dir.is_dir()
        };
        sim.set(&exists, i64::from(ok));
    });

    let closing = Arc::new(AtomicBool::new(false));
    let hdf_prefix = hdf.clone();
    let close_delay = options.close_delay;
    sim.on_put(&format!("{hdf}Capture"), move |sim, value| {
        let pv = |s: &str| format!("{hdf_prefix}{s}");
        let capturing = sim.value_i64(&pv("Capture_RBV")) == 1;
        if value.is_on() && !capturing {
            let full = expand_file_template(
                &sim.value_string(&pv("FileTemplate")),
                &sim.value_string(&pv("FilePath")),
                &sim.value_string(&pv("FileName")),
                sim.value_i64(&pv("FileNumber")).max(0) as u64,
            );
            sim.set(&pv("FullFileName_RBV"), full);
            sim.set(&pv("NumCaptured_RBV"), 0_i64);
            sim.set(&pv("Capture_RBV"), 1_i64);
        } else if !value.is_on() && capturing && !closing.swap(true, Ordering::SeqCst) {
            let sim = sim.clone();
            let prefix = hdf_prefix.clone();
            let closing = closing.clone();
            tokio::spawn(async move {
                tokio::time::sleep(close_delay).await;
                let file = PathBuf::from(sim.value_string(&format!("{prefix}FullFileName_RBV")));
                let frames = sim.value_i64(&format!("{prefix}NumCaptured_RBV"));
                if let Err(e) = write_sim_file(&file, &format!("{{\"frames\": {frames}}}")) {
                    warn!(file = %file.display(), error = %e, "Simulated detector failed to write");
                }
                sim.set(&format!("{prefix}Capture_RBV"), 0_i64);
                closing.store(false, Ordering::SeqCst);
            });
        }
    });

    let external = kind.trigger_value(TriggerMode::ExternalGated);
    if let Ok(mut rx) = sim.monitor(trigger_pv) {
        let sim = sim.clone();
        tokio::spawn(async move {
            let mut last = rx.borrow_and_update().as_i64().unwrap_or(0);
            while rx.changed().await.is_ok() {
                let now = rx.borrow_and_update().as_i64().unwrap_or(0);
                let delta = (now - last).max(0);
                last = now;

                let armed = sim.value_i64(&format!("{hdf}Capture_RBV")) == 1
                    && sim.value_i64(&format!("{cam}Acquire")) == 1
                    && sim.value_i64(&format!("{cam}TriggerMode")) == external;
                if !armed {
                    continue;
                }
                for _ in 0..delta {
                    let counter = format!("{cam}ArrayCounter_RBV");
                    sim.set(&counter, sim.value_i64(&counter) + 1);
                    let captured = format!("{hdf}NumCaptured_RBV");
                    sim.set(&captured, sim.value_i64(&captured) + 1);
                }
            }
        });
    }
}

fn write_sim_file(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)
}

// =============================================================================
// Position stream
// =============================================================================

/// Behaviour of a simulated position stream
#[derive(Debug, Clone)]
pub struct StreamSimOptions {
    /// Delay before the status reads `Acquiring`
    pub start_delay: Duration,
    /// Delay before the status reads `Idle` and the file is written
    pub stop_delay: Duration,
    /// Never change status (hung process)
    pub stuck: bool,
}

impl Default for StreamSimOptions {
    fn default() -> Self {
        Self {
            start_delay: Duration::from_millis(20),
            stop_delay: Duration::from_millis(20),
            stuck: false,
        }
    }
}

/// Simulate a position streaming process at `prefix`
pub fn install_position_stream(sim: &SimChannelLayer, prefix: &str, options: StreamSimOptions) {
    let pv = |s: &str| format!("{prefix}{s}");
    sim.set(&pv("Acquire"), 0_i64);
    sim.set(&pv("Status"), STATUS_IDLE);
    sim.set(&pv("FileName"), "");

    let prefix = prefix.to_string();
    sim.on_put(&pv("Acquire"), move |sim, value| {
        if options.stuck {
            return;
        }
        let sim = sim.clone();
        let prefix = prefix.clone();
        let start = value.is_on();
        let delay = if start {
            options.start_delay
        } else {
            options.stop_delay
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if start {
                sim.set(&format!("{prefix}Status"), STATUS_ACQUIRING);
                return;
            }
            let file = sim.value_string(&format!("{prefix}FileName"));
            if !file.is_empty() {
                if let Err(e) = write_sim_file(Path::new(&file), "positions") {
                    warn!(file = %file, error = %e, "Simulated stream failed to write");
                }
            }
            sim.set(&format!("{prefix}Status"), STATUS_IDLE);
        });
    });
}

// =============================================================================
// Motor
// =============================================================================

/// Behaviour of a simulated motor record
#[derive(Debug, Clone)]
pub struct MotorSimOptions {
    /// Starting position
    pub position: f64,
    /// Starting velocity (units/s)
    pub velocity: f64,
    /// Upper bound on a single move's duration
    pub max_move_time: Duration,
}

impl Default for MotorSimOptions {
    fn default() -> Self {
        Self {
            position: 0.0,
            velocity: 1.0,
            max_move_time: Duration::from_millis(5),
        }
    }
}

/// Simulate a motor record `record`
pub fn install_motor(sim: &SimChannelLayer, record: &str, options: MotorSimOptions) {
    let field = |f: &str| format!("{record}.{f}");
    sim.set(&field("VAL"), options.position);
    sim.set(&field("RBV"), options.position);
    sim.set(&field("DMOV"), 1_i64);
    sim.set(&field("VELO"), options.velocity);
    sim.set(&field("STOP"), 0_i64);

    let generation = Arc::new(AtomicU64::new(0));

    let record_name = record.to_string();
    let moves = generation.clone();
    sim.on_put(&field("VAL"), move |sim, value| {
        let Some(target) = value.as_f64() else {
            return;
        };
        let id = moves.fetch_add(1, Ordering::SeqCst) + 1;
        let rbv = format!("{record_name}.RBV");
        let dmov = format!("{record_name}.DMOV");
        let velocity = sim.value_f64(&format!("{record_name}.VELO")).abs();
        let distance = (target - sim.value_f64(&rbv)).abs();
        let travel = if velocity > 0.0 {
            Duration::from_secs_f64(distance / velocity).min(options.max_move_time)
        } else {
            options.max_move_time
        };

        sim.set(&dmov, 0_i64);
        let sim = sim.clone();
        let moves = moves.clone();
        tokio::spawn(async move {
            tokio::time::sleep(travel).await;
            if moves.load(Ordering::SeqCst) == id {
                sim.set(&rbv, target);
                sim.set(&dmov, 1_i64);
            }
        });
    });

    let record_name = record.to_string();
    sim.on_put(&field("STOP"), move |sim, value| {
        if value.is_on() {
            generation.fetch_add(1, Ordering::SeqCst);
            let rbv = sim.value_f64(&format!("{record_name}.RBV"));
            sim.set(&format!("{record_name}.VAL"), rbv);
            sim.set(&format!("{record_name}.DMOV"), 1_i64);
            sim.set(&format!("{record_name}.STOP"), 0_i64);
        }
    });
}

// =============================================================================
// SimulatedBeamline
// =============================================================================

/// Prefix of the simulated trigger generator
pub const SIM_TRIGGER_PREFIX: &str = "sim:sg:";
/// Prefix of the simulated position stream
pub const SIM_STREAM_PREFIX: &str = "sim:pos:";

/// A complete simulated flyscan setup on one [`SimChannelLayer`]
pub struct SimulatedBeamline {
    /// Shared channel layer
    pub sim: SimChannelLayer,
    /// Trigger generator
    pub trigger: Arc<TriggerGenerator>,
    /// Area detectors
    pub detectors: Vec<Arc<FileWriterDetector>>,
    /// Position stream recorder
    pub recorder: Arc<PositionStreamRecorder>,
    /// Motors, by name
    pub motors: Vec<Arc<ChannelMotor>>,
    /// Per-step readouts
    pub readouts: Vec<Arc<ChannelReadout>>,
}

impl SimulatedBeamline {
    /// Simulate `detectors` and `motors` (names) with one scaler readout
    pub fn new(config: &FlyscanConfig, detectors: &[(&str, DetectorKind)], motors: &[&str]) -> Self {
        Self::with_options(
            config,
            detectors,
            motors,
            DetectorSimOptions::default(),
            StreamSimOptions::default(),
        )
    }

    /// Like [`SimulatedBeamline::new`] with explicit simulation options
    pub fn with_options(
        config: &FlyscanConfig,
        detectors: &[(&str, DetectorKind)],
        motors: &[&str],
        detector_options: DetectorSimOptions,
        stream_options: StreamSimOptions,
    ) -> Self {
        let sim = SimChannelLayer::new();
        let layer: Arc<dyn ChannelAccess> = Arc::new(sim.clone());
        let trigger_pv = format!("{SIM_TRIGGER_PREFIX}DetTrigger");

        install_trigger(&sim, SIM_TRIGGER_PREFIX, config.trigger.reference_clock_hz);
        let trigger = Arc::new(TriggerGenerator::new(
            "softglue",
            SIM_TRIGGER_PREFIX,
            layer.clone(),
            &config.trigger,
        ));

        let detectors = detectors
            .iter()
            .map(|(name, kind)| {
                let prefix = format!("sim:{name}:");
                install_detector(&sim, &prefix, *kind, &trigger_pv, detector_options.clone());
                Arc::new(FileWriterDetector::new(*name, &prefix, *kind, layer.clone()))
            })
            .collect();

        install_position_stream(&sim, SIM_STREAM_PREFIX, stream_options);
        let recorder = Arc::new(PositionStreamRecorder::new(
            "positions",
            SIM_STREAM_PREFIX,
            layer.clone(),
        ));

        let motors = motors
            .iter()
            .map(|name| {
                let record = format!("sim:m:{name}");
                install_motor(&sim, &record, MotorSimOptions::default());
                Arc::new(ChannelMotor::new(*name, record, layer.clone(), config.timeouts.motion()))
            })
            .collect();

        sim.set("sim:scaler1.S2", 1000_i64);
        let readouts = vec![Arc::new(ChannelReadout::new("ic1", "sim:scaler1.S2", layer))];

        Self {
            sim,
            trigger,
            detectors,
            recorder,
            motors,
            readouts,
        }
    }

    /// Connect every device and build an orchestrator over them
    pub async fn orchestrator(
        &self,
        config: FlyscanConfig,
        directory: Arc<dyn ExperimentDirectory>,
    ) -> FlyscanResult<FlyscanOrchestrator> {
        self.orchestrator_builder(config, directory).await.build()
    }

    /// Connect every device into a builder, for callers that customise the
    /// master writer or document bus
    pub async fn orchestrator_builder(
        &self,
        config: FlyscanConfig,
        directory: Arc<dyn ExperimentDirectory>,
    ) -> FlyscanOrchestratorBuilder {
        let timeout = config.timeouts.connect();
        let mut builder = FlyscanOrchestrator::builder(config)
            .trigger(connect_slot(self.trigger.clone(), &self.sim, timeout).await)
            .recorder(connect_slot(self.recorder.clone(), &self.sim, timeout).await)
            .directory(directory);

        for detector in &self.detectors {
            let slot = connect_slot(detector.clone(), &self.sim, timeout).await;
            builder = builder.detector(slot.map(|d| d as Arc<dyn AreaDetector>));
        }
        for motor in &self.motors {
            let slot = connect_slot(motor.clone(), &self.sim, timeout).await;
            builder = builder.motor(slot.map(|m| m as Arc<dyn Motor>));
        }
        for readout in &self.readouts {
            let slot = connect_slot(readout.clone(), &self.sim, timeout).await;
            builder = builder.reader(slot.map(|r| r as Arc<dyn Readable>));
        }
        builder
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_stops_after_pulse_count() {
        let sim = SimChannelLayer::new();
        install_trigger(&sim, "t:", 1e6);
        // 1 ms period, 5 pulses
        sim.put("t:Divisor", 1000_i64.into()).await.unwrap();
        sim.put("t:PulseCount", 5_i64.into()).await.unwrap();
        sim.put("t:DetGate", 1_i64.into()).await.unwrap();
        sim.put("t:Enable", 1_i64.into()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sim.value_i64("t:PulsesOut_RBV"), 5);
        assert_eq!(sim.value_i64("t:DetTrigger"), 5);
    }

    #[tokio::test]
    async fn detector_counts_frames_only_when_armed() {
        let sim = SimChannelLayer::new();
        install_trigger(&sim, "t:", 1e6);
        install_detector(&sim, "d:", DetectorKind::Generic, "t:DetTrigger", DetectorSimOptions::default());

        // not capturing: triggers are ignored
        sim.set("t:DetTrigger", 3_i64);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sim.value_i64("d:HDF1:NumCaptured_RBV"), 0);

        sim.put("d:cam1:TriggerMode", 1_i64.into()).await.unwrap();
        sim.put("d:cam1:Acquire", 1_i64.into()).await.unwrap();
        sim.put("d:HDF1:Capture", 1_i64.into()).await.unwrap();
        sim.set("t:DetTrigger", 5_i64);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sim.value_i64("d:HDF1:NumCaptured_RBV"), 2);
    }

    #[tokio::test]
    async fn stop_cancels_motor_move() {
        let sim = SimChannelLayer::new();
        install_motor(
            &sim,
            "m:y",
            MotorSimOptions {
                velocity: 0.001,
                max_move_time: Duration::from_secs(10),
                ..MotorSimOptions::default()
            },
        );
        sim.put("m:y.VAL", 5.0.into()).await.unwrap();
        assert_eq!(sim.value_i64("m:y.DMOV"), 0);
        sim.put("m:y.STOP", 1_i64.into()).await.unwrap();
        assert_eq!(sim.value_i64("m:y.DMOV"), 1);
        assert_eq!(sim.value_f64("m:y.RBV"), 0.0);
    }
}
