//! Flyscan orchestration.
//!
//! [`FlyscanOrchestrator::run`] drives one flyscan through the
//! [`FlyscanState`] machine:
//!
//! 1. **PathValidated**: collection time fits the trigger period, the path
//!    only names known motors, the trigger plan is representable.
//! 2. **FilesReserved**: the experiment's data root is resolved and every
//!    file of the run is checked for collisions.
//! 3. **Armed**: trigger reset, programmed and read back; motors at the
//!    first point; detectors, position recorder and motors staged.
//! 4. **Acquiring**: position stream running, trigger gates open, path
//!    stepped with one frame barrier per point.
//! 5. **Draining**: detector gate closed, in-flight pulses drained, trigger
//!    subsystem disabled.
//! 6. **Complete**: stream stopped, devices unstaged, master file written
//!    once every writer has closed its file.
//!
//! Any error moves the run to **Failed**. Teardown (trigger off, stream
//! stopped, devices unstaged) is owned by a scoped guard, so it runs on
//! errors, on [`FlyscanOrchestrator::abort`] and when the run future is
//! dropped.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::FlyscanConfig;
use crate::data::master_file::{MasterFileReport, MasterFileWriter, POSITION_LINK};
use crate::error::{FlyscanError, FlyscanResult};
use crate::experiment::directory::ExperimentDirectory;
use crate::experiment::document::{
    new_uid, DataKey, DatumDoc, DescriptorDoc, Document, DocumentBus, EventDoc, ResourceDoc,
    StartDoc, StopDoc,
};
use crate::experiment::metadata::{RunFileSet, RunMetadata};
use crate::experiment::path::AcquisitionPath;
use crate::experiment::state::FlyscanState;
use crate::hardware::capabilities::{
    AreaDetector, Device, FrameRecord, Motor, Movable, Readable, Stageable,
};
use crate::hardware::position_stream::PositionStreamRecorder;
use crate::hardware::slot::DeviceSlot;
use crate::hardware::trigger::{TriggerGenerator, TriggerLease, TriggerPlan, TriggerRegisters};

/// Plan name recorded in the start document
pub const PLAN_NAME: &str = "flyscan";

/// Resource spec of detector files
const DETECTOR_RESOURCE_SPEC: &str = "AD_HDF5";

/// How long teardown waits for datum forwarders to drain
const DATUM_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

// =============================================================================
// Request and report
// =============================================================================

/// Per-invocation acquisition modes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionModes {
    /// Alternate photon helicity between points
    pub dichro: bool,
    /// Hold momentum transfer fixed while the energy is scanned
    pub fix_q: bool,
}

/// Everything one flyscan needs besides the hardware
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlyscanRequest {
    /// Points stepped, one frame per detector each
    pub path: AcquisitionPath,
    /// Trigger period, in seconds
    pub period: f64,
    /// Detector exposure per frame, in seconds; must not exceed `period`
    pub collection_time: f64,
    /// Gate width; defaults to `collection_time`
    pub pulse_width: Option<f64>,
    /// Gate delay after each trigger, in seconds
    pub pulse_delay: f64,
    /// Experiment resolved to a data root
    pub experiment: String,
    /// Sample folder under the data root
    pub sample: String,
    /// File name prefix
    pub name_base: String,
    /// Scan number, part of every file name
    pub scan_id: u64,
    /// Recorded in the start document
    pub modes: AcquisitionModes,
    /// Applied on top of the generated run metadata
    pub metadata: RunMetadata,
    /// Overrides the configured drain packet size
    pub drain_points_per_packet: Option<f64>,
}

impl FlyscanRequest {
    /// Request with defaults for everything but timing and path
    pub fn new(path: AcquisitionPath, period: f64, collection_time: f64) -> Self {
        Self {
            path,
            period,
            collection_time,
            pulse_width: None,
            pulse_delay: 0.0,
            experiment: "default".to_string(),
            sample: "sample".to_string(),
            name_base: "flyscan".to_string(),
            scan_id: 1,
            modes: AcquisitionModes::default(),
            metadata: RunMetadata::new(),
            drain_points_per_packet: None,
        }
    }

    /// Set the experiment
    pub fn experiment(mut self, experiment: impl Into<String>) -> Self {
        self.experiment = experiment.into();
        self
    }

    /// Set the sample folder
    pub fn sample(mut self, sample: impl Into<String>) -> Self {
        self.sample = sample.into();
        self
    }

    /// Set the file name prefix
    pub fn name_base(mut self, name_base: impl Into<String>) -> Self {
        self.name_base = name_base.into();
        self
    }

    /// Set the scan number
    pub fn scan_id(mut self, scan_id: u64) -> Self {
        self.scan_id = scan_id;
        self
    }

    /// Set dichro / fix-q modes
    pub fn modes(mut self, modes: AcquisitionModes) -> Self {
        self.modes = modes;
        self
    }

    /// Set metadata overrides
    pub fn metadata(mut self, metadata: RunMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set an explicit gate width
    pub fn pulse_width(mut self, pulse_width: f64) -> Self {
        self.pulse_width = Some(pulse_width);
        self
    }

    /// Set the gate delay
    pub fn pulse_delay(mut self, pulse_delay: f64) -> Self {
        self.pulse_delay = pulse_delay;
        self
    }

    /// Override the drain packet size; must be positive and finite
    pub fn drain_points_per_packet(mut self, points: f64) -> Self {
        self.drain_points_per_packet = Some(points);
        self
    }
}

/// Outcome of a completed flyscan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlyscanReport {
    /// Start document uid
    pub run_uid: String,
    /// Files reserved for the run
    pub files: RunFileSet,
    /// Registers programmed into the trigger generator
    pub registers: TriggerRegisters,
    /// Path points stepped (events emitted)
    pub points: u64,
    /// Frames numbered per detector
    pub frames: BTreeMap<String, u64>,
    /// Time slept for pending pulses
    pub drain_time: Duration,
    /// What the master file links
    pub master: MasterFileReport,
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`FlyscanOrchestrator`] from device slots
pub struct FlyscanOrchestratorBuilder {
    config: FlyscanConfig,
    trigger: Option<DeviceSlot<TriggerGenerator>>,
    recorder: Option<DeviceSlot<PositionStreamRecorder>>,
    directory: Option<Arc<dyn ExperimentDirectory>>,
    detectors: Vec<DeviceSlot<dyn AreaDetector>>,
    motors: Vec<DeviceSlot<dyn Motor>>,
    readers: Vec<DeviceSlot<dyn Readable>>,
    master: Option<Arc<MasterFileWriter>>,
    bus: Option<DocumentBus>,
}

impl FlyscanOrchestratorBuilder {
    /// Set the trigger generator (required)
    pub fn trigger(mut self, slot: DeviceSlot<TriggerGenerator>) -> Self {
        self.trigger = Some(slot);
        self
    }

    /// Set the position stream recorder (required)
    pub fn recorder(mut self, slot: DeviceSlot<PositionStreamRecorder>) -> Self {
        self.recorder = Some(slot);
        self
    }

    /// Set the experiment directory (required)
    pub fn directory(mut self, directory: Arc<dyn ExperimentDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Add a detector; every detector records every flyscan
    pub fn detector(mut self, slot: DeviceSlot<dyn AreaDetector>) -> Self {
        self.detectors.push(slot);
        self
    }

    /// Add a motor paths may reference by name
    pub fn motor(mut self, slot: DeviceSlot<dyn Motor>) -> Self {
        self.motors.push(slot);
        self
    }

    /// Add a readout sampled once per path point
    pub fn reader(mut self, slot: DeviceSlot<dyn Readable>) -> Self {
        self.readers.push(slot);
        self
    }

    /// Use `writer` instead of the default master file writer
    pub fn master_writer(mut self, writer: Arc<MasterFileWriter>) -> Self {
        self.master = Some(writer);
        self
    }

    /// Publish run documents on `bus`
    pub fn documents(mut self, bus: DocumentBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Check the parts and build. Detector names must be unique.
    pub fn build(self) -> FlyscanResult<FlyscanOrchestrator> {
        let missing = |what: &str| {
            FlyscanError::Configuration(format!("flyscan orchestrator needs a {what}"))
        };
        let trigger = self.trigger.ok_or_else(|| missing("trigger generator"))?;
        let recorder = self.recorder.ok_or_else(|| missing("position stream recorder"))?;
        let directory = self.directory.ok_or_else(|| missing("experiment directory"))?;

        let mut names = std::collections::BTreeSet::new();
        for name in self.detectors.iter().map(|d| d.name()) {
            if !names.insert(name.to_string()) || name == POSITION_LINK {
                return Err(FlyscanError::Configuration(format!(
                    "detector name '{name}' is not unique"
                )));
            }
        }

        let (state, _) = watch::channel(FlyscanState::Idle);
        let (abort, _) = watch::channel(None);
        Ok(FlyscanOrchestrator {
            config: self.config,
            trigger,
            recorder,
            directory,
            detectors: self.detectors,
            motors: self.motors,
            readers: self.readers,
            master: self
                .master
                .unwrap_or_else(|| Arc::new(MasterFileWriter::with_default_backend())),
            bus: self.bus.unwrap_or_default(),
            state,
            abort,
        })
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Runs flyscans against one set of hardware
pub struct FlyscanOrchestrator {
    config: FlyscanConfig,
    trigger: DeviceSlot<TriggerGenerator>,
    recorder: DeviceSlot<PositionStreamRecorder>,
    directory: Arc<dyn ExperimentDirectory>,
    detectors: Vec<DeviceSlot<dyn AreaDetector>>,
    motors: Vec<DeviceSlot<dyn Motor>>,
    readers: Vec<DeviceSlot<dyn Readable>>,
    master: Arc<MasterFileWriter>,
    bus: DocumentBus,
    state: watch::Sender<FlyscanState>,
    abort: watch::Sender<Option<String>>,
}

/// Devices and plan resolved for one run
struct RunSetup {
    trigger: Arc<TriggerGenerator>,
    recorder: Arc<PositionStreamRecorder>,
    detectors: Vec<Arc<dyn AreaDetector>>,
    motors: BTreeMap<String, Arc<dyn Motor>>,
    readers: Vec<Arc<dyn Readable>>,
    plan: TriggerPlan,
}

/// Identity of the run once its start document is out
struct RunIds {
    run_uid: String,
    descriptor_uid: String,
}

impl FlyscanOrchestrator {
    /// Start assembling an orchestrator
    pub fn builder(config: FlyscanConfig) -> FlyscanOrchestratorBuilder {
        FlyscanOrchestratorBuilder {
            config,
            trigger: None,
            recorder: None,
            directory: None,
            detectors: Vec::new(),
            motors: Vec::new(),
            readers: Vec::new(),
            master: None,
            bus: None,
        }
    }

    /// Current state of the flyscan state machine
    pub fn state(&self) -> FlyscanState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<FlyscanState> {
        self.state.subscribe()
    }

    /// Receive run documents emitted from now on
    pub fn documents(&self) -> broadcast::Receiver<Document> {
        self.bus.subscribe()
    }

    /// Writer that produces this orchestrator's master files
    pub fn master_writer(&self) -> Arc<MasterFileWriter> {
        self.master.clone()
    }

    /// Effective configuration
    pub fn config(&self) -> &FlyscanConfig {
        &self.config
    }

    /// Interrupt the running flyscan. It fails with `Aborted` after its
    /// hardware has been made safe. A request made while no run is in
    /// progress is discarded when the next run starts.
    pub fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(reason = %reason, state = %self.state(), "Flyscan abort requested");
        self.abort.send_replace(Some(reason));
    }

    fn set_state(&self, state: FlyscanState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(from = %previous, to = %state, "Flyscan state");
        }
    }

    /// Run one flyscan to completion
    pub async fn run(&self, request: FlyscanRequest) -> FlyscanResult<FlyscanReport> {
        let span = info_span!(
            "flyscan",
            scan_id = request.scan_id,
            sample = %request.sample,
            points = request.path.len()
        );
        async {
            let result = self.execute(&request).await;
            match &result {
                Ok(report) => info!(run_uid = %report.run_uid, "Flyscan complete"),
                // The state belongs to the scan holding the hardware
                Err(FlyscanError::HardwareBusy) => warn!("Flyscan hardware busy"),
                Err(e) => {
                    self.set_state(FlyscanState::Failed);
                    error!(error = %e, "Flyscan failed");
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, request: &FlyscanRequest) -> FlyscanResult<FlyscanReport> {
        let trigger = self.trigger.require()?;
        let lease = trigger.try_lease()?;
        self.abort.send_replace(None);
        self.set_state(FlyscanState::Idle);

        let setup = self.validate(request, trigger)?;
        self.set_state(FlyscanState::PathValidated);

        let base_path = self.directory.base_path(&request.experiment).await?;
        let files = RunFileSet::reserve(
            &base_path,
            &request.sample,
            &request.name_base,
            request.scan_id,
            &self.config.storage,
            &setup.detectors,
        )?;
        self.set_state(FlyscanState::FilesReserved);

        let metadata = self.run_metadata(request, &setup, &files)?;
        let start = StartDoc::new(PLAN_NAME, request.scan_id, metadata.clone());
        let run_uid = start.uid.clone();
        self.bus.emit(Document::Start(start));
        let ids = RunIds {
            descriptor_uid: self.emit_descriptor(&run_uid, &setup),
            run_uid,
        };
        self.master.begin_run(&ids.run_uid, &files, metadata);
        info!(run_uid = %ids.run_uid, master = %files.master_file_path.display(), "Run files reserved");

        let mut scope = ScopedAcquisition::new(&setup, lease, self.config.timeouts.stream_status());
        let mut events = 0_u64;
        let mut abort_rx = self.abort.subscribe();
        let outcome = tokio::select! {
            biased;
            reason = aborted(&mut abort_rx) => Err(FlyscanError::Aborted(reason)),
            result = self.acquire(request, &setup, &files, &ids, &mut scope, &mut events) => result,
        };

        let teardown_errors = scope.teardown().await;
        if !teardown_errors.is_empty() {
            warn!(errors = teardown_errors.len(), "Teardown finished with errors");
        }
        let frames: BTreeMap<String, u64> = setup
            .detectors
            .iter()
            .map(|d| (d.name().to_string(), d.frame_records().len() as u64))
            .collect();

        let master = self.write_master_file(&setup, scope.recorder_used).await;
        // Another run may only begin once this master file is committed
        scope.release_lease();

        match (outcome, master) {
            (Ok(drain_time), Ok(master)) => {
                if let Some(e) = teardown_errors.into_iter().next() {
                    self.emit_stop(&ids.run_uid, Err(&e), events);
                    return Err(e);
                }
                self.emit_stop(&ids.run_uid, Ok(()), events);
                self.set_state(FlyscanState::Complete);
                Ok(FlyscanReport {
                    run_uid: ids.run_uid,
                    files,
                    registers: setup.plan.registers(),
                    points: events,
                    frames,
                    drain_time,
                    master,
                })
            }
            (Ok(_), Err(e)) => {
                self.emit_stop(&ids.run_uid, Err(&e), events);
                Err(e)
            }
            (Err(e), master) => {
                if let Err(master_error) = master {
                    warn!(error = %master_error, "Master file not written for failed run");
                }
                self.emit_stop(&ids.run_uid, Err(&e), events);
                Err(e)
            }
        }
    }

    /// Preconditions checked before anything is touched
    fn validate(
        &self,
        request: &FlyscanRequest,
        trigger: Arc<TriggerGenerator>,
    ) -> FlyscanResult<RunSetup> {
        if request.collection_time > request.period {
            return Err(FlyscanError::InvalidTiming {
                collection_time: request.collection_time,
                period: request.period,
            });
        }
        if let Some(points) = request.drain_points_per_packet {
            if !points.is_finite() || points <= 0.0 {
                return Err(FlyscanError::InvalidTriggerPlan(format!(
                    "drain points per packet must be positive and finite, got {points}"
                )));
            }
        }
        request
            .path
            .validate(self.motors.iter().map(|slot| slot.name()))?;

        let pulse_width = request.pulse_width.unwrap_or(request.collection_time);
        let plan = trigger
            .plan(request.period, pulse_width, request.pulse_delay)?
            .with_pulse_count(request.path.len() as u64);

        let recorder = self.recorder.require()?;
        let detectors = self
            .detectors
            .iter()
            .map(DeviceSlot::require)
            .collect::<FlyscanResult<Vec<_>>>()?;
        if detectors.is_empty() {
            return Err(FlyscanError::Configuration(
                "flyscan needs at least one detector".to_string(),
            ));
        }

        let mut motors = BTreeMap::new();
        for name in request.path.motors() {
            let slot = self
                .motors
                .iter()
                .find(|slot| slot.name() == name)
                .ok_or_else(|| FlyscanError::UnknownMotor(name.clone()))?;
            motors.insert(name, slot.require()?);
        }

        let readers = self
            .readers
            .iter()
            .filter_map(|slot| match slot.require() {
                Ok(reader) => Some(reader),
                Err(e) => {
                    warn!(reader = slot.name(), error = %e, "Skipping unavailable readout");
                    None
                }
            })
            .collect();

        Ok(RunSetup {
            trigger,
            recorder,
            detectors,
            motors,
            readers,
            plan,
        })
    }

    fn run_metadata(
        &self,
        request: &FlyscanRequest,
        setup: &RunSetup,
        files: &RunFileSet,
    ) -> FlyscanResult<RunMetadata> {
        let registers = setup.plan.registers();
        let detector_names: Vec<&str> = setup.detectors.iter().map(|d| d.name()).collect();
        let motor_names: Vec<&String> = setup.motors.keys().collect();
        let reader_names: Vec<&str> = setup.readers.iter().map(|r| r.name()).collect();

        let mut md = RunMetadata::new();
        md.insert("experiment", &request.experiment)?;
        md.insert("sample", &request.sample)?;
        md.insert("name_base", &request.name_base)?;
        md.insert("scan_id", request.scan_id)?;
        md.insert("num_points", request.path.len())?;
        md.insert("detectors", &detector_names)?;
        md.insert("motors", &motor_names)?;
        md.insert(
            "hints",
            serde_json::json!({
                "dimensions": [[motor_names, "primary"]],
                "fields": reader_names,
            }),
        )?;
        md.insert("modes", request.modes)?;
        md.insert(
            "trigger",
            serde_json::json!({
                "period": request.period,
                "collection_time": request.collection_time,
                "pulse_width": setup.plan.pulse_width,
                "pulse_delay": setup.plan.pulse_delay,
                "pulse_count": registers.pulse_count,
                "divisor": registers.divisor,
                "width": registers.width,
                "delay": registers.delay,
                "effective_period": registers.effective_period(),
                "period_residue_s": registers.period_residue_s(),
            }),
        )?;
        md.insert("base_path", display(&files.base_path))?;
        md.insert(
            "files",
            serde_json::json!({
                "master": display(&files.master_file_path),
                "positions": display(&files.position_stream_file_path),
                "detectors": files
                    .detector_file_paths
                    .iter()
                    .map(|(name, f)| (name.clone(), display(&f.full_path)))
                    .collect::<BTreeMap<String, String>>(),
            }),
        )?;
        md.insert("link_templates", files.link_templates())?;
        md.merge(&request.metadata);
        Ok(md)
    }

    fn emit_descriptor(&self, run_uid: &str, setup: &RunSetup) -> String {
        let mut descriptor = DescriptorDoc::new(run_uid, "primary");
        for motor in setup.motors.keys() {
            descriptor = descriptor.with_data_key(motor, DataKey::scalar(motor));
        }
        for reader in &setup.readers {
            descriptor = descriptor.with_data_key(reader.name(), DataKey::scalar(reader.name()));
        }
        for detector in &setup.detectors {
            descriptor =
                descriptor.with_data_key(detector.name(), DataKey::external(detector.name()));
        }
        let uid = descriptor.uid.clone();
        self.bus.emit(Document::Descriptor(descriptor));
        uid
    }

    fn emit_stop(&self, run_uid: &str, outcome: Result<(), &FlyscanError>, events: u64) {
        let stop = match outcome {
            Ok(()) => StopDoc::success(run_uid, events),
            Err(FlyscanError::Aborted(reason)) => StopDoc::abort(run_uid, reason, events),
            Err(e) => StopDoc::fail(run_uid, &e.to_string(), events),
        };
        self.bus.emit(Document::Stop(stop));
    }

    /// Armed through Draining. Returns the drain time slept.
    async fn acquire(
        &self,
        request: &FlyscanRequest,
        setup: &RunSetup,
        files: &RunFileSet,
        ids: &RunIds,
        scope: &mut ScopedAcquisition,
        events: &mut u64,
    ) -> FlyscanResult<Duration> {
        let trigger = &setup.trigger;
        let recorder = &setup.recorder;

        // Armed
        scope.trigger_armed = true;
        trigger.reset().await?;
        let written = trigger.configure_plan(&setup.plan).await;
        trigger.verify(&written).await?;

        let moves = request
            .path
            .start_positions()
            .into_iter()
            .filter_map(|(name, position)| {
                setup.motors.get(&name).map(|m| (m.clone(), position))
            })
            .map(|(motor, position)| async move { motor.move_and_wait(position).await });
        for result in join_all(moves).await {
            result?;
        }
        if let Some(flying) = request.path.flying() {
            if let Some(motor) = setup.motors.get(&flying.motor) {
                scope.velocity_staged.push(motor.clone());
                motor.stage_velocity(Some(flying.velocity));
            }
        }

        let folder = Path::new(&request.sample);
        for detector in &setup.detectors {
            let name = detector.name().to_string();
            scope.staged_detectors.push(detector.clone());
            detector
                .set_acquire_time(request.collection_time)
                .await
                .map_err(|e| FlyscanError::staging(&name, e))?;
            let (full_path, relative_path) = detector
                .setup_images(&files.base_path, folder, &request.name_base, request.scan_id, true)
                .await
                .map_err(|e| FlyscanError::staging(&name, e))?;
            if files
                .detector_file_paths
                .get(&name)
                .map_or(true, |f| f.full_path != full_path)
            {
                warn!(detector = %name, path = %full_path.display(), "Detector path differs from reserved path");
            }

            let resource = ResourceDoc {
                uid: new_uid(),
                run_uid: ids.run_uid.clone(),
                device: name.clone(),
                spec: DETECTOR_RESOURCE_SPEC.to_string(),
                root: display(&files.base_path),
                resource_path: display(&relative_path),
            };
            let (tx, rx) = mpsc::unbounded_channel();
            scope.forwarders.push(spawn_datum_forwarder(
                self.bus.clone(),
                ids.run_uid.clone(),
                resource.uid.clone(),
                rx,
            ));
            self.bus.emit(Document::Resource(resource));
            detector.attach_datum_sink(Some(tx));

            detector
                .stage()
                .await
                .map_err(|e| FlyscanError::staging(&name, e))?;
        }

        recorder.setup_file(&files.position_stream_file_path);
        scope.recorder_staged = true;
        scope.recorder_used = true;
        recorder
            .stage()
            .await
            .map_err(|e| FlyscanError::staging(recorder.name(), e))?;

        for (name, motor) in &setup.motors {
            scope.staged_motors.push(motor.clone());
            motor
                .stage()
                .await
                .map_err(|e| FlyscanError::staging(name, e))?;
        }
        self.set_state(FlyscanState::Armed);

        // Acquiring
        scope.recorder_streaming = true;
        recorder
            .start_stream()
            .await?
            .wait(self.config.timeouts.stream_status())
            .await?;
        self.set_state(FlyscanState::Acquiring);
        trigger.start().await?;

        if let Some(flying) = request.path.flying() {
            if let Some(motor) = setup.motors.get(&flying.motor) {
                scope.flying = Some(motor.clone());
                motor.move_abs(flying.end).await?;
            }
        }

        let frame_timeout =
            Duration::from_secs_f64(written.effective_period()) + self.config.timeouts.frame();
        for (index, point) in request.path.points().iter().enumerate() {
            for (name, position) in &point.positions {
                if let Some(motor) = setup.motors.get(name) {
                    motor.move_abs(*position).await?;
                }
            }
            for name in point.positions.keys() {
                if let Some(motor) = setup.motors.get(name) {
                    motor.wait_settled().await?;
                }
            }

            let frames = index as u64 + 1;
            for detector in &setup.detectors {
                detector.wait_for_frames(frames, frame_timeout).await?;
            }

            let mut event = EventDoc::new(&ids.run_uid, &ids.descriptor_uid, frames);
            for (name, position) in &point.positions {
                event = event.with_position(name, *position);
            }
            for reader in &setup.readers {
                event = event.with_datum(reader.name(), reader.read().await?);
            }
            self.bus.emit(Document::Event(event));
            *events = frames;
        }

        if let Some(motor) = scope.flying.take() {
            if let Err(e) = motor.wait_settled().await {
                scope.flying = Some(motor);
                return Err(e);
            }
        }

        // Draining
        self.set_state(FlyscanState::Draining);
        trigger.stop_detector_gate().await?;
        let points_per_packet = request
            .drain_points_per_packet
            .unwrap_or(self.config.trigger.drain_points_per_packet);
        let drain_time = trigger.pending_pulse_drain_time(points_per_packet);
        debug!(drain = ?drain_time, points_per_packet, "Draining pending pulses");
        tokio::time::sleep(drain_time).await;
        trigger.stop_subsystem().await?;
        scope.trigger_armed = false;

        let mut stopped = recorder.stop_stream().await?;
        scope.recorder_streaming = false;
        stopped.wait(self.config.timeouts.stream_status()).await?;

        Ok(drain_time)
    }

    /// Register writers, wait for them and link what closed
    async fn write_master_file(
        &self,
        setup: &RunSetup,
        recorder_used: bool,
    ) -> FlyscanResult<MasterFileReport> {
        for detector in &setup.detectors {
            if let Some(completion) = detector.file_completion() {
                self.master.register_writer(detector.name(), completion)?;
            }
        }
        if recorder_used {
            if let Some(completion) = setup.recorder.file_completion()? {
                self.master.register_writer(POSITION_LINK, completion)?;
            }
        }
        let timeout = Duration::from_secs_f64(self.config.storage.writer_timeout_s);
        let ready = self.master.wait_for_writers(timeout).await?;
        self.master.commit_links(ready).await
    }
}

async fn aborted(rx: &mut watch::Receiver<Option<String>>) -> String {
    let reason = match rx.wait_for(Option::is_some).await {
        Ok(reason) => reason.clone(),
        Err(_) => None,
    };
    match reason {
        Some(reason) => reason,
        None => std::future::pending().await,
    }
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn spawn_datum_forwarder(
    bus: DocumentBus,
    run_uid: String,
    resource: String,
    mut rx: mpsc::UnboundedReceiver<FrameRecord>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            bus.emit(Document::Datum(DatumDoc::from_frame(&run_uid, &resource, &frame)));
        }
    })
}

// =============================================================================
// Scoped acquisition
// =============================================================================

/// Tracks what one run has armed or staged and undoes it.
///
/// [`ScopedAcquisition::teardown`] is the normal path. If the guard is
/// dropped without it (the run future was cancelled) the same teardown is
/// spawned onto the runtime. The trigger lease is released only once
/// teardown has finished and, on the normal path, the master file is
/// committed.
struct ScopedAcquisition {
    trigger: Arc<TriggerGenerator>,
    recorder: Arc<PositionStreamRecorder>,
    lease: Option<TriggerLease>,
    stream_timeout: Duration,
    trigger_armed: bool,
    recorder_staged: bool,
    recorder_streaming: bool,
    /// The recorder was pointed at this run's file
    recorder_used: bool,
    staged_detectors: Vec<Arc<dyn AreaDetector>>,
    staged_motors: Vec<Arc<dyn Motor>>,
    /// Motors given a flying velocity, cleared even if never staged
    velocity_staged: Vec<Arc<dyn Motor>>,
    flying: Option<Arc<dyn Motor>>,
    forwarders: Vec<JoinHandle<()>>,
    done: bool,
}

impl ScopedAcquisition {
    fn new(setup: &RunSetup, lease: TriggerLease, stream_timeout: Duration) -> Self {
        Self {
            trigger: setup.trigger.clone(),
            recorder: setup.recorder.clone(),
            lease: Some(lease),
            stream_timeout,
            trigger_armed: false,
            recorder_staged: false,
            recorder_streaming: false,
            recorder_used: false,
            staged_detectors: Vec::new(),
            staged_motors: Vec::new(),
            velocity_staged: Vec::new(),
            flying: None,
            forwarders: Vec::new(),
            done: false,
        }
    }

    /// Stop, then unstage, everything still engaged. Failures are logged and
    /// returned, never raised.
    async fn teardown(&mut self) -> Vec<FlyscanError> {
        let mut errors = Vec::new();
        let mut note = |what: &str, result: FlyscanResult<()>| {
            if let Err(e) = result {
                warn!(step = what, error = %e, "Teardown step failed");
                errors.push(e);
            }
        };

        if self.trigger_armed {
            note("trigger stop", self.trigger.stop().await);
            self.trigger_armed = false;
        }
        if let Some(motor) = self.flying.take() {
            note("flying motor stop", motor.stop().await);
        }
        if self.recorder_streaming {
            let result = match self.recorder.stop_stream().await {
                Ok(mut stopped) => stopped.wait(self.stream_timeout).await,
                Err(e) => Err(e),
            };
            note("position stream stop", result);
            self.recorder_streaming = false;
        }

        for detector in self.staged_detectors.drain(..) {
            note("detector unstage", detector.unstage().await);
            detector.attach_datum_sink(None);
        }
        if self.recorder_staged {
            note("position stream unstage", self.recorder.unstage().await);
            self.recorder_staged = false;
        }
        for motor in self.staged_motors.drain(..) {
            note("motor unstage", motor.unstage().await);
        }
        // Staged before a later stage failed; never applied
        for motor in self.velocity_staged.drain(..) {
            motor.stage_velocity(None);
        }

        for forwarder in self.forwarders.drain(..) {
            if tokio::time::timeout(DATUM_FLUSH_TIMEOUT, forwarder).await.is_err() {
                warn!("Datum forwarder did not drain in time");
            }
        }

        self.done = true;
        errors
    }

    fn release_lease(&mut self) {
        self.lease = None;
    }

    /// Move the remaining work into a guard that owns it
    fn take_remaining(&mut self) -> ScopedAcquisition {
        let remaining = ScopedAcquisition {
            trigger: self.trigger.clone(),
            recorder: self.recorder.clone(),
            lease: self.lease.take(),
            stream_timeout: self.stream_timeout,
            trigger_armed: self.trigger_armed,
            recorder_staged: self.recorder_staged,
            recorder_streaming: self.recorder_streaming,
            recorder_used: self.recorder_used,
            staged_detectors: std::mem::take(&mut self.staged_detectors),
            staged_motors: std::mem::take(&mut self.staged_motors),
            velocity_staged: std::mem::take(&mut self.velocity_staged),
            flying: self.flying.take(),
            forwarders: std::mem::take(&mut self.forwarders),
            done: false,
        };
        self.done = true;
        remaining
    }
}

impl Drop for ScopedAcquisition {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut remaining = self.take_remaining();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Flyscan cancelled, tearing down in the background");
                handle.spawn(async move {
                    let errors = remaining.teardown().await;
                    info!(errors = errors.len(), "Background teardown finished");
                });
            }
            Err(_) => {
                remaining.done = true;
                error!("Flyscan dropped outside a runtime; hardware may still be armed");
            }
        }
    }
}
