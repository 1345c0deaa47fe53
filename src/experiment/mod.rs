//! Flyscan orchestration.
//!
//! - **Paths**: stepped points plus an optional flying axis
//! - **Run files**: every file of a run, reserved before hardware is armed
//! - **Documents**: Start, Descriptor, Event, Resource, Datum and Stop
//! - **Orchestrator**: the state machine running one flyscan

pub mod directory;
pub mod document;
pub mod flyscan;
pub mod metadata;
pub mod path;
pub mod state;

pub use directory::{ExperimentDirectory, StaticExperimentDirectory};
pub use document::{Document, DocumentBus};
pub use flyscan::{
    AcquisitionModes, FlyscanOrchestrator, FlyscanOrchestratorBuilder, FlyscanReport,
    FlyscanRequest,
};
pub use metadata::{RunFileSet, RunMetadata};
pub use path::{AcquisitionPath, FlyingAxis, PathPoint};
pub use state::FlyscanState;
