//! # Beamline Flyscan
//!
//! Orchestration of continuous-motion ("fly") scans at a synchrotron
//! beamline: an FPGA trigger generator gates one or more area detectors
//! while motors move and an encoder position stream is recorded, and a
//! master file links every detector file of the run together.
//!
//! ## Crate Structure
//!
//! - **`channel`**: control-system channel access (get/put/monitor) and an
//!   in-memory implementation used by the simulated IOCs.
//! - **`config`**: layered configuration (defaults, `flyscan.toml`,
//!   `FLYSCAN_` environment variables).
//! - **`error`**: `FlyscanError` and `ChannelError`.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`hardware`**: capability traits, device adapters, device slots and
//!   simulated hardware.
//! - **`experiment`**: acquisition paths, run files, run documents and the
//!   flyscan orchestrator.
//! - **`data`**: the master file writer and its link backends.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use beamline_flyscan::config::FlyscanConfig;
//! use beamline_flyscan::experiment::{AcquisitionPath, FlyscanRequest, StaticExperimentDirectory};
//! use beamline_flyscan::hardware::{mock::SimulatedBeamline, DetectorKind};
//!
//! # async fn demo() -> beamline_flyscan::error::FlyscanResult<()> {
//! let config = FlyscanConfig::default();
//! let beamline = SimulatedBeamline::new(&config, &[("eiger", DetectorKind::Eiger)], &["x"]);
//! let directory = Arc::new(StaticExperimentDirectory::new().with_experiment("default", "/tmp/fly"));
//! let orchestrator = beamline.orchestrator(config, directory).await?;
//!
//! let request = FlyscanRequest::new(AcquisitionPath::line("x", 0.0, 1.0, 100), 0.02, 0.01);
//! let report = orchestrator.run(request).await?;
//! println!("master file: {}", report.master.master_file_path.display());
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod logging;

pub use error::{FlyscanError, FlyscanResult};
