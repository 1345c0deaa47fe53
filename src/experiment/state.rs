//! Flyscan state machine states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a flyscan is in its lifecycle
///
/// ```text
/// Idle → PathValidated → FilesReserved → Armed → Acquiring → Draining → Complete
///   └──────────────┴──────────────┴─────────┴──────────┴──────────┴──→ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlyscanState {
    /// Nothing running
    Idle,
    /// Timing and path checked
    PathValidated,
    /// Run files computed, none on disk
    FilesReserved,
    /// Trigger configured and devices staged
    Armed,
    /// Trigger running, path being stepped
    Acquiring,
    /// Motion done, pending pulses flushing
    Draining,
    /// Master file written
    Complete,
    /// Stopped on an error; hardware made safe
    Failed,
}

impl FlyscanState {
    /// Hardware may be armed in this state
    pub fn hardware_engaged(&self) -> bool {
        matches!(
            self,
            FlyscanState::Armed | FlyscanState::Acquiring | FlyscanState::Draining
        )
    }

    /// The run is over
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlyscanState::Complete | FlyscanState::Failed)
    }
}

impl fmt::Display for FlyscanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlyscanState::Idle => "idle",
            FlyscanState::PathValidated => "path_validated",
            FlyscanState::FilesReserved => "files_reserved",
            FlyscanState::Armed => "armed",
            FlyscanState::Acquiring => "acquiring",
            FlyscanState::Draining => "draining",
            FlyscanState::Complete => "complete",
            FlyscanState::Failed => "failed",
        };
        f.write_str(s)
    }
}
