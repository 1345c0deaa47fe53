//! Hardware adapters.
//!
//! Capability traits ([`capabilities`]) are what the orchestrator talks to.
//! Each adapter implements them over the control-system channel layer:
//!
//! - [`trigger::TriggerGenerator`]: FPGA pulse subsystem driving the detector gate
//! - [`detector::FileWriterDetector`]: area detector with an HDF5 file plugin
//! - [`position_stream::PositionStreamRecorder`]: encoder position streaming process
//! - [`motor::ChannelMotor`]: motor record
//! - [`scaler::ChannelReadout`]: scalar readout sampled per point
//!
//! [`mock`] simulates the IOCs behind all of them on a
//! [`crate::channel::SimChannelLayer`].

pub mod capabilities;
pub mod completion;
pub mod detector;
pub mod mock;
pub mod motor;
pub mod position_stream;
pub mod scaler;
pub mod slot;
pub mod trigger;

pub use capabilities::{
    AreaDetector, DatumSink, Device, FrameRecord, Motor, Movable, Readable, Stageable,
    TriggerMode, VelocityControl,
};
pub use completion::{StatusCompletion, WriterCompletion};
pub use detector::{DetectorKind, FileWriterDetector};
pub use position_stream::PositionStreamRecorder;
pub use slot::{connect_slot, DeviceSlot};
pub use trigger::{TriggerGenerator, TriggerPlan, TriggerRegisters};
