//! Run file output.

pub mod master_file;

pub use master_file::{
    JsonLinkBackend, LinkBackend, MasterFileReport, MasterFileWriter, RootContainer, WritersReady,
};

#[cfg(feature = "storage_hdf5")]
pub use master_file::Hdf5LinkBackend;
