//! Core domain types and ports

pub mod ports;

pub use ports::{
    ConnectionDescriptor, HostIdentity, LinkKind, StorageBackend, StorageBackendRef,
    VolumeTopology,
};
