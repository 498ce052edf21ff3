//! lunbind - block-storage attachment driver
//!
//! Binds volumes exported by an FC/iSCSI storage array to local block
//! devices, mounts them, and grows them online. The array's own volume
//! management sits behind the [`domain::ports::StorageBackend`] port;
//! this crate owns the host side and the orchestration:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Controller                           │
//! │   attach / detach / mount_device / unmount_device /          │
//! │   extend_volume / volume_stats   (per-volume keyed locks)    │
//! ├───────────────────────────┬──────────────────────────────────┤
//! │        Host side          │          Storage side            │
//! │  ┌─────────────────────┐  │  ┌────────────────────────────┐  │
//! │  │   HostAttachment    │  │  │   StorageBackend (port)    │  │
//! │  │  LinkStrategy       │  │  └────────────────────────────┘  │
//! │  │   (FC / iSCSI)      │  │  ┌────────────────────────────┐  │
//! │  │  MultipathResolver  │  │  │   ExtensionEngine          │  │
//! │  │  Mounter, FsFreeze  │  │  │   ArrayCommands (port)     │  │
//! │  └─────────────────────┘  │  │   ExtensionBarrier         │  │
//! │                           │  └────────────────────────────┘  │
//! └───────────────────────────┴──────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controller`]: orchestration of attach/detach/mount/extend
//! - [`host`]: transports, multipath resolution, mounting, freeze/thaw
//! - [`extend`]: capacity extension engine and failure barrier
//! - [`domain`]: core types and the storage backend port
//! - [`config`]: YAML configuration
//! - [`error`]: error types and handling

pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod extend;
pub mod host;
pub mod logging;

// Re-export commonly used types
pub use config::{Config, HostConfig, HostPaths};

pub use controller::Controller;

pub use domain::ports::{
    ConnectionDescriptor, HostIdentity, LinkKind, Options, StorageBackend, StorageBackendRef,
    VolumeTopology,
};

pub use error::{Error, Result};

pub use extend::{
    ArrayCommands, ArrayCommandsRef, CopySide, ExtensionBarrier, ExtensionEngine, VolumeCopy,
};

pub use host::{
    exec::{CommandRunner, SystemRunner},
    fc::FibreChannelLink,
    fsfreeze::{FsFreeze, SysFreezer},
    iscsi::IscsiLink,
    mount::Mounter,
    multipath::{MultipathResolver, ResolvedDevice},
    HostAttachment, LinkStrategy, LinkStrategyRef,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
