//! Error types for the attachment driver
//!
//! Provides structured error types for host-side device discovery,
//! the attach/detach/mount orchestration and the capacity-extension
//! pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for the driver
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Host Discovery Errors
    // =========================================================================
    #[error("No device path found for any path of the connection descriptor")]
    NoDevicePath,

    #[error("No multipath device aggregates any of {candidates:?}")]
    NoMultipathDevice { candidates: Vec<String> },

    #[error("Device not found: {device}")]
    DeviceNotFound { device: String },

    #[error("Invalid device path: {path} (expected a /dev node)")]
    InvalidDevicePath { path: String },

    #[error("Host discovery failed: {0}")]
    HostDiscovery(String),

    #[error("Host identity probe failed: {0}")]
    IdentityProbe(String),

    // =========================================================================
    // OS Tooling Errors
    // =========================================================================
    #[error("Command {program} failed (exit {code:?}): {output}")]
    CommandFailed {
        program: String,
        code: Option<i32>,
        output: String,
    },

    #[error("Filesystem check found uncorrectable errors on {device}: {output}")]
    FsckUncorrected { device: String, output: String },

    #[error("Mount of {device} at {target} failed: {reason}")]
    MountFailed {
        device: String,
        target: String,
        reason: String,
    },

    #[error("Refusing to mount unformatted volume {device} read-only")]
    UnformattedReadOnly { device: String },

    #[error("Device {device} already contains {existing}, cannot mount as {requested}")]
    FilesystemMismatch {
        device: String,
        existing: String,
        requested: String,
    },

    #[error("Resize of filesystem {fstype} is not supported for device {device}")]
    UnsupportedFilesystem { fstype: String, device: String },

    #[error("No device is mounted at {path}")]
    NotMounted { path: String },

    #[error("Freeze/thaw of {path} failed: {reason}")]
    Freeze { path: String, reason: String },

    // =========================================================================
    // Backend Errors
    // =========================================================================
    #[error("Backend operation failed: {operation}: {reason}")]
    Backend { operation: String, reason: String },

    #[error("Volume not found: {volume}")]
    VolumeNotFound { volume: String },

    // =========================================================================
    // Extension Errors
    // =========================================================================
    #[error(
        "active-active extend failure barrier {path} exists; recover the volume \
         on the storage system, then remove the barrier"
    )]
    BarrierPresent { path: PathBuf },

    #[error("Volume {volume} is formatting, cannot extend")]
    VolumeFormatting { volume: String },

    #[error("Volume {volume} has {local_copies} local copies, expected {expected}; cannot extend")]
    UnexpectedTopology {
        volume: String,
        local_copies: u32,
        expected: u32,
    },

    #[error(
        "Pool {pool} free capacity not enough for extend: available {available_gb}GB, need {required_gb}GB"
    )]
    InsufficientPoolCapacity {
        pool: String,
        available_gb: u64,
        required_gb: u64,
    },

    #[error("New size {new_gb}GB must be larger than current size {old_gb}GB for volume {volume}")]
    ShrinkNotSupported {
        volume: String,
        new_gb: u64,
        old_gb: u64,
    },

    #[error("Extend step '{step}' failed: {source}")]
    ExtendStepFailed {
        step: String,
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("Mount table parse error: {0}")]
    MountTableParse(String),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Fatal errors stop processing immediately and are never retried.
    ///
    /// These match the non-retryable class of the design: unsupported
    /// filesystem types, unexpected volume topology and a present
    /// extension barrier.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::BarrierPresent { .. }
                | Error::UnsupportedFilesystem { .. }
                | Error::UnexpectedTopology { .. }
                | Error::Configuration(_)
        )
    }

    /// Transient discovery errors are retried inside bounded loops and
    /// only surface once retries exhaust.
    pub fn is_transient_discovery(&self) -> bool {
        matches!(
            self,
            Error::NoDevicePath | Error::NoMultipathDevice { .. } | Error::DeviceNotFound { .. }
        )
    }
}

/// Result type alias for the driver
pub type Result<T> = std::result::Result<T, Error>;
