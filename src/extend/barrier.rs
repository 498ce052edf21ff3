//! Extension failure barrier
//!
//! A marker file whose existence is the whole semantic: while present,
//! no capacity extension runs. It is written after a failed
//! active-active pipeline and only ever removed by an operator, after
//! the volume has been repaired on the storage system.

use crate::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::error;

pub struct ExtensionBarrier {
    path: PathBuf,
}

impl ExtensionBarrier {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the barrier is up. Logs the operator guidance when it is.
    pub fn exists(&self) -> bool {
        if !self.path.exists() {
            return false;
        }
        error!(
            "extend failure barrier {} exists, recover the volume on the \
             storage system and then remove the barrier",
            self.path.display()
        );
        true
    }

    /// Raise the barrier after a failed pipeline.
    ///
    /// Best-effort: a failure to write the marker is logged, the
    /// pipeline error being raised matters more.
    pub fn create(&self, volume: &str, cause: &Error) {
        let content = format!(
            "!!!!!! ATTENTION !!!!!!\n\
             Extend of active-active volume {} failed at {}: {}.\n\
             Read the log file to find what has been done and which step went wrong.\n\
             Then correct the active-active volume on the storage system.\n\
             After the volume is corrected, remove this file; extend, attach and \
             detach operations can then continue.\n",
            volume,
            chrono::Utc::now().to_rfc3339(),
            cause
        );

        if let Err(e) = fs::write(&self.path, content) {
            error!("writing barrier {} failed: {}", self.path.display(), e);
        }
    }
}
