//! Filesystem freeze/thaw
//!
//! Quiesces a mounted filesystem around storage-side operations that
//! must not race in-flight writes. The kernel interface is a pair of
//! ioctls on any open fd inside the mount.

use crate::error::{Error, Result};
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use tracing::info;

const FIFREEZE: libc::c_ulong = 0xc004_5877;
const FITHAW: libc::c_ulong = 0xc004_5878;

/// Port for quiescing a mounted filesystem.
///
/// Every successful `freeze` must be paired with a `thaw`, including on
/// error paths; a filesystem left frozen blocks all writers.
pub trait FsFreeze: Send + Sync {
    fn freeze(&self, mount_path: &Path) -> Result<()>;
    fn thaw(&self, mount_path: &Path) -> Result<()>;
}

/// Freezes through the FIFREEZE/FITHAW ioctls.
pub struct SysFreezer;

impl SysFreezer {
    fn ioctl(&self, mount_path: &Path, request: libc::c_ulong) -> Result<()> {
        let file = File::open(mount_path).map_err(|e| Error::Freeze {
            path: mount_path.display().to_string(),
            reason: e.to_string(),
        })?;

        let rc = unsafe { libc::ioctl(file.as_raw_fd(), request, 0) };
        if rc != 0 {
            return Err(Error::Freeze {
                path: mount_path.display().to_string(),
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        Ok(())
    }
}

impl FsFreeze for SysFreezer {
    fn freeze(&self, mount_path: &Path) -> Result<()> {
        info!("freezing filesystem at {}", mount_path.display());
        self.ioctl(mount_path, FIFREEZE)
    }

    fn thaw(&self, mount_path: &Path) -> Result<()> {
        info!("thawing filesystem at {}", mount_path.display());
        self.ioctl(mount_path, FITHAW)
    }
}
