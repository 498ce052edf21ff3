//! SCSI sysfs primitives
//!
//! Delete/rescan triggers are plain sysfs files taking a fixed one-byte
//! payload; the hardware unique id comes from the vendor SCSI
//! identification page (0x83).

use crate::config::HostPaths;
use crate::error::{Error, Result};
use crate::host::exec::CommandRunner;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Extract the kernel block name (`sda`, `dm-1`) from a `/dev` node path.
pub fn device_name(paths: &HostPaths, device_path: &Path) -> Result<String> {
    if !device_path.starts_with(&paths.dev_dir) {
        return Err(Error::InvalidDevicePath {
            path: device_path.display().to_string(),
        });
    }
    device_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| Error::InvalidDevicePath {
            path: device_path.display().to_string(),
        })
}

/// Remove a raw SCSI device by writing its sysfs delete trigger.
pub fn remove_from_scsi_subsystem(paths: &HostPaths, device_path: &Path) -> Result<()> {
    let name = device_name(paths, device_path)?;
    let trigger = paths.sys_block.join(&name).join("device/delete");
    info!("remove device from scsi subsystem: {}", trigger.display());
    fs::write(&trigger, b"1")?;
    Ok(())
}

/// Ask the kernel to re-read a device's geometry.
pub fn rescan_block_device(paths: &HostPaths, device_path: &Path) -> Result<()> {
    let name = device_name(paths, device_path)?;
    let trigger = paths.sys_block.join(&name).join("device/rescan");
    debug!("rescan block device: {}", trigger.display());
    fs::write(&trigger, b"1")?;
    Ok(())
}

/// Probe the hardware unique id of a device (SCSI page 0x83).
pub async fn disk_uid(runner: &dyn CommandRunner, device_path: &Path) -> Result<String> {
    let out = runner
        .run(
            "/lib/udev/scsi_id",
            &[
                "--whitelisted",
                "--page=0x83",
                &device_path.display().to_string(),
            ],
        )
        .await?;

    let uid = out.trim().to_string();
    if uid.is_empty() {
        return Err(Error::HostDiscovery(format!(
            "no scsi id reported for {}",
            device_path.display()
        )));
    }
    Ok(uid)
}

/// Normalize a host-reported hardware id into the backend's format.
///
/// The host id carries a one-character type prefix and is lower-case
/// (`360050760008989c0d00000000002aa53`); the backend stores it without
/// the prefix and upper-case. The transform is exact; deviating breaks
/// the volume reverse-lookup silently.
pub fn normalize_hardware_id(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.len() < 2 {
        return Err(Error::HostDiscovery(format!(
            "hardware id too short to normalize: {:?}",
            raw
        )));
    }
    Ok(trimmed[1..].to_uppercase())
}
