//! Filesystem mounting and resizing
//!
//! Wraps the OS mount tooling: fsck/mkfs/mount/umount, the blkid format
//! probe, online filesystem growth and df-based usage stats. All state
//! lives in the live mount table; nothing is cached.

use crate::config::HostPaths;
use crate::error::{Error, Result};
use crate::host::exec::{exit_code, CommandRunner};
use std::fs;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

// fsck exit codes, per fsck(8)
const FSCK_ERRORS_CORRECTED: i32 = 1;
const FSCK_ERRORS_UNCORRECTED: i32 = 4;

/// Special format returned when a device carries a partition table
/// instead of a filesystem. Non-empty on purpose so callers never
/// mistake it for an unformatted device and run mkfs over it.
pub const FORMAT_PARTITION_TABLE: &str = "unknown data, probably partitions";

// =============================================================================
// Mount table
// =============================================================================

/// One line of the live mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub device: String,
    pub path: String,
    pub fstype: String,
    pub opts: Vec<String>,
    pub freq: i32,
    pub pass: i32,
}

// =============================================================================
// Mounter
// =============================================================================

/// Mount and unmount operations against the local system.
pub struct Mounter {
    runner: Arc<dyn CommandRunner>,
    paths: HostPaths,
}

impl Mounter {
    pub fn new(runner: Arc<dyn CommandRunner>, paths: HostPaths) -> Self {
        Self { runner, paths }
    }

    /// Parse the live mount table.
    pub fn mount_points(&self) -> Result<Vec<MountPoint>> {
        let data = fs::read_to_string(&self.paths.proc_mounts)?;

        let mut points = Vec::new();
        for line in data.lines() {
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 6 {
                return Err(Error::MountTableParse(format!(
                    "short mount table line: {:?}",
                    line
                )));
            }
            points.push(MountPoint {
                device: fields[0].to_string(),
                path: fields[1].to_string(),
                fstype: fields[2].to_string(),
                opts: fields[3].split(',').map(str::to_string).collect(),
                freq: fields[4]
                    .parse()
                    .map_err(|_| Error::MountTableParse(line.to_string()))?,
                pass: fields[5]
                    .parse()
                    .map_err(|_| Error::MountTableParse(line.to_string()))?,
            });
        }
        Ok(points)
    }

    /// The device currently mounted at `target`.
    pub fn get_device(&self, target: &str) -> Result<String> {
        for mp in self.mount_points()? {
            if mp.path == target {
                return Ok(mp.device);
            }
        }
        Err(Error::NotMounted {
            path: target.to_string(),
        })
    }

    /// Mount `device` at `target` as `fstype` with the given options.
    pub async fn mount(
        &self,
        device: &str,
        target: &str,
        fstype: &str,
        options: &[String],
    ) -> Result<()> {
        let mut args: Vec<String> = Vec::new();
        if !fstype.is_empty() {
            args.push("-t".into());
            args.push(fstype.to_string());
        }
        if !options.is_empty() {
            args.push("-o".into());
            args.push(options.join(","));
        }
        args.push(device.to_string());
        args.push(target.to_string());

        info!("mounting {} at {} as {:?}", device, target, fstype);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.runner
            .run("mount", &arg_refs)
            .await
            .map_err(|e| Error::MountFailed {
                device: device.to_string(),
                target: target.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    /// Unmount `target`.
    pub async fn unmount(&self, target: &str) -> Result<()> {
        info!("unmounting {}", target);
        self.runner.run("umount", &[target]).await?;
        Ok(())
    }

    /// Probe what a device contains.
    ///
    /// Empty string means unformatted (blkid exit code 2: no token
    /// found). A partition table yields [`FORMAT_PARTITION_TABLE`].
    pub async fn disk_format(&self, device: &str) -> Result<String> {
        let output = match self
            .runner
            .run(
                "blkid",
                &["-p", "-s", "TYPE", "-s", "PTTYPE", "-o", "export", device],
            )
            .await
        {
            Ok(out) => out,
            Err(e) if exit_code(&e) == Some(2) => return Ok(String::new()),
            Err(e) => {
                error!("could not determine format of {}: {}", device, e);
                return Err(e);
            }
        };

        let mut fstype = String::new();
        let mut pttype = String::new();
        for line in output.lines() {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                Error::Internal(format!("blkid returned invalid output: {}", output))
            })?;
            match key {
                "TYPE" => fstype = value.to_string(),
                "PTTYPE" => pttype = value.to_string(),
                _ => {}
            }
        }

        if !pttype.is_empty() {
            debug!("device {} carries a {} partition table", device, pttype);
            return Ok(FORMAT_PARTITION_TABLE.to_string());
        }

        Ok(fstype)
    }

    /// Check, format if needed, and mount a device.
    ///
    /// Read-write volumes get an `fsck -a` first. A failing mount of an
    /// unformatted device triggers mkfs (default `ext4`, ext* formatted
    /// with `-F -m0`) and one mount retry; an unexpected existing
    /// filesystem is refused.
    pub async fn format_and_mount(
        &self,
        device: &str,
        target: &str,
        fstype: &str,
        options: &[String],
    ) -> Result<()> {
        let read_only = options.iter().any(|o| o == "ro");

        let mut options = options.to_vec();
        options.push("defaults".into());

        if !read_only {
            self.fsck(device).await?;
        }

        let mount_err = match self.mount(device, target, fstype, &options).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        // the mount failed: either the disk is unformatted or it carries
        // an unexpected filesystem
        let existing = self.disk_format(device).await?;

        if existing.is_empty() {
            if read_only {
                return Err(Error::UnformattedReadOnly {
                    device: device.to_string(),
                });
            }

            let fstype = if fstype.is_empty() { "ext4" } else { fstype };
            let mkfs_args: Vec<&str> = if fstype == "ext4" || fstype == "ext3" {
                vec!["-F", "-m0", device]
            } else {
                vec![device]
            };

            info!("device {} is unformatted, formatting as {}", device, fstype);
            self.runner
                .run(&format!("mkfs.{}", fstype), &mkfs_args)
                .await?;

            return self.mount(device, target, fstype, &options).await;
        }

        if fstype.is_empty() || fstype == existing {
            Err(mount_err)
        } else {
            Err(Error::FilesystemMismatch {
                device: device.to_string(),
                existing,
                requested: fstype.to_string(),
            })
        }
    }

    /// `fsck -a`: corrected errors pass, uncorrectable errors fail, a
    /// missing fsck binary only warns.
    async fn fsck(&self, device: &str) -> Result<()> {
        info!("checking {} with fsck", device);
        if let Err(e) = self.runner.run("fsck", &["-a", device]).await {
            match exit_code(&e) {
                Some(FSCK_ERRORS_CORRECTED) => {
                    info!("fsck corrected errors on {}", device);
                }
                Some(FSCK_ERRORS_UNCORRECTED) => {
                    return Err(Error::FsckUncorrected {
                        device: device.to_string(),
                        output: e.to_string(),
                    });
                }
                Some(_) => {
                    info!("fsck on {} reported: {}", device, e);
                }
                None => {
                    warn!("fsck unavailable, mounting {} without check: {}", device, e);
                }
            }
        }
        Ok(())
    }

    /// Grow the filesystem on a device to fill its (grown) capacity.
    ///
    /// Returns whether a resize actually ran: an unformatted device needs
    /// none, mkfs will use the whole disk later anyway.
    pub async fn extend_fs(&self, device: &str, mount_path: &str) -> Result<bool> {
        let format = self.disk_format(device).await?;

        if format.is_empty() {
            return Ok(false);
        }

        debug!("growing {} filesystem on {}", format, device);
        match format.as_str() {
            "ext3" | "ext4" => {
                self.runner.run("resize2fs", &[device]).await?;
                Ok(true)
            }
            "xfs" => {
                // xfs grows through the mount point, not the device
                self.runner.run("xfs_growfs", &["-d", mount_path]).await?;
                Ok(true)
            }
            _ => Err(Error::UnsupportedFilesystem {
                fstype: format,
                device: device.to_string(),
            }),
        }
    }

    /// Usage of a mounted filesystem as (total, used, available) bytes.
    pub async fn volume_stats(&self, path: &str) -> Result<(u64, u64, u64)> {
        if path.is_empty() {
            return Err(Error::Internal("cannot stat an empty path".into()));
        }

        let output = self.runner.run("df", &["-k", path]).await?;

        let line = output
            .lines()
            .nth(1)
            .ok_or_else(|| Error::Internal(format!("unexpected df output: {}", output)))?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            return Err(Error::Internal(format!("unexpected df output: {}", output)));
        }

        let parse = |s: &str| {
            s.parse::<u64>()
                .map_err(|_| Error::Internal(format!("unexpected df output: {}", output)))
        };
        let total = parse(fields[1])?;
        let used = parse(fields[2])?;
        let available = parse(fields[3])?;

        Ok((total * 1000, used * 1000, available * 1000))
    }
}
