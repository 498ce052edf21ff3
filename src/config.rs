//! Driver configuration
//!
//! Deserialized from a YAML file supplied by the volume-plugin front end.
//! Every knob has a deployment-safe default so a minimal file only needs
//! the link kind.

use crate::domain::ports::LinkKind;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Host-side discovery and multipath tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostConfig {
    /// Fail instead of degrading to a single raw path when no multipath
    /// device shows up.
    pub force_use_multipath: bool,

    /// Rounds of SCSI bus rescan while searching for a new LUN.
    pub scsi_scan_retry_times: u32,
    /// Seconds to wait after each rescan trigger.
    pub scsi_scan_wait_interval: u64,

    /// Rounds of by-path probing after an iSCSI login.
    pub iscsi_path_check_retry_times: u32,
    /// Seconds between by-path probes.
    pub iscsi_path_check_wait_interval: u64,

    /// Rounds of multipath namespace scanning per resolution.
    pub multipath_search_retry_times: u32,
    /// Seconds between multipath scan rounds.
    pub multipath_search_wait_interval: u64,
    /// Seconds to let the kernel settle between `multipathd reconfigure`
    /// and the map resize; without it the resize reports a false failure.
    pub multipath_resize_delay: u64,

    /// Filesystem locations consumed by discovery. Overridable so tests
    /// can point the driver at a scratch tree.
    pub paths: HostPaths,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            force_use_multipath: false,
            scsi_scan_retry_times: 3,
            scsi_scan_wait_interval: 1,
            iscsi_path_check_retry_times: 3,
            iscsi_path_check_wait_interval: 1,
            multipath_search_retry_times: 3,
            multipath_search_wait_interval: 1,
            multipath_resize_delay: 1,
            paths: HostPaths::default(),
        }
    }
}

impl HostConfig {
    pub fn scsi_scan_wait(&self) -> Duration {
        Duration::from_secs(self.scsi_scan_wait_interval)
    }

    pub fn iscsi_path_check_wait(&self) -> Duration {
        Duration::from_secs(self.iscsi_path_check_wait_interval)
    }

    pub fn multipath_search_wait(&self) -> Duration {
        Duration::from_secs(self.multipath_search_wait_interval)
    }

    pub fn multipath_resize_settle(&self) -> Duration {
        Duration::from_secs(self.multipath_resize_delay)
    }
}

/// Roots of the OS surface the driver touches.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostPaths {
    /// Symlink tree keyed by transport path identity.
    pub dev_disk_by_path: PathBuf,
    /// Per-block-device sysfs tree (`dm-*/slaves`, `device/delete`, ...).
    pub sys_block: PathBuf,
    /// SCSI host adapters carrying the wildcard `scan` trigger.
    pub scsi_host: PathBuf,
    /// FC host adapters carrying `port_name`.
    pub fc_host: PathBuf,
    /// File holding the local iSCSI initiator name.
    pub iscsi_initiator_file: PathBuf,
    /// Local hostname file.
    pub hostname_file: PathBuf,
    /// Live mount table.
    pub proc_mounts: PathBuf,
    /// Directory device nodes live under.
    pub dev_dir: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            dev_disk_by_path: PathBuf::from("/dev/disk/by-path"),
            sys_block: PathBuf::from("/sys/block"),
            scsi_host: PathBuf::from("/sys/class/scsi_host"),
            fc_host: PathBuf::from("/sys/class/fc_host"),
            iscsi_initiator_file: PathBuf::from("/etc/iscsi/initiatorname.iscsi"),
            hostname_file: PathBuf::from("/etc/hostname"),
            proc_mounts: PathBuf::from("/proc/mounts"),
            dev_dir: PathBuf::from("/dev"),
        }
    }
}

/// Top-level driver configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Transport selected once at startup, never switched at runtime.
    pub link: LinkKind,

    #[serde(default)]
    pub host: HostConfig,

    /// Directory the extension-failure barrier marker is written into.
    #[serde(default = "default_barrier_dir")]
    pub barrier_dir: PathBuf,
}

fn default_barrier_dir() -> PathBuf {
    PathBuf::from("/var/lib/lunbind")
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.scsi_scan_retry_times == 0 {
            return Err(Error::Configuration(
                "scsiScanRetryTimes must be at least 1".into(),
            ));
        }
        if self.host.multipath_search_retry_times == 0 {
            return Err(Error::Configuration(
                "multipathSearchRetryTimes must be at least 1".into(),
            ));
        }
        if self.host.iscsi_path_check_retry_times == 0 {
            return Err(Error::Configuration(
                "iscsiPathCheckRetryTimes must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Path of the active-active extend failure barrier marker.
    pub fn barrier_path(&self) -> PathBuf {
        self.barrier_dir.join("aa-extend-failure.barrier")
    }
}
