//! Multipath device resolution
//!
//! Given one or more raw device paths believed to represent the same LUN,
//! finds (with retry) the device-mapper node aggregating them, or degrades
//! to a single path when the deployment allows it.

use crate::config::HostPaths;
use crate::error::{Error, Result};
use crate::host::exec::CommandRunner;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

// =============================================================================
// Resolved Device
// =============================================================================

/// Outcome of a multipath resolution: the one local path handed onward.
///
/// The constituent raw paths are discarded once resolution succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedDevice {
    /// Aggregating device-mapper node, `/dev/dm-X`.
    Multipath(PathBuf),
    /// Degraded mode: one raw per-path device, no redundancy.
    SinglePath(PathBuf),
}

impl ResolvedDevice {
    pub fn path(&self) -> &Path {
        match self {
            ResolvedDevice::Multipath(p) | ResolvedDevice::SinglePath(p) => p,
        }
    }

    pub fn is_multipath(&self) -> bool {
        matches!(self, ResolvedDevice::Multipath(_))
    }

    pub fn into_path(self) -> PathBuf {
        match self {
            ResolvedDevice::Multipath(p) | ResolvedDevice::SinglePath(p) => p,
        }
    }
}

// =============================================================================
// Multipath Resolver
// =============================================================================

/// Finds and manages the device-mapper aggregation of raw SCSI paths.
pub struct MultipathResolver {
    paths: HostPaths,
    runner: Arc<dyn CommandRunner>,
    force_multipath: bool,
    resize_settle: Duration,
}

impl MultipathResolver {
    pub fn new(
        paths: HostPaths,
        runner: Arc<dyn CommandRunner>,
        force_multipath: bool,
        resize_settle: Duration,
    ) -> Self {
        Self {
            paths,
            runner,
            force_multipath,
            resize_settle,
        }
    }

    /// Resolve raw device paths to the multipath device aggregating them.
    ///
    /// Scans up to `max_retries` rounds with `wait` between rounds. When
    /// nothing aggregates the candidates: fail under force-multipath,
    /// otherwise degrade to the first raw path.
    pub async fn resolve(
        &self,
        candidates: &[PathBuf],
        max_retries: u32,
        wait: Duration,
    ) -> Result<ResolvedDevice> {
        if candidates.is_empty() {
            return Err(Error::NoDevicePath);
        }

        for round in 0..max_retries {
            if round != 0 {
                warn!("multipath device not found yet, waiting before retry");
                tokio::time::sleep(wait).await;
            }

            for dev in candidates {
                match self.find_for_device(dev) {
                    Ok(Some(dm)) => {
                        info!("found multipath device {}", dm.display());
                        return Ok(ResolvedDevice::Multipath(dm));
                    }
                    Ok(None) => {
                        warn!("no multipath device aggregates {}", dev.display());
                    }
                    Err(e) => {
                        warn!("multipath lookup through {} failed: {}", dev.display(), e);
                    }
                }
            }
        }

        if self.force_multipath {
            return Err(Error::NoMultipathDevice {
                candidates: candidates.iter().map(|p| p.display().to_string()).collect(),
            });
        }

        warn!(
            "no multipath device found, using single path {} (no redundancy)",
            candidates[0].display()
        );
        Ok(ResolvedDevice::SinglePath(candidates[0].clone()))
    }

    /// Find the device-mapper parent of one raw device, if any.
    ///
    /// Resolves the device symlink to its canonical kernel block name and
    /// scans the `dm-*` namespace for an entry whose slaves contain it.
    pub fn find_for_device(&self, device: &Path) -> Result<Option<PathBuf>> {
        let canonical = fs::canonicalize(device)?;
        let name = canonical
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| Error::InvalidDevicePath {
                path: device.display().to_string(),
            })?;

        for entry in fs::read_dir(&self.paths.sys_block)? {
            let entry = entry?;
            let dm_name = entry.file_name().to_string_lossy().to_string();
            if !dm_name.starts_with("dm-") {
                continue;
            }
            let slave = entry.path().join("slaves").join(&name);
            if slave.symlink_metadata().is_ok() {
                return Ok(Some(self.paths.dev_dir.join(dm_name)));
            }
        }

        Ok(None)
    }

    /// List the raw devices managed by a device-mapper node.
    pub fn find_slaves(&self, dm: &Path) -> Result<Vec<PathBuf>> {
        let name = dm
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| Error::InvalidDevicePath {
                path: dm.display().to_string(),
            })?;

        let slaves_dir = self.paths.sys_block.join(&name).join("slaves");
        let mut devices = Vec::new();
        for entry in fs::read_dir(&slaves_dir)? {
            let entry = entry?;
            devices.push(self.paths.dev_dir.join(entry.file_name()));
        }
        Ok(devices)
    }

    /// Flush a device-mapper node before its slaves are removed.
    pub async fn flush(&self, dm: &Path) -> Result<()> {
        self.runner
            .run("multipath", &["-f", &dm.display().to_string()])
            .await?;
        Ok(())
    }

    /// Resize a device-mapper node after its slaves grew.
    ///
    /// The reconfigure makes multipathd pick up the new path geometry; the
    /// settle delay is required or the resize reports a false failure.
    pub async fn resize(&self, dm: &Path) -> Result<()> {
        self.runner.run("multipathd", &["reconfigure"]).await?;

        tokio::time::sleep(self.resize_settle).await;

        self.runner
            .run("multipathd", &["resize", "map", &dm.display().to_string()])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::exec::testing::ScriptedRunner;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        paths: HostPaths,
    }

    /// Scratch tree with one raw device `sda` reachable via a by-path
    /// symlink, optionally aggregated by `dm-0`.
    fn fixture(with_dm: bool) -> (Fixture, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let paths = HostPaths {
            sys_block: tmp.path().join("sys/block"),
            dev_dir: tmp.path().join("dev"),
            dev_disk_by_path: tmp.path().join("dev/disk/by-path"),
            ..HostPaths::default()
        };

        fs::create_dir_all(&paths.dev_disk_by_path).unwrap();
        fs::create_dir_all(&paths.sys_block).unwrap();
        fs::write(paths.dev_dir.join("sda"), b"").unwrap();

        let by_path = paths.dev_disk_by_path.join("ip-10.0.0.1:3260-iscsi-iqn.t1-lun-0");
        std::os::unix::fs::symlink(paths.dev_dir.join("sda"), &by_path).unwrap();

        if with_dm {
            let slaves = paths.sys_block.join("dm-0/slaves");
            fs::create_dir_all(&slaves).unwrap();
            fs::write(slaves.join("sda"), b"").unwrap();
        }

        (Fixture { _tmp: tmp, paths }, by_path)
    }

    fn resolver(paths: &HostPaths, force: bool) -> MultipathResolver {
        MultipathResolver::new(
            paths.clone(),
            Arc::new(ScriptedRunner::ok()),
            force,
            Duration::from_secs(0),
        )
    }

    #[tokio::test]
    async fn test_resolve_finds_aggregating_device() {
        let (fx, by_path) = fixture(true);
        let resolved = resolver(&fx.paths, false)
            .resolve(&[by_path], 3, Duration::from_millis(1))
            .await
            .unwrap();

        assert_matches!(resolved, ResolvedDevice::Multipath(ref p) if p.ends_with("dm-0"));
        assert!(resolved.is_multipath());
    }

    #[tokio::test]
    async fn test_resolve_degrades_to_single_path() {
        let (fx, by_path) = fixture(false);
        let resolved = resolver(&fx.paths, false)
            .resolve(&[by_path.clone()], 3, Duration::from_millis(1))
            .await
            .unwrap();

        assert_eq!(resolved, ResolvedDevice::SinglePath(by_path));
        assert!(!resolved.is_multipath());
    }

    #[tokio::test]
    async fn test_resolve_strict_mode_fails() {
        let (fx, by_path) = fixture(false);
        let err = resolver(&fx.paths, true)
            .resolve(&[by_path], 3, Duration::from_millis(1))
            .await
            .unwrap_err();

        assert_matches!(err, Error::NoMultipathDevice { .. });
    }

    #[tokio::test]
    async fn test_resolve_no_candidates() {
        let (fx, _) = fixture(false);
        let err = resolver(&fx.paths, false)
            .resolve(&[], 3, Duration::from_millis(1))
            .await
            .unwrap_err();

        assert_matches!(err, Error::NoDevicePath);
    }

    #[test]
    fn test_find_slaves() {
        let (fx, _) = fixture(true);
        let resolver = resolver(&fx.paths, false);

        let slaves = resolver.find_slaves(&fx.paths.dev_dir.join("dm-0")).unwrap();
        assert_eq!(slaves, vec![fx.paths.dev_dir.join("sda")]);
    }

    #[tokio::test]
    async fn test_resize_sequence() {
        let (fx, _) = fixture(true);
        let runner = Arc::new(ScriptedRunner::ok());
        let resolver = MultipathResolver::new(
            fx.paths.clone(),
            runner.clone(),
            false,
            Duration::from_secs(0),
        );

        resolver.resize(&PathBuf::from("/dev/dm-0")).await.unwrap();

        let calls = runner.recorded();
        assert_eq!(calls[0], "multipathd reconfigure");
        assert_eq!(calls[1], "multipathd resize map /dev/dm-0");
    }
}
