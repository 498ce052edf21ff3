//! Volume lifecycle orchestration
//!
//! Sequences the storage backend and the host side through attach,
//! detach, mount, unmount and online extension. The Controller owns no
//! array semantics of its own; it decides ordering, compensation and
//! idempotence.
//!
//! Every operation that names a volume runs under that volume's keyed
//! lock, so concurrent requests against the same volume serialize while
//! different volumes proceed in parallel.

use crate::domain::ports::{Options, StorageBackendRef};
use crate::error::Result;
use crate::host::exec::CommandRunner;
use crate::host::fsfreeze::FsFreeze;
use crate::host::mount::Mounter;
use crate::host::{scsi, HostAttachment};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub struct Controller {
    backend: StorageBackendRef,
    attachment: HostAttachment,
    mounter: Mounter,
    freezer: Arc<dyn FsFreeze>,
    runner: Arc<dyn CommandRunner>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Controller {
    pub fn new(
        backend: StorageBackendRef,
        attachment: HostAttachment,
        mounter: Mounter,
        freezer: Arc<dyn FsFreeze>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            backend,
            attachment,
            mounter,
            freezer,
            runner,
            locks: DashMap::new(),
        }
    }

    /// Per-volume lock. Entries are kept for the process lifetime; the
    /// set of volumes a node sees is small.
    fn volume_lock(&self, volume: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(volume.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // =========================================================================
    // Attach / Detach
    // =========================================================================

    /// Bind a volume to this host and return the local device path.
    pub async fn attach(
        &self,
        hostname: &str,
        volume: &str,
        options: &Options,
    ) -> Result<PathBuf> {
        let lock = self.volume_lock(volume);
        let _guard = lock.lock().await;
        self.attach_inner(hostname, volume, options).await
    }

    async fn attach_inner(
        &self,
        hostname: &str,
        volume: &str,
        options: &Options,
    ) -> Result<PathBuf> {
        debug!("attach: hostname={:?} volume={}", hostname, volume);

        let identity = self.attachment.link().build_identity(hostname).await?;

        let descriptor = self
            .backend
            .attach_volume(volume, &identity, options)
            .await?;
        info!("volume {} bound on storage: {:?}", volume, descriptor);

        match self.attachment.attach(&descriptor).await {
            Ok(resolved) => {
                info!(
                    "volume {} attached, device {}",
                    volume,
                    resolved.path().display()
                );
                Ok(resolved.into_path())
            }
            Err(e) => {
                error!("host-side attach of {} failed: {}", volume, e);
                // compensate the storage-side binding, but never let a
                // compensation failure mask the original error
                if let Err(detach_err) = self.backend.detach_volume(volume, &identity).await {
                    error!(
                        "compensating detach of {} failed: {}",
                        volume, detach_err
                    );
                }
                Err(e)
            }
        }
    }

    /// Unbind a volume, optionally removing its device from this host
    /// first.
    ///
    /// A volume that is no longer bound on the storage side makes the
    /// host step an idempotent no-op; the storage-side unbind always
    /// runs.
    pub async fn detach(&self, hostname: &str, volume: &str, detach_on_host: bool) -> Result<()> {
        let lock = self.volume_lock(volume);
        let _guard = lock.lock().await;
        self.detach_inner(hostname, volume, detach_on_host).await
    }

    async fn detach_inner(
        &self,
        hostname: &str,
        volume: &str,
        detach_on_host: bool,
    ) -> Result<()> {
        debug!(
            "detach: hostname={:?} volume={} detach_on_host={}",
            hostname, volume, detach_on_host
        );

        let identity = self.attachment.link().build_identity(hostname).await?;

        if detach_on_host {
            match self.backend.get_attach_info(volume, &identity).await? {
                None => {
                    warn!("volume {} not attached on storage", volume);
                }
                Some(descriptor) => {
                    let resolved = self.attachment.detach(&descriptor).await?;
                    info!(
                        "volume {} removed from host (device {})",
                        volume,
                        resolved.path().display()
                    );
                }
            }
        }

        self.backend.detach_volume(volume, &identity).await?;
        info!("volume {} detached from storage", volume);
        Ok(())
    }

    // =========================================================================
    // Mount / Unmount
    // =========================================================================

    /// Attach a volume and mount it, formatting on first use.
    pub async fn mount_device(
        &self,
        volume: &str,
        mount_path: &str,
        fs_type: &str,
    ) -> Result<PathBuf> {
        let lock = self.volume_lock(volume);
        let _guard = lock.lock().await;

        let device = self.attach_inner("", volume, &Options::new()).await?;

        self.mounter
            .format_and_mount(&device.display().to_string(), mount_path, fs_type, &[])
            .await?;

        Ok(device)
    }

    /// Unmount whatever is mounted at `mount_path` and detach it.
    ///
    /// The volume name is recovered from the device itself: its SCSI
    /// hardware id, normalized, reverse-looked-up on the backend.
    pub async fn unmount_device(&self, mount_path: &str) -> Result<PathBuf> {
        let device = self.mounter.get_device(mount_path)?;

        let uid = scsi::disk_uid(self.runner.as_ref(), Path::new(&device)).await?;
        let hardware_id = scsi::normalize_hardware_id(&uid)?;
        let volume = self
            .backend
            .resolve_name_by_hardware_id(&hardware_id)
            .await?;
        debug!(
            "device {} (uid {}) belongs to volume {}",
            device, hardware_id, volume
        );

        let lock = self.volume_lock(&volume);
        let _guard = lock.lock().await;

        self.mounter.unmount(mount_path).await?;

        self.detach_inner("", &volume, true).await?;
        Ok(PathBuf::from(device))
    }

    // =========================================================================
    // Extension
    // =========================================================================

    /// Grow an attached volume online: array first, then the local
    /// device, then the filesystem.
    pub async fn extend_volume(
        &self,
        volume: &str,
        new_size_gb: u64,
        old_size_gb: u64,
        device_path: &str,
        mount_path: &str,
        options: &Options,
    ) -> Result<()> {
        let lock = self.volume_lock(volume);
        let _guard = lock.lock().await;

        let identity = self.attachment.link().build_identity("").await?;

        let descriptor = match self.backend.get_attach_info(volume, &identity).await? {
            None => {
                warn!("volume {} not attached on storage, nothing to extend", volume);
                return Ok(());
            }
            Some(descriptor) => descriptor,
        };

        // active-active volumes must not take writes while the array
        // rebuilds the relationship
        let needs_freeze = self.backend.needs_freeze_on_extend(volume, options).await?;
        if needs_freeze {
            if let Err(e) = self.freezer.freeze(Path::new(mount_path)) {
                warn!("freeze of {} failed, extending anyway: {}", mount_path, e);
            }
        }

        let extend_result = self
            .backend
            .extend_volume(volume, new_size_gb, options)
            .await;

        // thaw on every branch, a frozen filesystem blocks all writers
        if needs_freeze {
            if let Err(e) = self.freezer.thaw(Path::new(mount_path)) {
                error!("thaw of {} failed: {}", mount_path, e);
            }
        }
        extend_result?;
        info!(
            "volume {} extended from {}GB to {}GB on storage",
            volume, old_size_gb, new_size_gb
        );

        let resolved = self.attachment.extend_disk(&descriptor).await?;
        let extend_path = resolved.path().display().to_string();

        if extend_path != device_path {
            // without multipath the path picked here is arbitrary and may
            // differ from the one picked at mount time
            warn!(
                "extend path {} differs from mounted path {}, filesystem may need a manual grow",
                extend_path, device_path
            );
        }

        self.mounter.extend_fs(&extend_path, mount_path).await?;
        Ok(())
    }

    // =========================================================================
    // Stats
    // =========================================================================

    /// Usage of a mounted volume as (total, used, available) bytes.
    pub async fn volume_stats(&self, mount_path: &str) -> Result<(u64, u64, u64)> {
        self.mounter.volume_stats(mount_path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HostConfig, HostPaths};
    use crate::domain::ports::{
        ConnectionDescriptor, HostIdentity, LinkKind, StorageBackend,
    };
    use crate::error::Error;
    use crate::host::exec::testing::ScriptedRunner;
    use crate::host::fc::FibreChannelLink;
    use crate::host::multipath::MultipathResolver;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::fs;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tempfile::TempDir;

    // =========================================================================
    // Test doubles
    // =========================================================================

    struct MockBackend {
        descriptor: Option<ConnectionDescriptor>,
        needs_freeze: bool,
        fail_extend: bool,
        calls: StdMutex<Vec<String>>,
    }

    impl MockBackend {
        fn new(descriptor: Option<ConnectionDescriptor>) -> Self {
            Self {
                descriptor,
                needs_freeze: false,
                fail_extend: false,
                calls: StdMutex::new(Vec::new()),
            }
        }

        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }

        fn count(&self, needle: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.starts_with(needle))
                .count()
        }
    }

    #[async_trait]
    impl StorageBackend for MockBackend {
        async fn attach_volume(
            &self,
            volume: &str,
            _identity: &HostIdentity,
            _options: &Options,
        ) -> Result<ConnectionDescriptor> {
            self.record(&format!("attach_volume {}", volume));
            self.descriptor
                .clone()
                .ok_or_else(|| Error::VolumeNotFound {
                    volume: volume.to_string(),
                })
        }

        async fn detach_volume(&self, volume: &str, _identity: &HostIdentity) -> Result<()> {
            self.record(&format!("detach_volume {}", volume));
            Ok(())
        }

        async fn get_attach_info(
            &self,
            volume: &str,
            _identity: &HostIdentity,
        ) -> Result<Option<ConnectionDescriptor>> {
            self.record(&format!("get_attach_info {}", volume));
            Ok(self.descriptor.clone())
        }

        async fn extend_volume(
            &self,
            volume: &str,
            new_size_gb: u64,
            _options: &Options,
        ) -> Result<()> {
            self.record(&format!("extend_volume {} {}", volume, new_size_gb));
            if self.fail_extend {
                return Err(Error::Backend {
                    operation: "extend_volume".into(),
                    reason: "injected".into(),
                });
            }
            Ok(())
        }

        async fn needs_freeze_on_extend(&self, _volume: &str, _options: &Options) -> Result<bool> {
            Ok(self.needs_freeze)
        }

        async fn resolve_name_by_hardware_id(&self, hardware_id: &str) -> Result<String> {
            self.record(&format!("resolve {}", hardware_id));
            Ok("vol-a".into())
        }
    }

    #[derive(Default)]
    struct CountingFreezer {
        freezes: AtomicU32,
        thaws: AtomicU32,
    }

    impl FsFreeze for CountingFreezer {
        fn freeze(&self, _: &Path) -> Result<()> {
            self.freezes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn thaw(&self, _: &Path) -> Result<()> {
            self.thaws.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    // =========================================================================
    // Fixture: FC host over a scratch tree
    // =========================================================================

    struct Fixture {
        _tmp: TempDir,
        paths: HostPaths,
        config: HostConfig,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let paths = HostPaths {
            dev_disk_by_path: tmp.path().join("dev/disk/by-path"),
            sys_block: tmp.path().join("sys/block"),
            scsi_host: tmp.path().join("sys/class/scsi_host"),
            fc_host: tmp.path().join("sys/class/fc_host"),
            hostname_file: tmp.path().join("hostname"),
            proc_mounts: tmp.path().join("mounts"),
            dev_dir: tmp.path().join("dev"),
            ..HostPaths::default()
        };
        fs::create_dir_all(&paths.dev_disk_by_path).unwrap();
        fs::create_dir_all(&paths.scsi_host).unwrap();
        fs::create_dir_all(paths.fc_host.join("host2")).unwrap();
        fs::write(
            paths.fc_host.join("host2/port_name"),
            "0x21000024ff8fbcbb\n",
        )
        .unwrap();
        fs::write(&paths.hostname_file, "node-a\n").unwrap();

        let config = HostConfig {
            scsi_scan_retry_times: 1,
            scsi_scan_wait_interval: 0,
            multipath_search_retry_times: 1,
            multipath_search_wait_interval: 0,
            paths: paths.clone(),
            ..HostConfig::default()
        };

        Fixture {
            _tmp: tmp,
            paths,
            config,
        }
    }

    impl Fixture {
        /// Put one attached FC device `sda` into the scratch tree.
        fn with_device(&self) {
            fs::write(self.paths.dev_dir.join("sda"), b"").unwrap();
            std::os::unix::fs::symlink(
                self.paths.dev_dir.join("sda"),
                self.paths
                    .dev_disk_by_path
                    .join("pci-0000:04:00.0-fc-0x5005076801102b9d-lun-0"),
            )
            .unwrap();
            fs::create_dir_all(self.paths.sys_block.join("sda/device")).unwrap();
        }
    }

    fn fc_descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor {
            protocol: LinkKind::Fc,
            wwpns: vec!["5005076801102B9D".into()],
            targets: vec![],
            portals: vec![],
            lun_ids: vec!["0".into()],
        }
    }

    fn controller(
        fx: &Fixture,
        backend: Arc<MockBackend>,
        freezer: Arc<CountingFreezer>,
        runner: Arc<ScriptedRunner>,
    ) -> Controller {
        let link = Arc::new(FibreChannelLink::new(fx.config.clone()));
        let resolver = MultipathResolver::new(
            fx.paths.clone(),
            runner.clone(),
            false,
            Duration::from_secs(0),
        );
        let attachment = HostAttachment::new(link, resolver, fx.config.clone());
        let mounter = Mounter::new(runner.clone(), fx.paths.clone());
        Controller::new(backend, attachment, mounter, freezer, runner)
    }

    // =========================================================================
    // Tests
    // =========================================================================

    #[tokio::test]
    async fn test_attach_compensates_on_host_failure() {
        let fx = fixture();
        // no device ever shows up in the scratch tree
        let backend = Arc::new(MockBackend::new(Some(fc_descriptor())));
        let ctrl = controller(
            &fx,
            backend.clone(),
            Arc::new(CountingFreezer::default()),
            Arc::new(ScriptedRunner::ok()),
        );

        let err = ctrl
            .attach("worker-1", "vol-a", &Options::new())
            .await
            .unwrap_err();

        // the discovery error surfaces, not any compensation outcome
        assert_matches!(err, Error::NoDevicePath);
        assert_eq!(backend.count("attach_volume"), 1);
        assert_eq!(backend.count("detach_volume"), 1);
    }

    #[tokio::test]
    async fn test_attach_returns_device_path() {
        let fx = fixture();
        fx.with_device();
        let backend = Arc::new(MockBackend::new(Some(fc_descriptor())));
        let ctrl = controller(
            &fx,
            backend.clone(),
            Arc::new(CountingFreezer::default()),
            Arc::new(ScriptedRunner::ok()),
        );

        let device = ctrl
            .attach("worker-1", "vol-a", &Options::new())
            .await
            .unwrap();

        assert!(device.ends_with("sda"));
        assert_eq!(backend.count("detach_volume"), 0);
    }

    #[tokio::test]
    async fn test_detach_is_idempotent_when_not_attached() {
        let fx = fixture();
        let backend = Arc::new(MockBackend::new(None));
        let ctrl = controller(
            &fx,
            backend.clone(),
            Arc::new(CountingFreezer::default()),
            Arc::new(ScriptedRunner::ok()),
        );

        ctrl.detach("worker-1", "vol-a", true).await.unwrap();
        ctrl.detach("worker-1", "vol-a", true).await.unwrap();

        // host side untouched, storage-side unbind still ran every time
        assert_eq!(backend.count("get_attach_info"), 2);
        assert_eq!(backend.count("detach_volume"), 2);
    }

    #[tokio::test]
    async fn test_detach_removes_host_device() {
        let fx = fixture();
        fx.with_device();
        let backend = Arc::new(MockBackend::new(Some(fc_descriptor())));
        let ctrl = controller(
            &fx,
            backend.clone(),
            Arc::new(CountingFreezer::default()),
            Arc::new(ScriptedRunner::ok()),
        );

        ctrl.detach("worker-1", "vol-a", true).await.unwrap();

        let delete = fs::read(fx.paths.sys_block.join("sda/device/delete")).unwrap();
        assert_eq!(delete, b"1");
        assert_eq!(backend.count("detach_volume"), 1);
    }

    #[tokio::test]
    async fn test_extend_freeze_thaw_pairing_on_success() {
        let fx = fixture();
        fx.with_device();
        let backend = Arc::new(MockBackend {
            needs_freeze: true,
            ..MockBackend::new(Some(fc_descriptor()))
        });
        let freezer = Arc::new(CountingFreezer::default());
        // blkid exit 2: unformatted, filesystem grow silently skipped
        let runner = Arc::new(ScriptedRunner::new(|program, _| match program {
            "blkid" => Err(Error::CommandFailed {
                program: "blkid".into(),
                code: Some(2),
                output: String::new(),
            }),
            _ => Ok(String::new()),
        }));
        let ctrl = controller(&fx, backend.clone(), freezer.clone(), runner);

        ctrl.extend_volume("vol-a", 20, 10, "/dev/sda", "/mnt/vol", &Options::new())
            .await
            .unwrap();

        assert_eq!(freezer.freezes.load(Ordering::SeqCst), 1);
        assert_eq!(freezer.thaws.load(Ordering::SeqCst), 1);
        assert_eq!(backend.count("extend_volume vol-a 20"), 1);
    }

    #[tokio::test]
    async fn test_extend_thaws_even_when_backend_fails() {
        let fx = fixture();
        fx.with_device();
        let backend = Arc::new(MockBackend {
            needs_freeze: true,
            fail_extend: true,
            ..MockBackend::new(Some(fc_descriptor()))
        });
        let freezer = Arc::new(CountingFreezer::default());
        let ctrl = controller(
            &fx,
            backend.clone(),
            freezer.clone(),
            Arc::new(ScriptedRunner::ok()),
        );

        let err = ctrl
            .extend_volume("vol-a", 20, 10, "/dev/sda", "/mnt/vol", &Options::new())
            .await
            .unwrap_err();

        assert_matches!(err, Error::Backend { .. });
        assert_eq!(freezer.freezes.load(Ordering::SeqCst), 1);
        assert_eq!(freezer.thaws.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_extend_unattached_volume_is_a_noop() {
        let fx = fixture();
        let backend = Arc::new(MockBackend::new(None));
        let freezer = Arc::new(CountingFreezer::default());
        let ctrl = controller(
            &fx,
            backend.clone(),
            freezer.clone(),
            Arc::new(ScriptedRunner::ok()),
        );

        ctrl.extend_volume("vol-a", 20, 10, "/dev/sda", "/mnt/vol", &Options::new())
            .await
            .unwrap();

        assert_eq!(backend.count("extend_volume"), 0);
        assert_eq!(freezer.freezes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unmount_device_reverse_lookup() {
        let fx = fixture();
        fx.with_device();
        let device = fx.paths.dev_dir.join("sda").display().to_string();
        fs::write(
            &fx.paths.proc_mounts,
            format!("{} /mnt/vol ext4 rw 0 0\n", device),
        )
        .unwrap();

        let backend = Arc::new(MockBackend::new(Some(fc_descriptor())));
        let runner = Arc::new(ScriptedRunner::new(|program, _| match program {
            "/lib/udev/scsi_id" => Ok("360050760008989c0d00000000002aa53\n".into()),
            _ => Ok(String::new()),
        }));
        let ctrl = controller(
            &fx,
            backend.clone(),
            Arc::new(CountingFreezer::default()),
            runner.clone(),
        );

        let unmounted = ctrl.unmount_device("/mnt/vol").await.unwrap();

        assert_eq!(unmounted.display().to_string(), device);
        // the id handed to the backend is normalized
        assert_eq!(backend.count("resolve 60050760008989C0D00000000002AA53"), 1);
        assert_eq!(runner.count_matching("umount /mnt/vol"), 1);
        assert_eq!(backend.count("detach_volume vol-a"), 1);
    }
}
