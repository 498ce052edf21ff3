//! Host-side attachment
//!
//! Turns a storage-side connection descriptor into/from a usable local
//! block device. The transport-specific part (Fibre Channel vs iSCSI)
//! lives behind [`LinkStrategy`]; the multipath aggregation behind
//! [`MultipathResolver`].

pub mod exec;
pub mod fc;
pub mod fsfreeze;
pub mod iscsi;
pub mod mount;
pub mod multipath;
pub mod scsi;

use crate::config::{HostConfig, HostPaths};
use crate::domain::ports::{ConnectionDescriptor, HostIdentity, LinkKind};
use crate::error::{Error, Result};
use async_trait::async_trait;
use multipath::{MultipathResolver, ResolvedDevice};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

// =============================================================================
// Link Strategy
// =============================================================================

/// Transport-specific host operations.
///
/// One variant is selected at startup from configuration and never
/// switched at runtime.
#[async_trait]
pub trait LinkStrategy: Send + Sync {
    fn kind(&self) -> LinkKind;

    /// Build this host's identity as registered on the array.
    ///
    /// A non-empty `hostname_override` skips all local probing.
    async fn build_identity(&self, hostname_override: &str) -> Result<HostIdentity>;

    /// Find the raw per-path device nodes for a descriptor.
    ///
    /// `rescan` triggers a bus rescan first; `login` (iSCSI only) brings
    /// up missing sessions. The result may be empty when nothing was
    /// found.
    async fn discover_paths(
        &self,
        descriptor: &ConnectionDescriptor,
        rescan: bool,
        login: bool,
    ) -> Result<Vec<PathBuf>>;

    /// Tear down transport sessions no longer backing any device.
    ///
    /// No-op for FC, which is stateless on the host side.
    async fn release_sessions(&self, descriptor: &ConnectionDescriptor) -> Result<()>;
}

pub type LinkStrategyRef = Arc<dyn LinkStrategy>;

// =============================================================================
// Hostname helpers
// =============================================================================

/// Local hostname, from the hostname file.
pub fn local_hostname(paths: &HostPaths) -> Result<String> {
    let data = fs::read_to_string(&paths.hostname_file)?;
    Ok(data.trim_end_matches('\n').to_string())
}

/// Registered host name: `<prefix>-<hostname>`, falling back to the local
/// hostname when no override is given.
pub fn registered_host_name(
    prefix: &str,
    hostname_override: &str,
    paths: &HostPaths,
) -> Result<String> {
    let hostname = if hostname_override.is_empty() {
        local_hostname(paths)?
    } else {
        hostname_override.to_string()
    };
    Ok(format!("{}-{}", prefix, hostname))
}

// =============================================================================
// Host Attachment
// =============================================================================

/// Binds connection descriptors to local device paths.
pub struct HostAttachment {
    link: LinkStrategyRef,
    resolver: MultipathResolver,
    config: HostConfig,
}

impl HostAttachment {
    pub fn new(link: LinkStrategyRef, resolver: MultipathResolver, config: HostConfig) -> Self {
        Self {
            link,
            resolver,
            config,
        }
    }

    pub fn link(&self) -> &dyn LinkStrategy {
        self.link.as_ref()
    }

    /// Attach: rescan/login, discover the raw paths, resolve the
    /// aggregating device.
    pub async fn attach(&self, descriptor: &ConnectionDescriptor) -> Result<ResolvedDevice> {
        descriptor.validate()?;

        let raw_paths = self.link.discover_paths(descriptor, true, true).await?;
        if raw_paths.is_empty() {
            warn!("failed to discover any device path");
            return Err(Error::NoDevicePath);
        }

        self.resolver
            .resolve(
                &raw_paths,
                self.config.multipath_search_retry_times,
                self.config.multipath_search_wait(),
            )
            .await
    }

    /// Non-mutating probe: no rescan, no login, single discovery pass.
    pub async fn attached_path(&self, descriptor: &ConnectionDescriptor) -> Result<ResolvedDevice> {
        descriptor.validate()?;

        let raw_paths = self.link.discover_paths(descriptor, false, false).await?;
        if raw_paths.is_empty() {
            return Err(Error::NoDevicePath);
        }

        self.resolver
            .resolve(
                &raw_paths,
                self.config.multipath_search_retry_times,
                self.config.multipath_search_wait(),
            )
            .await
    }

    /// Detach: remove every underlying raw device, then drop transport
    /// sessions nothing else uses.
    pub async fn detach(&self, descriptor: &ConnectionDescriptor) -> Result<ResolvedDevice> {
        let resolved = self.attached_path(descriptor).await?;

        self.remove_device(resolved.path()).await?;
        self.link.release_sessions(descriptor).await?;

        Ok(resolved)
    }

    /// Remove a device (multipath or raw) from the SCSI subsystem.
    ///
    /// Device removal is best-effort: it continues through failures and
    /// surfaces the last error afterwards.
    async fn remove_device(&self, device_path: &Path) -> Result<()> {
        let canonical = fs::canonicalize(device_path)?;
        let is_dm = canonical
            .file_name()
            .map(|n| n.to_string_lossy().starts_with("dm-"))
            .unwrap_or(false);

        let devices = if is_dm {
            match self.resolver.find_slaves(&canonical) {
                Ok(slaves) => slaves,
                Err(e) => {
                    // nothing to do without slaves, system is in a wrong state
                    warn!("finding slaves of {} failed: {}", canonical.display(), e);
                    Vec::new()
                }
            }
        } else {
            vec![canonical.clone()]
        };

        info!(
            "removing device {} (canonical {}, raw devices {:?})",
            device_path.display(),
            canonical.display(),
            devices
        );

        if is_dm {
            if let Err(e) = self.resolver.flush(&canonical).await {
                warn!("flush of multipath device {} failed: {}", canonical.display(), e);
            }
        }

        let mut last_err = None;
        for device in &devices {
            if let Err(e) = scsi::remove_from_scsi_subsystem(self.paths(), device) {
                warn!("removing {} from scsi subsystem failed: {}", device.display(), e);
                last_err = Some(e);
            }
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Re-read geometry of every underlying device and resize the
    /// multipath map so the grown capacity becomes visible.
    pub async fn extend_disk(&self, descriptor: &ConnectionDescriptor) -> Result<ResolvedDevice> {
        descriptor.validate()?;

        let raw_paths = self.link.discover_paths(descriptor, false, false).await?;
        if raw_paths.is_empty() {
            return Err(Error::NoDevicePath);
        }

        for device in &raw_paths {
            if let Err(e) = scsi::rescan_block_device(self.paths(), &fs::canonicalize(device)?) {
                warn!("rescan of device {} failed: {}", device.display(), e);
            }
        }

        let resolved = self
            .resolver
            .resolve(&raw_paths, 1, Duration::from_secs(0))
            .await?;

        if let ResolvedDevice::Multipath(dm) = &resolved {
            self.resolver.resize(dm).await?;
        }

        Ok(resolved)
    }

    fn paths(&self) -> &HostPaths {
        &self.config.paths
    }
}
