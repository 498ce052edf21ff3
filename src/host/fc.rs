//! Fibre Channel link strategy
//!
//! FC is stateless on the host side: no sessions to bring up or tear
//! down. Identity comes from the local FC adapters' port names; path
//! discovery matches `by-path` entries by `wwpn:lun` suffix after a
//! wildcard bus rescan.

use crate::config::HostConfig;
use crate::domain::ports::{ConnectionDescriptor, HostIdentity, LinkKind};
use crate::error::{Error, Result};
use crate::host::{registered_host_name, LinkStrategy};
use async_trait::async_trait;
use std::fs;
use std::path::PathBuf;
use tracing::{error, warn};

pub struct FibreChannelLink {
    config: HostConfig,
}

impl FibreChannelLink {
    pub fn new(config: HostConfig) -> Self {
        Self { config }
    }

    /// Local FC port WWPNs from the host adapters.
    ///
    /// `port_name` reads like `0x21000024ff8fbcbb`; the array knows the
    /// port without the `0x` and upper-case.
    fn collect_port_names(&self) -> Result<Vec<String>> {
        let fc_host = &self.config.paths.fc_host;
        let mut names = Vec::new();

        for entry in fs::read_dir(fc_host).map_err(|e| {
            Error::IdentityProbe(format!("reading {} failed: {}", fc_host.display(), e))
        })? {
            let entry = entry?;
            let port_file = entry.path().join("port_name");
            match fs::read_to_string(&port_file) {
                Ok(contents) => {
                    let raw = contents.trim_end_matches('\n');
                    let wwpn = raw.strip_prefix("0x").unwrap_or(raw);
                    names.push(wwpn.to_uppercase());
                }
                Err(e) => {
                    warn!("reading {} failed: {}", port_file.display(), e);
                }
            }
        }

        Ok(names)
    }

    /// Wildcard rescan trigger on every SCSI host adapter.
    fn scsi_host_rescan(&self) {
        let scsi_host = &self.config.paths.scsi_host;
        let dirs = match fs::read_dir(scsi_host) {
            Ok(dirs) => dirs,
            Err(e) => {
                error!("reading {} failed: {}", scsi_host.display(), e);
                return;
            }
        };

        for entry in dirs.flatten() {
            let trigger = entry.path().join("scan");
            if let Err(e) = fs::write(&trigger, b"- - -") {
                error!("scan trigger {} failed: {}", trigger.display(), e);
            }
        }
    }

    /// Match `by-path` entries against the descriptor's `wwpn:lun` pairs.
    fn find_disks(&self, descriptor: &ConnectionDescriptor) -> Vec<PathBuf> {
        let suffixes: Vec<String> = descriptor
            .wwpns
            .iter()
            .zip(&descriptor.lun_ids)
            .map(|(wwpn, lun)| format!("-fc-0x{}-lun-{}", wwpn.to_lowercase(), lun))
            .collect();

        let by_path = &self.config.paths.dev_disk_by_path;
        let dirs = match fs::read_dir(by_path) {
            Ok(dirs) => dirs,
            Err(e) => {
                warn!("reading {} failed: {}", by_path.display(), e);
                return Vec::new();
            }
        };

        let mut disks = Vec::new();
        for entry in dirs.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if suffixes.iter().any(|s| name.ends_with(s.as_str())) {
                match fs::canonicalize(entry.path()) {
                    Ok(disk) => disks.push(disk),
                    Err(e) => warn!("resolving {} failed: {}", name, e),
                }
            }
        }
        disks
    }
}

#[async_trait]
impl LinkStrategy for FibreChannelLink {
    fn kind(&self) -> LinkKind {
        LinkKind::Fc
    }

    async fn build_identity(&self, hostname_override: &str) -> Result<HostIdentity> {
        let hostname = registered_host_name(
            LinkKind::Fc.hostname_prefix(),
            hostname_override,
            &self.config.paths,
        )?;

        let mut identity = HostIdentity {
            hostname,
            link: LinkKind::Fc,
            initiator: None,
            wwpns: Vec::new(),
        };

        if !hostname_override.is_empty() {
            return Ok(identity);
        }

        let port_names = self.collect_port_names()?;
        if port_names.is_empty() {
            return Err(Error::IdentityProbe("no FC port names found".into()));
        }
        identity.wwpns = port_names;

        Ok(identity)
    }

    async fn discover_paths(
        &self,
        descriptor: &ConnectionDescriptor,
        rescan: bool,
        _login: bool,
    ) -> Result<Vec<PathBuf>> {
        let attempts = if rescan {
            self.config.scsi_scan_retry_times
        } else {
            1
        };

        let mut disks = Vec::new();
        for _ in 0..attempts {
            if rescan {
                self.scsi_host_rescan();
                tokio::time::sleep(self.config.scsi_scan_wait()).await;
            }

            let found = self.find_disks(descriptor);
            if !found.is_empty() {
                disks = found;
                break;
            }
        }

        Ok(disks)
    }

    async fn release_sessions(&self, _descriptor: &ConnectionDescriptor) -> Result<()> {
        // FC holds no host-side session state
        Ok(())
    }
}
