//! iSCSI link strategy
//!
//! Path discovery is keyed by `portal+target+lun` under `by-path`.
//! Sessions are brought up on demand (sendtargets discovery, login,
//! manual startup) and torn down on detach only when no other device
//! still rides the same session.

use crate::config::HostConfig;
use crate::domain::ports::{ConnectionDescriptor, HostIdentity, LinkKind};
use crate::error::{Error, Result};
use crate::host::exec::CommandRunner;
use crate::host::{registered_host_name, LinkStrategy};
use async_trait::async_trait;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Wait before counting session devices on detach: the kernel needs a
/// moment to drop the removed device's by-path entry.
const SESSION_SETTLE: Duration = Duration::from_secs(2);

// =============================================================================
// iscsiadm wrapper
// =============================================================================

struct IscsiTool {
    runner: Arc<dyn CommandRunner>,
}

impl IscsiTool {
    /// Rescan an existing session for new LUNs.
    async fn rescan(&self, portal: &str, target: &str) -> Result<()> {
        if let Err(e) = self
            .runner
            .run("iscsiadm", &["-m", "node", "-p", portal, "-T", target, "-R"])
            .await
        {
            info!("iscsi rescan of {} {} failed: {}", portal, target, e);
            return Err(e);
        }
        Ok(())
    }

    /// Discover the portal's targets and log in, cleaning up the partial
    /// records on failure.
    async fn discovery_and_login(&self, portal: &str, target: &str) -> Result<()> {
        self.runner
            .run(
                "iscsiadm",
                &["-m", "discoverydb", "-t", "sendtargets", "-p", portal, "-o", "new"],
            )
            .await?;

        if let Err(e) = self
            .runner
            .run(
                "iscsiadm",
                &["-m", "discoverydb", "-t", "sendtargets", "-p", portal, "--discover"],
            )
            .await
        {
            error!("iscsi discovery on {} failed: {}", portal, e);
            let _ = self.delete_discovery_record(portal).await;
            return Err(e);
        }

        if let Err(e) = self
            .runner
            .run(
                "iscsiadm",
                &["-m", "node", "-p", portal, "-T", target, "--login"],
            )
            .await
        {
            error!("iscsi login to {} {} failed: {}", portal, target, e);
            let _ = self.delete_node_record(portal, target).await;
            let _ = self.delete_discovery_record(portal).await;
            return Err(e);
        }

        // manual startup so the session does not hang the next boot
        if let Err(e) = self
            .runner
            .run(
                "iscsiadm",
                &[
                    "-m", "node", "-p", portal, "-T", target, "-o", "update", "-n",
                    "node.startup", "-v", "manual",
                ],
            )
            .await
        {
            warn!("setting iscsi login mode to manual failed: {}", e);
        }

        Ok(())
    }

    /// Log out of a session and delete its node and discovery records.
    async fn logout_and_delete(&self, portal: &str, target: &str) -> Result<()> {
        self.runner
            .run(
                "iscsiadm",
                &["-m", "node", "-p", portal, "-T", target, "--logout"],
            )
            .await?;

        self.delete_node_record(portal, target).await?;
        self.delete_discovery_record(portal).await?;
        Ok(())
    }

    async fn delete_node_record(&self, portal: &str, target: &str) -> Result<()> {
        self.runner
            .run(
                "iscsiadm",
                &["-m", "node", "-p", portal, "-T", target, "-o", "delete"],
            )
            .await?;
        Ok(())
    }

    async fn delete_discovery_record(&self, portal: &str) -> Result<()> {
        self.runner
            .run(
                "iscsiadm",
                &["-m", "discoverydb", "-t", "sendtargets", "-p", portal, "-o", "delete"],
            )
            .await?;
        Ok(())
    }
}

// =============================================================================
// iSCSI Link
// =============================================================================

pub struct IscsiLink {
    config: HostConfig,
    tool: IscsiTool,
    session_settle: Duration,
}

impl IscsiLink {
    pub fn new(config: HostConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            tool: IscsiTool { runner },
            session_settle: SESSION_SETTLE,
        }
    }

    #[cfg(test)]
    fn with_session_settle(mut self, settle: Duration) -> Self {
        self.session_settle = settle;
        self
    }

    /// Local initiator name from the fixed system file.
    fn initiator_name(&self) -> Result<String> {
        let file = &self.config.paths.iscsi_initiator_file;
        let contents = fs::read_to_string(file).map_err(|e| {
            Error::IdentityProbe(format!("reading {} failed: {}", file.display(), e))
        })?;

        // the file carries comment lines plus one `InitiatorName=iqn...` line
        contents
            .split("InitiatorName=")
            .nth(1)
            .map(|s| s.trim_end_matches('\n').to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                Error::IdentityProbe(format!("no InitiatorName in {}", file.display()))
            })
    }

    fn by_path_entry(&self, portal: &str, target: &str, lun: &str) -> PathBuf {
        self.config
            .paths
            .dev_disk_by_path
            .join(format!("ip-{}-iscsi-{}-lun-{}", portal, target, lun))
    }

    /// Probe the by-path entry for one path, retrying with a fixed wait.
    async fn find_disk_by_path(
        &self,
        portal: &str,
        target: &str,
        lun: &str,
        retries: u32,
    ) -> Result<PathBuf> {
        let entry = self.by_path_entry(portal, target, lun);

        for round in 0..retries {
            if round != 0 {
                tokio::time::sleep(self.config.iscsi_path_check_wait()).await;
            }
            if entry.symlink_metadata().is_ok() {
                return Ok(fs::canonicalize(&entry)?);
            }
        }

        Err(Error::DeviceNotFound {
            device: entry.display().to_string(),
        })
    }

    /// How many by-path entries still belong to the descriptor's sessions.
    fn count_session_devices(&self, descriptor: &ConnectionDescriptor) -> Result<usize> {
        let prefixes: Vec<String> = descriptor
            .portals
            .iter()
            .zip(&descriptor.targets)
            .map(|(portal, target)| format!("ip-{}-iscsi-{}", portal, target))
            .collect();

        let mut count = 0;
        for entry in fs::read_dir(&self.config.paths.dev_disk_by_path)? {
            let name = entry?.file_name().to_string_lossy().to_string();
            if prefixes.iter().any(|p| name.contains(p.as_str())) {
                count += 1;
            }
        }
        Ok(count)
    }
}

#[async_trait]
impl LinkStrategy for IscsiLink {
    fn kind(&self) -> LinkKind {
        LinkKind::Iscsi
    }

    async fn build_identity(&self, hostname_override: &str) -> Result<HostIdentity> {
        let hostname = registered_host_name(
            LinkKind::Iscsi.hostname_prefix(),
            hostname_override,
            &self.config.paths,
        )?;

        let mut identity = HostIdentity {
            hostname,
            link: LinkKind::Iscsi,
            initiator: None,
            wwpns: Vec::new(),
        };

        if !hostname_override.is_empty() {
            return Ok(identity);
        }

        identity.initiator = Some(self.initiator_name()?);
        Ok(identity)
    }

    async fn discover_paths(
        &self,
        descriptor: &ConnectionDescriptor,
        rescan: bool,
        login: bool,
    ) -> Result<Vec<PathBuf>> {
        let mut device_paths = Vec::new();

        for idx in 0..descriptor.path_count() {
            let portal = &descriptor.portals[idx];
            let target = &descriptor.targets[idx];
            let lun = &descriptor.lun_ids[idx];

            // an existing session only needs a rescan
            if rescan {
                let _ = self.tool.rescan(portal, target).await;
                tokio::time::sleep(self.config.scsi_scan_wait()).await;
            }

            if let Ok(path) = self.find_disk_by_path(portal, target, lun, 1).await {
                device_paths.push(path);
                continue;
            }

            if login {
                if let Err(e) = self.tool.discovery_and_login(portal, target).await {
                    error!("iscsi discovery and login failed: {}", e);
                    continue;
                }

                tokio::time::sleep(self.config.scsi_scan_wait()).await;

                match self
                    .find_disk_by_path(
                        portal,
                        target,
                        lun,
                        self.config.iscsi_path_check_retry_times,
                    )
                    .await
                {
                    Ok(path) => device_paths.push(path),
                    Err(e) => {
                        error!("device for {} {} {} not found: {}", portal, target, lun, e)
                    }
                }
            }
        }

        Ok(device_paths)
    }

    /// Log out only when no other device still uses the sessions.
    async fn release_sessions(&self, descriptor: &ConnectionDescriptor) -> Result<()> {
        tokio::time::sleep(self.session_settle).await;

        let count = self.count_session_devices(descriptor)?;
        if count > 0 {
            info!("session still backs {} device(s), not logging out", count);
            return Ok(());
        }

        for idx in 0..descriptor.path_count() {
            let portal = &descriptor.portals[idx];
            let target = &descriptor.targets[idx];
            // best-effort: a stuck logout leaves only a stale record behind
            if let Err(e) = self.tool.logout_and_delete(portal, target).await {
                error!("session {} {} logout failed: {}", portal, target, e);
            }
        }

        Ok(())
    }
}
