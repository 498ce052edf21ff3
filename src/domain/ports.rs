//! Domain ports - core types and trait boundaries of the driver
//!
//! The `StorageBackend` trait is the seam towards the per-array protocol
//! client; the driver only sequences calls into it and never implements
//! the array's volume-management semantics itself.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Link Kind
// =============================================================================

/// Transport between host and array, selected once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    Fc,
    Iscsi,
}

impl LinkKind {
    /// Prefix used when deriving the host's registered name.
    pub fn hostname_prefix(&self) -> &'static str {
        match self {
            LinkKind::Fc => "fc",
            LinkKind::Iscsi => "iscsi",
        }
    }
}

impl std::fmt::Display for LinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkKind::Fc => write!(f, "fc"),
            LinkKind::Iscsi => write!(f, "iscsi"),
        }
    }
}

// =============================================================================
// Host Identity
// =============================================================================

/// Connection identity of this host as registered on the array.
///
/// Built once per operation. When an explicit hostname override is
/// supplied only the name is carried; no local probing happens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostIdentity {
    /// Registered name, `<link>-<hostname>`.
    pub hostname: String,
    /// Transport this identity belongs to.
    pub link: LinkKind,
    /// Local iSCSI initiator name (iSCSI only).
    pub initiator: Option<String>,
    /// Local FC port WWPNs, upper-case without `0x` (FC only).
    pub wwpns: Vec<String>,
}

// =============================================================================
// Connection Descriptor
// =============================================================================

/// All paths to one LUN, as reported by the storage backend.
///
/// The per-path sequences are index-aligned and equally long. A
/// descriptor is only valid for the call that produced it and is never
/// cached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub protocol: LinkKind,

    /// Target WWPNs, one per FC path.
    #[serde(default)]
    pub wwpns: Vec<String>,
    /// Target IQNs, one per iSCSI path.
    #[serde(default)]
    pub targets: Vec<String>,
    /// Portal addresses (`ip:port`), one per iSCSI path.
    #[serde(default)]
    pub portals: Vec<String>,
    /// SCSI LUN ids, one per path.
    pub lun_ids: Vec<String>,
}

impl ConnectionDescriptor {
    /// Number of independent paths the descriptor describes.
    pub fn path_count(&self) -> usize {
        self.lun_ids.len()
    }

    /// Check the parallel sequences are aligned and non-empty.
    pub fn validate(&self) -> Result<()> {
        if self.lun_ids.is_empty() {
            return Err(Error::Internal(
                "connection descriptor carries no paths".into(),
            ));
        }
        let aligned = match self.protocol {
            LinkKind::Fc => self.wwpns.len() == self.lun_ids.len(),
            LinkKind::Iscsi => {
                self.targets.len() == self.lun_ids.len()
                    && self.portals.len() == self.lun_ids.len()
            }
        };
        if !aligned {
            return Err(Error::Internal(format!(
                "connection descriptor sequences are misaligned: {:?}",
                self
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Volume Topology
// =============================================================================

/// How the array lays out a volume; discovered per call, never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeTopology {
    Basic,
    Mirrored,
    ActiveActive,
}

impl std::fmt::Display for VolumeTopology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeTopology::Basic => write!(f, "basic"),
            VolumeTopology::Mirrored => write!(f, "mirror"),
            VolumeTopology::ActiveActive => write!(f, "aa"),
        }
    }
}

// =============================================================================
// Storage Backend Port
// =============================================================================

/// Caller-supplied option map, passed through to the backend untouched.
pub type Options = BTreeMap<String, String>;

/// Port towards the per-array storage operator.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Bind the volume to the host identity on the array and return the
    /// per-path connection descriptor.
    async fn attach_volume(
        &self,
        volume: &str,
        identity: &HostIdentity,
        options: &Options,
    ) -> Result<ConnectionDescriptor>;

    /// Remove the volume-to-host binding on the array.
    async fn detach_volume(&self, volume: &str, identity: &HostIdentity) -> Result<()>;

    /// Current binding of the volume for this identity, if any.
    async fn get_attach_info(
        &self,
        volume: &str,
        identity: &HostIdentity,
    ) -> Result<Option<ConnectionDescriptor>>;

    /// Grow the volume to `new_size_gb` on the array.
    async fn extend_volume(&self, volume: &str, new_size_gb: u64, options: &Options)
        -> Result<()>;

    /// Whether the filesystem must be frozen while the array-side extend
    /// runs (true only for active-active topology).
    async fn needs_freeze_on_extend(&self, volume: &str, options: &Options) -> Result<bool>;

    /// Reverse-lookup a volume name from its normalized hardware unique id.
    async fn resolve_name_by_hardware_id(&self, hardware_id: &str) -> Result<String>;
}

pub type StorageBackendRef = Arc<dyn StorageBackend>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_kind_display() {
        assert_eq!(format!("{}", LinkKind::Fc), "fc");
        assert_eq!(format!("{}", LinkKind::Iscsi), "iscsi");
    }

    #[test]
    fn test_descriptor_validation() {
        let good = ConnectionDescriptor {
            protocol: LinkKind::Iscsi,
            wwpns: vec![],
            targets: vec!["iqn.2000-01.com.example:t1".into(); 2],
            portals: vec!["10.0.0.1:3260".into(), "10.0.0.2:3260".into()],
            lun_ids: vec!["0".into(), "0".into()],
        };
        good.validate().unwrap();
        assert_eq!(good.path_count(), 2);

        let empty = ConnectionDescriptor {
            protocol: LinkKind::Fc,
            wwpns: vec![],
            targets: vec![],
            portals: vec![],
            lun_ids: vec![],
        };
        assert!(empty.validate().is_err());

        let misaligned = ConnectionDescriptor {
            protocol: LinkKind::Fc,
            wwpns: vec!["5005076801102B9D".into()],
            targets: vec![],
            portals: vec![],
            lun_ids: vec!["0".into(), "1".into()],
        };
        assert!(misaligned.validate().is_err());
    }
}
