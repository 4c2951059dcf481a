//! Device Layers and Providers
//!
//! Kinds of the layer stack of a resource definition, storage provider kinds
//! of pools, and the per-definition replication layer data.

use crate::error::{Error, Result};
use crate::identifier::{MinorNumber, TcpPortNumber};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Property key overriding the oversubscription ratio of a pool
pub const KEY_MAX_OVERSUBSCRIPTION_RATIO: &str = "MaxOversubscriptionRatio";

/// Oversubscription ratio of thin provisioned pools without an override
pub const DEFAULT_THIN_OVERSUBSCRIPTION_RATIO: f64 = 20.0;

const SHARED_SECRET_LEN: usize = 20;

// =============================================================================
// Layer Kinds
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceLayerKind {
    Drbd,
    Luks,
    Nvme,
    Cache,
    Storage,
}

impl fmt::Display for DeviceLayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceLayerKind::Drbd => "DRBD",
            DeviceLayerKind::Luks => "LUKS",
            DeviceLayerKind::Nvme => "NVME",
            DeviceLayerKind::Cache => "CACHE",
            DeviceLayerKind::Storage => "STORAGE",
        };
        f.write_str(name)
    }
}

/// Default stack of new resource definitions
pub fn default_layer_stack() -> Vec<DeviceLayerKind> {
    vec![DeviceLayerKind::Drbd, DeviceLayerKind::Storage]
}

/// A layer stack is top-down, ends in STORAGE and names each kind once
pub fn validate_layer_stack(stack: &[DeviceLayerKind]) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidName {
        kind: "layer stack",
        name: stack
            .iter()
            .map(|kind| kind.to_string())
            .collect::<Vec<_>>()
            .join(","),
        reason: reason.to_string(),
    };

    if stack.last() != Some(&DeviceLayerKind::Storage) {
        return Err(invalid("the bottom layer must be STORAGE"));
    }
    for (idx, kind) in stack.iter().enumerate() {
        if stack[..idx].contains(kind) {
            return Err(invalid("layer kinds must not repeat"));
        }
    }
    Ok(())
}

// =============================================================================
// Provider Kinds
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceProviderKind {
    Diskless,
    Lvm,
    LvmThin,
    Zfs,
    ZfsThin,
    File,
    FileThin,
    Spdk,
}

impl DeviceProviderKind {
    /// Static snapshot support; `None` if the storage layer decides at runtime
    pub fn supports_snapshots(self) -> Option<bool> {
        match self {
            DeviceProviderKind::LvmThin
            | DeviceProviderKind::Zfs
            | DeviceProviderKind::ZfsThin => Some(true),
            DeviceProviderKind::File | DeviceProviderKind::FileThin => None,
            DeviceProviderKind::Diskless | DeviceProviderKind::Lvm | DeviceProviderKind::Spdk => {
                Some(false)
            }
        }
    }

    pub fn is_thin(self) -> bool {
        matches!(
            self,
            DeviceProviderKind::LvmThin | DeviceProviderKind::ZfsThin | DeviceProviderKind::FileThin
        )
    }

    pub fn has_backing_device(self) -> bool {
        self != DeviceProviderKind::Diskless
    }

    /// Ratio applied when the pool carries no override property
    ///
    /// Diskless pools are never limited.
    pub fn default_oversubscription_ratio(self) -> f64 {
        match self {
            DeviceProviderKind::Diskless => f64::INFINITY,
            kind if kind.is_thin() => DEFAULT_THIN_OVERSUBSCRIPTION_RATIO,
            _ => 1.0,
        }
    }
}

impl fmt::Display for DeviceProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceProviderKind::Diskless => "DISKLESS",
            DeviceProviderKind::Lvm => "LVM",
            DeviceProviderKind::LvmThin => "LVM_THIN",
            DeviceProviderKind::Zfs => "ZFS",
            DeviceProviderKind::ZfsThin => "ZFS_THIN",
            DeviceProviderKind::File => "FILE",
            DeviceProviderKind::FileThin => "FILE_THIN",
            DeviceProviderKind::Spdk => "SPDK",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Replication Layer Data
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportType {
    #[default]
    Ip,
    Rdma,
}

/// Replication settings shared by every resource of a definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrbdRscDfnData {
    pub tcp_port: TcpPortNumber,
    pub transport: TransportType,
    pub secret: String,
    pub peer_slots: u16,
}

impl DrbdRscDfnData {
    pub fn new(tcp_port: TcpPortNumber, peer_slots: u16) -> Self {
        Self {
            tcp_port,
            transport: TransportType::default(),
            secret: generate_shared_secret(),
            peer_slots,
        }
    }
}

/// Replication settings of one volume definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrbdVlmDfnData {
    pub minor: MinorNumber,
}

/// Random shared secret for the replication peers of a definition
pub fn generate_shared_secret() -> String {
    let mut secret = Uuid::new_v4().simple().to_string();
    secret.truncate(SHARED_SECRET_LEN);
    secret
}
