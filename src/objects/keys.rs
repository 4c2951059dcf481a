//! Object Keys
//!
//! Composite keys identify objects that live below more than one parent.
//! Back references between objects are stored as these keys and resolved
//! through the [`CoreObjects`](super::CoreObjects) registry.

use crate::identifier::{NodeName, ResourceName, SnapshotName, StorPoolName, VolumeNumber, NetInterfaceName};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A resource: one resource definition deployed on one node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub node: NodeName,
    pub rsc: ResourceName,
}

impl ResourceKey {
    pub fn new(node: NodeName, rsc: ResourceName) -> Self {
        Self { node, rsc }
    }

    pub(crate) fn db_key(&self) -> String {
        format!("{}/{}", self.node.value(), self.rsc.value())
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node: '{}', Rsc: '{}'", self.node, self.rsc)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeDefinitionKey {
    pub rsc: ResourceName,
    pub vlm_nr: VolumeNumber,
}

impl VolumeDefinitionKey {
    pub fn new(rsc: ResourceName, vlm_nr: VolumeNumber) -> Self {
        Self { rsc, vlm_nr }
    }

    pub(crate) fn db_key(&self) -> String {
        format!("{}/{}", self.rsc.value(), self.vlm_nr)
    }
}

impl fmt::Display for VolumeDefinitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rsc: '{}', VlmNr: {}", self.rsc, self.vlm_nr)
    }
}

/// A volume: one volume definition inside one resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeKey {
    pub node: NodeName,
    pub rsc: ResourceName,
    pub vlm_nr: VolumeNumber,
}

impl VolumeKey {
    pub fn new(node: NodeName, rsc: ResourceName, vlm_nr: VolumeNumber) -> Self {
        Self { node, rsc, vlm_nr }
    }

    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey::new(self.node.clone(), self.rsc.clone())
    }

    pub fn volume_definition_key(&self) -> VolumeDefinitionKey {
        VolumeDefinitionKey::new(self.rsc.clone(), self.vlm_nr)
    }

    pub(crate) fn db_key(&self) -> String {
        format!("{}/{}/{}", self.node.value(), self.rsc.value(), self.vlm_nr)
    }
}

impl fmt::Display for VolumeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Node: '{}', Rsc: '{}', VlmNr: {}",
            self.node, self.rsc, self.vlm_nr
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorPoolKey {
    pub node: NodeName,
    pub stor_pool: StorPoolName,
}

impl StorPoolKey {
    pub fn new(node: NodeName, stor_pool: StorPoolName) -> Self {
        Self { node, stor_pool }
    }

    pub(crate) fn db_key(&self) -> String {
        format!("{}/{}", self.node.value(), self.stor_pool.value())
    }
}

impl fmt::Display for StorPoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node: '{}', StorPool: '{}'", self.node, self.stor_pool)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetInterfaceKey {
    pub node: NodeName,
    pub name: NetInterfaceName,
}

impl NetInterfaceKey {
    pub(crate) fn db_key(&self) -> String {
        format!("{}/{}", self.node.value(), self.name.value())
    }
}

impl fmt::Display for NetInterfaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node: '{}', NetIf: '{}'", self.node, self.name)
    }
}

// =============================================================================
// Snapshot Keys
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotDefinitionKey {
    pub rsc: ResourceName,
    pub snapshot: SnapshotName,
}

impl SnapshotDefinitionKey {
    pub fn new(rsc: ResourceName, snapshot: SnapshotName) -> Self {
        Self { rsc, snapshot }
    }

    pub(crate) fn db_key(&self) -> String {
        format!("{}/{}", self.rsc.value(), self.snapshot.value())
    }
}

impl fmt::Display for SnapshotDefinitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rsc: '{}', Snapshot: '{}'", self.rsc, self.snapshot)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotVolumeDefinitionKey {
    pub rsc: ResourceName,
    pub snapshot: SnapshotName,
    pub vlm_nr: VolumeNumber,
}

impl SnapshotVolumeDefinitionKey {
    pub(crate) fn db_key(&self) -> String {
        format!("{}/{}/{}", self.rsc.value(), self.snapshot.value(), self.vlm_nr)
    }
}

impl fmt::Display for SnapshotVolumeDefinitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Rsc: '{}', Snapshot: '{}', VlmNr: {}",
            self.rsc, self.snapshot, self.vlm_nr
        )
    }
}

/// A snapshot: one snapshot definition taken on one node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotKey {
    pub node: NodeName,
    pub rsc: ResourceName,
    pub snapshot: SnapshotName,
}

impl SnapshotKey {
    pub fn new(node: NodeName, rsc: ResourceName, snapshot: SnapshotName) -> Self {
        Self { node, rsc, snapshot }
    }

    pub fn definition_key(&self) -> SnapshotDefinitionKey {
        SnapshotDefinitionKey::new(self.rsc.clone(), self.snapshot.clone())
    }

    pub(crate) fn db_key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.node.value(),
            self.rsc.value(),
            self.snapshot.value()
        )
    }
}

impl fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Node: '{}', Rsc: '{}', Snapshot: '{}'",
            self.node, self.rsc, self.snapshot
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotVolumeKey {
    pub node: NodeName,
    pub rsc: ResourceName,
    pub snapshot: SnapshotName,
    pub vlm_nr: VolumeNumber,
}

impl SnapshotVolumeKey {
    pub fn snapshot_key(&self) -> SnapshotKey {
        SnapshotKey::new(self.node.clone(), self.rsc.clone(), self.snapshot.clone())
    }

    pub fn definition_key(&self) -> SnapshotVolumeDefinitionKey {
        SnapshotVolumeDefinitionKey {
            rsc: self.rsc.clone(),
            snapshot: self.snapshot.clone(),
            vlm_nr: self.vlm_nr,
        }
    }

    pub(crate) fn db_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.node.value(),
            self.rsc.value(),
            self.snapshot.value(),
            self.vlm_nr
        )
    }
}

impl fmt::Display for SnapshotVolumeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Node: '{}', Rsc: '{}', Snapshot: '{}', VlmNr: {}",
            self.node, self.rsc, self.snapshot, self.vlm_nr
        )
    }
}

/// Capacity reservation held by a free space tracker
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReservationKey {
    Volume(VolumeKey),
    SnapshotVolume(SnapshotVolumeKey),
}

impl fmt::Display for ReservationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReservationKey::Volume(key) => write!(f, "Volume ({})", key),
            ReservationKey::SnapshotVolume(key) => write!(f, "SnapshotVolume ({})", key),
        }
    }
}

// =============================================================================
// Connection Keys
// =============================================================================

/// Unordered node pair, stored with the lower name first
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodePair {
    first: NodeName,
    second: NodeName,
}

impl NodePair {
    pub fn new(a: NodeName, b: NodeName) -> Self {
        if a <= b {
            Self { first: a, second: b }
        } else {
            Self { first: b, second: a }
        }
    }

    pub fn first(&self) -> &NodeName {
        &self.first
    }

    pub fn second(&self) -> &NodeName {
        &self.second
    }

    pub fn contains(&self, node: &NodeName) -> bool {
        &self.first == node || &self.second == node
    }

    /// The endpoint opposite to `node`
    pub fn other(&self, node: &NodeName) -> Option<&NodeName> {
        if &self.first == node {
            Some(&self.second)
        } else if &self.second == node {
            Some(&self.first)
        } else {
            None
        }
    }

    pub fn is_loop(&self) -> bool {
        self.first == self.second
    }

    pub(crate) fn db_key(&self) -> String {
        format!("{}/{}", self.first.value(), self.second.value())
    }
}

impl fmt::Display for NodePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node1: '{}', Node2: '{}'", self.first, self.second)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceConnectionKey {
    pub nodes: NodePair,
    pub rsc: ResourceName,
}

impl ResourceConnectionKey {
    pub(crate) fn db_key(&self) -> String {
        format!("{}/{}", self.nodes.db_key(), self.rsc.value())
    }
}

impl fmt::Display for ResourceConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Rsc: '{}'", self.nodes, self.rsc)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeConnectionKey {
    pub nodes: NodePair,
    pub rsc: ResourceName,
    pub vlm_nr: VolumeNumber,
}

impl VolumeConnectionKey {
    pub(crate) fn db_key(&self) -> String {
        format!("{}/{}/{}", self.nodes.db_key(), self.rsc.value(), self.vlm_nr)
    }
}

impl fmt::Display for VolumeConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Rsc: '{}', VlmNr: {}", self.nodes, self.rsc, self.vlm_nr)
    }
}
