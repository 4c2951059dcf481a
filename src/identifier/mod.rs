//! Validated names and bounded numbers identifying objects of the graph

mod names;
mod numbers;

pub use names::{
    FreeSpaceMgrName, KeyValueStoreName, NetInterfaceName, NodeName, ResourceName, SnapshotName,
    StorPoolName,
};
pub use numbers::{DrbdNodeId, MinorNumber, TcpPortNumber, VolumeNumber};
