//! API Data
//!
//! Plain attribute bags describing an entity, handed to the satellite sync
//! layer and front ends. Nothing in here is encoded by this crate.

use super::{DeviceLayerKind, DeviceProviderKind, DrbdRscDfnData, EncryptionType, NodeType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeApi {
    pub uuid: Uuid,
    pub name: String,
    pub node_type: NodeType,
    pub flags: u64,
    pub props: BTreeMap<String, String>,
    pub net_interfaces: Vec<NetInterfaceApi>,
    pub active_stlt_conn: Option<String>,
    pub resources: Vec<String>,
    pub stor_pools: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetInterfaceApi {
    pub uuid: Uuid,
    pub name: String,
    pub address: IpAddr,
    pub stlt_port: Option<i32>,
    pub stlt_encryption: Option<EncryptionType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefinitionApi {
    pub uuid: Uuid,
    pub name: String,
    pub flags: u64,
    pub props: BTreeMap<String, String>,
    pub layer_stack: Vec<DeviceLayerKind>,
    pub drbd: Option<DrbdRscDfnData>,
    pub volume_definitions: Vec<VolumeDefinitionApi>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeDefinitionApi {
    pub uuid: Uuid,
    pub vlm_nr: i32,
    pub size_kib: u64,
    pub minor: Option<i32>,
    pub flags: u64,
    pub props: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceApi {
    pub uuid: Uuid,
    pub node: String,
    pub rsc: String,
    pub node_id: i32,
    pub flags: u64,
    pub props: BTreeMap<String, String>,
    pub volumes: Vec<VolumeApi>,
    pub connections: Vec<ResourceConnectionApi>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeApi {
    pub uuid: Uuid,
    pub vlm_nr: i32,
    pub stor_pool: String,
    pub device_path: Option<String>,
    pub allocated_size_kib: Option<u64>,
    pub usable_size_kib: Option<u64>,
    pub flags: u64,
    pub props: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConnectionApi {
    pub uuid: Uuid,
    pub node_a: String,
    pub node_b: String,
    pub rsc: String,
    pub flags: u64,
    pub props: BTreeMap<String, String>,
    pub drbd_proxy_port: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorPoolDefinitionApi {
    pub uuid: Uuid,
    pub name: String,
    pub props: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorPoolApi {
    pub uuid: Uuid,
    pub node: String,
    pub stor_pool: String,
    pub provider_kind: DeviceProviderKind,
    pub supports_snapshots: bool,
    pub props: BTreeMap<String, String>,
    pub free_space: FreeSpaceApi,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreeSpaceApi {
    pub name: String,
    pub free_capacity_kib: Option<u64>,
    pub total_capacity_kib: Option<u64>,
    pub reserved_capacity_kib: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDefinitionApi {
    pub uuid: Uuid,
    pub rsc: String,
    pub snapshot: String,
    pub flags: u64,
    pub props: BTreeMap<String, String>,
    pub layer_stack: Vec<DeviceLayerKind>,
    pub volume_definitions: Vec<SnapshotVolumeDefinitionApi>,
    pub snapshots: Vec<SnapshotApi>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotVolumeDefinitionApi {
    pub uuid: Uuid,
    pub vlm_nr: i32,
    pub size_kib: u64,
    pub flags: u64,
    pub props: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotApi {
    pub uuid: Uuid,
    pub node: String,
    pub node_id: i32,
    pub flags: u64,
    pub props: BTreeMap<String, String>,
    pub volumes: Vec<SnapshotVolumeApi>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotVolumeApi {
    pub uuid: Uuid,
    pub vlm_nr: i32,
    pub stor_pool: String,
    pub props: BTreeMap<String, String>,
}
