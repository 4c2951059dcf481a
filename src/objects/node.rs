//! Node
//!
//! A machine of the storage cluster. Owns its network interfaces, storage
//! pools, in-progress snapshots and node connections; the resources
//! assigned to it are shared with their resource definitions.

use super::{
    AccessControlled, CoreObjects, Deletable, NetInterface, NetInterfaceApi, NodeApi,
    NodeConnection, Props, PropsOwner, Resource, Snapshot, SnapshotDefinitionKey, StorPool,
};
use crate::error::{Error, Result};
use crate::events::CoreEvent;
use crate::identifier::{NetInterfaceName, NodeName, ResourceName, StorPoolName};
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::stateflags::{NodeFlag, SnapFlag, StateFlags};
use crate::transaction::{
    composite_transaction_object, DbOp, ObjectKind, Transaction, TransactionObject, TxCell, TxMap,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Property holding the name of the interface the controller connects to
pub const KEY_CUR_STLT_CONN_NAME: &str = "CurStltConnName";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    Controller,
    Satellite,
    Combined,
    Auxiliary,
}

impl NodeType {
    pub fn value(self) -> u64 {
        match self {
            NodeType::Controller => 1,
            NodeType::Satellite => 2,
            NodeType::Combined => 3,
            NodeType::Auxiliary => 4,
        }
    }

    /// A combined node is both a controller and a satellite
    pub fn includes(self, other: NodeType) -> bool {
        self.value() & other.value() == other.value()
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeType::Controller => "CONTROLLER",
            NodeType::Satellite => "SATELLITE",
            NodeType::Combined => "COMBINED",
            NodeType::Auxiliary => "AUXILIARY",
        };
        f.write_str(name)
    }
}

/// Handle of the network peer currently connected for a node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
pub struct Node {
    uuid: Uuid,
    name: NodeName,
    prot: Arc<ObjectProtection>,
    node_type: TxCell<NodeType>,
    flags: StateFlags<NodeFlag>,
    props: Props,

    net_interfaces: TxMap<NetInterfaceName, Arc<NetInterface>>,
    active_stlt_conn: TxCell<Option<NetInterfaceName>>,
    resources: TxMap<ResourceName, Arc<Resource>>,
    stor_pools: TxMap<StorPoolName, Arc<StorPool>>,
    snapshots: TxMap<SnapshotDefinitionKey, Arc<Snapshot>>,
    node_connections: TxMap<NodeName, Arc<NodeConnection>>,

    /// Runtime only, never persisted
    peer: Mutex<Option<PeerId>>,
    deleted: TxCell<bool>,
    structure_lock: Mutex<()>,
}

impl Node {
    pub(crate) fn new(
        uuid: Uuid,
        name: NodeName,
        node_type: NodeType,
        prot: Arc<ObjectProtection>,
        initial_flags: u64,
        props: Props,
    ) -> Self {
        let deleted = TxCell::new(false);
        let flags = StateFlags::new(
            vec![Arc::clone(&prot)],
            ObjectKind::Node,
            name.value(),
            initial_flags,
        )
        .guarded_by(&deleted);
        Self {
            uuid,
            name,
            prot,
            node_type: TxCell::new(node_type),
            flags,
            props,
            net_interfaces: TxMap::new(),
            active_stlt_conn: TxCell::new(None),
            resources: TxMap::new(),
            stor_pools: TxMap::new(),
            snapshots: TxMap::new(),
            node_connections: TxMap::new(),
            peer: Mutex::new(None),
            deleted,
            structure_lock: Mutex::new(()),
        }
    }

    pub fn uuid(&self) -> Result<Uuid> {
        self.check_deleted()?;
        Ok(self.uuid)
    }

    pub fn name(&self) -> &NodeName {
        &self.name
    }

    pub fn prot(&self) -> Result<&Arc<ObjectProtection>> {
        self.check_deleted()?;
        Ok(&self.prot)
    }

    pub fn flags(&self) -> Result<&StateFlags<NodeFlag>> {
        self.check_deleted()?;
        Ok(&self.flags)
    }

    fn db_key(&self) -> String {
        self.name.value().to_string()
    }

    pub fn node_type(&self, ctx: &AccessContext) -> Result<NodeType> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.node_type.get())
    }

    pub fn set_node_type(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        node_type: NodeType,
    ) -> Result<NodeType> {
        self.gate(ctx, AccessType::Change)?;
        let old = self.node_type.set(tx, node_type)?;
        tx.journal(DbOp::update(ObjectKind::Node, self.db_key(), "node_type"))?;
        Ok(old)
    }

    pub fn has_node_type(&self, ctx: &AccessContext, node_type: NodeType) -> Result<bool> {
        Ok(self.node_type(ctx)?.includes(node_type))
    }

    // =========================================================================
    // Network Interfaces
    // =========================================================================

    pub fn net_interface(
        &self,
        ctx: &AccessContext,
        name: &NetInterfaceName,
    ) -> Result<Option<Arc<NetInterface>>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.net_interfaces.get(name))
    }

    pub fn net_interfaces(&self, ctx: &AccessContext) -> Result<Vec<Arc<NetInterface>>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.net_interfaces.values())
    }

    pub(crate) fn find_net_interface(&self, name: &NetInterfaceName) -> Option<Arc<NetInterface>> {
        self.net_interfaces.get(name)
    }

    pub(crate) fn put_net_interface(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        net_if: Arc<NetInterface>,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Change)?;
        let _guard = self.structure_lock.lock();
        self.net_interfaces.insert(tx, net_if.name().clone(), net_if)?;
        Ok(())
    }

    pub(crate) fn remove_net_interface(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        name: &NetInterfaceName,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Change)?;
        let _guard = self.structure_lock.lock();
        if self.active_stlt_conn.get().as_ref() == Some(name) {
            self.active_stlt_conn.set(tx, None)?;
            self.props.remove(tx, KEY_CUR_STLT_CONN_NAME)?;
        }
        self.net_interfaces.remove(tx, name)?;
        Ok(())
    }

    /// Interface the controller uses to reach this node's satellite
    pub fn active_stlt_conn(&self, ctx: &AccessContext) -> Result<Option<Arc<NetInterface>>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self
            .active_stlt_conn
            .get()
            .and_then(|name| self.net_interfaces.get(&name)))
    }

    pub fn set_active_stlt_conn(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        name: &NetInterfaceName,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Change)?;
        let Some(net_if) = self.net_interfaces.get(name) else {
            return Err(Error::not_found("network interface", name));
        };
        self.active_stlt_conn.set(tx, Some(name.clone()))?;
        self.props
            .set(tx, KEY_CUR_STLT_CONN_NAME, net_if.name().display_name())?;
        Ok(())
    }

    // =========================================================================
    // Resources
    // =========================================================================

    pub fn resource(&self, ctx: &AccessContext, rsc: &ResourceName) -> Result<Option<Arc<Resource>>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.resources.get(rsc))
    }

    pub fn resources(&self, ctx: &AccessContext) -> Result<Vec<Arc<Resource>>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.resources.values())
    }

    pub fn resource_count(&self) -> Result<usize> {
        self.check_deleted()?;
        Ok(self.resources.len())
    }

    pub(crate) fn find_resource(&self, rsc: &ResourceName) -> Option<Arc<Resource>> {
        self.resources.get(rsc)
    }

    pub(crate) fn find_resources(&self) -> Vec<Arc<Resource>> {
        self.resources.values()
    }

    pub(crate) fn put_resource(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        rsc: Arc<Resource>,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Use)?;
        let _guard = self.structure_lock.lock();
        self.resources.insert(tx, rsc.key().rsc.clone(), rsc)?;
        Ok(())
    }

    pub(crate) fn remove_resource(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        rsc: &ResourceName,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Use)?;
        let _guard = self.structure_lock.lock();
        self.resources.remove(tx, rsc)?;
        Ok(())
    }

    // =========================================================================
    // Storage Pools
    // =========================================================================

    pub fn stor_pool(&self, ctx: &AccessContext, name: &StorPoolName) -> Result<Option<Arc<StorPool>>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.stor_pools.get(name))
    }

    pub fn stor_pools(&self, ctx: &AccessContext) -> Result<Vec<Arc<StorPool>>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.stor_pools.values())
    }

    pub fn stor_pool_count(&self) -> Result<usize> {
        self.check_deleted()?;
        Ok(self.stor_pools.len())
    }

    pub(crate) fn find_stor_pool(&self, name: &StorPoolName) -> Option<Arc<StorPool>> {
        self.stor_pools.get(name)
    }

    pub(crate) fn find_stor_pools(&self) -> Vec<Arc<StorPool>> {
        self.stor_pools.values()
    }

    pub(crate) fn put_stor_pool(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        stor_pool: Arc<StorPool>,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Change)?;
        let _guard = self.structure_lock.lock();
        self.stor_pools
            .insert(tx, stor_pool.key().stor_pool.clone(), stor_pool)?;
        Ok(())
    }

    pub(crate) fn remove_stor_pool(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        name: &StorPoolName,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Change)?;
        let _guard = self.structure_lock.lock();
        self.stor_pools.remove(tx, name)?;
        Ok(())
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    pub fn snapshots(&self, ctx: &AccessContext) -> Result<Vec<Arc<Snapshot>>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.snapshots.values())
    }

    pub fn has_snapshots(&self, ctx: &AccessContext) -> Result<bool> {
        self.gate(ctx, AccessType::View)?;
        Ok(!self.snapshots.is_empty())
    }

    /// Snapshots still waiting to be taken on this node
    pub fn in_progress_snapshots(&self, ctx: &AccessContext) -> Result<Vec<Arc<Snapshot>>> {
        let mut in_progress = Vec::new();
        for snapshot in self.snapshots(ctx)? {
            if snapshot.flags()?.is_set(ctx, SnapFlag::TakeSnapshot)? {
                in_progress.push(snapshot);
            }
        }
        Ok(in_progress)
    }

    pub(crate) fn put_snapshot(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        snapshot: Arc<Snapshot>,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Use)?;
        let _guard = self.structure_lock.lock();
        self.snapshots
            .insert(tx, snapshot.key().definition_key(), snapshot)?;
        Ok(())
    }

    pub(crate) fn remove_snapshot(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        key: &SnapshotDefinitionKey,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Use)?;
        let _guard = self.structure_lock.lock();
        self.snapshots.remove(tx, key)?;
        Ok(())
    }

    // =========================================================================
    // Node Connections
    // =========================================================================

    pub fn node_connection(
        &self,
        ctx: &AccessContext,
        other: &NodeName,
    ) -> Result<Option<Arc<NodeConnection>>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.node_connections.get(other))
    }

    pub fn node_connections(&self, ctx: &AccessContext) -> Result<Vec<Arc<NodeConnection>>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.node_connections.values())
    }

    pub(crate) fn find_node_connection(&self, other: &NodeName) -> Option<Arc<NodeConnection>> {
        self.node_connections.get(other)
    }

    pub(crate) fn put_node_connection(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        conn: Arc<NodeConnection>,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Change)?;
        let other = conn
            .nodes()
            .other(&self.name)
            .cloned()
            .ok_or_else(|| Error::implementation(format!("{} does not include {}", conn.nodes(), self.name)))?;
        let _guard = self.structure_lock.lock();
        self.node_connections.insert(tx, other, conn)?;
        Ok(())
    }

    pub(crate) fn remove_node_connection(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        other: &NodeName,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Change)?;
        let _guard = self.structure_lock.lock();
        self.node_connections.remove(tx, other)?;
        Ok(())
    }

    // =========================================================================
    // Peer
    // =========================================================================

    pub fn peer(&self, ctx: &AccessContext) -> Result<Option<PeerId>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.peer.lock().clone())
    }

    pub fn set_peer(&self, ctx: &AccessContext, peer: Option<PeerId>) -> Result<()> {
        self.gate(ctx, AccessType::Change)?;
        *self.peer.lock() = peer;
        Ok(())
    }

    pub fn api_data(&self, ctx: &AccessContext) -> Result<NodeApi> {
        self.gate(ctx, AccessType::View)?;
        let net_interfaces = self
            .net_interfaces
            .values()
            .iter()
            .map(|net_if| net_if.api_data(ctx))
            .collect::<Result<Vec<NetInterfaceApi>>>()?;
        Ok(NodeApi {
            uuid: self.uuid,
            name: self.name.display_name().to_string(),
            node_type: self.node_type.get(),
            flags: self.flags.raw_bits(),
            props: self.props.entries(),
            net_interfaces,
            active_stlt_conn: self
                .active_stlt_conn
                .get()
                .map(|name| name.display_name().to_string()),
            resources: self
                .resources
                .keys()
                .iter()
                .map(|rsc| rsc.display_name().to_string())
                .collect(),
            stor_pools: self
                .stor_pools
                .keys()
                .iter()
                .map(|pool| pool.display_name().to_string())
                .collect(),
        })
    }

    fn sub_objects(&self) -> Vec<&dyn TransactionObject> {
        vec![
            &self.node_type,
            &self.flags,
            &self.props,
            &self.net_interfaces,
            &self.active_stlt_conn,
            &self.resources,
            &self.stor_pools,
            &self.snapshots,
            &self.node_connections,
            &self.deleted,
        ]
    }

    fn child_objects(&self) -> Vec<Arc<dyn TransactionObject>> {
        let mut children: Vec<Arc<dyn TransactionObject>> = Vec::new();
        children.extend(self.net_interfaces.values().into_iter().map(|o| o as Arc<dyn TransactionObject>));
        children.extend(self.resources.values().into_iter().map(|o| o as Arc<dyn TransactionObject>));
        children.extend(self.stor_pools.values().into_iter().map(|o| o as Arc<dyn TransactionObject>));
        children.extend(self.snapshots.values().into_iter().map(|o| o as Arc<dyn TransactionObject>));
        children.extend(self.node_connections.values().into_iter().map(|o| o as Arc<dyn TransactionObject>));
        children
    }
}

composite_transaction_object!(Node);

impl AccessControlled for Node {
    fn object_description(&self) -> String {
        format!("Node: '{}'", self.name)
    }

    fn is_deleted(&self) -> bool {
        self.deleted.get()
    }

    fn require_access(&self, ctx: &AccessContext, requested: AccessType) -> Result<()> {
        self.prot.require_access(ctx, requested)
    }
}

impl PropsOwner for Node {
    fn props_container(&self) -> &Props {
        &self.props
    }
}

impl Deletable for Node {
    fn mark_deleted(&self, ctx: &AccessContext, tx: &mut Transaction) -> Result<()> {
        self.check_deleted()?;
        self.flags
            .enable_flags_with(ctx, tx, AccessType::Use, &[NodeFlag::Delete])?;
        tx.emit(CoreEvent::MarkedDeleted {
            object: self.object_description(),
        });
        Ok(())
    }

    fn delete(&self, ctx: &AccessContext, tx: &mut Transaction, objs: &CoreObjects) -> Result<()> {
        let _guard = objs.lock_structure();
        if self.is_deleted() {
            return Ok(());
        }
        self.prot.require_access(ctx, AccessType::Control)?;

        for conn in self.node_connections.values() {
            conn.delete(ctx, tx, objs)?;
        }
        for rsc in self.resources.values() {
            rsc.delete(ctx, tx, objs)?;
        }
        for snapshot in self.snapshots.values() {
            snapshot.delete(ctx, tx, objs)?;
        }
        for stor_pool in self.stor_pools.values() {
            stor_pool.delete(ctx, tx, objs)?;
        }
        for net_if in self.net_interfaces.values() {
            net_if.delete(ctx, tx, objs)?;
        }

        objs.remove_node(tx, &self.name)?;
        self.props.delete(tx)?;
        self.prot.delete(ctx, tx)?;
        tx.journal(DbOp::delete(ObjectKind::Node, self.db_key()))?;
        tx.emit(CoreEvent::NodeDeleted {
            node: self.name.display_name().to_string(),
        });
        self.deleted.set(tx, true)?;

        info!(node = %self.name, "node deleted");
        Ok(())
    }
}
