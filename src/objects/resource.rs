//! Resource
//!
//! A resource definition deployed on one node. Indexed by both its node and
//! its definition; owns its volumes and the connections to its peers.

use super::{
    AccessControlled, CoreObjects, Deletable, Props, PropsOwner, ResourceApi,
    ResourceConnection, ResourceConnectionApi, ResourceKey, Volume, VolumeApi,
};
use crate::error::{Error, Result};
use crate::events::CoreEvent;
use crate::identifier::{DrbdNodeId, NodeName, ResourceName, VolumeNumber};
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::stateflags::{RscFlag, StateFlags};
use crate::transaction::{
    composite_transaction_object, DbOp, ObjectKind, Transaction, TransactionObject, TxCell, TxMap,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Negotiation state exchanged with the satellite
///
/// Never persisted and not part of the transactional state; it does not
/// survive a restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRuntime {
    pub create_primary: bool,
    pub supports_drbd: bool,
}

#[derive(Debug)]
pub struct Resource {
    uuid: Uuid,
    key: ResourceKey,
    prot: Arc<ObjectProtection>,
    node_id: DrbdNodeId,
    flags: StateFlags<RscFlag>,
    props: Props,

    volumes: TxMap<VolumeNumber, Arc<Volume>>,
    /// Keyed by the peer's node
    connections: TxMap<NodeName, Arc<ResourceConnection>>,

    runtime: Mutex<ResourceRuntime>,
    deleted: TxCell<bool>,
    structure_lock: Mutex<()>,
}

impl Resource {
    pub(crate) fn new(
        uuid: Uuid,
        key: ResourceKey,
        prot: Arc<ObjectProtection>,
        node_id: DrbdNodeId,
        initial_flags: u64,
        props: Props,
    ) -> Self {
        let deleted = TxCell::new(false);
        let flags = StateFlags::new(vec![Arc::clone(&prot)], ObjectKind::Resource, key.db_key(), initial_flags).guarded_by(&deleted);
        Self {
            uuid,
            key,
            prot,
            node_id,
            flags,
            props,
            volumes: TxMap::new(),
            connections: TxMap::new(),
            runtime: Mutex::new(ResourceRuntime::default()),
            deleted,
            structure_lock: Mutex::new(()),
        }
    }

    pub fn uuid(&self) -> Result<Uuid> {
        self.check_deleted()?;
        Ok(self.uuid)
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn node_name(&self) -> &NodeName {
        &self.key.node
    }

    pub fn resource_name(&self) -> &ResourceName {
        &self.key.rsc
    }

    pub fn prot(&self) -> Result<&Arc<ObjectProtection>> {
        self.check_deleted()?;
        Ok(&self.prot)
    }

    pub fn flags(&self) -> Result<&StateFlags<RscFlag>> {
        self.check_deleted()?;
        Ok(&self.flags)
    }

    pub fn node_id(&self, ctx: &AccessContext) -> Result<DrbdNodeId> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.node_id)
    }

    /// Node id without the access gate, for allocating ids of new peers
    pub(crate) fn raw_node_id(&self) -> DrbdNodeId {
        self.node_id
    }

    pub fn is_diskless(&self, ctx: &AccessContext) -> Result<bool> {
        self.check_deleted()?;
        self.flags.is_set(ctx, RscFlag::Diskless)
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    pub fn volume(&self, ctx: &AccessContext, vlm_nr: VolumeNumber) -> Result<Option<Arc<Volume>>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.volumes.get(&vlm_nr))
    }

    pub fn volumes(&self, ctx: &AccessContext) -> Result<Vec<Arc<Volume>>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.volumes.values())
    }

    pub fn volume_count(&self) -> Result<usize> {
        self.check_deleted()?;
        Ok(self.volumes.len())
    }

    pub(crate) fn find_volume(&self, vlm_nr: VolumeNumber) -> Option<Arc<Volume>> {
        self.volumes.get(&vlm_nr)
    }

    pub(crate) fn find_volumes(&self) -> Vec<Arc<Volume>> {
        self.volumes.values()
    }

    pub(crate) fn put_volume(&self, ctx: &AccessContext, tx: &mut Transaction, vlm: Arc<Volume>) -> Result<()> {
        self.gate(ctx, AccessType::Use)?;
        let _guard = self.structure_lock.lock();
        self.volumes.insert(tx, vlm.volume_number(), vlm)?;
        Ok(())
    }

    pub(crate) fn remove_volume(&self, ctx: &AccessContext, tx: &mut Transaction, vlm_nr: VolumeNumber) -> Result<()> {
        self.gate(ctx, AccessType::Use)?;
        let _guard = self.structure_lock.lock();
        self.volumes.remove(tx, &vlm_nr)?;
        Ok(())
    }

    // =========================================================================
    // Connections
    // =========================================================================

    pub fn connection(&self, ctx: &AccessContext, peer: &NodeName) -> Result<Option<Arc<ResourceConnection>>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.connections.get(peer))
    }

    pub fn connections(&self, ctx: &AccessContext) -> Result<Vec<Arc<ResourceConnection>>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.connections.values())
    }

    pub(crate) fn find_connection(&self, peer: &NodeName) -> Option<Arc<ResourceConnection>> {
        self.connections.get(peer)
    }

    pub(crate) fn put_connection(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        conn: Arc<ResourceConnection>,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Use)?;
        let peer = conn
            .key()
            .nodes
            .other(&self.key.node)
            .cloned()
            .ok_or_else(|| {
                Error::implementation(format!("{} does not include {}", conn.key(), self.key))
            })?;
        let _guard = self.structure_lock.lock();
        self.connections.insert(tx, peer, conn)?;
        Ok(())
    }

    pub(crate) fn remove_connection(&self, ctx: &AccessContext, tx: &mut Transaction, peer: &NodeName) -> Result<()> {
        self.gate(ctx, AccessType::Use)?;
        let _guard = self.structure_lock.lock();
        self.connections.remove(tx, peer)?;
        Ok(())
    }

    // =========================================================================
    // Runtime State
    // =========================================================================

    pub fn runtime(&self, ctx: &AccessContext) -> Result<ResourceRuntime> {
        self.gate(ctx, AccessType::View)?;
        Ok(*self.runtime.lock())
    }

    pub fn update_runtime(&self, ctx: &AccessContext, f: impl FnOnce(&mut ResourceRuntime)) -> Result<()> {
        self.gate(ctx, AccessType::Use)?;
        f(&mut self.runtime.lock());
        Ok(())
    }

    pub fn api_data(&self, ctx: &AccessContext) -> Result<ResourceApi> {
        self.gate(ctx, AccessType::View)?;
        let volumes = self
            .volumes
            .values()
            .iter()
            .map(|vlm| vlm.api_data(ctx))
            .collect::<Result<Vec<VolumeApi>>>()?;
        let connections = self
            .connections
            .values()
            .iter()
            .map(|conn| conn.api_data(ctx))
            .collect::<Result<Vec<ResourceConnectionApi>>>()?;
        Ok(ResourceApi {
            uuid: self.uuid,
            node: self.key.node.display_name().to_string(),
            rsc: self.key.rsc.display_name().to_string(),
            node_id: self.node_id.value(),
            flags: self.flags.raw_bits(),
            props: self.props.entries(),
            volumes,
            connections,
        })
    }

    fn sub_objects(&self) -> Vec<&dyn TransactionObject> {
        vec![&self.flags, &self.props, &self.volumes, &self.connections, &self.deleted]
    }

    fn child_objects(&self) -> Vec<Arc<dyn TransactionObject>> {
        let mut children: Vec<Arc<dyn TransactionObject>> = Vec::new();
        children.extend(self.volumes.values().into_iter().map(|o| o as Arc<dyn TransactionObject>));
        children.extend(self.connections.values().into_iter().map(|o| o as Arc<dyn TransactionObject>));
        children
    }
}

composite_transaction_object!(Resource);

impl AccessControlled for Resource {
    fn object_description(&self) -> String {
        format!("Resource: {}", self.key)
    }

    fn is_deleted(&self) -> bool {
        self.deleted.get()
    }

    fn require_access(&self, ctx: &AccessContext, requested: AccessType) -> Result<()> {
        self.prot.require_access(ctx, requested)
    }
}

impl PropsOwner for Resource {
    fn props_container(&self) -> &Props {
        &self.props
    }
}

impl Deletable for Resource {
    fn mark_deleted(&self, ctx: &AccessContext, tx: &mut Transaction) -> Result<()> {
        self.check_deleted()?;
        self.flags
            .enable_flags_with(ctx, tx, AccessType::Use, &[RscFlag::Delete])?;
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

        for conn in self.connections.values() {
            conn.delete(ctx, tx, objs)?;
        }
        for vlm in self.volumes.values() {
            vlm.delete(ctx, tx, objs)?;
        }

        objs.resolve_node(&self.key.node)?
            .remove_resource(ctx, tx, &self.key.rsc)?;
        objs.resolve_rsc_dfn(&self.key.rsc)?
            .remove_resource(ctx, tx, &self.key.node)?;
        self.props.delete(tx)?;
        self.prot.delete(ctx, tx)?;
        tx.journal(DbOp::delete(ObjectKind::Resource, self.key.db_key()))?;
        tx.emit(CoreEvent::ResourceDeleted {
            node: self.key.node.display_name().to_string(),
            rsc: self.key.rsc.display_name().to_string(),
        });
        self.deleted.set(tx, true)?;

        info!(node = %self.key.node, rsc = %self.key.rsc, "resource deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::test_support::Fixture;
    use assert_matches::assert_matches;

    #[test]
    fn test_delete_unlinks_from_node_and_definition() {
        let fx = Fixture::new();
        let rsc_dfn = fx.deployed("data", &["alpha", "bravo"], 1);
        let rsc = fx.resource("alpha", "data");
        let vlm = fx.volume("alpha", "data", 0);
        let vlm_dfn = fx.vlm_dfn("data", 0);

        let mut tx = fx.tx();
        rsc.delete(&fx.ctx, &mut tx, &fx.objs).unwrap();
        tx.commit().unwrap();

        assert!(vlm.is_deleted());
        assert!(fx.node("alpha").resource(&fx.ctx, rsc.resource_name()).unwrap().is_none());
        assert!(rsc_dfn.resource(&fx.ctx, rsc.node_name()).unwrap().is_none());
        assert_eq!(vlm_dfn.volumes(&fx.ctx).unwrap().len(), 1);
        assert!(fx.objs.dangling_references().is_empty());
        assert!(!fx.driver.contains(ObjectKind::Resource, &rsc.key().db_key()));
    }

    #[test]
    fn test_delete_rolled_back() {
        let fx = Fixture::new();
        fx.deployed("data", &["alpha"], 1);
        let rsc = fx.resource("alpha", "data");
        let pool = fx.stor_pool("alpha", "pool");
        let reserved = pool.free_space_tracker(&fx.ctx).unwrap().reserved_capacity_kib();

        let mut tx = fx.tx();
        rsc.delete(&fx.ctx, &mut tx, &fx.objs).unwrap();
        assert!(rsc.is_deleted());
        tx.rollback();

        assert!(!rsc.is_deleted());
        assert_eq!(rsc.volume_count().unwrap(), 1);
        assert!(fx.node("alpha").resource(&fx.ctx, rsc.resource_name()).unwrap().is_some());
        assert_eq!(pool.volume_count().unwrap(), 1);
        assert_eq!(
            pool.free_space_tracker(&fx.ctx).unwrap().reserved_capacity_kib(),
            reserved
        );
        assert!(!rsc.is_dirty());
    }

    #[test]
    fn test_runtime_state_not_transactional() {
        let fx = Fixture::new();
        fx.deployed("data", &["alpha"], 1);
        let rsc = fx.resource("alpha", "data");

        rsc.update_runtime(&fx.ctx, |runtime| runtime.create_primary = true)
            .unwrap();
        assert!(rsc.runtime(&fx.ctx).unwrap().create_primary);
        assert!(!rsc.is_dirty());
    }

    #[test]
    fn test_stale_resource_access() {
        let fx = Fixture::new();
        fx.deployed("data", &["alpha"], 1);
        let rsc = fx.resource("alpha", "data");
        let mut tx = fx.tx();
        rsc.delete(&fx.ctx, &mut tx, &fx.objs).unwrap();
        tx.commit().unwrap();

        assert_matches!(rsc.node_id(&fx.ctx), Err(Error::AccessToDeletedData { .. }));
        assert_matches!(rsc.volumes(&fx.ctx), Err(Error::AccessToDeletedData { .. }));
        assert_matches!(rsc.is_diskless(&fx.ctx), Err(Error::AccessToDeletedData { .. }));
        assert_matches!(
            rsc.update_runtime(&fx.ctx, |runtime| runtime.supports_drbd = true),
            Err(Error::AccessToDeletedData { .. })
        );
    }
}
