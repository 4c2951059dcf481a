//! Resource Definition
//!
//! Cluster wide template of a replicated resource. Owns its volume
//! definitions and snapshot definitions and indexes the resources deployed
//! from it; those are shared with their nodes and deleted exactly once.

use super::{
    validate_layer_stack, AccessControlled, CoreObjects, Deletable, DeviceLayerKind,
    DrbdRscDfnData, Props, PropsOwner, Resource, ResourceDefinitionApi, SnapshotDefinition,
    VolumeDefinition, VolumeDefinitionApi,
};
use crate::error::{Error, Result};
use crate::events::CoreEvent;
use crate::identifier::{NodeName, ResourceName, SnapshotName, TcpPortNumber, VolumeNumber};
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::stateflags::{RscDfnFlag, StateFlags};
use crate::transaction::{
    composite_transaction_object, DbOp, ObjectKind, Transaction, TransactionObject, TxCell, TxMap,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug)]
pub struct ResourceDefinition {
    uuid: Uuid,
    name: ResourceName,
    prot: Arc<ObjectProtection>,
    flags: StateFlags<RscDfnFlag>,
    props: Props,
    layer_stack: TxCell<Vec<DeviceLayerKind>>,
    drbd: TxCell<Option<DrbdRscDfnData>>,

    volume_definitions: TxMap<VolumeNumber, Arc<VolumeDefinition>>,
    resources: TxMap<NodeName, Arc<Resource>>,
    snapshot_definitions: TxMap<SnapshotName, Arc<SnapshotDefinition>>,

    deleted: TxCell<bool>,
    structure_lock: Mutex<()>,
}

impl ResourceDefinition {
    pub(crate) fn new(
        uuid: Uuid,
        name: ResourceName,
        prot: Arc<ObjectProtection>,
        initial_flags: u64,
        layer_stack: Vec<DeviceLayerKind>,
        drbd: Option<DrbdRscDfnData>,
        props: Props,
    ) -> Self {
        let deleted = TxCell::new(false);
        let flags = StateFlags::new(
            vec![Arc::clone(&prot)],
            ObjectKind::ResourceDefinition,
            name.value(),
            initial_flags,
        )
        .guarded_by(&deleted);
        Self {
            uuid,
            name,
            prot,
            flags,
            props,
            layer_stack: TxCell::new(layer_stack),
            drbd: TxCell::new(drbd),
            volume_definitions: TxMap::new(),
            resources: TxMap::new(),
            snapshot_definitions: TxMap::new(),
            deleted,
            structure_lock: Mutex::new(()),
        }
    }

    pub fn uuid(&self) -> Result<Uuid> {
        self.check_deleted()?;
        Ok(self.uuid)
    }

    pub fn name(&self) -> &ResourceName {
        &self.name
    }

    pub fn prot(&self) -> Result<&Arc<ObjectProtection>> {
        self.check_deleted()?;
        Ok(&self.prot)
    }

    pub fn flags(&self) -> Result<&StateFlags<RscDfnFlag>> {
        self.check_deleted()?;
        Ok(&self.flags)
    }

    fn db_key(&self) -> String {
        self.name.value().to_string()
    }

    // =========================================================================
    // Layer Stack
    // =========================================================================

    pub fn layer_stack(&self, ctx: &AccessContext) -> Result<Vec<DeviceLayerKind>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.layer_stack.get())
    }

    pub fn uses_layer(&self, ctx: &AccessContext, kind: DeviceLayerKind) -> Result<bool> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.layer_stack.with(|stack| stack.contains(&kind)))
    }

    pub fn set_layer_stack(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        stack: Vec<DeviceLayerKind>,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Change)?;
        validate_layer_stack(&stack)?;
        self.layer_stack.set(tx, stack)?;
        tx.journal(DbOp::update(ObjectKind::ResourceDefinition, self.db_key(), "layer_stack"))
    }

    pub fn drbd_data(&self, ctx: &AccessContext) -> Result<Option<DrbdRscDfnData>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.drbd.get())
    }

    pub fn tcp_port(&self, ctx: &AccessContext) -> Result<Option<TcpPortNumber>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.drbd.with(|drbd| drbd.as_ref().map(|data| data.tcp_port)))
    }

    /// Move the replication port; the new port is taken from the TCP port
    /// pool before the old one is returned to it
    pub fn set_tcp_port(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        objs: &CoreObjects,
        port: TcpPortNumber,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Change)?;
        let Some(mut drbd) = self.drbd.get() else {
            return Err(Error::implementation(format!(
                "{} has no replication layer data",
                self.object_description()
            )));
        };
        if drbd.tcp_port == port {
            return Ok(());
        }
        let pool = objs.tcp_port_pool();
        pool.allocate(tx, port.value())?;
        pool.deallocate(tx, drbd.tcp_port.value())?;
        drbd.tcp_port = port;
        self.drbd.set(tx, Some(drbd))?;
        tx.journal(DbOp::update(ObjectKind::ResourceDefinition, self.db_key(), "tcp_port"))?;
        debug!(rsc = %self.name, port = %port, "tcp port changed");
        Ok(())
    }

    // =========================================================================
    // Volume Definitions
    // =========================================================================

    pub fn volume_definition(
        &self,
        ctx: &AccessContext,
        vlm_nr: VolumeNumber,
    ) -> Result<Option<Arc<VolumeDefinition>>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.volume_definitions.get(&vlm_nr))
    }

    pub fn volume_definitions(&self, ctx: &AccessContext) -> Result<Vec<Arc<VolumeDefinition>>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.volume_definitions.values())
    }

    pub fn volume_definition_count(&self) -> Result<usize> {
        self.check_deleted()?;
        Ok(self.volume_definitions.len())
    }

    pub(crate) fn find_volume_definition(&self, vlm_nr: VolumeNumber) -> Option<Arc<VolumeDefinition>> {
        self.volume_definitions.get(&vlm_nr)
    }

    pub(crate) fn find_volume_definitions(&self) -> Vec<Arc<VolumeDefinition>> {
        self.volume_definitions.values()
    }

    pub(crate) fn put_volume_definition(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        vlm_dfn: Arc<VolumeDefinition>,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Change)?;
        let _guard = self.structure_lock.lock();
        self.volume_definitions
            .insert(tx, vlm_dfn.volume_number(), vlm_dfn)?;
        Ok(())
    }

    pub(crate) fn remove_volume_definition(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        vlm_nr: VolumeNumber,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Change)?;
        let _guard = self.structure_lock.lock();
        self.volume_definitions.remove(tx, &vlm_nr)?;
        Ok(())
    }

    // =========================================================================
    // Resources
    // =========================================================================

    pub fn resource(&self, ctx: &AccessContext, node: &NodeName) -> Result<Option<Arc<Resource>>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.resources.get(node))
    }

    pub fn resources(&self, ctx: &AccessContext) -> Result<Vec<Arc<Resource>>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.resources.values())
    }

    pub fn resource_count(&self) -> Result<usize> {
        self.check_deleted()?;
        Ok(self.resources.len())
    }

    pub(crate) fn find_resource(&self, node: &NodeName) -> Option<Arc<Resource>> {
        self.resources.get(node)
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
        self.resources.insert(tx, rsc.key().node.clone(), rsc)?;
        Ok(())
    }

    pub(crate) fn remove_resource(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        node: &NodeName,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Use)?;
        let _guard = self.structure_lock.lock();
        self.resources.remove(tx, node)?;
        Ok(())
    }

    // =========================================================================
    // Snapshot Definitions
    // =========================================================================

    pub fn snapshot_definition(
        &self,
        ctx: &AccessContext,
        snapshot: &SnapshotName,
    ) -> Result<Option<Arc<SnapshotDefinition>>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.snapshot_definitions.get(snapshot))
    }

    pub fn snapshot_definitions(&self, ctx: &AccessContext) -> Result<Vec<Arc<SnapshotDefinition>>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.snapshot_definitions.values())
    }

    pub(crate) fn find_snapshot_definition(&self, snapshot: &SnapshotName) -> Option<Arc<SnapshotDefinition>> {
        self.snapshot_definitions.get(snapshot)
    }

    pub(crate) fn put_snapshot_definition(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        snap_dfn: Arc<SnapshotDefinition>,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Use)?;
        let _guard = self.structure_lock.lock();
        self.snapshot_definitions
            .insert(tx, snap_dfn.key().snapshot.clone(), snap_dfn)?;
        Ok(())
    }

    pub(crate) fn remove_snapshot_definition(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        snapshot: &SnapshotName,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Use)?;
        let _guard = self.structure_lock.lock();
        self.snapshot_definitions.remove(tx, snapshot)?;
        Ok(())
    }

    pub fn api_data(&self, ctx: &AccessContext) -> Result<ResourceDefinitionApi> {
        self.gate(ctx, AccessType::View)?;
        let volume_definitions = self
            .volume_definitions
            .values()
            .iter()
            .map(|vlm_dfn| vlm_dfn.api_data(ctx))
            .collect::<Result<Vec<VolumeDefinitionApi>>>()?;
        Ok(ResourceDefinitionApi {
            uuid: self.uuid,
            name: self.name.display_name().to_string(),
            flags: self.flags.raw_bits(),
            props: self.props.entries(),
            layer_stack: self.layer_stack.get(),
            drbd: self.drbd.get(),
            volume_definitions,
        })
    }

    fn sub_objects(&self) -> Vec<&dyn TransactionObject> {
        vec![
            &self.flags,
            &self.props,
            &self.layer_stack,
            &self.drbd,
            &self.volume_definitions,
            &self.resources,
            &self.snapshot_definitions,
            &self.deleted,
        ]
    }

    fn child_objects(&self) -> Vec<Arc<dyn TransactionObject>> {
        let mut children: Vec<Arc<dyn TransactionObject>> = Vec::new();
        children.extend(self.volume_definitions.values().into_iter().map(|o| o as Arc<dyn TransactionObject>));
        children.extend(self.resources.values().into_iter().map(|o| o as Arc<dyn TransactionObject>));
        children.extend(self.snapshot_definitions.values().into_iter().map(|o| o as Arc<dyn TransactionObject>));
        children
    }
}

composite_transaction_object!(ResourceDefinition);

impl AccessControlled for ResourceDefinition {
    fn object_description(&self) -> String {
        format!("ResourceDefinition: '{}'", self.name)
    }

    fn is_deleted(&self) -> bool {
        self.deleted.get()
    }

    fn require_access(&self, ctx: &AccessContext, requested: AccessType) -> Result<()> {
        self.prot.require_access(ctx, requested)
    }
}

impl PropsOwner for ResourceDefinition {
    fn props_container(&self) -> &Props {
        &self.props
    }
}

impl Deletable for ResourceDefinition {
    fn mark_deleted(&self, ctx: &AccessContext, tx: &mut Transaction) -> Result<()> {
        self.check_deleted()?;
        self.flags
            .enable_flags_with(ctx, tx, AccessType::Use, &[RscDfnFlag::Delete])?;
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

        // resources take their volumes along before the shared definitions go
        for rsc in self.resources.values() {
            rsc.delete(ctx, tx, objs)?;
        }
        for vlm_dfn in self.volume_definitions.values() {
            vlm_dfn.delete(ctx, tx, objs)?;
        }
        for snap_dfn in self.snapshot_definitions.values() {
            snap_dfn.delete(ctx, tx, objs)?;
        }

        if let Some(drbd) = self.drbd.set(tx, None)? {
            objs.tcp_port_pool().deallocate(tx, drbd.tcp_port.value())?;
        }
        objs.remove_rsc_dfn(tx, &self.name)?;
        self.props.delete(tx)?;
        self.prot.delete(ctx, tx)?;
        tx.journal(DbOp::delete(ObjectKind::ResourceDefinition, self.db_key()))?;
        tx.emit(CoreEvent::ResourceDefinitionDeleted {
            rsc: self.name.display_name().to_string(),
        });
        self.deleted.set(tx, true)?;

        info!(rsc = %self.name, "resource definition deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::objects::test_support::Fixture;
    use assert_matches::assert_matches;

    #[test]
    fn test_cascading_delete_order() {
        let fx = Fixture::new();
        let rsc_dfn = fx.deployed("data", &["alpha", "bravo", "charlie"], 2);
        let resources = rsc_dfn.resources(&fx.ctx).unwrap();
        let vlm_dfns = rsc_dfn.volume_definitions(&fx.ctx).unwrap();
        let port = rsc_dfn.tcp_port(&fx.ctx).unwrap().unwrap();

        let mut tx = fx.tx();
        rsc_dfn.delete(&fx.ctx, &mut tx, &fx.objs).unwrap();

        let events = tx.pending_events();
        let last_volume = events
            .iter()
            .rposition(|event| matches!(event, CoreEvent::VolumeDeleted { .. }))
            .unwrap();
        let last_resource = events
            .iter()
            .rposition(|event| matches!(event, CoreEvent::ResourceDeleted { .. }))
            .unwrap();
        let first_vlm_dfn = events
            .iter()
            .position(|event| matches!(event, CoreEvent::VolumeDefinitionDeleted { .. }))
            .unwrap();
        assert!(last_volume < first_vlm_dfn);
        assert!(last_resource < first_vlm_dfn);
        assert_eq!(
            events
                .iter()
                .filter(|event| matches!(event, CoreEvent::VolumeDeleted { .. }))
                .count(),
            6
        );
        tx.commit().unwrap();

        assert!(resources.iter().all(|rsc| rsc.is_deleted()));
        assert!(vlm_dfns.iter().all(|vlm_dfn| vlm_dfn.is_deleted()));
        for node in ["alpha", "bravo", "charlie"] {
            assert_eq!(fx.node(node).resource_count().unwrap(), 0);
            assert_eq!(fx.stor_pool(node, "pool").volume_count().unwrap(), 0);
        }
        assert!(fx.objs.dangling_references().is_empty());
        assert!(!fx.objs.tcp_port_pool().is_allocated(port.value()));
        assert_eq!(fx.objs.minor_pool().allocated_count(), 0);
    }

    #[test]
    fn test_delete_twice_has_no_side_effect() {
        let fx = Fixture::new();
        let rsc_dfn = fx.deployed("data", &["alpha"], 1);

        let mut tx = fx.tx();
        rsc_dfn.delete(&fx.ctx, &mut tx, &fx.objs).unwrap();
        tx.commit().unwrap();
        let stats = fx.driver.stats();

        let mut tx = fx.tx();
        rsc_dfn.delete(&fx.ctx, &mut tx, &fx.objs).unwrap();
        assert!(tx.pending_ops().is_empty());
        tx.commit().unwrap();
        assert_eq!(fx.driver.stats(), stats);
    }

    #[test]
    fn test_delete_requires_control() {
        let fx = Fixture::new();
        let rsc_dfn = fx.rsc_dfn("data");
        let user = fx.user_with_access(rsc_dfn.prot().unwrap(), "operator", AccessType::Change);

        let mut tx = fx.tx();
        assert_matches!(rsc_dfn.delete(&user, &mut tx, &fx.objs), Err(Error::AccessDenied { .. }));
        rsc_dfn.mark_deleted(&user, &mut tx).unwrap();
        assert!(rsc_dfn.flags().unwrap().is_set(&fx.ctx, RscDfnFlag::Delete).unwrap());
        assert!(!rsc_dfn.is_deleted());
    }

    #[test]
    fn test_set_tcp_port_moves_allocation() {
        let fx = Fixture::new();
        let rsc_dfn = fx.rsc_dfn("data");
        let old = rsc_dfn.tcp_port(&fx.ctx).unwrap().unwrap();
        let new = TcpPortNumber::new(7777).unwrap();

        let mut tx = fx.tx();
        rsc_dfn.set_tcp_port(&fx.ctx, &mut tx, &fx.objs, new).unwrap();
        tx.commit().unwrap();

        assert_eq!(rsc_dfn.tcp_port(&fx.ctx).unwrap(), Some(new));
        assert!(fx.objs.tcp_port_pool().is_allocated(7777));
        assert!(!fx.objs.tcp_port_pool().is_allocated(old.value()));
    }

    #[test]
    fn test_invalid_layer_stack_rejected() {
        let fx = Fixture::new();
        let rsc_dfn = fx.rsc_dfn("data");
        let mut tx = fx.tx();
        let result = rsc_dfn.set_layer_stack(
            &fx.ctx,
            &mut tx,
            vec![DeviceLayerKind::Storage, DeviceLayerKind::Drbd],
        );
        assert_matches!(result, Err(Error::InvalidName { .. }));
        assert_eq!(
            rsc_dfn.layer_stack(&fx.ctx).unwrap(),
            vec![DeviceLayerKind::Drbd, DeviceLayerKind::Storage]
        );
    }
}
