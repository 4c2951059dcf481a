//! Snapshot Definition
//!
//! A named point in time of a resource definition. The layer stack and the
//! volume sizes are copied when the snapshot is taken, so the definition
//! stays intact when the source resource changes or goes away.

use super::{
    AccessControlled, CoreObjects, Deletable, DeviceLayerKind, Props, PropsOwner, Snapshot,
    SnapshotApi, SnapshotDefinitionApi, SnapshotDefinitionKey, SnapshotVolumeDefinition,
    SnapshotVolumeDefinitionApi,
};
use crate::error::Result;
use crate::events::CoreEvent;
use crate::identifier::{NodeName, ResourceName, SnapshotName, VolumeNumber};
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::stateflags::{SnapDfnFlag, StateFlags};
use crate::transaction::{
    composite_transaction_object, DbOp, ObjectKind, Transaction, TransactionObject, TxCell, TxMap,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug)]
pub struct SnapshotDefinition {
    uuid: Uuid,
    key: SnapshotDefinitionKey,
    prot: Arc<ObjectProtection>,
    flags: StateFlags<SnapDfnFlag>,
    props: Props,
    layer_stack: Vec<DeviceLayerKind>,
    volume_definitions: TxMap<VolumeNumber, Arc<SnapshotVolumeDefinition>>,
    snapshots: TxMap<NodeName, Arc<Snapshot>>,
    /// Set while the satellites are still taking the snapshot; runtime only
    in_creation: AtomicBool,
    deleted: TxCell<bool>,
    structure_lock: Mutex<()>,
}

impl SnapshotDefinition {
    pub(crate) fn new(
        uuid: Uuid,
        key: SnapshotDefinitionKey,
        prot: Arc<ObjectProtection>,
        initial_flags: u64,
        layer_stack: Vec<DeviceLayerKind>,
    ) -> Self {
        let deleted = TxCell::new(false);
        let flags = StateFlags::new(
            vec![Arc::clone(&prot)],
            ObjectKind::SnapshotDefinition,
            key.db_key(),
            initial_flags,
        )
        .guarded_by(&deleted);
        let props = Props::new(format!("/snapshotdefinitions/{}", key.db_key()));
        Self {
            uuid,
            key,
            prot,
            flags,
            props,
            layer_stack,
            volume_definitions: TxMap::new(),
            snapshots: TxMap::new(),
            in_creation: AtomicBool::new(false),
            deleted,
            structure_lock: Mutex::new(()),
        }
    }

    pub fn uuid(&self) -> Result<Uuid> {
        self.check_deleted()?;
        Ok(self.uuid)
    }

    pub fn key(&self) -> &SnapshotDefinitionKey {
        &self.key
    }

    pub fn name(&self) -> &SnapshotName {
        &self.key.snapshot
    }

    pub fn resource_name(&self) -> &ResourceName {
        &self.key.rsc
    }

    pub fn prot(&self) -> Result<&Arc<ObjectProtection>> {
        self.check_deleted()?;
        Ok(&self.prot)
    }

    pub fn flags(&self) -> Result<&StateFlags<SnapDfnFlag>> {
        self.check_deleted()?;
        Ok(&self.flags)
    }

    /// Layer stack of the resource definition at the time of the snapshot
    pub fn layer_stack(&self, ctx: &AccessContext) -> Result<Vec<DeviceLayerKind>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.layer_stack.clone())
    }

    pub fn in_creation(&self, ctx: &AccessContext) -> Result<bool> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.in_creation.load(Ordering::Acquire))
    }

    pub fn set_in_creation(&self, ctx: &AccessContext, in_creation: bool) -> Result<()> {
        self.gate(ctx, AccessType::Use)?;
        self.in_creation.store(in_creation, Ordering::Release);
        Ok(())
    }

    // =========================================================================
    // Snapshot Volume Definitions
    // =========================================================================

    pub fn snapshot_volume_definition(
        &self,
        ctx: &AccessContext,
        vlm_nr: VolumeNumber,
    ) -> Result<Option<Arc<SnapshotVolumeDefinition>>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.volume_definitions.get(&vlm_nr))
    }

    pub fn snapshot_volume_definitions(&self, ctx: &AccessContext) -> Result<Vec<Arc<SnapshotVolumeDefinition>>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.volume_definitions.values())
    }

    pub(crate) fn find_snapshot_volume_definition(&self, vlm_nr: VolumeNumber) -> Option<Arc<SnapshotVolumeDefinition>> {
        self.volume_definitions.get(&vlm_nr)
    }

    pub(crate) fn put_snapshot_volume_definition(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        snap_vlm_dfn: Arc<SnapshotVolumeDefinition>,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Use)?;
        let _guard = self.structure_lock.lock();
        self.volume_definitions
            .insert(tx, snap_vlm_dfn.volume_number(), snap_vlm_dfn)?;
        Ok(())
    }

    pub(crate) fn remove_snapshot_volume_definition(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        vlm_nr: VolumeNumber,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Use)?;
        let _guard = self.structure_lock.lock();
        self.volume_definitions.remove(tx, &vlm_nr)?;
        Ok(())
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    pub fn snapshot(&self, ctx: &AccessContext, node: &NodeName) -> Result<Option<Arc<Snapshot>>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.snapshots.get(node))
    }

    pub fn snapshots(&self, ctx: &AccessContext) -> Result<Vec<Arc<Snapshot>>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.snapshots.values())
    }

    pub fn snapshot_count(&self) -> Result<usize> {
        self.check_deleted()?;
        Ok(self.snapshots.len())
    }

    pub(crate) fn find_snapshot(&self, node: &NodeName) -> Option<Arc<Snapshot>> {
        self.snapshots.get(node)
    }

    pub(crate) fn put_snapshot(&self, ctx: &AccessContext, tx: &mut Transaction, snapshot: Arc<Snapshot>) -> Result<()> {
        self.gate(ctx, AccessType::Use)?;
        let _guard = self.structure_lock.lock();
        self.snapshots.insert(tx, snapshot.key().node.clone(), snapshot)?;
        Ok(())
    }

    pub(crate) fn remove_snapshot(&self, ctx: &AccessContext, tx: &mut Transaction, node: &NodeName) -> Result<()> {
        self.gate(ctx, AccessType::Use)?;
        let _guard = self.structure_lock.lock();
        self.snapshots.remove(tx, node)?;
        Ok(())
    }

    pub fn api_data(&self, ctx: &AccessContext) -> Result<SnapshotDefinitionApi> {
        self.gate(ctx, AccessType::View)?;
        let volume_definitions = self
            .volume_definitions
            .values()
            .iter()
            .map(|snap_vlm_dfn| snap_vlm_dfn.api_data(ctx))
            .collect::<Result<Vec<SnapshotVolumeDefinitionApi>>>()?;
        let snapshots = self
            .snapshots
            .values()
            .iter()
            .map(|snapshot| snapshot.api_data(ctx))
            .collect::<Result<Vec<SnapshotApi>>>()?;
        Ok(SnapshotDefinitionApi {
            uuid: self.uuid,
            rsc: self.key.rsc.display_name().to_string(),
            snapshot: self.key.snapshot.display_name().to_string(),
            flags: self.flags.raw_bits(),
            props: self.props.entries(),
            layer_stack: self.layer_stack.clone(),
            volume_definitions,
            snapshots,
        })
    }

    fn sub_objects(&self) -> Vec<&dyn TransactionObject> {
        vec![
            &self.flags,
            &self.props,
            &self.volume_definitions,
            &self.snapshots,
            &self.deleted,
        ]
    }

    fn child_objects(&self) -> Vec<Arc<dyn TransactionObject>> {
        let mut children: Vec<Arc<dyn TransactionObject>> = Vec::new();
        children.extend(self.volume_definitions.values().into_iter().map(|o| o as Arc<dyn TransactionObject>));
        children.extend(self.snapshots.values().into_iter().map(|o| o as Arc<dyn TransactionObject>));
        children
    }
}

composite_transaction_object!(SnapshotDefinition);

impl AccessControlled for SnapshotDefinition {
    fn object_description(&self) -> String {
        format!("SnapshotDefinition: {}", self.key)
    }

    fn is_deleted(&self) -> bool {
        self.deleted.get()
    }

    fn require_access(&self, ctx: &AccessContext, requested: AccessType) -> Result<()> {
        self.prot.require_access(ctx, requested)
    }
}

impl PropsOwner for SnapshotDefinition {
    fn props_container(&self) -> &Props {
        &self.props
    }
}

impl Deletable for SnapshotDefinition {
    fn mark_deleted(&self, ctx: &AccessContext, tx: &mut Transaction) -> Result<()> {
        self.check_deleted()?;
        self.flags
            .enable_flags_with(ctx, tx, AccessType::Use, &[SnapDfnFlag::Delete])?;
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

        // snapshots take their snapshot volumes along
        for snapshot in self.snapshots.values() {
            snapshot.delete(ctx, tx, objs)?;
        }
        for snap_vlm_dfn in self.volume_definitions.values() {
            snap_vlm_dfn.delete(ctx, tx, objs)?;
        }

        objs.resolve_rsc_dfn(&self.key.rsc)?
            .remove_snapshot_definition(ctx, tx, &self.key.snapshot)?;
        self.props.delete(tx)?;
        self.prot.delete(ctx, tx)?;
        tx.journal(DbOp::delete(ObjectKind::SnapshotDefinition, self.key.db_key()))?;
        tx.emit(CoreEvent::SnapshotDefinitionDeleted {
            rsc: self.key.rsc.display_name().to_string(),
            snapshot: self.key.snapshot.display_name().to_string(),
        });
        self.deleted.set(tx, true)?;

        info!(rsc = %self.key.rsc, snapshot = %self.key.snapshot, "snapshot definition deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::objects::test_support::Fixture;
    use crate::stateflags::SnapFlag;
    use assert_matches::assert_matches;

    #[test]
    fn test_snapshot_copies_live_state() {
        let fx = Fixture::new();
        let rsc_dfn = fx.deployed("data", &["alpha", "bravo"], 2);
        let snap_dfn = fx.snapshot_dfn("data", "snap1");

        assert_eq!(snap_dfn.snapshot_count().unwrap(), 2);
        assert_eq!(snap_dfn.snapshot_volume_definitions(&fx.ctx).unwrap().len(), 2);
        assert_eq!(
            snap_dfn.layer_stack(&fx.ctx).unwrap(),
            rsc_dfn.layer_stack(&fx.ctx).unwrap()
        );

        let snapshot = snap_dfn.snapshot(&fx.ctx, &fx.node_name("alpha")).unwrap().unwrap();
        assert!(snapshot.flags().unwrap().is_set(&fx.ctx, SnapFlag::TakeSnapshot).unwrap());
        assert_eq!(
            snapshot.node_id(&fx.ctx).unwrap(),
            fx.resource("alpha", "data").node_id(&fx.ctx).unwrap()
        );
        assert_eq!(snapshot.snapshot_volumes(&fx.ctx).unwrap().len(), 2);
        assert_eq!(fx.node("alpha").in_progress_snapshots(&fx.ctx).unwrap().len(), 1);
        assert_eq!(fx.stor_pool("alpha", "pool").snapshot_volumes(&fx.ctx).unwrap().len(), 2);
    }

    #[test]
    fn test_snapshot_survives_source_resize() {
        let fx = Fixture::new();
        fx.deployed("data", &["alpha"], 1);
        let snap_dfn = fx.snapshot_dfn("data", "snap1");
        let vlm_dfn = fx.vlm_dfn("data", 0);

        let mut tx = fx.tx();
        vlm_dfn.set_size_kib(&fx.ctx, &mut tx, 4 * Fixture::VOLUME_SIZE_KIB).unwrap();
        tx.commit().unwrap();

        let snap_vlm_dfn = snap_dfn
            .snapshot_volume_definition(&fx.ctx, vlm_dfn.volume_number())
            .unwrap()
            .unwrap();
        assert_eq!(snap_vlm_dfn.size_kib(&fx.ctx).unwrap(), Fixture::VOLUME_SIZE_KIB);
    }

    #[test]
    fn test_delete_cascade_order() {
        let fx = Fixture::new();
        fx.deployed("data", &["alpha", "bravo"], 1);
        let snap_dfn = fx.snapshot_dfn("data", "snap1");
        let snapshots = snap_dfn.snapshots(&fx.ctx).unwrap();

        let mut tx = fx.tx();
        snap_dfn.delete(&fx.ctx, &mut tx, &fx.objs).unwrap();
        let events = tx.pending_events().to_vec();
        tx.commit().unwrap();

        assert!(snapshots.iter().all(|snapshot| snapshot.is_deleted()));
        assert_matches!(events.last(), Some(CoreEvent::SnapshotDefinitionDeleted { .. }));
        assert_eq!(
            events
                .iter()
                .filter(|event| matches!(event, CoreEvent::SnapshotDeleted { .. }))
                .count(),
            2
        );
        assert!(fx.node("alpha").snapshots(&fx.ctx).unwrap().is_empty());
        assert!(fx.stor_pool("alpha", "pool").snapshot_volumes(&fx.ctx).unwrap().is_empty());
        assert!(fx
            .rsc_dfn("data")
            .snapshot_definition(&fx.ctx, &fx.snapshot_name("snap1"))
            .unwrap()
            .is_none());
        assert!(!fx.driver.contains(ObjectKind::SnapshotDefinition, &snap_dfn.key().db_key()));
        assert_matches!(snap_dfn.snapshots(&fx.ctx), Err(Error::AccessToDeletedData { .. }));
    }

    #[test]
    fn test_snapshot_volumes_block_pool_delete() {
        let fx = Fixture::new();
        fx.deployed("data", &["alpha"], 1);
        fx.snapshot_dfn("data", "snap1");
        let rsc = fx.resource("alpha", "data");
        let pool = fx.stor_pool("alpha", "pool");

        let mut tx = fx.tx();
        rsc.delete(&fx.ctx, &mut tx, &fx.objs).unwrap();
        assert_matches!(pool.delete(&fx.ctx, &mut tx, &fx.objs), Err(Error::InUse { .. }));
    }

    #[test]
    fn test_in_creation_is_runtime_state() {
        let fx = Fixture::new();
        fx.deployed("data", &["alpha"], 1);
        let snap_dfn = fx.snapshot_dfn("data", "snap1");

        snap_dfn.set_in_creation(&fx.ctx, true).unwrap();
        assert!(snap_dfn.in_creation(&fx.ctx).unwrap());
        assert!(!snap_dfn.is_dirty());
    }
}
