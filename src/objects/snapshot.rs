//! Snapshot
//!
//! A snapshot definition taken on one node. The DRBD node id of the source
//! resource is copied at creation.

use super::{
    AccessControlled, CoreObjects, Deletable, Props, PropsOwner, SnapshotApi, SnapshotKey,
    SnapshotVolume, SnapshotVolumeApi,
};
use crate::error::Result;
use crate::events::CoreEvent;
use crate::identifier::{DrbdNodeId, NodeName, VolumeNumber};
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::stateflags::{SnapFlag, StateFlags};
use crate::transaction::{
    composite_transaction_object, DbOp, ObjectKind, Transaction, TransactionObject, TxCell, TxMap,
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug)]
pub struct Snapshot {
    uuid: Uuid,
    key: SnapshotKey,
    prot: Arc<ObjectProtection>,
    node_id: DrbdNodeId,
    flags: StateFlags<SnapFlag>,
    props: Props,
    snapshot_volumes: TxMap<VolumeNumber, Arc<SnapshotVolume>>,
    deleted: TxCell<bool>,
}

impl Snapshot {
    pub(crate) fn new(
        uuid: Uuid,
        key: SnapshotKey,
        snap_dfn_prot: Arc<ObjectProtection>,
        node_id: DrbdNodeId,
        initial_flags: u64,
    ) -> Self {
        let deleted = TxCell::new(false);
        let flags = StateFlags::new(
            vec![Arc::clone(&snap_dfn_prot)],
            ObjectKind::Snapshot,
            key.db_key(),
            initial_flags,
        )
        .guarded_by(&deleted);
        let props = Props::new(format!("/snapshots/{}", key.db_key()));
        Self {
            uuid,
            key,
            prot: snap_dfn_prot,
            node_id,
            flags,
            props,
            snapshot_volumes: TxMap::new(),
            deleted,
        }
    }

    pub fn uuid(&self) -> Result<Uuid> {
        self.check_deleted()?;
        Ok(self.uuid)
    }

    pub fn key(&self) -> &SnapshotKey {
        &self.key
    }

    pub fn node_name(&self) -> &NodeName {
        &self.key.node
    }

    pub fn flags(&self) -> Result<&StateFlags<SnapFlag>> {
        self.check_deleted()?;
        Ok(&self.flags)
    }

    pub fn node_id(&self, ctx: &AccessContext) -> Result<DrbdNodeId> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.node_id)
    }

    pub fn snapshot_volume(&self, ctx: &AccessContext, vlm_nr: VolumeNumber) -> Result<Option<Arc<SnapshotVolume>>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.snapshot_volumes.get(&vlm_nr))
    }

    pub fn snapshot_volumes(&self, ctx: &AccessContext) -> Result<Vec<Arc<SnapshotVolume>>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.snapshot_volumes.values())
    }

    pub(crate) fn put_snapshot_volume(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        snap_vlm: Arc<SnapshotVolume>,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Use)?;
        self.snapshot_volumes
            .insert(tx, snap_vlm.volume_number(), snap_vlm)?;
        Ok(())
    }

    pub(crate) fn remove_snapshot_volume(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        vlm_nr: VolumeNumber,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Use)?;
        self.snapshot_volumes.remove(tx, &vlm_nr)?;
        Ok(())
    }

    pub fn api_data(&self, ctx: &AccessContext) -> Result<SnapshotApi> {
        self.gate(ctx, AccessType::View)?;
        let volumes = self
            .snapshot_volumes
            .values()
            .iter()
            .map(|snap_vlm| snap_vlm.api_data(ctx))
            .collect::<Result<Vec<SnapshotVolumeApi>>>()?;
        Ok(SnapshotApi {
            uuid: self.uuid,
            node: self.key.node.display_name().to_string(),
            node_id: self.node_id.value(),
            flags: self.flags.raw_bits(),
            props: self.props.entries(),
            volumes,
        })
    }

    fn sub_objects(&self) -> Vec<&dyn TransactionObject> {
        vec![&self.flags, &self.props, &self.snapshot_volumes, &self.deleted]
    }

    fn child_objects(&self) -> Vec<Arc<dyn TransactionObject>> {
        self.snapshot_volumes
            .values()
            .into_iter()
            .map(|snap_vlm| snap_vlm as Arc<dyn TransactionObject>)
            .collect()
    }
}

composite_transaction_object!(Snapshot);

impl AccessControlled for Snapshot {
    fn object_description(&self) -> String {
        format!("Snapshot: {}", self.key)
    }

    fn is_deleted(&self) -> bool {
        self.deleted.get()
    }

    fn require_access(&self, ctx: &AccessContext, requested: AccessType) -> Result<()> {
        self.prot.require_access(ctx, requested)
    }
}

impl PropsOwner for Snapshot {
    fn props_container(&self) -> &Props {
        &self.props
    }
}

impl Deletable for Snapshot {
    fn mark_deleted(&self, ctx: &AccessContext, tx: &mut Transaction) -> Result<()> {
        self.check_deleted()?;
        self.flags
            .enable_flags_with(ctx, tx, AccessType::Use, &[SnapFlag::Delete])?;
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

        for snap_vlm in self.snapshot_volumes.values() {
            snap_vlm.delete(ctx, tx, objs)?;
        }

        let dfn_key = self.key.definition_key();
        objs.resolve_node(&self.key.node)?
            .remove_snapshot(ctx, tx, &dfn_key)?;
        objs.resolve_snapshot_dfn(&dfn_key)?
            .remove_snapshot(ctx, tx, &self.key.node)?;
        self.props.delete(tx)?;
        tx.journal(DbOp::delete(ObjectKind::Snapshot, self.key.db_key()))?;
        tx.emit(CoreEvent::SnapshotDeleted {
            node: self.key.node.display_name().to_string(),
            rsc: self.key.rsc.display_name().to_string(),
            snapshot: self.key.snapshot.display_name().to_string(),
        });
        self.deleted.set(tx, true)?;

        info!(snapshot = %self.key, "snapshot deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::test_support::Fixture;

    #[test]
    fn test_delete_single_snapshot() {
        let fx = Fixture::new();
        fx.deployed("data", &["alpha", "bravo"], 1);
        let snap_dfn = fx.snapshot_dfn("data", "snap1");
        let snapshot = snap_dfn.snapshot(&fx.ctx, &fx.node_name("alpha")).unwrap().unwrap();
        let snap_vlm_dfn = snap_dfn.snapshot_volume_definitions(&fx.ctx).unwrap().remove(0);

        let mut tx = fx.tx();
        snapshot.delete(&fx.ctx, &mut tx, &fx.objs).unwrap();
        tx.commit().unwrap();

        assert_eq!(snap_dfn.snapshot_count().unwrap(), 1);
        assert!(!fx.node("alpha").has_snapshots(&fx.ctx).unwrap());
        assert!(fx.node("bravo").has_snapshots(&fx.ctx).unwrap());
        assert_eq!(snap_vlm_dfn.snapshot_volumes(&fx.ctx).unwrap().len(), 1);
        assert!(fx.stor_pool("alpha", "pool").snapshot_volumes(&fx.ctx).unwrap().is_empty());
        assert!(!fx.driver.contains(ObjectKind::Snapshot, &snapshot.key().db_key()));
    }

    #[test]
    fn test_snapshot_outlives_source_resource() {
        let fx = Fixture::new();
        fx.deployed("data", &["alpha"], 1);
        let snap_dfn = fx.snapshot_dfn("data", "snap1");
        let rsc = fx.resource("alpha", "data");
        let node_id = rsc.node_id(&fx.ctx).unwrap();

        let mut tx = fx.tx();
        rsc.delete(&fx.ctx, &mut tx, &fx.objs).unwrap();
        tx.commit().unwrap();

        let snapshot = snap_dfn.snapshot(&fx.ctx, &fx.node_name("alpha")).unwrap().unwrap();
        assert_eq!(snapshot.node_id(&fx.ctx).unwrap(), node_id);
        let api = snapshot.api_data(&fx.ctx).unwrap();
        assert_eq!(api.volumes.len(), 1);
        assert_eq!(api.volumes[0].stor_pool, "pool");
    }

    #[test]
    fn test_suspend_flag_rolled_back() {
        let fx = Fixture::new();
        fx.deployed("data", &["alpha"], 1);
        let snap_dfn = fx.snapshot_dfn("data", "snap1");
        let snapshot = snap_dfn.snapshot(&fx.ctx, &fx.node_name("alpha")).unwrap().unwrap();

        let mut tx = fx.tx();
        snapshot
            .flags()
            .unwrap()
            .enable_flags(&fx.ctx, &mut tx, &[SnapFlag::Suspend])
            .unwrap();
        assert!(snapshot.is_dirty());
        tx.rollback();

        assert!(!snapshot.flags().unwrap().is_set(&fx.ctx, SnapFlag::Suspend).unwrap());
        assert!(!snapshot.is_dirty());
    }
}
