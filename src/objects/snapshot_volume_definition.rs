//! Snapshot Volume Definition
//!
//! One volume of a snapshot definition with the size the volume definition
//! had when the snapshot was taken.

use super::{
    AccessControlled, CoreObjects, Deletable, Props, PropsOwner, SnapshotDefinitionKey,
    SnapshotVolume, SnapshotVolumeDefinitionApi, SnapshotVolumeDefinitionKey,
};
use crate::error::Result;
use crate::events::CoreEvent;
use crate::identifier::{NodeName, VolumeNumber};
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::stateflags::{SnapVlmDfnFlag, StateFlags};
use crate::transaction::{
    composite_transaction_object, DbOp, ObjectKind, Transaction, TransactionObject, TxCell, TxMap,
};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug)]
pub struct SnapshotVolumeDefinition {
    uuid: Uuid,
    key: SnapshotVolumeDefinitionKey,
    prot: Arc<ObjectProtection>,
    flags: StateFlags<SnapVlmDfnFlag>,
    props: Props,
    size_kib: u64,
    snapshot_volumes: TxMap<NodeName, Arc<SnapshotVolume>>,
    deleted: TxCell<bool>,
}

impl SnapshotVolumeDefinition {
    pub(crate) fn new(
        uuid: Uuid,
        key: SnapshotVolumeDefinitionKey,
        snap_dfn_prot: Arc<ObjectProtection>,
        size_kib: u64,
        initial_flags: u64,
    ) -> Self {
        let deleted = TxCell::new(false);
        let flags = StateFlags::new(
            vec![Arc::clone(&snap_dfn_prot)],
            ObjectKind::SnapshotVolumeDefinition,
            key.db_key(),
            initial_flags,
        )
        .guarded_by(&deleted);
        let props = Props::new(format!("/snapshotvolumedefinitions/{}", key.db_key()));
        Self {
            uuid,
            key,
            prot: snap_dfn_prot,
            flags,
            props,
            size_kib,
            snapshot_volumes: TxMap::new(),
            deleted,
        }
    }

    pub fn uuid(&self) -> Result<Uuid> {
        self.check_deleted()?;
        Ok(self.uuid)
    }

    pub fn key(&self) -> &SnapshotVolumeDefinitionKey {
        &self.key
    }

    pub fn volume_number(&self) -> VolumeNumber {
        self.key.vlm_nr
    }

    pub fn flags(&self) -> Result<&StateFlags<SnapVlmDfnFlag>> {
        self.check_deleted()?;
        Ok(&self.flags)
    }

    pub fn size_kib(&self, ctx: &AccessContext) -> Result<u64> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.size_kib)
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
            .insert(tx, snap_vlm.key().node.clone(), snap_vlm)?;
        Ok(())
    }

    pub(crate) fn remove_snapshot_volume(&self, ctx: &AccessContext, tx: &mut Transaction, node: &NodeName) -> Result<()> {
        self.gate(ctx, AccessType::Use)?;
        self.snapshot_volumes.remove(tx, node)?;
        Ok(())
    }

    pub fn api_data(&self, ctx: &AccessContext) -> Result<SnapshotVolumeDefinitionApi> {
        self.gate(ctx, AccessType::View)?;
        Ok(SnapshotVolumeDefinitionApi {
            uuid: self.uuid,
            vlm_nr: self.key.vlm_nr.value(),
            size_kib: self.size_kib,
            flags: self.flags.raw_bits(),
            props: self.props.entries(),
        })
    }

    fn sub_objects(&self) -> Vec<&dyn TransactionObject> {
        vec![&self.flags, &self.props, &self.snapshot_volumes, &self.deleted]
    }

    fn child_objects(&self) -> Vec<Arc<dyn TransactionObject>> {
        Vec::new()
    }
}

composite_transaction_object!(SnapshotVolumeDefinition);

impl AccessControlled for SnapshotVolumeDefinition {
    fn object_description(&self) -> String {
        format!("SnapshotVolumeDefinition: {}", self.key)
    }

    fn is_deleted(&self) -> bool {
        self.deleted.get()
    }

    fn require_access(&self, ctx: &AccessContext, requested: AccessType) -> Result<()> {
        self.prot.require_access(ctx, requested)
    }
}

impl PropsOwner for SnapshotVolumeDefinition {
    fn props_container(&self) -> &Props {
        &self.props
    }
}

impl Deletable for SnapshotVolumeDefinition {
    fn mark_deleted(&self, ctx: &AccessContext, tx: &mut Transaction) -> Result<()> {
        self.check_deleted()?;
        self.flags
            .enable_flags_with(ctx, tx, AccessType::Use, &[SnapVlmDfnFlag::Delete])?;
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

        let dfn_key = SnapshotDefinitionKey::new(self.key.rsc.clone(), self.key.snapshot.clone());
        objs.resolve_snapshot_dfn(&dfn_key)?
            .remove_snapshot_volume_definition(ctx, tx, self.key.vlm_nr)?;
        self.props.delete(tx)?;
        tx.journal(DbOp::delete(ObjectKind::SnapshotVolumeDefinition, self.key.db_key()))?;
        self.deleted.set(tx, true)?;

        debug!(snapshot_volume_definition = %self.key, "snapshot volume definition deleted");
        Ok(())
    }
}
