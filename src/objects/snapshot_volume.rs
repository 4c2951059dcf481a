//! Snapshot Volume
//!
//! A volume captured by a snapshot. It stays linked to the storage pool the
//! source volume was placed on, which keeps that pool from being deleted.

use super::{
    AccessControlled, CoreObjects, Props, PropsOwner, SnapshotDefinitionKey, SnapshotVolumeApi,
    SnapshotVolumeKey, StorPoolKey,
};
use crate::error::Result;
use crate::identifier::{StorPoolName, VolumeNumber};
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::transaction::{
    composite_transaction_object, DbOp, ObjectKind, Transaction, TransactionObject, TxCell,
};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug)]
pub struct SnapshotVolume {
    uuid: Uuid,
    key: SnapshotVolumeKey,
    prot: Arc<ObjectProtection>,
    stor_pool: StorPoolName,
    props: Props,
    deleted: TxCell<bool>,
}

impl SnapshotVolume {
    pub(crate) fn new(
        uuid: Uuid,
        key: SnapshotVolumeKey,
        snap_dfn_prot: Arc<ObjectProtection>,
        stor_pool: StorPoolName,
    ) -> Self {
        let props = Props::new(format!("/snapshotvolumes/{}", key.db_key()));
        Self {
            uuid,
            key,
            prot: snap_dfn_prot,
            stor_pool,
            props,
            deleted: TxCell::new(false),
        }
    }

    pub fn uuid(&self) -> Result<Uuid> {
        self.check_deleted()?;
        Ok(self.uuid)
    }

    pub fn key(&self) -> &SnapshotVolumeKey {
        &self.key
    }

    pub fn volume_number(&self) -> VolumeNumber {
        self.key.vlm_nr
    }

    pub fn stor_pool_name(&self, ctx: &AccessContext) -> Result<StorPoolName> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.stor_pool.clone())
    }

    pub fn api_data(&self, ctx: &AccessContext) -> Result<SnapshotVolumeApi> {
        self.gate(ctx, AccessType::View)?;
        Ok(SnapshotVolumeApi {
            uuid: self.uuid,
            vlm_nr: self.key.vlm_nr.value(),
            stor_pool: self.stor_pool.display_name().to_string(),
            props: self.props.entries(),
        })
    }

    /// Unlink from the pool, the snapshot and the snapshot volume definition
    pub fn delete(&self, ctx: &AccessContext, tx: &mut Transaction, objs: &CoreObjects) -> Result<()> {
        let _guard = objs.lock_structure();
        if self.is_deleted() {
            return Ok(());
        }
        self.prot.require_access(ctx, AccessType::Control)?;

        let pool_key = StorPoolKey::new(self.key.node.clone(), self.stor_pool.clone());
        objs.resolve_stor_pool(&pool_key)?
            .remove_snapshot_volume(ctx, tx, &self.key)?;
        objs.resolve_snapshot(&self.key.snapshot_key())?
            .remove_snapshot_volume(ctx, tx, self.key.vlm_nr)?;
        let dfn_key = SnapshotDefinitionKey::new(self.key.rsc.clone(), self.key.snapshot.clone());
        if let Some(snap_vlm_dfn) = objs
            .resolve_snapshot_dfn(&dfn_key)?
            .find_snapshot_volume_definition(self.key.vlm_nr)
        {
            snap_vlm_dfn.remove_snapshot_volume(ctx, tx, &self.key.node)?;
        }
        self.props.delete(tx)?;
        tx.journal(DbOp::delete(ObjectKind::SnapshotVolume, self.key.db_key()))?;
        self.deleted.set(tx, true)?;

        debug!(snapshot_volume = %self.key, "snapshot volume deleted");
        Ok(())
    }

    fn sub_objects(&self) -> Vec<&dyn TransactionObject> {
        vec![&self.props, &self.deleted]
    }

    fn child_objects(&self) -> Vec<Arc<dyn TransactionObject>> {
        Vec::new()
    }
}

composite_transaction_object!(SnapshotVolume);

impl AccessControlled for SnapshotVolume {
    fn object_description(&self) -> String {
        format!("SnapshotVolume: {}", self.key)
    }

    fn is_deleted(&self) -> bool {
        self.deleted.get()
    }

    fn require_access(&self, ctx: &AccessContext, requested: AccessType) -> Result<()> {
        self.prot.require_access(ctx, requested)
    }
}

impl PropsOwner for SnapshotVolume {
    fn props_container(&self) -> &Props {
        &self.props
    }
}
