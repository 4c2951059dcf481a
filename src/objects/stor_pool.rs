//! Storage Pool
//!
//! A storage pool definition instantiated on one node. The pool keeps the
//! set of volumes and snapshot volumes placed on it and reports capacity
//! through exactly one [`FreeSpaceTracker`].
//!
//! Access to a pool requires the level on both the node's and the
//! definition's protection.

use super::{
    AccessControlled, CoreObjects, DeviceProviderKind, FreeSpaceTracker, Props, PropsOwner,
    ReservationKey, SnapshotVolumeKey, StorPoolApi, StorPoolKey, VolumeKey,
    KEY_MAX_OVERSUBSCRIPTION_RATIO,
};
use crate::error::{Error, Result};
use crate::events::CoreEvent;
use crate::identifier::{FreeSpaceMgrName, NodeName, StorPoolName};
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::transaction::{
    composite_transaction_object, DbOp, ObjectKind, Transaction, TransactionObject, TxCell, TxMap,
};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug)]
pub struct StorPool {
    uuid: Uuid,
    key: StorPoolKey,
    provider: DeviceProviderKind,
    node_prot: Arc<ObjectProtection>,
    dfn_prot: Arc<ObjectProtection>,
    props: Props,
    tracker: Arc<FreeSpaceTracker>,
    volumes: TxMap<VolumeKey, ()>,
    snapshot_volumes: TxMap<SnapshotVolumeKey, ()>,
    /// Snapshot support reported by the storage layer, overrides the
    /// provider's static answer
    supports_snapshots: TxCell<Option<bool>>,
    deleted: TxCell<bool>,
}

impl StorPool {
    pub(crate) fn new(
        uuid: Uuid,
        key: StorPoolKey,
        provider: DeviceProviderKind,
        node_prot: Arc<ObjectProtection>,
        dfn_prot: Arc<ObjectProtection>,
        tracker: Arc<FreeSpaceTracker>,
    ) -> Self {
        let props = Props::new(format!("/storpools/{}", key.db_key()));
        Self {
            uuid,
            key,
            provider,
            node_prot,
            dfn_prot,
            props,
            tracker,
            volumes: TxMap::new(),
            snapshot_volumes: TxMap::new(),
            supports_snapshots: TxCell::new(None),
            deleted: TxCell::new(false),
        }
    }

    pub fn uuid(&self) -> Result<Uuid> {
        self.check_deleted()?;
        Ok(self.uuid)
    }

    pub fn key(&self) -> &StorPoolKey {
        &self.key
    }

    pub fn name(&self) -> &StorPoolName {
        &self.key.stor_pool
    }

    pub fn node_name(&self) -> &NodeName {
        &self.key.node
    }

    pub fn provider_kind(&self, ctx: &AccessContext) -> Result<DeviceProviderKind> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.provider)
    }

    pub fn free_space_mgr_name(&self) -> &FreeSpaceMgrName {
        self.tracker.name()
    }

    pub fn free_space_tracker(&self, ctx: &AccessContext) -> Result<Arc<FreeSpaceTracker>> {
        self.gate(ctx, AccessType::View)?;
        Ok(Arc::clone(&self.tracker))
    }

    /// Shares its tracker with other pools
    pub fn is_shared(&self) -> bool {
        !self
            .tracker
            .name()
            .is_default_for(&self.key.node, &self.key.stor_pool)
    }

    pub fn supports_snapshots(&self, ctx: &AccessContext) -> Result<bool> {
        self.gate(ctx, AccessType::View)?;
        Ok(self
            .supports_snapshots
            .get()
            .or_else(|| self.provider.supports_snapshots())
            .unwrap_or(false))
    }

    pub fn set_supports_snapshots(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        supported: bool,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Change)?;
        self.supports_snapshots.set(tx, Some(supported))?;
        Ok(())
    }

    /// Ratio by which the volumes of a thin pool may exceed its capacity
    ///
    /// The pool's own property wins over the definition's, which wins over
    /// the provider default.
    pub fn oversubscription_ratio(&self, ctx: &AccessContext, objs: &CoreObjects) -> Result<f64> {
        self.gate(ctx, AccessType::View)?;
        let configured = match self.props.get(KEY_MAX_OVERSUBSCRIPTION_RATIO) {
            Some(value) => Some(value),
            None => objs
                .resolve_stor_pool_dfn(&self.key.stor_pool)?
                .prop(ctx, KEY_MAX_OVERSUBSCRIPTION_RATIO)?,
        };
        match configured {
            Some(value) => value
                .parse::<f64>()
                .ok()
                .filter(|ratio| *ratio > 0.0)
                .ok_or_else(|| Error::InvalidName {
                    kind: "oversubscription ratio",
                    name: value.clone(),
                    reason: "must be a positive number".to_string(),
                }),
            None => Ok(self.provider.default_oversubscription_ratio()),
        }
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    pub fn volumes(&self, ctx: &AccessContext) -> Result<Vec<VolumeKey>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.volumes.keys())
    }

    pub fn volume_count(&self) -> Result<usize> {
        self.check_deleted()?;
        Ok(self.volumes.len())
    }

    pub(crate) fn find_volumes(&self) -> Vec<VolumeKey> {
        self.volumes.keys()
    }

    /// Place a volume here and reserve `size_kib` with the tracker until
    /// the storage layer confirms the creation
    pub(crate) fn put_volume(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        vlm_key: &VolumeKey,
        size_kib: u64,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Change)?;
        if self.provider.has_backing_device() {
            self.tracker.vlm_creating(
                ctx,
                tx,
                self,
                ReservationKey::Volume(vlm_key.clone()),
                size_kib,
            )?;
        }
        self.volumes.insert(tx, vlm_key.clone(), ())?;
        Ok(())
    }

    /// Place a volume without reserving capacity, for state mirrored from
    /// the controller
    pub(crate) fn link_volume(&self, ctx: &AccessContext, tx: &mut Transaction, vlm_key: &VolumeKey) -> Result<()> {
        self.gate(ctx, AccessType::Use)?;
        self.volumes.insert(tx, vlm_key.clone(), ())?;
        Ok(())
    }

    /// Unlink a volume; its reservation must have been released before
    pub(crate) fn remove_volume(&self, ctx: &AccessContext, tx: &mut Transaction, vlm_key: &VolumeKey) -> Result<()> {
        self.gate(ctx, AccessType::Use)?;
        if self.tracker.is_reserved(&ReservationKey::Volume(vlm_key.clone())) {
            error!(
                volume = %vlm_key,
                stor_pool = %self.key,
                "volume unlinked while still reserved"
            );
            return Err(Error::implementation(format!(
                "Volume ({}) unlinked from {} while its capacity is still reserved",
                vlm_key,
                self.object_description()
            )));
        }
        self.volumes.remove(tx, vlm_key)?;
        Ok(())
    }

    // =========================================================================
    // Snapshot Volumes
    // =========================================================================

    pub fn snapshot_volumes(&self, ctx: &AccessContext) -> Result<Vec<SnapshotVolumeKey>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.snapshot_volumes.keys())
    }

    pub(crate) fn put_snapshot_volume(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        key: &SnapshotVolumeKey,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Use)?;
        self.snapshot_volumes.insert(tx, key.clone(), ())?;
        Ok(())
    }

    pub(crate) fn remove_snapshot_volume(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        key: &SnapshotVolumeKey,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Use)?;
        self.snapshot_volumes.remove(tx, key)?;
        Ok(())
    }

    pub fn api_data(&self, ctx: &AccessContext) -> Result<StorPoolApi> {
        let supports_snapshots = self.supports_snapshots(ctx)?;
        Ok(StorPoolApi {
            uuid: self.uuid,
            node: self.key.node.display_name().to_string(),
            stor_pool: self.key.stor_pool.display_name().to_string(),
            provider_kind: self.provider,
            supports_snapshots,
            props: self.props.entries(),
            free_space: self.tracker.api_data(),
        })
    }

    /// Delete an empty pool; fails with [`Error::InUse`] while volumes or
    /// snapshot volumes are placed here
    pub fn delete(&self, ctx: &AccessContext, tx: &mut Transaction, objs: &CoreObjects) -> Result<()> {
        let _guard = objs.lock_structure();
        if self.is_deleted() {
            return Ok(());
        }
        self.require_access(ctx, AccessType::Control)?;
        if !self.volumes.is_empty() || !self.snapshot_volumes.is_empty() {
            return Err(Error::InUse {
                object: self.object_description(),
                reason: format!(
                    "{} volume(s) and {} snapshot volume(s) are placed on it",
                    self.volumes.len(),
                    self.snapshot_volumes.len()
                ),
            });
        }

        self.tracker.remove(ctx, tx, self)?;
        objs.resolve_node(&self.key.node)?
            .remove_stor_pool(ctx, tx, &self.key.stor_pool)?;
        objs.resolve_stor_pool_dfn(&self.key.stor_pool)?
            .remove_stor_pool(ctx, tx, &self.key.node)?;
        objs.release_tracker(tx, self.tracker.name())?;

        self.props.delete(tx)?;
        tx.journal(DbOp::delete(ObjectKind::StorPool, self.key.db_key()))?;
        tx.emit(CoreEvent::StorPoolDeleted {
            node: self.key.node.display_name().to_string(),
            stor_pool: self.key.stor_pool.display_name().to_string(),
        });
        self.deleted.set(tx, true)?;

        info!(stor_pool = %self.key, "storage pool deleted");
        Ok(())
    }

    fn sub_objects(&self) -> Vec<&dyn TransactionObject> {
        vec![
            &self.props,
            &self.volumes,
            &self.snapshot_volumes,
            &self.supports_snapshots,
            &self.deleted,
        ]
    }

    fn child_objects(&self) -> Vec<Arc<dyn TransactionObject>> {
        vec![Arc::clone(&self.tracker) as Arc<dyn TransactionObject>]
    }
}

composite_transaction_object!(StorPool);

impl AccessControlled for StorPool {
    fn object_description(&self) -> String {
        format!("StorPool: {}", self.key)
    }

    fn is_deleted(&self) -> bool {
        self.deleted.get()
    }

    fn require_access(&self, ctx: &AccessContext, requested: AccessType) -> Result<()> {
        self.node_prot.require_access(ctx, requested)?;
        self.dfn_prot.require_access(ctx, requested)
    }
}

impl PropsOwner for StorPool {
    fn props_container(&self) -> &Props {
        &self.props
    }
}
