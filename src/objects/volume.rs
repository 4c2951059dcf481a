//! Volume
//!
//! A volume definition deployed as part of one resource. The volume is
//! placed on exactly one storage pool of its node and is guarded by the
//! resource's protection.

use super::{
    AccessControlled, CoreObjects, Deletable, Props, PropsOwner, ReservationKey, StorPool,
    StorPoolKey, VolumeApi, VolumeConnection, VolumeKey,
};
use crate::error::{Error, Result};
use crate::events::CoreEvent;
use crate::identifier::{NodeName, StorPoolName, VolumeNumber};
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::stateflags::{StateFlags, VlmFlag};
use crate::transaction::{
    composite_transaction_object, DbOp, ObjectKind, Transaction, TransactionObject, TxCell, TxMap,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Device details reported by the satellite once the volume is provisioned
///
/// Runtime only; rebuilt from the satellite's reports after a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDevice {
    pub device_path: Option<String>,
    pub backing_device: Option<String>,
    pub meta_disk: Option<String>,
    pub allocated_size_kib: Option<u64>,
    pub usable_size_kib: Option<u64>,
}

#[derive(Debug)]
pub struct Volume {
    uuid: Uuid,
    key: VolumeKey,
    prot: Arc<ObjectProtection>,
    flags: StateFlags<VlmFlag>,
    props: Props,
    stor_pool: TxCell<StorPoolName>,
    /// Keyed by the peer's node
    volume_connections: TxMap<NodeName, Arc<VolumeConnection>>,
    device: Mutex<VolumeDevice>,
    deleted: TxCell<bool>,
}

impl Volume {
    pub(crate) fn new(
        uuid: Uuid,
        key: VolumeKey,
        rsc_prot: Arc<ObjectProtection>,
        stor_pool: StorPoolName,
        initial_flags: u64,
    ) -> Self {
        let deleted = TxCell::new(false);
        let flags = StateFlags::new(vec![Arc::clone(&rsc_prot)], ObjectKind::Volume, key.db_key(), initial_flags).guarded_by(&deleted);
        let props = Props::new(format!("/volumes/{}", key.db_key()));
        Self {
            uuid,
            key,
            prot: rsc_prot,
            flags,
            props,
            stor_pool: TxCell::new(stor_pool),
            volume_connections: TxMap::new(),
            device: Mutex::new(VolumeDevice::default()),
            deleted,
        }
    }

    pub fn uuid(&self) -> Result<Uuid> {
        self.check_deleted()?;
        Ok(self.uuid)
    }

    pub fn key(&self) -> &VolumeKey {
        &self.key
    }

    pub fn volume_number(&self) -> VolumeNumber {
        self.key.vlm_nr
    }

    pub fn flags(&self) -> Result<&StateFlags<VlmFlag>> {
        self.check_deleted()?;
        Ok(&self.flags)
    }

    // =========================================================================
    // Storage Pool Placement
    // =========================================================================

    pub fn stor_pool_name(&self, ctx: &AccessContext) -> Result<StorPoolName> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.stor_pool.get())
    }

    pub fn stor_pool(&self, ctx: &AccessContext, objs: &CoreObjects) -> Result<Arc<StorPool>> {
        self.gate(ctx, AccessType::View)?;
        objs.resolve_stor_pool(&self.stor_pool_key())
    }

    fn stor_pool_key(&self) -> StorPoolKey {
        StorPoolKey::new(self.key.node.clone(), self.stor_pool.get())
    }

    /// Move the volume to another pool of the same node
    ///
    /// The reservation held in the old pool's tracker is released and the
    /// volume definition's size is reserved in the new one.
    pub fn set_stor_pool(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        objs: &CoreObjects,
        stor_pool: &StorPool,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Change)?;
        if stor_pool.node_name() != &self.key.node {
            return Err(Error::not_found(
                "storage pool",
                format!("'{}' on node '{}'", stor_pool.name(), self.key.node),
            ));
        }
        if stor_pool.name() == &self.stor_pool.get() {
            return Ok(());
        }

        let old_pool = objs.resolve_stor_pool(&self.stor_pool_key())?;
        old_pool
            .free_space_tracker(ctx)?
            .removing_volume(ctx, tx, &old_pool, &ReservationKey::Volume(self.key.clone()))?;
        old_pool.remove_volume(ctx, tx, &self.key)?;

        let size_kib = objs
            .resolve_vlm_dfn(&self.key.volume_definition_key())?
            .size_kib(ctx)?;
        stor_pool.put_volume(ctx, tx, &self.key, size_kib)?;
        self.stor_pool.set(tx, stor_pool.name().clone())?;
        tx.journal(DbOp::update(ObjectKind::Volume, self.key.db_key(), "stor_pool"))?;

        debug!(volume = %self.key, from = %old_pool.name(), to = %stor_pool.name(), "volume moved");
        Ok(())
    }

    // =========================================================================
    // Device State
    // =========================================================================

    pub fn device(&self, ctx: &AccessContext) -> Result<VolumeDevice> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.device.lock().clone())
    }

    pub fn update_device(&self, ctx: &AccessContext, f: impl FnOnce(&mut VolumeDevice)) -> Result<()> {
        self.gate(ctx, AccessType::Use)?;
        f(&mut self.device.lock());
        Ok(())
    }

    // =========================================================================
    // Volume Connections
    // =========================================================================

    pub fn volume_connection(&self, ctx: &AccessContext, peer: &NodeName) -> Result<Option<Arc<VolumeConnection>>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.volume_connections.get(peer))
    }

    pub fn volume_connections(&self, ctx: &AccessContext) -> Result<Vec<Arc<VolumeConnection>>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.volume_connections.values())
    }

    pub(crate) fn find_volume_connection(&self, peer: &NodeName) -> Option<Arc<VolumeConnection>> {
        self.volume_connections.get(peer)
    }

    pub(crate) fn put_volume_connection(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        conn: Arc<VolumeConnection>,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Change)?;
        let peer = conn
            .key()
            .nodes
            .other(&self.key.node)
            .cloned()
            .ok_or_else(|| {
                Error::implementation(format!("{} does not include {}", conn.key(), self.key))
            })?;
        self.volume_connections.insert(tx, peer, conn)?;
        Ok(())
    }

    pub(crate) fn remove_volume_connection(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        peer: &NodeName,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Change)?;
        self.volume_connections.remove(tx, peer)?;
        Ok(())
    }

    pub fn api_data(&self, ctx: &AccessContext) -> Result<VolumeApi> {
        self.gate(ctx, AccessType::View)?;
        let device = self.device.lock().clone();
        Ok(VolumeApi {
            uuid: self.uuid,
            vlm_nr: self.key.vlm_nr.value(),
            stor_pool: self.stor_pool.get().display_name().to_string(),
            device_path: device.device_path,
            allocated_size_kib: device.allocated_size_kib,
            usable_size_kib: device.usable_size_kib,
            flags: self.flags.raw_bits(),
            props: self.props.entries(),
        })
    }

    fn sub_objects(&self) -> Vec<&dyn TransactionObject> {
        vec![
            &self.flags,
            &self.props,
            &self.stor_pool,
            &self.volume_connections,
            &self.deleted,
        ]
    }

    fn child_objects(&self) -> Vec<Arc<dyn TransactionObject>> {
        self.volume_connections
            .values()
            .into_iter()
            .map(|conn| conn as Arc<dyn TransactionObject>)
            .collect()
    }
}

composite_transaction_object!(Volume);

impl AccessControlled for Volume {
    fn object_description(&self) -> String {
        format!("Volume: {}", self.key)
    }

    fn is_deleted(&self) -> bool {
        self.deleted.get()
    }

    fn require_access(&self, ctx: &AccessContext, requested: AccessType) -> Result<()> {
        self.prot.require_access(ctx, requested)
    }
}

impl PropsOwner for Volume {
    fn props_container(&self) -> &Props {
        &self.props
    }
}

impl Deletable for Volume {
    fn mark_deleted(&self, ctx: &AccessContext, tx: &mut Transaction) -> Result<()> {
        self.check_deleted()?;
        self.flags
            .enable_flags_with(ctx, tx, AccessType::Use, &[VlmFlag::Delete])?;
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

        for conn in self.volume_connections.values() {
            conn.delete(ctx, tx, objs)?;
        }

        let stor_pool = objs.resolve_stor_pool(&self.stor_pool_key())?;
        stor_pool
            .free_space_tracker(ctx)?
            .removing_volume(ctx, tx, &stor_pool, &ReservationKey::Volume(self.key.clone()))?;
        stor_pool.remove_volume(ctx, tx, &self.key)?;
        objs.resolve_resource(&self.key.resource_key())?
            .remove_volume(ctx, tx, self.key.vlm_nr)?;
        objs.resolve_vlm_dfn(&self.key.volume_definition_key())?
            .remove_volume(ctx, tx, &self.key.node)?;

        self.props.delete(tx)?;
        tx.journal(DbOp::delete(ObjectKind::Volume, self.key.db_key()))?;
        tx.emit(CoreEvent::VolumeDeleted {
            node: self.key.node.display_name().to_string(),
            rsc: self.key.rsc.display_name().to_string(),
            vlm_nr: self.key.vlm_nr.value(),
        });
        self.deleted.set(tx, true)?;

        info!(volume = %self.key, "volume deleted");
        Ok(())
    }
}
