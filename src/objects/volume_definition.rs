//! Volume Definition
//!
//! One block device of a resource definition: its size and, when the
//! definition replicates, its minor number. Guarded by the resource
//! definition's protection.

use super::{
    AccessControlled, CoreObjects, Deletable, DrbdVlmDfnData, Props, PropsOwner, Volume,
    VolumeDefinitionApi, VolumeDefinitionKey,
};
use crate::error::{Error, Result};
use crate::events::CoreEvent;
use crate::identifier::{MinorNumber, NodeName, ResourceName, VolumeNumber};
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::stateflags::{StateFlags, VlmDfnFlag};
use crate::transaction::{
    composite_transaction_object, DbOp, ObjectKind, Transaction, TransactionObject, TxCell, TxMap,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Smallest volume the replication layer can carry over the network
pub const DRBD_MIN_NET_KIB: u64 = 4;

/// Largest volume the replication layer supports
pub const DRBD_MAX_KIB: u64 = 1 << 40;

/// Check a volume size against the replication layer's limits
pub fn check_volume_size(size_kib: u64) -> Result<()> {
    if size_kib < DRBD_MIN_NET_KIB {
        Err(Error::VolumeSizeTooLow {
            size_kib,
            min_kib: DRBD_MIN_NET_KIB,
        })
    } else if size_kib > DRBD_MAX_KIB {
        Err(Error::VolumeSizeTooHigh {
            size_kib,
            max_kib: DRBD_MAX_KIB,
        })
    } else {
        Ok(())
    }
}

#[derive(Debug)]
pub struct VolumeDefinition {
    uuid: Uuid,
    key: VolumeDefinitionKey,
    prot: Arc<ObjectProtection>,
    flags: StateFlags<VlmDfnFlag>,
    props: Props,
    size_kib: TxCell<u64>,
    drbd: TxCell<Option<DrbdVlmDfnData>>,
    volumes: TxMap<NodeName, Arc<Volume>>,
    deleted: TxCell<bool>,
    structure_lock: Mutex<()>,
}

impl VolumeDefinition {
    pub(crate) fn new(
        uuid: Uuid,
        key: VolumeDefinitionKey,
        rsc_dfn_prot: Arc<ObjectProtection>,
        size_kib: u64,
        drbd: Option<DrbdVlmDfnData>,
        initial_flags: u64,
    ) -> Result<Self> {
        check_volume_size(size_kib)?;
        let deleted = TxCell::new(false);
        let flags = StateFlags::new(
            vec![Arc::clone(&rsc_dfn_prot)],
            ObjectKind::VolumeDefinition,
            key.db_key(),
            initial_flags,
        )
        .guarded_by(&deleted);
        let props = Props::new(format!("/volumedefinitions/{}", key.db_key()));
        Ok(Self {
            uuid,
            key,
            prot: rsc_dfn_prot,
            flags,
            props,
            size_kib: TxCell::new(size_kib),
            drbd: TxCell::new(drbd),
            volumes: TxMap::new(),
            deleted,
            structure_lock: Mutex::new(()),
        })
    }

    pub fn uuid(&self) -> Result<Uuid> {
        self.check_deleted()?;
        Ok(self.uuid)
    }

    pub fn key(&self) -> &VolumeDefinitionKey {
        &self.key
    }

    pub fn volume_number(&self) -> VolumeNumber {
        self.key.vlm_nr
    }

    pub fn resource_name(&self) -> &ResourceName {
        &self.key.rsc
    }

    pub fn flags(&self) -> Result<&StateFlags<VlmDfnFlag>> {
        self.check_deleted()?;
        Ok(&self.flags)
    }

    pub fn size_kib(&self, ctx: &AccessContext) -> Result<u64> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.size_kib.get())
    }

    /// Resize; the previous size is returned
    pub fn set_size_kib(&self, ctx: &AccessContext, tx: &mut Transaction, size_kib: u64) -> Result<u64> {
        self.gate(ctx, AccessType::Change)?;
        check_volume_size(size_kib)?;
        let old = self.size_kib.set(tx, size_kib)?;
        tx.journal(DbOp::update(ObjectKind::VolumeDefinition, self.key.db_key(), "size_kib"))?;
        Ok(old)
    }

    pub fn minor_number(&self, ctx: &AccessContext) -> Result<Option<MinorNumber>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.drbd.get().map(|drbd| drbd.minor))
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    pub fn volume(&self, ctx: &AccessContext, node: &NodeName) -> Result<Option<Arc<Volume>>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.volumes.get(node))
    }

    pub fn volumes(&self, ctx: &AccessContext) -> Result<Vec<Arc<Volume>>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.volumes.values())
    }

    pub(crate) fn find_volumes(&self) -> Vec<Arc<Volume>> {
        self.volumes.values()
    }

    pub(crate) fn put_volume(&self, ctx: &AccessContext, tx: &mut Transaction, vlm: Arc<Volume>) -> Result<()> {
        self.gate(ctx, AccessType::Use)?;
        let _guard = self.structure_lock.lock();
        self.volumes.insert(tx, vlm.key().node.clone(), vlm)?;
        Ok(())
    }

    pub(crate) fn remove_volume(&self, ctx: &AccessContext, tx: &mut Transaction, node: &NodeName) -> Result<()> {
        self.gate(ctx, AccessType::Use)?;
        let _guard = self.structure_lock.lock();
        self.volumes.remove(tx, node)?;
        Ok(())
    }

    pub fn api_data(&self, ctx: &AccessContext) -> Result<VolumeDefinitionApi> {
        self.gate(ctx, AccessType::View)?;
        Ok(VolumeDefinitionApi {
            uuid: self.uuid,
            vlm_nr: self.key.vlm_nr.value(),
            size_kib: self.size_kib.get(),
            minor: self.drbd.get().map(|drbd| drbd.minor.value()),
            flags: self.flags.raw_bits(),
            props: self.props.entries(),
        })
    }

    fn sub_objects(&self) -> Vec<&dyn TransactionObject> {
        vec![
            &self.flags,
            &self.props,
            &self.size_kib,
            &self.drbd,
            &self.volumes,
            &self.deleted,
        ]
    }

    fn child_objects(&self) -> Vec<Arc<dyn TransactionObject>> {
        self.volumes
            .values()
            .into_iter()
            .map(|vlm| vlm as Arc<dyn TransactionObject>)
            .collect()
    }
}

composite_transaction_object!(VolumeDefinition);

impl AccessControlled for VolumeDefinition {
    fn object_description(&self) -> String {
        format!("VolumeDefinition: {}", self.key)
    }

    fn is_deleted(&self) -> bool {
        self.deleted.get()
    }

    fn require_access(&self, ctx: &AccessContext, requested: AccessType) -> Result<()> {
        self.prot.require_access(ctx, requested)
    }
}

impl PropsOwner for VolumeDefinition {
    fn props_container(&self) -> &Props {
        &self.props
    }
}

impl Deletable for VolumeDefinition {
    fn mark_deleted(&self, ctx: &AccessContext, tx: &mut Transaction) -> Result<()> {
        self.check_deleted()?;
        self.flags
            .enable_flags_with(ctx, tx, AccessType::Use, &[VlmDfnFlag::Delete])?;
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

        for vlm in self.volumes.values() {
            vlm.delete(ctx, tx, objs)?;
        }

        if let Some(drbd) = self.drbd.set(tx, None)? {
            objs.minor_pool().deallocate(tx, drbd.minor.value())?;
        }
        objs.resolve_rsc_dfn(&self.key.rsc)?
            .remove_volume_definition(ctx, tx, self.key.vlm_nr)?;
        self.props.delete(tx)?;
        tx.journal(DbOp::delete(ObjectKind::VolumeDefinition, self.key.db_key()))?;
        tx.emit(CoreEvent::VolumeDefinitionDeleted {
            rsc: self.key.rsc.display_name().to_string(),
            vlm_nr: self.key.vlm_nr.value(),
        });
        self.deleted.set(tx, true)?;

        info!(rsc = %self.key.rsc, vlm_nr = %self.key.vlm_nr, "volume definition deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::test_support::Fixture;
    use assert_matches::assert_matches;

    #[test]
    fn test_volume_size_bounds() {
        assert!(check_volume_size(DRBD_MIN_NET_KIB).is_ok());
        assert!(check_volume_size(DRBD_MAX_KIB).is_ok());
        assert_matches!(
            check_volume_size(DRBD_MIN_NET_KIB - 1),
            Err(Error::VolumeSizeTooLow { size_kib: 3, .. })
        );
        assert_matches!(
            check_volume_size(DRBD_MAX_KIB + 1),
            Err(Error::VolumeSizeTooHigh { .. })
        );
    }

    #[test]
    fn test_resize_validated() {
        let fx = Fixture::new();
        let vlm_dfn = fx.vlm_dfn("data", 0);
        let mut tx = fx.tx();

        assert_matches!(
            vlm_dfn.set_size_kib(&fx.ctx, &mut tx, 1),
            Err(Error::VolumeSizeTooLow { .. })
        );
        let old = vlm_dfn.set_size_kib(&fx.ctx, &mut tx, 2 * Fixture::VOLUME_SIZE_KIB).unwrap();
        assert_eq!(old, Fixture::VOLUME_SIZE_KIB);
        tx.rollback();
        assert_eq!(vlm_dfn.size_kib(&fx.ctx).unwrap(), Fixture::VOLUME_SIZE_KIB);
    }

    #[test]
    fn test_delete_releases_minor_and_volumes() {
        let fx = Fixture::new();
        let rsc_dfn = fx.deployed("data", &["alpha", "bravo"], 1);
        let vlm_dfn = fx.vlm_dfn("data", 0);
        let minor = vlm_dfn.minor_number(&fx.ctx).unwrap().unwrap();
        let volumes = vlm_dfn.volumes(&fx.ctx).unwrap();
        assert_eq!(volumes.len(), 2);

        let mut tx = fx.tx();
        vlm_dfn.delete(&fx.ctx, &mut tx, &fx.objs).unwrap();
        tx.commit().unwrap();

        assert!(volumes.iter().all(|vlm| vlm.is_deleted()));
        assert!(!fx.objs.minor_pool().is_allocated(minor.value()));
        assert_eq!(rsc_dfn.volume_definition_count().unwrap(), 0);
        assert_eq!(fx.resource("alpha", "data").volume_count().unwrap(), 0);
        assert_matches!(vlm_dfn.size_kib(&fx.ctx), Err(Error::AccessToDeletedData { .. }));
    }
}
