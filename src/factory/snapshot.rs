//! Snapshot factories
//!
//! A snapshot definition is taken from the live state of a resource
//! definition: every volume definition gets a snapshot volume definition of
//! the same size, every resource with local storage gets a snapshot, and
//! every volume of those resources gets a snapshot volume in the pool the
//! volume lives in.

use super::check_mirrored_uuid;
use crate::error::{Error, Result};
use crate::events::CoreEvent;
use crate::identifier::{DrbdNodeId, SnapshotName, VolumeNumber};
use crate::objects::{
    AccessControlled, CoreObjects, DeviceLayerKind, Node, Resource, ResourceDefinition, Snapshot,
    SnapshotDefinition, SnapshotDefinitionKey, SnapshotKey, SnapshotVolume,
    SnapshotVolumeDefinition, SnapshotVolumeDefinitionKey, SnapshotVolumeKey, StorPool,
    VolumeDefinition,
};
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::stateflags::{Flag, SnapDfnFlag, SnapFlag, SnapVlmDfnFlag};
use crate::transaction::{DbOp, ObjectKind, Transaction};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

// =============================================================================
// Snapshot Definition
// =============================================================================

#[derive(Debug, Clone)]
pub struct SnapshotDefinitionFactory {
    objs: Arc<CoreObjects>,
}

impl SnapshotDefinitionFactory {
    pub fn new(objs: Arc<CoreObjects>) -> Self {
        Self { objs }
    }

    fn register(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        rsc_dfn: &ResourceDefinition,
        snap_dfn: &Arc<SnapshotDefinition>,
    ) -> Result<()> {
        rsc_dfn.put_snapshot_definition(ctx, tx, Arc::clone(snap_dfn))
    }

    /// Create an empty snapshot definition of `rsc_dfn`
    ///
    /// The layer stack is copied from the resource definition. Use
    /// [`take_snapshot`](Self::take_snapshot) to populate it from the
    /// deployed resources.
    pub fn create(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        rsc_dfn: &ResourceDefinition,
        name: SnapshotName,
        flags: &[SnapDfnFlag],
    ) -> Result<Arc<SnapshotDefinition>> {
        let _guard = self.objs.lock_structure();
        rsc_dfn.gate(ctx, AccessType::Use)?;
        let key = SnapshotDefinitionKey::new(rsc_dfn.name().clone(), name);
        if rsc_dfn.find_snapshot_definition(&key.snapshot).is_some() {
            return Err(Error::already_exists("snapshot definition", &key));
        }

        let layer_stack = rsc_dfn.layer_stack(ctx)?;
        let path = ObjectProtection::path_snapshot_definition(&key.rsc, &key.snapshot);
        let prot = ObjectProtection::create(ctx, tx, path)?;
        let snap_dfn = Arc::new(SnapshotDefinition::new(
            Uuid::new_v4(),
            key.clone(),
            prot,
            SnapDfnFlag::bits_of(flags),
            layer_stack,
        ));
        self.register(ctx, tx, rsc_dfn, &snap_dfn)?;
        tx.journal(DbOp::create(ObjectKind::SnapshotDefinition, key.db_key()))?;
        tx.emit(CoreEvent::SnapshotDefinitionCreated {
            rsc: key.rsc.display_name().to_string(),
            snapshot: key.snapshot.display_name().to_string(),
        });

        info!(rsc = %key.rsc, snapshot = %key.snapshot, "snapshot definition created");
        Ok(snap_dfn)
    }

    /// Take a snapshot of every resource of `rsc_dfn` that has local storage
    ///
    /// Diskless resources are skipped. The new snapshots carry
    /// [`SnapFlag::TakeSnapshot`] and the definition is marked in creation
    /// until the satellites report back.
    pub fn take_snapshot(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        rsc_dfn: &ResourceDefinition,
        name: SnapshotName,
    ) -> Result<Arc<SnapshotDefinition>> {
        let _guard = self.objs.lock_structure();
        let snap_dfn = self.create(ctx, tx, rsc_dfn, name, &[])?;

        let snap_vlm_dfn_factory = SnapshotVolumeDefinitionFactory::new(Arc::clone(&self.objs));
        let snapshot_factory = SnapshotFactory::new(Arc::clone(&self.objs));
        let snap_vlm_factory = SnapshotVolumeFactory::new(Arc::clone(&self.objs));

        for vlm_dfn in rsc_dfn.volume_definitions(ctx)? {
            snap_vlm_dfn_factory.create(ctx, tx, &snap_dfn, &vlm_dfn, &[])?;
        }

        for rsc in rsc_dfn.resources(ctx)? {
            if rsc.is_diskless(ctx)? {
                debug!(node = %rsc.node_name(), rsc = %rsc.resource_name(), "diskless resource skipped");
                continue;
            }
            let snapshot = snapshot_factory.create(ctx, tx, &snap_dfn, &rsc, &[SnapFlag::TakeSnapshot])?;
            for vlm in rsc.volumes(ctx)? {
                let snap_vlm_dfn = snap_dfn
                    .find_snapshot_volume_definition(vlm.volume_number())
                    .ok_or_else(|| {
                        Error::implementation(format!(
                            "volume {} has no volume definition in {}",
                            vlm.key(),
                            snap_dfn.key()
                        ))
                    })?;
                let stor_pool = vlm.stor_pool(ctx, &self.objs)?;
                snap_vlm_factory.create(ctx, tx, &snapshot, &snap_vlm_dfn, &stor_pool)?;
            }
        }

        snap_dfn.set_in_creation(ctx, true)?;
        info!(
            rsc = %rsc_dfn.name(),
            snapshot = %snap_dfn.name(),
            snapshots = snap_dfn.snapshot_count()?,
            "snapshot taken"
        );
        Ok(snap_dfn)
    }

    pub fn get_instance_satellite(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        uuid: Uuid,
        rsc_dfn: &ResourceDefinition,
        name: SnapshotName,
        layer_stack: Vec<DeviceLayerKind>,
        flag_bits: u64,
    ) -> Result<Arc<SnapshotDefinition>> {
        let _guard = self.objs.lock_structure();
        let key = SnapshotDefinitionKey::new(rsc_dfn.name().clone(), name);
        if let Some(snap_dfn) = rsc_dfn.find_snapshot_definition(&key.snapshot) {
            check_mirrored_uuid(snap_dfn.uuid()?, uuid, &key)?;
            return Ok(snap_dfn);
        }

        let path = ObjectProtection::path_snapshot_definition(&key.rsc, &key.snapshot);
        let prot = Arc::new(ObjectProtection::new(ctx, path));
        let snap_dfn = Arc::new(SnapshotDefinition::new(uuid, key, prot, flag_bits, layer_stack));
        self.register(ctx, tx, rsc_dfn, &snap_dfn)?;

        debug!(snapshot_definition = %snap_dfn.key(), "snapshot definition mirrored");
        Ok(snap_dfn)
    }
}

// =============================================================================
// Snapshot Volume Definition
// =============================================================================

#[derive(Debug, Clone)]
pub struct SnapshotVolumeDefinitionFactory {
    objs: Arc<CoreObjects>,
}

impl SnapshotVolumeDefinitionFactory {
    pub fn new(objs: Arc<CoreObjects>) -> Self {
        Self { objs }
    }

    fn build(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        uuid: Uuid,
        snap_dfn: &SnapshotDefinition,
        vlm_nr: VolumeNumber,
        size_kib: u64,
        flag_bits: u64,
    ) -> Result<Arc<SnapshotVolumeDefinition>> {
        let key = SnapshotVolumeDefinitionKey {
            rsc: snap_dfn.resource_name().clone(),
            snapshot: snap_dfn.name().clone(),
            vlm_nr,
        };
        let snap_vlm_dfn = Arc::new(SnapshotVolumeDefinition::new(
            uuid,
            key,
            Arc::clone(snap_dfn.prot()?),
            size_kib,
            flag_bits,
        ));
        snap_dfn.put_snapshot_volume_definition(ctx, tx, Arc::clone(&snap_vlm_dfn))?;
        Ok(snap_vlm_dfn)
    }

    /// Snapshot `vlm_dfn` into `snap_dfn`, freezing its current size
    pub fn create(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        snap_dfn: &SnapshotDefinition,
        vlm_dfn: &VolumeDefinition,
        flags: &[SnapVlmDfnFlag],
    ) -> Result<Arc<SnapshotVolumeDefinition>> {
        let _guard = self.objs.lock_structure();
        snap_dfn.gate(ctx, AccessType::Use)?;
        if vlm_dfn.resource_name() != snap_dfn.resource_name() {
            return Err(Error::not_found("volume definition", vlm_dfn.key()));
        }
        let vlm_nr = vlm_dfn.volume_number();
        if snap_dfn.find_snapshot_volume_definition(vlm_nr).is_some() {
            return Err(Error::already_exists(
                "snapshot volume definition",
                format!("{}, VlmNr: {}", snap_dfn.key(), vlm_nr),
            ));
        }

        let size_kib = vlm_dfn.size_kib(ctx)?;
        let snap_vlm_dfn = self.build(
            ctx,
            tx,
            Uuid::new_v4(),
            snap_dfn,
            vlm_nr,
            size_kib,
            SnapVlmDfnFlag::bits_of(flags),
        )?;
        tx.journal(DbOp::create(
            ObjectKind::SnapshotVolumeDefinition,
            snap_vlm_dfn.key().db_key(),
        ))?;

        debug!(snapshot_volume_definition = %snap_vlm_dfn.key(), size_kib, "snapshot volume definition created");
        Ok(snap_vlm_dfn)
    }

    pub fn get_instance_satellite(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        uuid: Uuid,
        snap_dfn: &SnapshotDefinition,
        vlm_nr: VolumeNumber,
        size_kib: u64,
        flag_bits: u64,
    ) -> Result<Arc<SnapshotVolumeDefinition>> {
        let _guard = self.objs.lock_structure();
        if let Some(snap_vlm_dfn) = snap_dfn.find_snapshot_volume_definition(vlm_nr) {
            check_mirrored_uuid(snap_vlm_dfn.uuid()?, uuid, snap_vlm_dfn.key())?;
            return Ok(snap_vlm_dfn);
        }
        self.build(ctx, tx, uuid, snap_dfn, vlm_nr, size_kib, flag_bits)
    }
}

// =============================================================================
// Snapshot
// =============================================================================

#[derive(Debug, Clone)]
pub struct SnapshotFactory {
    objs: Arc<CoreObjects>,
}

impl SnapshotFactory {
    pub fn new(objs: Arc<CoreObjects>) -> Self {
        Self { objs }
    }

    fn build(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        uuid: Uuid,
        snap_dfn: &SnapshotDefinition,
        node: &Node,
        node_id: DrbdNodeId,
        flag_bits: u64,
    ) -> Result<Arc<Snapshot>> {
        let key = SnapshotKey::new(
            node.name().clone(),
            snap_dfn.resource_name().clone(),
            snap_dfn.name().clone(),
        );
        let snapshot = Arc::new(Snapshot::new(
            uuid,
            key,
            Arc::clone(snap_dfn.prot()?),
            node_id,
            flag_bits,
        ));
        node.put_snapshot(ctx, tx, Arc::clone(&snapshot))?;
        snap_dfn.put_snapshot(ctx, tx, Arc::clone(&snapshot))?;
        Ok(snapshot)
    }

    /// Snapshot of `rsc` in `snap_dfn`, keeping the resource's DRBD node id
    pub fn create(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        snap_dfn: &SnapshotDefinition,
        rsc: &Resource,
        flags: &[SnapFlag],
    ) -> Result<Arc<Snapshot>> {
        let _guard = self.objs.lock_structure();
        snap_dfn.gate(ctx, AccessType::Use)?;
        rsc.gate(ctx, AccessType::Use)?;
        if rsc.resource_name() != snap_dfn.resource_name() {
            return Err(Error::not_found("resource", rsc.key()));
        }
        if snap_dfn.find_snapshot(rsc.node_name()).is_some() {
            return Err(Error::already_exists(
                "snapshot",
                SnapshotKey::new(
                    rsc.node_name().clone(),
                    snap_dfn.resource_name().clone(),
                    snap_dfn.name().clone(),
                ),
            ));
        }

        let node = self.objs.resolve_node(rsc.node_name())?;
        let snapshot = self.build(
            ctx,
            tx,
            Uuid::new_v4(),
            snap_dfn,
            &node,
            rsc.node_id(ctx)?,
            SnapFlag::bits_of(flags),
        )?;
        let key = snapshot.key();
        tx.journal(DbOp::create(ObjectKind::Snapshot, key.db_key()))?;
        tx.emit(CoreEvent::SnapshotCreated {
            node: key.node.display_name().to_string(),
            rsc: key.rsc.display_name().to_string(),
            snapshot: key.snapshot.display_name().to_string(),
        });

        info!(snapshot = %key, "snapshot created");
        Ok(snapshot)
    }

    pub fn get_instance_satellite(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        uuid: Uuid,
        snap_dfn: &SnapshotDefinition,
        node: &Node,
        node_id: DrbdNodeId,
        flag_bits: u64,
    ) -> Result<Arc<Snapshot>> {
        let _guard = self.objs.lock_structure();
        if let Some(snapshot) = snap_dfn.find_snapshot(node.name()) {
            check_mirrored_uuid(snapshot.uuid()?, uuid, snapshot.key())?;
            return Ok(snapshot);
        }
        self.build(ctx, tx, uuid, snap_dfn, node, node_id, flag_bits)
    }
}

// =============================================================================
// Snapshot Volume
// =============================================================================

#[derive(Debug, Clone)]
pub struct SnapshotVolumeFactory {
    objs: Arc<CoreObjects>,
}

impl SnapshotVolumeFactory {
    pub fn new(objs: Arc<CoreObjects>) -> Self {
        Self { objs }
    }

    fn build(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        uuid: Uuid,
        snapshot: &Snapshot,
        snap_vlm_dfn: &SnapshotVolumeDefinition,
        stor_pool: &StorPool,
    ) -> Result<Arc<SnapshotVolume>> {
        let snapshot_key = snapshot.key();
        if stor_pool.node_name() != &snapshot_key.node {
            return Err(Error::not_found("storage pool", stor_pool.key()));
        }
        if snap_vlm_dfn.key().rsc != snapshot_key.rsc
            || snap_vlm_dfn.key().snapshot != snapshot_key.snapshot
        {
            return Err(Error::not_found("snapshot volume definition", snap_vlm_dfn.key()));
        }

        let key = SnapshotVolumeKey {
            node: snapshot_key.node.clone(),
            rsc: snapshot_key.rsc.clone(),
            snapshot: snapshot_key.snapshot.clone(),
            vlm_nr: snap_vlm_dfn.volume_number(),
        };
        let snap_dfn = self.objs.resolve_snapshot_dfn(&snapshot_key.definition_key())?;
        let snap_vlm = Arc::new(SnapshotVolume::new(
            uuid,
            key.clone(),
            Arc::clone(snap_dfn.prot()?),
            stor_pool.name().clone(),
        ));
        stor_pool.put_snapshot_volume(ctx, tx, &key)?;
        snapshot.put_snapshot_volume(ctx, tx, Arc::clone(&snap_vlm))?;
        snap_vlm_dfn.put_snapshot_volume(ctx, tx, Arc::clone(&snap_vlm))?;
        Ok(snap_vlm)
    }

    /// Snapshot volume of `snapshot` in `stor_pool`, which must live on the
    /// snapshot's node
    pub fn create(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        snapshot: &Snapshot,
        snap_vlm_dfn: &SnapshotVolumeDefinition,
        stor_pool: &StorPool,
    ) -> Result<Arc<SnapshotVolume>> {
        let _guard = self.objs.lock_structure();
        snapshot.gate(ctx, AccessType::Use)?;
        let vlm_nr = snap_vlm_dfn.volume_number();
        if snapshot.snapshot_volume(ctx, vlm_nr)?.is_some() {
            return Err(Error::already_exists(
                "snapshot volume",
                format!("{}, VlmNr: {}", snapshot.key(), vlm_nr),
            ));
        }

        let snap_vlm = self.build(ctx, tx, Uuid::new_v4(), snapshot, snap_vlm_dfn, stor_pool)?;
        tx.journal(DbOp::create(ObjectKind::SnapshotVolume, snap_vlm.key().db_key()))?;

        debug!(snapshot_volume = %snap_vlm.key(), stor_pool = %stor_pool.name(), "snapshot volume created");
        Ok(snap_vlm)
    }

    pub fn get_instance_satellite(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        uuid: Uuid,
        snapshot: &Snapshot,
        snap_vlm_dfn: &SnapshotVolumeDefinition,
        stor_pool: &StorPool,
    ) -> Result<Arc<SnapshotVolume>> {
        let _guard = self.objs.lock_structure();
        if let Some(snap_vlm) = snapshot.snapshot_volume(ctx, snap_vlm_dfn.volume_number())? {
            check_mirrored_uuid(snap_vlm.uuid()?, uuid, snap_vlm.key())?;
            return Ok(snap_vlm);
        }
        self.build(ctx, tx, uuid, snapshot, snap_vlm_dfn, stor_pool)
    }
}
