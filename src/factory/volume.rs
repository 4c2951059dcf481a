//! Volume definition, volume and volume connection factories

use super::{check_mirrored_uuid, check_not_loop};
use crate::error::{Error, Result};
use crate::events::CoreEvent;
use crate::identifier::{MinorNumber, VolumeNumber};
use crate::objects::{
    check_volume_size, AccessControlled, CoreObjects, DeviceLayerKind, DrbdVlmDfnData, NodePair,
    Resource, ResourceDefinition, StorPool, StorPoolKey, Volume, VolumeConnection,
    VolumeConnectionKey, VolumeDefinition, VolumeDefinitionKey, VolumeKey,
};
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::stateflags::{Flag, VlmDfnFlag, VlmFlag};
use crate::transaction::{DbOp, ObjectKind, Transaction};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

// =============================================================================
// Volume Definition
// =============================================================================

#[derive(Debug, Clone)]
pub struct VolumeDefinitionFactory {
    objs: Arc<CoreObjects>,
}

impl VolumeDefinitionFactory {
    pub fn new(objs: Arc<CoreObjects>) -> Self {
        Self { objs }
    }

    /// Add volume `vlm_nr` to `rsc_dfn`; needs CHANGE on the definition
    ///
    /// When the definition replicates through DRBD the volume gets `minor`
    /// from the minor number pool, or the next free minor when none is given.
    pub fn create(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        rsc_dfn: &ResourceDefinition,
        vlm_nr: VolumeNumber,
        minor: Option<MinorNumber>,
        size_kib: u64,
        flags: &[VlmDfnFlag],
    ) -> Result<Arc<VolumeDefinition>> {
        let _guard = self.objs.lock_structure();
        rsc_dfn.gate(ctx, AccessType::Change)?;
        let key = VolumeDefinitionKey::new(rsc_dfn.name().clone(), vlm_nr);
        if rsc_dfn.find_volume_definition(vlm_nr).is_some() {
            return Err(Error::already_exists("volume definition", &key));
        }
        check_volume_size(size_kib)?;

        let drbd = if rsc_dfn.uses_layer(ctx, DeviceLayerKind::Drbd)? {
            let pool = self.objs.minor_pool();
            let minor = match minor {
                Some(minor) => {
                    pool.allocate(tx, minor.value())?;
                    minor
                }
                None => MinorNumber::new(pool.auto_allocate(tx)?)?,
            };
            Some(DrbdVlmDfnData { minor })
        } else {
            None
        };

        let db_key = key.db_key();
        let vlm_dfn = Arc::new(VolumeDefinition::new(
            Uuid::new_v4(),
            key,
            Arc::clone(rsc_dfn.prot()?),
            size_kib,
            drbd,
            VlmDfnFlag::bits_of(flags),
        )?);
        rsc_dfn.put_volume_definition(ctx, tx, Arc::clone(&vlm_dfn))?;
        tx.journal(DbOp::create(ObjectKind::VolumeDefinition, db_key))?;
        tx.emit(CoreEvent::VolumeDefinitionCreated {
            rsc: rsc_dfn.name().display_name().to_string(),
            vlm_nr: vlm_nr.value(),
        });

        info!(
            volume_definition = %vlm_dfn.key(),
            size_kib,
            minor = ?drbd.map(|data| data.minor.value()),
            "volume definition created"
        );
        Ok(vlm_dfn)
    }

    pub fn get_instance_satellite(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        uuid: Uuid,
        rsc_dfn: &ResourceDefinition,
        vlm_nr: VolumeNumber,
        size_kib: u64,
        drbd: Option<DrbdVlmDfnData>,
        flag_bits: u64,
    ) -> Result<Arc<VolumeDefinition>> {
        let _guard = self.objs.lock_structure();
        if let Some(vlm_dfn) = rsc_dfn.find_volume_definition(vlm_nr) {
            check_mirrored_uuid(vlm_dfn.uuid()?, uuid, vlm_dfn.key())?;
            return Ok(vlm_dfn);
        }

        let key = VolumeDefinitionKey::new(rsc_dfn.name().clone(), vlm_nr);
        let vlm_dfn = Arc::new(VolumeDefinition::new(
            uuid,
            key,
            Arc::clone(rsc_dfn.prot()?),
            size_kib,
            drbd,
            flag_bits,
        )?);
        rsc_dfn.put_volume_definition(ctx, tx, Arc::clone(&vlm_dfn))?;

        debug!(volume_definition = %vlm_dfn.key(), "volume definition mirrored");
        Ok(vlm_dfn)
    }
}

// =============================================================================
// Volume
// =============================================================================

#[derive(Debug, Clone)]
pub struct VolumeFactory {
    objs: Arc<CoreObjects>,
}

impl VolumeFactory {
    pub fn new(objs: Arc<CoreObjects>) -> Self {
        Self { objs }
    }

    fn check_placement(rsc: &Resource, vlm_dfn: &VolumeDefinition, stor_pool: &StorPool) -> Result<VolumeKey> {
        if vlm_dfn.resource_name() != rsc.resource_name() {
            return Err(Error::not_found(
                "volume definition",
                VolumeDefinitionKey::new(rsc.resource_name().clone(), vlm_dfn.volume_number()),
            ));
        }
        if stor_pool.node_name() != rsc.node_name() {
            return Err(Error::not_found(
                "storage pool",
                StorPoolKey::new(rsc.node_name().clone(), stor_pool.name().clone()),
            ));
        }
        Ok(VolumeKey::new(
            rsc.node_name().clone(),
            rsc.resource_name().clone(),
            vlm_dfn.volume_number(),
        ))
    }

    /// Instantiate `vlm_dfn` inside `rsc`, placed on `stor_pool`
    ///
    /// The pool must belong to the resource's node. The volume definition's
    /// size is reserved with the pool's free space tracker until the storage
    /// layer confirms the creation.
    pub fn create(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        rsc: &Resource,
        vlm_dfn: &VolumeDefinition,
        stor_pool: &StorPool,
        flags: &[VlmFlag],
    ) -> Result<Arc<Volume>> {
        let _guard = self.objs.lock_structure();
        rsc.gate(ctx, AccessType::Use)?;
        let key = Self::check_placement(rsc, vlm_dfn, stor_pool)?;
        if rsc.find_volume(key.vlm_nr).is_some() {
            return Err(Error::already_exists("volume", &key));
        }

        let size_kib = vlm_dfn.size_kib(ctx)?;
        stor_pool.put_volume(ctx, tx, &key, size_kib)?;

        let db_key = key.db_key();
        let vlm = Arc::new(Volume::new(
            Uuid::new_v4(),
            key,
            Arc::clone(rsc.prot()?),
            stor_pool.name().clone(),
            VlmFlag::bits_of(flags),
        ));
        rsc.put_volume(ctx, tx, Arc::clone(&vlm))?;
        vlm_dfn.put_volume(ctx, tx, Arc::clone(&vlm))?;
        tx.journal(DbOp::create(ObjectKind::Volume, db_key))?;
        tx.emit(CoreEvent::VolumeCreated {
            node: rsc.node_name().display_name().to_string(),
            rsc: rsc.resource_name().display_name().to_string(),
            vlm_nr: vlm.volume_number().value(),
        });

        info!(volume = %vlm.key(), stor_pool = %stor_pool.name(), size_kib, "volume created");
        Ok(vlm)
    }

    /// Mirror a volume; the pool is linked without a reservation
    pub fn get_instance_satellite(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        uuid: Uuid,
        rsc: &Resource,
        vlm_dfn: &VolumeDefinition,
        stor_pool: &StorPool,
        flag_bits: u64,
    ) -> Result<Arc<Volume>> {
        let _guard = self.objs.lock_structure();
        if let Some(vlm) = rsc.find_volume(vlm_dfn.volume_number()) {
            check_mirrored_uuid(vlm.uuid()?, uuid, vlm.key())?;
            return Ok(vlm);
        }

        let key = Self::check_placement(rsc, vlm_dfn, stor_pool)?;
        stor_pool.link_volume(ctx, tx, &key)?;
        let vlm = Arc::new(Volume::new(
            uuid,
            key,
            Arc::clone(rsc.prot()?),
            stor_pool.name().clone(),
            flag_bits,
        ));
        rsc.put_volume(ctx, tx, Arc::clone(&vlm))?;
        vlm_dfn.put_volume(ctx, tx, Arc::clone(&vlm))?;

        debug!(volume = %vlm.key(), "volume mirrored");
        Ok(vlm)
    }
}

// =============================================================================
// Volume Connection
// =============================================================================

#[derive(Debug, Clone)]
pub struct VolumeConnectionFactory {
    objs: Arc<CoreObjects>,
}

impl VolumeConnectionFactory {
    pub fn new(objs: Arc<CoreObjects>) -> Self {
        Self { objs }
    }

    fn key_and_prots(&self, a: &Volume, b: &Volume) -> Result<(VolumeConnectionKey, [Arc<ObjectProtection>; 2])> {
        if a.key().rsc != b.key().rsc || a.volume_number() != b.volume_number() {
            return Err(Error::InvalidName {
                kind: "volume connection",
                name: format!("{} / {}", a.key(), b.key()),
                reason: "endpoints are not the same volume of one resource definition".into(),
            });
        }
        let nodes = NodePair::new(a.key().node.clone(), b.key().node.clone());
        check_not_loop("volume connection", &nodes)?;
        let (first, second) = if nodes.first() == &a.key().node { (a, b) } else { (b, a) };
        let prots = [
            Arc::clone(self.objs.resolve_resource(&first.key().resource_key())?.prot()?),
            Arc::clone(self.objs.resolve_resource(&second.key().resource_key())?.prot()?),
        ];
        let key = VolumeConnectionKey {
            nodes,
            rsc: a.key().rsc.clone(),
            vlm_nr: a.volume_number(),
        };
        Ok((key, prots))
    }

    /// Connect the same volume on two nodes; needs CHANGE on both
    pub fn create(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        a: &Volume,
        b: &Volume,
    ) -> Result<Arc<VolumeConnection>> {
        let _guard = self.objs.lock_structure();
        let (key, prots) = self.key_and_prots(a, b)?;
        a.gate(ctx, AccessType::Change)?;
        b.gate(ctx, AccessType::Change)?;
        if a.find_volume_connection(&b.key().node).is_some() {
            return Err(Error::already_exists("volume connection", &key));
        }

        let db_key = key.db_key();
        let conn = Arc::new(VolumeConnection::new(Uuid::new_v4(), key, prots));
        a.put_volume_connection(ctx, tx, Arc::clone(&conn))?;
        b.put_volume_connection(ctx, tx, Arc::clone(&conn))?;
        tx.journal(DbOp::create(ObjectKind::VolumeConnection, db_key))?;

        info!(connection = %conn.key(), "volume connection created");
        Ok(conn)
    }

    pub fn get_instance_satellite(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        uuid: Uuid,
        a: &Volume,
        b: &Volume,
    ) -> Result<Arc<VolumeConnection>> {
        let _guard = self.objs.lock_structure();
        if let Some(conn) = a.find_volume_connection(&b.key().node) {
            check_mirrored_uuid(conn.uuid()?, uuid, conn.key())?;
            return Ok(conn);
        }

        let (key, prots) = self.key_and_prots(a, b)?;
        let conn = Arc::new(VolumeConnection::new(uuid, key, prots));
        a.put_volume_connection(ctx, tx, Arc::clone(&conn))?;
        b.put_volume_connection(ctx, tx, Arc::clone(&conn))?;

        debug!(connection = %conn.key(), "volume connection mirrored");
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ControllerConfig, NumberRange};
    use crate::objects::test_support::Fixture;
    use crate::objects::{Deletable, DRBD_MAX_KIB, DRBD_MIN_NET_KIB};
    use assert_matches::assert_matches;

    fn create_vlm_dfn(
        fx: &Fixture,
        tx: &mut Transaction,
        rsc_dfn: &ResourceDefinition,
        vlm_nr: i32,
        minor: Option<i32>,
        size_kib: u64,
    ) -> Result<Arc<VolumeDefinition>> {
        fx.factories.vlm_dfn.create(
            &fx.ctx,
            tx,
            rsc_dfn,
            VolumeNumber::new(vlm_nr).unwrap(),
            minor.map(|minor| MinorNumber::new(minor).unwrap()),
            size_kib,
            &[],
        )
    }

    #[test]
    fn test_minor_numbers_rotate() {
        let fx = Fixture::new();
        let rsc_dfn = fx.rsc_dfn("data");

        let mut tx = fx.tx();
        let first = create_vlm_dfn(&fx, &mut tx, &rsc_dfn, 0, None, Fixture::VOLUME_SIZE_KIB).unwrap();
        let second = create_vlm_dfn(&fx, &mut tx, &rsc_dfn, 1, None, Fixture::VOLUME_SIZE_KIB).unwrap();
        tx.commit().unwrap();
        assert_eq!(first.minor_number(&fx.ctx).unwrap().unwrap().value(), 1000);
        assert_eq!(second.minor_number(&fx.ctx).unwrap().unwrap().value(), 1001);

        // a released minor is not handed out again right away
        let mut tx = fx.tx();
        first.delete(&fx.ctx, &mut tx, &fx.objs).unwrap();
        let third = create_vlm_dfn(&fx, &mut tx, &rsc_dfn, 2, None, Fixture::VOLUME_SIZE_KIB).unwrap();
        tx.commit().unwrap();
        assert_eq!(third.minor_number(&fx.ctx).unwrap().unwrap().value(), 1002);
    }

    #[test]
    fn test_size_checked_before_allocation() {
        let fx = Fixture::new();
        let rsc_dfn = fx.rsc_dfn("data");

        let mut tx = fx.tx();
        assert_matches!(
            create_vlm_dfn(&fx, &mut tx, &rsc_dfn, 0, None, DRBD_MIN_NET_KIB - 1),
            Err(Error::VolumeSizeTooLow { .. })
        );
        assert_matches!(
            create_vlm_dfn(&fx, &mut tx, &rsc_dfn, 0, None, DRBD_MAX_KIB + 1),
            Err(Error::VolumeSizeTooHigh { .. })
        );
        assert_eq!(fx.objs.minor_pool().allocated_count(), 0);
        assert_eq!(rsc_dfn.volume_definition_count().unwrap(), 0);
    }

    #[test]
    fn test_duplicate_volume_number() {
        let fx = Fixture::new();
        let rsc_dfn = fx.rsc_dfn("data");
        fx.vlm_dfn("data", 0);

        let mut tx = fx.tx();
        assert_matches!(
            create_vlm_dfn(&fx, &mut tx, &rsc_dfn, 0, Some(2000), Fixture::VOLUME_SIZE_KIB),
            Err(Error::DataAlreadyExists { .. })
        );
        assert!(!fx.objs.minor_pool().is_allocated(2000));
    }

    #[test]
    fn test_minor_pool_exhausted() {
        let config = ControllerConfig {
            minor_range: NumberRange::new(1000, 1000),
            ..ControllerConfig::default()
        };
        let fx = Fixture::with_config(config);
        let rsc_dfn = fx.rsc_dfn("data");
        fx.vlm_dfn("data", 0);

        let mut tx = fx.tx();
        assert_matches!(
            create_vlm_dfn(&fx, &mut tx, &rsc_dfn, 1, None, Fixture::VOLUME_SIZE_KIB),
            Err(Error::ExhaustedPool { pool, start: 1000, end: 1000 }) if pool == "minor number"
        );
    }

    #[test]
    fn test_volume_on_foreign_pool_rejected() {
        let fx = Fixture::new();
        fx.deployed("data", &["alpha"], 0);
        let vlm_dfn = fx.vlm_dfn("data", 0);
        let foreign = fx.stor_pool("bravo", "pool");

        let mut tx = fx.tx();
        assert_matches!(
            fx.factories.volume.create(
                &fx.ctx,
                &mut tx,
                &fx.resource("alpha", "data"),
                &vlm_dfn,
                &foreign,
                &[]
            ),
            Err(Error::NotFound { .. })
        );
        assert_eq!(foreign.volume_count().unwrap(), 0);
        assert_eq!(
            foreign.free_space_tracker(&fx.ctx).unwrap().reserved_capacity_kib(),
            0
        );
    }

    #[test]
    fn test_volume_indexed_everywhere() {
        let fx = Fixture::new();
        fx.deployed("data", &["alpha"], 1);
        let vlm = fx.volume("alpha", "data", 0);

        let rsc = fx.resource("alpha", "data");
        let from_rsc = rsc.volume(&fx.ctx, vlm.volume_number()).unwrap().unwrap();
        let from_dfn = fx
            .vlm_dfn("data", 0)
            .volume(&fx.ctx, rsc.node_name())
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&from_rsc, &from_dfn));
        assert_eq!(fx.stor_pool("alpha", "pool").volumes(&fx.ctx).unwrap(), vec![vlm.key().clone()]);
        assert!(fx.driver.contains(ObjectKind::Volume, &vlm.key().db_key()));
    }

    #[test]
    fn test_duplicate_volume() {
        let fx = Fixture::new();
        fx.deployed("data", &["alpha"], 1);

        let mut tx = fx.tx();
        assert_matches!(
            fx.factories.volume.create(
                &fx.ctx,
                &mut tx,
                &fx.resource("alpha", "data"),
                &fx.vlm_dfn("data", 0),
                &fx.stor_pool("alpha", "pool"),
                &[]
            ),
            Err(Error::DataAlreadyExists { .. })
        );
    }

    #[test]
    fn test_volume_connection_canonical() {
        let fx = Fixture::new();
        fx.deployed("data", &["alpha", "bravo"], 1);
        let alpha = fx.volume("alpha", "data", 0);
        let bravo = fx.volume("bravo", "data", 0);

        let mut tx = fx.tx();
        let conn = fx
            .factories
            .vlm_connection
            .create(&fx.ctx, &mut tx, &bravo, &alpha)
            .unwrap();
        assert_matches!(
            fx.factories.vlm_connection.create(&fx.ctx, &mut tx, &alpha, &bravo),
            Err(Error::DataAlreadyExists { .. })
        );
        tx.commit().unwrap();

        assert_eq!(conn.key().nodes.first(), &alpha.key().node);
        let from_alpha = alpha
            .volume_connection(&fx.ctx, &bravo.key().node)
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&from_alpha, &conn));
    }

    #[test]
    fn test_volume_connection_mismatched_volumes() {
        let fx = Fixture::new();
        fx.deployed("data", &["alpha", "bravo"], 2);

        let mut tx = fx.tx();
        assert_matches!(
            fx.factories.vlm_connection.create(
                &fx.ctx,
                &mut tx,
                &fx.volume("alpha", "data", 0),
                &fx.volume("bravo", "data", 1)
            ),
            Err(Error::InvalidName { .. })
        );
    }
}
