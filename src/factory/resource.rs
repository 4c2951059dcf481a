//! Resource definition, resource and resource connection factories

use super::{check_mirrored_uuid, check_not_loop};
use crate::error::{Error, Result};
use crate::events::CoreEvent;
use crate::identifier::{DrbdNodeId, ResourceName, TcpPortNumber};
use crate::numberpool::get_free_number;
use crate::objects::{
    default_layer_stack, validate_layer_stack, AccessControlled, CoreObjects, DeviceLayerKind,
    DrbdRscDfnData, Node, NodePair, Props, Resource, ResourceConnection, ResourceConnectionKey,
    ResourceDefinition, ResourceKey,
};
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::stateflags::{ConnFlag, Flag, RscDfnFlag, RscFlag};
use crate::transaction::{DbOp, ObjectKind, Transaction};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

// =============================================================================
// Resource Definition
// =============================================================================

#[derive(Debug, Clone)]
pub struct ResourceDefinitionFactory {
    objs: Arc<CoreObjects>,
}

impl ResourceDefinitionFactory {
    pub fn new(objs: Arc<CoreObjects>) -> Self {
        Self { objs }
    }

    /// Create and register a resource definition
    ///
    /// Without an explicit stack the default DRBD over STORAGE stack is used.
    /// A stack containing DRBD takes `tcp_port` from the TCP port pool, or
    /// the next free port when none is given.
    pub fn create(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        name: ResourceName,
        tcp_port: Option<TcpPortNumber>,
        layer_stack: Option<Vec<DeviceLayerKind>>,
        flags: &[RscDfnFlag],
    ) -> Result<Arc<ResourceDefinition>> {
        let _guard = self.objs.lock_structure();
        self.objs
            .rsc_dfn_map_prot()
            .require_access(ctx, AccessType::Change)?;
        if self.objs.find_rsc_dfn(&name).is_some() {
            return Err(Error::already_exists("resource definition", &name));
        }

        let layer_stack = layer_stack.unwrap_or_else(default_layer_stack);
        validate_layer_stack(&layer_stack)?;

        let drbd = if layer_stack.contains(&DeviceLayerKind::Drbd) {
            let pool = self.objs.tcp_port_pool();
            let port = match tcp_port {
                Some(port) => {
                    pool.allocate(tx, port.value())?;
                    port
                }
                None => TcpPortNumber::new(pool.auto_allocate(tx)?)?,
            };
            Some(DrbdRscDfnData::new(port, self.objs.config().default_peer_slots))
        } else {
            None
        };
        let port = drbd.as_ref().map(|data| data.tcp_port);

        let path = ObjectProtection::path_resource_definition(&name);
        let prot = ObjectProtection::create(ctx, tx, path.clone())?;
        let rsc_dfn = Arc::new(ResourceDefinition::new(
            Uuid::new_v4(),
            name.clone(),
            prot,
            RscDfnFlag::bits_of(flags),
            layer_stack,
            drbd,
            Props::new(path),
        ));
        self.objs.put_rsc_dfn(tx, Arc::clone(&rsc_dfn))?;
        tx.journal(DbOp::create(ObjectKind::ResourceDefinition, name.value()))?;
        tx.emit(CoreEvent::ResourceDefinitionCreated {
            rsc: name.display_name().to_string(),
            uuid: rsc_dfn.uuid()?,
        });

        info!(rsc = %name, port = ?port, "resource definition created");
        Ok(rsc_dfn)
    }

    /// Mirror a resource definition with the replication data the
    /// controller allocated
    pub fn get_instance_satellite(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        uuid: Uuid,
        name: ResourceName,
        layer_stack: Vec<DeviceLayerKind>,
        drbd: Option<DrbdRscDfnData>,
        flag_bits: u64,
    ) -> Result<Arc<ResourceDefinition>> {
        let _guard = self.objs.lock_structure();
        if let Some(rsc_dfn) = self.objs.find_rsc_dfn(&name) {
            check_mirrored_uuid(rsc_dfn.uuid()?, uuid, &name)?;
            return Ok(rsc_dfn);
        }

        let path = ObjectProtection::path_resource_definition(&name);
        let prot = Arc::new(ObjectProtection::new(ctx, path.clone()));
        let rsc_dfn = Arc::new(ResourceDefinition::new(
            uuid,
            name,
            prot,
            flag_bits,
            layer_stack,
            drbd,
            Props::new(path),
        ));
        self.objs.put_rsc_dfn(tx, Arc::clone(&rsc_dfn))?;

        debug!(rsc = %rsc_dfn.name(), "resource definition mirrored");
        Ok(rsc_dfn)
    }
}

// =============================================================================
// Resource
// =============================================================================

#[derive(Debug, Clone)]
pub struct ResourceFactory {
    objs: Arc<CoreObjects>,
}

impl ResourceFactory {
    pub fn new(objs: Arc<CoreObjects>) -> Self {
        Self { objs }
    }

    /// DRBD node id for a new resource of `rsc_dfn`
    ///
    /// Node ids are unique within a resource definition; without a request
    /// the lowest free id is taken.
    fn node_id_for(rsc_dfn: &ResourceDefinition, requested: Option<DrbdNodeId>) -> Result<DrbdNodeId> {
        let mut used: Vec<i32> = rsc_dfn
            .find_resources()
            .iter()
            .map(|rsc| rsc.raw_node_id().value())
            .collect();
        used.sort_unstable();

        match requested {
            Some(node_id) if used.binary_search(&node_id.value()).is_ok() => Err(Error::ValueInUse {
                kind: "DRBD node id",
                value: node_id.value() as i64,
            }),
            Some(node_id) => Ok(node_id),
            None => {
                let nr = get_free_number(&used, DrbdNodeId::MIN, DrbdNodeId::MIN, DrbdNodeId::MAX)
                    .map_err(|_| Error::ExhaustedPool {
                        pool: "DRBD node id".into(),
                        start: DrbdNodeId::MIN,
                        end: DrbdNodeId::MAX,
                    })?;
                DrbdNodeId::new(nr)
            }
        }
    }

    /// Place `rsc_dfn` on `node`; needs USE on both
    pub fn create(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        rsc_dfn: &ResourceDefinition,
        node: &Node,
        node_id: Option<DrbdNodeId>,
        flags: &[RscFlag],
    ) -> Result<Arc<Resource>> {
        let _guard = self.objs.lock_structure();
        rsc_dfn.gate(ctx, AccessType::Use)?;
        node.gate(ctx, AccessType::Use)?;
        let key = ResourceKey::new(node.name().clone(), rsc_dfn.name().clone());
        if rsc_dfn.find_resource(node.name()).is_some() {
            return Err(Error::already_exists("resource", &key));
        }
        let node_id = Self::node_id_for(rsc_dfn, node_id)?;

        let path = ObjectProtection::path_resource(&key.node, &key.rsc);
        let prot = ObjectProtection::create(ctx, tx, path.clone())?;
        let db_key = key.db_key();
        let rsc = Arc::new(Resource::new(
            Uuid::new_v4(),
            key,
            prot,
            node_id,
            RscFlag::bits_of(flags),
            Props::new(path),
        ));
        node.put_resource(ctx, tx, Arc::clone(&rsc))?;
        rsc_dfn.put_resource(ctx, tx, Arc::clone(&rsc))?;
        tx.journal(DbOp::create(ObjectKind::Resource, db_key))?;
        tx.emit(CoreEvent::ResourceCreated {
            node: node.name().display_name().to_string(),
            rsc: rsc_dfn.name().display_name().to_string(),
            uuid: rsc.uuid()?,
        });

        info!(resource = %rsc.key(), node_id = %node_id, "resource created");
        Ok(rsc)
    }

    pub fn get_instance_satellite(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        uuid: Uuid,
        rsc_dfn: &ResourceDefinition,
        node: &Node,
        node_id: DrbdNodeId,
        flag_bits: u64,
    ) -> Result<Arc<Resource>> {
        let _guard = self.objs.lock_structure();
        if let Some(rsc) = rsc_dfn.find_resource(node.name()) {
            check_mirrored_uuid(rsc.uuid()?, uuid, rsc.key())?;
            return Ok(rsc);
        }

        let key = ResourceKey::new(node.name().clone(), rsc_dfn.name().clone());
        let path = ObjectProtection::path_resource(&key.node, &key.rsc);
        let prot = Arc::new(ObjectProtection::new(ctx, path.clone()));
        let rsc = Arc::new(Resource::new(uuid, key, prot, node_id, flag_bits, Props::new(path)));
        node.put_resource(ctx, tx, Arc::clone(&rsc))?;
        rsc_dfn.put_resource(ctx, tx, Arc::clone(&rsc))?;

        debug!(resource = %rsc.key(), "resource mirrored");
        Ok(rsc)
    }
}

// =============================================================================
// Resource Connection
// =============================================================================

#[derive(Debug, Clone)]
pub struct ResourceConnectionFactory {
    objs: Arc<CoreObjects>,
}

impl ResourceConnectionFactory {
    pub fn new(objs: Arc<CoreObjects>) -> Self {
        Self { objs }
    }

    fn key_and_prots(a: &Resource, b: &Resource) -> Result<(ResourceConnectionKey, [Arc<ObjectProtection>; 2])> {
        if a.resource_name() != b.resource_name() {
            return Err(Error::InvalidName {
                kind: "resource connection",
                name: format!("{} / {}", a.key(), b.key()),
                reason: "endpoints belong to different resource definitions".into(),
            });
        }
        let nodes = NodePair::new(a.node_name().clone(), b.node_name().clone());
        check_not_loop("resource connection", &nodes)?;
        let (first, second) = if nodes.first() == a.node_name() { (a, b) } else { (b, a) };
        let prots = [Arc::clone(first.prot()?), Arc::clone(second.prot()?)];
        let key = ResourceConnectionKey {
            nodes,
            rsc: a.resource_name().clone(),
        };
        Ok((key, prots))
    }

    /// Connect two resources of the same definition; needs CHANGE on both
    pub fn create(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        a: &Resource,
        b: &Resource,
        flags: &[ConnFlag],
    ) -> Result<Arc<ResourceConnection>> {
        let _guard = self.objs.lock_structure();
        let (key, prots) = Self::key_and_prots(a, b)?;
        a.gate(ctx, AccessType::Change)?;
        b.gate(ctx, AccessType::Change)?;
        if a.find_connection(b.node_name()).is_some() {
            return Err(Error::already_exists("resource connection", &key));
        }

        let db_key = key.db_key();
        let conn = Arc::new(ResourceConnection::new(
            Uuid::new_v4(),
            key,
            prots,
            ConnFlag::bits_of(flags),
            None,
        ));
        a.put_connection(ctx, tx, Arc::clone(&conn))?;
        b.put_connection(ctx, tx, Arc::clone(&conn))?;
        tx.journal(DbOp::create(ObjectKind::ResourceConnection, db_key))?;

        info!(connection = %conn.key(), "resource connection created");
        Ok(conn)
    }

    pub fn get_instance_satellite(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        uuid: Uuid,
        a: &Resource,
        b: &Resource,
        flag_bits: u64,
        drbd_proxy_port: Option<TcpPortNumber>,
    ) -> Result<Arc<ResourceConnection>> {
        let _guard = self.objs.lock_structure();
        if let Some(conn) = a.find_connection(b.node_name()) {
            check_mirrored_uuid(conn.uuid()?, uuid, conn.key())?;
            return Ok(conn);
        }

        let (key, prots) = Self::key_and_prots(a, b)?;
        let conn = Arc::new(ResourceConnection::new(uuid, key, prots, flag_bits, drbd_proxy_port));
        a.put_connection(ctx, tx, Arc::clone(&conn))?;
        b.put_connection(ctx, tx, Arc::clone(&conn))?;

        debug!(connection = %conn.key(), "resource connection mirrored");
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::test_support::Fixture;
    use crate::objects::Deletable;
    use crate::transaction::TransactionMgr;
    use assert_matches::assert_matches;

    fn create_rsc_dfn(
        fx: &Fixture,
        tx: &mut Transaction,
        name: &str,
        port: Option<i32>,
        stack: Option<Vec<DeviceLayerKind>>,
    ) -> Result<Arc<ResourceDefinition>> {
        fx.factories.rsc_dfn.create(
            &fx.ctx,
            tx,
            fx.rsc_name(name),
            port.map(|port| TcpPortNumber::new(port).unwrap()),
            stack,
            &[],
        )
    }

    #[test]
    fn test_ports_allocated_in_order() {
        let fx = Fixture::new();
        let mut tx = fx.tx();
        let first = create_rsc_dfn(&fx, &mut tx, "first", None, None).unwrap();
        let second = create_rsc_dfn(&fx, &mut tx, "second", None, None).unwrap();
        tx.commit().unwrap();

        assert_eq!(first.tcp_port(&fx.ctx).unwrap().unwrap().value(), 7000);
        assert_eq!(second.tcp_port(&fx.ctx).unwrap().unwrap().value(), 7001);
        assert_eq!(fx.objs.tcp_port_pool().allocated_count(), 2);
        let drbd = first.drbd_data(&fx.ctx).unwrap().unwrap();
        assert_eq!(drbd.peer_slots, fx.objs.config().default_peer_slots);
    }

    #[test]
    fn test_explicit_port_in_use() {
        let fx = Fixture::new();
        let mut tx = fx.tx();
        create_rsc_dfn(&fx, &mut tx, "first", Some(7100), None).unwrap();
        assert_matches!(
            create_rsc_dfn(&fx, &mut tx, "second", Some(7100), None),
            Err(Error::ValueInUse { value: 7100, .. })
        );
        assert_eq!(fx.objs.resource_definition_count(), 1);
    }

    #[test]
    fn test_stack_without_drbd_takes_no_port() {
        let fx = Fixture::new();
        let mut tx = fx.tx();
        let rsc_dfn =
            create_rsc_dfn(&fx, &mut tx, "plain", None, Some(vec![DeviceLayerKind::Storage])).unwrap();
        tx.commit().unwrap();

        assert!(rsc_dfn.tcp_port(&fx.ctx).unwrap().is_none());
        assert_eq!(fx.objs.tcp_port_pool().allocated_count(), 0);
    }

    #[test]
    fn test_invalid_stack_rejected() {
        let fx = Fixture::new();
        let mut tx = fx.tx();
        assert_matches!(
            create_rsc_dfn(&fx, &mut tx, "bad", None, Some(vec![DeviceLayerKind::Drbd])),
            Err(Error::InvalidName { kind: "layer stack", .. })
        );
        assert_eq!(fx.objs.tcp_port_pool().allocated_count(), 0);
    }

    #[test]
    fn test_rollback_returns_port() {
        let fx = Fixture::new();
        let mut tx = fx.tx();
        create_rsc_dfn(&fx, &mut tx, "data", None, None).unwrap();
        tx.rollback();

        assert_eq!(fx.objs.tcp_port_pool().allocated_count(), 0);
        assert_eq!(fx.objs.resource_definition_count(), 0);
    }

    #[test]
    fn test_port_released_by_open_delete_not_reused() {
        let fx = Fixture::new();
        let mut setup = fx.tx();
        let old = create_rsc_dfn(&fx, &mut setup, "old", Some(7100), None).unwrap();
        setup.commit().unwrap();

        let mut deleting = fx.tx();
        old.delete(&fx.ctx, &mut deleting, &fx.objs).unwrap();

        let mut creating = fx.tx();
        assert_matches!(
            create_rsc_dfn(&fx, &mut creating, "new", Some(7100), None),
            Err(Error::ValueInUse { value: 7100, .. })
        );
        let other = create_rsc_dfn(&fx, &mut creating, "other", None, None).unwrap();
        assert_ne!(other.tcp_port(&fx.ctx).unwrap().unwrap().value(), 7100);
        creating.commit().unwrap();

        deleting.rollback();
        assert!(fx.objs.tcp_port_pool().is_allocated(7100));
        assert_eq!(old.tcp_port(&fx.ctx).unwrap().unwrap().value(), 7100);
    }

    #[test]
    fn test_node_ids_lowest_free() {
        let fx = Fixture::new();
        let rsc_dfn = fx.deployed("data", &["alpha", "bravo", "charlie"], 0);
        let ids: Vec<i32> = ["alpha", "bravo", "charlie"]
            .iter()
            .map(|node| fx.resource(node, "data").node_id(&fx.ctx).unwrap().value())
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);

        let mut tx = fx.tx();
        fx.resource("bravo", "data")
            .delete(&fx.ctx, &mut tx, &fx.objs)
            .unwrap();
        tx.commit().unwrap();

        let delta = fx.node("delta");
        let mut tx = fx.tx();
        let rsc = fx
            .factories
            .resource
            .create(&fx.ctx, &mut tx, &rsc_dfn, &delta, None, &[])
            .unwrap();
        tx.commit().unwrap();
        assert_eq!(rsc.node_id(&fx.ctx).unwrap().value(), 1);
    }

    #[test]
    fn test_explicit_node_id_conflict() {
        let fx = Fixture::new();
        let rsc_dfn = fx.deployed("data", &["alpha"], 0);
        let bravo = fx.node("bravo");

        let mut tx = fx.tx();
        assert_matches!(
            fx.factories.resource.create(
                &fx.ctx,
                &mut tx,
                &rsc_dfn,
                &bravo,
                Some(DrbdNodeId::new(0).unwrap()),
                &[]
            ),
            Err(Error::ValueInUse { kind: "DRBD node id", value: 0 })
        );
    }

    #[test]
    fn test_resource_duplicate() {
        let fx = Fixture::new();
        let rsc_dfn = fx.deployed("data", &["alpha"], 0);
        let alpha = fx.node("alpha");

        let mut tx = fx.tx();
        assert_matches!(
            fx.factories
                .resource
                .create(&fx.ctx, &mut tx, &rsc_dfn, &alpha, None, &[]),
            Err(Error::DataAlreadyExists { .. })
        );
    }

    #[test]
    fn test_resource_indexed_by_node_and_definition() {
        let fx = Fixture::new();
        let rsc_dfn = fx.deployed("data", &["alpha"], 0);
        let alpha = fx.node("alpha");

        let from_node = alpha.resource(&fx.ctx, &fx.rsc_name("data")).unwrap().unwrap();
        let from_dfn = rsc_dfn.resource(&fx.ctx, alpha.name()).unwrap().unwrap();
        assert!(Arc::ptr_eq(&from_node, &from_dfn));
        assert!(fx
            .driver
            .contains(ObjectKind::ObjectProtection, "/resources/ALPHA/DATA"));
    }

    #[test]
    fn test_resource_connection_canonical() {
        let fx = Fixture::new();
        fx.deployed("data", &["alpha", "bravo"], 0);
        let alpha = fx.resource("alpha", "data");
        let bravo = fx.resource("bravo", "data");

        let mut tx = fx.tx();
        let conn = fx
            .factories
            .rsc_connection
            .create(&fx.ctx, &mut tx, &bravo, &alpha, &[])
            .unwrap();
        assert_matches!(
            fx.factories
                .rsc_connection
                .create(&fx.ctx, &mut tx, &alpha, &bravo, &[]),
            Err(Error::DataAlreadyExists { .. })
        );
        tx.commit().unwrap();

        assert_eq!(conn.key().nodes.first(), alpha.node_name());
        let from_alpha = alpha.connection(&fx.ctx, bravo.node_name()).unwrap().unwrap();
        assert!(Arc::ptr_eq(&from_alpha, &conn));
    }

    #[test]
    fn test_resource_connection_across_definitions() {
        let fx = Fixture::new();
        fx.deployed("data", &["alpha"], 0);
        fx.deployed("logs", &["bravo"], 0);

        let mut tx = fx.tx();
        assert_matches!(
            fx.factories.rsc_connection.create(
                &fx.ctx,
                &mut tx,
                &fx.resource("alpha", "data"),
                &fx.resource("bravo", "logs"),
                &[]
            ),
            Err(Error::InvalidName { .. })
        );
    }

    #[test]
    fn test_satellite_rsc_dfn_keeps_pushed_port() {
        let objs = CoreObjects::new(Default::default()).unwrap();
        let mgr = TransactionMgr::satellite(16);
        let factory = ResourceDefinitionFactory::new(Arc::clone(&objs));
        let ctx = AccessContext::system();
        let uuid = Uuid::new_v4();
        let drbd = DrbdRscDfnData::new(TcpPortNumber::new(7042).unwrap(), 7);

        let mut tx = mgr.begin();
        let rsc_dfn = factory
            .get_instance_satellite(
                &ctx,
                &mut tx,
                uuid,
                ResourceName::new("data").unwrap(),
                default_layer_stack(),
                Some(drbd.clone()),
                0,
            )
            .unwrap();
        let again = factory
            .get_instance_satellite(
                &ctx,
                &mut tx,
                uuid,
                ResourceName::new("DATA").unwrap(),
                default_layer_stack(),
                Some(drbd),
                0,
            )
            .unwrap();
        tx.commit().unwrap();

        assert!(Arc::ptr_eq(&rsc_dfn, &again));
        assert_eq!(rsc_dfn.tcp_port(&ctx).unwrap().unwrap().value(), 7042);
        assert_eq!(objs.tcp_port_pool().allocated_count(), 0);
    }
}
