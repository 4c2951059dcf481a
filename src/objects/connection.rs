//! Connections
//!
//! Node, resource and volume connections carry properties of a link between
//! two endpoints. Their keys hold the endpoints as a canonical [`NodePair`],
//! so `(A, B)` and `(B, A)` address the same connection. A connection is
//! registered with both endpoints and guarded by both of their protections.

use super::{
    AccessControlled, CoreObjects, NodePair, Props, PropsOwner, ResourceConnectionApi,
    ResourceConnectionKey, ResourceKey, VolumeConnectionKey, VolumeKey,
};
use crate::error::Result;
use crate::identifier::{NodeName, TcpPortNumber};
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::stateflags::{ConnFlag, StateFlags};
use crate::transaction::{
    composite_transaction_object, DbOp, ObjectKind, Transaction, TransactionObject, TxCell,
};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

fn require_both(prots: &[Arc<ObjectProtection>; 2], ctx: &AccessContext, requested: AccessType) -> Result<()> {
    prots
        .iter()
        .try_for_each(|prot| prot.require_access(ctx, requested))
}

// =============================================================================
// Node Connection
// =============================================================================

#[derive(Debug)]
pub struct NodeConnection {
    uuid: Uuid,
    nodes: NodePair,
    prots: [Arc<ObjectProtection>; 2],
    flags: StateFlags<ConnFlag>,
    props: Props,
    deleted: TxCell<bool>,
}

impl NodeConnection {
    pub(crate) fn new(
        uuid: Uuid,
        nodes: NodePair,
        prots: [Arc<ObjectProtection>; 2],
        initial_flags: u64,
    ) -> Self {
        let deleted = TxCell::new(false);
        let flags = StateFlags::new(prots.to_vec(), ObjectKind::NodeConnection, nodes.db_key(), initial_flags).guarded_by(&deleted);
        let props = Props::new(Self::props_path(&nodes));
        Self {
            uuid,
            nodes,
            prots,
            flags,
            props,
            deleted,
        }
    }

    pub(crate) fn props_path(nodes: &NodePair) -> String {
        format!("/nodeconnections/{}", nodes.db_key())
    }

    pub fn uuid(&self) -> Result<Uuid> {
        self.check_deleted()?;
        Ok(self.uuid)
    }

    pub fn nodes(&self) -> &NodePair {
        &self.nodes
    }

    pub fn flags(&self) -> Result<&StateFlags<ConnFlag>> {
        self.check_deleted()?;
        Ok(&self.flags)
    }

    /// Unlink from both nodes; idempotent, needs CONTROL on both
    pub fn delete(&self, ctx: &AccessContext, tx: &mut Transaction, objs: &CoreObjects) -> Result<()> {
        let _guard = objs.lock_structure();
        if self.is_deleted() {
            return Ok(());
        }
        require_both(&self.prots, ctx, AccessType::Control)?;

        for (node, other) in [
            (self.nodes.first(), self.nodes.second()),
            (self.nodes.second(), self.nodes.first()),
        ] {
            objs.resolve_node(node)?.remove_node_connection(ctx, tx, other)?;
        }
        self.props.delete(tx)?;
        tx.journal(DbOp::delete(ObjectKind::NodeConnection, self.nodes.db_key()))?;
        self.deleted.set(tx, true)?;

        debug!(connection = %self.nodes, "node connection deleted");
        Ok(())
    }

    fn sub_objects(&self) -> Vec<&dyn TransactionObject> {
        vec![&self.flags, &self.props, &self.deleted]
    }

    fn child_objects(&self) -> Vec<Arc<dyn TransactionObject>> {
        Vec::new()
    }
}

composite_transaction_object!(NodeConnection);

impl AccessControlled for NodeConnection {
    fn object_description(&self) -> String {
        format!("NodeConnection: {}", self.nodes)
    }

    fn is_deleted(&self) -> bool {
        self.deleted.get()
    }

    fn require_access(&self, ctx: &AccessContext, requested: AccessType) -> Result<()> {
        require_both(&self.prots, ctx, requested)
    }
}

impl PropsOwner for NodeConnection {
    fn props_container(&self) -> &Props {
        &self.props
    }
}

// =============================================================================
// Resource Connection
// =============================================================================

#[derive(Debug)]
pub struct ResourceConnection {
    uuid: Uuid,
    key: ResourceConnectionKey,
    prots: [Arc<ObjectProtection>; 2],
    flags: StateFlags<ConnFlag>,
    props: Props,
    /// Port of the local DRBD proxy, drawn from the TCP port pool
    drbd_proxy_port: TxCell<Option<TcpPortNumber>>,
    deleted: TxCell<bool>,
}

impl ResourceConnection {
    pub(crate) fn new(
        uuid: Uuid,
        key: ResourceConnectionKey,
        prots: [Arc<ObjectProtection>; 2],
        initial_flags: u64,
        drbd_proxy_port: Option<TcpPortNumber>,
    ) -> Self {
        let deleted = TxCell::new(false);
        let flags = StateFlags::new(prots.to_vec(), ObjectKind::ResourceConnection, key.db_key(), initial_flags).guarded_by(&deleted);
        let props = Props::new(Self::props_path(&key));
        Self {
            uuid,
            key,
            prots,
            flags,
            props,
            drbd_proxy_port: TxCell::new(drbd_proxy_port),
            deleted,
        }
    }

    pub(crate) fn props_path(key: &ResourceConnectionKey) -> String {
        format!("/resourceconnections/{}", key.db_key())
    }

    pub fn uuid(&self) -> Result<Uuid> {
        self.check_deleted()?;
        Ok(self.uuid)
    }

    pub fn key(&self) -> &ResourceConnectionKey {
        &self.key
    }

    pub fn flags(&self) -> Result<&StateFlags<ConnFlag>> {
        self.check_deleted()?;
        Ok(&self.flags)
    }

    fn resource_keys(&self) -> [ResourceKey; 2] {
        [
            ResourceKey::new(self.key.nodes.first().clone(), self.key.rsc.clone()),
            ResourceKey::new(self.key.nodes.second().clone(), self.key.rsc.clone()),
        ]
    }

    pub fn drbd_proxy_port(&self, ctx: &AccessContext) -> Result<Option<TcpPortNumber>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.drbd_proxy_port.get())
    }

    /// Assign `port` (or a free port if `None`) to the DRBD proxy and
    /// enable LOCAL_DRBD_PROXY; a previously held port is released
    pub fn enable_drbd_proxy(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        objs: &CoreObjects,
        port: Option<TcpPortNumber>,
    ) -> Result<TcpPortNumber> {
        self.gate(ctx, AccessType::Change)?;
        let pool = objs.tcp_port_pool();
        let new_port = match port {
            Some(port) => {
                pool.allocate(tx, port.value())?;
                port
            }
            None => TcpPortNumber::new(pool.auto_allocate(tx)?)?,
        };
        if let Some(old) = self.drbd_proxy_port.set(tx, Some(new_port))? {
            pool.deallocate(tx, old.value())?;
        }
        self.flags.enable_flags(ctx, tx, &[ConnFlag::LocalDrbdProxy])?;
        tx.journal(DbOp::update(ObjectKind::ResourceConnection, self.key.db_key(), "drbd_proxy_port"))?;
        debug!(connection = %self.key, port = %new_port, "drbd proxy port assigned");
        Ok(new_port)
    }

    pub fn disable_drbd_proxy(&self, ctx: &AccessContext, tx: &mut Transaction, objs: &CoreObjects) -> Result<()> {
        self.gate(ctx, AccessType::Change)?;
        if let Some(old) = self.drbd_proxy_port.set(tx, None)? {
            objs.tcp_port_pool().deallocate(tx, old.value())?;
            tx.journal(DbOp::update(ObjectKind::ResourceConnection, self.key.db_key(), "drbd_proxy_port"))?;
        }
        self.flags.disable_flags(ctx, tx, &[ConnFlag::LocalDrbdProxy])
    }

    pub fn api_data(&self, ctx: &AccessContext) -> Result<ResourceConnectionApi> {
        self.gate(ctx, AccessType::View)?;
        Ok(ResourceConnectionApi {
            uuid: self.uuid,
            node_a: self.key.nodes.first().display_name().to_string(),
            node_b: self.key.nodes.second().display_name().to_string(),
            rsc: self.key.rsc.display_name().to_string(),
            flags: self.flags.raw_bits(),
            props: self.props.entries(),
            drbd_proxy_port: self.drbd_proxy_port.get().map(|port| port.value()),
        })
    }

    /// Delete the volume connections of this pair, release the proxy port
    /// and unlink from both resources; idempotent, needs CONTROL on both
    pub fn delete(&self, ctx: &AccessContext, tx: &mut Transaction, objs: &CoreObjects) -> Result<()> {
        let _guard = objs.lock_structure();
        if self.is_deleted() {
            return Ok(());
        }
        require_both(&self.prots, ctx, AccessType::Control)?;

        let [first, second] = self.resource_keys();
        let first_rsc = objs.resolve_resource(&first)?;
        let second_rsc = objs.resolve_resource(&second)?;

        for vlm in first_rsc.find_volumes() {
            if let Some(vlm_conn) = vlm.find_volume_connection(&second.node) {
                vlm_conn.delete(ctx, tx, objs)?;
            }
        }
        if let Some(port) = self.drbd_proxy_port.set(tx, None)? {
            objs.tcp_port_pool().deallocate(tx, port.value())?;
        }
        first_rsc.remove_connection(ctx, tx, &second.node)?;
        second_rsc.remove_connection(ctx, tx, &first.node)?;

        self.props.delete(tx)?;
        tx.journal(DbOp::delete(ObjectKind::ResourceConnection, self.key.db_key()))?;
        self.deleted.set(tx, true)?;

        debug!(connection = %self.key, "resource connection deleted");
        Ok(())
    }

    fn sub_objects(&self) -> Vec<&dyn TransactionObject> {
        vec![&self.flags, &self.props, &self.drbd_proxy_port, &self.deleted]
    }

    fn child_objects(&self) -> Vec<Arc<dyn TransactionObject>> {
        Vec::new()
    }
}

composite_transaction_object!(ResourceConnection);

impl AccessControlled for ResourceConnection {
    fn object_description(&self) -> String {
        format!("ResourceConnection: {}", self.key)
    }

    fn is_deleted(&self) -> bool {
        self.deleted.get()
    }

    fn require_access(&self, ctx: &AccessContext, requested: AccessType) -> Result<()> {
        require_both(&self.prots, ctx, requested)
    }
}

impl PropsOwner for ResourceConnection {
    fn props_container(&self) -> &Props {
        &self.props
    }
}

// =============================================================================
// Volume Connection
// =============================================================================

#[derive(Debug)]
pub struct VolumeConnection {
    uuid: Uuid,
    key: VolumeConnectionKey,
    prots: [Arc<ObjectProtection>; 2],
    props: Props,
    deleted: TxCell<bool>,
}

impl VolumeConnection {
    pub(crate) fn new(uuid: Uuid, key: VolumeConnectionKey, prots: [Arc<ObjectProtection>; 2]) -> Self {
        let props = Props::new(Self::props_path(&key));
        Self {
            uuid,
            key,
            prots,
            props,
            deleted: TxCell::new(false),
        }
    }

    pub(crate) fn props_path(key: &VolumeConnectionKey) -> String {
        format!("/volumeconnections/{}", key.db_key())
    }

    pub fn uuid(&self) -> Result<Uuid> {
        self.check_deleted()?;
        Ok(self.uuid)
    }

    pub fn key(&self) -> &VolumeConnectionKey {
        &self.key
    }

    /// Unlink from both volumes; idempotent, needs CONTROL on both
    pub fn delete(&self, ctx: &AccessContext, tx: &mut Transaction, objs: &CoreObjects) -> Result<()> {
        let _guard = objs.lock_structure();
        if self.is_deleted() {
            return Ok(());
        }
        require_both(&self.prots, ctx, AccessType::Control)?;

        let endpoints: [(&NodeName, &NodeName); 2] = [
            (self.key.nodes.first(), self.key.nodes.second()),
            (self.key.nodes.second(), self.key.nodes.first()),
        ];
        for (node, other) in endpoints {
            let vlm_key = VolumeKey::new(node.clone(), self.key.rsc.clone(), self.key.vlm_nr);
            objs.resolve_volume(&vlm_key)?
                .remove_volume_connection(ctx, tx, other)?;
        }
        self.props.delete(tx)?;
        tx.journal(DbOp::delete(ObjectKind::VolumeConnection, self.key.db_key()))?;
        self.deleted.set(tx, true)?;

        debug!(connection = %self.key, "volume connection deleted");
        Ok(())
    }

    fn sub_objects(&self) -> Vec<&dyn TransactionObject> {
        vec![&self.props, &self.deleted]
    }

    fn child_objects(&self) -> Vec<Arc<dyn TransactionObject>> {
        Vec::new()
    }
}

composite_transaction_object!(VolumeConnection);

impl AccessControlled for VolumeConnection {
    fn object_description(&self) -> String {
        format!("VolumeConnection: {}", self.key)
    }

    fn is_deleted(&self) -> bool {
        self.deleted.get()
    }

    fn require_access(&self, ctx: &AccessContext, requested: AccessType) -> Result<()> {
        require_both(&self.prots, ctx, requested)
    }
}

impl PropsOwner for VolumeConnection {
    fn props_container(&self) -> &Props {
        &self.props
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::objects::test_support::Fixture;
    use assert_matches::assert_matches;

    #[test]
    fn test_node_connection_deleted_once_from_both_endpoints() {
        let fx = Fixture::new();
        let alpha = fx.node("alpha");
        let bravo = fx.node("bravo");
        let conn = fx.node_connection("alpha", "bravo");
        assert!(alpha.node_connection(&fx.ctx, bravo.name()).unwrap().is_some());

        let mut tx = fx.tx();
        conn.delete(&fx.ctx, &mut tx, &fx.objs).unwrap();
        let ops = tx.pending_ops().len();
        conn.delete(&fx.ctx, &mut tx, &fx.objs).unwrap();
        assert_eq!(tx.pending_ops().len(), ops);
        tx.commit().unwrap();

        assert!(alpha.node_connections(&fx.ctx).unwrap().is_empty());
        assert!(bravo.node_connections(&fx.ctx).unwrap().is_empty());
        assert_matches!(conn.flags(), Err(Error::AccessToDeletedData { .. }));
    }

    #[test]
    fn test_drbd_proxy_port_allocated_and_released() {
        let fx = Fixture::new();
        fx.deployed("data", &["alpha", "bravo"], 1);
        let conn = fx.resource_connection("data", "alpha", "bravo");
        let allocated = fx.objs.tcp_port_pool().allocated_count();

        let mut tx = fx.tx();
        let port = conn.enable_drbd_proxy(&fx.ctx, &mut tx, &fx.objs, None).unwrap();
        assert!(conn.flags().unwrap().is_set(&fx.ctx, ConnFlag::LocalDrbdProxy).unwrap());
        tx.commit().unwrap();
        assert!(fx.objs.tcp_port_pool().is_allocated(port.value()));
        assert_eq!(conn.api_data(&fx.ctx).unwrap().drbd_proxy_port, Some(port.value()));

        let mut tx = fx.tx();
        conn.delete(&fx.ctx, &mut tx, &fx.objs).unwrap();
        tx.commit().unwrap();
        assert_eq!(fx.objs.tcp_port_pool().allocated_count(), allocated);
    }

    #[test]
    fn test_resource_connection_delete_cascades_volume_connections() {
        let fx = Fixture::new();
        fx.deployed("data", &["alpha", "bravo"], 2);
        let rsc_conn = fx.resource_connection("data", "alpha", "bravo");
        let vlm_conn = fx.volume_connection("data", "alpha", "bravo", 1);

        let mut tx = fx.tx();
        rsc_conn.delete(&fx.ctx, &mut tx, &fx.objs).unwrap();
        tx.commit().unwrap();

        assert!(vlm_conn.is_deleted());
        let vlm = fx.volume("bravo", "data", 1);
        assert!(vlm.volume_connections(&fx.ctx).unwrap().is_empty());
    }

    #[test]
    fn test_connection_requires_access_to_both_endpoints() {
        let fx = Fixture::new();
        let alpha = fx.node("alpha");
        let conn = fx.node_connection("alpha", "bravo");
        let user = fx.user_with_access(alpha.prot().unwrap(), "operator", AccessType::Control);

        assert_matches!(conn.props(&user), Err(Error::AccessDenied { .. }));
        let mut tx = fx.tx();
        assert_matches!(conn.delete(&user, &mut tx, &fx.objs), Err(Error::AccessDenied { .. }));
    }
}
