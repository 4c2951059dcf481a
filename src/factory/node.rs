//! Node, network interface and node connection factories

use super::{check_mirrored_uuid, check_not_loop};
use crate::error::{Error, Result};
use crate::events::CoreEvent;
use crate::identifier::{NetInterfaceName, NodeName, TcpPortNumber};
use crate::objects::{
    AccessControlled, CoreObjects, EncryptionType, NetInterface, NetInterfaceKey, Node,
    NodeConnection, NodePair, NodeType, Props,
};
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::stateflags::{ConnFlag, Flag, NodeFlag};
use crate::transaction::{DbOp, ObjectKind, Transaction};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

// =============================================================================
// Node
// =============================================================================

#[derive(Debug, Clone)]
pub struct NodeFactory {
    objs: Arc<CoreObjects>,
}

impl NodeFactory {
    pub fn new(objs: Arc<CoreObjects>) -> Self {
        Self { objs }
    }

    /// Create and register a node; needs CHANGE on the nodes map
    pub fn create(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        name: NodeName,
        node_type: NodeType,
        flags: &[NodeFlag],
    ) -> Result<Arc<Node>> {
        let _guard = self.objs.lock_structure();
        self.objs
            .nodes_map_prot()
            .require_access(ctx, AccessType::Change)?;
        if self.objs.find_node(&name).is_some() {
            return Err(Error::already_exists("node", &name));
        }

        let path = ObjectProtection::path_node(&name);
        let prot = ObjectProtection::create(ctx, tx, path.clone())?;
        let node = Arc::new(Node::new(
            Uuid::new_v4(),
            name.clone(),
            node_type,
            prot,
            NodeFlag::bits_of(flags),
            Props::new(path),
        ));
        self.objs.put_node(tx, Arc::clone(&node))?;
        tx.journal(DbOp::create(ObjectKind::Node, name.value()))?;
        tx.emit(CoreEvent::NodeCreated {
            node: name.display_name().to_string(),
            uuid: node.uuid()?,
        });

        info!(node = %name, node_type = %node_type, "node created");
        Ok(node)
    }

    pub fn get_instance_satellite(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        uuid: Uuid,
        name: NodeName,
        node_type: NodeType,
        flag_bits: u64,
    ) -> Result<Arc<Node>> {
        let _guard = self.objs.lock_structure();
        if let Some(node) = self.objs.find_node(&name) {
            check_mirrored_uuid(node.uuid()?, uuid, &name)?;
            return Ok(node);
        }

        let path = ObjectProtection::path_node(&name);
        let prot = Arc::new(ObjectProtection::new(ctx, path.clone()));
        let node = Arc::new(Node::new(uuid, name, node_type, prot, flag_bits, Props::new(path)));
        self.objs.put_node(tx, Arc::clone(&node))?;

        debug!(node = %node.name(), "node mirrored");
        Ok(node)
    }
}

// =============================================================================
// Network Interface
// =============================================================================

#[derive(Debug, Clone)]
pub struct NetInterfaceFactory {
    objs: Arc<CoreObjects>,
}

impl NetInterfaceFactory {
    pub fn new(objs: Arc<CoreObjects>) -> Self {
        Self { objs }
    }

    /// Create an interface on `node`; needs CHANGE on the node
    pub fn create(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        node: &Node,
        name: NetInterfaceName,
        address: IpAddr,
        stlt_conn: Option<(TcpPortNumber, EncryptionType)>,
    ) -> Result<Arc<NetInterface>> {
        let _guard = self.objs.lock_structure();
        node.gate(ctx, AccessType::Change)?;
        let key = NetInterfaceKey {
            node: node.name().clone(),
            name,
        };
        if node.find_net_interface(&key.name).is_some() {
            return Err(Error::already_exists("network interface", &key));
        }

        let db_key = key.db_key();
        let net_if = Arc::new(NetInterface::new(
            Uuid::new_v4(),
            key,
            Arc::clone(node.prot()?),
            address,
            stlt_conn,
        ));
        node.put_net_interface(ctx, tx, Arc::clone(&net_if))?;
        tx.journal(DbOp::create(ObjectKind::NetInterface, db_key))?;

        info!(net_interface = %net_if.key(), %address, "network interface created");
        Ok(net_if)
    }

    pub fn get_instance_satellite(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        uuid: Uuid,
        node: &Node,
        name: NetInterfaceName,
        address: IpAddr,
        stlt_conn: Option<(TcpPortNumber, EncryptionType)>,
    ) -> Result<Arc<NetInterface>> {
        let _guard = self.objs.lock_structure();
        if let Some(net_if) = node.find_net_interface(&name) {
            check_mirrored_uuid(net_if.uuid()?, uuid, net_if.key())?;
            return Ok(net_if);
        }

        let key = NetInterfaceKey {
            node: node.name().clone(),
            name,
        };
        let net_if = Arc::new(NetInterface::new(uuid, key, Arc::clone(node.prot()?), address, stlt_conn));
        node.put_net_interface(ctx, tx, Arc::clone(&net_if))?;

        debug!(net_interface = %net_if.key(), "network interface mirrored");
        Ok(net_if)
    }
}

// =============================================================================
// Node Connection
// =============================================================================

#[derive(Debug, Clone)]
pub struct NodeConnectionFactory {
    objs: Arc<CoreObjects>,
}

impl NodeConnectionFactory {
    pub fn new(objs: Arc<CoreObjects>) -> Self {
        Self { objs }
    }

    /// Protections ordered like the canonical node pair
    fn prots(nodes: &NodePair, a: &Node, b: &Node) -> Result<[Arc<ObjectProtection>; 2]> {
        let (first, second) = if nodes.first() == a.name() { (a, b) } else { (b, a) };
        Ok([Arc::clone(first.prot()?), Arc::clone(second.prot()?)])
    }

    /// Connect two nodes; needs CHANGE on both
    ///
    /// The pair is canonicalized, so `(a, b)` and `(b, a)` name the same
    /// connection.
    pub fn create(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        a: &Node,
        b: &Node,
        flags: &[ConnFlag],
    ) -> Result<Arc<NodeConnection>> {
        let _guard = self.objs.lock_structure();
        let nodes = NodePair::new(a.name().clone(), b.name().clone());
        check_not_loop("node connection", &nodes)?;
        a.gate(ctx, AccessType::Change)?;
        b.gate(ctx, AccessType::Change)?;
        if a.find_node_connection(b.name()).is_some() {
            return Err(Error::already_exists("node connection", &nodes));
        }

        let prots = Self::prots(&nodes, a, b)?;
        let db_key = nodes.db_key();
        let conn = Arc::new(NodeConnection::new(
            Uuid::new_v4(),
            nodes,
            prots,
            ConnFlag::bits_of(flags),
        ));
        a.put_node_connection(ctx, tx, Arc::clone(&conn))?;
        b.put_node_connection(ctx, tx, Arc::clone(&conn))?;
        tx.journal(DbOp::create(ObjectKind::NodeConnection, db_key))?;

        info!(connection = %conn.nodes(), "node connection created");
        Ok(conn)
    }

    pub fn get_instance_satellite(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        uuid: Uuid,
        a: &Node,
        b: &Node,
        flag_bits: u64,
    ) -> Result<Arc<NodeConnection>> {
        let _guard = self.objs.lock_structure();
        if let Some(conn) = a.find_node_connection(b.name()) {
            check_mirrored_uuid(conn.uuid()?, uuid, conn.nodes())?;
            return Ok(conn);
        }

        let nodes = NodePair::new(a.name().clone(), b.name().clone());
        check_not_loop("node connection", &nodes)?;
        let prots = Self::prots(&nodes, a, b)?;
        let conn = Arc::new(NodeConnection::new(uuid, nodes, prots, flag_bits));
        a.put_node_connection(ctx, tx, Arc::clone(&conn))?;
        b.put_node_connection(ctx, tx, Arc::clone(&conn))?;

        debug!(connection = %conn.nodes(), "node connection mirrored");
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::test_support::Fixture;
    use crate::objects::Deletable;
    use crate::transaction::{MemoryDriver, TransactionMgr};
    use assert_matches::assert_matches;

    #[test]
    fn test_create_registers_and_persists() {
        let fx = Fixture::new();
        let mut events = fx.mgr.subscribe();

        let mut tx = fx.tx();
        let node = fx
            .factories
            .node
            .create(&fx.ctx, &mut tx, fx.node_name("alpha"), NodeType::Satellite, &[])
            .unwrap();
        tx.commit().unwrap();

        assert!(fx.driver.contains(ObjectKind::Node, "ALPHA"));
        assert!(fx.driver.contains(ObjectKind::ObjectProtection, "/nodes/ALPHA"));
        assert_eq!(fx.objs.node_count(), 1);
        assert_matches!(events.try_recv(), Ok(CoreEvent::NodeCreated { node: name, .. }) if name == "alpha");
        assert_eq!(node.node_type(&fx.ctx).unwrap(), NodeType::Satellite);
    }

    #[test]
    fn test_duplicate_name_case_insensitive() {
        let fx = Fixture::new();
        fx.node("alpha");

        let mut tx = fx.tx();
        assert_matches!(
            fx.factories
                .node
                .create(&fx.ctx, &mut tx, fx.node_name("ALPHA"), NodeType::Satellite, &[]),
            Err(Error::DataAlreadyExists { .. })
        );
    }

    #[test]
    fn test_rollback_unregisters() {
        let fx = Fixture::new();

        let mut tx = fx.tx();
        fx.factories
            .node
            .create(&fx.ctx, &mut tx, fx.node_name("alpha"), NodeType::Satellite, &[])
            .unwrap();
        tx.rollback();

        assert_eq!(fx.objs.node_count(), 0);
        assert!(fx.objs.node(&fx.ctx, &fx.node_name("alpha")).unwrap().is_none());
    }

    #[test]
    fn test_failed_commit_stays_rollbackable() {
        let fx = Fixture::new();

        let mut tx = fx.tx();
        fx.factories
            .node
            .create(&fx.ctx, &mut tx, fx.node_name("alpha"), NodeType::Satellite, &[])
            .unwrap();
        fx.driver.fail_next_batch();
        assert_matches!(tx.commit(), Err(Error::Persistence(_)));
        assert!(tx.is_active());
        tx.rollback();

        assert_eq!(fx.objs.node_count(), 0);
        assert!(!fx.driver.contains(ObjectKind::Node, "ALPHA"));
    }

    #[test]
    fn test_public_context_may_create() {
        let fx = Fixture::new();
        let mut tx = fx.tx();
        let ctx = AccessContext::public();

        // the nodes map grants CHANGE to everyone
        fx.factories
            .node
            .create(&ctx, &mut tx, fx.node_name("alpha"), NodeType::Satellite, &[])
            .unwrap();
        tx.commit().unwrap();
        assert_eq!(fx.objs.node_count(), 1);
    }

    #[test]
    fn test_satellite_instance_is_idempotent() {
        let objs = CoreObjects::new(Default::default()).unwrap();
        let mgr = TransactionMgr::satellite(16);
        let factory = NodeFactory::new(Arc::clone(&objs));
        let ctx = AccessContext::system();
        let uuid = Uuid::new_v4();
        let name = NodeName::new("alpha").unwrap();

        let mut tx = mgr.begin();
        let first = factory
            .get_instance_satellite(&ctx, &mut tx, uuid, name.clone(), NodeType::Satellite, 0)
            .unwrap();
        let second = factory
            .get_instance_satellite(&ctx, &mut tx, uuid, name.clone(), NodeType::Satellite, 0)
            .unwrap();
        assert!(tx.pending_ops().is_empty());
        assert!(tx.pending_events().is_empty());
        tx.commit().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.uuid().unwrap(), uuid);

        let mut tx = mgr.begin();
        assert_matches!(
            factory.get_instance_satellite(&ctx, &mut tx, Uuid::new_v4(), name, NodeType::Satellite, 0),
            Err(Error::Implementation(_))
        );
    }

    #[test]
    fn test_satellite_mirror_keeps_flags() {
        let objs = CoreObjects::new(Default::default()).unwrap();
        let mgr = TransactionMgr::new(Arc::new(MemoryDriver::new()), 16);
        let factory = NodeFactory::new(objs);
        let ctx = AccessContext::system();

        let mut tx = mgr.begin();
        let node = factory
            .get_instance_satellite(
                &ctx,
                &mut tx,
                Uuid::new_v4(),
                NodeName::new("alpha").unwrap(),
                NodeType::Satellite,
                NodeFlag::bits_of(&[NodeFlag::Evicted]),
            )
            .unwrap();
        tx.commit().unwrap();

        let flags = node.flags().unwrap();
        assert!(flags.is_set(&ctx, NodeFlag::Evicted).unwrap());
        assert!(flags.is_set(&ctx, NodeFlag::Delete).unwrap());
    }

    #[test]
    fn test_net_interface_needs_node_change() {
        let fx = Fixture::new();
        let node = fx.node("alpha");
        let viewer = fx.user_with_access(node.prot().unwrap(), "viewer", AccessType::View);

        let mut tx = fx.tx();
        assert_matches!(
            fx.factories.net_interface.create(
                &viewer,
                &mut tx,
                &node,
                NetInterfaceName::new("default").unwrap(),
                "10.0.0.1".parse().unwrap(),
                None,
            ),
            Err(Error::AccessDenied { .. })
        );
        assert!(node.net_interfaces(&fx.ctx).unwrap().is_empty());
    }

    #[test]
    fn test_net_interface_duplicate() {
        let fx = Fixture::new();
        let node = fx.node("alpha");
        fx.net_interface("alpha", "default");

        let mut tx = fx.tx();
        assert_matches!(
            fx.factories.net_interface.create(
                &fx.ctx,
                &mut tx,
                &node,
                NetInterfaceName::new("DEFAULT").unwrap(),
                "10.0.0.2".parse().unwrap(),
                None,
            ),
            Err(Error::DataAlreadyExists { .. })
        );
    }

    #[test]
    fn test_connection_canonical_pair() {
        let fx = Fixture::new();
        let alpha = fx.node("alpha");
        let bravo = fx.node("bravo");

        let mut tx = fx.tx();
        let conn = fx
            .factories
            .node_connection
            .create(&fx.ctx, &mut tx, &bravo, &alpha, &[])
            .unwrap();
        assert_matches!(
            fx.factories
                .node_connection
                .create(&fx.ctx, &mut tx, &alpha, &bravo, &[]),
            Err(Error::DataAlreadyExists { .. })
        );
        tx.commit().unwrap();

        assert_eq!(conn.nodes().first(), alpha.name());
        let from_alpha = alpha.node_connection(&fx.ctx, bravo.name()).unwrap().unwrap();
        let from_bravo = bravo.node_connection(&fx.ctx, alpha.name()).unwrap().unwrap();
        assert!(Arc::ptr_eq(&from_alpha, &from_bravo));
        assert!(fx.driver.contains(ObjectKind::NodeConnection, "ALPHA/BRAVO"));
    }

    #[test]
    fn test_connection_to_self_rejected() {
        let fx = Fixture::new();
        let alpha = fx.node("alpha");

        let mut tx = fx.tx();
        assert_matches!(
            fx.factories
                .node_connection
                .create(&fx.ctx, &mut tx, &alpha, &alpha, &[]),
            Err(Error::InvalidName { .. })
        );
    }

    #[test]
    fn test_setter_after_commit_needs_new_transaction() {
        let fx = Fixture::new();
        let node = fx.node("alpha");

        let mut tx = fx.tx();
        node.mark_deleted(&fx.ctx, &mut tx).unwrap();
        tx.commit().unwrap();

        assert_matches!(
            node.set_node_type(&fx.ctx, &mut tx, NodeType::Combined),
            Err(Error::NoActiveTransaction)
        );
    }
}
