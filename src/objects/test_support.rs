//! Shared fixture for unit tests
//!
//! Every helper is get-or-create and commits its own transaction, so tests
//! can build the part of the graph they need in any order.

use crate::config::ControllerConfig;
use crate::factory::Factories;
use crate::identifier::{NetInterfaceName, NodeName, ResourceName, SnapshotName, StorPoolName, VolumeNumber};
use crate::objects::{
    CoreObjects, DeviceProviderKind, NetInterface, Node, NodeConnection, NodeType, Resource,
    ResourceConnection, ResourceDefinition, SnapshotDefinition, StorPool, StorPoolDefinition,
    Volume, VolumeConnection, VolumeDefinition,
};
use crate::security::{AccessContext, AccessType, Identity, ObjectProtection, PrivilegeSet, Role};
use crate::transaction::{MemoryDriver, Transaction, TransactionMgr};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

pub(crate) struct Fixture {
    pub ctx: AccessContext,
    pub driver: Arc<MemoryDriver>,
    pub mgr: TransactionMgr,
    pub objs: Arc<CoreObjects>,
    pub factories: Factories,
}

impl Fixture {
    /// 1 GiB
    pub const VOLUME_SIZE_KIB: u64 = 1024 * 1024;

    pub fn new() -> Self {
        Self::with_config(ControllerConfig::default())
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        let driver = Arc::new(MemoryDriver::new());
        let mgr = TransactionMgr::new(driver.clone(), 64);
        let objs = CoreObjects::new(config).unwrap();
        let factories = Factories::new(Arc::clone(&objs));
        Self {
            ctx: AccessContext::system(),
            driver,
            mgr,
            objs,
            factories,
        }
    }

    pub fn tx(&self) -> Transaction {
        self.mgr.begin()
    }

    pub fn node_name(&self, name: &str) -> NodeName {
        NodeName::new(name).unwrap()
    }

    pub fn rsc_name(&self, name: &str) -> ResourceName {
        ResourceName::new(name).unwrap()
    }

    pub fn stor_pool_name(&self, name: &str) -> StorPoolName {
        StorPoolName::new(name).unwrap()
    }

    pub fn snapshot_name(&self, name: &str) -> SnapshotName {
        SnapshotName::new(name).unwrap()
    }

    fn vlm_nr(nr: i32) -> VolumeNumber {
        VolumeNumber::new(nr).unwrap()
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    pub fn node(&self, name: &str) -> Arc<Node> {
        let name = self.node_name(name);
        if let Some(node) = self.objs.find_node(&name) {
            return node;
        }
        let mut tx = self.tx();
        let node = self
            .factories
            .node
            .create(&self.ctx, &mut tx, name, NodeType::Satellite, &[])
            .unwrap();
        tx.commit().unwrap();
        node
    }

    pub fn net_interface(&self, node: &str, name: &str) -> Arc<NetInterface> {
        let node = self.node(node);
        let name = NetInterfaceName::new(name).unwrap();
        if let Some(net_if) = node.find_net_interface(&name) {
            return net_if;
        }
        let mut tx = self.tx();
        let net_if = self
            .factories
            .net_interface
            .create(
                &self.ctx,
                &mut tx,
                &node,
                name,
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                None,
            )
            .unwrap();
        tx.commit().unwrap();
        net_if
    }

    pub fn node_connection(&self, a: &str, b: &str) -> Arc<NodeConnection> {
        let (a, b) = (self.node(a), self.node(b));
        if let Some(conn) = a.find_node_connection(b.name()) {
            return conn;
        }
        let mut tx = self.tx();
        let conn = self
            .factories
            .node_connection
            .create(&self.ctx, &mut tx, &a, &b, &[])
            .unwrap();
        tx.commit().unwrap();
        conn
    }

    // =========================================================================
    // Storage Pools
    // =========================================================================

    pub fn stor_pool_dfn(&self, name: &str) -> Arc<StorPoolDefinition> {
        let name = self.stor_pool_name(name);
        if let Some(dfn) = self.objs.find_stor_pool_dfn(&name) {
            return dfn;
        }
        let mut tx = self.tx();
        let dfn = self
            .factories
            .stor_pool_dfn
            .create(&self.ctx, &mut tx, name)
            .unwrap();
        tx.commit().unwrap();
        dfn
    }

    /// Thin LVM pool, so volume placement reserves capacity
    pub fn stor_pool(&self, node: &str, name: &str) -> Arc<StorPool> {
        let node = self.node(node);
        let dfn = self.stor_pool_dfn(name);
        if let Some(pool) = node.find_stor_pool(dfn.name()) {
            return pool;
        }
        let mut tx = self.tx();
        let pool = self
            .factories
            .stor_pool
            .create(&self.ctx, &mut tx, &node, &dfn, DeviceProviderKind::LvmThin, None)
            .unwrap();
        tx.commit().unwrap();
        pool
    }

    // =========================================================================
    // Resources
    // =========================================================================

    pub fn rsc_dfn(&self, name: &str) -> Arc<ResourceDefinition> {
        let name = self.rsc_name(name);
        if let Some(rsc_dfn) = self.objs.find_rsc_dfn(&name) {
            return rsc_dfn;
        }
        let mut tx = self.tx();
        let rsc_dfn = self
            .factories
            .rsc_dfn
            .create(&self.ctx, &mut tx, name, None, None, &[])
            .unwrap();
        tx.commit().unwrap();
        rsc_dfn
    }

    pub fn vlm_dfn(&self, rsc: &str, nr: i32) -> Arc<VolumeDefinition> {
        let rsc_dfn = self.rsc_dfn(rsc);
        let vlm_nr = Self::vlm_nr(nr);
        if let Some(vlm_dfn) = rsc_dfn.find_volume_definition(vlm_nr) {
            return vlm_dfn;
        }
        let mut tx = self.tx();
        let vlm_dfn = self
            .factories
            .vlm_dfn
            .create(&self.ctx, &mut tx, &rsc_dfn, vlm_nr, None, Self::VOLUME_SIZE_KIB, &[])
            .unwrap();
        tx.commit().unwrap();
        vlm_dfn
    }

    pub fn resource(&self, node: &str, rsc: &str) -> Arc<Resource> {
        let node = self.node(node);
        let rsc_dfn = self.rsc_dfn(rsc);
        if let Some(rsc) = rsc_dfn.find_resource(node.name()) {
            return rsc;
        }
        let mut tx = self.tx();
        let rsc = self
            .factories
            .resource
            .create(&self.ctx, &mut tx, &rsc_dfn, &node, None, &[])
            .unwrap();
        tx.commit().unwrap();
        rsc
    }

    /// Volume `nr` of `rsc` on `node`, placed in the node's pool "pool"
    pub fn volume(&self, node: &str, rsc: &str, nr: i32) -> Arc<Volume> {
        let resource = self.resource(node, rsc);
        let vlm_dfn = self.vlm_dfn(rsc, nr);
        if let Some(vlm) = resource.find_volume(vlm_dfn.volume_number()) {
            return vlm;
        }
        let pool = self.stor_pool(node, "pool");
        let mut tx = self.tx();
        let vlm = self
            .factories
            .volume
            .create(&self.ctx, &mut tx, &resource, &vlm_dfn, &pool, &[])
            .unwrap();
        tx.commit().unwrap();
        vlm
    }

    /// Resource definition `rsc` with `vlm_count` volumes deployed on `nodes`
    pub fn deployed(&self, rsc: &str, nodes: &[&str], vlm_count: i32) -> Arc<ResourceDefinition> {
        let rsc_dfn = self.rsc_dfn(rsc);
        for nr in 0..vlm_count {
            self.vlm_dfn(rsc, nr);
        }
        for node in nodes {
            self.resource(node, rsc);
            for nr in 0..vlm_count {
                self.volume(node, rsc, nr);
            }
        }
        rsc_dfn
    }

    pub fn resource_connection(&self, rsc: &str, a: &str, b: &str) -> Arc<ResourceConnection> {
        let (a, b) = (self.resource(a, rsc), self.resource(b, rsc));
        if let Some(conn) = a.find_connection(b.node_name()) {
            return conn;
        }
        let mut tx = self.tx();
        let conn = self
            .factories
            .rsc_connection
            .create(&self.ctx, &mut tx, &a, &b, &[])
            .unwrap();
        tx.commit().unwrap();
        conn
    }

    pub fn volume_connection(&self, rsc: &str, a: &str, b: &str, nr: i32) -> Arc<VolumeConnection> {
        let (a, b) = (self.volume(a, rsc, nr), self.volume(b, rsc, nr));
        if let Some(conn) = a.find_volume_connection(&b.key().node) {
            return conn;
        }
        let mut tx = self.tx();
        let conn = self
            .factories
            .vlm_connection
            .create(&self.ctx, &mut tx, &a, &b)
            .unwrap();
        tx.commit().unwrap();
        conn
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Snapshot `snap` taken of every deployed resource of `rsc`
    pub fn snapshot_dfn(&self, rsc: &str, snap: &str) -> Arc<SnapshotDefinition> {
        let rsc_dfn = self.rsc_dfn(rsc);
        let name = self.snapshot_name(snap);
        if let Some(snap_dfn) = rsc_dfn.find_snapshot_definition(&name) {
            return snap_dfn;
        }
        let mut tx = self.tx();
        let snap_dfn = self
            .factories
            .snapshot_dfn
            .take_snapshot(&self.ctx, &mut tx, &rsc_dfn, name)
            .unwrap();
        tx.commit().unwrap();
        snap_dfn
    }

    // =========================================================================
    // Access
    // =========================================================================

    /// Unprivileged subject granted `access` on `prot` through an ACL entry
    pub fn user_with_access(
        &self,
        prot: &Arc<ObjectProtection>,
        name: &str,
        access: AccessType,
    ) -> AccessContext {
        let mut tx = self.tx();
        prot.add_acl_entry(&self.ctx, &mut tx, Role::new(name), access)
            .unwrap();
        tx.commit().unwrap();
        AccessContext::new(Identity::new(name), Role::new(name), PrivilegeSet::none())
    }
}
