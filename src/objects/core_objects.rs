//! Core Object Registry
//!
//! Owns the top level maps of the object graph and the global identifier
//! pools. Every back reference in the graph is stored as a key and resolved
//! through this registry, so ownership always points downwards:
//!
//! ```text
//! CoreObjects ─┬─ nodes ─────────── Node ─┬─ resources ─── Resource ── volumes
//!              │                          ├─ stor_pools ── StorPool ── tracker
//!              │                          └─ net_interfaces / snapshots / connections
//!              ├─ rsc_dfns ──────── ResourceDefinition ─┬─ volume_definitions
//!              │                                        └─ snapshot_definitions
//!              ├─ stor_pool_dfns ── StorPoolDefinition
//!              └─ free_space_trackers
//! ```

use super::{
    AccessControlled, FreeSpaceTracker, Node, Resource, ResourceDefinition, ResourceKey,
    Snapshot, SnapshotDefinition, SnapshotDefinitionKey, SnapshotKey, StorPool,
    StorPoolDefinition, StorPoolKey, Volume, VolumeDefinition, VolumeDefinitionKey, VolumeKey,
};
use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::identifier::{FreeSpaceMgrName, NodeName, ResourceName, StorPoolName};
use crate::numberpool::{DynamicNumberPool, MINOR_NUMBER_POOL, TCP_PORT_POOL};
use crate::security::{AccessContext, AccessType, ObjectProtection, Role};
use crate::transaction::{Transaction, TransactionObject, TxMap};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::sync::Arc;
use tracing::info;

const NODES_MAP: &str = "nodesMap";
const RSC_DFN_MAP: &str = "rscDfnMap";
const STOR_POOL_DFN_MAP: &str = "storPoolMap";

/// Registry of the object graph
#[derive(Debug)]
pub struct CoreObjects {
    config: ControllerConfig,

    nodes_map_prot: Arc<ObjectProtection>,
    rsc_dfn_map_prot: Arc<ObjectProtection>,
    stor_pool_dfn_map_prot: Arc<ObjectProtection>,

    nodes: TxMap<NodeName, Arc<Node>>,
    rsc_dfns: TxMap<ResourceName, Arc<ResourceDefinition>>,
    stor_pool_dfns: TxMap<StorPoolName, Arc<StorPoolDefinition>>,
    free_space_trackers: TxMap<FreeSpaceMgrName, Arc<FreeSpaceTracker>>,

    minor_pool: Arc<DynamicNumberPool>,
    tcp_port_pool: Arc<DynamicNumberPool>,

    /// Serializes structural changes of the graph
    structure_lock: ReentrantMutex<()>,
}

impl CoreObjects {
    pub fn new(config: ControllerConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let system = AccessContext::system();
        let map_prot = |name: &str| {
            Arc::new(ObjectProtection::with_acl_entries(
                &system,
                ObjectProtection::path_controller(name),
                &[(Role::public(), AccessType::Change)],
            ))
        };

        let minor_pool = Arc::new(DynamicNumberPool::new(
            MINOR_NUMBER_POOL,
            config.minor_range.start,
            config.minor_range.end,
        ));
        let tcp_port_pool = Arc::new(DynamicNumberPool::new(
            TCP_PORT_POOL,
            config.tcp_port_range.start,
            config.tcp_port_range.end,
        ));

        info!(
            minor_range = %format!("{}..={}", config.minor_range.start, config.minor_range.end),
            tcp_port_range = %format!("{}..={}", config.tcp_port_range.start, config.tcp_port_range.end),
            "core object registry initialized"
        );

        Ok(Arc::new(Self {
            nodes_map_prot: map_prot(NODES_MAP),
            rsc_dfn_map_prot: map_prot(RSC_DFN_MAP),
            stor_pool_dfn_map_prot: map_prot(STOR_POOL_DFN_MAP),
            nodes: TxMap::new(),
            rsc_dfns: TxMap::new(),
            stor_pool_dfns: TxMap::new(),
            free_space_trackers: TxMap::new(),
            minor_pool,
            tcp_port_pool,
            structure_lock: ReentrantMutex::new(()),
            config,
        }))
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Take the structure lock for a multi-step change of the graph
    pub fn lock_structure(&self) -> ReentrantMutexGuard<'_, ()> {
        self.structure_lock.lock()
    }

    pub fn nodes_map_prot(&self) -> &Arc<ObjectProtection> {
        &self.nodes_map_prot
    }

    pub fn rsc_dfn_map_prot(&self) -> &Arc<ObjectProtection> {
        &self.rsc_dfn_map_prot
    }

    pub fn stor_pool_dfn_map_prot(&self) -> &Arc<ObjectProtection> {
        &self.stor_pool_dfn_map_prot
    }

    pub fn minor_pool(&self) -> &Arc<DynamicNumberPool> {
        &self.minor_pool
    }

    pub fn tcp_port_pool(&self) -> &Arc<DynamicNumberPool> {
        &self.tcp_port_pool
    }

    // =========================================================================
    // Access Checked Lookups
    // =========================================================================

    pub fn node(&self, ctx: &AccessContext, name: &NodeName) -> Result<Option<Arc<Node>>> {
        self.nodes_map_prot.require_access(ctx, AccessType::View)?;
        Ok(self.nodes.get(name))
    }

    pub fn nodes(&self, ctx: &AccessContext) -> Result<Vec<Arc<Node>>> {
        self.nodes_map_prot.require_access(ctx, AccessType::View)?;
        Ok(self.nodes.values())
    }

    pub fn resource_definition(
        &self,
        ctx: &AccessContext,
        name: &ResourceName,
    ) -> Result<Option<Arc<ResourceDefinition>>> {
        self.rsc_dfn_map_prot.require_access(ctx, AccessType::View)?;
        Ok(self.rsc_dfns.get(name))
    }

    pub fn resource_definitions(&self, ctx: &AccessContext) -> Result<Vec<Arc<ResourceDefinition>>> {
        self.rsc_dfn_map_prot.require_access(ctx, AccessType::View)?;
        Ok(self.rsc_dfns.values())
    }

    pub fn stor_pool_definition(
        &self,
        ctx: &AccessContext,
        name: &StorPoolName,
    ) -> Result<Option<Arc<StorPoolDefinition>>> {
        self.stor_pool_dfn_map_prot.require_access(ctx, AccessType::View)?;
        Ok(self.stor_pool_dfns.get(name))
    }

    pub fn stor_pool_definitions(&self, ctx: &AccessContext) -> Result<Vec<Arc<StorPoolDefinition>>> {
        self.stor_pool_dfn_map_prot.require_access(ctx, AccessType::View)?;
        Ok(self.stor_pool_dfns.values())
    }

    pub fn free_space_tracker(
        &self,
        ctx: &AccessContext,
        name: &FreeSpaceMgrName,
    ) -> Result<Option<Arc<FreeSpaceTracker>>> {
        self.stor_pool_dfn_map_prot.require_access(ctx, AccessType::View)?;
        Ok(self.free_space_trackers.get(name))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn resource_definition_count(&self) -> usize {
        self.rsc_dfns.len()
    }

    // =========================================================================
    // Registration
    // =========================================================================

    pub(crate) fn find_node(&self, name: &NodeName) -> Option<Arc<Node>> {
        self.nodes.get(name)
    }

    pub(crate) fn find_rsc_dfn(&self, name: &ResourceName) -> Option<Arc<ResourceDefinition>> {
        self.rsc_dfns.get(name)
    }

    pub(crate) fn find_stor_pool_dfn(&self, name: &StorPoolName) -> Option<Arc<StorPoolDefinition>> {
        self.stor_pool_dfns.get(name)
    }

    pub(crate) fn put_node(&self, tx: &mut Transaction, node: Arc<Node>) -> Result<()> {
        self.nodes.insert(tx, node.name().clone(), node)?;
        Ok(())
    }

    pub(crate) fn remove_node(&self, tx: &mut Transaction, name: &NodeName) -> Result<()> {
        self.nodes.remove(tx, name)?;
        Ok(())
    }

    pub(crate) fn put_rsc_dfn(&self, tx: &mut Transaction, rsc_dfn: Arc<ResourceDefinition>) -> Result<()> {
        self.rsc_dfns.insert(tx, rsc_dfn.name().clone(), rsc_dfn)?;
        Ok(())
    }

    pub(crate) fn remove_rsc_dfn(&self, tx: &mut Transaction, name: &ResourceName) -> Result<()> {
        self.rsc_dfns.remove(tx, name)?;
        Ok(())
    }

    pub(crate) fn put_stor_pool_dfn(
        &self,
        tx: &mut Transaction,
        stor_pool_dfn: Arc<StorPoolDefinition>,
    ) -> Result<()> {
        self.stor_pool_dfns
            .insert(tx, stor_pool_dfn.name().clone(), stor_pool_dfn)?;
        Ok(())
    }

    pub(crate) fn remove_stor_pool_dfn(&self, tx: &mut Transaction, name: &StorPoolName) -> Result<()> {
        self.stor_pool_dfns.remove(tx, name)?;
        Ok(())
    }

    /// Tracker named `name`, created on first use
    pub(crate) fn tracker_for(
        &self,
        tx: &mut Transaction,
        name: &FreeSpaceMgrName,
    ) -> Result<Arc<FreeSpaceTracker>> {
        let _guard = self.structure_lock.lock();
        if let Some(tracker) = self.free_space_trackers.get(name) {
            return Ok(tracker);
        }
        let tracker = Arc::new(FreeSpaceTracker::new(name.clone()));
        self.free_space_trackers
            .insert(tx, name.clone(), Arc::clone(&tracker))?;
        Ok(tracker)
    }

    /// Drop a tracker once no pool is registered with it
    pub(crate) fn release_tracker(&self, tx: &mut Transaction, name: &FreeSpaceMgrName) -> Result<()> {
        let _guard = self.structure_lock.lock();
        if let Some(tracker) = self.free_space_trackers.get(name) {
            if tracker.stor_pool_count() == 0 {
                self.free_space_trackers.remove(tx, name)?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Back Reference Resolution
    // =========================================================================

    fn dangling(what: impl std::fmt::Display) -> Error {
        Error::implementation(format!("dangling reference to {}", what))
    }

    pub(crate) fn resolve_node(&self, name: &NodeName) -> Result<Arc<Node>> {
        self.nodes
            .get(name)
            .ok_or_else(|| Self::dangling(format!("node '{}'", name)))
    }

    pub(crate) fn resolve_rsc_dfn(&self, name: &ResourceName) -> Result<Arc<ResourceDefinition>> {
        self.rsc_dfns
            .get(name)
            .ok_or_else(|| Self::dangling(format!("resource definition '{}'", name)))
    }

    pub(crate) fn resolve_stor_pool_dfn(&self, name: &StorPoolName) -> Result<Arc<StorPoolDefinition>> {
        self.stor_pool_dfns
            .get(name)
            .ok_or_else(|| Self::dangling(format!("storage pool definition '{}'", name)))
    }

    pub(crate) fn resolve_resource(&self, key: &ResourceKey) -> Result<Arc<Resource>> {
        self.resolve_node(&key.node)?
            .find_resource(&key.rsc)
            .ok_or_else(|| Self::dangling(format!("resource ({})", key)))
    }

    pub(crate) fn resolve_volume(&self, key: &VolumeKey) -> Result<Arc<Volume>> {
        self.resolve_resource(&key.resource_key())?
            .find_volume(key.vlm_nr)
            .ok_or_else(|| Self::dangling(format!("volume ({})", key)))
    }

    pub(crate) fn resolve_vlm_dfn(&self, key: &VolumeDefinitionKey) -> Result<Arc<VolumeDefinition>> {
        self.resolve_rsc_dfn(&key.rsc)?
            .find_volume_definition(key.vlm_nr)
            .ok_or_else(|| Self::dangling(format!("volume definition ({})", key)))
    }

    pub(crate) fn resolve_stor_pool(&self, key: &StorPoolKey) -> Result<Arc<StorPool>> {
        self.resolve_node(&key.node)?
            .find_stor_pool(&key.stor_pool)
            .ok_or_else(|| Self::dangling(format!("storage pool ({})", key)))
    }

    pub(crate) fn resolve_snapshot_dfn(&self, key: &SnapshotDefinitionKey) -> Result<Arc<SnapshotDefinition>> {
        self.resolve_rsc_dfn(&key.rsc)?
            .find_snapshot_definition(&key.snapshot)
            .ok_or_else(|| Self::dangling(format!("snapshot definition ({})", key)))
    }

    pub(crate) fn resolve_snapshot(&self, key: &SnapshotKey) -> Result<Arc<Snapshot>> {
        self.resolve_snapshot_dfn(&key.definition_key())?
            .find_snapshot(&key.node)
            .ok_or_else(|| Self::dangling(format!("snapshot ({})", key)))
    }

    /// Objects that are not deleted but can no longer be reached from the
    /// registry, for consistency checks
    pub fn dangling_references(&self) -> Vec<String> {
        let mut dangling = Vec::new();
        for rsc_dfn in self.rsc_dfns.values() {
            for rsc in rsc_dfn.find_resources() {
                if rsc.is_deleted() || self.resolve_resource(rsc.key()).is_err() {
                    dangling.push(rsc.object_description());
                }
                for vlm in rsc.find_volumes() {
                    if vlm.is_deleted() || self.resolve_vlm_dfn(&vlm.key().volume_definition_key()).is_err() {
                        dangling.push(vlm.object_description());
                    }
                }
            }
            for vlm_dfn in rsc_dfn.find_volume_definitions() {
                for vlm in vlm_dfn.find_volumes() {
                    if vlm.is_deleted() || self.resolve_volume(vlm.key()).is_err() {
                        dangling.push(vlm.object_description());
                    }
                }
            }
        }
        for node in self.nodes.values() {
            for rsc in node.find_resources() {
                if rsc.is_deleted() || self.find_rsc_dfn(&rsc.key().rsc).is_none() {
                    dangling.push(rsc.object_description());
                }
            }
            for stor_pool in node.find_stor_pools() {
                for vlm_key in stor_pool.find_volumes() {
                    if self.resolve_volume(&vlm_key).is_err() {
                        dangling.push(format!("Volume ({}) placed on {}", vlm_key, stor_pool.object_description()));
                    }
                }
            }
        }
        dangling
    }
}

impl TransactionObject for CoreObjects {
    fn is_dirty(&self) -> bool {
        self.nodes.is_dirty()
            || self.rsc_dfns.is_dirty()
            || self.stor_pool_dfns.is_dirty()
            || self.free_space_trackers.is_dirty()
            || self.nodes.values().iter().any(|node| node.is_dirty())
            || self.rsc_dfns.values().iter().any(|rsc_dfn| rsc_dfn.is_dirty())
            || self.stor_pool_dfns.values().iter().any(|dfn| dfn.is_dirty())
    }

    fn commit(&self) {
        self.nodes.commit();
        self.rsc_dfns.commit();
        self.stor_pool_dfns.commit();
        self.free_space_trackers.commit();
    }

    fn rollback(&self) {
        self.nodes.rollback();
        self.rsc_dfns.rollback();
        self.stor_pool_dfns.rollback();
        self.free_space_trackers.rollback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::test_support::Fixture;
    use assert_matches::assert_matches;

    #[test]
    fn test_map_protection_grants_public_change() {
        let objs = CoreObjects::new(ControllerConfig::default()).unwrap();
        let public = AccessContext::public();

        assert!(objs.nodes(&public).unwrap().is_empty());
        assert!(objs
            .nodes_map_prot()
            .require_access(&public, AccessType::Change)
            .is_ok());
        assert_matches!(
            objs.nodes_map_prot()
                .require_access(&public, AccessType::Control),
            Err(Error::AccessDenied { .. })
        );
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = ControllerConfig::default();
        config.default_peer_slots = 0;
        assert_matches!(CoreObjects::new(config), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_resolve_missing_is_internal_error() {
        let fx = Fixture::new();
        assert_matches!(
            fx.objs.resolve_node(&fx.node_name("ghost")),
            Err(Error::Implementation(_))
        );
    }

    #[test]
    fn test_trackers_are_shared_by_name() {
        let fx = Fixture::new();
        let name = FreeSpaceMgrName::new("shared:thin").unwrap();
        let mut tx = fx.tx();
        let one = fx.objs.tracker_for(&mut tx, &name).unwrap();
        let two = fx.objs.tracker_for(&mut tx, &name).unwrap();
        assert!(Arc::ptr_eq(&one, &two));

        fx.objs.release_tracker(&mut tx, &name).unwrap();
        assert!(fx
            .objs
            .free_space_tracker(&fx.ctx, &name)
            .unwrap()
            .is_none());
    }
}
