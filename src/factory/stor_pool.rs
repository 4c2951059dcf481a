//! Storage pool definition and storage pool factories

use super::check_mirrored_uuid;
use crate::error::{Error, Result};
use crate::events::CoreEvent;
use crate::identifier::{FreeSpaceMgrName, StorPoolName};
use crate::objects::{
    AccessControlled, CoreObjects, DeviceProviderKind, Node, Props, StorPool, StorPoolDefinition,
    StorPoolKey,
};
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::transaction::{DbOp, ObjectKind, Transaction};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

// =============================================================================
// Storage Pool Definition
// =============================================================================

#[derive(Debug, Clone)]
pub struct StorPoolDefinitionFactory {
    objs: Arc<CoreObjects>,
}

impl StorPoolDefinitionFactory {
    pub fn new(objs: Arc<CoreObjects>) -> Self {
        Self { objs }
    }

    pub fn create(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        name: StorPoolName,
    ) -> Result<Arc<StorPoolDefinition>> {
        let _guard = self.objs.lock_structure();
        self.objs
            .stor_pool_dfn_map_prot()
            .require_access(ctx, AccessType::Change)?;
        if self.objs.find_stor_pool_dfn(&name).is_some() {
            return Err(Error::already_exists("storage pool definition", &name));
        }

        let path = ObjectProtection::path_stor_pool_definition(&name);
        let prot = ObjectProtection::create(ctx, tx, path.clone())?;
        let dfn = Arc::new(StorPoolDefinition::new(
            Uuid::new_v4(),
            name.clone(),
            prot,
            Props::new(path),
        ));
        self.objs.put_stor_pool_dfn(tx, Arc::clone(&dfn))?;
        tx.journal(DbOp::create(ObjectKind::StorPoolDefinition, name.value()))?;
        tx.emit(CoreEvent::StorPoolDefinitionCreated {
            stor_pool: name.display_name().to_string(),
        });

        info!(stor_pool = %name, "storage pool definition created");
        Ok(dfn)
    }

    pub fn get_instance_satellite(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        uuid: Uuid,
        name: StorPoolName,
    ) -> Result<Arc<StorPoolDefinition>> {
        let _guard = self.objs.lock_structure();
        if let Some(dfn) = self.objs.find_stor_pool_dfn(&name) {
            check_mirrored_uuid(dfn.uuid()?, uuid, &name)?;
            return Ok(dfn);
        }

        let path = ObjectProtection::path_stor_pool_definition(&name);
        let prot = Arc::new(ObjectProtection::new(ctx, path.clone()));
        let dfn = Arc::new(StorPoolDefinition::new(uuid, name, prot, Props::new(path)));
        self.objs.put_stor_pool_dfn(tx, Arc::clone(&dfn))?;

        debug!(stor_pool = %dfn.name(), "storage pool definition mirrored");
        Ok(dfn)
    }
}

// =============================================================================
// Storage Pool
// =============================================================================

#[derive(Debug, Clone)]
pub struct StorPoolFactory {
    objs: Arc<CoreObjects>,
}

impl StorPoolFactory {
    pub fn new(objs: Arc<CoreObjects>) -> Self {
        Self { objs }
    }

    fn build(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        uuid: Uuid,
        node: &Node,
        dfn: &StorPoolDefinition,
        provider: DeviceProviderKind,
        free_space_mgr: Option<FreeSpaceMgrName>,
    ) -> Result<Arc<StorPool>> {
        let key = StorPoolKey::new(node.name().clone(), dfn.name().clone());
        let tracker_name =
            free_space_mgr.unwrap_or_else(|| FreeSpaceMgrName::for_stor_pool(node.name(), dfn.name()));
        let tracker = self.objs.tracker_for(tx, &tracker_name)?;
        let stor_pool = Arc::new(StorPool::new(
            uuid,
            key,
            provider,
            Arc::clone(node.prot()?),
            Arc::clone(dfn.prot()?),
            Arc::clone(&tracker),
        ));
        tracker.add(ctx, tx, &stor_pool)?;
        node.put_stor_pool(ctx, tx, Arc::clone(&stor_pool))?;
        dfn.put_stor_pool(ctx, tx, Arc::clone(&stor_pool))?;
        Ok(stor_pool)
    }

    /// Create the pool of `dfn` on `node`
    ///
    /// Needs CHANGE on the node and USE on the definition. Without
    /// `free_space_mgr` the pool gets a tracker of its own; pools naming the
    /// same tracker share their free space accounting.
    pub fn create(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        node: &Node,
        dfn: &StorPoolDefinition,
        provider: DeviceProviderKind,
        free_space_mgr: Option<FreeSpaceMgrName>,
    ) -> Result<Arc<StorPool>> {
        let _guard = self.objs.lock_structure();
        node.gate(ctx, AccessType::Change)?;
        dfn.gate(ctx, AccessType::Use)?;
        if node.find_stor_pool(dfn.name()).is_some() {
            return Err(Error::already_exists(
                "storage pool",
                StorPoolKey::new(node.name().clone(), dfn.name().clone()),
            ));
        }

        let stor_pool = self.build(ctx, tx, Uuid::new_v4(), node, dfn, provider, free_space_mgr)?;
        tx.journal(DbOp::create(ObjectKind::StorPool, stor_pool.key().db_key()))?;
        tx.emit(CoreEvent::StorPoolCreated {
            node: node.name().display_name().to_string(),
            stor_pool: dfn.name().display_name().to_string(),
        });

        info!(
            stor_pool = %stor_pool.key(),
            provider = ?provider,
            free_space_mgr = %stor_pool.free_space_mgr_name(),
            "storage pool created"
        );
        Ok(stor_pool)
    }

    pub fn get_instance_satellite(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        uuid: Uuid,
        node: &Node,
        dfn: &StorPoolDefinition,
        provider: DeviceProviderKind,
        free_space_mgr: Option<FreeSpaceMgrName>,
    ) -> Result<Arc<StorPool>> {
        let _guard = self.objs.lock_structure();
        if let Some(stor_pool) = node.find_stor_pool(dfn.name()) {
            check_mirrored_uuid(stor_pool.uuid()?, uuid, stor_pool.key())?;
            return Ok(stor_pool);
        }

        let stor_pool = self.build(ctx, tx, uuid, node, dfn, provider, free_space_mgr)?;
        debug!(stor_pool = %stor_pool.key(), "storage pool mirrored");
        Ok(stor_pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionMgr;
    use crate::objects::test_support::Fixture;
    use assert_matches::assert_matches;

    #[test]
    fn test_definition_duplicate() {
        let fx = Fixture::new();
        fx.stor_pool_dfn("pool");

        let mut tx = fx.tx();
        assert_matches!(
            fx.factories
                .stor_pool_dfn
                .create(&fx.ctx, &mut tx, fx.stor_pool_name("Pool")),
            Err(Error::DataAlreadyExists { .. })
        );
    }

    #[test]
    fn test_pool_registered_with_tracker() {
        let fx = Fixture::new();
        let pool = fx.stor_pool("alpha", "pool");
        let tracker = pool.free_space_tracker(&fx.ctx).unwrap();

        assert!(!pool.is_shared());
        assert_eq!(tracker.stor_pools(), vec![pool.key().clone()]);
        assert!(fx
            .objs
            .free_space_tracker(&fx.ctx, pool.free_space_mgr_name())
            .unwrap()
            .is_some());
        let from_dfn = fx
            .stor_pool_dfn("pool")
            .stor_pool(&fx.ctx, &fx.node_name("alpha"))
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&from_dfn, &pool));
    }

    #[test]
    fn test_shared_tracker() {
        let fx = Fixture::new();
        let node = fx.node("alpha");
        let shared = FreeSpaceMgrName::new("alpha-shared").unwrap();

        let mut tx = fx.tx();
        let mut pools = Vec::new();
        for name in ["first", "second"] {
            let dfn = fx
                .factories
                .stor_pool_dfn
                .create(&fx.ctx, &mut tx, fx.stor_pool_name(name))
                .unwrap();
            let pool = fx
                .factories
                .stor_pool
                .create(
                    &fx.ctx,
                    &mut tx,
                    &node,
                    &dfn,
                    DeviceProviderKind::Diskless,
                    Some(shared.clone()),
                )
                .unwrap();
            pools.push(pool);
        }
        tx.commit().unwrap();

        assert!(pools.iter().all(|pool| pool.is_shared()));
        let tracker = pools[0].free_space_tracker(&fx.ctx).unwrap();
        assert!(Arc::ptr_eq(&tracker, &pools[1].free_space_tracker(&fx.ctx).unwrap()));
        assert_eq!(tracker.stor_pool_count(), 2);
    }

    #[test]
    fn test_pool_duplicate_on_node() {
        let fx = Fixture::new();
        let pool = fx.stor_pool("alpha", "pool");

        let mut tx = fx.tx();
        assert_matches!(
            fx.factories.stor_pool.create(
                &fx.ctx,
                &mut tx,
                &fx.node("alpha"),
                &fx.stor_pool_dfn("pool"),
                DeviceProviderKind::Lvm,
                None
            ),
            Err(Error::DataAlreadyExists { .. })
        );
        assert_eq!(pool.free_space_tracker(&fx.ctx).unwrap().stor_pool_count(), 1);
    }

    #[test]
    fn test_rollback_drops_tracker() {
        let fx = Fixture::new();
        let node = fx.node("alpha");
        let dfn = fx.stor_pool_dfn("pool");

        let mut tx = fx.tx();
        let pool = fx
            .factories
            .stor_pool
            .create(&fx.ctx, &mut tx, &node, &dfn, DeviceProviderKind::LvmThin, None)
            .unwrap();
        let tracker_name = pool.free_space_mgr_name().clone();
        tx.rollback();

        assert_eq!(node.stor_pool_count().unwrap(), 0);
        assert_eq!(dfn.stor_pool_count().unwrap(), 0);
        assert!(fx
            .objs
            .free_space_tracker(&fx.ctx, &tracker_name)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_satellite_pool_is_idempotent() {
        let objs = CoreObjects::new(Default::default()).unwrap();
        let mgr = TransactionMgr::satellite(16);
        let factories = crate::factory::Factories::new(Arc::clone(&objs));
        let ctx = AccessContext::system();
        let node_uuid = Uuid::new_v4();
        let pool_uuid = Uuid::new_v4();

        let mut tx = mgr.begin();
        let node = factories
            .node
            .get_instance_satellite(
                &ctx,
                &mut tx,
                node_uuid,
                crate::identifier::NodeName::new("alpha").unwrap(),
                crate::objects::NodeType::Satellite,
                0,
            )
            .unwrap();
        let dfn = factories
            .stor_pool_dfn
            .get_instance_satellite(&ctx, &mut tx, Uuid::new_v4(), StorPoolName::new("pool").unwrap())
            .unwrap();
        let first = factories
            .stor_pool
            .get_instance_satellite(&ctx, &mut tx, pool_uuid, &node, &dfn, DeviceProviderKind::Zfs, None)
            .unwrap();
        let second = factories
            .stor_pool
            .get_instance_satellite(&ctx, &mut tx, pool_uuid, &node, &dfn, DeviceProviderKind::Zfs, None)
            .unwrap();
        assert!(tx.pending_ops().is_empty());
        tx.commit().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(node.stor_pool_count().unwrap(), 1);
    }
}
