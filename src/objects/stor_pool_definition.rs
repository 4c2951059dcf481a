//! Storage Pool Definition
//!
//! Cluster wide name of a storage pool, instantiated once per node.

use super::{
    AccessControlled, CoreObjects, Props, PropsOwner, StorPool, StorPoolDefinitionApi,
};
use crate::error::{Error, Result};
use crate::events::CoreEvent;
use crate::identifier::{NodeName, StorPoolName};
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::transaction::{
    composite_transaction_object, DbOp, ObjectKind, Transaction, TransactionObject, TxCell, TxMap,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug)]
pub struct StorPoolDefinition {
    uuid: Uuid,
    name: StorPoolName,
    prot: Arc<ObjectProtection>,
    props: Props,
    stor_pools: TxMap<NodeName, Arc<StorPool>>,
    deleted: TxCell<bool>,
    structure_lock: Mutex<()>,
}

impl StorPoolDefinition {
    pub(crate) fn new(uuid: Uuid, name: StorPoolName, prot: Arc<ObjectProtection>, props: Props) -> Self {
        Self {
            uuid,
            name,
            prot,
            props,
            stor_pools: TxMap::new(),
            deleted: TxCell::new(false),
            structure_lock: Mutex::new(()),
        }
    }

    pub fn uuid(&self) -> Result<Uuid> {
        self.check_deleted()?;
        Ok(self.uuid)
    }

    pub fn name(&self) -> &StorPoolName {
        &self.name
    }

    pub fn prot(&self) -> Result<&Arc<ObjectProtection>> {
        self.check_deleted()?;
        Ok(&self.prot)
    }

    pub fn stor_pool(&self, ctx: &AccessContext, node: &NodeName) -> Result<Option<Arc<StorPool>>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.stor_pools.get(node))
    }

    pub fn stor_pools(&self, ctx: &AccessContext) -> Result<Vec<Arc<StorPool>>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.stor_pools.values())
    }

    pub fn stor_pool_count(&self) -> Result<usize> {
        self.check_deleted()?;
        Ok(self.stor_pools.len())
    }

    pub(crate) fn find_stor_pool(&self, node: &NodeName) -> Option<Arc<StorPool>> {
        self.stor_pools.get(node)
    }

    pub(crate) fn put_stor_pool(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        stor_pool: Arc<StorPool>,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Use)?;
        let _guard = self.structure_lock.lock();
        self.stor_pools
            .insert(tx, stor_pool.key().node.clone(), stor_pool)?;
        Ok(())
    }

    pub(crate) fn remove_stor_pool(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        node: &NodeName,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Use)?;
        let _guard = self.structure_lock.lock();
        self.stor_pools.remove(tx, node)?;
        Ok(())
    }

    pub fn api_data(&self, ctx: &AccessContext) -> Result<StorPoolDefinitionApi> {
        self.gate(ctx, AccessType::View)?;
        Ok(StorPoolDefinitionApi {
            uuid: self.uuid,
            name: self.name.display_name().to_string(),
            props: self.props.entries(),
        })
    }

    /// Delete every pool of this definition, then the definition itself
    ///
    /// Fails with [`Error::InUse`] while any pool still holds volumes.
    pub fn delete(&self, ctx: &AccessContext, tx: &mut Transaction, objs: &CoreObjects) -> Result<()> {
        let _guard = objs.lock_structure();
        if self.is_deleted() {
            return Ok(());
        }
        self.prot.require_access(ctx, AccessType::Control)?;

        for stor_pool in self.stor_pools.values() {
            stor_pool.delete(ctx, tx, objs)?;
        }

        objs.remove_stor_pool_dfn(tx, &self.name)?;
        self.props.delete(tx)?;
        self.prot.delete(ctx, tx)?;
        tx.journal(DbOp::delete(ObjectKind::StorPoolDefinition, self.name.value()))?;
        tx.emit(CoreEvent::StorPoolDefinitionDeleted {
            stor_pool: self.name.display_name().to_string(),
        });
        self.deleted.set(tx, true)?;

        info!(stor_pool = %self.name, "storage pool definition deleted");
        Ok(())
    }

    fn sub_objects(&self) -> Vec<&dyn TransactionObject> {
        vec![&self.props, &self.stor_pools, &self.deleted]
    }

    fn child_objects(&self) -> Vec<Arc<dyn TransactionObject>> {
        self.stor_pools
            .values()
            .into_iter()
            .map(|pool| pool as Arc<dyn TransactionObject>)
            .collect()
    }
}

composite_transaction_object!(StorPoolDefinition);

impl AccessControlled for StorPoolDefinition {
    fn object_description(&self) -> String {
        format!("StorPoolDefinition: '{}'", self.name)
    }

    fn is_deleted(&self) -> bool {
        self.deleted.get()
    }

    fn require_access(&self, ctx: &AccessContext, requested: AccessType) -> Result<()> {
        self.prot.require_access(ctx, requested)
    }
}

impl PropsOwner for StorPoolDefinition {
    fn props_container(&self) -> &Props {
        &self.props
    }
}
