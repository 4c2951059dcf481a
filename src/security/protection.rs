//! Object Protection
//!
//! Owner, creator and access control list of one protected object.

use super::{AccessContext, AccessType, Identity, Privilege, Role};
use crate::error::{Error, Result};
use crate::identifier::{NodeName, ResourceName, SnapshotName, StorPoolName};
use crate::transaction::{
    DbOp, ObjectKind, Transaction, TransactionObject, TxCell, TxMap,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

const PATH_NODES: &str = "/nodes/";
const PATH_RESOURCES: &str = "/resources/";
const PATH_RESOURCE_DEFINITIONS: &str = "/resourcedefinitions/";
const PATH_STOR_POOL_DEFINITIONS: &str = "/storpooldefinitions/";
const PATH_SNAPSHOT_DEFINITIONS: &str = "/snapshotdefinitions/";
const PATH_CONTROLLER: &str = "/sys/controller/";
const PATH_SATELLITE: &str = "/sys/satellite/";

/// Access control record attached to a protected object
#[derive(Debug)]
pub struct ObjectProtection {
    path: String,
    creator: TxCell<Identity>,
    owner: TxCell<Role>,
    acl: TxMap<Role, AccessType>,
}

impl ObjectProtection {
    /// Unpersisted protection; the creating role is granted CONTROL
    pub fn new(ctx: &AccessContext, path: impl Into<String>) -> Self {
        let mut acl = BTreeMap::new();
        acl.insert(ctx.role.clone(), AccessType::Control);
        Self {
            path: path.into(),
            creator: TxCell::new(ctx.identity.clone()),
            owner: TxCell::new(ctx.role.clone()),
            acl: TxMap::from_map(acl),
        }
    }

    /// Unpersisted protection with additional ACL entries next to the
    /// creator's CONTROL entry
    pub(crate) fn with_acl_entries(
        ctx: &AccessContext,
        path: impl Into<String>,
        entries: &[(Role, AccessType)],
    ) -> Self {
        let mut acl = BTreeMap::new();
        for (role, access) in entries {
            acl.insert(role.clone(), *access);
        }
        acl.insert(ctx.role.clone(), AccessType::Control);
        Self {
            path: path.into(),
            creator: TxCell::new(ctx.identity.clone()),
            owner: TxCell::new(ctx.role.clone()),
            acl: TxMap::from_map(acl),
        }
    }

    /// Protection for a new object, journaling its rows
    pub(crate) fn create(
        ctx: &AccessContext,
        tx: &mut Transaction,
        path: impl Into<String>,
    ) -> Result<Arc<Self>> {
        let prot = Self::new(ctx, path);
        tx.journal(DbOp::create(ObjectKind::ObjectProtection, prot.path.clone()))?;
        tx.journal(DbOp::update(
            ObjectKind::AclEntry,
            prot.acl_row(&ctx.role),
            "access",
        ))?;
        Ok(Arc::new(prot))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn acl_row(&self, role: &Role) -> String {
        format!("{}:{}", self.path, role)
    }

    // =========================================================================
    // Access Checks
    // =========================================================================

    /// Highest level granted to `ctx`, by privilege or by ACL entry
    pub fn query_access(&self, ctx: &AccessContext) -> Option<AccessType> {
        let by_privilege = ctx.privileges.access_override();
        let by_acl = self.acl.get(&ctx.role);
        by_privilege.max(by_acl)
    }

    /// Fail with [`Error::AccessDenied`] unless `ctx` holds `requested`
    pub fn require_access(&self, ctx: &AccessContext, requested: AccessType) -> Result<()> {
        match self.query_access(ctx) {
            Some(granted) if granted.has_access(requested) => Ok(()),
            granted => {
                debug!(
                    path = %self.path,
                    subject = %ctx,
                    requested = %requested,
                    granted = ?granted,
                    "access denied"
                );
                Err(Error::AccessDenied {
                    object: self.path.clone(),
                    requested,
                })
            }
        }
    }

    // =========================================================================
    // Owner & Creator
    // =========================================================================

    pub fn creator(&self) -> Identity {
        self.creator.get()
    }

    pub fn owner(&self) -> Role {
        self.owner.get()
    }

    /// Change the owner; needs the object-owner privilege
    pub fn set_owner(&self, ctx: &AccessContext, tx: &mut Transaction, owner: Role) -> Result<()> {
        if !ctx.privileges.has_privilege(Privilege::ObjOwner) {
            return Err(Error::AccessDenied {
                object: format!("owner of {}", self.path),
                requested: AccessType::Control,
            });
        }
        self.owner.set(tx, owner)?;
        tx.journal(DbOp::update(ObjectKind::ObjectProtection, self.path.clone(), "owner"))
    }

    /// Reset the creator to the calling identity; needs every privilege
    pub fn reset_creator(&self, ctx: &AccessContext, tx: &mut Transaction) -> Result<()> {
        if !ctx.privileges.has_privilege(Privilege::SysAll) {
            return Err(Error::AccessDenied {
                object: format!("creator of {}", self.path),
                requested: AccessType::Control,
            });
        }
        self.creator.set(tx, ctx.identity.clone())?;
        tx.journal(DbOp::update(ObjectKind::ObjectProtection, self.path.clone(), "creator"))
    }

    // =========================================================================
    // Access Control List
    // =========================================================================

    pub fn acl_entries(&self) -> Vec<(Role, AccessType)> {
        self.acl.entries()
    }

    pub fn acl_entry(&self, role: &Role) -> Option<AccessType> {
        self.acl.get(role)
    }

    /// A non-owner may only edit ACL entries of other roles unless it holds
    /// the object-control privilege
    fn require_acl_edit(&self, ctx: &AccessContext, entry_role: &Role) -> Result<()> {
        if ctx.role == self.owner.get() {
            return Ok(());
        }
        self.require_access(ctx, AccessType::Control)?;
        if &ctx.role == entry_role && !ctx.privileges.has_privilege(Privilege::ObjControl) {
            return Err(Error::AccessDenied {
                object: format!("access control entry of role {} on {}", entry_role, self.path),
                requested: AccessType::Control,
            });
        }
        Ok(())
    }

    pub fn add_acl_entry(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        role: Role,
        access: AccessType,
    ) -> Result<()> {
        self.require_acl_edit(ctx, &role)?;
        let row = self.acl_row(&role);
        self.acl.insert(tx, role, access)?;
        tx.journal(DbOp::update(ObjectKind::AclEntry, row, "access"))
    }

    pub fn del_acl_entry(&self, ctx: &AccessContext, tx: &mut Transaction, role: &Role) -> Result<()> {
        self.require_acl_edit(ctx, role)?;
        if self.acl.remove(tx, role)?.is_some() {
            tx.journal(DbOp::delete(ObjectKind::AclEntry, self.acl_row(role)))?;
        }
        Ok(())
    }

    /// Remove the protection and its ACL; needs CONTROL
    pub fn delete(&self, ctx: &AccessContext, tx: &mut Transaction) -> Result<()> {
        self.require_access(ctx, AccessType::Control)?;
        self.acl.clear(tx)?;
        tx.journal(DbOp::delete(ObjectKind::AclEntry, self.path.clone()))?;
        tx.journal(DbOp::delete(ObjectKind::ObjectProtection, self.path.clone()))
    }

    // =========================================================================
    // Paths
    // =========================================================================

    pub fn path_node(node: &NodeName) -> String {
        format!("{}{}", PATH_NODES, node.value())
    }

    pub fn path_resource(node: &NodeName, rsc: &ResourceName) -> String {
        format!("{}{}/{}", PATH_RESOURCES, node.value(), rsc.value())
    }

    pub fn path_resource_definition(rsc: &ResourceName) -> String {
        format!("{}{}", PATH_RESOURCE_DEFINITIONS, rsc.value())
    }

    pub fn path_stor_pool_definition(stor_pool: &StorPoolName) -> String {
        format!("{}{}", PATH_STOR_POOL_DEFINITIONS, stor_pool.value())
    }

    pub fn path_snapshot_definition(rsc: &ResourceName, snapshot: &SnapshotName) -> String {
        format!("{}{}/{}", PATH_SNAPSHOT_DEFINITIONS, rsc.value(), snapshot.value())
    }

    pub fn path_controller(sub_path: &str) -> String {
        format!("{}{}", PATH_CONTROLLER, sub_path)
    }

    pub fn path_satellite(sub_path: &str) -> String {
        format!("{}{}", PATH_SATELLITE, sub_path)
    }
}

impl TransactionObject for ObjectProtection {
    fn is_dirty(&self) -> bool {
        self.creator.is_dirty() || self.owner.is_dirty() || self.acl.is_dirty()
    }

    fn commit(&self) {
        self.creator.commit();
        self.owner.commit();
        self.acl.commit();
    }

    fn rollback(&self) {
        self.creator.rollback();
        self.owner.rollback();
        self.acl.rollback();
    }
}
