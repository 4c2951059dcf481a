//! Network Interface
//!
//! An address of a node. Guarded by the node's protection.

use super::{AccessControlled, CoreObjects, NetInterfaceApi, NetInterfaceKey};
use crate::error::Result;
use crate::identifier::{NetInterfaceName, NodeName, TcpPortNumber};
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::transaction::{DbOp, ObjectKind, Transaction, TransactionObject, TxCell};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Transport encryption of the controller to satellite connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EncryptionType {
    Plain,
    Ssl,
}

impl fmt::Display for EncryptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncryptionType::Plain => f.write_str("PLAIN"),
            EncryptionType::Ssl => f.write_str("SSL"),
        }
    }
}

#[derive(Debug)]
pub struct NetInterface {
    uuid: Uuid,
    key: NetInterfaceKey,
    node_prot: Arc<ObjectProtection>,
    address: TxCell<IpAddr>,
    /// Satellite connection endpoint, if the controller may connect here
    stlt_conn: TxCell<Option<(TcpPortNumber, EncryptionType)>>,
    deleted: TxCell<bool>,
}

impl NetInterface {
    pub(crate) fn new(
        uuid: Uuid,
        key: NetInterfaceKey,
        node_prot: Arc<ObjectProtection>,
        address: IpAddr,
        stlt_conn: Option<(TcpPortNumber, EncryptionType)>,
    ) -> Self {
        Self {
            uuid,
            key,
            node_prot,
            address: TxCell::new(address),
            stlt_conn: TxCell::new(stlt_conn),
            deleted: TxCell::new(false),
        }
    }

    pub fn uuid(&self) -> Result<Uuid> {
        self.check_deleted()?;
        Ok(self.uuid)
    }

    pub fn name(&self) -> &NetInterfaceName {
        &self.key.name
    }

    pub fn node_name(&self) -> &NodeName {
        &self.key.node
    }

    pub fn key(&self) -> &NetInterfaceKey {
        &self.key
    }

    pub fn address(&self, ctx: &AccessContext) -> Result<IpAddr> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.address.get())
    }

    pub fn set_address(&self, ctx: &AccessContext, tx: &mut Transaction, address: IpAddr) -> Result<IpAddr> {
        self.gate(ctx, AccessType::Change)?;
        let old = self.address.set(tx, address)?;
        tx.journal(DbOp::update(ObjectKind::NetInterface, self.key.db_key(), "address"))?;
        Ok(old)
    }

    pub fn stlt_conn(&self, ctx: &AccessContext) -> Result<Option<(TcpPortNumber, EncryptionType)>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.stlt_conn.get())
    }

    pub fn set_stlt_conn(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        port: TcpPortNumber,
        encryption: EncryptionType,
    ) -> Result<()> {
        self.gate(ctx, AccessType::Change)?;
        self.stlt_conn.set(tx, Some((port, encryption)))?;
        tx.journal(DbOp::update(ObjectKind::NetInterface, self.key.db_key(), "stlt_conn"))
    }

    pub fn clear_stlt_conn(&self, ctx: &AccessContext, tx: &mut Transaction) -> Result<()> {
        self.gate(ctx, AccessType::Change)?;
        if self.stlt_conn.set(tx, None)?.is_some() {
            tx.journal(DbOp::update(ObjectKind::NetInterface, self.key.db_key(), "stlt_conn"))?;
        }
        Ok(())
    }

    pub fn api_data(&self, ctx: &AccessContext) -> Result<NetInterfaceApi> {
        self.gate(ctx, AccessType::View)?;
        let stlt_conn = self.stlt_conn.get();
        Ok(NetInterfaceApi {
            uuid: self.uuid,
            name: self.key.name.display_name().to_string(),
            address: self.address.get(),
            stlt_port: stlt_conn.map(|(port, _)| port.value()),
            stlt_encryption: stlt_conn.map(|(_, encryption)| encryption),
        })
    }

    /// Remove the interface from its node; idempotent, needs CONTROL
    pub fn delete(&self, ctx: &AccessContext, tx: &mut Transaction, objs: &CoreObjects) -> Result<()> {
        let _guard = objs.lock_structure();
        if self.is_deleted() {
            return Ok(());
        }
        self.node_prot.require_access(ctx, AccessType::Control)?;

        objs.resolve_node(&self.key.node)?
            .remove_net_interface(ctx, tx, &self.key.name)?;
        tx.journal(DbOp::delete(ObjectKind::NetInterface, self.key.db_key()))?;
        self.deleted.set(tx, true)?;

        debug!(net_if = %self.key, "network interface deleted");
        Ok(())
    }
}

impl TransactionObject for NetInterface {
    fn is_dirty(&self) -> bool {
        self.address.is_dirty() || self.stlt_conn.is_dirty() || self.deleted.is_dirty()
    }

    fn commit(&self) {
        self.address.commit();
        self.stlt_conn.commit();
        self.deleted.commit();
    }

    fn rollback(&self) {
        self.address.rollback();
        self.stlt_conn.rollback();
        self.deleted.rollback();
    }
}

impl AccessControlled for NetInterface {
    fn object_description(&self) -> String {
        format!("NetInterface: {}", self.key)
    }

    fn is_deleted(&self) -> bool {
        self.deleted.get()
    }

    fn require_access(&self, ctx: &AccessContext, requested: AccessType) -> Result<()> {
        self.node_prot.require_access(ctx, requested)
    }
}
