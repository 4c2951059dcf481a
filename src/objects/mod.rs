//! Entity Graph
//!
//! Nodes, resource and volume definitions, resources, volumes, storage pools
//! and the snapshot family. Each entity owns an [`ObjectProtection`] (or
//! borrows its parent's), a transactional flag set and a properties
//! container, and exposes a two-step deletion lifecycle:
//!
//! ```text
//! ACTIVE ──mark_deleted (USE)──▶ PENDING_DELETE ──delete (CONTROL)──▶ DELETED
//! ```
//!
//! Deletion cascades deepest-first through owned children, releases
//! reserved capacity and identifiers, and finally flips the `deleted` flag;
//! every later accessor call fails with [`Error::AccessToDeletedData`].
//!
//! [`ObjectProtection`]: crate::security::ObjectProtection

mod api;
mod connection;
mod core_objects;
mod free_space;
mod keys;
mod layer;
mod net_interface;
mod node;
mod props;
mod resource;
mod resource_definition;
mod snapshot;
mod snapshot_definition;
mod snapshot_volume;
mod snapshot_volume_definition;
mod stor_pool;
mod stor_pool_definition;
mod volume;
mod volume_definition;

#[cfg(test)]
pub(crate) mod test_support;

pub use api::{
    FreeSpaceApi, NetInterfaceApi, NodeApi, ResourceApi, ResourceConnectionApi,
    ResourceDefinitionApi, SnapshotApi, SnapshotDefinitionApi, SnapshotVolumeApi,
    SnapshotVolumeDefinitionApi, StorPoolApi, StorPoolDefinitionApi, VolumeApi,
    VolumeDefinitionApi,
};
pub use connection::{NodeConnection, ResourceConnection, VolumeConnection};
pub use core_objects::CoreObjects;
pub use free_space::FreeSpaceTracker;
pub use keys::{
    NetInterfaceKey, NodePair, ReservationKey, ResourceConnectionKey, ResourceKey,
    SnapshotDefinitionKey, SnapshotKey, SnapshotVolumeDefinitionKey, SnapshotVolumeKey,
    StorPoolKey, VolumeConnectionKey, VolumeDefinitionKey, VolumeKey,
};
pub use layer::{
    default_layer_stack, generate_shared_secret, validate_layer_stack, DeviceLayerKind,
    DeviceProviderKind, DrbdRscDfnData, DrbdVlmDfnData, TransportType,
    DEFAULT_THIN_OVERSUBSCRIPTION_RATIO, KEY_MAX_OVERSUBSCRIPTION_RATIO,
};
pub use net_interface::{EncryptionType, NetInterface};
pub use node::{Node, NodeType, PeerId};
pub use props::Props;
pub use resource::{Resource, ResourceRuntime};
pub use resource_definition::ResourceDefinition;
pub use snapshot::Snapshot;
pub use snapshot_definition::SnapshotDefinition;
pub use snapshot_volume::SnapshotVolume;
pub use snapshot_volume_definition::SnapshotVolumeDefinition;
pub use stor_pool::StorPool;
pub use stor_pool_definition::StorPoolDefinition;
pub use volume::Volume;
pub use volume_definition::{check_volume_size, VolumeDefinition, DRBD_MAX_KIB, DRBD_MIN_NET_KIB};

use crate::error::{Error, Result};
use crate::security::{AccessContext, AccessType};
use crate::transaction::Transaction;
use std::collections::BTreeMap;

// =============================================================================
// Capability Traits
// =============================================================================

/// Objects guarded by the access gate
pub trait AccessControlled {
    /// Human readable identification used in errors and logs
    fn object_description(&self) -> String;

    fn is_deleted(&self) -> bool;

    /// Check `requested` against every protection guarding this object
    fn require_access(&self, ctx: &AccessContext, requested: AccessType) -> Result<()>;

    /// Fail with [`Error::AccessToDeletedData`] once deleted
    fn check_deleted(&self) -> Result<()> {
        if self.is_deleted() {
            let object = self.object_description();
            tracing::warn!(object = %object, "access to deleted object");
            Err(Error::AccessToDeletedData { object })
        } else {
            Ok(())
        }
    }

    /// Deleted check followed by the access check
    fn gate(&self, ctx: &AccessContext, requested: AccessType) -> Result<()> {
        self.check_deleted()?;
        self.require_access(ctx, requested)
    }
}

/// Objects carrying a [`Props`] container
///
/// Reads need VIEW, writes need CHANGE.
pub trait PropsOwner: AccessControlled {
    fn props_container(&self) -> &Props;

    fn prop(&self, ctx: &AccessContext, key: &str) -> Result<Option<String>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.props_container().get(key))
    }

    fn props(&self, ctx: &AccessContext) -> Result<BTreeMap<String, String>> {
        self.gate(ctx, AccessType::View)?;
        Ok(self.props_container().entries())
    }

    fn set_prop(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        key: &str,
        value: &str,
    ) -> Result<Option<String>> {
        self.gate(ctx, AccessType::Change)?;
        self.props_container().set(tx, key, value)
    }

    fn remove_prop(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        key: &str,
    ) -> Result<Option<String>> {
        self.gate(ctx, AccessType::Change)?;
        self.props_container().remove(tx, key)
    }
}

/// Objects with the two-step deletion lifecycle
pub trait Deletable: AccessControlled {
    /// Announce the pending deletion by setting the DELETE flag
    fn mark_deleted(&self, ctx: &AccessContext, tx: &mut Transaction) -> Result<()>;

    /// Cascading, idempotent delete; needs CONTROL
    fn delete(&self, ctx: &AccessContext, tx: &mut Transaction, objs: &CoreObjects) -> Result<()>;
}
