//! Factories
//!
//! Entities are only ever constructed here. Every factory offers two modes:
//!
//! - `create`: the controller path. Checks the access gate, rejects
//!   duplicates with [`Error::DataAlreadyExists`], allocates identifiers and
//!   capacity, journals the new rows and queues a creation event.
//! - `get_instance_satellite`: the mirror path. Returns the cached object, or
//!   builds it from controller-pushed data (UUID, flag bits, identifiers)
//!   without journaling, events or uniqueness errors.
//!
//! Both modes register the new object with every parent collection inside
//! the caller's transaction, so a rollback removes it again.
//!
//! [`Error::DataAlreadyExists`]: crate::error::Error::DataAlreadyExists

mod node;
mod resource;
mod snapshot;
mod stor_pool;
mod volume;

pub use node::{NetInterfaceFactory, NodeConnectionFactory, NodeFactory};
pub use resource::{ResourceConnectionFactory, ResourceDefinitionFactory, ResourceFactory};
pub use snapshot::{
    SnapshotDefinitionFactory, SnapshotFactory, SnapshotVolumeDefinitionFactory,
    SnapshotVolumeFactory,
};
pub use stor_pool::{StorPoolDefinitionFactory, StorPoolFactory};
pub use volume::{VolumeConnectionFactory, VolumeDefinitionFactory, VolumeFactory};

use crate::error::{Error, Result};
use crate::objects::CoreObjects;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// One instance of every factory, sharing a registry
#[derive(Debug, Clone)]
pub struct Factories {
    pub node: NodeFactory,
    pub net_interface: NetInterfaceFactory,
    pub node_connection: NodeConnectionFactory,
    pub rsc_dfn: ResourceDefinitionFactory,
    pub resource: ResourceFactory,
    pub rsc_connection: ResourceConnectionFactory,
    pub vlm_dfn: VolumeDefinitionFactory,
    pub volume: VolumeFactory,
    pub vlm_connection: VolumeConnectionFactory,
    pub stor_pool_dfn: StorPoolDefinitionFactory,
    pub stor_pool: StorPoolFactory,
    pub snapshot_dfn: SnapshotDefinitionFactory,
    pub snapshot_vlm_dfn: SnapshotVolumeDefinitionFactory,
    pub snapshot: SnapshotFactory,
    pub snapshot_vlm: SnapshotVolumeFactory,
}

impl Factories {
    pub fn new(objs: Arc<CoreObjects>) -> Self {
        Self {
            node: NodeFactory::new(Arc::clone(&objs)),
            net_interface: NetInterfaceFactory::new(Arc::clone(&objs)),
            node_connection: NodeConnectionFactory::new(Arc::clone(&objs)),
            rsc_dfn: ResourceDefinitionFactory::new(Arc::clone(&objs)),
            resource: ResourceFactory::new(Arc::clone(&objs)),
            rsc_connection: ResourceConnectionFactory::new(Arc::clone(&objs)),
            vlm_dfn: VolumeDefinitionFactory::new(Arc::clone(&objs)),
            volume: VolumeFactory::new(Arc::clone(&objs)),
            vlm_connection: VolumeConnectionFactory::new(Arc::clone(&objs)),
            stor_pool_dfn: StorPoolDefinitionFactory::new(Arc::clone(&objs)),
            stor_pool: StorPoolFactory::new(Arc::clone(&objs)),
            snapshot_dfn: SnapshotDefinitionFactory::new(Arc::clone(&objs)),
            snapshot_vlm_dfn: SnapshotVolumeDefinitionFactory::new(Arc::clone(&objs)),
            snapshot: SnapshotFactory::new(Arc::clone(&objs)),
            snapshot_vlm: SnapshotVolumeFactory::new(objs),
        }
    }
}

/// A mirrored object keeps the identity the controller assigned to it
fn check_mirrored_uuid(existing: Uuid, pushed: Uuid, object: impl fmt::Display) -> Result<()> {
    if existing == pushed {
        Ok(())
    } else {
        Err(Error::implementation(format!(
            "{} is mirrored with UUID {}, controller sent {}",
            object, existing, pushed
        )))
    }
}

/// Rejects a connection whose two endpoints are the same node
fn check_not_loop(kind: &'static str, nodes: &crate::objects::NodePair) -> Result<()> {
    if nodes.is_loop() {
        return Err(Error::InvalidName {
            kind,
            name: nodes.to_string(),
            reason: "both endpoints are the same node".into(),
        });
    }
    Ok(())
}
