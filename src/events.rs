//! Core Events
//!
//! Creation, update and deletion hooks of the object graph. Events are queued
//! in the transaction and broadcast only after a successful commit, so
//! consumers such as the satellite sync layer never observe rolled back work.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events emitted by committed transactions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CoreEvent {
    /// A node was created
    NodeCreated { node: String, uuid: Uuid },

    /// A node was deleted
    NodeDeleted { node: String },

    ResourceDefinitionCreated { rsc: String, uuid: Uuid },

    ResourceDefinitionDeleted { rsc: String },

    /// A resource was deployed to a node
    ResourceCreated { node: String, rsc: String, uuid: Uuid },

    ResourceDeleted { node: String, rsc: String },

    VolumeDefinitionCreated { rsc: String, vlm_nr: i32 },

    VolumeDefinitionDeleted { rsc: String, vlm_nr: i32 },

    VolumeCreated { node: String, rsc: String, vlm_nr: i32 },

    VolumeDeleted { node: String, rsc: String, vlm_nr: i32 },

    StorPoolDefinitionCreated { stor_pool: String },

    StorPoolDefinitionDeleted { stor_pool: String },

    StorPoolCreated { node: String, stor_pool: String },

    StorPoolDeleted { node: String, stor_pool: String },

    SnapshotDefinitionCreated { rsc: String, snapshot: String },

    SnapshotDefinitionDeleted { rsc: String, snapshot: String },

    SnapshotCreated { node: String, rsc: String, snapshot: String },

    SnapshotDeleted { node: String, rsc: String, snapshot: String },

    /// An object was marked for deletion
    MarkedDeleted { object: String },

    /// Free space of a tracker was updated by the storage layer
    FreeSpaceUpdated {
        free_space_mgr: String,
        free_capacity_kib: Option<u64>,
        total_capacity_kib: Option<u64>,
    },
}

impl CoreEvent {
    /// Get the node name associated with this event, if any
    pub fn node(&self) -> Option<&str> {
        match self {
            CoreEvent::NodeCreated { node, .. }
            | CoreEvent::NodeDeleted { node }
            | CoreEvent::ResourceCreated { node, .. }
            | CoreEvent::ResourceDeleted { node, .. }
            | CoreEvent::VolumeCreated { node, .. }
            | CoreEvent::VolumeDeleted { node, .. }
            | CoreEvent::StorPoolCreated { node, .. }
            | CoreEvent::StorPoolDeleted { node, .. }
            | CoreEvent::SnapshotCreated { node, .. }
            | CoreEvent::SnapshotDeleted { node, .. } => Some(node),
            _ => None,
        }
    }

    /// Get the resource name associated with this event, if any
    pub fn resource(&self) -> Option<&str> {
        match self {
            CoreEvent::ResourceDefinitionCreated { rsc, .. }
            | CoreEvent::ResourceDefinitionDeleted { rsc }
            | CoreEvent::ResourceCreated { rsc, .. }
            | CoreEvent::ResourceDeleted { rsc, .. }
            | CoreEvent::VolumeDefinitionCreated { rsc, .. }
            | CoreEvent::VolumeDefinitionDeleted { rsc, .. }
            | CoreEvent::VolumeCreated { rsc, .. }
            | CoreEvent::VolumeDeleted { rsc, .. }
            | CoreEvent::SnapshotDefinitionCreated { rsc, .. }
            | CoreEvent::SnapshotDefinitionDeleted { rsc, .. }
            | CoreEvent::SnapshotCreated { rsc, .. }
            | CoreEvent::SnapshotDeleted { rsc, .. } => Some(rsc),
            _ => None,
        }
    }

    pub fn is_creation(&self) -> bool {
        matches!(
            self,
            CoreEvent::NodeCreated { .. }
                | CoreEvent::ResourceDefinitionCreated { .. }
                | CoreEvent::ResourceCreated { .. }
                | CoreEvent::VolumeDefinitionCreated { .. }
                | CoreEvent::VolumeCreated { .. }
                | CoreEvent::StorPoolDefinitionCreated { .. }
                | CoreEvent::StorPoolCreated { .. }
                | CoreEvent::SnapshotDefinitionCreated { .. }
                | CoreEvent::SnapshotCreated { .. }
        )
    }

    pub fn is_deletion(&self) -> bool {
        matches!(
            self,
            CoreEvent::NodeDeleted { .. }
                | CoreEvent::ResourceDefinitionDeleted { .. }
                | CoreEvent::ResourceDeleted { .. }
                | CoreEvent::VolumeDefinitionDeleted { .. }
                | CoreEvent::VolumeDeleted { .. }
                | CoreEvent::StorPoolDefinitionDeleted { .. }
                | CoreEvent::StorPoolDeleted { .. }
                | CoreEvent::SnapshotDefinitionDeleted { .. }
                | CoreEvent::SnapshotDeleted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_accessors() {
        let event = CoreEvent::ResourceCreated {
            node: "alpha".into(),
            rsc: "data".into(),
            uuid: Uuid::new_v4(),
        };
        assert_eq!(event.node(), Some("alpha"));
        assert_eq!(event.resource(), Some("data"));
        assert!(event.is_creation());
        assert!(!event.is_deletion());
    }

    #[test]
    fn test_event_serialization() {
        let event = CoreEvent::FreeSpaceUpdated {
            free_space_mgr: "alpha:pool".into(),
            free_capacity_kib: Some(1024),
            total_capacity_kib: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        let parsed: CoreEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
        assert_eq!(parsed.node(), None);
    }
}
