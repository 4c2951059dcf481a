//! LINSTOR Core - Controller Metadata
//!
//! The authoritative in-memory object graph of a replicated block storage
//! cluster: nodes, resource and volume definitions, their per-node
//! deployments, storage pools with free space accounting, and snapshots.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                               Factories                                     │
//! │        create (controller)          get_instance_satellite (mirror)         │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                         CoreObjects (registry)                              │
//! │  ┌──────────────┐  ┌───────────────────┐  ┌──────────────────────────────┐  │
//! │  │    Nodes     │  │ Resource Dfns     │  │ Storage Pool Dfns / Trackers │  │
//! │  └──────┬───────┘  └─────────┬─────────┘  └──────────────┬───────────────┘  │
//! │         └── Resources / Volumes / Snapshots / Connections ┘                 │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  Access Gate (ObjectProtection)   │   Number Pools (minor / TCP port)       │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │          Transactions (TxCell / TxMap, journal, commit / rollback)          │
//! │                  PersistenceDriver   │   CoreEvent broadcast                │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`objects`]: Entities, keys and the `CoreObjects` registry
//! - [`factory`]: The only way entities come into existence
//! - [`security`]: Access contexts and object protection
//! - [`transaction`]: Transactional cells, maps and persistence drivers
//! - [`numberpool`]: Range-search allocators for minor numbers and TCP ports
//! - [`identifier`]: Validated names and bounded numbers
//! - [`stateflags`]: Per-entity flag sets
//! - [`events`]: Entity lifecycle events
//! - [`config`]: Controller configuration
//! - [`error`]: Error types and handling

pub mod config;
pub mod error;
pub mod events;
pub mod factory;
pub mod identifier;
pub mod numberpool;
pub mod objects;
pub mod security;
pub mod stateflags;
pub mod transaction;

// Re-export commonly used types
pub use config::{ControllerConfig, NumberRange};

pub use error::{Error, ErrorCategory, Result};

pub use events::CoreEvent;

pub use factory::Factories;

pub use identifier::{
    DrbdNodeId, FreeSpaceMgrName, MinorNumber, NetInterfaceName, NodeName, ResourceName,
    SnapshotName, StorPoolName, TcpPortNumber, VolumeNumber,
};

pub use objects::{
    CoreObjects, DeviceLayerKind, DeviceProviderKind, FreeSpaceTracker, Node, NodeType,
    Resource, ResourceDefinition, Snapshot, SnapshotDefinition, StorPool, StorPoolDefinition,
    Volume, VolumeDefinition,
};

pub use security::{AccessContext, AccessType, ObjectProtection};

pub use transaction::{MemoryDriver, PersistenceDriver, Transaction, TransactionMgr};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
