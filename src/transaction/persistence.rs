//! Persistence Drivers
//!
//! A transaction hands its journal to a [`PersistenceDriver`] as one batch.
//! The driver either applies the whole batch or rejects it without side
//! effects.

use crate::error::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, warn};

// =============================================================================
// Journal Operations
// =============================================================================

/// Kind of persisted row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKind {
    Node,
    NetInterface,
    NodeConnection,
    ResourceDefinition,
    Resource,
    ResourceConnection,
    VolumeDefinition,
    Volume,
    VolumeConnection,
    StorPoolDefinition,
    StorPool,
    SnapshotDefinition,
    SnapshotVolumeDefinition,
    Snapshot,
    SnapshotVolume,
    ObjectProtection,
    AclEntry,
    Props,
}

impl ObjectKind {
    /// Key-value rows are upserted and deleted by container prefix
    pub fn is_key_value(self) -> bool {
        matches!(self, ObjectKind::Props | ObjectKind::AclEntry)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Row operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DbAction {
    Create,
    Update { field: String },
    Delete,
}

/// One journaled persistence operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbOp {
    pub kind: ObjectKind,
    pub key: String,
    pub action: DbAction,
}

impl DbOp {
    pub fn create(kind: ObjectKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
            action: DbAction::Create,
        }
    }

    pub fn update(kind: ObjectKind, key: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
            action: DbAction::Update {
                field: field.into(),
            },
        }
    }

    pub fn delete(kind: ObjectKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
            action: DbAction::Delete,
        }
    }
}

// =============================================================================
// Driver Trait
// =============================================================================

/// Backing store of the object graph
pub trait PersistenceDriver: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Apply a batch atomically
    ///
    /// A duplicate create fails with [`Error::DataAlreadyExists`]; deleting
    /// an absent row succeeds.
    fn apply(&self, ops: &[DbOp]) -> Result<()>;
}

// =============================================================================
// Satellite Driver
// =============================================================================

/// Driver for satellites: the controller owns persistence, so every batch
/// is accepted and discarded
#[derive(Debug, Default)]
pub struct SatelliteDriver;

impl SatelliteDriver {
    pub fn new() -> Self {
        Self
    }
}

impl PersistenceDriver for SatelliteDriver {
    fn name(&self) -> &str {
        "satellite"
    }

    fn apply(&self, _ops: &[DbOp]) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Memory Driver
// =============================================================================

/// Counters of applied operations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceStats {
    pub batches: u64,
    pub creates: u64,
    pub updates: u64,
    pub deletes: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, Default)]
struct Row {
    updates: u64,
}

/// In-memory row store backed by DashMap
pub struct MemoryDriver {
    rows: DashMap<(ObjectKind, String), Row>,
    /// Serializes batches so validation and application see the same rows
    apply_lock: Mutex<()>,
    fail_next: AtomicBool,
    batches: AtomicU64,
    creates: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    rejected: AtomicU64,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            apply_lock: Mutex::new(()),
            fail_next: AtomicBool::new(false),
            batches: AtomicU64::new(0),
            creates: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Check if a row exists
    pub fn contains(&self, kind: ObjectKind, key: &str) -> bool {
        self.rows.contains_key(&(kind, key.to_string()))
    }

    /// Number of rows of one kind
    pub fn row_count(&self, kind: ObjectKind) -> usize {
        self.rows.iter().filter(|entry| entry.key().0 == kind).count()
    }

    /// Number of updates applied to a row
    pub fn update_count(&self, kind: ObjectKind, key: &str) -> u64 {
        self.rows
            .get(&(kind, key.to_string()))
            .map(|row| row.updates)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> PersistenceStats {
        PersistenceStats {
            batches: self.batches.load(Ordering::Relaxed),
            creates: self.creates.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Make the next batch fail, simulating a store outage
    pub fn fail_next_batch(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    fn row_present(&self, staged: &HashMap<(ObjectKind, String), bool>, id: &(ObjectKind, String)) -> bool {
        staged
            .get(id)
            .copied()
            .unwrap_or_else(|| self.rows.contains_key(id))
    }

    fn validate(&self, ops: &[DbOp]) -> Result<()> {
        let mut staged: HashMap<(ObjectKind, String), bool> = HashMap::new();
        for op in ops {
            let id = (op.kind, op.key.clone());
            let present = self.row_present(&staged, &id);
            match &op.action {
                DbAction::Create => {
                    if present {
                        return Err(Error::already_exists(op.kind.to_string(), &op.key));
                    }
                    staged.insert(id, true);
                }
                DbAction::Update { field } => {
                    if staged.get(&id) == Some(&false) {
                        return Err(Error::Persistence(format!(
                            "update of field '{}' on deleted row {} '{}'",
                            field, op.kind, op.key
                        )));
                    }
                    staged.insert(id, true);
                }
                DbAction::Delete => {
                    staged.insert(id, false);
                }
            }
        }
        Ok(())
    }

    fn apply_one(&self, op: &DbOp) {
        let id = (op.kind, op.key.clone());
        match &op.action {
            DbAction::Create => {
                self.rows.insert(id, Row::default());
                self.creates.fetch_add(1, Ordering::Relaxed);
            }
            DbAction::Update { .. } => {
                self.rows.entry(id).or_default().updates += 1;
                self.updates.fetch_add(1, Ordering::Relaxed);
            }
            DbAction::Delete => {
                self.rows.remove(&id);
                if op.kind.is_key_value() {
                    let prefix = format!("{}:", op.key);
                    self.rows
                        .retain(|(kind, key), _| !(*kind == op.kind && key.starts_with(&prefix)));
                }
                self.deletes.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDriver")
            .field("rows", &self.rows.len())
            .field("stats", &self.stats())
            .finish()
    }
}

impl PersistenceDriver for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    fn apply(&self, ops: &[DbOp]) -> Result<()> {
        let _guard = self.apply_lock.lock();

        if self.fail_next.swap(false, Ordering::SeqCst) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(ops = ops.len(), "memory driver rejected batch (injected failure)");
            return Err(Error::Persistence("injected store failure".into()));
        }

        if let Err(err) = self.validate(ops) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(error = %err, ops = ops.len(), "memory driver rejected batch");
            return Err(err);
        }

        for op in ops {
            self.apply_one(op);
        }
        self.batches.fetch_add(1, Ordering::Relaxed);
        debug!(ops = ops.len(), rows = self.rows.len(), "batch applied");
        Ok(())
    }
}
