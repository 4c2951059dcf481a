//! Transactional Object Protocol
//!
//! Every entity of the object graph is composed of tracked cells and maps.
//! The first mutation of a tracked object inside a [`Transaction`] snapshots
//! its last committed value and registers it with the transaction, so the
//! whole graph commits or rolls back as one unit of work.
//!
//! ```text
//! ┌──────────────┐  set()/insert()   ┌──────────────┐  apply(batch)  ┌────────────────────┐
//! │ TxCell/TxMap │ ────────────────▶ │ Transaction  │ ─────────────▶ │ PersistenceDriver  │
//! │ (snapshot)   │    register()     │ dirty + ops  │                │ (memory/satellite) │
//! └──────────────┘                   └──────────────┘                └────────────────────┘
//! ```

mod cell;
mod manager;
mod persistence;

pub use cell::{TxCell, TxMap};
pub use manager::{Transaction, TransactionMgr, TransactionState};
pub use persistence::{
    DbAction, DbOp, MemoryDriver, ObjectKind, PersistenceDriver, PersistenceStats,
    SatelliteDriver,
};

/// Contract implemented by every tracked value, collection and entity
///
/// Composite objects report the union of their sub-objects' dirty state and
/// delegate `commit`/`rollback` to them.
pub trait TransactionObject: Send + Sync {
    /// True if this object or any composed sub-object has uncommitted changes
    fn is_dirty(&self) -> bool;

    /// Accept the current in-memory state as the committed state
    fn commit(&self);

    /// Restore the last committed state
    fn rollback(&self);
}

/// Implements [`TransactionObject`] for an entity that exposes
/// `sub_objects()` (its own tracked fields) and `child_objects()` (owned
/// entities further down the graph).
macro_rules! composite_transaction_object {
    ($ty:ty) => {
        impl $crate::transaction::TransactionObject for $ty {
            fn is_dirty(&self) -> bool {
                self.sub_objects().into_iter().any(|obj| obj.is_dirty())
                    || self.child_objects().into_iter().any(|obj| obj.is_dirty())
            }

            fn commit(&self) {
                for obj in self.sub_objects() {
                    obj.commit();
                }
                for obj in self.child_objects() {
                    obj.commit();
                }
            }

            fn rollback(&self) {
                for obj in self.sub_objects() {
                    obj.rollback();
                }
                for obj in self.child_objects() {
                    obj.rollback();
                }
            }
        }
    };
}

pub(crate) use composite_transaction_object;
