//! Transaction Lifecycle
//!
//! A [`Transaction`] collects the tracked objects touched by a unit of work,
//! the persistence operations journaled for them and the events to publish
//! once the work is durable.

use super::{DbOp, PersistenceDriver, SatelliteDriver, TransactionObject};
use crate::error::{Error, Result};
use crate::events::CoreEvent;
use indexmap::IndexMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

fn next_transaction_id() -> u64 {
    NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Lifecycle state of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

/// A unit of work over the object graph
pub struct Transaction {
    id: u64,
    state: TransactionState,
    driver: Arc<dyn PersistenceDriver>,
    journal: Vec<DbOp>,
    /// Registered objects keyed by address, in registration order
    dirty: IndexMap<usize, Arc<dyn TransactionObject>>,
    events: Vec<CoreEvent>,
    event_tx: Option<broadcast::Sender<CoreEvent>>,
}

impl Transaction {
    /// Standalone transaction without event publication
    pub fn new(driver: Arc<dyn PersistenceDriver>) -> Self {
        Self::with_id(next_transaction_id(), driver, None)
    }

    fn with_id(
        id: u64,
        driver: Arc<dyn PersistenceDriver>,
        event_tx: Option<broadcast::Sender<CoreEvent>>,
    ) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            driver,
            journal: Vec::new(),
            dirty: IndexMap::new(),
            events: Vec::new(),
            event_tx,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Fail with [`Error::NoActiveTransaction`] once committed or rolled back
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::NoActiveTransaction)
        }
    }

    /// Number of registered objects
    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Operations journaled so far
    pub fn pending_ops(&self) -> &[DbOp] {
        &self.journal
    }

    /// Events queued for publication on commit
    pub fn pending_events(&self) -> &[CoreEvent] {
        &self.events
    }

    pub(crate) fn register(&mut self, obj: Arc<dyn TransactionObject>) {
        let key = Arc::as_ptr(&obj) as *const () as usize;
        self.dirty.entry(key).or_insert(obj);
    }

    pub(crate) fn journal(&mut self, op: DbOp) -> Result<()> {
        self.ensure_active()?;
        self.journal.push(op);
        Ok(())
    }

    pub(crate) fn emit(&mut self, event: CoreEvent) {
        self.events.push(event);
    }

    /// Persist the journal and accept all in-memory changes
    ///
    /// If the driver rejects the batch nothing is committed and the
    /// transaction stays active, so the caller can still roll back.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_active()?;

        if !self.journal.is_empty() {
            self.driver.apply(&self.journal)?;
        }

        for obj in self.dirty.values() {
            obj.commit();
        }

        debug!(
            tx = self.id,
            objects = self.dirty.len(),
            ops = self.journal.len(),
            driver = self.driver.name(),
            "transaction committed"
        );

        self.dirty.clear();
        self.journal.clear();
        self.state = TransactionState::Committed;

        let events = std::mem::take(&mut self.events);
        if let Some(sender) = &self.event_tx {
            for event in events {
                // no receivers is fine
                let _ = sender.send(event);
            }
        }
        Ok(())
    }

    /// Restore every registered object to its committed state
    ///
    /// A no-op on a transaction that is no longer active.
    pub fn rollback(&mut self) {
        if !self.is_active() {
            return;
        }
        for obj in self.dirty.values().rev() {
            obj.rollback();
        }
        debug!(tx = self.id, objects = self.dirty.len(), "transaction rolled back");

        self.dirty.clear();
        self.journal.clear();
        self.events.clear();
        self.state = TransactionState::RolledBack;
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.is_active() && (!self.dirty.is_empty() || !self.journal.is_empty()) {
            warn!(
                tx = self.id,
                objects = self.dirty.len(),
                "transaction dropped with pending changes, rolling back"
            );
            self.rollback();
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("driver", &self.driver.name())
            .field("dirty", &self.dirty.len())
            .field("journal", &self.journal)
            .finish()
    }
}

// =============================================================================
// Transaction Manager
// =============================================================================

/// Opens transactions against one persistence driver and owns the event
/// channel they publish to
pub struct TransactionMgr {
    driver: Arc<dyn PersistenceDriver>,
    event_tx: broadcast::Sender<CoreEvent>,
    opened: AtomicU64,
}

impl TransactionMgr {
    pub fn new(driver: Arc<dyn PersistenceDriver>, event_capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(event_capacity.max(1));
        Self {
            driver,
            event_tx,
            opened: AtomicU64::new(0),
        }
    }

    /// Manager for a satellite, whose changes are never persisted
    pub fn satellite(event_capacity: usize) -> Self {
        Self::new(Arc::new(SatelliteDriver::new()), event_capacity)
    }

    pub fn begin(&self) -> Transaction {
        self.opened.fetch_add(1, Ordering::Relaxed);
        Transaction::with_id(
            next_transaction_id(),
            Arc::clone(&self.driver),
            Some(self.event_tx.clone()),
        )
    }

    /// Subscribe to committed events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_tx.subscribe()
    }

    /// Number of transactions opened through this manager
    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    pub fn driver(&self) -> &Arc<dyn PersistenceDriver> {
        &self.driver
    }
}

impl fmt::Debug for TransactionMgr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionMgr")
            .field("driver", &self.driver.name())
            .field("opened", &self.opened.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{MemoryDriver, ObjectKind, TxCell};

    #[test]
    fn test_commit_applies_journal_and_publishes() {
        let driver = Arc::new(MemoryDriver::new());
        let mgr = TransactionMgr::new(driver.clone(), 16);
        let mut rx = mgr.subscribe();

        let mut tx = mgr.begin();
        tx.journal(DbOp::create(ObjectKind::Node, "ALPHA")).unwrap();
        tx.emit(CoreEvent::NodeDeleted {
            node: "alpha".into(),
        });
        tx.commit().unwrap();

        assert_eq!(tx.state(), TransactionState::Committed);
        assert!(driver.contains(ObjectKind::Node, "ALPHA"));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_rollback_discards_events() {
        let mgr = TransactionMgr::satellite(16);
        let mut rx = mgr.subscribe();
        let cell = TxCell::new(1);

        let mut tx = mgr.begin();
        cell.set(&mut tx, 5).unwrap();
        tx.emit(CoreEvent::NodeDeleted {
            node: "alpha".into(),
        });
        tx.rollback();

        assert_eq!(cell.get(), 1);
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_failed_commit_stays_active() {
        let driver = Arc::new(MemoryDriver::new());
        let mgr = TransactionMgr::new(driver.clone(), 16);
        let cell = TxCell::new("old".to_string());

        let mut setup = mgr.begin();
        setup.journal(DbOp::create(ObjectKind::Node, "ALPHA")).unwrap();
        setup.commit().unwrap();

        let mut tx = mgr.begin();
        cell.set(&mut tx, "new".into()).unwrap();
        tx.journal(DbOp::create(ObjectKind::Node, "ALPHA")).unwrap();

        assert!(tx.commit().is_err());
        assert!(tx.is_active());
        assert!(cell.is_dirty());

        tx.rollback();
        assert_eq!(cell.get(), "old");
    }

    #[test]
    fn test_drop_rolls_back() {
        let mgr = TransactionMgr::satellite(4);
        let cell = TxCell::new(7u16);
        {
            let mut tx = mgr.begin();
            cell.set(&mut tx, 8).unwrap();
        }
        assert_eq!(cell.get(), 7);
        assert!(!cell.is_dirty());
    }

    #[test]
    fn test_transaction_ids_increase() {
        let mgr = TransactionMgr::satellite(4);
        let first = mgr.begin();
        let second = mgr.begin();
        assert!(second.id() > first.id());
    }
}
