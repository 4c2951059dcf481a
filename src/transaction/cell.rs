//! Tracked Values and Collections
//!
//! [`TxCell`] and [`TxMap`] are cheap handles (`Arc` inside) around a value
//! and its last committed snapshot. Readers always observe the current value;
//! the snapshot only exists between the first mutation in a transaction and
//! the following commit or rollback. A cell belongs to one transaction at a
//! time, a map tracks each of its keys separately.

use super::{Transaction, TransactionObject};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Shared Snapshot State
// =============================================================================

#[derive(Debug)]
struct Tracked<T> {
    current: T,
    committed: Option<T>,
    /// Transaction holding the snapshot
    owner: u64,
}

impl<T: Clone> Tracked<T> {
    fn new(value: T) -> Self {
        Self {
            current: value,
            committed: None,
            owner: 0,
        }
    }

    /// Snapshot the committed value, returns true on the first mutation
    ///
    /// An object stays enlisted in one transaction until that transaction
    /// commits or rolls back.
    fn touch(&mut self, tx_id: u64) -> Result<bool> {
        match self.committed {
            None => {
                self.committed = Some(self.current.clone());
                self.owner = tx_id;
                Ok(true)
            }
            Some(_) if self.owner == tx_id => Ok(false),
            Some(_) => Err(Error::implementation(format!(
                "object enlisted in transaction {} was mutated by transaction {}",
                self.owner, tx_id
            ))),
        }
    }
}

#[derive(Debug)]
struct Shared<T> {
    state: Mutex<Tracked<T>>,
}

impl<T: Clone + Send + 'static> TransactionObject for Shared<T> {
    fn is_dirty(&self) -> bool {
        self.state.lock().committed.is_some()
    }

    fn commit(&self) {
        self.state.lock().committed = None;
    }

    fn rollback(&self) {
        let mut state = self.state.lock();
        if let Some(committed) = state.committed.take() {
            state.current = committed;
        }
    }
}

/// Run `f` against the tracked state, registering the object with `tx` if
/// this is its first mutation
fn mutate<T, R>(
    shared: &Arc<Shared<T>>,
    tx: &mut Transaction,
    f: impl FnOnce(&mut T) -> Result<R>,
) -> Result<R>
where
    T: Clone + Send + 'static,
{
    tx.ensure_active()?;
    let (result, first) = {
        let mut state = shared.state.lock();
        let first = state.touch(tx.id())?;
        let mut working = state.current.clone();
        match f(&mut working) {
            Ok(result) => {
                state.current = working;
                (Ok(result), first)
            }
            Err(err) => {
                if first {
                    state.committed = None;
                }
                (Err(err), false)
            }
        }
    };
    if first {
        let obj: Arc<dyn TransactionObject> = shared.clone();
        tx.register(obj);
    }
    result
}

// =============================================================================
// TxCell
// =============================================================================

/// A single tracked value
pub struct TxCell<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + 'static> TxCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(Tracked::new(value)),
            }),
        }
    }

    /// Current value
    pub fn get(&self) -> T {
        self.shared.state.lock().current.clone()
    }

    /// Read the current value without cloning it
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.shared.state.lock().current)
    }

    /// Replace the value, returning the previous one
    pub fn set(&self, tx: &mut Transaction, value: T) -> Result<T> {
        mutate(&self.shared, tx, |current| Ok(std::mem::replace(current, value)))
    }

    /// Apply a fallible change; the value is only updated if `f` succeeds
    pub fn update<R>(
        &self,
        tx: &mut Transaction,
        f: impl FnOnce(&mut T) -> Result<R>,
    ) -> Result<R> {
        mutate(&self.shared, tx, f)
    }

    /// Last committed value (the current value if nothing is pending)
    pub fn committed(&self) -> T {
        let state = self.shared.state.lock();
        state
            .committed
            .as_ref()
            .unwrap_or(&state.current)
            .clone()
    }
}

impl<T> Clone for TxCell<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for TxCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("TxCell")
            .field("current", &state.current)
            .field("dirty", &state.committed.is_some())
            .finish()
    }
}

impl<T: Clone + Send + 'static> TransactionObject for TxCell<T> {
    fn is_dirty(&self) -> bool {
        self.shared.is_dirty()
    }

    fn commit(&self) {
        self.shared.commit()
    }

    fn rollback(&self) {
        self.shared.rollback()
    }
}

// =============================================================================
// TxMap
// =============================================================================

/// Committed value of a key touched by an open transaction
#[derive(Debug)]
struct PendingKey<V> {
    owner: u64,
    committed: Option<V>,
}

#[derive(Debug)]
struct KeyedState<K, V> {
    current: BTreeMap<K, V>,
    pending: BTreeMap<K, PendingKey<V>>,
}

impl<K: Ord + Clone, V: Clone> KeyedState<K, V> {
    fn enlisted(&self, tx_id: u64) -> bool {
        self.pending.values().any(|pending| pending.owner == tx_id)
    }

    fn check_owner(&self, key: &K, tx_id: u64) -> Result<()> {
        match self.pending.get(key) {
            Some(pending) if pending.owner != tx_id => Err(Error::implementation(format!(
                "map entry enlisted in transaction {} was mutated by transaction {}",
                pending.owner, tx_id
            ))),
            _ => Ok(()),
        }
    }

    fn pending_elsewhere(&self, tx_id: u64) -> impl Iterator<Item = &K> {
        self.pending
            .iter()
            .filter(move |(_, pending)| pending.owner != tx_id)
            .map(|(key, _)| key)
    }

    fn touch(&mut self, key: &K, tx_id: u64) {
        if !self.pending.contains_key(key) {
            let committed = self.current.get(key).cloned();
            self.pending.insert(
                key.clone(),
                PendingKey {
                    owner: tx_id,
                    committed,
                },
            );
        }
    }

    fn restore(&mut self, key: K, committed: Option<V>) {
        match committed {
            Some(value) => {
                self.current.insert(key, value);
            }
            None => {
                self.current.remove(&key);
            }
        }
    }

    fn settle(&mut self, owner: Option<u64>, restore: bool) {
        let keys: Vec<K> = self
            .pending
            .iter()
            .filter(|(_, pending)| owner.map_or(true, |id| pending.owner == id))
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            if let Some(pending) = self.pending.remove(&key) {
                if restore {
                    self.restore(key, pending.committed);
                }
            }
        }
    }
}

#[derive(Debug)]
struct KeyedShared<K, V> {
    state: Mutex<KeyedState<K, V>>,
}

/// The entries of one map touched by one transaction
struct Enlistment<K, V> {
    shared: Arc<KeyedShared<K, V>>,
    tx_id: u64,
}

impl<K, V> TransactionObject for Enlistment<K, V>
where
    K: Ord + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn is_dirty(&self) -> bool {
        self.shared.state.lock().enlisted(self.tx_id)
    }

    fn commit(&self) {
        self.shared.state.lock().settle(Some(self.tx_id), false)
    }

    fn rollback(&self) {
        self.shared.state.lock().settle(Some(self.tx_id), true)
    }
}

/// An ordered tracked map
///
/// Entries are tracked one by one: transactions touching disjoint keys of a
/// shared map do not conflict. Lookups return clones so no lock is held
/// across calls into other objects.
pub struct TxMap<K, V> {
    shared: Arc<KeyedShared<K, V>>,
}

impl<K, V> TxMap<K, V>
where
    K: Ord + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::from_map(BTreeMap::new())
    }

    pub fn from_map(map: BTreeMap<K, V>) -> Self {
        Self {
            shared: Arc::new(KeyedShared {
                state: Mutex::new(KeyedState {
                    current: map,
                    pending: BTreeMap::new(),
                }),
            }),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.shared.state.lock().current.get(key).cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.shared.state.lock().current.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().current.is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.shared.state.lock().current.keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<V> {
        self.shared.state.lock().current.values().cloned().collect()
    }

    pub fn entries(&self) -> Vec<(K, V)> {
        self.shared
            .state
            .lock()
            .current
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Snapshot of the current map
    pub fn to_map(&self) -> BTreeMap<K, V> {
        self.shared.state.lock().current.clone()
    }

    /// Whether a transaction other than `tx_id` holds `key` uncommitted
    pub fn is_pending_elsewhere(&self, key: &K, tx_id: u64) -> bool {
        self.shared
            .state
            .lock()
            .pending
            .get(key)
            .is_some_and(|pending| pending.owner != tx_id)
    }

    /// Keys held uncommitted by transactions other than `tx_id`
    pub fn keys_pending_elsewhere(&self, tx_id: u64) -> Vec<K> {
        self.shared
            .state
            .lock()
            .pending_elsewhere(tx_id)
            .cloned()
            .collect()
    }

    /// Touch `keys` on behalf of `tx` and run `f` on the map
    fn mutate<R>(
        &self,
        tx: &mut Transaction,
        keys: &[K],
        f: impl FnOnce(&mut BTreeMap<K, V>) -> R,
    ) -> Result<R> {
        tx.ensure_active()?;
        let tx_id = tx.id();
        let (result, first) = {
            let mut state = self.shared.state.lock();
            for key in keys {
                state.check_owner(key, tx_id)?;
            }
            let first = !state.enlisted(tx_id);
            for key in keys {
                state.touch(key, tx_id);
            }
            (f(&mut state.current), first)
        };
        if first && !keys.is_empty() {
            tx.register(Arc::new(Enlistment {
                shared: Arc::clone(&self.shared),
                tx_id,
            }));
        }
        Ok(result)
    }

    pub fn insert(&self, tx: &mut Transaction, key: K, value: V) -> Result<Option<V>> {
        let keys = [key.clone()];
        self.mutate(tx, &keys, |map| map.insert(key, value))
    }

    pub fn remove(&self, tx: &mut Transaction, key: &K) -> Result<Option<V>> {
        // a miss must not register the map with the transaction
        if !self.contains_key(key) {
            tx.ensure_active()?;
            return Ok(None);
        }
        self.mutate(tx, std::slice::from_ref(key), |map| map.remove(key))
    }

    pub fn clear(&self, tx: &mut Transaction) -> Result<()> {
        let keys = self.keys();
        if keys.is_empty() {
            return tx.ensure_active();
        }
        self.mutate(tx, &keys, |map| map.clear())
    }
}

impl<K, V> Default for TxMap<K, V>
where
    K: Ord + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Clone for TxMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K: fmt::Debug, V> fmt::Debug for TxMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("TxMap")
            .field("keys", &state.current.keys().collect::<Vec<_>>())
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl<K, V> TransactionObject for TxMap<K, V>
where
    K: Ord + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn is_dirty(&self) -> bool {
        !self.shared.state.lock().pending.is_empty()
    }

    fn commit(&self) {
        self.shared.state.lock().settle(None, false)
    }

    fn rollback(&self) {
        self.shared.state.lock().settle(None, true)
    }
}
