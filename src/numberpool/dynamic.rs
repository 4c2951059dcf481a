//! Dynamic Number Pool
//!
//! A named, bounded pool of integers. Allocations are transactional, so a
//! rolled back transaction releases the numbers it took. A number another
//! open transaction allocated or released counts as occupied until that
//! transaction settles.

use super::get_free_number;
use crate::error::{Error, Result};
use crate::transaction::{Transaction, TxMap};
use parking_lot::Mutex;
use tracing::debug;

/// Global pool of minor numbers or TCP ports
#[derive(Debug)]
pub struct DynamicNumberPool {
    name: &'static str,
    start: i32,
    end: i32,
    occupied: TxMap<i32, ()>,
    /// Where the next automatic search starts; also serializes allocations
    offset: Mutex<i32>,
}

impl DynamicNumberPool {
    pub fn new(name: &'static str, start: i32, end: i32) -> Self {
        Self {
            name,
            start,
            end,
            occupied: TxMap::new(),
            offset: Mutex::new(start),
        }
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn range(&self) -> (i32, i32) {
        (self.start, self.end)
    }

    /// Reserve a specific number
    pub fn allocate(&self, tx: &mut Transaction, nr: i32) -> Result<()> {
        if !(self.start..=self.end).contains(&nr) {
            return Err(Error::ValueOutOfRange {
                kind: self.name,
                value: nr as i64,
                min: self.start as i64,
                max: self.end as i64,
            });
        }
        let _guard = self.offset.lock();
        if self.occupied.contains_key(&nr) || self.occupied.is_pending_elsewhere(&nr, tx.id()) {
            return Err(Error::ValueInUse {
                kind: self.name,
                value: nr as i64,
            });
        }
        self.occupied.insert(tx, nr, ())?;
        debug!(pool = self.name, nr, "number allocated");
        Ok(())
    }

    /// Reserve the next free number after the rotating offset
    pub fn auto_allocate(&self, tx: &mut Transaction) -> Result<i32> {
        let mut offset = self.offset.lock();
        let mut occupied = self.occupied.keys();
        occupied.extend(self.occupied.keys_pending_elsewhere(tx.id()));
        occupied.sort_unstable();
        let nr = get_free_number(&occupied, *offset, self.start, self.end).map_err(|_| {
            Error::ExhaustedPool {
                pool: self.name.to_string(),
                start: self.start,
                end: self.end,
            }
        })?;
        self.occupied.insert(tx, nr, ())?;
        *offset = if nr >= self.end { self.start } else { nr + 1 };
        debug!(pool = self.name, nr, next_offset = *offset, "number auto-allocated");
        Ok(nr)
    }

    /// Release a number; releasing a free number is a no-op
    pub fn deallocate(&self, tx: &mut Transaction, nr: i32) -> Result<()> {
        if self.occupied.remove(tx, &nr)?.is_some() {
            debug!(pool = self.name, nr, "number released");
        }
        Ok(())
    }

    pub fn is_allocated(&self, nr: i32) -> bool {
        self.occupied.contains_key(&nr)
    }

    pub fn allocated_count(&self) -> usize {
        self.occupied.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::SatelliteDriver;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn tx() -> Transaction {
        Transaction::new(Arc::new(SatelliteDriver::new()))
    }

    #[test]
    fn test_auto_allocate_rotates() {
        let pool = DynamicNumberPool::new("minor number", 1000, 1002);
        let mut tx = tx();

        assert_eq!(pool.auto_allocate(&mut tx).unwrap(), 1000);
        assert_eq!(pool.auto_allocate(&mut tx).unwrap(), 1001);
        pool.deallocate(&mut tx, 1000).unwrap();

        // offset is past the released number
        assert_eq!(pool.auto_allocate(&mut tx).unwrap(), 1002);
        assert_eq!(pool.auto_allocate(&mut tx).unwrap(), 1000);
        assert_matches!(
            pool.auto_allocate(&mut tx),
            Err(Error::ExhaustedPool { start: 1000, end: 1002, .. })
        );
    }

    #[test]
    fn test_allocate_explicit() {
        let pool = DynamicNumberPool::new("TCP port", 7000, 7999);
        let mut tx = tx();

        pool.allocate(&mut tx, 7005).unwrap();
        assert!(pool.is_allocated(7005));
        assert_matches!(pool.allocate(&mut tx, 7005), Err(Error::ValueInUse { value: 7005, .. }));
        assert_matches!(pool.allocate(&mut tx, 8000), Err(Error::ValueOutOfRange { .. }));
    }

    #[test]
    fn test_rollback_releases_allocation() {
        let pool = DynamicNumberPool::new("TCP port", 7000, 7999);
        let mut tx = tx();
        let port = pool.auto_allocate(&mut tx).unwrap();
        tx.rollback();

        assert!(!pool.is_allocated(port));
        assert_eq!(pool.allocated_count(), 0);
    }

    #[test]
    fn test_concurrent_transactions_get_distinct_numbers() {
        let pool = DynamicNumberPool::new("minor number", 1000, 1010);
        let mut first = tx();
        let mut second = tx();

        let one = pool.auto_allocate(&mut first).unwrap();
        let two = pool.auto_allocate(&mut second).unwrap();
        assert_ne!(one, two);

        first.rollback();
        second.commit().unwrap();
        assert!(!pool.is_allocated(one));
        assert!(pool.is_allocated(two));
    }

    #[test]
    fn test_number_released_by_open_transaction_stays_occupied() {
        let pool = DynamicNumberPool::new("TCP port", 7000, 7002);
        let mut setup = tx();
        pool.allocate(&mut setup, 7000).unwrap();
        setup.commit().unwrap();

        let mut releasing = tx();
        pool.deallocate(&mut releasing, 7000).unwrap();

        let mut other = tx();
        assert_matches!(
            pool.allocate(&mut other, 7000),
            Err(Error::ValueInUse { value: 7000, .. })
        );
        assert_eq!(pool.auto_allocate(&mut other).unwrap(), 7001);

        // the releasing transaction may still take it back
        pool.allocate(&mut releasing, 7000).unwrap();
        releasing.commit().unwrap();
        other.commit().unwrap();
        assert!(pool.is_allocated(7000));
        assert!(pool.is_allocated(7001));
    }

    #[test]
    fn test_released_number_free_after_commit() {
        let pool = DynamicNumberPool::new("minor number", 1000, 1001);
        let mut setup = tx();
        pool.allocate(&mut setup, 1000).unwrap();
        setup.commit().unwrap();

        let mut releasing = tx();
        pool.deallocate(&mut releasing, 1000).unwrap();
        releasing.commit().unwrap();

        let mut other = tx();
        pool.allocate(&mut other, 1000).unwrap();
        other.commit().unwrap();
        assert!(pool.is_allocated(1000));
    }
}
