//! Free Space Tracker
//!
//! Capacity ledger of one storage pool, or of a group of pools sharing the
//! same backing capacity. It caches the last free space reading reported by
//! the storage layer and the capacity reserved by volumes that are being
//! created but not yet confirmed.

use super::{AccessControlled, FreeSpaceApi, ReservationKey, StorPool, StorPoolKey};
use crate::error::{Error, Result};
use crate::events::CoreEvent;
use crate::identifier::FreeSpaceMgrName;
use crate::security::{AccessContext, AccessType};
use crate::transaction::{Transaction, TransactionObject, TxCell, TxMap};
use chrono::{DateTime, Utc};
use tracing::debug;

#[derive(Debug)]
pub struct FreeSpaceTracker {
    name: FreeSpaceMgrName,
    stor_pools: TxMap<StorPoolKey, ()>,
    reservations: TxMap<ReservationKey, u64>,
    free_capacity_kib: TxCell<Option<u64>>,
    total_capacity_kib: TxCell<Option<u64>>,
    last_updated: TxCell<Option<DateTime<Utc>>>,
}

impl FreeSpaceTracker {
    pub(crate) fn new(name: FreeSpaceMgrName) -> Self {
        Self {
            name,
            stor_pools: TxMap::new(),
            reservations: TxMap::new(),
            free_capacity_kib: TxCell::new(None),
            total_capacity_kib: TxCell::new(None),
            last_updated: TxCell::new(None),
        }
    }

    pub fn name(&self) -> &FreeSpaceMgrName {
        &self.name
    }

    /// Reservation methods act on behalf of a pool registered here and need
    /// CHANGE access to it
    fn require_change(&self, ctx: &AccessContext, stor_pool: &StorPool) -> Result<()> {
        stor_pool.gate(ctx, AccessType::Change)?;
        if stor_pool.free_space_mgr_name() != &self.name {
            return Err(Error::implementation(format!(
                "{} is tracked by '{}', not by '{}'",
                stor_pool.object_description(),
                stor_pool.free_space_mgr_name(),
                self.name
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Pool Registration
    // =========================================================================

    pub fn add(&self, ctx: &AccessContext, tx: &mut Transaction, stor_pool: &StorPool) -> Result<()> {
        self.require_change(ctx, stor_pool)?;
        self.stor_pools.insert(tx, stor_pool.key().clone(), ())?;
        Ok(())
    }

    pub fn remove(&self, ctx: &AccessContext, tx: &mut Transaction, stor_pool: &StorPool) -> Result<()> {
        self.require_change(ctx, stor_pool)?;
        self.stor_pools.remove(tx, stor_pool.key())?;
        Ok(())
    }

    pub fn stor_pools(&self) -> Vec<StorPoolKey> {
        self.stor_pools.keys()
    }

    pub fn stor_pool_count(&self) -> usize {
        self.stor_pools.len()
    }

    // =========================================================================
    // Reservations
    // =========================================================================

    /// Reserve `size_kib` for a volume before it is provisioned
    pub fn vlm_creating(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        stor_pool: &StorPool,
        key: ReservationKey,
        size_kib: u64,
    ) -> Result<()> {
        self.require_change(ctx, stor_pool)?;
        if self.reservations.contains_key(&key) {
            return Err(Error::implementation(format!(
                "{} already holds a reservation in '{}'",
                key, self.name
            )));
        }
        debug!(tracker = %self.name, reservation = %key, size_kib, "capacity reserved");
        self.reservations.insert(tx, key, size_kib)?;
        Ok(())
    }

    /// Replace the reservation of a provisioned volume with the free space
    /// reported by the storage layer
    pub fn vlm_creation_finished(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        stor_pool: &StorPool,
        key: &ReservationKey,
        free_capacity_kib: Option<u64>,
        total_capacity_kib: Option<u64>,
    ) -> Result<()> {
        self.require_change(ctx, stor_pool)?;
        let Some(size_kib) = self.reservations.remove(tx, key)? else {
            return Err(Error::implementation(format!(
                "{} finished creation without a reservation in '{}'",
                key, self.name
            )));
        };
        debug!(tracker = %self.name, reservation = %key, size_kib, "reservation confirmed");
        if free_capacity_kib.is_some() {
            self.store_free_space(tx, free_capacity_kib, total_capacity_kib)?;
        }
        Ok(())
    }

    /// Release the reservation of a volume that is removed or whose creation
    /// failed; returns false if nothing was reserved
    pub fn removing_volume(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        stor_pool: &StorPool,
        key: &ReservationKey,
    ) -> Result<bool> {
        self.require_change(ctx, stor_pool)?;
        let released = self.reservations.remove(tx, key)?;
        if let Some(size_kib) = released {
            debug!(tracker = %self.name, reservation = %key, size_kib, "reservation released");
        }
        Ok(released.is_some())
    }

    pub fn is_reserved(&self, key: &ReservationKey) -> bool {
        self.reservations.contains_key(key)
    }

    pub fn reservation(&self, key: &ReservationKey) -> Option<u64> {
        self.reservations.get(key)
    }

    /// Sum of all outstanding reservations
    pub fn reserved_capacity_kib(&self) -> u64 {
        self.reservations.values().into_iter().sum()
    }

    // =========================================================================
    // Free Space Cache
    // =========================================================================

    pub fn set_free_space(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        stor_pool: &StorPool,
        free_capacity_kib: Option<u64>,
        total_capacity_kib: Option<u64>,
    ) -> Result<()> {
        self.require_change(ctx, stor_pool)?;
        self.store_free_space(tx, free_capacity_kib, total_capacity_kib)
    }

    fn store_free_space(
        &self,
        tx: &mut Transaction,
        free_capacity_kib: Option<u64>,
        total_capacity_kib: Option<u64>,
    ) -> Result<()> {
        self.free_capacity_kib.set(tx, free_capacity_kib)?;
        self.total_capacity_kib.set(tx, total_capacity_kib)?;
        self.last_updated.set(tx, Some(Utc::now()))?;
        tx.emit(CoreEvent::FreeSpaceUpdated {
            free_space_mgr: self.name.display_name().to_string(),
            free_capacity_kib,
            total_capacity_kib,
        });
        Ok(())
    }

    /// Last reported free capacity; `None` until the storage layer reported
    pub fn free_capacity_kib(&self) -> Option<u64> {
        self.free_capacity_kib.get()
    }

    pub fn total_capacity_kib(&self) -> Option<u64> {
        self.total_capacity_kib.get()
    }

    pub fn free_space_last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated.get()
    }

    /// Free capacity not yet claimed by a reservation
    pub fn available_capacity_kib(&self) -> Option<u64> {
        self.free_capacity_kib()
            .map(|free| free.saturating_sub(self.reserved_capacity_kib()))
    }

    pub fn api_data(&self) -> FreeSpaceApi {
        FreeSpaceApi {
            name: self.name.display_name().to_string(),
            free_capacity_kib: self.free_capacity_kib(),
            total_capacity_kib: self.total_capacity_kib(),
            reserved_capacity_kib: self.reserved_capacity_kib(),
            last_updated: self.free_space_last_updated(),
        }
    }
}

impl TransactionObject for FreeSpaceTracker {
    fn is_dirty(&self) -> bool {
        self.stor_pools.is_dirty()
            || self.reservations.is_dirty()
            || self.free_capacity_kib.is_dirty()
            || self.total_capacity_kib.is_dirty()
            || self.last_updated.is_dirty()
    }

    fn commit(&self) {
        self.stor_pools.commit();
        self.reservations.commit();
        self.free_capacity_kib.commit();
        self.total_capacity_kib.commit();
        self.last_updated.commit();
    }

    fn rollback(&self) {
        self.stor_pools.rollback();
        self.reservations.rollback();
        self.free_capacity_kib.rollback();
        self.total_capacity_kib.rollback();
        self.last_updated.rollback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::test_support::Fixture;
    use crate::objects::{PropsOwner, VolumeKey};
    use assert_matches::assert_matches;

    fn reservation(fx: &Fixture, rsc: &str) -> ReservationKey {
        ReservationKey::Volume(VolumeKey::new(
            fx.node_name("alpha"),
            fx.rsc_name(rsc),
            crate::identifier::VolumeNumber::new(0).unwrap(),
        ))
    }

    #[test]
    fn test_reservation_round_trip_finished() {
        let fx = Fixture::new();
        let pool = fx.stor_pool("alpha", "pool");
        let tracker = pool.free_space_tracker(&fx.ctx).unwrap();
        let mut tx = fx.tx();
        tracker
            .set_free_space(&fx.ctx, &mut tx, &pool, Some(10_000), Some(20_000))
            .unwrap();
        let before = tracker.reserved_capacity_kib();

        let key = reservation(&fx, "data");
        tracker
            .vlm_creating(&fx.ctx, &mut tx, &pool, key.clone(), 4_096)
            .unwrap();
        assert_eq!(tracker.reserved_capacity_kib(), before + 4_096);
        assert_eq!(tracker.available_capacity_kib(), Some(10_000 - 4_096));

        tracker
            .vlm_creation_finished(&fx.ctx, &mut tx, &pool, &key, Some(5_904), Some(20_000))
            .unwrap();
        tx.commit().unwrap();

        assert_eq!(tracker.reserved_capacity_kib(), before);
        assert_eq!(tracker.free_capacity_kib(), Some(5_904));
        assert!(tracker.free_space_last_updated().is_some());
    }

    #[test]
    fn test_reservation_round_trip_removed() {
        let fx = Fixture::new();
        let pool = fx.stor_pool("alpha", "pool");
        let tracker = pool.free_space_tracker(&fx.ctx).unwrap();
        let mut tx = fx.tx();
        let before = tracker.reserved_capacity_kib();

        let key = reservation(&fx, "data");
        tracker
            .vlm_creating(&fx.ctx, &mut tx, &pool, key.clone(), 1_024)
            .unwrap();
        assert!(tracker.removing_volume(&fx.ctx, &mut tx, &pool, &key).unwrap());
        assert!(!tracker.removing_volume(&fx.ctx, &mut tx, &pool, &key).unwrap());
        assert_eq!(tracker.reserved_capacity_kib(), before);
    }

    #[test]
    fn test_finish_without_reservation_is_internal_error() {
        let fx = Fixture::new();
        let pool = fx.stor_pool("alpha", "pool");
        let tracker = pool.free_space_tracker(&fx.ctx).unwrap();
        let mut tx = fx.tx();

        let result = tracker.vlm_creation_finished(
            &fx.ctx,
            &mut tx,
            &pool,
            &reservation(&fx, "data"),
            None,
            None,
        );
        assert_matches!(result, Err(Error::Implementation(_)));
    }

    #[test]
    fn test_reservation_requires_change_access() {
        let fx = Fixture::new();
        let pool = fx.stor_pool("alpha", "pool");
        let tracker = pool.free_space_tracker(&fx.ctx).unwrap();
        let mut tx = fx.tx();

        // PUBLIC holds no entry on the node protection
        let result = tracker.vlm_creating(
            &AccessContext::public(),
            &mut tx,
            &pool,
            reservation(&fx, "data"),
            1,
        );
        assert_matches!(result, Err(Error::AccessDenied { .. }));
        assert_eq!(tracker.reserved_capacity_kib(), 0);
        assert!(pool.props(&fx.ctx).unwrap().is_empty());
    }

    #[test]
    fn test_reservation_rolled_back() {
        let fx = Fixture::new();
        let pool = fx.stor_pool("alpha", "pool");
        let tracker = pool.free_space_tracker(&fx.ctx).unwrap();
        let mut tx = fx.tx();
        tracker
            .vlm_creating(&fx.ctx, &mut tx, &pool, reservation(&fx, "data"), 512)
            .unwrap();
        tx.rollback();

        assert_eq!(tracker.reserved_capacity_kib(), 0);
        assert!(!tracker.is_dirty());
    }
}
