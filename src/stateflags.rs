//! State Flags
//!
//! Per-kind flag enumerations and the access-checked, transactional bitmask
//! every entity carries.

use crate::error::{Error, Result};
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::transaction::{DbOp, ObjectKind, Transaction, TransactionObject, TxCell};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// One flag of a per-kind flag enumeration
///
/// A flag's value may span several bits; it is set only when all of them are.
pub trait Flag: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    fn value(self) -> u64;

    fn name(self) -> &'static str;

    fn all() -> &'static [Self];

    /// Flags fully contained in `bits`
    fn restore_flags(bits: u64) -> Vec<Self> {
        Self::all()
            .iter()
            .copied()
            .filter(|flag| bits & flag.value() == flag.value())
            .collect()
    }

    fn to_string_list(bits: u64) -> Vec<String> {
        Self::restore_flags(bits)
            .into_iter()
            .map(|flag| flag.name().to_string())
            .collect()
    }

    /// Parse flag names, case-insensitively
    fn from_string_list<S: AsRef<str>>(names: &[S]) -> Result<u64> {
        names.iter().try_fold(0u64, |bits, name| {
            let name = name.as_ref().trim();
            Self::all()
                .iter()
                .find(|flag| flag.name().eq_ignore_ascii_case(name))
                .map(|flag| bits | flag.value())
                .ok_or_else(|| Error::InvalidName {
                    kind: "flag",
                    name: name.to_string(),
                    reason: "unknown flag".into(),
                })
        })
    }

    fn bits_of(flags: &[Self]) -> u64 {
        flags.iter().fold(0, |bits, flag| bits | flag.value())
    }
}

macro_rules! state_flags {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident = $value:expr => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant),+
        }

        impl Flag for $name {
            fn value(self) -> u64 {
                match self {
                    $($name::$variant => $value),+
                }
            }

            fn name(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            fn all() -> &'static [Self] {
                &[$($name::$variant),+]
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(Flag::name(*self))
            }
        }
    };
}

state_flags!(
    NodeFlag {
        Delete = 1 => "DELETE",
        Evicted = 1 | 1 << 1 => "EVICTED",
        Evacuate = 1 << 2 => "EVACUATE",
        QIgnore = 0x10000 => "QIGNORE",
    }
);

state_flags!(
    RscDfnFlag {
        Delete = 1 => "DELETE",
        RestoreTarget = 1 << 1 => "RESTORE_TARGET",
        Cloning = 1 << 2 => "CLONING",
        Failed = 1 << 3 => "FAILED",
    }
);

state_flags!(
    RscFlag {
        Clean = 1 => "CLEAN",
        Delete = 1 << 1 => "DELETE",
        Diskless = 1 << 2 => "DISKLESS",
        DiskAddRequested = 1 << 3 => "DISK_ADD_REQUESTED",
        DiskAdding = 1 << 4 => "DISK_ADDING",
        DiskRemoveRequested = 1 << 5 => "DISK_REMOVE_REQUESTED",
        DiskRemoving = 1 << 6 => "DISK_REMOVING",
        TieBreaker = 1 << 2 | 1 << 7 => "TIE_BREAKER",
    }
);

state_flags!(
    VlmDfnFlag {
        Delete = 1 => "DELETE",
        Encrypted = 1 << 1 => "ENCRYPTED",
        Resize = 1 << 2 => "RESIZE",
    }
);

state_flags!(
    VlmFlag {
        Delete = 1 << 1 => "DELETE",
        Resize = 1 << 2 => "RESIZE",
        DrbdResize = 1 << 3 => "DRBD_RESIZE",
    }
);

state_flags!(
    SnapDfnFlag {
        Successful = 1 => "SUCCESSFUL",
        FailedDeployment = 1 << 1 => "FAILED_DEPLOYMENT",
        FailedDisconnect = 1 << 2 => "FAILED_DISCONNECT",
        Delete = 1 << 3 => "DELETE",
        Shipping = 1 << 4 => "SHIPPING",
        ShippingCleanup = 1 << 5 => "SHIPPING_CLEANUP",
    }
);

state_flags!(
    SnapFlag {
        Delete = 1 => "DELETE",
        Suspend = 1 << 1 => "SUSPEND",
        TakeSnapshot = 1 << 2 => "TAKE_SNAPSHOT",
    }
);

state_flags!(
    SnapVlmDfnFlag {
        Delete = 1 => "DELETE",
        Encrypted = 1 << 1 => "ENCRYPTED",
    }
);

state_flags!(
    ConnFlag {
        Delete = 1 => "DELETE",
        LocalDrbdProxy = 1 << 1 => "LOCAL_DRBD_PROXY",
    }
);

// =============================================================================
// StateFlags
// =============================================================================

/// Transactional flag bitmask guarded by the owner's protections
pub struct StateFlags<F: Flag> {
    bits: TxCell<u64>,
    prots: Vec<Arc<ObjectProtection>>,
    kind: ObjectKind,
    key: String,
    /// Owner's deleted marker; once set every flag operation fails
    deleted: Option<TxCell<bool>>,
    _flags: PhantomData<F>,
}

impl<F: Flag> StateFlags<F> {
    pub(crate) fn new(
        prots: Vec<Arc<ObjectProtection>>,
        kind: ObjectKind,
        key: impl Into<String>,
        initial: u64,
    ) -> Self {
        Self {
            bits: TxCell::new(initial),
            prots,
            kind,
            key: key.into(),
            deleted: None,
            _flags: PhantomData,
        }
    }

    /// Share the owner's deleted marker
    pub(crate) fn guarded_by(mut self, deleted: &TxCell<bool>) -> Self {
        self.deleted = Some(deleted.clone());
        self
    }

    fn require(&self, ctx: &AccessContext, level: AccessType) -> Result<()> {
        if self.deleted.as_ref().is_some_and(|deleted| deleted.get()) {
            return Err(Error::AccessToDeletedData {
                object: format!("{} {}", self.kind, self.key),
            });
        }
        self.prots
            .iter()
            .try_for_each(|prot| prot.require_access(ctx, level))
    }

    fn store(&self, ctx: &AccessContext, tx: &mut Transaction, level: AccessType, f: impl FnOnce(u64) -> u64) -> Result<()> {
        self.require(ctx, level)?;
        let current = self.bits.get();
        let updated = f(current);
        if updated != current {
            self.bits.set(tx, updated)?;
            tx.journal(DbOp::update(self.kind, self.key.clone(), "flags"))?;
        }
        Ok(())
    }

    pub fn enable_flags(&self, ctx: &AccessContext, tx: &mut Transaction, flags: &[F]) -> Result<()> {
        self.store(ctx, tx, AccessType::Change, |bits| bits | F::bits_of(flags))
    }

    /// Enable with a caller-chosen access level, used by delete marking
    pub(crate) fn enable_flags_with(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        level: AccessType,
        flags: &[F],
    ) -> Result<()> {
        self.store(ctx, tx, level, |bits| bits | F::bits_of(flags))
    }

    pub fn disable_flags(&self, ctx: &AccessContext, tx: &mut Transaction, flags: &[F]) -> Result<()> {
        self.store(ctx, tx, AccessType::Change, |bits| bits & !F::bits_of(flags))
    }

    /// Set exactly `flags`, clearing every other flag
    pub fn reset_flags_to(&self, ctx: &AccessContext, tx: &mut Transaction, flags: &[F]) -> Result<()> {
        self.store(ctx, tx, AccessType::Change, |_| F::bits_of(flags))
    }

    /// Enable `flags` and disable all others of the kind
    pub fn enable_flags_disable_others(
        &self,
        ctx: &AccessContext,
        tx: &mut Transaction,
        flags: &[F],
    ) -> Result<()> {
        self.reset_flags_to(ctx, tx, flags)
    }

    pub fn is_set(&self, ctx: &AccessContext, flag: F) -> Result<bool> {
        self.require(ctx, AccessType::View)?;
        Ok(self.bits.get() & flag.value() == flag.value())
    }

    /// None of the flag's bits are set
    pub fn is_unset(&self, ctx: &AccessContext, flag: F) -> Result<bool> {
        self.require(ctx, AccessType::View)?;
        Ok(self.bits.get() & flag.value() == 0)
    }

    pub fn is_some_set(&self, ctx: &AccessContext, flags: &[F]) -> Result<bool> {
        self.require(ctx, AccessType::View)?;
        let bits = self.bits.get();
        Ok(flags.iter().any(|flag| bits & flag.value() == flag.value()))
    }

    pub fn flags_bits(&self, ctx: &AccessContext) -> Result<u64> {
        self.require(ctx, AccessType::View)?;
        Ok(self.bits.get())
    }

    pub fn flags(&self, ctx: &AccessContext) -> Result<Vec<F>> {
        Ok(F::restore_flags(self.flags_bits(ctx)?))
    }

    /// Raw bits, for callers that already passed the access gate
    pub(crate) fn raw_bits(&self) -> u64 {
        self.bits.get()
    }
}

impl<F: Flag> fmt::Debug for StateFlags<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateFlags")
            .field("key", &self.key)
            .field("flags", &F::to_string_list(self.bits.get()))
            .finish()
    }
}

impl<F: Flag> TransactionObject for StateFlags<F> {
    fn is_dirty(&self) -> bool {
        self.bits.is_dirty()
    }

    fn commit(&self) {
        self.bits.commit()
    }

    fn rollback(&self) {
        self.bits.rollback()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{Identity, PrivilegeSet, Role};
    use crate::transaction::MemoryDriver;
    use assert_matches::assert_matches;

    fn flags_for(ctx: &AccessContext) -> StateFlags<RscFlag> {
        let prot = Arc::new(ObjectProtection::new(ctx, "/resources/ALPHA/RSC"));
        StateFlags::new(vec![prot], ObjectKind::Resource, "ALPHA/RSC", 0)
    }

    #[test]
    fn test_composite_flag_requires_all_bits() {
        let ctx = AccessContext::system();
        let flags = flags_for(&ctx);
        let mut tx = Transaction::new(Arc::new(MemoryDriver::new()));

        flags.enable_flags(&ctx, &mut tx, &[RscFlag::Diskless]).unwrap();
        assert!(flags.is_set(&ctx, RscFlag::Diskless).unwrap());
        assert!(!flags.is_set(&ctx, RscFlag::TieBreaker).unwrap());
        assert!(!flags.is_unset(&ctx, RscFlag::TieBreaker).unwrap());

        flags.enable_flags(&ctx, &mut tx, &[RscFlag::TieBreaker]).unwrap();
        assert_eq!(
            flags.flags(&ctx).unwrap(),
            vec![RscFlag::Diskless, RscFlag::TieBreaker]
        );
    }

    #[test]
    fn test_flags_journal_and_rollback() {
        let ctx = AccessContext::system();
        let flags = flags_for(&ctx);
        let mut tx = Transaction::new(Arc::new(MemoryDriver::new()));

        flags.enable_flags(&ctx, &mut tx, &[RscFlag::Clean]).unwrap();
        // unchanged bits journal nothing
        flags.enable_flags(&ctx, &mut tx, &[RscFlag::Clean]).unwrap();
        assert_eq!(tx.pending_ops().len(), 1);

        tx.rollback();
        assert_eq!(flags.flags_bits(&ctx).unwrap(), 0);
    }

    #[test]
    fn test_flags_access() {
        let owner = AccessContext::system();
        let flags = flags_for(&owner);
        let mut tx = Transaction::new(Arc::new(MemoryDriver::new()));
        let other = AccessContext::new(Identity::new("bob"), Role::new("bob"), PrivilegeSet::none());

        assert_matches!(
            flags.enable_flags(&other, &mut tx, &[RscFlag::Clean]),
            Err(Error::AccessDenied { .. })
        );
        assert_matches!(flags.is_set(&other, RscFlag::Clean), Err(Error::AccessDenied { .. }));
    }

    #[test]
    fn test_string_list() {
        let bits = NodeFlag::from_string_list(&["evicted", " QIgnore"]).unwrap();
        assert_eq!(bits, 0b11 | 0x10000);
        assert_eq!(
            NodeFlag::to_string_list(bits),
            vec!["DELETE", "EVICTED", "QIGNORE"]
        );
        assert!(NodeFlag::from_string_list(&["BOGUS"]).is_err());
        assert_eq!(NodeFlag::restore_flags(1), vec![NodeFlag::Delete]);
    }

    #[test]
    fn test_reset_flags_to() {
        let ctx = AccessContext::system();
        let flags: StateFlags<SnapDfnFlag> = StateFlags::new(
            vec![Arc::new(ObjectProtection::new(&ctx, "/snapshotdefinitions/R/S"))],
            ObjectKind::SnapshotDefinition,
            "R/S",
            SnapDfnFlag::bits_of(&[SnapDfnFlag::Shipping, SnapDfnFlag::Successful]),
        );
        let mut tx = Transaction::new(Arc::new(MemoryDriver::new()));

        flags.reset_flags_to(&ctx, &mut tx, &[SnapDfnFlag::Delete]).unwrap();
        assert_eq!(flags.flags(&ctx).unwrap(), vec![SnapDfnFlag::Delete]);
    }

    #[test]
    fn test_deleted_owner_blocks_flags() {
        let ctx = AccessContext::system();
        let deleted = TxCell::new(false);
        let flags = flags_for(&ctx).guarded_by(&deleted);
        let mut tx = Transaction::new(Arc::new(MemoryDriver::new()));

        flags.enable_flags(&ctx, &mut tx, &[RscFlag::Clean]).unwrap();
        deleted.set(&mut tx, true).unwrap();
        assert_matches!(
            flags.is_set(&ctx, RscFlag::Clean),
            Err(Error::AccessToDeletedData { .. })
        );
        assert_matches!(
            flags.disable_flags(&ctx, &mut tx, &[RscFlag::Clean]),
            Err(Error::AccessToDeletedData { .. })
        );

        tx.rollback();
        assert_eq!(flags.flags_bits(&ctx).unwrap(), 0);
    }
}
