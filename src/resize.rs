//! The capacity-doubling protocol shared by every table variant.
//!
//! Each table keeps its slot (or bucket) array and the matching lock array together in one
//! *epoch*, published through an [`Atomic`] pointer. Growing the table never mutates an epoch's
//! layout in place. Instead, [`grow`]:
//!
//!  1. takes every lock of the captured epoch in increasing index order,
//!  2. re-checks that the captured epoch is still the published one (another thread may have
//!     finished a resize while we were waiting on the locks, in which case we back off),
//!  3. rehashes all live entries into a new epoch of twice the capacity, doubling again for as
//!     long as the rehash still overflows the variant's structural bound,
//!  4. publishes the new epoch, releases the locks and retires the old epoch to the collector.
//!
//! Operations that were blocked on a lock of the old epoch wake up, notice that the epoch they
//! captured is no longer published, and start over against the new one.

use crate::reclaim::{Atomic, Collector, Guard, RetireShared, Shared};
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockWriteGuard};
use std::sync::atomic::{AtomicUsize, Ordering};

/// The largest capacity any table will grow to.
pub(crate) const MAXIMUM_CAPACITY: usize = 1 << 30;

/// The largest accepted `capacity_log`.
pub const MAXIMUM_CAPACITY_LOG: u32 = MAXIMUM_CAPACITY.trailing_zeros();

/// Computes the home index of a key in an array of `capacity` entries.
///
/// `capacity` must be a power of two.
#[inline]
pub(crate) fn home(hash: u64, capacity: usize) -> usize {
    debug_assert!(capacity.is_power_of_two());
    (hash as usize) & (capacity - 1)
}

/// Folds the high half of a key into the low half, so that masking to a home keeps them.
///
/// Keys below `2^16` keep their own value, so small keys still land at `key mod capacity`. Keys
/// that differ only in their high bits no longer pile into one home.
#[inline]
pub(crate) fn spread(key: i32) -> u64 {
    let h = key as u32;
    u64::from(h ^ (h >> 16))
}

/// Base-2 log of how many slots per entry a table may reach before growth stops paying off.
const SPARSE_FACTOR_LOG: u32 = 6;

/// Whether doubling a table of `capacity` holding `len` entries is still worthwhile.
///
/// Growing is what fixes a crowded bucket or an exhausted probe sequence, but only if it spreads
/// the crowded keys apart. Past this point the table settles for the overfull bucket (or a longer
/// probe sequence) instead of growing without bound.
#[inline]
pub(crate) fn worth_growing(capacity: usize, len: usize) -> bool {
    capacity < MAXIMUM_CAPACITY
        && capacity < (len.max(1).next_power_of_two() << SPARSE_FACTOR_LOG)
}

/// A lock that guards one stripe of an epoch and can be taken exclusively.
pub(crate) trait StripeLock: Default {
    type Held<'a>
    where
        Self: 'a;

    fn hold(&self) -> Self::Held<'_>;
}

impl<T: Default> StripeLock for Mutex<T> {
    type Held<'a> = MutexGuard<'a, T> where Self: 'a;

    fn hold(&self) -> Self::Held<'_> {
        self.lock()
    }
}

impl<T: Default> StripeLock for RwLock<T> {
    type Held<'a> = RwLockWriteGuard<'a, T> where Self: 'a;

    fn hold(&self) -> Self::Held<'_> {
        self.write()
    }
}

/// Takes every lock in `locks`, in increasing index order.
pub(crate) fn lock_in_order<L: StripeLock>(locks: &[L]) -> Vec<L::Held<'_>> {
    locks.iter().map(|lock| lock.hold()).collect()
}

/// An epoch that knows how to rebuild itself at a larger capacity.
pub(crate) trait Grow: Sized {
    /// The locks held for the duration of a resize.
    type Held<'e>
    where
        Self: 'e;

    /// Whatever a rehash leaves behind, retired once the new epoch is published.
    type Dead<'g>;

    /// Human-readable variant name, used in log messages.
    const KIND: &'static str;

    fn capacity(&self) -> usize;

    /// Acquires every lock of this epoch in the canonical order.
    fn lock_all(&self) -> Self::Held<'_>;

    /// Builds a new epoch of `capacity` holding every live entry of `self`.
    ///
    /// Returns `None` if some slot or bucket would exceed the structural bound at that capacity.
    /// Entries must be carried over by pointer; `self` is retired once the new epoch is
    /// published, and an epoch never frees the values it points to. Anything the rehash drops
    /// must be returned as `Dead` rather than looked up again later, since other threads may
    /// change `self` as soon as the new epoch is visible.
    fn rehash<'a, 'g>(
        &'a self,
        held: &Self::Held<'a>,
        capacity: usize,
        collector: &Collector,
        guard: &'g Guard<'_>,
    ) -> Option<(Self, Self::Dead<'g>)>;

    /// Retires exactly what `rehash` left behind.
    ///
    /// Called after the new epoch has been published, while all locks are still held.
    fn retire_dead(_dead: Self::Dead<'_>, _guard: &Guard<'_>) {}
}

/// How a call to [`grow`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// A new epoch was published.
    Grown,
    /// Another thread replaced the epoch first; nothing was done.
    Stale,
    /// The epoch is already at [`MAXIMUM_CAPACITY`].
    Exhausted,
}

/// Replaces the epoch `current` with one of (at least) twice its capacity.
///
/// `current` must have been loaded from `live` under `guard`.
pub(crate) fn grow<E: Grow>(
    live: &Atomic<E>,
    current: Shared<'_, E>,
    resizes: &AtomicUsize,
    collector: &Collector,
    guard: &Guard<'_>,
) -> Outcome {
    // safety: current was loaded from `live` while `guard` was held. an epoch is only retired
    // after it has been replaced in `live`, and retired epochs are not reclaimed until every
    // guard that was active at the time of retirement has been dropped.
    let epoch = unsafe { current.deref() };
    let old_capacity = epoch.capacity();
    if old_capacity >= MAXIMUM_CAPACITY {
        log::trace!("{} table cannot grow past {old_capacity}", E::KIND);
        return Outcome::Exhausted;
    }

    let held = epoch.lock_all();

    // someone else may have finished a resize while we were waiting for the locks
    if live.load(Ordering::SeqCst, guard) != current {
        log::trace!(
            "{} table lost resize race at capacity {old_capacity}",
            E::KIND
        );
        return Outcome::Stale;
    }

    let mut capacity = old_capacity << 1;
    let (next, dead) = loop {
        if let Some(rehashed) = epoch.rehash(&held, capacity, collector, guard) {
            break rehashed;
        }
        assert!(
            capacity < MAXIMUM_CAPACITY,
            "{} table cannot satisfy its structural bound below the maximum capacity",
            E::KIND
        );
        capacity <<= 1;
    };

    live.store(Shared::boxed(next, collector), Ordering::SeqCst);
    resizes.fetch_add(1, Ordering::SeqCst);
    log::debug!(
        "{} table resized from {old_capacity} to {capacity}",
        E::KIND
    );

    E::retire_dead(dead, guard);
    drop(held);

    // safety: the old epoch is no longer reachable from `live`. threads that loaded it before the
    // store above hold guards that keep it alive; every such thread re-checks `live` after
    // taking one of its locks and moves on to the new epoch.
    unsafe { guard.retire_shared(current) };
    Outcome::Grown
}
