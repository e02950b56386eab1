//! An open-addressing table: entries live directly in the slot array.
//!
//! Every slot doubles as the home of the keys that hash to it and records, in its probe counter,
//! the deepest probe step any of those keys has ever needed in this epoch. Lookups never scan
//! further than that.
//!
//! A slot holds a pointer to an entry. The entry is live while its value pointer is non-null;
//! removing a key nulls the value and leaves the entry behind as a tombstone, which later adds
//! may overwrite and which the next resize drops.

mod probe;

pub use probe::Probing;

use crate::reclaim::{Atomic, Collector, Guard, RetireShared, Shared};
use crate::resize::{self, Grow, Outcome, MAXIMUM_CAPACITY_LOG};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Entry<V> {
    key: i32,
    val: Atomic<V>,
}

impl<V> Entry<V> {
    fn is_live(&self, guard: &Guard<'_>) -> bool {
        !self.val.load(Ordering::SeqCst, guard).is_null()
    }
}

struct Slot<V> {
    entry: Atomic<Entry<V>>,
    probes: AtomicUsize,
}

struct Epoch<V> {
    slots: Box<[Slot<V>]>,
    locks: Box<[Mutex<()>]>,
    probing: Probing,
    max_probes: usize,
}

impl<V> Epoch<V> {
    fn new(capacity: usize, probing: Probing, max_probes: usize) -> Self {
        Self {
            slots: (0..capacity)
                .map(|_| Slot {
                    entry: Atomic::null(),
                    probes: AtomicUsize::new(0),
                })
                .collect(),
            locks: (0..capacity).map(|_| Mutex::new(())).collect(),
            probing,
            max_probes,
        }
    }

    fn home(&self, key: i32) -> usize {
        resize::home(resize::spread(key), self.slots.len())
    }

    fn candidate(&self, home: usize, i: usize) -> usize {
        self.probing.candidate(home, i, self.slots.len())
    }

    /// Locks two slots in increasing index order, or just one if they coincide.
    fn lock_pair(&self, a: usize, b: usize) -> (MutexGuard<'_, ()>, Option<MutexGuard<'_, ()>>) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let first = self.locks[lo].lock();
        let second = (lo != hi).then(|| self.locks[hi].lock());
        (first, second)
    }

    /// Scans the probe reach of `home` for a live entry of `key`.
    ///
    /// Returns the first probe step at which one was seen, along with the slot it was seen in.
    fn find(&self, home: usize, key: i32, guard: &Guard<'_>) -> Option<(usize, usize)> {
        let reach = self.slots[home].probes.load(Ordering::SeqCst);
        (0..=reach).find_map(|i| {
            let c = self.candidate(home, i);
            let entry = self.slots[c].entry.load(Ordering::SeqCst, guard);
            // safety: entries are retired only after being replaced in their slot, or after the
            // epoch that last held them was replaced, while `guard` was already active.
            let entry = unsafe { entry.as_ref() }?;
            (entry.key == key && entry.is_live(guard)).then_some((i, c))
        })
    }
}

impl<V> Grow for Epoch<V> {
    type Held<'e> = Vec<MutexGuard<'e, ()>> where Self: 'e;
    type Dead<'g> = Vec<Shared<'g, Entry<V>>>;

    const KIND: &'static str = "open-addressing";

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn lock_all(&self) -> Self::Held<'_> {
        resize::lock_in_order(&self.locks)
    }

    fn rehash<'a, 'g>(
        &'a self,
        _: &Self::Held<'a>,
        capacity: usize,
        _: &Collector,
        guard: &'g Guard<'_>,
    ) -> Option<(Self, Self::Dead<'g>)> {
        // safety (here and below): we hold every lock, so no entry can be replaced, revived or
        // retired under us.
        let live = self
            .slots
            .iter()
            .filter(|slot| {
                let entry = slot.entry.load(Ordering::SeqCst, guard);
                unsafe { entry.as_ref() }.map_or(false, |e| e.is_live(guard))
            })
            .count();
        // once doubling stops paying off, settle for longer probe sequences
        let limit = if resize::worth_growing(capacity, live) {
            self.max_probes
        } else {
            capacity.max(self.max_probes)
        };

        let next = Self::new(capacity, self.probing, self.max_probes);
        let mut dead = Vec::new();
        for slot in self.slots.iter() {
            let entry = slot.entry.load(Ordering::SeqCst, guard);
            let key = match unsafe { entry.as_ref() } {
                Some(e) if e.is_live(guard) => e.key,
                Some(_) => {
                    dead.push(entry);
                    continue;
                }
                None => continue,
            };
            let h = next.home(key);
            let i = (0..limit).find(|&i| {
                next.slots[next.candidate(h, i)]
                    .entry
                    .load_unprotected(Ordering::Relaxed)
                    .is_null()
            })?;
            next.slots[h].probes.fetch_max(i, Ordering::Relaxed);
            next.slots[next.candidate(h, i)]
                .entry
                .store(entry, Ordering::Relaxed);
        }
        Some((next, dead))
    }

    fn retire_dead(dead: Self::Dead<'_>, guard: &Guard<'_>) {
        for tombstone in dead {
            // safety: the rehash that collected these ran under every lock and did not carry
            // them into the new epoch. they stay tombstones until we retire them, since reviving
            // or replacing one takes a lock we still hold.
            unsafe { guard.retire_shared(tombstone) };
        }
    }
}

/// An open-addressing hash table with per-slot locks.
///
/// `add` locks the key's home slot together with each candidate it inspects, in increasing index
/// order. `remove` locks only the slot holding the key. `contains` and `get` take no locks and
/// scan exactly as many candidates as the home slot's probe counter allows.
///
/// If an `add` finds no free candidate within `max_probes` steps, the table doubles its capacity
/// and the `add` starts over. A table that is already very sparse for its length probes through
/// every slot instead, so keys that share a home at any capacity cannot grow it without bound.
///
/// # Examples
///
/// ```
/// use concurrent_tables::{OpenTable, Probing};
///
/// let table = OpenTable::with_probing(3, 4, Probing::Quadratic { c1: 1, c2: 2 });
/// let guard = table.guard();
/// table.add(3, "three", &guard);
/// assert_eq!(table.get(3, &guard), Some(&"three"));
/// ```
pub struct OpenTable<V> {
    epoch: Atomic<Epoch<V>>,
    count: AtomicUsize,
    resizes: AtomicUsize,
    collector: Collector,
    _marker: PhantomData<V>,
}

impl<V> OpenTable<V> {
    /// Creates a linearly probing table with `2^capacity_log` slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity_log` exceeds [`MAXIMUM_CAPACITY_LOG`](crate::MAXIMUM_CAPACITY_LOG) or
    /// `max_probes` is zero.
    pub fn new(capacity_log: u32, max_probes: usize) -> Self {
        Self::with_probing(capacity_log, max_probes, Probing::Linear)
    }

    /// Creates a table with `2^capacity_log` slots that steps through candidates by `probing`.
    ///
    /// # Panics
    ///
    /// Panics if `capacity_log` exceeds [`MAXIMUM_CAPACITY_LOG`](crate::MAXIMUM_CAPACITY_LOG),
    /// `max_probes` is zero, or `probing` does not reach every slot (see
    /// [`Probing::reaches_every_slot`]).
    pub fn with_probing(capacity_log: u32, max_probes: usize, probing: Probing) -> Self {
        assert!(
            capacity_log <= MAXIMUM_CAPACITY_LOG,
            "capacity_log must be at most {MAXIMUM_CAPACITY_LOG}"
        );
        assert!(max_probes > 0, "max_probes must be at least 1");
        assert!(
            probing.reaches_every_slot(),
            "quadratic probing needs an odd c1 and an even c2"
        );

        let collector = Collector::new();
        let epoch = Shared::boxed(
            Epoch::new(1 << capacity_log, probing, max_probes),
            &collector,
        );
        Self {
            epoch: Atomic::from(epoch),
            count: AtomicUsize::new(0),
            resizes: AtomicUsize::new(0),
            collector,
            _marker: PhantomData,
        }
    }

    /// Pin a `Guard` for use with this table.
    ///
    /// Keep in mind that for as long as you hold onto this `Guard`, you are preventing the
    /// collection of garbage generated by the table.
    pub fn guard(&self) -> Guard<'_> {
        self.collector.enter()
    }

    #[inline]
    fn check_guard(&self, guard: &Guard<'_>) {
        // guard.collector() may be `None` if it is unprotected
        if let Some(c) = guard.collector() {
            assert!(Collector::ptr_eq(c, &self.collector));
        }
    }

    fn load<'g>(&self, guard: &'g Guard<'_>) -> (Shared<'g, Epoch<V>>, &'g Epoch<V>) {
        let current = self.epoch.load(Ordering::SeqCst, guard);
        // safety: we loaded the epoch while `guard` was held. it is only retired after it has been
        // replaced, and will not be reclaimed until `guard` is dropped.
        (current, unsafe { current.deref() })
    }

    fn is_live(&self, current: Shared<'_, Epoch<V>>, guard: &Guard<'_>) -> bool {
        self.epoch.load(Ordering::SeqCst, guard) == current
    }

    /// Maps `key` to `value`, replacing any previous value.
    pub fn add(&self, key: i32, value: V, guard: &Guard<'_>) {
        self.check_guard(guard);
        let value = Shared::boxed(value, &self.collector);

        'retry: loop {
            let (current, epoch) = self.load(guard);
            let h = epoch.home(key);
            let capacity = epoch.slots.len();
            let limit = if resize::worth_growing(capacity, self.len()) {
                epoch.max_probes
            } else {
                capacity.max(epoch.max_probes)
            };

            for i in 0..limit {
                let c = epoch.candidate(h, i);
                let _held = epoch.lock_pair(h, c);
                if !self.is_live(current, guard) {
                    continue 'retry;
                }

                let slot = &epoch.slots[c];
                let existing = slot.entry.load(Ordering::SeqCst, guard);
                // safety: see `Epoch::find`
                if let Some(e) = unsafe { existing.as_ref() } {
                    if e.is_live(guard) {
                        if e.key != key {
                            continue;
                        }
                        let now_garbage = e.val.swap(value, Ordering::SeqCst, guard);
                        // safety: the old value is no longer reachable from any entry. readers
                        // that loaded it before the swap hold guards that predate this call.
                        unsafe { guard.retire_shared(now_garbage) };
                        return;
                    }
                }

                // the candidate is free, but the key may still be live further along the probe
                // sequence. every add of this key holds the home lock while it decides, so the
                // answer cannot change under us.
                match epoch.find(h, key, guard) {
                    Some((j, _)) if j < i => continue 'retry,
                    Some(_) => continue,
                    None => {}
                }

                // raise the counter first so that lookups never miss a published entry
                epoch.slots[h].probes.fetch_max(i, Ordering::SeqCst);
                // safety: see `Epoch::find`
                match unsafe { existing.as_ref() } {
                    Some(e) if e.key == key => {
                        // revive the tombstone in place
                        e.val.store(value, Ordering::SeqCst);
                    }
                    _ => {
                        let entry = Shared::boxed(
                            Entry {
                                key,
                                val: Atomic::from(value),
                            },
                            &self.collector,
                        );
                        let tombstone = slot.entry.swap(entry, Ordering::SeqCst, guard);
                        if !tombstone.is_null() {
                            // safety: the tombstone was only reachable through this slot of the
                            // live epoch, and through epochs retired before it became one.
                            unsafe { guard.retire_shared(tombstone) };
                        }
                    }
                }
                self.count.fetch_add(1, Ordering::SeqCst);
                return;
            }

            log::trace!(
                "key {key} found no free slot within {limit} probes at capacity {capacity}"
            );
            let outcome = resize::grow(
                &self.epoch,
                current,
                &self.resizes,
                &self.collector,
                guard,
            );
            assert_ne!(
                outcome,
                Outcome::Exhausted,
                "open-addressing table is full at its maximum capacity"
            );
        }
    }

    /// Removes `key`, returning whether it was present.
    pub fn remove(&self, key: i32, guard: &Guard<'_>) -> bool {
        self.check_guard(guard);
        'retry: loop {
            let (current, epoch) = self.load(guard);
            let h = epoch.home(key);
            let Some((_, c)) = epoch.find(h, key, guard) else {
                if self.is_live(current, guard) {
                    return false;
                }
                continue;
            };

            let _held = epoch.locks[c].lock();
            if !self.is_live(current, guard) {
                continue 'retry;
            }
            let entry = epoch.slots[c].entry.load(Ordering::SeqCst, guard);
            // safety: see `Epoch::find`
            let Some(e) = (unsafe { entry.as_ref() }) else {
                return false;
            };
            if e.key != key {
                // the tombstone was reused by another key after we found it
                return false;
            }
            let value = e.val.swap(Shared::null(), Ordering::SeqCst, guard);
            if value.is_null() {
                // someone else removed it first
                return false;
            }
            // safety: the entry is now a tombstone, so no lookup that starts after this point
            // can reach the value.
            unsafe { guard.retire_shared(value) };
            self.count.fetch_sub(1, Ordering::SeqCst);
            return true;
        }
    }

    pub fn contains(&self, key: i32, guard: &Guard<'_>) -> bool {
        self.get(key, guard).is_some()
    }

    /// Returns a reference to the value mapped to `key`.
    pub fn get<'g>(&'g self, key: i32, guard: &'g Guard<'_>) -> Option<&'g V> {
        self.check_guard(guard);
        loop {
            let (current, epoch) = self.load(guard);
            let h = epoch.home(key);
            if let Some((_, c)) = epoch.find(h, key, guard) {
                let entry = epoch.slots[c].entry.load(Ordering::SeqCst, guard);
                // safety: see `Epoch::find`
                let value = unsafe { entry.as_ref() }
                    .filter(|e| e.key == key)
                    .map(|e| e.val.load(Ordering::SeqCst, guard));
                // safety: values are retired only once their entry is a tombstone or holds a
                // newer value, and `guard` was active before either happened.
                if let Some(v) = value.and_then(|v| unsafe { v.as_ref() }) {
                    return Some(&**v);
                }
            }
            // a miss is only trustworthy if no resize moved the key out from under us
            if self.is_live(current, guard) {
                return None;
            }
        }
    }

    /// Returns the number of entries in the table.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the current number of slots.
    pub fn capacity(&self) -> usize {
        let guard = self.guard();
        self.load(&guard).1.slots.len()
    }

    /// Returns how many times the table has grown.
    pub fn resize_count(&self) -> usize {
        self.resizes.load(Ordering::SeqCst)
    }
}

impl<V> fmt::Debug for OpenTable<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.guard();
        let (_, epoch) = self.load(&guard);
        f.debug_struct("OpenTable")
            .field("len", &self.len())
            .field("capacity", &epoch.slots.len())
            .field("probing", &epoch.probing)
            .finish()
    }
}

impl<V> Drop for OpenTable<V> {
    fn drop(&mut self) {
        // safety: we have &mut self _and_ all references we have returned are bound to the
        // lifetime of their borrow of self, so there cannot be any outstanding references to
        // anything in the table.
        let epoch = self.epoch.load_unprotected(Ordering::SeqCst);
        let epoch = unsafe { epoch.into_box() };
        for slot in epoch.slots.iter() {
            let entry = slot.entry.load_unprotected(Ordering::SeqCst);
            if entry.is_null() {
                continue;
            }
            // safety: same as above, and every entry of the live epoch is owned by it alone
            let entry = unsafe { entry.into_box() };
            let value = entry.val.load_unprotected(Ordering::SeqCst);
            if !value.is_null() {
                // safety: same as above
                drop(unsafe { value.into_box() });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_counter_bounds_lookups() {
        let table = OpenTable::new(3, 8);
        let guard = table.guard();
        for key in [1, 9, 17] {
            table.add(key, key, &guard);
        }
        {
            let (_, epoch) = table.load(&guard);
            assert_eq!(epoch.slots[1].probes.load(Ordering::SeqCst), 2);
            assert_eq!(epoch.slots[2].probes.load(Ordering::SeqCst), 0);
        }
        for key in [1, 9, 17] {
            assert_eq!(table.get(key, &guard), Some(&key));
        }
        assert!(!table.contains(25, &guard));
    }

    #[test]
    fn tombstones_are_skipped_and_reused() {
        let table = OpenTable::new(3, 8);
        let guard = table.guard();
        table.add(1, "a", &guard);
        table.add(9, "b", &guard);
        assert!(table.remove(1, &guard));
        assert!(!table.remove(1, &guard));

        // 9 sits behind the tombstone left by 1
        assert_eq!(table.get(9, &guard), Some(&"b"));

        // re-adding 9 must overwrite it where it is, not fill the tombstone in front of it
        table.add(9, "c", &guard);
        assert_eq!(table.len(), 1);
        assert!(table.remove(9, &guard));
        assert!(!table.contains(9, &guard));

        table.add(17, "d", &guard);
        {
            let (_, epoch) = table.load(&guard);
            let entry = epoch.slots[1].entry.load(Ordering::SeqCst, &guard);
            assert_eq!(unsafe { entry.deref() }.key, 17);
        }
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn revived_tombstone_keeps_its_entry() {
        let table = OpenTable::new(2, 4);
        let guard = table.guard();
        table.add(2, 20, &guard);
        assert!(table.remove(2, &guard));
        table.add(2, 21, &guard);
        assert_eq!(table.get(2, &guard), Some(&21));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn exhausted_probes_grow_the_table() {
        let table = OpenTable::new(2, 2);
        let guard = table.guard();
        for key in [0, 4, 8] {
            table.add(key, key, &guard);
        }
        assert!(table.resize_count() >= 1);
        assert!(table.capacity() >= 8);
        for key in [0, 4, 8] {
            assert_eq!(table.get(key, &guard), Some(&key));
        }
    }

    #[test]
    fn resize_drops_tombstones() {
        let table = OpenTable::new(1, 1);
        let guard = table.guard();
        table.add(0, 0, &guard);
        table.add(1, 1, &guard);
        assert!(table.remove(1, &guard));
        // home 0 is taken and a single probe is allowed, so this has to grow the table
        table.add(2, 2, &guard);
        assert_eq!(table.resize_count(), 1);

        let (_, epoch) = table.load(&guard);
        let tombstones = epoch
            .slots
            .iter()
            .filter(|s| {
                let e = s.entry.load(Ordering::SeqCst, &guard);
                unsafe { e.as_ref() }.map_or(false, |e| !e.is_live(&guard))
            })
            .count();
        assert_eq!(tombstones, 0);
        assert_eq!(table.len(), 2);
        assert!(!table.contains(1, &guard));
    }

    #[test]
    fn remove_between_publish_and_retire() {
        let table = OpenTable::new(1, 1);
        let guard = table.guard();
        table.add(0, 0, &guard);
        table.add(1, 1, &guard);
        assert!(table.remove(1, &guard));

        // grow by hand so that a remove can land on the new epoch before the old one is retired
        let (current, epoch) = table.load(&guard);
        let held = epoch.lock_all();
        let (next, dead) = epoch.rehash(&held, 4, &table.collector, &guard).unwrap();
        assert_eq!(dead.len(), 1);
        table
            .epoch
            .store(Shared::boxed(next, &table.collector), Ordering::SeqCst);

        // the entry for 0 is shared by both epochs and becomes a tombstone only now
        assert!(table.remove(0, &guard));
        Epoch::retire_dead(dead, &guard);
        drop(held);
        unsafe { guard.retire_shared(current) };

        {
            let (_, epoch) = table.load(&guard);
            let entry = epoch.slots[0].entry.load(Ordering::SeqCst, &guard);
            let entry = unsafe { entry.as_ref() }.expect("tombstone stays in its slot");
            assert_eq!(entry.key, 0);
            assert!(!entry.is_live(&guard));
        }

        // replacing the tombstone retires it exactly once
        table.add(4, 40, &guard);
        assert_eq!(table.get(4, &guard), Some(&40));
        assert!(!table.contains(0, &guard));
        assert_eq!(table.len(), 1);
        drop(guard);
        drop(table);
    }

    #[test]
    fn shared_home_stops_growing_once_sparse() {
        let table = OpenTable::new(1, 1);
        let guard = table.guard();
        // all of these keep sharing a home no matter how far the table doubles
        let keys = [0, 1 << 16 | 1, 2 << 16 | 2, 3 << 16 | 3];
        for key in keys {
            table.add(key, key, &guard);
        }
        assert!(table.capacity() <= 4 << 6);
        for key in keys {
            assert_eq!(table.get(key, &guard), Some(&key));
        }
    }
}
