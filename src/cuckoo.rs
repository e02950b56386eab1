//! A phased cuckoo table.
//!
//! Every key has one candidate set in each of two tables: `h0(key) = key` picks its set in table
//! 0 and a keyed hash picks its set in table 1. A set is a short vector guarded by its own lock.
//! Sets may hold up to [`PROBE_SIZE`] entries, but any set holding [`THRESHOLD`] or more is
//! considered crowded, and the `add` that crowded it tries to move entries out to their alternate
//! sets before returning.

use crate::reclaim::{Atomic, Collector, Guard, RetireShared, Shared};
use crate::resize::{self, Grow, Outcome, MAXIMUM_CAPACITY_LOG};
use crate::DefaultHashBuilder;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::hash::BuildHasher;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

/// The number of entries a set may hold before it counts as crowded.
pub const THRESHOLD: usize = 4;

/// The hard limit on the number of entries in a set.
pub const PROBE_SIZE: usize = 8;

struct Entry<V> {
    key: i32,
    /// The key's table-1 hash, kept so that rehashing does not need the hasher.
    hash: u64,
    value: Atomic<V>,
}

impl<V> Clone for Entry<V> {
    /// Copies the value pointer, not the value.
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            hash: self.hash,
            value: self.value.clone(),
        }
    }
}

type Set<V> = Mutex<Vec<Entry<V>>>;

/// Where a new entry should go, given the sizes of its two candidate sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// Into this table, which stays below the threshold.
    Comfortable(usize),
    /// Into this table, which is now crowded and should shed an entry.
    Crowded(usize),
    /// Both sets are at the hard limit.
    Full,
}

impl Placement {
    fn of(lens: [usize; 2]) -> Self {
        if lens[0] < THRESHOLD {
            Placement::Comfortable(0)
        } else if lens[1] < THRESHOLD {
            Placement::Comfortable(1)
        } else if lens[0] < PROBE_SIZE {
            Placement::Crowded(0)
        } else if lens[1] < PROBE_SIZE {
            Placement::Crowded(1)
        } else {
            Placement::Full
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Relocation {
    /// Every set touched ended up below the threshold, or a resize took over.
    Settled,
    /// Ran out of rounds, or found the alternate set full.
    Failed,
}

struct Epoch<V> {
    sets: [Box<[Set<V>]>; 2],
}

impl<V> Epoch<V> {
    fn new(capacity: usize) -> Self {
        let sets = || {
            (0..capacity)
                .map(|_| Mutex::new(Vec::with_capacity(PROBE_SIZE)))
                .collect()
        };
        Self {
            sets: [sets(), sets()],
        }
    }

    fn indices(&self, key: i32, hash: u64) -> [usize; 2] {
        let capacity = self.sets[0].len();
        [
            resize::home(resize::spread(key), capacity),
            resize::home(hash, capacity),
        ]
    }

    /// Locks both candidate sets of a key, table 0 first.
    fn lock_pair(&self, [i0, i1]: [usize; 2]) -> [MutexGuard<'_, Vec<Entry<V>>>; 2] {
        let set0 = self.sets[0][i0].lock();
        let set1 = self.sets[1][i1].lock();
        [set0, set1]
    }
}

impl<V> Grow for Epoch<V> {
    type Held<'e> = Vec<MutexGuard<'e, Vec<Entry<V>>>> where Self: 'e;
    type Dead<'g> = ();

    const KIND: &'static str = "cuckoo";

    fn capacity(&self) -> usize {
        self.sets[0].len()
    }

    fn lock_all(&self) -> Self::Held<'_> {
        let mut held = resize::lock_in_order(&self.sets[0]);
        held.extend(resize::lock_in_order(&self.sets[1]));
        held
    }

    fn rehash<'a, 'g>(
        &'a self,
        held: &Self::Held<'a>,
        capacity: usize,
        _: &Collector,
        _: &'g Guard<'_>,
    ) -> Option<(Self, ())> {
        let mut next = Self::new(capacity);
        for entry in held.iter().flat_map(|set| set.iter()) {
            let indices = next.indices(entry.key, entry.hash);
            let lens = [
                next.sets[0][indices[0]].get_mut().len(),
                next.sets[1][indices[1]].get_mut().len(),
            ];
            let table = match Placement::of(lens) {
                Placement::Comfortable(table) | Placement::Crowded(table) => table,
                Placement::Full => return None,
            };
            next.sets[table][indices[table]]
                .get_mut()
                .push(entry.clone());
        }
        Some((next, ()))
    }
}

/// A concurrent cuckoo hash table with one lock per set.
///
/// Every operation locks the key's two candidate sets (table 0 first) and inspects at most
/// [`PROBE_SIZE`] entries in each. An `add` that leaves a set crowded relocates up to
/// `max_relocations` entries to their alternate sets; if that does not settle the table, the
/// table doubles its capacity.
///
/// # Examples
///
/// ```
/// use concurrent_tables::CuckooTable;
///
/// let table = CuckooTable::new(4, 8);
/// let guard = table.guard();
/// table.add(42, 'x', &guard);
/// assert_eq!(table.get(42, &guard), Some(&'x'));
/// ```
pub struct CuckooTable<V, S = DefaultHashBuilder> {
    epoch: Atomic<Epoch<V>>,
    count: AtomicUsize,
    resizes: AtomicUsize,
    max_relocations: usize,
    hash_builder: S,
    collector: Collector,
    _marker: PhantomData<V>,
}

impl<V> CuckooTable<V, DefaultHashBuilder> {
    /// Creates a table with `2^capacity_log` sets per table.
    ///
    /// # Panics
    ///
    /// Panics if `capacity_log` exceeds [`MAXIMUM_CAPACITY_LOG`](crate::MAXIMUM_CAPACITY_LOG) or
    /// `max_relocations` is zero.
    pub fn new(capacity_log: u32, max_relocations: usize) -> Self {
        Self::with_hasher(capacity_log, max_relocations, DefaultHashBuilder::default())
    }
}

impl<V, S> CuckooTable<V, S>
where
    S: BuildHasher,
{
    /// Creates a table with `2^capacity_log` sets per table, using `hash_builder` for table 1.
    ///
    /// Warning: `hash_builder` is normally randomly generated, and is designed to allow the table
    /// to be resistant to attacks that cause many collisions and very poor performance.
    /// Setting it manually using this function can expose a DoS attack vector.
    ///
    /// # Panics
    ///
    /// Panics if `capacity_log` exceeds [`MAXIMUM_CAPACITY_LOG`](crate::MAXIMUM_CAPACITY_LOG) or
    /// `max_relocations` is zero.
    pub fn with_hasher(capacity_log: u32, max_relocations: usize, hash_builder: S) -> Self {
        assert!(
            capacity_log <= MAXIMUM_CAPACITY_LOG,
            "capacity_log must be at most {MAXIMUM_CAPACITY_LOG}"
        );
        assert!(max_relocations > 0, "max_relocations must be at least 1");

        let collector = Collector::new();
        let epoch = Shared::boxed(Epoch::new(1 << capacity_log), &collector);
        Self {
            epoch: Atomic::from(epoch),
            count: AtomicUsize::new(0),
            resizes: AtomicUsize::new(0),
            max_relocations,
            hash_builder,
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

    fn grow(&self, current: Shared<'_, Epoch<V>>, guard: &Guard<'_>) -> Outcome {
        resize::grow(
            &self.epoch,
            current,
            &self.resizes,
            &self.collector,
            guard,
        )
    }

    /// Maps `key` to `value`, replacing any previous value.
    pub fn add(&self, key: i32, value: V, guard: &Guard<'_>) {
        self.check_guard(guard);
        let hash = self.hash_builder.hash_one(key);
        let value = Shared::boxed(value, &self.collector);

        loop {
            let (current, epoch) = self.load(guard);
            let indices = epoch.indices(key, hash);
            let mut sets = epoch.lock_pair(indices);
            if !self.is_live(current, guard) {
                continue;
            }

            if let Some(e) = sets.iter().flat_map(|set| set.iter()).find(|e| e.key == key) {
                let now_garbage = e.value.swap(value, Ordering::SeqCst, guard);
                // safety: the old value is no longer reachable from the live epoch. readers that
                // loaded it before the swap hold guards that predate this call.
                unsafe { guard.retire_shared(now_garbage) };
                return;
            }

            let entry = Entry {
                key,
                hash,
                value: Atomic::from(value),
            };
            let crowded = match Placement::of([sets[0].len(), sets[1].len()]) {
                Placement::Comfortable(table) => {
                    sets[table].push(entry);
                    None
                }
                Placement::Crowded(table) => {
                    sets[table].push(entry);
                    Some((table, indices[table]))
                }
                Placement::Full => {
                    drop(sets);
                    let outcome = self.grow(current, guard);
                    assert_ne!(
                        outcome,
                        Outcome::Exhausted,
                        "cuckoo table is full at its maximum capacity"
                    );
                    continue;
                }
            };
            self.count.fetch_add(1, Ordering::SeqCst);
            drop(sets);

            if let Some((table, index)) = crowded {
                if self.relocate(current, table, index, guard) == Relocation::Failed {
                    // the new entry is already in place, so there is nothing to retry. a crowded
                    // set is allowed to stay crowded once the table is sparse for its length.
                    // safety: `current` was loaded under `guard`
                    let capacity = unsafe { current.deref() }.capacity();
                    if resize::worth_growing(capacity, self.len()) {
                        self.grow(current, guard);
                    } else {
                        log::trace!("cuckoo table keeps a crowded set at capacity {capacity}");
                    }
                }
            }
            return;
        }
    }

    /// Moves the oldest entries of the crowded set `index` of `table` to their alternate sets.
    fn relocate(
        &self,
        current: Shared<'_, Epoch<V>>,
        mut table: usize,
        mut index: usize,
        guard: &Guard<'_>,
    ) -> Relocation {
        // safety: `current` was loaded by our caller under `guard`
        let epoch = unsafe { current.deref() };
        for _ in 0..self.max_relocations {
            if !self.is_live(current, guard) {
                return Relocation::Settled;
            }

            let (key, hash) = match epoch.sets[table][index].lock().first() {
                Some(oldest) => (oldest.key, oldest.hash),
                None => return Relocation::Settled,
            };
            let indices = epoch.indices(key, hash);
            let [mut set0, mut set1] = epoch.lock_pair(indices);
            if !self.is_live(current, guard) {
                return Relocation::Settled;
            }

            let alternate = 1 - table;
            let (from, to) = if table == 0 {
                (&mut set0, &mut set1)
            } else {
                (&mut set1, &mut set0)
            };
            match from.iter().position(|e| e.key == key) {
                Some(position) => {
                    let entry = from.remove(position);
                    if to.len() < THRESHOLD {
                        to.push(entry);
                        return Relocation::Settled;
                    } else if to.len() < PROBE_SIZE {
                        to.push(entry);
                        table = alternate;
                        index = indices[alternate];
                    } else {
                        from.push(entry);
                        return Relocation::Failed;
                    }
                }
                // someone else moved it; only keep going if the set is still crowded
                None if from.len() < THRESHOLD => return Relocation::Settled,
                None => {}
            }
        }

        log::trace!(
            "cuckoo relocation gave up after {} rounds at capacity {}",
            self.max_relocations,
            epoch.sets[0].len()
        );
        Relocation::Failed
    }

    /// Removes `key`, returning whether it was present.
    pub fn remove(&self, key: i32, guard: &Guard<'_>) -> bool {
        self.check_guard(guard);
        let hash = self.hash_builder.hash_one(key);
        loop {
            let (current, epoch) = self.load(guard);
            let mut sets = epoch.lock_pair(epoch.indices(key, hash));
            if !self.is_live(current, guard) {
                continue;
            }

            for set in sets.iter_mut() {
                if let Some(position) = set.iter().position(|e| e.key == key) {
                    let entry = set.remove(position);
                    let value = entry.value.load(Ordering::SeqCst, guard);
                    // safety: the entry is gone from the live epoch. epochs retired before this
                    // may still point at the value, but only guards older than this call see them.
                    unsafe { guard.retire_shared(value) };
                    self.count.fetch_sub(1, Ordering::SeqCst);
                    return true;
                }
            }
            return false;
        }
    }

    pub fn contains(&self, key: i32, guard: &Guard<'_>) -> bool {
        self.get(key, guard).is_some()
    }

    /// Returns a reference to the value mapped to `key`.
    pub fn get<'g>(&'g self, key: i32, guard: &'g Guard<'_>) -> Option<&'g V> {
        self.check_guard(guard);
        let hash = self.hash_builder.hash_one(key);
        loop {
            let (current, epoch) = self.load(guard);
            let sets = epoch.lock_pair(epoch.indices(key, hash));
            if !self.is_live(current, guard) {
                continue;
            }

            let value = sets
                .iter()
                .flat_map(|set| set.iter())
                .find(|e| e.key == key)
                .map(|e| e.value.load(Ordering::SeqCst, guard))?;
            // safety: the value was reachable from the live epoch while `guard` was held
            return unsafe { value.as_ref() }.map(|v| &**v);
        }
    }

    /// Returns the number of entries in the table.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the current number of sets in each of the two tables.
    pub fn capacity(&self) -> usize {
        let guard = self.guard();
        self.load(&guard).1.sets[0].len()
    }

    /// Returns how many times the table has grown.
    pub fn resize_count(&self) -> usize {
        self.resizes.load(Ordering::SeqCst)
    }
}

impl<V, S: BuildHasher> fmt::Debug for CuckooTable<V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CuckooTable")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("max_relocations", &self.max_relocations)
            .finish()
    }
}

impl<V, S> Drop for CuckooTable<V, S> {
    fn drop(&mut self) {
        // safety: we have &mut self _and_ all references we have returned are bound to the
        // lifetime of their borrow of self, so there cannot be any outstanding references to
        // anything in the table.
        let epoch = self.epoch.load_unprotected(Ordering::SeqCst);
        let mut epoch = unsafe { epoch.into_box() };
        for set in epoch.sets.iter_mut().flat_map(|sets| sets.iter_mut()) {
            for entry in set.get_mut().drain(..) {
                // safety: same as above, and the live epoch owns every value it points at
                drop(unsafe { entry.value.load_unprotected(Ordering::SeqCst).into_box() });
            }
        }
    }
}
