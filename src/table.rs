use crate::reclaim::{Guard, GuardRef};
use crate::{CuckooTable, LockFreeReadTable, LockingTable, OpenTable};
use std::fmt::{self, Debug, Formatter};
use std::hash::BuildHasher;

/// The contract shared by every table in this crate.
///
/// All operations take `&self` and may be called from any number of threads at once. References
/// returned by [`get`](ConcurrentTable::get) live as long as the guard they were read under, even
/// if the key is overwritten or removed in the meantime.
///
/// A table grows on its own whenever its structural bound is exceeded; none of the operations
/// ever fail.
pub trait ConcurrentTable<V>: Send + Sync {
    /// Creates a table with `2^capacity_log` buckets or slots and the given structural bound.
    ///
    /// The bound is the maximum bucket size of the chained tables, the maximum probe count of the
    /// open-addressing table and the maximum number of relocations of the cuckoo table.
    fn with_bound(capacity_log: u32, bound: usize) -> Self
    where
        Self: Sized;

    /// Pin a `Guard` for use with this table.
    fn guard(&self) -> Guard<'_>;

    /// Maps `key` to `value`, replacing any previous value.
    fn add(&self, key: i32, value: V, guard: &Guard<'_>);

    /// Removes `key`, returning whether it was present.
    ///
    /// Of several concurrent removes of the same entry, at most one returns `true`.
    fn remove(&self, key: i32, guard: &Guard<'_>) -> bool;

    fn contains(&self, key: i32, guard: &Guard<'_>) -> bool;

    /// Returns a reference to the value mapped to `key`.
    fn get<'g>(&'g self, key: i32, guard: &'g Guard<'_>) -> Option<&'g V>;

    /// Returns the number of entries in the table.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the current number of buckets or slots.
    fn capacity(&self) -> usize;

    /// Returns how many times the table has grown.
    fn resize_count(&self) -> usize;

    /// Get a reference to this table with the current thread pinned.
    fn pin(&self) -> TableRef<'_, V>
    where
        Self: Sized,
    {
        TableRef::new(self)
    }

    /// Get a reference to this table with the given guard.
    fn with_guard<'g>(&'g self, guard: &'g Guard<'g>) -> TableRef<'g, V>
    where
        Self: Sized,
    {
        TableRef::with_guard(self, guard)
    }
}

macro_rules! forward {
    ($table:ident) => {
        fn guard(&self) -> Guard<'_> {
            $table::guard(self)
        }

        fn add(&self, key: i32, value: V, guard: &Guard<'_>) {
            $table::add(self, key, value, guard)
        }

        fn remove(&self, key: i32, guard: &Guard<'_>) -> bool {
            $table::remove(self, key, guard)
        }

        fn contains(&self, key: i32, guard: &Guard<'_>) -> bool {
            $table::contains(self, key, guard)
        }

        fn get<'g>(&'g self, key: i32, guard: &'g Guard<'_>) -> Option<&'g V> {
            $table::get(self, key, guard)
        }

        fn len(&self) -> usize {
            $table::len(self)
        }

        fn capacity(&self) -> usize {
            $table::capacity(self)
        }

        fn resize_count(&self) -> usize {
            $table::resize_count(self)
        }
    };
}

impl<V: Send + Sync> ConcurrentTable<V> for LockingTable<V> {
    fn with_bound(capacity_log: u32, max_bucket_size: usize) -> Self {
        Self::new(capacity_log, max_bucket_size)
    }

    forward!(LockingTable);
}

impl<V: Send + Sync> ConcurrentTable<V> for LockFreeReadTable<V> {
    fn with_bound(capacity_log: u32, max_bucket_size: usize) -> Self {
        Self::new(capacity_log, max_bucket_size)
    }

    forward!(LockFreeReadTable);
}

impl<V: Send + Sync> ConcurrentTable<V> for OpenTable<V> {
    fn with_bound(capacity_log: u32, max_probes: usize) -> Self {
        Self::new(capacity_log, max_probes)
    }

    forward!(OpenTable);
}

impl<V, S> ConcurrentTable<V> for CuckooTable<V, S>
where
    V: Send + Sync,
    S: BuildHasher + Default + Send + Sync,
{
    fn with_bound(capacity_log: u32, max_relocations: usize) -> Self {
        Self::with_hasher(capacity_log, max_relocations, S::default())
    }

    forward!(CuckooTable);
}

/// A reference to a [`ConcurrentTable`], constructed with [`ConcurrentTable::pin`] or
/// [`ConcurrentTable::with_guard`]. The current thread will be pinned for the duration of this
/// reference.
///
/// Trait objects cannot call `pin`, so a `Box<dyn ConcurrentTable<V>>` goes through
/// [`TableRef::new`] instead.
pub struct TableRef<'t, V> {
    table: &'t (dyn ConcurrentTable<V> + 't),
    guard: GuardRef<'t>,
}

impl<'t, V> TableRef<'t, V> {
    /// Pins the current thread for use with `table`.
    pub fn new(table: &'t (dyn ConcurrentTable<V> + 't)) -> Self {
        Self {
            guard: GuardRef::Owned(table.guard()),
            table,
        }
    }

    /// Uses `guard`, which must come from `table`, for every operation through this reference.
    pub fn with_guard(table: &'t (dyn ConcurrentTable<V> + 't), guard: &'t Guard<'t>) -> Self {
        Self {
            table,
            guard: GuardRef::Ref(guard),
        }
    }

    /// Maps `key` to `value`, replacing any previous value.
    pub fn add(&self, key: i32, value: V) {
        self.table.add(key, value, &self.guard)
    }

    /// Removes `key`, returning whether it was present.
    pub fn remove(&self, key: i32) -> bool {
        self.table.remove(key, &self.guard)
    }

    /// Tests if `key` is a key in this table.
    pub fn contains(&self, key: i32) -> bool {
        self.table.contains(key, &self.guard)
    }

    /// Returns the value to which `key` is mapped.
    pub fn get(&self, key: i32) -> Option<&V> {
        self.table.get(key, &self.guard)
    }

    /// Returns the number of entries in the table.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns `true` if the table is empty. Otherwise returns `false`.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    pub fn resize_count(&self) -> usize {
        self.table.resize_count()
    }
}

impl<V> Clone for TableRef<'_, V> {
    fn clone(&self) -> Self {
        Self::new(self.table)
    }
}

impl<V> Debug for TableRef<'_, V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableRef")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
