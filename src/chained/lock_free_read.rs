use super::Chained;
use crate::reclaim::Guard;
use parking_lot::Mutex;
use std::fmt;

/// A chained hash table whose lookups take no locks at all.
///
/// `add` and `remove` serialize on a per-bucket [`Mutex`], chosen by the key's hash modulo the
/// number of locks. `contains` and `get` walk the chain under nothing but their guard.
///
/// A lookup that overlaps an `add` of the same key may miss it, and one that overlaps a resize
/// reads the bucket as it was when the resize published. Either way the lookup is consistent with
/// some point during its execution. Lookups never block behind writers or resizes.
///
/// # Examples
///
/// ```
/// use concurrent_tables::LockFreeReadTable;
///
/// let table = LockFreeReadTable::new(2, 2);
/// let guard = table.guard();
/// table.add(7, 70, &guard);
/// assert!(table.contains(7, &guard));
/// ```
pub struct LockFreeReadTable<V> {
    raw: Chained<V, Mutex<()>>,
}

impl<V> LockFreeReadTable<V> {
    /// Creates a table with `2^capacity_log` buckets.
    ///
    /// # Panics
    ///
    /// Panics if `capacity_log` exceeds [`MAXIMUM_CAPACITY_LOG`](crate::MAXIMUM_CAPACITY_LOG) or
    /// `max_bucket_size` is zero.
    pub fn new(capacity_log: u32, max_bucket_size: usize) -> Self {
        Self {
            raw: Chained::new(capacity_log, max_bucket_size),
        }
    }

    /// Pin a `Guard` for use with this table.
    ///
    /// Keep in mind that for as long as you hold onto this `Guard`, you are preventing the
    /// collection of garbage generated by the table.
    pub fn guard(&self) -> Guard<'_> {
        self.raw.guard()
    }

    /// Maps `key` to `value`, replacing any previous value.
    pub fn add(&self, key: i32, value: V, guard: &Guard<'_>) {
        self.raw.add(key, value, guard)
    }

    /// Removes `key`, returning whether it was present.
    pub fn remove(&self, key: i32, guard: &Guard<'_>) -> bool {
        self.raw.remove(key, guard)
    }

    pub fn contains(&self, key: i32, guard: &Guard<'_>) -> bool {
        self.get(key, guard).is_some()
    }

    /// Returns a reference to the value mapped to `key`.
    pub fn get<'g>(&'g self, key: i32, guard: &'g Guard<'_>) -> Option<&'g V> {
        self.raw.check_guard(guard);
        // a resize builds new chains rather than relinking the old ones, so a stale epoch still
        // holds a consistent snapshot of every bucket as of the moment it was replaced
        let (_, epoch) = self.raw.load(guard);
        epoch.bucket(key).get(key, guard)
    }

    /// Returns the number of entries in the table.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the current number of buckets.
    pub fn capacity(&self) -> usize {
        self.raw.capacity()
    }

    /// Returns how many times the table has grown.
    pub fn resize_count(&self) -> usize {
        self.raw.resize_count()
    }
}

impl<V> fmt::Debug for LockFreeReadTable<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockFreeReadTable")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn colliding_keys_force_a_resize() {
        let table = LockFreeReadTable::new(2, 4);
        let guard = table.guard();
        for key in [1, 5, 9, 13] {
            table.add(key, key, &guard);
        }
        assert_eq!(table.capacity(), 4);

        table.add(17, 17, &guard);
        assert_eq!(table.capacity(), 8);
        for key in [1, 5, 9, 13, 17] {
            assert_eq!(table.get(key, &guard), Some(&key));
        }
    }

    #[test]
    fn remove_twice() {
        let table = LockFreeReadTable::new(3, 2);
        let guard = table.guard();
        table.add(4, (), &guard);
        assert!(table.remove(4, &guard));
        assert!(!table.remove(4, &guard));
        assert!(table.is_empty());
    }

    #[test]
    fn readers_see_stable_keys_while_writers_churn() {
        let table = Arc::new(LockFreeReadTable::new(1, 1));
        {
            let guard = table.guard();
            for key in 0..8 {
                table.add(key * 1000, key, &guard);
            }
        }

        let done = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..2)
            .map(|_| {
                let table = Arc::clone(&table);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    while !done.load(Ordering::SeqCst) {
                        let guard = table.guard();
                        for key in 0..8 {
                            assert_eq!(table.get(key * 1000, &guard), Some(&key));
                        }
                    }
                })
            })
            .collect();

        {
            let guard = table.guard();
            for key in 1..2000 {
                if key % 1000 != 0 {
                    table.add(key, -key, &guard);
                    if key % 3 == 0 {
                        assert!(table.remove(key, &guard));
                    }
                }
            }
        }
        done.store(true, Ordering::SeqCst);
        for reader in readers {
            reader.join().unwrap();
        }
        assert!(table.resize_count() > 0);
    }
}
