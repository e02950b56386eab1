use super::Chained;
use crate::reclaim::Guard;
use parking_lot::RwLock;
use std::fmt;

/// A chained hash table where every operation locks the bucket it touches.
///
/// `add` and `remove` take the bucket's write lock; `contains` and `get` take its read lock, so
/// lookups block while a writer holds the same bucket. In exchange every operation is
/// linearizable.
///
/// The table doubles its capacity whenever an `add` leaves a bucket with more than
/// `max_bucket_size` entries.
///
/// # Examples
///
/// ```
/// use concurrent_tables::LockingTable;
///
/// let table = LockingTable::new(2, 2);
/// let guard = table.guard();
/// table.add(1, "a", &guard);
/// assert_eq!(table.get(1, &guard), Some(&"a"));
/// assert!(table.remove(1, &guard));
/// assert!(!table.contains(1, &guard));
/// ```
pub struct LockingTable<V> {
    raw: Chained<V, RwLock<()>>,
}

impl<V> LockingTable<V> {
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
        loop {
            let (current, epoch) = self.raw.load(guard);
            let _read = epoch.lock(key).read();
            if !self.raw.is_live(current, guard) {
                continue;
            }
            return epoch.bucket(key).get(key, guard);
        }
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

impl<V> fmt::Debug for LockingTable<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockingTable")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn colliding_keys_force_a_resize() {
        let table = LockingTable::new(2, 4);
        let guard = table.guard();
        for key in [1, 5, 9, 13] {
            table.add(key, key * 10, &guard);
        }
        assert_eq!(table.capacity(), 4);
        assert_eq!(table.resize_count(), 0);

        table.add(17, 170, &guard);
        assert_eq!(table.capacity(), 8);
        assert_eq!(table.resize_count(), 1);
        for key in [1, 5, 9, 13, 17] {
            assert_eq!(table.get(key, &guard), Some(&(key * 10)));
        }
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn overwrite_keeps_len() {
        let table = LockingTable::new(1, 2);
        let guard = table.guard();
        table.add(3, "first", &guard);
        table.add(3, "second", &guard);
        assert_eq!(table.get(3, &guard), Some(&"second"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn get_survives_concurrent_resizes() {
        let table = Arc::new(LockingTable::new(1, 1));
        {
            let guard = table.guard();
            table.add(-1, -1, &guard);
        }

        let writer = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                let guard = table.guard();
                for key in 0..512 {
                    table.add(key, key, &guard);
                }
            })
        };
        for _ in 0..512 {
            let guard = table.guard();
            assert_eq!(table.get(-1, &guard), Some(&-1));
        }
        writer.join().unwrap();

        assert!(table.capacity().is_power_of_two());
        assert!(table.capacity() >= 512);
        let guard = table.guard();
        for key in 0..512 {
            assert!(table.contains(key, &guard));
        }
    }

    #[test]
    #[should_panic]
    fn zero_bound_is_rejected() {
        let _ = LockingTable::<()>::new(2, 0);
    }
}
