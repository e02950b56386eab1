//! Tables whose buckets are singly linked chains.
//!
//! Both variants share the chain layout defined here and differ only in how lookups are
//! synchronized: [`LockingTable`] takes a read lock on the bucket, while [`LockFreeReadTable`]
//! walks the chain with nothing but a guard.

mod lock_free_read;
mod locking;

pub use lock_free_read::LockFreeReadTable;
pub use locking::LockingTable;

use crate::reclaim::{Atomic, Collector, Guard, RetireShared, Shared};
use crate::resize::{self, Grow, Outcome, StripeLock, MAXIMUM_CAPACITY_LOG};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One link of a bucket chain.
pub(crate) struct Node<V> {
    pub(crate) key: i32,
    pub(crate) val: Atomic<V>,
    pub(crate) next: Atomic<Node<V>>,
}

/// The head of a chain, plus a cached length used to decide when to resize.
pub(crate) struct Bucket<V> {
    head: Atomic<Node<V>>,
    len: AtomicUsize,
}

impl<V> Default for Bucket<V> {
    fn default() -> Self {
        Self {
            head: Atomic::null(),
            len: AtomicUsize::new(0),
        }
    }
}

impl<V> Bucket<V> {
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    /// Walks the chain looking for `key`.
    ///
    /// Safe to call without holding the bucket's lock: removed nodes are retired, not freed, so a
    /// walk that is already past the point of unlinking keeps going through valid memory.
    pub(crate) fn find<'g>(&self, key: i32, guard: &'g Guard<'_>) -> Option<&'g Node<V>> {
        let mut p = self.head.load(Ordering::SeqCst, guard);
        // safety: every node reachable from this bucket was reachable when `guard` was already
        // active, so it cannot be reclaimed before `guard` is dropped.
        while let Some(node) = unsafe { p.as_ref() } {
            if node.key == key {
                return Some(&**node);
            }
            p = node.next.load(Ordering::SeqCst, guard);
        }
        None
    }

    pub(crate) fn get<'g>(&self, key: i32, guard: &'g Guard<'_>) -> Option<&'g V> {
        let node = self.find(key, guard)?;
        let v = node.val.load(Ordering::SeqCst, guard);
        // safety: values are only retired after being swapped out of a node or after their node
        // was unlinked, in both cases while `guard` was already active.
        unsafe { v.as_ref() }.map(|v| &**v)
    }

    /// Overwrites `key` if present, otherwise prepends a new node.
    ///
    /// Returns `true` if a new node was linked. The caller must hold the bucket's write lock.
    pub(crate) fn insert(
        &self,
        key: i32,
        value: Shared<'_, V>,
        collector: &Collector,
        guard: &Guard<'_>,
    ) -> bool {
        if let Some(node) = self.find(key, guard) {
            let now_garbage = node.val.swap(value, Ordering::SeqCst, guard);
            // safety: the old value is unreachable from the current epoch now. readers that
            // loaded it before the swap are holding guards that predate this retirement.
            unsafe { guard.retire_shared(now_garbage) };
            return false;
        }

        let head = self.head.load(Ordering::SeqCst, guard);
        let node = Shared::boxed(
            Node {
                key,
                val: Atomic::from(value),
                next: Atomic::from(head),
            },
            collector,
        );
        self.head.store(node, Ordering::SeqCst);
        self.len.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Unlinks the node for `key`, if any. The caller must hold the bucket's write lock.
    pub(crate) fn remove(&self, key: i32, guard: &Guard<'_>) -> bool {
        let mut link = &self.head;
        loop {
            let p = link.load(Ordering::SeqCst, guard);
            // safety: see `find`.
            let Some(node) = (unsafe { p.as_ref() }) else {
                return false;
            };
            if node.key != key {
                link = &node.next;
                continue;
            }

            link.store(node.next.load(Ordering::SeqCst, guard), Ordering::SeqCst);
            self.len.fetch_sub(1, Ordering::SeqCst);

            let value = node.val.load(Ordering::SeqCst, guard);
            // safety: the node is no longer linked into the current epoch, and its value is not
            // shared with any other node of the current epoch. earlier epochs that still point
            // at either were retired before this, so only guards older than this call see them.
            unsafe {
                guard.retire_shared(value);
                guard.retire_shared(p);
            }
            return true;
        }
    }

    /// Links a node into a bucket of an epoch that is not yet published.
    fn push_unpublished(&self, key: i32, value: Atomic<V>, collector: &Collector) {
        let head = self.head.load_unprotected(Ordering::Relaxed);
        let node = Shared::boxed(
            Node {
                key,
                val: value,
                next: Atomic::from(head),
            },
            collector,
        );
        self.head.store(node, Ordering::Relaxed);
        self.len.fetch_add(1, Ordering::Relaxed);
    }
}

/// A bucket array together with the locks that guard it.
///
/// Lock `i` guards every bucket whose index is congruent to `i` modulo the number of locks.
pub(crate) struct Epoch<V, L> {
    buckets: Box<[Bucket<V>]>,
    locks: Box<[L]>,
}

impl<V, L: StripeLock> Epoch<V, L> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self::with_locks(capacity, capacity)
    }

    pub(crate) fn with_locks(capacity: usize, locks: usize) -> Self {
        debug_assert!(locks.is_power_of_two());
        Self {
            buckets: (0..capacity).map(|_| Bucket::default()).collect(),
            locks: (0..locks).map(|_| L::default()).collect(),
        }
    }
}

impl<V, L> Epoch<V, L> {
    pub(crate) fn bucket(&self, key: i32) -> &Bucket<V> {
        &self.buckets[resize::home(resize::spread(key), self.buckets.len())]
    }

    pub(crate) fn lock(&self, key: i32) -> &L {
        &self.locks[resize::home(resize::spread(key), self.locks.len())]
    }

    /// Reclaims every value still linked into this epoch.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the table that owns this epoch.
    pub(crate) unsafe fn drop_values(&mut self) {
        for bucket in self.buckets.iter() {
            let mut p = bucket.head.load_unprotected(Ordering::SeqCst);
            // safety: we have exclusive access, so every node is still allocated.
            while let Some(node) = unsafe { p.as_ref() } {
                let value = node.val.load_unprotected(Ordering::SeqCst);
                if !value.is_null() {
                    // safety: each value is linked into exactly one node of the current epoch.
                    drop(unsafe { value.into_box() });
                }
                p = node.next.load_unprotected(Ordering::SeqCst);
            }
        }
    }
}

impl<V, L: StripeLock> Grow for Epoch<V, L> {
    type Held<'e> = Vec<L::Held<'e>> where Self: 'e;
    type Dead<'g> = ();

    const KIND: &'static str = "chained";

    fn capacity(&self) -> usize {
        self.buckets.len()
    }

    fn lock_all(&self) -> Self::Held<'_> {
        resize::lock_in_order(&self.locks)
    }

    fn rehash<'a, 'g>(
        &'a self,
        _: &Self::Held<'a>,
        capacity: usize,
        collector: &Collector,
        guard: &'g Guard<'_>,
    ) -> Option<(Self, ())> {
        let next = Self::with_locks(capacity, capacity);
        for bucket in self.buckets.iter() {
            let mut p = bucket.head.load(Ordering::SeqCst, guard);
            // safety: we hold every lock of this epoch, so no node can be unlinked under us.
            while let Some(node) = unsafe { p.as_ref() } {
                // new nodes, shared values: lock-free readers may still be walking these chains
                next.bucket(node.key)
                    .push_unpublished(node.key, node.val.clone(), collector);
                p = node.next.load(Ordering::SeqCst, guard);
            }
        }
        // chains never overflow; callers re-check their own bucket after the resize
        Some((next, ()))
    }
}

impl<V, L> Drop for Epoch<V, L> {
    fn drop(&mut self) {
        // values are owned by whichever epoch is current and are reclaimed separately, see
        // `drop_values`. the nodes themselves belong to exactly one epoch.
        for bucket in self.buckets.iter() {
            let mut p = bucket.head.load_unprotected(Ordering::SeqCst);
            while !p.is_null() {
                // safety: an epoch is dropped either by its table (which has exclusive access) or
                // by the collector once no guard can observe it anymore.
                let node = unsafe { p.into_box() };
                p = node.next.load_unprotected(Ordering::SeqCst);
            }
        }
    }
}

/// The state shared by both chained tables; they differ only in how lookups synchronize.
pub(crate) struct Chained<V, L> {
    epoch: Atomic<Epoch<V, L>>,
    count: AtomicUsize,
    resizes: AtomicUsize,
    max_bucket_size: usize,
    collector: Collector,
    _marker: PhantomData<V>,
}

impl<V, L: StripeLock> Chained<V, L> {
    pub(crate) fn new(capacity_log: u32, max_bucket_size: usize) -> Self {
        assert!(
            capacity_log <= MAXIMUM_CAPACITY_LOG,
            "capacity_log must be at most {MAXIMUM_CAPACITY_LOG}"
        );
        assert!(max_bucket_size > 0, "max_bucket_size must be at least 1");

        let collector = Collector::new();
        let epoch = Shared::boxed(Epoch::new(1 << capacity_log), &collector);
        Self {
            epoch: Atomic::from(epoch),
            count: AtomicUsize::new(0),
            resizes: AtomicUsize::new(0),
            max_bucket_size,
            collector,
            _marker: PhantomData,
        }
    }

    /// Takes the lock for `key` in the live epoch and runs `f` on the key's bucket.
    fn with_bucket_locked<'g, F, T>(&'g self, key: i32, guard: &'g Guard<'_>, f: F) -> T
    where
        F: FnOnce(&'g Bucket<V>) -> T,
    {
        loop {
            let (current, epoch) = self.load(guard);
            let _held = epoch.lock(key).hold();
            if !self.is_live(current, guard) {
                continue;
            }
            return f(epoch.bucket(key));
        }
    }

    pub(crate) fn add(&self, key: i32, value: V, guard: &Guard<'_>) {
        self.check_guard(guard);
        let value = Shared::boxed(value, &self.collector);
        let linked = self.with_bucket_locked(key, guard, |bucket| {
            bucket.insert(key, value, &self.collector, guard)
        });
        if linked {
            self.count.fetch_add(1, Ordering::SeqCst);
        }

        // unlocked, so concurrent adds may overshoot the bound before anyone grows the table
        loop {
            let (current, epoch) = self.load(guard);
            if epoch.bucket(key).len() <= self.max_bucket_size {
                break;
            }
            if !resize::worth_growing(epoch.capacity(), self.len()) {
                // the crowded keys agree on every bit another doubling would look at
                log::trace!(
                    "chained table keeps an overfull bucket at capacity {}",
                    epoch.capacity()
                );
                break;
            }
            let outcome = resize::grow(
                &self.epoch,
                current,
                &self.resizes,
                &self.collector,
                guard,
            );
            if outcome == Outcome::Exhausted {
                break;
            }
        }
    }

    pub(crate) fn remove(&self, key: i32, guard: &Guard<'_>) -> bool {
        self.check_guard(guard);
        let removed = self.with_bucket_locked(key, guard, |bucket| bucket.remove(key, guard));
        if removed {
            self.count.fetch_sub(1, Ordering::SeqCst);
        }
        removed
    }
}

impl<V, L> Chained<V, L> {
    pub(crate) fn guard(&self) -> Guard<'_> {
        self.collector.enter()
    }

    #[inline]
    pub(crate) fn check_guard(&self, guard: &Guard<'_>) {
        // guard.collector() may be `None` if it is unprotected
        if let Some(c) = guard.collector() {
            assert!(Collector::ptr_eq(c, &self.collector));
        }
    }

    /// Loads the live epoch.
    pub(crate) fn load<'g>(
        &self,
        guard: &'g Guard<'_>,
    ) -> (Shared<'g, Epoch<V, L>>, &'g Epoch<V, L>) {
        let current = self.epoch.load(Ordering::SeqCst, guard);
        // safety: we loaded the epoch while `guard` was held. it is only retired after it has been
        // replaced, and will not be reclaimed until `guard` is dropped.
        (current, unsafe { current.deref() })
    }

    pub(crate) fn is_live(&self, current: Shared<'_, Epoch<V, L>>, guard: &Guard<'_>) -> bool {
        self.epoch.load(Ordering::SeqCst, guard) == current
    }

    pub(crate) fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub(crate) fn capacity(&self) -> usize {
        let guard = self.guard();
        self.load(&guard).1.buckets.len()
    }

    pub(crate) fn resize_count(&self) -> usize {
        self.resizes.load(Ordering::SeqCst)
    }
}

impl<V, L> Drop for Chained<V, L> {
    fn drop(&mut self) {
        // safety: we have &mut self _and_ all references we have returned are bound to the
        // lifetime of their borrow of self, so there cannot be any outstanding references to
        // anything in the table.
        let epoch = self.epoch.load_unprotected(Ordering::SeqCst);
        let mut epoch = unsafe { epoch.into_box() };
        // safety: same as above, and the live epoch owns the values
        unsafe { epoch.drop_values() };
    }
}
