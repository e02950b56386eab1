use concurrent_tables::{ConcurrentTable, CuckooTable, PROBE_SIZE, THRESHOLD};
use std::hash::{BuildHasherDefault, Hasher};
use std::sync::Arc;
use std::thread;

/// Sends every key to the first set of table 1.
#[derive(Default)]
struct ZeroHasher;

impl Hasher for ZeroHasher {
    fn finish(&self) -> u64 {
        0
    }

    fn write(&mut self, _: &[u8]) {}
}

type Colliding = CuckooTable<i32, BuildHasherDefault<ZeroHasher>>;

#[test]
fn colliding_keys_force_resizes() {
    let table = Colliding::with_bound(2, 4);
    let guard = table.guard();
    // all of these share both of their candidate sets at capacity 4
    let keys: Vec<i32> = (0..2 * PROBE_SIZE as i32 + 1).map(|k| k * 4).collect();
    for &key in &keys {
        table.add(key, key, &guard);
    }
    assert!(table.resize_count() > 0);
    assert!(table.capacity() > 4);
    for &key in &keys {
        assert_eq!(table.get(key, &guard), Some(&key));
    }
    assert_eq!(table.len(), keys.len());
}

#[test]
fn default_hasher_spreads_keys() {
    let table = CuckooTable::new(4, 16);
    let guard = table.guard();
    for key in 0..(16 * THRESHOLD as i32) {
        table.add(key, key, &guard);
    }
    for key in 0..(16 * THRESHOLD as i32) {
        assert_eq!(table.get(key, &guard), Some(&key));
    }
}

#[test]
fn overwrite_does_not_relocate() {
    let table = Colliding::with_bound(2, 1);
    let guard = table.guard();
    for round in 0..4 {
        for key in [0, 4, 8, 12] {
            table.add(key, round, &guard);
        }
    }
    assert_eq!(table.resize_count(), 0);
    assert_eq!(table.len(), 4);
    assert_eq!(table.get(8, &guard), Some(&3));
}

#[test]
#[cfg_attr(miri, ignore)]
fn concurrent_colliding_adds() {
    let table = Arc::new(Colliding::with_bound(1, 2));
    let threads: Vec<_> = (0..4)
        .map(|t| {
            let table = table.clone();
            thread::spawn(move || {
                let guard = table.guard();
                for i in 0..64 {
                    let key = (i * 4 + t) * 2;
                    table.add(key, key, &guard);
                }
            })
        })
        .collect();
    for t in threads {
        t.join().expect("failed to join thread");
    }

    let guard = table.guard();
    for key in (0..256).map(|k| k * 2) {
        assert_eq!(table.get(key, &guard), Some(&key));
    }
    assert_eq!(table.len(), 256);
    assert!(table.resize_count() > 0);
}
