use concurrent_tables::{ConcurrentTable, TableConfig, TableKind};
use std::{sync::Arc, thread};

/// Number of entries for each thread to look up in the table.
const NUM_ENTRIES: usize = 16;

/// Number of iterations for each test
const ITERATIONS: usize = 64;

/// Number of rounds every thread perfoms per entry.
const ROUNDS: usize = 32;

#[test]
#[cfg_attr(miri, ignore)]
fn test_concurrent_contains() {
    for kind in [
        TableKind::Locking,
        TableKind::LockFreeRead,
        TableKind::OpenLinear,
        TableKind::OpenQuadratic,
        TableKind::Cuckoo,
    ] {
        let table = TableConfig::new(kind, 2, 2)
            .build::<usize>()
            .expect("valid configuration");
        let mut content = [0; NUM_ENTRIES];
        {
            let guard = table.guard();
            for (k, slot) in content.iter_mut().enumerate() {
                // these all share a home at the initial capacity
                let key = (k * 1024) as i32;
                table.add(key, k, &guard);
                *slot = key;
            }
        }
        test(content, Arc::from(table));
    }
}

fn test(content: [i32; NUM_ENTRIES], table: Arc<dyn ConcurrentTable<usize>>) {
    for _ in 0..ITERATIONS {
        test_once(content, table.clone());
    }
}

fn test_once(content: [i32; NUM_ENTRIES], table: Arc<dyn ConcurrentTable<usize>>) {
    let mut threads = Vec::new();
    for _ in 0..num_cpus::get().min(8) {
        let table = table.clone();
        let handle = thread::spawn(move || {
            let guard = table.guard();
            for i in 0..NUM_ENTRIES * ROUNDS {
                let key = content[i % content.len()];
                assert!(table.contains(key, &guard));
            }
        });
        threads.push(handle);
    }
    for t in threads {
        t.join().expect("failed to join thread");
    }
}
