//! Records concurrent histories against every table kind and checks that each key's history has
//! a sequential explanation, in the style of Wing and Gong's linearizability checker.

use concurrent_tables::{ConcurrentTable, TableConfig, TableKind};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

const KINDS: [TableKind; 5] = [
    TableKind::Locking,
    TableKind::LockFreeRead,
    TableKind::OpenLinear,
    TableKind::OpenQuadratic,
    TableKind::Cuckoo,
];

const THREADS: u32 = 4;
const OPS_PER_THREAD: u32 = 40;
const KEYS: i32 = 4;
const ROUNDS: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Add(u32),
    Remove(bool),
    Get(Option<u32>),
}

impl Op {
    /// Applies the operation to the key's sequential state, if the observed result allows it.
    fn apply(self, state: Option<u32>) -> Option<Option<u32>> {
        match self {
            Op::Add(v) => Some(Some(v)),
            Op::Remove(removed) if removed == state.is_some() => Some(None),
            Op::Get(seen) if seen == state => Some(state),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Event {
    key: i32,
    op: Op,
    call: u64,
    ret: u64,
}

fn record(
    table: &dyn ConcurrentTable<u32>,
    clock: &AtomicU64,
    rng: &mut StdRng,
    thread: u32,
) -> Vec<Event> {
    let mut events = Vec::with_capacity(OPS_PER_THREAD as usize);
    for i in 0..OPS_PER_THREAD {
        let key = rng.gen_range(0..KEYS);
        let guard = table.guard();
        let call = clock.fetch_add(1, Ordering::SeqCst);
        let op = match rng.gen_range(0..3) {
            0 => {
                let value = thread * 1000 + i;
                table.add(key, value, &guard);
                Op::Add(value)
            }
            1 => Op::Remove(table.remove(key, &guard)),
            _ => Op::Get(table.get(key, &guard).copied()),
        };
        let ret = clock.fetch_add(1, Ordering::SeqCst);
        events.push(Event { key, op, call, ret });
    }
    events
}

/// Searches for an order of `events` that respects real time and explains every result.
fn linearizable(events: &[Event]) -> bool {
    assert!(events.len() <= 128);
    let all = if events.len() == 128 {
        u128::MAX
    } else {
        (1u128 << events.len()) - 1
    };
    let mut seen = HashSet::new();
    let mut stack = vec![(0u128, None)];

    while let Some((done, state)) = stack.pop() {
        if done == all {
            return true;
        }
        if !seen.insert((done, state)) {
            continue;
        }
        let pending = || (0..events.len()).filter(move |&i| done & (1u128 << i) == 0);
        let first_return = pending()
            .map(|i| events[i].ret)
            .min()
            .expect("at least one pending event");
        // only events that were called before any pending event returned can go next
        for i in pending().filter(|&i| events[i].call < first_return) {
            if let Some(next) = events[i].op.apply(state) {
                stack.push((done | (1u128 << i), next));
            }
        }
    }
    false
}

#[test]
#[cfg_attr(miri, ignore)]
fn histories_are_linearizable() {
    for kind in KINDS {
        for round in 0..ROUNDS {
            // a tiny table with a tight bound, so that resizes interleave with everything else
            let table: Arc<dyn ConcurrentTable<u32>> = Arc::from(
                TableConfig::new(kind, 1, 1)
                    .build::<u32>()
                    .expect("valid configuration"),
            );
            let clock = Arc::new(AtomicU64::new(0));
            let barrier = Arc::new(Barrier::new(THREADS as usize));

            let threads: Vec<_> = (0..THREADS)
                .map(|t| {
                    let table = table.clone();
                    let clock = clock.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        let mut rng = StdRng::seed_from_u64(round * 64 + t as u64);
                        barrier.wait();
                        record(&*table, &clock, &mut rng, t)
                    })
                })
                .collect();
            let history: Vec<Event> = threads
                .into_iter()
                .flat_map(|t| t.join().expect("failed to join thread"))
                .collect();

            for key in 0..KEYS {
                let events: Vec<Event> = history.iter().copied().filter(|e| e.key == key).collect();
                assert!(
                    linearizable(&events),
                    "{kind:?} produced a non-linearizable history for key {key}: {events:#?}"
                );
            }
        }
    }
}

#[test]
fn checker_rejects_impossible_histories() {
    let add = Event {
        key: 0,
        op: Op::Add(1),
        call: 0,
        ret: 1,
    };
    // a get that starts after the add finished must see it
    let stale = Event {
        key: 0,
        op: Op::Get(None),
        call: 2,
        ret: 3,
    };
    assert!(!linearizable(&[add, stale]));

    // but one that overlaps the add may not
    let overlapping = Event { call: 0, ..stale };
    assert!(linearizable(&[add, overlapping]));

    let double_remove = [
        Event {
            key: 0,
            op: Op::Remove(true),
            call: 2,
            ret: 5,
        },
        Event {
            key: 0,
            op: Op::Remove(true),
            call: 3,
            ret: 4,
        },
    ];
    assert!(!linearizable(&[add, double_remove[0], double_remove[1]]));
}
