//! Concurrent hash tables keyed by `i32`, under several locking disciplines.
//!
//! Every table in this crate implements the same four operations (`add`, `remove`, `contains`
//! and `get`) and can be shared between any number of threads. They differ in how they keep
//! those operations consistent:
//!
//!  - [`LockingTable`] chains entries in buckets and guards each bucket with a reader-writer
//!    lock.
//!  - [`LockFreeReadTable`] uses the same chains, but only writers lock. Lookups traverse the
//!    chain without synchronizing, and may miss an `add` that is still in flight.
//!  - [`OpenTable`] stores entries directly in its slot array and probes for free slots,
//!    linearly or quadratically (see [`Probing`]). Each home slot remembers how far its keys
//!    have been displaced, so lookups know when to stop.
//!  - [`CuckooTable`] gives every key one candidate set in each of two tables and relocates
//!    entries between them to make room.
//!
//! All of them are created with a capacity exponent and a *structural bound*: the maximum bucket
//! size, the maximum number of probes, or the maximum number of cuckoo relocations. Whenever an
//! operation would exceed that bound, the table doubles its capacity while other threads keep
//! operating on it. The details of that protocol live in the `resize` module; the short version
//! is that a resize takes every lock of the table in a fixed order, publishes a fresh array and
//! lets operations that were waiting on the old one retry against the new.
//!
//! Keys are hashed by folding their high 16 bits into the low 16, so small keys keep their own
//! value as a hash. Doubling stops paying off once a table has 64 times more slots than
//! entries; from then on a table keeps an over-full bucket (or probes further, or keeps a
//! crowded cuckoo set) rather than growing for keys that no capacity would separate.
//!
//! # A note on `Guard` and memory use
//!
//! As with other concurrent structures built on epoch-style reclamation, values removed or
//! overwritten in a table are not freed immediately: another thread may still be reading them.
//! Every operation therefore takes a [`Guard`], obtained from the table's `guard` method, and the
//! table only frees memory once no guard that could have observed it is still alive. Holding on
//! to a guard for a long time keeps garbage around for that long.
//!
//! A guard is tied to the table it was created for. Passing a guard from one table to another
//! table's methods panics.
//!
//! If you would rather not deal with guards, [`ConcurrentTable::pin`] returns a [`TableRef`]
//! that carries one for you. For a boxed `dyn ConcurrentTable`, use [`TableRef::new`]:
//!
//! ```
//! use concurrent_tables::{ConcurrentTable, OpenTable};
//!
//! let table = OpenTable::new(4, 8);
//! let table = table.pin();
//! table.add(1, "one");
//! assert_eq!(table.get(1), Some(&"one"));
//! ```
//!
//! # Choosing a table at runtime
//!
//! [`TableConfig`] names a table kind together with its parameters and builds it behind the
//! [`ConcurrentTable`] trait. With the `serde` feature enabled, configurations can be read from
//! and written to any serde format.
//!
//! ```
//! use concurrent_tables::{TableConfig, TableKind, TableRef};
//!
//! let table = TableConfig::new(TableKind::Cuckoo, 4, 16).build::<u64>().unwrap();
//! let table = TableRef::new(&*table);
//! table.add(7, 49);
//! assert!(table.contains(7));
//! ```
//!
//! # Logging
//!
//! Resizes are reported through the [`log`](https://docs.rs/log) facade at `debug` level. Lost
//! resize races and exhausted probe or relocation bounds are reported at `trace` level. No
//! logger is installed by this crate.

mod chained;
mod config;
mod cuckoo;
mod open;
mod reclaim;
mod resize;
mod table;

pub use chained::{LockFreeReadTable, LockingTable};
pub use config::{ConfigError, TableConfig, TableKind};
pub use cuckoo::{CuckooTable, PROBE_SIZE, THRESHOLD};
pub use open::{OpenTable, Probing};
pub use resize::MAXIMUM_CAPACITY_LOG;
pub use table::{ConcurrentTable, TableRef};

/// The guard type used by every table in this crate.
pub use seize::Guard;

/// Default hasher for [`CuckooTable`], and the source of random probing constants.
pub type DefaultHashBuilder = ahash::RandomState;
