//! # flatdb
//!
//! flatdb is an embedded key-value store that keeps an entire database in one
//! flat file: a fixed header, a hash directory, and a record heap that grows
//! by appending or by recycling freed space. Multiple independent processes
//! can open the same file concurrently; mutual exclusion is provided by
//! POSIX advisory byte-range locks on the file itself, so no lock server or
//! shared memory is needed.
//!
//! ## File Layout
//!
//! ```text
//! +--------------------------+  offset 0
//! |   File header (128 B)    |  magic, version, hash_size, seqnum, ...
//! +--------------------------+  offset 128
//! |   Hash directory         |  (hash_size + 1) x u32 chain heads;
//! |                          |  slot 0 is the free-space chain
//! +--------------------------+
//! |   Record heap            |  variable-length records, live or free,
//! |                          |  each ending in a 4-byte tailer
//! +--------------------------+  end of file
//! ```
//!
//! Every record belongs to exactly one singly linked chain: the hash bucket
//! its key hashes to while live, or the free-space chain once reclaimed.
//! The tailer (a trailing copy of the record's payload capacity) lets the
//! allocator find the start of the record to its left without a forward
//! scan, which is what makes adjacent-free coalescing cheap.
//!
//! ## Concurrency Model
//!
//! There is no internal scheduler. The engine is a library invoked
//! synchronously by independent OS processes sharing one file:
//!
//! - one advisory lock per hash bucket (chain lock)
//! - one lock for the free-space chain and all length-changing operations
//! - one whole-directory lock for wipe and snapshot-style operations
//! - one-byte record pins used by traversal to keep a record from being
//!   physically reclaimed while no chain lock is held
//!
//! Within a process the handle is `Send + Sync`; interior state sits behind
//! a mutex, so a handle can be shared across threads. Two *handles* onto the
//! same file inside one process are not mutually excluded (POSIX record
//! locks are per-process); use one shared handle per process instead.
//!
//! ## Quick Start
//!
//! ```ignore
//! use flatdb::{Database, StoreMode};
//!
//! let db = Database::open("./state.fdb")?;
//! db.store(b"hostname", b"calvin", StoreMode::Replace)?;
//! let value = db.fetch(b"hostname")?;
//! assert_eq!(value, b"calvin");
//! ```
//!
//! ## Module Overview
//!
//! - [`storage`]: on-disk layout, bounds-checked mmap arena, backends
//! - `freelist`: best-fit allocation, record splitting and coalescing
//! - `locks`: advisory byte-range lock manager with per-handle refcounts
//! - `db`: the public `Database` handle and CRUD operations
//! - `traverse`: whole-database traversal and the first/next-key cursor

#[macro_use]
mod macros;

mod db;
mod error;
mod freelist;
mod hash;
mod locks;
pub mod storage;
mod traverse;

pub use db::{Database, LogFn, LogLevel, OpenOptions, StoreMode};
pub use error::{Error, ErrorCode, Result};
pub use traverse::TraverseAction;

/// Current version of flatdb.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
