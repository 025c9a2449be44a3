//! Write-ahead log for transactional memory updates
//!
//! A WAL couples a fixed-size append-only log file with a memory region of
//! the same size. `memcpy` first appends a `(dest, len, payload)` record to
//! the log, then performs the in-memory copy, so a crash between the two
//! can always be repaired by replaying the log. `savepoint` writes a
//! "resume here" marker: replay ignores everything before the most recent
//! marker (state up to the marker is covered by the owning partition's
//! checkpoint).
//!
//! Crash is modeled by dropping the handle without [`Wal::close`]; a clean
//! close leaves a trailing savepoint so that replay after it is a no-op.

#![warn(clippy::all)]

pub mod format;
pub mod wal;

pub use format::{WalHeader, WalRecord, WAL_HEADER_SIZE, WAL_MAGIC};
pub use wal::Wal;
