//! Unified error type for the checkpoint engine
//!
//! Five error kinds flow through the system:
//!
//! - **Corruption**: a persisted structure failed its magic or checksum
//!   check, or is internally inconsistent. Fatal for the affected operation.
//! - **Resource exhaustion**: an allocation or queue limit was hit; the
//!   current checkpoint aborts and the previous epoch is preserved.
//! - **I/O failure**: a backend read/write failed; the current commit aborts.
//! - **Invalid argument**: rejected at the API boundary.
//! - **Transient**: page-map or similar per-unit failures; logged and
//!   skipped, never propagated out of the writer pool.

use crate::types::Oid;
use std::io;
use thiserror::Error;

/// Result type alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for all checkpoint, store, and WAL operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from a backend or the store device.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A persisted structure failed validation.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// A magic tag on a persisted record did not match its constant.
    #[error("bad magic in {what}: expected {expected:#010x}, found {found:#010x}")]
    BadMagic {
        /// Which structure was being validated.
        what: &'static str,
        /// The declared constant.
        expected: u32,
        /// The value read back.
        found: u32,
    },

    /// An allocation or capacity limit was exceeded.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A write ran past the end of a bounded backend.
    #[error("backend overflow: {used} of {capacity} bytes used, {requested} requested")]
    BackendOverflow {
        /// Bytes already consumed.
        used: u64,
        /// Total capacity of the backend.
        capacity: u64,
        /// Size of the rejected write.
        requested: u64,
    },

    /// Invalid input rejected at the API boundary.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The named partition does not exist.
    #[error("no such partition: {0}")]
    NoSuchPartition(Oid),

    /// The operation conflicts with the partition's current state, e.g.
    /// an explicit checkpoint while periodic mode is armed.
    #[error("invalid operation on partition {oid}: {reason}")]
    InvalidOperation {
        /// The partition involved.
        oid: Oid,
        /// Why the operation was refused.
        reason: String,
    },

    /// A per-unit failure that the writer pool logs and skips.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The free-space allocator could not satisfy a request.
    #[error("store full: no free extent of {requested} blocks")]
    NoSpace {
        /// Size of the failed allocation, in blocks.
        requested: u64,
    },

    /// Restore could not proceed; the host process is in an undefined
    /// state and should be killed.
    #[error("restore failed: {0}")]
    RestoreFailed(String),
}

impl Error {
    /// Build a corruption error.
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Build an invalid-argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Build a resource-exhaustion error.
    pub fn exhausted(msg: impl Into<String>) -> Self {
        Error::ResourceExhausted(msg.into())
    }

    /// Check whether this error denotes persisted-state corruption.
    ///
    /// Corruption never advances an epoch and is surfaced to the caller.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_) | Error::BadMagic { .. })
    }

    /// Check whether this error may be skipped by a writer worker.
    ///
    /// Transient errors are confined to the pool: the unit is dropped and
    /// the worker keeps draining its queue.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_io() {
        let err = Error::Io(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_display_bad_magic() {
        let err = Error::BadMagic {
            what: "superblock",
            expected: 0x4352_594f,
            found: 0,
        };
        let msg = err.to_string();
        assert!(msg.contains("superblock"));
        assert!(msg.contains("0x4352594f"));
        assert!(err.is_corruption());
    }

    #[test]
    fn test_classification() {
        assert!(Error::corruption("torn write").is_corruption());
        assert!(Error::Transient("page unmapped".into()).is_transient());
        assert!(!Error::invalid_argument("bad oid").is_transient());
        assert!(!Error::NoSpace { requested: 4096 }.is_corruption());
    }

    #[test]
    fn test_from_io() {
        fn fails() -> Result<()> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(Error::Io(_))));
    }

    #[test]
    fn test_no_such_partition_display() {
        let err = Error::NoSuchPartition(Oid(9));
        assert!(err.to_string().contains('9'));
    }
}
