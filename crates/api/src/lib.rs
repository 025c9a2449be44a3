//! Public control surface of the checkpoint engine
//!
//! The [`Cryo`] facade owns the partition table and the opened stores,
//! and exposes the full operation set: partadd/partdel, attach,
//! checkpoint, memsnap, restore, epochdone/untilepoch, setattr/getattr,
//! ffork, stat, barrier, and the WAL surface. Internal crates are
//! re-exported only to the extent embeddings need them (host processes,
//! attributes, store formatting).

#![warn(clippy::all)]

pub mod facade;

pub use facade::{Cryo, CryoConfig};

pub use cryo_backend::{PageIndex, PmPageSink, PmRegion, PoolConfig, StorePageSink, WriterPool};
pub use cryo_core::{CheckpointMode, Epoch, Error, Oid, Result, EPOCH_INVAL, PAGE_SIZE};
pub use cryo_engine::{
    BackendTarget, FdEntry, FdKind, FdTable, HostProcess, PartitionAttr, PartitionStats,
    SimProcess, ThreadState,
};
pub use cryo_store::{ObjectStore, StoreParams, Superblock};
pub use cryo_wal::Wal;
