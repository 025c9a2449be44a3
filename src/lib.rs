//! # Cryo
//!
//! A whole-process checkpoint/restore engine over a log-structured
//! object store. Running processes are snapshotted (address space, CPU
//! state, open descriptors) to durable storage and later restored on
//! top of a fresh process shell. Checkpoints run one-shot or periodic,
//! full-copy or incremental delta, and target a file, a
//! persistent-memory region, or an on-disk object store.
//!
//! # Quick Start
//!
//! ```no_run
//! use cryo::{BackendTarget, CheckpointMode, Cryo, PartitionAttr, SimProcess};
//!
//! fn main() -> cryo::Result<()> {
//!     let cryo = Cryo::new();
//!     cryo.partadd(
//!         1,
//!         PartitionAttr::new(
//!             BackendTarget::File { dir: "./ckpts".into() },
//!             CheckpointMode::Delta,
//!         ),
//!     )?;
//!
//!     let proc = SimProcess::new(100);
//!     proc.map(0x10000, 0x4000, cryo::prot::RW)?;
//!     cryo.attach(1, proc)?;
//!
//!     let epoch = cryo.checkpoint(1, false)?;
//!     cryo.untilepoch(1, epoch)?;
//!
//!     let host = SimProcess::new(200);
//!     cryo.restore(1, &[host], false)?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The [`Cryo`] struct is the entry point; everything in the operation
//! table (§control surface) hangs off it. Internally the engine is
//! layered: `core` (types, errors, codec), `store` (the log-structured
//! COW object store), `wal` (transactional-memory log), `backend`
//! (backend descriptor, writer pool, page index), `engine` (VM model,
//! capture/restore, orchestrator), and `api` (this facade).

pub use cryo_api::*;

/// Region protection bits for the emulated host.
pub use cryo_engine::prot;
