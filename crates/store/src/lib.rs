//! Log-structured, copy-on-write object store
//!
//! The store is the durable backend for checkpoints. Layout on the device:
//!
//! ```text
//! ┌───────────────────────────────┐
//! │ Superblock ring (N sectors)   │  rotating slots, max valid epoch wins
//! ├───────────────────────────────┤
//! │ Blocks: data extents,         │  allocated log-structured at fresh
//! │ B-tree nodes, inode blocks    │  offsets, never overwritten in place
//! └───────────────────────────────┘
//! ```
//!
//! Metadata is organized as B-trees rooted (directly or transitively) from
//! the superblock: the inode tree (ino → inode block), per-inode extent
//! trees (logical block → extent), the checksum tree (physical block →
//! CRC32), and the allocator's size- and offset-indexed trees.
//!
//! A commit writes all new data and metadata at fresh offsets, then writes
//! a fresh superblock slot with an incremented epoch *last* and flushes it.
//! Readers of a mounted epoch therefore see either the old or the new tree,
//! never a mix.

#![warn(clippy::all)]

pub mod alloc;
pub mod btree;
pub mod device;
pub mod dir;
pub mod inode;
pub mod params;
pub mod store;
pub mod superblock;

pub use alloc::Allocator;
pub use btree::{BTree, NodeKind, TreeValue};
pub use device::Device;
pub use dir::DirEntry;
pub use inode::{Inode, RecordType, INODE_MAGIC, ROOT_DIR_INODE};
pub use params::StoreParams;
pub use store::ObjectStore;
pub use superblock::{DiskPtr, Superblock, DISK_PTR_SIZE, SUPERBLOCK_MAGIC, SUPERBLOCK_SIZE};
