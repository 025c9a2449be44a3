//! Core types for the checkpoint/restore engine
//!
//! This crate defines the foundational pieces shared by every layer:
//! - Oid: partition identifier
//! - Epoch: per-partition checkpoint counter
//! - CheckpointMode: full-copy vs incremental delta
//! - Error: unified error type hierarchy
//! - ByteWriter/ByteReader: bounds-checked codec for the on-disk formats
//! - Limits: size limits for descriptors and queues

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod limits;
pub mod types;

pub use codec::{ByteReader, ByteWriter, CodecError};
pub use error::{Error, Result};
pub use limits::Limits;
pub use types::{
    page_index, page_offset, CheckpointMode, Epoch, Oid, EPOCH_INVAL, PAGE_MASK, PAGE_SHIFT,
    PAGE_SIZE,
};
