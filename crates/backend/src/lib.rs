//! Checkpoint backends, the writer pool, and the page index
//!
//! A [`Backend`] is the uniform handle the checkpoint engine streams a
//! snapshot through: a plain file, a bounded persistent-memory region, or
//! an inode of the object store. The [`WriterPool`] drains queued
//! `(vaddr, page)` units to a [`PageSink`] in parallel; the [`PageIndex`]
//! recombines saved pages newest-first at restore time.

#![warn(clippy::all)]

pub mod descriptor;
pub mod page_index;
pub mod pm;
pub mod pool;

pub use descriptor::Backend;
pub use page_index::PageIndex;
pub use pm::PmRegion;
pub use pool::{
    striped_cursors, PageSink, PageUnit, PmPageSink, PoolConfig, StorePageSink, WriterPool,
    PAGE_UNIT_SIZE,
};
