//! Free-extent allocator
//!
//! Free space is tracked in two indexes kept consistent with each other:
//! by offset (for neighbor merging on free) and by (size, offset) (for
//! best-fit allocation). Between commits the state lives in memory; each
//! commit persists both indexes as freshly built B-trees rooted from the
//! superblock, and a mount rebuilds memory by walking the offset tree of
//! the authoritative slot. A failed commit therefore cannot leak allocator
//! state: the previous slot's trees remain authoritative and the in-memory
//! state is reloaded from them.
//!
//! Units: offsets and lengths are in blocks.

use crate::btree::{bulk_blocks_needed, BTree};
use crate::device::Device;
use crate::superblock::DiskPtr;
use cryo_core::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Best-fit free-extent allocator with persistent B-tree form.
#[derive(Debug, Clone)]
pub struct Allocator {
    /// offset → length
    by_offset: BTreeMap<u64, u64>,
    /// (length, offset)
    by_size: BTreeSet<(u64, u64)>,
    /// Blocks reserved for tree serialization by the previous commit but
    /// not referenced by the written trees; returned to the free space at
    /// the start of the next persist.
    pending_reclaim: Vec<u64>,
}

impl Allocator {
    /// An allocator with no free space.
    pub fn new() -> Self {
        Allocator {
            by_offset: BTreeMap::new(),
            by_size: BTreeSet::new(),
            pending_reclaim: Vec::new(),
        }
    }

    /// An allocator whose free space is the single extent
    /// `[first_block, total_blocks)`. Used right after `format`.
    pub fn from_free_extent(first_block: u64, total_blocks: u64) -> Self {
        let mut a = Allocator::new();
        if total_blocks > first_block {
            a.insert_free(first_block, total_blocks - first_block);
        }
        a
    }

    /// Rebuild the allocator from the authoritative offset tree.
    pub fn load(dev: &Device, offset_root: DiskPtr, block_size: u32) -> Result<Self> {
        let tree: BTree<u64> = BTree::new(offset_root, block_size);
        let mut a = Allocator::new();
        tree.for_each(dev, &mut |off, len| {
            a.insert_free(off, len);
            Ok(())
        })?;
        Ok(a)
    }

    fn insert_free(&mut self, off: u64, len: u64) {
        debug_assert!(len > 0);
        self.by_offset.insert(off, len);
        self.by_size.insert((len, off));
    }

    fn remove_free(&mut self, off: u64, len: u64) {
        self.by_offset.remove(&off);
        self.by_size.remove(&(len, off));
    }

    /// Allocate `n` contiguous blocks, best-fit. Returns the first block.
    pub fn alloc_blocks(&mut self, n: u64) -> Result<u64> {
        debug_assert!(n > 0);
        let (len, off) = match self.by_size.range((n, 0)..).next() {
            Some(&(len, off)) => (len, off),
            None => return Err(Error::NoSpace { requested: n }),
        };
        self.remove_free(off, len);
        if len > n {
            self.insert_free(off + n, len - n);
        }
        Ok(off)
    }

    /// Free `n` blocks starting at `off`, merging with adjacent free
    /// extents.
    pub fn free_blocks(&mut self, off: u64, n: u64) {
        debug_assert!(n > 0);
        let mut start = off;
        let mut len = n;

        if let Some((&prev_off, &prev_len)) = self.by_offset.range(..off).next_back() {
            debug_assert!(prev_off + prev_len <= off, "double free at {}", off);
            if prev_off + prev_len == off {
                self.remove_free(prev_off, prev_len);
                start = prev_off;
                len += prev_len;
            }
        }
        if let Some((&next_off, &next_len)) = self.by_offset.range(off..).next() {
            debug_assert!(off + n <= next_off, "double free at {}", off);
            if off + n == next_off {
                self.remove_free(next_off, next_len);
                len += next_len;
            }
        }
        self.insert_free(start, len);
    }

    /// Total free blocks.
    pub fn free_space(&self) -> u64 {
        self.by_offset.values().sum()
    }

    /// Number of free extents.
    pub fn fragments(&self) -> usize {
        self.by_offset.len()
    }

    /// Persist both indexes as B-trees and return
    /// `(size_tree_root, offset_tree_root)`.
    ///
    /// Blocks for the trees are reserved *before* the entry set is frozen,
    /// so the written trees describe exactly the post-reservation free
    /// space. Reserving can only shrink the entry set, so the reservation
    /// computed from the pre-reservation count is always sufficient; any
    /// surplus is queued for reclaim by the next commit.
    pub fn persist(
        &mut self,
        dev: &Device,
        block_size: u32,
        epoch: u64,
    ) -> Result<(DiskPtr, DiskPtr)> {
        for blk in std::mem::take(&mut self.pending_reclaim) {
            self.free_blocks(blk, 1);
        }

        let n = self.by_offset.len();
        let reserve = 2 * bulk_blocks_needed(n, block_size, 8);

        let snapshot = (self.by_offset.clone(), self.by_size.clone());
        let mut blocks = Vec::with_capacity(reserve);
        for _ in 0..reserve {
            match self.alloc_blocks(1) {
                Ok(b) => blocks.push(b),
                Err(e) => {
                    self.by_offset = snapshot.0;
                    self.by_size = snapshot.1;
                    return Err(e);
                }
            }
        }

        let n2 = self.by_offset.len();
        let per_tree = bulk_blocks_needed(n2, block_size, 8);
        debug_assert!(2 * per_tree <= reserve);

        let mut size_blocks: Vec<u64> = blocks.drain(..per_tree).collect();
        let mut offset_blocks: Vec<u64> = blocks.drain(..per_tree).collect();
        self.pending_reclaim = blocks;

        let size_entries: Vec<(u64, u64)> =
            self.by_size.iter().map(|&(len, off)| (len, off)).collect();
        let offset_entries: Vec<(u64, u64)> =
            self.by_offset.iter().map(|(&off, &len)| (off, len)).collect();

        let size_tree =
            BTree::bulk_build_from_blocks(dev, block_size, epoch, &size_entries, &mut size_blocks)?;
        let offset_tree = BTree::bulk_build_from_blocks(
            dev,
            block_size,
            epoch,
            &offset_entries,
            &mut offset_blocks,
        )?;

        debug!(
            target: "ckpt::store",
            entries = n2,
            reserved = reserve,
            reclaim = self.pending_reclaim.len(),
            "allocator persisted"
        );
        Ok((size_tree.root(), offset_tree.root()))
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Allocator::new()
    }
}
