//! On-disk copy-on-write B-trees
//!
//! Every metadata index in the store is one of these trees: the inode tree
//! (ino → inode block pointer), per-inode extent trees (logical block →
//! extent), the checksum tree (physical block → CRC32), and the allocator's
//! size and offset trees. Keys are always u64; values are either bare u64s
//! or 24-byte disk pointers.
//!
//! # Node Layout (one block)
//!
//! ```text
//! ┌──────────┬─────────┬──────────┬──────────┬───────────┬───────────┐
//! │ magic(4) │ kind(1) │ nkeys(2) │ cap(2)   │ ksize(2)  │ vsize(2)  │
//! ├──────────┴─────────┴──────────┴──────────┴───────────┴───────────┤
//! │ internal:  keys[cap]            children[cap + 1]                │
//! │ external:  types[cap]  keys[cap]  values[cap]                    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Bucket nodes share the external layout; the bulk builder emits them for
//! leaves holding a single repeated key (duplicate-key runs in the
//! allocator's size tree).
//!
//! # Copy-on-write
//!
//! Mutations never overwrite a block written by an earlier epoch. Each
//! modified node is rewritten at a freshly allocated block, and the new
//! pointer propagates up to the root, which the caller re-roots in the
//! inode or superblock. Blocks allocated during the *current* commit are
//! tracked in [`TreeCtx::fresh`] and may be rewritten in place.

use crate::alloc::Allocator;
use crate::device::Device;
use crate::superblock::DiskPtr;
use cryo_core::{ByteReader, ByteWriter, Error, Result};
use rustc_hash::FxHashSet;
use std::marker::PhantomData;

/// Magic tag of a B-tree node block.
pub const NODE_MAGIC: u32 = 0x4254_4e44;

/// Encoded node header size.
pub const NODE_HEADER_SIZE: usize = 16;

const KEY_SIZE: usize = 8;
const CHILD_PTR_SIZE: usize = 8;

/// Kind of a B-tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Routing node: keys separate child subtrees.
    Internal,
    /// Leaf node holding key/value entries.
    External,
    /// Leaf holding a run of duplicate keys (external layout).
    Bucket,
}

impl NodeKind {
    fn as_u8(self) -> u8 {
        match self {
            NodeKind::Internal => 1,
            NodeKind::External => 2,
            NodeKind::Bucket => 3,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(NodeKind::Internal),
            2 => Some(NodeKind::External),
            3 => Some(NodeKind::Bucket),
            _ => None,
        }
    }

    fn is_leaf(self) -> bool {
        !matches!(self, NodeKind::Internal)
    }
}

/// A fixed-size value storable in a tree leaf.
pub trait TreeValue: Copy + std::fmt::Debug {
    /// Encoded size in bytes.
    const SIZE: usize;
    /// Append the encoding.
    fn write(&self, w: &mut ByteWriter);
    /// Decode from a reader.
    fn read(r: &mut ByteReader<'_>) -> Result<Self>;
}

impl TreeValue for u64 {
    const SIZE: usize = 8;

    fn write(&self, w: &mut ByteWriter) {
        w.put_u64(*self);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        r.get_u64().map_err(|e| Error::corruption(e.to_string()))
    }
}

impl TreeValue for DiskPtr {
    const SIZE: usize = 24;

    fn write(&self, w: &mut ByteWriter) {
        self.encode(w);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        DiskPtr::decode(r)
    }
}

/// Maximum keys in an external node for the given geometry.
pub fn external_capacity(block_size: u32, val_size: usize) -> usize {
    (block_size as usize - NODE_HEADER_SIZE) / (1 + KEY_SIZE + val_size)
}

/// Maximum keys in an internal node for the given geometry.
pub fn internal_capacity(block_size: u32) -> usize {
    (block_size as usize - NODE_HEADER_SIZE - CHILD_PTR_SIZE) / (KEY_SIZE + CHILD_PTR_SIZE)
}

/// Blocks needed to bulk-build a tree of `entries` values of `val_size`.
///
/// An upper bound used by the allocator to reserve space for its own
/// persisted trees before serializing them.
pub fn bulk_blocks_needed(entries: usize, block_size: u32, val_size: usize) -> usize {
    if entries == 0 {
        return 0;
    }
    let ext_cap = external_capacity(block_size, val_size);
    let int_fanout = internal_capacity(block_size) + 1;
    let mut nodes = entries.div_ceil(ext_cap);
    let mut total = nodes;
    while nodes > 1 {
        nodes = nodes.div_ceil(int_fanout);
        total += nodes;
    }
    total
}

/// Mutation context for one commit.
///
/// Shared by every tree mutated during the commit so the freshly written
/// block set is store-wide: a block COWed once may be rewritten in place by
/// later inserts of the same commit.
pub struct TreeCtx<'a> {
    /// The store device.
    pub dev: &'a Device,
    /// The free-extent allocator.
    pub alloc: &'a mut Allocator,
    /// Epoch being committed.
    pub epoch: u64,
    /// Blocks allocated during this commit.
    pub fresh: &'a mut FxHashSet<u64>,
}

impl<'a> TreeCtx<'a> {
    /// Allocate one metadata block.
    fn alloc_block(&mut self) -> Result<u64> {
        let blk = self.alloc.alloc_blocks(1)?;
        self.fresh.insert(blk);
        Ok(blk)
    }
}

/// In-memory image of one node.
#[derive(Debug, Clone)]
struct Node<V: TreeValue> {
    kind: NodeKind,
    keys: Vec<u64>,
    vals: Vec<V>,
    types: Vec<u8>,
    children: Vec<u64>,
}

impl<V: TreeValue> Node<V> {
    fn leaf() -> Self {
        Node {
            kind: NodeKind::External,
            keys: Vec::new(),
            vals: Vec::new(),
            types: Vec::new(),
            children: Vec::new(),
        }
    }

    fn to_bytes(&self, block_size: u32) -> Vec<u8> {
        let capacity = match self.kind {
            NodeKind::Internal => internal_capacity(block_size),
            _ => external_capacity(block_size, V::SIZE),
        };
        debug_assert!(self.keys.len() <= capacity);

        let mut w = ByteWriter::with_capacity(block_size as usize);
        w.put_u32(NODE_MAGIC);
        w.put_u8(self.kind.as_u8());
        w.put_u8(0);
        w.put_u16(self.keys.len() as u16);
        w.put_u16(capacity as u16);
        w.put_u16(KEY_SIZE as u16);
        w.put_u16(match self.kind {
            NodeKind::Internal => CHILD_PTR_SIZE as u16,
            _ => V::SIZE as u16,
        });
        w.put_u16(0);

        match self.kind {
            NodeKind::Internal => {
                for k in &self.keys {
                    w.put_u64(*k);
                }
                for _ in self.keys.len()..capacity {
                    w.put_u64(0);
                }
                for c in &self.children {
                    w.put_u64(*c);
                }
                for _ in self.children.len()..capacity + 1 {
                    w.put_u64(0);
                }
            }
            NodeKind::External | NodeKind::Bucket => {
                for t in &self.types {
                    w.put_u8(*t);
                }
                for _ in self.types.len()..capacity {
                    w.put_u8(0);
                }
                for k in &self.keys {
                    w.put_u64(*k);
                }
                for _ in self.keys.len()..capacity {
                    w.put_u64(0);
                }
                for v in &self.vals {
                    v.write(&mut w);
                }
            }
        }
        w.pad_to(block_size as usize);
        w.into_vec()
    }

    fn from_bytes(buf: &[u8], block_size: u32) -> Result<Self> {
        let mut r = ByteReader::new(buf);
        let magic = r.get_u32().map_err(|e| Error::corruption(e.to_string()))?;
        if magic != NODE_MAGIC {
            return Err(Error::BadMagic {
                what: "btree node",
                expected: NODE_MAGIC,
                found: magic,
            });
        }
        let kind = NodeKind::from_u8(r.get_u8().map_err(|e| Error::corruption(e.to_string()))?)
            .ok_or_else(|| Error::corruption("unknown btree node kind"))?;
        r.skip(1).map_err(|e| Error::corruption(e.to_string()))?;
        let nkeys = r.get_u16().map_err(|e| Error::corruption(e.to_string()))? as usize;
        let capacity = r.get_u16().map_err(|e| Error::corruption(e.to_string()))? as usize;
        let key_size = r.get_u16().map_err(|e| Error::corruption(e.to_string()))? as usize;
        let val_size = r.get_u16().map_err(|e| Error::corruption(e.to_string()))? as usize;
        r.skip(2).map_err(|e| Error::corruption(e.to_string()))?;

        let expected_cap = match kind {
            NodeKind::Internal => internal_capacity(block_size),
            _ => external_capacity(block_size, V::SIZE),
        };
        let expected_vs = match kind {
            NodeKind::Internal => CHILD_PTR_SIZE,
            _ => V::SIZE,
        };
        if key_size != KEY_SIZE || val_size != expected_vs || capacity != expected_cap {
            return Err(Error::corruption(format!(
                "btree node geometry mismatch: nkeys={} cap={} ksize={} vsize={}",
                nkeys, capacity, key_size, val_size
            )));
        }
        if nkeys > capacity {
            return Err(Error::corruption(format!(
                "btree node overfull: {} keys, capacity {}",
                nkeys, capacity
            )));
        }

        let mut node = Node {
            kind,
            keys: Vec::with_capacity(nkeys),
            vals: Vec::new(),
            types: Vec::new(),
            children: Vec::new(),
        };

        match kind {
            NodeKind::Internal => {
                for i in 0..capacity {
                    let k = r.get_u64().map_err(|e| Error::corruption(e.to_string()))?;
                    if i < nkeys {
                        node.keys.push(k);
                    }
                }
                for i in 0..capacity + 1 {
                    let c = r.get_u64().map_err(|e| Error::corruption(e.to_string()))?;
                    if i < nkeys + 1 {
                        node.children.push(c);
                    }
                }
            }
            NodeKind::External | NodeKind::Bucket => {
                for i in 0..capacity {
                    let t = r.get_u8().map_err(|e| Error::corruption(e.to_string()))?;
                    if i < nkeys {
                        node.types.push(t);
                    }
                }
                for i in 0..capacity {
                    let k = r.get_u64().map_err(|e| Error::corruption(e.to_string()))?;
                    if i < nkeys {
                        node.keys.push(k);
                    }
                }
                for _ in 0..nkeys {
                    node.vals.push(V::read(&mut r)?);
                }
            }
        }
        Ok(node)
    }
}

/// Outcome of a recursive insert: the (possibly new) block of the visited
/// node, plus a split sibling to hang off the parent.
struct Inserted {
    ptr: u64,
    split: Option<(u64, u64)>,
}

/// Outcome of a recursive remove.
struct Removed<V> {
    /// New block of the visited node, or None if the node became empty
    /// and was dropped.
    ptr: Option<u64>,
    val: Option<V>,
}

/// Handle to one on-disk tree.
///
/// The handle itself is cheap; all state lives on the device. Mutations
/// update `root`, which the caller persists into its owning structure.
#[derive(Debug, Clone)]
pub struct BTree<V: TreeValue> {
    root: DiskPtr,
    block_size: u32,
    _marker: PhantomData<V>,
}

impl<V: TreeValue> BTree<V> {
    /// Open a tree at the given root; a null root is the empty tree.
    pub fn new(root: DiskPtr, block_size: u32) -> Self {
        BTree {
            root,
            block_size,
            _marker: PhantomData,
        }
    }

    /// Current root pointer.
    pub fn root(&self) -> DiskPtr {
        self.root
    }

    /// Whether the tree holds no entries.
    pub fn is_empty(&self) -> bool {
        self.root.is_null()
    }

    fn read_node(&self, dev: &Device, blkno: u64) -> Result<Node<V>> {
        let mut buf = vec![0u8; self.block_size as usize];
        dev.read_block(blkno, &mut buf)?;
        Node::from_bytes(&buf, self.block_size)
    }

    fn write_cow(&self, ctx: &mut TreeCtx<'_>, node: &Node<V>, old: Option<u64>) -> Result<u64> {
        let blkno = match old {
            Some(b) if ctx.fresh.contains(&b) => b,
            _ => ctx.alloc_block()?,
        };
        ctx.dev.write_block(blkno, &node.to_bytes(self.block_size))?;
        Ok(blkno)
    }

    /// Look up the exact key.
    pub fn lookup(&self, dev: &Device, key: u64) -> Result<Option<V>> {
        if self.root.is_null() {
            return Ok(None);
        }
        let mut blkno = self.root.offset;
        loop {
            let node = self.read_node(dev, blkno)?;
            if node.kind.is_leaf() {
                return Ok(match node.keys.binary_search(&key) {
                    Ok(i) => Some(node.vals[i]),
                    Err(_) => None,
                });
            }
            let idx = node.keys.partition_point(|&k| k <= key);
            blkno = node.children[idx];
        }
    }

    /// Greatest entry with key ≤ `key`.
    pub fn lookup_floor(&self, dev: &Device, key: u64) -> Result<Option<(u64, V)>> {
        if self.root.is_null() {
            return Ok(None);
        }
        self.floor_rec(dev, self.root.offset, key)
    }

    fn floor_rec(&self, dev: &Device, blkno: u64, key: u64) -> Result<Option<(u64, V)>> {
        let node = self.read_node(dev, blkno)?;
        if node.kind.is_leaf() {
            let p = node.keys.partition_point(|&k| k <= key);
            if p == 0 {
                return Ok(None);
            }
            return Ok(Some((node.keys[p - 1], node.vals[p - 1])));
        }
        let mut idx = node.keys.partition_point(|&k| k <= key);
        loop {
            if let Some(found) = self.floor_rec(dev, node.children[idx], key)? {
                return Ok(Some(found));
            }
            // The chosen subtree may be empty of keys ≤ key only when the
            // separator equals a deleted minimum; fall back left.
            if idx == 0 {
                return Ok(None);
            }
            idx -= 1;
        }
    }

    /// Insert an entry, replacing the value if the key already exists.
    pub fn insert(&mut self, ctx: &mut TreeCtx<'_>, key: u64, val: V) -> Result<()> {
        if self.root.is_null() {
            let mut leaf = Node::leaf();
            leaf.keys.push(key);
            leaf.vals.push(val);
            leaf.types.push(0);
            let blkno = self.write_cow(ctx, &leaf, None)?;
            self.root = DiskPtr::new(blkno, self.block_size as u64, ctx.epoch);
            return Ok(());
        }

        let result = self.insert_rec(ctx, self.root.offset, key, val)?;
        let root_blk = match result.split {
            None => result.ptr,
            Some((sep, right)) => {
                let root = Node::<V> {
                    kind: NodeKind::Internal,
                    keys: vec![sep],
                    vals: Vec::new(),
                    types: Vec::new(),
                    children: vec![result.ptr, right],
                };
                self.write_cow(ctx, &root, None)?
            }
        };
        self.root = DiskPtr::new(root_blk, self.block_size as u64, ctx.epoch);
        Ok(())
    }

    fn insert_rec(&self, ctx: &mut TreeCtx<'_>, blkno: u64, key: u64, val: V) -> Result<Inserted> {
        let mut node = self.read_node(ctx.dev, blkno)?;

        if node.kind.is_leaf() {
            match node.keys.binary_search(&key) {
                Ok(i) => node.vals[i] = val,
                Err(i) => {
                    node.keys.insert(i, key);
                    node.vals.insert(i, val);
                    node.types.insert(i, 0);
                }
            }
            let cap = external_capacity(self.block_size, V::SIZE);
            if node.keys.len() <= cap {
                let ptr = self.write_cow(ctx, &node, Some(blkno))?;
                return Ok(Inserted { ptr, split: None });
            }
            // Split the leaf; the separator is the right half's minimum.
            let mid = node.keys.len() / 2;
            let right = Node {
                kind: NodeKind::External,
                keys: node.keys.split_off(mid),
                vals: node.vals.split_off(mid),
                types: node.types.split_off(mid),
                children: Vec::new(),
            };
            let sep = right.keys[0];
            let left_ptr = self.write_cow(ctx, &node, Some(blkno))?;
            let right_ptr = self.write_cow(ctx, &right, None)?;
            return Ok(Inserted {
                ptr: left_ptr,
                split: Some((sep, right_ptr)),
            });
        }

        let idx = node.keys.partition_point(|&k| k <= key);
        let child = self.insert_rec(ctx, node.children[idx], key, val)?;
        node.children[idx] = child.ptr;
        if let Some((sep, right)) = child.split {
            node.keys.insert(idx, sep);
            node.children.insert(idx + 1, right);
        }

        let cap = internal_capacity(self.block_size);
        if node.keys.len() <= cap {
            let ptr = self.write_cow(ctx, &node, Some(blkno))?;
            return Ok(Inserted { ptr, split: None });
        }
        // Split the routing node; the middle key moves up.
        let mid = node.keys.len() / 2;
        let sep = node.keys[mid];
        let right = Node::<V> {
            kind: NodeKind::Internal,
            keys: node.keys.split_off(mid + 1),
            vals: Vec::new(),
            types: Vec::new(),
            children: node.children.split_off(mid + 1),
        };
        node.keys.pop();
        let left_ptr = self.write_cow(ctx, &node, Some(blkno))?;
        let right_ptr = self.write_cow(ctx, &right, None)?;
        Ok(Inserted {
            ptr: left_ptr,
            split: Some((sep, right_ptr)),
        })
    }

    /// Remove a key. Underfull nodes are permitted; an emptied node is
    /// unlinked from its parent.
    pub fn remove(&mut self, ctx: &mut TreeCtx<'_>, key: u64) -> Result<Option<V>> {
        if self.root.is_null() {
            return Ok(None);
        }
        let result = self.remove_rec(ctx, self.root.offset, key)?;
        match result.ptr {
            None => self.root = DiskPtr::null(),
            Some(blk) => {
                // Collapse a single-child root to keep the height honest.
                let mut blk = blk;
                loop {
                    let node = self.read_node(ctx.dev, blk)?;
                    if node.kind == NodeKind::Internal && node.keys.is_empty() {
                        blk = node.children[0];
                        continue;
                    }
                    break;
                }
                self.root = DiskPtr::new(blk, self.block_size as u64, ctx.epoch);
            }
        }
        Ok(result.val)
    }

    fn remove_rec(&self, ctx: &mut TreeCtx<'_>, blkno: u64, key: u64) -> Result<Removed<V>> {
        let mut node = self.read_node(ctx.dev, blkno)?;

        if node.kind.is_leaf() {
            let i = match node.keys.binary_search(&key) {
                Ok(i) => i,
                Err(_) => {
                    return Ok(Removed {
                        ptr: Some(blkno),
                        val: None,
                    })
                }
            };
            node.keys.remove(i);
            node.types.remove(i);
            let val = node.vals.remove(i);
            if node.keys.is_empty() {
                return Ok(Removed {
                    ptr: None,
                    val: Some(val),
                });
            }
            let ptr = self.write_cow(ctx, &node, Some(blkno))?;
            return Ok(Removed {
                ptr: Some(ptr),
                val: Some(val),
            });
        }

        let idx = node.keys.partition_point(|&k| k <= key);
        let child = self.remove_rec(ctx, node.children[idx], key)?;
        if child.val.is_none() {
            return Ok(Removed {
                ptr: Some(blkno),
                val: None,
            });
        }
        match child.ptr {
            Some(ptr) => node.children[idx] = ptr,
            None => {
                node.children.remove(idx);
                if idx > 0 {
                    node.keys.remove(idx - 1);
                } else if !node.keys.is_empty() {
                    node.keys.remove(0);
                }
                if node.children.is_empty() {
                    return Ok(Removed {
                        ptr: None,
                        val: child.val,
                    });
                }
            }
        }
        let ptr = self.write_cow(ctx, &node, Some(blkno))?;
        Ok(Removed {
            ptr: Some(ptr),
            val: child.val,
        })
    }

    /// Visit every entry in key order.
    pub fn for_each(
        &self,
        dev: &Device,
        f: &mut impl FnMut(u64, V) -> Result<()>,
    ) -> Result<()> {
        if self.root.is_null() {
            return Ok(());
        }
        self.walk(dev, self.root.offset, f)
    }

    fn walk(
        &self,
        dev: &Device,
        blkno: u64,
        f: &mut impl FnMut(u64, V) -> Result<()>,
    ) -> Result<()> {
        let node = self.read_node(dev, blkno)?;
        if node.kind.is_leaf() {
            for (k, v) in node.keys.iter().zip(node.vals.iter()) {
                f(*k, *v)?;
            }
            return Ok(());
        }
        for child in &node.children {
            self.walk(dev, *child, f)?;
        }
        Ok(())
    }

    /// Collect every entry into a vector (mount-time loading).
    pub fn entries(&self, dev: &Device) -> Result<Vec<(u64, V)>> {
        let mut out = Vec::new();
        self.for_each(dev, &mut |k, v| {
            out.push((k, v));
            Ok(())
        })?;
        Ok(out)
    }

    /// Free every node block of this tree, calling `free_val` for each
    /// stored value so callers can release value-owned extents too.
    pub fn free(
        &self,
        dev: &Device,
        alloc: &mut Allocator,
        free_val: &mut impl FnMut(&mut Allocator, u64, V),
    ) -> Result<()> {
        if self.root.is_null() {
            return Ok(());
        }
        self.free_rec(dev, alloc, self.root.offset, free_val)
    }

    fn free_rec(
        &self,
        dev: &Device,
        alloc: &mut Allocator,
        blkno: u64,
        free_val: &mut impl FnMut(&mut Allocator, u64, V),
    ) -> Result<()> {
        let node = self.read_node(dev, blkno)?;
        if node.kind.is_leaf() {
            for (k, v) in node.keys.iter().zip(node.vals.iter()) {
                free_val(alloc, *k, *v);
            }
        } else {
            for child in &node.children {
                self.free_rec(dev, alloc, *child, free_val)?;
            }
        }
        alloc.free_blocks(blkno, 1);
        Ok(())
    }

    /// Build a tree bottom-up from sorted entries, drawing node blocks
    /// from the supplied pre-allocated list.
    ///
    /// Used by the allocator to persist itself: the block list is carved
    /// out *before* the entry set is frozen, so the serialized trees
    /// describe exactly the post-reservation free space.
    pub fn bulk_build_from_blocks(
        dev: &Device,
        block_size: u32,
        epoch: u64,
        entries: &[(u64, V)],
        blocks: &mut Vec<u64>,
    ) -> Result<Self> {
        if entries.is_empty() {
            return Ok(BTree::new(DiskPtr::null(), block_size));
        }
        debug_assert!(entries.windows(2).all(|w| w[0].0 <= w[1].0));

        let ext_cap = external_capacity(block_size, V::SIZE);
        let mut level: Vec<(u64, u64)> = Vec::new(); // (min key, blkno)

        for chunk in entries.chunks(ext_cap) {
            let all_same = chunk.len() > 1 && chunk.iter().all(|(k, _)| *k == chunk[0].0);
            let node = Node {
                kind: if all_same {
                    NodeKind::Bucket
                } else {
                    NodeKind::External
                },
                keys: chunk.iter().map(|(k, _)| *k).collect(),
                vals: chunk.iter().map(|(_, v)| *v).collect(),
                types: vec![0; chunk.len()],
                children: Vec::new(),
            };
            let blkno = blocks
                .pop()
                .ok_or_else(|| Error::exhausted("bulk build ran out of reserved blocks"))?;
            dev.write_block(blkno, &node.to_bytes(block_size))?;
            level.push((chunk[0].0, blkno));
        }

        let int_fanout = internal_capacity(block_size) + 1;
        while level.len() > 1 {
            let mut next = Vec::new();
            for chunk in level.chunks(int_fanout) {
                let node = Node::<V> {
                    kind: NodeKind::Internal,
                    keys: chunk[1..].iter().map(|(k, _)| *k).collect(),
                    vals: Vec::new(),
                    types: Vec::new(),
                    children: chunk.iter().map(|(_, b)| *b).collect(),
                };
                let blkno = blocks
                    .pop()
                    .ok_or_else(|| Error::exhausted("bulk build ran out of reserved blocks"))?;
                dev.write_block(blkno, &node.to_bytes(block_size))?;
                next.push((chunk[0].0, blkno));
            }
            level = next;
        }

        Ok(BTree::new(
            DiskPtr::new(level[0].1, block_size as u64, epoch),
            block_size,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::StoreParams;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    const BSIZE: u32 = 4096;

    fn make_dev() -> (tempfile::TempDir, Device, Allocator) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev");
        let params = StoreParams::for_testing();
        let dev = Device::create(&path, params.size, params.sector_size, params.block_size)
            .unwrap();
        let alloc = Allocator::from_free_extent(params.first_data_block(), params.total_blocks());
        (dir, dev, alloc)
    }

    fn ctx<'a>(
        dev: &'a Device,
        alloc: &'a mut Allocator,
        fresh: &'a mut FxHashSet<u64>,
    ) -> TreeCtx<'a> {
        TreeCtx {
            dev,
            alloc,
            epoch: 1,
            fresh,
        }
    }

    #[test]
    fn test_insert_lookup_small() {
        let (_dir, dev, mut alloc) = make_dev();
        let mut fresh = FxHashSet::default();
        let mut tree: BTree<u64> = BTree::new(DiskPtr::null(), BSIZE);

        let mut c = ctx(&dev, &mut alloc, &mut fresh);
        for k in [5u64, 1, 9, 3, 7] {
            tree.insert(&mut c, k, k * 100).unwrap();
        }
        for k in [5u64, 1, 9, 3, 7] {
            assert_eq!(tree.lookup(&dev, k).unwrap(), Some(k * 100));
        }
        assert_eq!(tree.lookup(&dev, 4).unwrap(), None);
    }

    #[test]
    fn test_insert_replaces() {
        let (_dir, dev, mut alloc) = make_dev();
        let mut fresh = FxHashSet::default();
        let mut tree: BTree<u64> = BTree::new(DiskPtr::null(), BSIZE);
        let mut c = ctx(&dev, &mut alloc, &mut fresh);
        tree.insert(&mut c, 1, 10).unwrap();
        tree.insert(&mut c, 1, 20).unwrap();
        assert_eq!(tree.lookup(&dev, 1).unwrap(), Some(20));
    }

    #[test]
    fn test_many_inserts_split() {
        let (_dir, dev, mut alloc) = make_dev();
        let mut fresh = FxHashSet::default();
        let mut tree: BTree<DiskPtr> = BTree::new(DiskPtr::null(), BSIZE);

        let mut c = ctx(&dev, &mut alloc, &mut fresh);
        // Enough entries to force several leaf splits and an internal level.
        let n = 500u64;
        for i in 0..n {
            let k = (i * 7919) % 10000;
            tree.insert(&mut c, k, DiskPtr::new(k, 4096, 1)).unwrap();
        }
        for i in 0..n {
            let k = (i * 7919) % 10000;
            assert_eq!(tree.lookup(&dev, k).unwrap(), Some(DiskPtr::new(k, 4096, 1)));
        }

        let entries = tree.entries(&dev).unwrap();
        assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_lookup_floor() {
        let (_dir, dev, mut alloc) = make_dev();
        let mut fresh = FxHashSet::default();
        let mut tree: BTree<u64> = BTree::new(DiskPtr::null(), BSIZE);
        let mut c = ctx(&dev, &mut alloc, &mut fresh);
        for k in [10u64, 20, 30] {
            tree.insert(&mut c, k, k).unwrap();
        }
        assert_eq!(tree.lookup_floor(&dev, 25).unwrap(), Some((20, 20)));
        assert_eq!(tree.lookup_floor(&dev, 30).unwrap(), Some((30, 30)));
        assert_eq!(tree.lookup_floor(&dev, 5).unwrap(), None);
    }

    #[test]
    fn test_remove() {
        let (_dir, dev, mut alloc) = make_dev();
        let mut fresh = FxHashSet::default();
        let mut tree: BTree<u64> = BTree::new(DiskPtr::null(), BSIZE);
        let mut c = ctx(&dev, &mut alloc, &mut fresh);
        for k in 0..200u64 {
            tree.insert(&mut c, k, k).unwrap();
        }
        assert_eq!(tree.remove(&mut c, 100).unwrap(), Some(100));
        assert_eq!(tree.remove(&mut c, 100).unwrap(), None);
        assert_eq!(tree.lookup(&dev, 100).unwrap(), None);
        assert_eq!(tree.lookup(&dev, 99).unwrap(), Some(99));
        assert_eq!(tree.lookup(&dev, 101).unwrap(), Some(101));
    }

    #[test]
    fn test_remove_to_empty() {
        let (_dir, dev, mut alloc) = make_dev();
        let mut fresh = FxHashSet::default();
        let mut tree: BTree<u64> = BTree::new(DiskPtr::null(), BSIZE);
        let mut c = ctx(&dev, &mut alloc, &mut fresh);
        for k in 0..10u64 {
            tree.insert(&mut c, k, k).unwrap();
        }
        for k in 0..10u64 {
            assert_eq!(tree.remove(&mut c, k).unwrap(), Some(k));
        }
        assert!(tree.is_empty());
    }

    #[test]
    fn test_cow_preserves_old_root() {
        let (_dir, dev, mut alloc) = make_dev();
        let mut tree: BTree<u64> = BTree::new(DiskPtr::null(), BSIZE);

        // Epoch 1 writes its tree.
        let mut fresh = FxHashSet::default();
        {
            let mut c = ctx(&dev, &mut alloc, &mut fresh);
            for k in 0..300u64 {
                tree.insert(&mut c, k, k).unwrap();
            }
        }
        let old_root = tree.root();
        let old_tree: BTree<u64> = BTree::new(old_root, BSIZE);

        // Epoch 2 mutates with an empty fresh set, forcing COW.
        let mut fresh2 = FxHashSet::default();
        {
            let mut c = TreeCtx {
                dev: &dev,
                alloc: &mut alloc,
                epoch: 2,
                fresh: &mut fresh2,
            };
            for k in 0..300u64 {
                tree.insert(&mut c, k, k + 1000).unwrap();
            }
        }

        // The old root still reads the old values.
        assert_eq!(old_tree.lookup(&dev, 5).unwrap(), Some(5));
        assert_eq!(tree.lookup(&dev, 5).unwrap(), Some(1005));
        assert_ne!(old_root.offset, tree.root().offset);
    }

    #[test]
    fn test_bulk_build_roundtrip() {
        let (_dir, dev, mut alloc) = make_dev();
        let entries: Vec<(u64, u64)> = (0..1000u64).map(|k| (k * 3, k)).collect();
        let needed = bulk_blocks_needed(entries.len(), BSIZE, 8);
        let mut blocks = Vec::new();
        for _ in 0..needed {
            blocks.push(alloc.alloc_blocks(1).unwrap());
        }
        let tree = BTree::bulk_build_from_blocks(&dev, BSIZE, 3, &entries, &mut blocks).unwrap();
        assert!(blocks.is_empty() || blocks.len() < needed);
        assert_eq!(tree.entries(&dev).unwrap(), entries);
        assert_eq!(tree.lookup(&dev, 30).unwrap(), Some(10));
        assert_eq!(tree.root().epoch, 3);
    }

    #[test]
    fn test_bulk_build_duplicate_keys_bucket() {
        let (_dir, dev, mut alloc) = make_dev();
        let cap = external_capacity(BSIZE, 8);
        // Two full leaves of the same key, then a distinct tail.
        let mut entries: Vec<(u64, u64)> = (0..cap * 2).map(|i| (42, i as u64)).collect();
        entries.extend((0..10u64).map(|i| (100 + i, i)));

        let needed = bulk_blocks_needed(entries.len(), BSIZE, 8);
        let mut blocks = Vec::new();
        for _ in 0..needed {
            blocks.push(alloc.alloc_blocks(1).unwrap());
        }
        let tree = BTree::bulk_build_from_blocks(&dev, BSIZE, 1, &entries, &mut blocks).unwrap();
        let back = tree.entries(&dev).unwrap();
        assert_eq!(back.len(), entries.len());
        assert_eq!(back.iter().filter(|(k, _)| *k == 42).count(), cap * 2);
    }

    #[test]
    fn test_corrupt_node_detected() {
        let (_dir, dev, mut alloc) = make_dev();
        let mut fresh = FxHashSet::default();
        let mut tree: BTree<u64> = BTree::new(DiskPtr::null(), BSIZE);
        let mut c = ctx(&dev, &mut alloc, &mut fresh);
        tree.insert(&mut c, 1, 1).unwrap();

        let mut buf = vec![0u8; BSIZE as usize];
        dev.read_block(tree.root().offset, &mut buf).unwrap();
        buf[0] ^= 0xff;
        dev.write_block(tree.root().offset, &buf).unwrap();

        assert!(tree.lookup(&dev, 1).unwrap_err().is_corruption());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_matches_btreemap(ops in proptest::collection::vec((0u64..500, 0u64..1000, any::<bool>()), 1..300)) {
            let (_dir, dev, mut alloc) = make_dev();
            let mut fresh = FxHashSet::default();
            let mut tree: BTree<u64> = BTree::new(DiskPtr::null(), BSIZE);
            let mut model = BTreeMap::new();

            let mut c = ctx(&dev, &mut alloc, &mut fresh);
            for (k, v, is_insert) in ops {
                if is_insert {
                    tree.insert(&mut c, k, v).unwrap();
                    model.insert(k, v);
                } else {
                    let got = tree.remove(&mut c, k).unwrap();
                    let want = model.remove(&k);
                    prop_assert_eq!(got, want);
                }
            }

            let got = tree.entries(&dev).unwrap();
            let want: Vec<(u64, u64)> = model.into_iter().collect();
            prop_assert_eq!(got, want);
        }
    }
}
