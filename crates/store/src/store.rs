//! The object store: mount, record I/O, and the commit protocol
//!
//! One `ObjectStore` owns a device. All mutation is staged in memory and
//! made durable by [`ObjectStore::commit`], which follows the
//! copy-on-write protocol:
//!
//! 1. data extents are already on disk at fresh offsets (written by
//!    `write_record` as they were staged);
//! 2. each dirty inode's extent tree absorbs its staged extents via COW
//!    path copies, and a new inode block is written;
//! 3. a new inode-tree root is written referencing the new inode blocks;
//! 4. new checksum-tree and allocator roots are written;
//! 5. a fresh superblock slot with the incremented epoch is written to the
//!    next ring position and flushed last. Only then does the epoch become
//!    visible.
//!
//! A failed commit reloads the in-memory state from the authoritative
//! slot, so staged extents and their allocations simply vanish.

use crate::alloc::Allocator;
use crate::btree::{BTree, TreeCtx};
use crate::device::Device;
use crate::dir::{pack_entries, unpack_entries, DirEntry};
use crate::inode::{Inode, RecordType, Timespec, ROOT_DIR_INODE};
use crate::params::StoreParams;
use crate::superblock::{DiskPtr, Superblock, SUPERBLOCK_SIZE};
use cryo_core::{Epoch, Error, Result};
use parking_lot::{Condvar, Mutex};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Furthest 512-byte stride probed for a decodable slot when the sector
/// size is not yet known.
const GEOMETRY_PROBE_LIMIT: u64 = 1024;

/// One cached inode plus its staged, not-yet-committed extents.
struct CachedInode {
    inode: Inode,
    tree: BTree<DiskPtr>,
    pending: BTreeMap<u64, DiskPtr>,
    dirty: bool,
}

/// Mutable store state, guarded by the store-wide commit lock.
struct StoreState {
    sb: Superblock,
    /// Ring index holding the authoritative slot; meaningless until
    /// `have_valid`.
    last_slot: u64,
    have_valid: bool,
    alloc: Allocator,
    inode_tree: BTree<DiskPtr>,
    cksum_tree: BTree<u64>,
    inodes: FxHashMap<u64, CachedInode>,
    removed: Vec<u64>,
    staged_cksums: FxHashMap<u64, u32>,
    attempted: u64,
    data_blocks_staged: u64,
}

/// A mounted log-structured object store.
pub struct ObjectStore {
    dev: Device,
    block_size: u32,
    sector_size: u32,
    slots: u32,
    state: Mutex<StoreState>,
    committed: Mutex<Epoch>,
    commit_cv: Condvar,
    /// Held across a whole checkpoint (stage + commit) so two competing
    /// checkpoints on the same store serialize and only one epoch
    /// advances per commit.
    checkpoint_serial: Mutex<()>,
}

impl ObjectStore {
    /// Format a device: write every superblock slot as unused
    /// (`EPOCH_INVAL`) with the chosen geometry.
    pub fn format(path: &Path, params: &StoreParams) -> Result<()> {
        if (params.sector_size as usize) < SUPERBLOCK_SIZE {
            return Err(Error::invalid_argument(format!(
                "sector size {} below superblock size",
                params.sector_size
            )));
        }
        if params.block_size % params.sector_size != 0 {
            return Err(Error::invalid_argument(
                "block size must be a multiple of the sector size",
            ));
        }
        if params.total_blocks() <= params.first_data_block() {
            return Err(Error::invalid_argument("volume too small for its ring"));
        }

        let dev = Device::create(path, params.size, params.sector_size, params.block_size)?;
        let uuid = *Uuid::new_v4().as_bytes();
        let mut sb = Superblock::formatted(params, uuid, 0);
        for i in 0..params.slots {
            sb.index = i as u64;
            dev.write_sector(i as u64, &sb.to_bytes(params.sector_size as usize))?;
        }
        dev.sync()?;
        info!(
            target: "ckpt::store",
            path = %path.display(),
            slots = params.slots,
            size = params.size,
            "store formatted"
        );
        Ok(())
    }

    /// Mount a store: scan the superblock ring and adopt the slot with
    /// the greatest valid epoch. Torn or corrupt slots are ignored.
    pub fn open(path: &Path) -> Result<Self> {
        // The geometry lives inside the slots themselves; probe on the
        // smallest sector stride until one decodes.
        let probe = Device::open(path, 512, 4096)?;
        let mut template = None;
        for i in 0..GEOMETRY_PROBE_LIMIT {
            let mut buf = vec![0u8; SUPERBLOCK_SIZE];
            if probe.read_sector(i, &mut buf).is_err() {
                break;
            }
            if let Ok(sb) = Superblock::from_bytes(&buf) {
                template = Some(sb);
                break;
            }
        }
        let template =
            template.ok_or_else(|| Error::corruption("no decodable superblock slot found"))?;

        let dev = Device::open(path, template.sector_size, template.block_size)?;
        let slots = template.slots;
        let sector_size = template.sector_size;
        let block_size = template.block_size;

        let mut best: Option<(u64, Superblock)> = None;
        for i in 0..slots as u64 {
            let mut buf = vec![0u8; sector_size as usize];
            dev.read_sector(i, &mut buf)?;
            match Superblock::from_bytes(&buf[..SUPERBLOCK_SIZE]) {
                Ok(sb) if sb.in_use() => {
                    if best.as_ref().map_or(true, |(_, b)| sb.epoch > b.epoch) {
                        best = Some((i, sb));
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(target: "ckpt::store", slot = i, error = %e, "ignoring bad slot");
                }
            }
        }

        let (state, committed) = match best {
            Some((idx, sb)) => {
                let alloc = Allocator::load(&dev, sb.alloc_offset_root, block_size)?;
                let inode_tree = BTree::new(sb.inode_root, block_size);
                let cksum_tree = BTree::new(sb.cksum_root, block_size);
                let epoch = sb.epoch;
                let attempted = sb.attempted_checkpoints;
                info!(
                    target: "ckpt::store",
                    slot = idx,
                    epoch,
                    name = %sb.name,
                    "store mounted"
                );
                (
                    StoreState {
                        sb,
                        last_slot: idx,
                        have_valid: true,
                        alloc,
                        inode_tree,
                        cksum_tree,
                        inodes: FxHashMap::default(),
                        removed: Vec::new(),
                        staged_cksums: FxHashMap::default(),
                        attempted,
                        data_blocks_staged: 0,
                    },
                    epoch,
                )
            }
            None => {
                // Freshly formatted volume: everything past the ring is free.
                let params = StoreParams {
                    sector_size,
                    block_size,
                    slots,
                    size: template.size,
                    name: template.name.clone(),
                };
                let alloc = Allocator::from_free_extent(
                    params.first_data_block(),
                    params.total_blocks(),
                );
                info!(target: "ckpt::store", name = %template.name, "store mounted empty");
                (
                    StoreState {
                        sb: template,
                        last_slot: slots as u64 - 1,
                        have_valid: false,
                        alloc,
                        inode_tree: BTree::new(DiskPtr::null(), block_size),
                        cksum_tree: BTree::new(DiskPtr::null(), block_size),
                        inodes: FxHashMap::default(),
                        removed: Vec::new(),
                        staged_cksums: FxHashMap::default(),
                        attempted: 0,
                        data_blocks_staged: 0,
                    },
                    0,
                )
            }
        };

        Ok(ObjectStore {
            dev,
            block_size,
            sector_size,
            slots,
            state: Mutex::new(state),
            committed: Mutex::new(committed),
            commit_cv: Condvar::new(),
            checkpoint_serial: Mutex::new(()),
        })
    }

    /// Serialize a multi-step checkpoint (stage records, then commit)
    /// against other checkpoints of this store.
    pub fn begin_checkpoint(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.checkpoint_serial.lock()
    }

    /// Block size of this volume.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Volume UUID.
    pub fn uuid(&self) -> [u8; 16] {
        self.state.lock().sb.uuid
    }

    /// Last committed epoch (0 if none).
    pub fn epoch(&self) -> Epoch {
        *self.committed.lock()
    }

    /// Whether `epoch` (and every earlier epoch) has committed.
    pub fn epoch_done(&self, epoch: Epoch) -> bool {
        *self.committed.lock() >= epoch
    }

    /// Block until the committed epoch reaches `epoch`.
    pub fn wait_until(&self, epoch: Epoch) {
        let mut g = self.committed.lock();
        while *g < epoch {
            self.commit_cv.wait(&mut g);
        }
    }

    fn load_inode<'a>(
        &self,
        st: &'a mut StoreState,
        ino: u64,
    ) -> Result<&'a mut CachedInode> {
        if !st.inodes.contains_key(&ino) {
            let ptr = st
                .inode_tree
                .lookup(&self.dev, ino)?
                .ok_or_else(|| Error::invalid_argument(format!("no such inode {}", ino)))?;
            let mut buf = vec![0u8; self.block_size as usize];
            self.dev.read_block(ptr.offset, &mut buf)?;
            let inode = Inode::from_bytes(&buf)?;
            if inode.ino != ino {
                return Err(Error::corruption(format!(
                    "inode block for {} names {}",
                    ino, inode.ino
                )));
            }
            let tree = BTree::new(inode.extent_root, self.block_size);
            st.inodes.insert(
                ino,
                CachedInode {
                    inode,
                    tree,
                    pending: BTreeMap::new(),
                    dirty: false,
                },
            );
        }
        Ok(st.inodes.get_mut(&ino).unwrap())
    }

    /// Create a fresh inode. Errors if the number is taken.
    pub fn create_inode(&self, ino: u64, rec_type: RecordType, mode: u32) -> Result<()> {
        let mut st = self.state.lock();
        if st.inodes.contains_key(&ino) || st.inode_tree.lookup(&self.dev, ino)?.is_some() {
            return Err(Error::invalid_argument(format!(
                "inode {} already exists",
                ino
            )));
        }
        st.inodes.insert(
            ino,
            CachedInode {
                inode: Inode::new(ino, rec_type, mode),
                tree: BTree::new(DiskPtr::null(), self.block_size),
                pending: BTreeMap::new(),
                dirty: true,
            },
        );
        debug!(target: "ckpt::store", ino, ?rec_type, "inode created");
        Ok(())
    }

    /// Create an inode unless it already exists.
    pub fn ensure_inode(&self, ino: u64, rec_type: RecordType, mode: u32) -> Result<()> {
        if self.inode_exists(ino)? {
            return Ok(());
        }
        self.create_inode(ino, rec_type, mode)
    }

    /// Whether an inode exists (committed or staged).
    pub fn inode_exists(&self, ino: u64) -> Result<bool> {
        let mut st = self.state.lock();
        if st.inodes.contains_key(&ino) {
            return Ok(true);
        }
        Ok(st.inode_tree.lookup(&self.dev, ino)?.is_some())
    }

    /// Read back an inode's metadata.
    pub fn stat_inode(&self, ino: u64) -> Result<Inode> {
        let mut st = self.state.lock();
        Ok(self.load_inode(&mut st, ino)?.inode.clone())
    }

    /// Stage an inode for removal at the next commit, returning its
    /// extents and nodes to the free space.
    pub fn remove_inode(&self, ino: u64) -> Result<()> {
        let mut st = self.state.lock();
        // Ensure it exists before staging the removal.
        self.load_inode(&mut st, ino)?;
        st.inodes.remove(&ino);
        st.removed.push(ino);
        Ok(())
    }

    /// Write `data` into an inode at byte offset `off` (block-aligned).
    ///
    /// The payload goes to freshly allocated extents immediately; the
    /// extent-tree update is staged until commit. Page writes use the
    /// page's virtual address as the offset, making the extent tree a map
    /// from virtual page number to saved page.
    pub fn write_record(&self, ino: u64, off: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let bsize = self.block_size as u64;
        if off % bsize != 0 {
            return Err(Error::invalid_argument(format!(
                "record offset {:#x} not block-aligned",
                off
            )));
        }

        let mut st = self.state.lock();
        let st = &mut *st;

        // Resolve the inode before touching the allocator so a bad inode
        // number cannot strand fresh blocks.
        self.load_inode(st, ino)?;

        let nblocks = (data.len() as u64).div_ceil(bsize);
        let blk = st.alloc.alloc_blocks(nblocks)?;

        // Zero-pad the tail so every extent block has a whole-block CRC.
        let mut padded;
        let payload = if data.len() as u64 % bsize == 0 {
            data
        } else {
            padded = data.to_vec();
            padded.resize((nblocks * bsize) as usize, 0);
            &padded[..]
        };
        self.dev.write_at(blk, payload)?;

        for i in 0..nblocks {
            let crc = crc32fast::hash(
                &payload[(i * bsize) as usize..((i + 1) * bsize) as usize],
            );
            st.staged_cksums.insert(blk + i, crc);
        }
        st.data_blocks_staged += nblocks;

        let cached = st.inodes.get_mut(&ino).unwrap();
        let lblk = off / bsize;
        // The extent epoch is patched when the commit assigns one.
        let replaced = cached
            .pending
            .insert(lblk, DiskPtr::new(blk, data.len() as u64, 0));
        cached.inode.size = cached.inode.size.max(off + data.len() as u64);
        cached.inode.asize += nblocks * bsize;
        cached.dirty = true;

        // A staged extent superseded within the same epoch was never
        // committed; its blocks go straight back.
        if let Some(old) = replaced {
            let old_blocks = old.size.div_ceil(bsize);
            for i in 0..old_blocks {
                st.staged_cksums.remove(&(old.offset + i));
            }
            st.alloc.free_blocks(old.offset, old_blocks);
            st.data_blocks_staged = st.data_blocks_staged.saturating_sub(old_blocks);
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes from an inode at byte offset `off`,
    /// clipping against the inode size. Returns the bytes read.
    pub fn read_record(&self, ino: u64, off: u64, buf: &mut [u8]) -> Result<usize> {
        let bsize = self.block_size as u64;
        let mut st = self.state.lock();
        self.load_inode(&mut st, ino)?;

        let StoreState {
            ref inodes,
            ref staged_cksums,
            ref cksum_tree,
            ..
        } = *st;
        let cached = &inodes[&ino];
        let size = cached.inode.size;
        if off >= size {
            return Ok(0);
        }
        let want = buf.len().min((size - off) as usize);

        let mut done = 0usize;
        while done < want {
            let cur = off + done as u64;
            let lblk = cur / bsize;
            let within = cur % bsize;

            let (ext_lblk, ptr) = Self::find_extent(&self.dev, cached, lblk, bsize)?
                .ok_or_else(|| {
                    Error::corruption(format!("inode {}: no extent covers block {}", ino, lblk))
                })?;

            let phys = ptr.offset + (lblk - ext_lblk);
            let mut block = vec![0u8; bsize as usize];
            self.dev.read_block(phys, &mut block)?;
            self.check_crc(staged_cksums, cksum_tree, phys, &block)?;

            let n = (want - done).min((bsize - within) as usize);
            buf[done..done + n]
                .copy_from_slice(&block[within as usize..within as usize + n]);
            done += n;
        }
        Ok(done)
    }

    /// Find the extent covering `lblk`, staged extents taking precedence
    /// over the committed tree.
    fn find_extent(
        dev: &Device,
        cached: &CachedInode,
        lblk: u64,
        bsize: u64,
    ) -> Result<Option<(u64, DiskPtr)>> {
        let covers = |start: u64, ptr: &DiskPtr| lblk < start + ptr.size.div_ceil(bsize);
        if let Some((&k, v)) = cached.pending.range(..=lblk).next_back() {
            if covers(k, v) {
                return Ok(Some((k, *v)));
            }
        }
        if let Some((k, v)) = cached.tree.lookup_floor(dev, lblk)? {
            if covers(k, &v) {
                return Ok(Some((k, v)));
            }
        }
        Ok(None)
    }

    fn check_crc(
        &self,
        staged: &FxHashMap<u64, u32>,
        tree: &BTree<u64>,
        phys: u64,
        block: &[u8],
    ) -> Result<()> {
        let expect = match staged.get(&phys) {
            Some(&c) => Some(c),
            None => tree.lookup(&self.dev, phys)?.map(|v| v as u32),
        };
        if let Some(c) = expect {
            let got = crc32fast::hash(block);
            if got != c {
                return Err(Error::corruption(format!(
                    "checksum mismatch at block {}: stored {:#010x}, computed {:#010x}",
                    phys, c, got
                )));
            }
        }
        Ok(())
    }

    /// Logical size of an inode's content.
    pub fn inode_size(&self, ino: u64) -> Result<u64> {
        let mut st = self.state.lock();
        Ok(self.load_inode(&mut st, ino)?.inode.size)
    }

    /// Every extent of an inode as `(byte offset, extent)`, committed and
    /// staged merged (staged wins).
    pub fn extents(&self, ino: u64) -> Result<Vec<(u64, DiskPtr)>> {
        let bsize = self.block_size as u64;
        let mut st = self.state.lock();
        let cached = self.load_inode(&mut st, ino)?;
        let mut map: BTreeMap<u64, DiskPtr> = BTreeMap::new();
        cached.tree.for_each(&self.dev, &mut |lblk, ptr| {
            map.insert(lblk, ptr);
            Ok(())
        })?;
        for (&lblk, &ptr) in &cached.pending {
            map.insert(lblk, ptr);
        }
        Ok(map.into_iter().map(|(l, p)| (l * bsize, p)).collect())
    }

    // ------------------------------------------------------------------
    // Root directory
    // ------------------------------------------------------------------

    /// Add an entry to the store's root directory, creating the directory
    /// inode on first use.
    pub fn dir_add(&self, name: &str, etype: RecordType, ino: u64) -> Result<()> {
        let mut entries = self.dir_list()?;
        if entries.iter().any(|e| e.name == name) {
            return Err(Error::invalid_argument(format!(
                "directory entry {} exists",
                name
            )));
        }
        entries.push(DirEntry::new(name, etype, ino));
        self.dir_write(&entries)
    }

    /// Remove an entry from the root directory.
    pub fn dir_remove(&self, name: &str) -> Result<()> {
        let mut entries = self.dir_list()?;
        let before = entries.len();
        entries.retain(|e| e.name != name);
        if entries.len() == before {
            return Err(Error::invalid_argument(format!(
                "no directory entry {}",
                name
            )));
        }
        self.dir_write(&entries)
    }

    /// List the root directory.
    pub fn dir_list(&self) -> Result<Vec<DirEntry>> {
        if !self.inode_exists(ROOT_DIR_INODE)? {
            return Ok(Vec::new());
        }
        let size = self.inode_size(ROOT_DIR_INODE)?;
        let mut buf = vec![0u8; size as usize];
        let n = self.read_record(ROOT_DIR_INODE, 0, &mut buf)?;
        unpack_entries(&buf[..n])
    }

    fn dir_write(&self, entries: &[DirEntry]) -> Result<()> {
        if !self.inode_exists(ROOT_DIR_INODE)? {
            self.create_inode(ROOT_DIR_INODE, RecordType::Dir, 0o755)?;
        }
        let data = pack_entries(entries);
        {
            // Rewriting in place: reset the logical size so stale tail
            // entries are clipped.
            let mut st = self.state.lock();
            let cached = self.load_inode(&mut st, ROOT_DIR_INODE)?;
            cached.inode.size = 0;
            cached.dirty = true;
        }
        if data.is_empty() {
            return Ok(());
        }
        self.write_record(ROOT_DIR_INODE, 0, &data)
    }

    // ------------------------------------------------------------------
    // Commit
    // ------------------------------------------------------------------

    /// Commit every staged mutation as the next epoch.
    ///
    /// On failure the staged state is discarded and the in-memory state
    /// reloaded from the authoritative slot; the previous epoch stays
    /// visible and no allocator state leaks.
    pub fn commit(&self) -> Result<Epoch> {
        let mut st = self.state.lock();
        let st = &mut *st;
        st.attempted += 1;
        match self.commit_locked(st) {
            Ok(epoch) => {
                let mut g = self.committed.lock();
                *g = epoch;
                self.commit_cv.notify_all();
                info!(target: "ckpt::store", epoch, "commit complete");
                Ok(epoch)
            }
            Err(e) => {
                warn!(target: "ckpt::store", error = %e, "commit failed, rolling back");
                if let Err(reload) = self.reload(st) {
                    return Err(Error::corruption(format!(
                        "rollback after failed commit also failed: {} (original: {})",
                        reload, e
                    )));
                }
                Err(e)
            }
        }
    }

    fn commit_locked(&self, st: &mut StoreState) -> Result<Epoch> {
        let epoch: Epoch = if st.have_valid { st.sb.epoch + 1 } else { 1 };
        let mut fresh = FxHashSet::default();

        let StoreState {
            ref mut alloc,
            ref mut inodes,
            ref mut inode_tree,
            ref mut cksum_tree,
            ref mut removed,
            ref mut staged_cksums,
            ..
        } = *st;

        // Unlink removed inodes and return their space.
        for ino in removed.drain(..) {
            let mut ctx = TreeCtx {
                dev: &self.dev,
                alloc,
                epoch,
                fresh: &mut fresh,
            };
            if let Some(ptr) = inode_tree.remove(&mut ctx, ino)? {
                let mut buf = vec![0u8; self.block_size as usize];
                self.dev.read_block(ptr.offset, &mut buf)?;
                let inode = Inode::from_bytes(&buf)?;
                let tree: BTree<DiskPtr> = BTree::new(inode.extent_root, self.block_size);
                let bsize = self.block_size as u64;
                tree.free(&self.dev, ctx.alloc, &mut |a, _lblk, ext| {
                    a.free_blocks(ext.offset, ext.size.div_ceil(bsize));
                })?;
                ctx.alloc.free_blocks(ptr.offset, 1);
                debug!(target: "ckpt::store", ino, "inode removed");
            }
        }

        // COW the dirty extent trees and re-root their inodes.
        let mut dirty_inos: Vec<u64> = inodes
            .iter()
            .filter(|(_, c)| c.dirty)
            .map(|(&i, _)| i)
            .collect();
        dirty_inos.sort_unstable();
        for ino in dirty_inos {
            let cached = inodes.get_mut(&ino).unwrap();
            let mut ctx = TreeCtx {
                dev: &self.dev,
                alloc,
                epoch,
                fresh: &mut fresh,
            };
            for (lblk, mut ptr) in std::mem::take(&mut cached.pending) {
                ptr.epoch = epoch;
                cached.tree.insert(&mut ctx, lblk, ptr)?;
            }
            cached.inode.extent_root = cached.tree.root();
            cached.inode.mtime = Timespec::now();

            let blk = ctx.alloc.alloc_blocks(1)?;
            fresh.insert(blk);
            self.dev
                .write_block(blk, &cached.inode.to_bytes(self.block_size as usize))?;

            let mut ctx = TreeCtx {
                dev: &self.dev,
                alloc,
                epoch,
                fresh: &mut fresh,
            };
            inode_tree.insert(
                &mut ctx,
                ino,
                DiskPtr::new(blk, self.block_size as u64, epoch),
            )?;
            cached.dirty = false;
        }

        // Fold staged checksums into the checksum tree.
        {
            let mut ctx = TreeCtx {
                dev: &self.dev,
                alloc,
                epoch,
                fresh: &mut fresh,
            };
            let mut staged: Vec<(u64, u32)> = staged_cksums.drain().collect();
            staged.sort_unstable();
            for (blk, crc) in staged {
                cksum_tree.insert(&mut ctx, blk, crc as u64)?;
            }
        }

        // Persist the allocator last among the trees: its serialized form
        // must reflect every block the commit consumed.
        let (size_root, offset_root) = alloc.persist(&self.dev, self.block_size, epoch)?;

        // Everything below the superblock must be durable first.
        self.dev.sync()?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let slot = if st.have_valid {
            (st.last_slot + 1) % self.slots as u64
        } else {
            0
        };
        let mut sb = st.sb.clone();
        sb.inode_root = inode_tree.root();
        sb.cksum_root = cksum_tree.root();
        sb.alloc_size_root = size_root;
        sb.alloc_offset_root = offset_root;
        sb.time = now.as_secs();
        sb.time_nsec = now.subsec_nanos();
        sb.attempted_checkpoints = st.attempted;
        sb.meta_synced = fresh.len() as u64;
        sb.data_synced = st.data_blocks_staged;
        sb.epoch = epoch;
        sb.index = slot;
        self.dev
            .write_sector(slot, &sb.to_bytes(self.sector_size as usize))?;
        self.dev.sync()?;

        st.sb = sb;
        st.last_slot = slot;
        st.have_valid = true;
        st.data_blocks_staged = 0;
        Ok(epoch)
    }

    /// Discard staged state and reload from the authoritative slot.
    fn reload(&self, st: &mut StoreState) -> Result<()> {
        st.inodes.clear();
        st.removed.clear();
        st.staged_cksums.clear();
        st.data_blocks_staged = 0;
        if st.have_valid {
            st.alloc = Allocator::load(&self.dev, st.sb.alloc_offset_root, self.block_size)?;
            st.inode_tree = BTree::new(st.sb.inode_root, self.block_size);
            st.cksum_tree = BTree::new(st.sb.cksum_root, self.block_size);
        } else {
            let params = StoreParams {
                sector_size: self.sector_size,
                block_size: self.block_size,
                slots: self.slots,
                size: st.sb.size,
                name: st.sb.name.clone(),
            };
            st.alloc =
                Allocator::from_free_extent(params.first_data_block(), params.total_blocks());
            st.inode_tree = BTree::new(DiskPtr::null(), self.block_size);
            st.cksum_tree = BTree::new(DiskPtr::null(), self.block_size);
        }
        Ok(())
    }

    /// Decode every valid slot, for inspection and tests.
    pub fn scan_slots(&self) -> Result<Vec<Superblock>> {
        let mut out = Vec::new();
        for i in 0..self.slots as u64 {
            let mut buf = vec![0u8; self.sector_size as usize];
            self.dev.read_sector(i, &mut buf)?;
            if let Ok(sb) = Superblock::from_bytes(&buf[..SUPERBLOCK_SIZE]) {
                out.push(sb);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_store() -> (tempfile::TempDir, ObjectStore) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        ObjectStore::format(&path, &StoreParams::for_testing()).unwrap();
        let store = ObjectStore::open(&path).unwrap();
        (dir, store)
    }

    #[test]
    fn test_fresh_store_epoch_zero() {
        let (_dir, store) = make_store();
        assert_eq!(store.epoch(), 0);
        assert!(!store.epoch_done(1));
        assert!(store.epoch_done(0));
    }

    #[test]
    fn test_write_read_roundtrip() {
        let (_dir, store) = make_store();
        store.create_inode(7, RecordType::Data, 0o644).unwrap();
        let data = vec![0x5au8; 10_000];
        store.write_record(7, 0, &data).unwrap();
        store.commit().unwrap();

        let mut back = vec![0u8; 10_000];
        let n = store.read_record(7, 0, &mut back).unwrap();
        assert_eq!(n, 10_000);
        assert_eq!(back, data);
        assert_eq!(store.inode_size(7).unwrap(), 10_000);
    }

    #[test]
    fn test_read_clips_at_size() {
        let (_dir, store) = make_store();
        store.create_inode(7, RecordType::Data, 0).unwrap();
        store.write_record(7, 0, &[1, 2, 3]).unwrap();
        let mut buf = vec![0u8; 100];
        assert_eq!(store.read_record(7, 0, &mut buf).unwrap(), 3);
        assert_eq!(store.read_record(7, 4096, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_reopen_after_commit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        ObjectStore::format(&path, &StoreParams::for_testing()).unwrap();
        {
            let store = ObjectStore::open(&path).unwrap();
            store.create_inode(2, RecordType::Manifest, 0).unwrap();
            store.write_record(2, 0, b"descriptor bytes").unwrap();
            store.commit().unwrap();
        }
        let store = ObjectStore::open(&path).unwrap();
        assert_eq!(store.epoch(), 1);
        let mut buf = vec![0u8; 16];
        assert_eq!(store.read_record(2, 0, &mut buf).unwrap(), 16);
        assert_eq!(&buf, b"descriptor bytes");
    }

    #[test]
    fn test_epoch_advances_per_commit() {
        let (_dir, store) = make_store();
        store.create_inode(1, RecordType::Data, 0).unwrap();
        for i in 1..=5u64 {
            store.write_record(1, 0, &[i as u8; 100]).unwrap();
            assert_eq!(store.commit().unwrap(), i);
        }
        assert_eq!(store.epoch(), 5);
    }

    #[test]
    fn test_superblock_rotation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        // 4 slots, 5 commits: the ring wraps.
        ObjectStore::format(&path, &StoreParams::for_testing().with_slots(4)).unwrap();
        let store = ObjectStore::open(&path).unwrap();
        store.create_inode(1, RecordType::Data, 0).unwrap();
        for i in 0..5 {
            store.write_record(1, 0, &[i as u8; 64]).unwrap();
            store.commit().unwrap();
        }
        drop(store);

        let store = ObjectStore::open(&path).unwrap();
        assert_eq!(store.epoch(), 5);

        let slots = store.scan_slots().unwrap();
        let used: Vec<u64> = slots.iter().filter(|s| s.in_use()).map(|s| s.epoch).collect();
        // Epochs 2..=5 live in the ring; epoch 1's slot was recycled.
        assert_eq!(used.len(), 4);
        assert!(used.contains(&5));
        assert!(!used.contains(&1));
    }

    #[test]
    fn test_corrupt_newest_slot_falls_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        ObjectStore::format(&path, &StoreParams::for_testing().with_slots(4)).unwrap();
        let store = ObjectStore::open(&path).unwrap();
        store.create_inode(1, RecordType::Data, 0).unwrap();
        for i in 0..5 {
            store.write_record(1, 0, &[i as u8; 64]).unwrap();
            store.commit().unwrap();
        }
        // Epoch 5 lives in slot (5-1) % 4 == 0.
        let newest_slot = store.scan_slots().unwrap()
            .into_iter()
            .max_by_key(|s| if s.in_use() { s.epoch } else { 0 })
            .unwrap()
            .index;
        drop(store);

        // Zero the newest slot to simulate a torn write.
        use std::os::unix::fs::FileExt;
        let f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.write_all_at(&vec![0u8; 512], newest_slot * 512).unwrap();
        drop(f);

        let store = ObjectStore::open(&path).unwrap();
        assert_eq!(store.epoch(), 4);
    }

    #[test]
    fn test_old_epoch_still_readable() {
        let (_dir, store) = make_store();
        store.create_inode(3, RecordType::Data, 0).unwrap();
        store.write_record(3, 0, &[1u8; 4096]).unwrap();
        store.commit().unwrap();
        let old = store.scan_slots().unwrap()
            .into_iter()
            .find(|s| s.epoch == 1)
            .unwrap();

        store.write_record(3, 0, &[2u8; 4096]).unwrap();
        store.commit().unwrap();

        // The old inode tree still resolves the old content.
        let tree: BTree<DiskPtr> = BTree::new(old.inode_root, store.block_size());
        let ptr = tree.lookup(&store.dev, 3).unwrap().unwrap();
        let mut buf = vec![0u8; store.block_size() as usize];
        store.dev.read_block(ptr.offset, &mut buf).unwrap();
        let inode = Inode::from_bytes(&buf).unwrap();
        let ext: BTree<DiskPtr> = BTree::new(inode.extent_root, store.block_size());
        let page = ext.lookup(&store.dev, 0).unwrap().unwrap();
        let mut data = vec![0u8; 4096];
        store.dev.read_block(page.offset, &mut data).unwrap();
        assert_eq!(data, vec![1u8; 4096]);
    }

    #[test]
    fn test_checksum_detects_bit_rot() {
        let (_dir, store) = make_store();
        store.create_inode(9, RecordType::Data, 0).unwrap();
        store.write_record(9, 0, &[7u8; 4096]).unwrap();
        store.commit().unwrap();

        let (_, ptr) = store.extents(9).unwrap()[0];
        let mut buf = vec![0u8; 4096];
        store.dev.read_block(ptr.offset, &mut buf).unwrap();
        buf[100] ^= 0x01;
        store.dev.write_block(ptr.offset, &buf).unwrap();

        let mut out = vec![0u8; 4096];
        let err = store.read_record(9, 0, &mut out).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_remove_inode_frees_space() {
        let (_dir, store) = make_store();
        store.create_inode(5, RecordType::Data, 0).unwrap();
        store.write_record(5, 0, &vec![3u8; 64 * 1024]).unwrap();
        store.commit().unwrap();
        let free_before = store.state.lock().alloc.free_space();

        store.remove_inode(5).unwrap();
        store.commit().unwrap();
        let free_after = store.state.lock().alloc.free_space();
        assert!(free_after > free_before);
        assert!(!store.inode_exists(5).unwrap());
    }

    #[test]
    fn test_extent_epochs_tagged() {
        let (_dir, store) = make_store();
        store.create_inode(4, RecordType::Mem, 0).unwrap();
        store.write_record(4, 0x1000, &[1u8; 4096]).unwrap();
        store.commit().unwrap();
        store.write_record(4, 0x2000, &[2u8; 4096]).unwrap();
        store.commit().unwrap();

        let exts = store.extents(4).unwrap();
        assert_eq!(exts.len(), 2);
        let by_off: std::collections::HashMap<u64, u64> =
            exts.iter().map(|(o, p)| (*o, p.epoch)).collect();
        assert_eq!(by_off[&0x1000], 1);
        assert_eq!(by_off[&0x2000], 2);
    }

    #[test]
    fn test_directory() {
        let (_dir, store) = make_store();
        store.dir_add("p1", RecordType::Manifest, 2).unwrap();
        store.dir_add("p2", RecordType::Manifest, 4).unwrap();
        store.commit().unwrap();

        let names: Vec<String> = store.dir_list().unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["p1", "p2"]);

        store.dir_remove("p1").unwrap();
        store.commit().unwrap();
        let names: Vec<String> = store.dir_list().unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["p2"]);

        assert!(store.dir_add("p2", RecordType::Manifest, 9).is_err());
        assert!(store.dir_remove("p1").is_err());
    }

    #[test]
    fn test_same_epoch_overwrite_reclaims_staged_blocks() {
        let (_dir, store) = make_store();
        store.create_inode(6, RecordType::Data, 0).unwrap();
        store.write_record(6, 0, &[1u8; 8192]).unwrap();
        let free_between = store.state.lock().alloc.free_space();
        store.write_record(6, 0, &[2u8; 8192]).unwrap();
        // The superseded staged extent went straight back to free space.
        assert_eq!(store.state.lock().alloc.free_space(), free_between);

        store.commit().unwrap();
        let mut buf = vec![0u8; 8192];
        store.read_record(6, 0, &mut buf).unwrap();
        assert_eq!(buf, vec![2u8; 8192]);
    }

    #[test]
    fn test_unaligned_write_rejected() {
        let (_dir, store) = make_store();
        store.create_inode(1, RecordType::Data, 0).unwrap();
        assert!(matches!(
            store.write_record(1, 17, &[0u8; 10]),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_wait_until_unblocks() {
        use std::sync::Arc;
        let (_dir, store) = make_store();
        let store = Arc::new(store);
        store.create_inode(1, RecordType::Data, 0).unwrap();

        let waiter = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                store.wait_until(1);
                store.epoch()
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        store.write_record(1, 0, &[1u8; 16]).unwrap();
        store.commit().unwrap();
        assert_eq!(waiter.join().unwrap(), 1);
    }
}
