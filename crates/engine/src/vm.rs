//! VM object model: regions, backing objects, and shadow chains
//!
//! A process address space is a sorted list of regions, each backed by a
//! reference-counted [`VmObject`] holding resident pages by page index.
//! Objects form copy-on-write chains: a write resolves through the chain,
//! copying the page up into the top object first. Interposing a fresh
//! shadow on a region freezes the old object: it becomes the immutable
//! record of the pre-snapshot contents while the process keeps writing
//! into the shadow.

use cryo_core::{page_offset, Error, Result, PAGE_SHIFT, PAGE_SIZE};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Region/page protection bits.
pub mod prot {
    /// Readable.
    pub const READ: u32 = 0x1;
    /// Writable.
    pub const WRITE: u32 = 0x2;
    /// Executable.
    pub const EXEC: u32 = 0x4;
    /// Read/write, the common data protection.
    pub const RW: u32 = READ | WRITE;
}

/// Region entry flags.
pub mod eflag {
    /// The entry is a submap; its pages cannot be captured.
    pub const SUBMAP: u32 = 0x1;
    /// Restored entries are mapped copy-on-write.
    pub const COW: u32 = 0x2;
    /// Restored entries are prefaulted.
    pub const PREFAULT: u32 = 0x4;
}

/// A backing object: resident pages plus an optional shadow-chain parent.
pub struct VmObject {
    size: u64,
    pages: Mutex<FxHashMap<u64, Box<[u8]>>>,
    backing: Mutex<Option<Arc<VmObject>>>,
}

impl VmObject {
    /// A fresh object of `size` bytes with no resident pages.
    pub fn new(size: u64) -> Arc<Self> {
        Arc::new(VmObject {
            size,
            pages: Mutex::new(FxHashMap::default()),
            backing: Mutex::new(None),
        })
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Interpose a new empty shadow over `this`. The old object keeps
    /// recording the pre-shadow contents; writes land in the shadow.
    pub fn shadow(this: &Arc<VmObject>) -> Arc<VmObject> {
        Arc::new(VmObject {
            size: this.size,
            pages: Mutex::new(FxHashMap::default()),
            backing: Mutex::new(Some(Arc::clone(this))),
        })
    }

    /// Write into a page, resolving copy-on-write through the chain: if
    /// the page is not resident here, its current contents (from the
    /// chain, or zeroes) are copied up first.
    pub fn write_page(&self, pindex: u64, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= PAGE_SIZE);
        let mut pages = self.pages.lock();
        let page = pages.entry(pindex).or_insert_with(|| {
            let mut fresh = vec![0u8; PAGE_SIZE].into_boxed_slice();
            if let Some(backing) = &*self.backing.lock() {
                backing.read_page(pindex, &mut fresh);
            }
            fresh
        });
        page[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Read a page through the chain into `buf`. Returns false (and
    /// zero-fills) if no level holds the page.
    pub fn read_page(&self, pindex: u64, buf: &mut [u8]) -> bool {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        if let Some(page) = self.pages.lock().get(&pindex) {
            buf.copy_from_slice(page);
            return true;
        }
        if let Some(backing) = &*self.backing.lock() {
            return backing.read_page(pindex, buf);
        }
        buf.fill(0);
        false
    }

    /// Pages resident in *this* object only (not the chain): the delta
    /// since this object was interposed.
    pub fn resident_pages(&self) -> Vec<(u64, Box<[u8]>)> {
        let pages = self.pages.lock();
        let mut out: Vec<(u64, Box<[u8]>)> =
            pages.iter().map(|(&i, p)| (i, p.clone())).collect();
        out.sort_unstable_by_key(|(i, _)| *i);
        out
    }

    /// Number of pages resident in this object only.
    pub fn resident_count(&self) -> usize {
        self.pages.lock().len()
    }

    /// The collapsed view: newest page per index across the whole chain.
    pub fn all_pages(&self) -> Vec<(u64, Box<[u8]>)> {
        let mut merged: FxHashMap<u64, Box<[u8]>> = FxHashMap::default();
        self.collect_chain(&mut merged);
        let mut out: Vec<(u64, Box<[u8]>)> = merged.into_iter().collect();
        out.sort_unstable_by_key(|(i, _)| *i);
        out
    }

    fn collect_chain(&self, merged: &mut FxHashMap<u64, Box<[u8]>>) {
        for (&i, p) in self.pages.lock().iter() {
            merged.entry(i).or_insert_with(|| p.clone());
        }
        if let Some(backing) = &*self.backing.lock() {
            backing.collect_chain(merged);
        }
    }

    /// Fold every deeper level into this object and cut the chain here.
    ///
    /// Called on the immutable layer after its pages have been dumped, so
    /// chains stay short while the already-dumped pages remain readable
    /// and the top shadow keeps tracking only the new delta.
    pub fn flatten(&self) {
        loop {
            let below = self.backing.lock().clone();
            let Some(below) = below else { break };
            {
                let mut pages = self.pages.lock();
                for (&i, p) in below.pages.lock().iter() {
                    pages.entry(i).or_insert_with(|| p.clone());
                }
            }
            *self.backing.lock() = below.backing.lock().clone();
        }
    }

    /// Flatten everything below this object, leaving its own pages (the
    /// live delta) untouched.
    pub fn flatten_below(&self) {
        if let Some(below) = &*self.backing.lock() {
            below.flatten();
        }
    }

    /// Depth of the shadow chain including this object.
    pub fn chain_depth(&self) -> usize {
        1 + self
            .backing
            .lock()
            .as_ref()
            .map_or(0, |b| b.chain_depth())
    }
}

/// One address-space region.
#[derive(Clone)]
pub struct VmRegion {
    /// First address.
    pub start: u64,
    /// One past the last address.
    pub end: u64,
    /// Byte offset of `start` within the backing object.
    pub offset: u64,
    /// Current protection.
    pub protection: u32,
    /// Maximum protection.
    pub max_protection: u32,
    /// Entry flags.
    pub eflags: u32,
    /// Backing object; absent for reserved-only entries.
    pub object: Option<Arc<VmObject>>,
    /// Path of the backing file, if any.
    pub path: Option<String>,
}

impl VmRegion {
    /// Page index within the backing object for a virtual address.
    pub fn pindex(&self, vaddr: u64) -> u64 {
        debug_assert!(vaddr >= self.start && vaddr < self.end);
        (vaddr - self.start + self.offset) >> PAGE_SHIFT
    }

    /// Virtual address of a page index (inverse of [`VmRegion::pindex`]).
    pub fn vaddr_of(&self, pindex: u64) -> u64 {
        self.start + (pindex << PAGE_SHIFT) - self.offset
    }

    /// Whether the region contains `vaddr`.
    pub fn contains(&self, vaddr: u64) -> bool {
        vaddr >= self.start && vaddr < self.end
    }
}

/// A process address space.
#[derive(Default)]
pub struct VmSpace {
    /// Swap-resident size.
    pub swap_size: u64,
    /// Text segment size.
    pub text_size: u64,
    /// Data segment size.
    pub data_size: u64,
    /// Stack size.
    pub stack_size: u64,
    /// Text segment base.
    pub text_addr: u64,
    /// Data segment base.
    pub data_addr: u64,
    /// Stack ceiling.
    pub max_stack_addr: u64,
    /// Regions sorted by start address.
    pub regions: Vec<VmRegion>,
}

impl VmSpace {
    /// An empty address space.
    pub fn new() -> Self {
        VmSpace::default()
    }

    /// Map a fresh anonymous region of `size` bytes at `start`.
    pub fn map(&mut self, start: u64, size: u64, protection: u32) -> Result<()> {
        self.insert_region(VmRegion {
            start,
            end: start + size,
            offset: 0,
            protection,
            max_protection: prot::RW | prot::EXEC,
            eflags: 0,
            object: Some(VmObject::new(size)),
            path: None,
        })
    }

    /// Insert a fully formed region, keeping the list sorted and
    /// rejecting overlaps.
    pub fn insert_region(&mut self, region: VmRegion) -> Result<()> {
        if region.start >= region.end
            || page_offset(region.start) != 0
            || page_offset(region.end) != 0
        {
            return Err(Error::invalid_argument(format!(
                "bad region [{:#x}, {:#x})",
                region.start, region.end
            )));
        }
        if self
            .regions
            .iter()
            .any(|r| region.start < r.end && r.start < region.end)
        {
            return Err(Error::invalid_argument(format!(
                "region [{:#x}, {:#x}) overlaps an existing mapping",
                region.start, region.end
            )));
        }
        let at = self
            .regions
            .partition_point(|r| r.start < region.start);
        self.regions.insert(at, region);
        Ok(())
    }

    /// Find the region containing `vaddr`.
    pub fn find_region(&self, vaddr: u64) -> Option<&VmRegion> {
        self.regions.iter().find(|r| r.contains(vaddr))
    }

    /// Write bytes at a virtual address (may span pages, not regions).
    pub fn write(&self, vaddr: u64, bytes: &[u8]) -> Result<()> {
        let region = self
            .find_region(vaddr)
            .ok_or_else(|| Error::invalid_argument(format!("fault at {:#x}", vaddr)))?;
        if vaddr + bytes.len() as u64 > region.end {
            return Err(Error::invalid_argument(format!(
                "write at {:#x} crosses region end {:#x}",
                vaddr, region.end
            )));
        }
        let object = region
            .object
            .as_ref()
            .ok_or_else(|| Error::invalid_argument("write into unbacked region"))?;

        let mut done = 0usize;
        while done < bytes.len() {
            let cur = vaddr + done as u64;
            let within = page_offset(cur);
            let n = (bytes.len() - done).min(PAGE_SIZE - within);
            object.write_page(region.pindex(cur & !((PAGE_SIZE as u64) - 1)), within, &bytes[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Read bytes at a virtual address. Unbacked pages read as zeroes.
    pub fn read(&self, vaddr: u64, buf: &mut [u8]) -> Result<()> {
        let region = self
            .find_region(vaddr)
            .ok_or_else(|| Error::invalid_argument(format!("fault at {:#x}", vaddr)))?;
        if vaddr + buf.len() as u64 > region.end {
            return Err(Error::invalid_argument(format!(
                "read at {:#x} crosses region end {:#x}",
                vaddr, region.end
            )));
        }
        let object = region
            .object
            .as_ref()
            .ok_or_else(|| Error::invalid_argument("read from unbacked region"))?;

        let mut page = vec![0u8; PAGE_SIZE];
        let mut done = 0usize;
        while done < buf.len() {
            let cur = vaddr + done as u64;
            let within = page_offset(cur);
            let base = cur & !((PAGE_SIZE as u64) - 1);
            object.read_page(region.pindex(base), &mut page);
            let n = (buf.len() - done).min(PAGE_SIZE - within);
            buf[done..done + n].copy_from_slice(&page[within..within + n]);
            done += n;
        }
        Ok(())
    }

    /// Tear down the whole address space: every mapping, every page.
    ///
    /// Models the restore-side teardown: pmap removal, map-entry removal
    /// between min and max, SysV segment detach, and clearing of
    /// wire-future flags all collapse to dropping the region list here.
    pub fn teardown(&mut self) {
        self.regions.clear();
        self.swap_size = 0;
        self.text_size = 0;
        self.data_size = 0;
        self.stack_size = 0;
        self.text_addr = 0;
        self.data_addr = 0;
        self.max_stack_addr = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_write_read() {
        let mut vm = VmSpace::new();
        vm.map(0x10000, 4 * PAGE_SIZE as u64, prot::RW).unwrap();

        vm.write(0x10100, b"hello").unwrap();
        let mut buf = [0u8; 5];
        vm.read(0x10100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_cross_page_write() {
        let mut vm = VmSpace::new();
        vm.map(0x10000, 2 * PAGE_SIZE as u64, prot::RW).unwrap();
        let data = vec![0xabu8; PAGE_SIZE + 100];
        vm.write(0x10000 + 4000, &data).unwrap();
        let mut back = vec![0u8; data.len()];
        vm.read(0x10000 + 4000, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_overlap_rejected() {
        let mut vm = VmSpace::new();
        vm.map(0x10000, 0x4000, prot::RW).unwrap();
        assert!(vm.map(0x12000, 0x4000, prot::RW).is_err());
        assert!(vm.map(0x14000, 0x1000, prot::RW).is_ok());
    }

    #[test]
    fn test_shadow_freezes_old_object() {
        let mut vm = VmSpace::new();
        vm.map(0x10000, PAGE_SIZE as u64, prot::RW).unwrap();
        vm.write(0x10000, &[1u8; 8]).unwrap();

        let old = vm.regions[0].object.clone().unwrap();
        vm.regions[0].object = Some(VmObject::shadow(&old));

        // New writes land in the shadow; the old object is unchanged.
        vm.write(0x10000, &[2u8; 8]).unwrap();
        let mut page = vec![0u8; PAGE_SIZE];
        old.read_page(0, &mut page);
        assert_eq!(&page[..8], &[1u8; 8]);

        let mut buf = [0u8; 8];
        vm.read(0x10000, &mut buf).unwrap();
        assert_eq!(buf, [2u8; 8]);
    }

    #[test]
    fn test_shadow_copy_up_partial_write() {
        let mut vm = VmSpace::new();
        vm.map(0x10000, PAGE_SIZE as u64, prot::RW).unwrap();
        vm.write(0x10000, &[7u8; 16]).unwrap();

        let old = vm.regions[0].object.clone().unwrap();
        vm.regions[0].object = Some(VmObject::shadow(&old));

        // Writing 4 bytes must pull the rest of the page up first.
        vm.write(0x10004, &[9u8; 4]).unwrap();
        let mut buf = [0u8; 16];
        vm.read(0x10000, &mut buf).unwrap();
        assert_eq!(&buf[..4], &[7u8; 4]);
        assert_eq!(&buf[4..8], &[9u8; 4]);
        assert_eq!(&buf[8..], &[7u8; 8]);
    }

    #[test]
    fn test_delta_tracking() {
        let obj = VmObject::new(16 * PAGE_SIZE as u64);
        obj.write_page(0, 0, &[1]);
        obj.write_page(5, 0, &[1]);

        let shadow = VmObject::shadow(&obj);
        shadow.write_page(5, 0, &[2]);
        shadow.write_page(9, 0, &[2]);

        // The shadow's own residency is exactly the delta.
        let delta: Vec<u64> = shadow.resident_pages().iter().map(|(i, _)| *i).collect();
        assert_eq!(delta, vec![5, 9]);

        // The collapsed view merges newest-wins.
        let all = shadow.all_pages();
        let idx: Vec<u64> = all.iter().map(|(i, _)| *i).collect();
        assert_eq!(idx, vec![0, 5, 9]);
        let p5 = &all.iter().find(|(i, _)| *i == 5).unwrap().1;
        assert_eq!(p5[0], 2);
    }

    #[test]
    fn test_flatten_below() {
        let base = VmObject::new(8 * PAGE_SIZE as u64);
        base.write_page(0, 0, &[1]);
        let mid = VmObject::shadow(&base);
        mid.write_page(1, 0, &[2]);
        let top = VmObject::shadow(&mid);
        top.write_page(2, 0, &[3]);
        assert_eq!(top.chain_depth(), 3);

        top.flatten_below();
        assert_eq!(top.chain_depth(), 2);
        // Top's delta is untouched.
        assert_eq!(top.resident_count(), 1);
        // The flattened layer sees both older pages.
        let mut page = vec![0u8; PAGE_SIZE];
        assert!(mid.read_page(0, &mut page));
        assert_eq!(page[0], 1);
        assert!(mid.read_page(1, &mut page));
        assert_eq!(page[0], 2);
    }

    #[test]
    fn test_region_pindex_with_offset() {
        let region = VmRegion {
            start: 0x20000,
            end: 0x24000,
            offset: 0x2000,
            protection: prot::RW,
            max_protection: prot::RW,
            eflags: 0,
            object: None,
            path: None,
        };
        assert_eq!(region.pindex(0x20000), 2);
        assert_eq!(region.vaddr_of(2), 0x20000);
        assert_eq!(region.pindex(0x23000), 5);
        assert_eq!(region.vaddr_of(5), 0x23000);
    }

    #[test]
    fn test_teardown() {
        let mut vm = VmSpace::new();
        vm.map(0x10000, 0x4000, prot::RW).unwrap();
        vm.data_size = 123;
        vm.teardown();
        assert!(vm.regions.is_empty());
        assert_eq!(vm.data_size, 0);
    }
}
