//! Store format parameters
//!
//! Chosen at `format` time and persisted in every superblock slot; `open`
//! reads them back from the authoritative slot.

/// Geometry and identity of a store volume.
#[derive(Debug, Clone)]
pub struct StoreParams {
    /// Sector size in bytes; one superblock slot per sector. Must be at
    /// least [`crate::SUPERBLOCK_SIZE`].
    pub sector_size: u32,

    /// Block size in bytes; the allocation and B-tree node unit. Must be a
    /// power of two and a multiple of the sector size.
    pub block_size: u32,

    /// Number of superblock slots in the ring.
    pub slots: u32,

    /// Total volume size in bytes.
    pub size: u64,

    /// Human-readable volume name, truncated to 64 bytes on disk.
    pub name: String,
}

impl StoreParams {
    /// Default geometry: 512 B sectors, 4 KiB blocks, 100 slots.
    pub fn new(size: u64) -> Self {
        StoreParams {
            sector_size: 512,
            block_size: 4096,
            slots: 100,
            size,
            name: "cryo".to_string(),
        }
    }

    /// Small geometry for tests: a 4 MiB volume with 4 slots.
    pub fn for_testing() -> Self {
        StoreParams {
            sector_size: 512,
            block_size: 4096,
            slots: 4,
            size: 4 * 1024 * 1024,
            name: "cryo-test".to_string(),
        }
    }

    /// Override the slot count.
    pub fn with_slots(mut self, slots: u32) -> Self {
        self.slots = slots;
        self
    }

    /// Override the volume size.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Override the volume name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// First block number available to the allocator: the superblock ring
    /// rounded up to a block boundary.
    pub fn first_data_block(&self) -> u64 {
        let ring = self.slots as u64 * self.sector_size as u64;
        ring.div_ceil(self.block_size as u64)
    }

    /// Total number of blocks in the volume.
    pub fn total_blocks(&self) -> u64 {
        self.size / self.block_size as u64
    }
}
