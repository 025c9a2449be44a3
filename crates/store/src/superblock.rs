//! Superblock ring and disk pointers
//!
//! The device head holds a ring of fixed-size superblock slots, one per
//! sector. A commit never overwrites the authoritative slot: it writes the
//! next slot in the ring with an incremented epoch, so every previous epoch
//! remains mountable until its slot is recycled.
//!
//! # Slot Layout (280 bytes used, sector-padded)
//!
//! ```text
//! ┌──────────┬─────────┬──────┬──────┬─────────────────────────────┐
//! │ magic(4) │ ver(4)  │ uuid │ name │ ssize bsize asize slots (4) │
//! │          │ maj/min │ (16) │ (64) │ size(8)                     │
//! ├──────────┴─────────┴──────┴──────┴─────────────────────────────┤
//! │ inode root(24) cksum root(24) alloc-size root(24)              │
//! │ alloc-offset root(24)                                          │
//! ├────────────────────────────────────────────────────────────────┤
//! │ time(12) mtime(8) attempted(8) meta_synced(8) data_synced(8)   │
//! │ sas_base(8) epoch(8) index(8)                                  │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `epoch == EPOCH_INVAL` marks an unused slot. A torn or corrupt slot
//! fails its magic check and is ignored at mount.

use crate::params::StoreParams;
use cryo_core::{ByteReader, ByteWriter, Error, Result, EPOCH_INVAL};

/// Magic tag of a superblock slot.
pub const SUPERBLOCK_MAGIC: u32 = 0x4352_594f;

/// Size of the encoded superblock; must fit in one sector.
pub const SUPERBLOCK_SIZE: usize = 512;

/// Size of an encoded [`DiskPtr`].
pub const DISK_PTR_SIZE: usize = 24;

/// Format version written by this implementation.
pub const FORMAT_MAJOR: u16 = 1;
/// Minor format version.
pub const FORMAT_MINOR: u16 = 0;

/// Length of the volume-name field.
const NAME_LEN: usize = 64;

/// A pointer to a contiguous byte range on the device.
///
/// `offset` is a block number, `size` is in bytes, and `epoch` records the
/// checkpoint at which the extent was written. The null pointer
/// (`size == 0`) denotes an empty tree or absent extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskPtr {
    /// Block number of the first block.
    pub offset: u64,
    /// Length in bytes.
    pub size: u64,
    /// Epoch at which this extent was written.
    pub epoch: u64,
}

impl DiskPtr {
    /// The null pointer: an absent extent or empty tree.
    pub fn null() -> Self {
        DiskPtr {
            offset: 0,
            size: 0,
            epoch: EPOCH_INVAL,
        }
    }

    /// Whether this pointer refers to nothing.
    pub fn is_null(&self) -> bool {
        self.size == 0
    }

    /// Construct a pointer.
    pub fn new(offset: u64, size: u64, epoch: u64) -> Self {
        DiskPtr {
            offset,
            size,
            epoch,
        }
    }

    /// Append the 24-byte encoding.
    pub fn encode(&self, w: &mut ByteWriter) {
        w.put_u64(self.offset);
        w.put_u64(self.size);
        w.put_u64(self.epoch);
    }

    /// Decode from a reader.
    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(DiskPtr {
            offset: r.get_u64().map_err(|e| Error::corruption(e.to_string()))?,
            size: r.get_u64().map_err(|e| Error::corruption(e.to_string()))?,
            epoch: r.get_u64().map_err(|e| Error::corruption(e.to_string()))?,
        })
    }
}

/// One decoded superblock slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    /// Format version, major.
    pub major: u16,
    /// Format version, minor.
    pub minor: u16,
    /// Volume UUID, assigned at format time.
    pub uuid: [u8; 16],
    /// Volume name (may be truncated).
    pub name: String,
    /// Sector size in bytes.
    pub sector_size: u32,
    /// Block size in bytes.
    pub block_size: u32,
    /// Allocation unit in bytes (equals the block size).
    pub alloc_size: u32,
    /// Number of slots in the superblock ring.
    pub slots: u32,
    /// Total volume size in bytes.
    pub size: u64,
    /// Root of the inode tree.
    pub inode_root: DiskPtr,
    /// Root of the checksum tree.
    pub cksum_root: DiskPtr,
    /// Root of the allocator's size-indexed tree.
    pub alloc_size_root: DiskPtr,
    /// Root of the allocator's offset-indexed tree.
    pub alloc_offset_root: DiskPtr,
    /// Commit time, seconds since the Unix epoch.
    pub time: u64,
    /// Commit time, nanoseconds part.
    pub time_nsec: u32,
    /// Last mount time, seconds.
    pub mtime: u64,
    /// Checkpoints attempted on this volume (including failed ones).
    pub attempted_checkpoints: u64,
    /// Metadata blocks written by the committing checkpoint.
    pub meta_synced: u64,
    /// Data blocks written by the committing checkpoint.
    pub data_synced: u64,
    /// Base address of the single-address-space region, if any.
    pub sas_base: u64,
    /// Epoch of this slot; `EPOCH_INVAL` marks an unused slot.
    pub epoch: u64,
    /// Index of this slot within the ring.
    pub index: u64,
}

impl Superblock {
    /// Compose the initial (unused) slot written at format time.
    pub fn formatted(params: &StoreParams, uuid: [u8; 16], index: u64) -> Self {
        Superblock {
            major: FORMAT_MAJOR,
            minor: FORMAT_MINOR,
            uuid,
            name: params.name.clone(),
            sector_size: params.sector_size,
            block_size: params.block_size,
            alloc_size: params.block_size,
            slots: params.slots,
            size: params.size,
            inode_root: DiskPtr::null(),
            cksum_root: DiskPtr::null(),
            alloc_size_root: DiskPtr::null(),
            alloc_offset_root: DiskPtr::null(),
            time: 0,
            time_nsec: 0,
            mtime: 0,
            attempted_checkpoints: 0,
            meta_synced: 0,
            data_synced: 0,
            sas_base: 0,
            epoch: EPOCH_INVAL,
            index,
        }
    }

    /// Whether this slot holds a committed epoch.
    pub fn in_use(&self) -> bool {
        self.epoch != EPOCH_INVAL
    }

    /// Encode into a sector-sized buffer.
    pub fn to_bytes(&self, sector_size: usize) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(sector_size);
        w.put_u32(SUPERBLOCK_MAGIC);
        w.put_u16(self.major);
        w.put_u16(self.minor);
        w.put_bytes(&self.uuid);

        let mut name = [0u8; NAME_LEN];
        let n = self.name.len().min(NAME_LEN);
        name[..n].copy_from_slice(&self.name.as_bytes()[..n]);
        w.put_bytes(&name);

        w.put_u32(self.sector_size);
        w.put_u32(self.block_size);
        w.put_u32(self.alloc_size);
        w.put_u32(self.slots);
        w.put_u64(self.size);

        self.inode_root.encode(&mut w);
        self.cksum_root.encode(&mut w);
        self.alloc_size_root.encode(&mut w);
        self.alloc_offset_root.encode(&mut w);

        w.put_u64(self.time);
        w.put_u32(self.time_nsec);
        w.put_u32(0); // reserved
        w.put_u64(self.mtime);
        w.put_u64(self.attempted_checkpoints);
        w.put_u64(self.meta_synced);
        w.put_u64(self.data_synced);
        w.put_u64(self.sas_base);
        w.put_u64(self.epoch);
        w.put_u64(self.index);

        w.pad_to(sector_size);
        w.into_vec()
    }

    /// Decode a slot, validating its magic.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(buf);
        let magic = r.get_u32().map_err(|e| Error::corruption(e.to_string()))?;
        if magic != SUPERBLOCK_MAGIC {
            return Err(Error::BadMagic {
                what: "superblock",
                expected: SUPERBLOCK_MAGIC,
                found: magic,
            });
        }

        let major = r.get_u16().map_err(|e| Error::corruption(e.to_string()))?;
        let minor = r.get_u16().map_err(|e| Error::corruption(e.to_string()))?;
        let uuid: [u8; 16] = r
            .get_bytes(16)
            .map_err(|e| Error::corruption(e.to_string()))?
            .try_into()
            .unwrap();
        let name_raw = r
            .get_bytes(NAME_LEN)
            .map_err(|e| Error::corruption(e.to_string()))?;
        let name_end = name_raw.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        let name = String::from_utf8_lossy(&name_raw[..name_end]).into_owned();

        let mut get_u32 = |r: &mut ByteReader<'_>| -> Result<u32> {
            r.get_u32().map_err(|e| Error::corruption(e.to_string()))
        };
        let sector_size = get_u32(&mut r)?;
        let block_size = get_u32(&mut r)?;
        let alloc_size = get_u32(&mut r)?;
        let slots = get_u32(&mut r)?;
        let size = r.get_u64().map_err(|e| Error::corruption(e.to_string()))?;

        let inode_root = DiskPtr::decode(&mut r)?;
        let cksum_root = DiskPtr::decode(&mut r)?;
        let alloc_size_root = DiskPtr::decode(&mut r)?;
        let alloc_offset_root = DiskPtr::decode(&mut r)?;

        let time = r.get_u64().map_err(|e| Error::corruption(e.to_string()))?;
        let time_nsec = get_u32(&mut r)?;
        let _reserved = get_u32(&mut r)?;
        let mtime = r.get_u64().map_err(|e| Error::corruption(e.to_string()))?;
        let attempted_checkpoints = r.get_u64().map_err(|e| Error::corruption(e.to_string()))?;
        let meta_synced = r.get_u64().map_err(|e| Error::corruption(e.to_string()))?;
        let data_synced = r.get_u64().map_err(|e| Error::corruption(e.to_string()))?;
        let sas_base = r.get_u64().map_err(|e| Error::corruption(e.to_string()))?;
        let epoch = r.get_u64().map_err(|e| Error::corruption(e.to_string()))?;
        let index = r.get_u64().map_err(|e| Error::corruption(e.to_string()))?;

        if block_size == 0 || sector_size == 0 || slots == 0 || !block_size.is_power_of_two() {
            return Err(Error::corruption(format!(
                "superblock geometry invalid: ssize={} bsize={} slots={}",
                sector_size, block_size, slots
            )));
        }

        Ok(Superblock {
            major,
            minor,
            uuid,
            name,
            sector_size,
            block_size,
            alloc_size,
            slots,
            size,
            inode_root,
            cksum_root,
            alloc_size_root,
            alloc_offset_root,
            time,
            time_nsec,
            mtime,
            attempted_checkpoints,
            meta_synced,
            data_synced,
            sas_base,
            epoch,
            index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Superblock {
        let params = StoreParams::for_testing();
        let mut sb = Superblock::formatted(&params, [7u8; 16], 2);
        sb.epoch = 12;
        sb.inode_root = DiskPtr::new(40, 4096, 12);
        sb.alloc_offset_root = DiskPtr::new(41, 4096, 12);
        sb.attempted_checkpoints = 13;
        sb.time = 1_700_000_000;
        sb
    }

    #[test]
    fn test_roundtrip() {
        let sb = sample();
        let bytes = sb.to_bytes(512);
        assert_eq!(bytes.len(), 512);
        let back = Superblock::from_bytes(&bytes).unwrap();
        assert_eq!(back, sb);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let sb = sample();
        let mut bytes = sb.to_bytes(512);
        bytes[0] ^= 0xff;
        let err = Superblock::from_bytes(&bytes).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_zeroed_slot_rejected() {
        let bytes = vec![0u8; 512];
        assert!(Superblock::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_formatted_slot_unused() {
        let params = StoreParams::for_testing();
        let sb = Superblock::formatted(&params, [0u8; 16], 0);
        assert!(!sb.in_use());
        let back = Superblock::from_bytes(&sb.to_bytes(512)).unwrap();
        assert!(!back.in_use());
    }

    #[test]
    fn test_long_name_truncated() {
        let params = StoreParams::for_testing().with_name("x".repeat(100));
        let sb = Superblock::formatted(&params, [0u8; 16], 0);
        let back = Superblock::from_bytes(&sb.to_bytes(512)).unwrap();
        assert_eq!(back.name.len(), 64);
    }

    #[test]
    fn test_disk_ptr_null() {
        assert!(DiskPtr::null().is_null());
        assert!(!DiskPtr::new(1, 4096, 0).is_null());
    }

    #[test]
    fn test_encoded_size_fits_sector() {
        let sb = sample();
        // Encoding must not overflow the smallest supported sector.
        let bytes = sb.to_bytes(SUPERBLOCK_SIZE);
        assert_eq!(bytes.len(), SUPERBLOCK_SIZE);
    }
}
