//! Bounded persistent-memory region
//!
//! Models an NVDIMM-style byte-addressable region: a fixed capacity,
//! offset-addressed reads and writes, and a hard overflow error at the
//! limit. The region is shared between the checkpoint and restore sides of
//! a partition through an `Arc`.

use cryo_core::{Error, Result};
use parking_lot::Mutex;

/// A fixed-size byte-addressable region.
pub struct PmRegion {
    data: Mutex<Vec<u8>>,
    capacity: u64,
}

impl PmRegion {
    /// Allocate a region of `capacity` bytes, zero-filled.
    pub fn new(capacity: u64) -> Self {
        PmRegion {
            data: Mutex::new(vec![0u8; capacity as usize]),
            capacity,
        }
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    fn check(&self, offset: u64, len: usize) -> Result<()> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| Error::invalid_argument("pm range overflows"))?;
        if end > self.capacity {
            return Err(Error::BackendOverflow {
                used: offset,
                capacity: self.capacity,
                requested: len as u64,
            });
        }
        Ok(())
    }

    /// Write `bytes` at `offset`.
    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.check(offset, bytes.len())?;
        let mut data = self.data.lock();
        data[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Read into `buf` from `offset`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        let data = self.data.lock();
        buf.copy_from_slice(&data[offset as usize..offset as usize + buf.len()]);
        Ok(())
    }
}
