//! Block device wrapper
//!
//! All store I/O goes through this handle. Offsets are positioned reads and
//! writes (`FileExt`), so writer-pool workers can hit the device
//! concurrently without a shared seek cursor.

use cryo_core::Result;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// An open store device: a regular file or a raw block device node.
#[derive(Debug)]
pub struct Device {
    file: File,
    path: PathBuf,
    sector_size: u32,
    block_size: u32,
}

impl Device {
    /// Create (or truncate) a file-backed device of `size` bytes.
    pub fn create(path: &Path, size: u64, sector_size: u32, block_size: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len(size)?;
        Ok(Device {
            file,
            path: path.to_path_buf(),
            sector_size,
            block_size,
        })
    }

    /// Open an existing device. Geometry is supplied by the caller after
    /// it has decoded the authoritative superblock.
    pub fn open(path: &Path, sector_size: u32, block_size: u32) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Device {
            file,
            path: path.to_path_buf(),
            sector_size,
            block_size,
        })
    }

    /// Path this device was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sector size in bytes.
    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Read one sector into `buf` (must be `sector_size` long).
    pub fn read_sector(&self, index: u64, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.sector_size as usize);
        self.file
            .read_exact_at(buf, index * self.sector_size as u64)?;
        Ok(())
    }

    /// Write one sector from `buf` (must be `sector_size` long).
    pub fn write_sector(&self, index: u64, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.sector_size as usize);
        self.file
            .write_all_at(buf, index * self.sector_size as u64)?;
        Ok(())
    }

    /// Read one block into `buf` (must be `block_size` long).
    pub fn read_block(&self, blkno: u64, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.block_size as usize);
        self.file.read_exact_at(buf, blkno * self.block_size as u64)?;
        Ok(())
    }

    /// Write one block from `buf` (must be `block_size` long).
    pub fn write_block(&self, blkno: u64, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.block_size as usize);
        self.file
            .write_all_at(buf, blkno * self.block_size as u64)?;
        Ok(())
    }

    /// Write raw bytes at a block-aligned byte offset. Used for data
    /// extents whose tail block is partial.
    pub fn write_at(&self, blkno: u64, data: &[u8]) -> Result<()> {
        self.file.write_all_at(data, blkno * self.block_size as u64)?;
        Ok(())
    }

    /// Read raw bytes at a byte offset within a block range.
    pub fn read_at(&self, blkno: u64, offset_in_extent: u64, buf: &mut [u8]) -> Result<()> {
        self.file
            .read_exact_at(buf, blkno * self.block_size as u64 + offset_in_extent)?;
        Ok(())
    }

    /// Durability barrier: flush data and metadata to the medium.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sector_and_block_io() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev");
        let dev = Device::create(&path, 1 << 20, 512, 4096).unwrap();

        let sector = vec![0xa5u8; 512];
        dev.write_sector(3, &sector).unwrap();
        let mut back = vec![0u8; 512];
        dev.read_sector(3, &mut back).unwrap();
        assert_eq!(back, sector);

        let block = vec![0x5au8; 4096];
        dev.write_block(7, &block).unwrap();
        let mut back = vec![0u8; 4096];
        dev.read_block(7, &mut back).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn test_partial_extent_io() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev");
        let dev = Device::create(&path, 1 << 20, 512, 4096).unwrap();

        dev.write_at(2, b"hello extents").unwrap();
        let mut buf = vec![0u8; 7];
        dev.read_at(2, 6, &mut buf).unwrap();
        assert_eq!(&buf, b"extents");
    }

    #[test]
    fn test_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev");
        {
            let dev = Device::create(&path, 1 << 20, 512, 4096).unwrap();
            dev.write_block(1, &vec![9u8; 4096]).unwrap();
            dev.sync().unwrap();
        }
        let dev = Device::open(&path, 512, 4096).unwrap();
        let mut buf = vec![0u8; 4096];
        dev.read_block(1, &mut buf).unwrap();
        assert_eq!(buf[0], 9);
    }
}
