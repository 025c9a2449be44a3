//! The write-ahead log handle

use crate::format::{WalHeader, WalRecord, RECORD_HEADER_SIZE, WAL_HEADER_SIZE};
use cryo_core::{Error, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

struct WalInner {
    file: File,
    path: PathBuf,
    oid: u64,
    epoch: u64,
    size: u64,
    /// Append offset of the next record.
    cursor: u64,
    /// Offset just past the most recent savepoint marker.
    savepoint: u64,
    /// The transactional memory region, re-materialized on open.
    region: Vec<u8>,
}

/// A write-ahead log with its attached memory region.
///
/// All operations serialize on the WAL's single lock. WAL errors always
/// propagate: the caller's persistence depends on them.
pub struct Wal {
    inner: Mutex<WalInner>,
}

impl Wal {
    /// Open a log backed by `path` for partition `oid`.
    ///
    /// A fresh log is zero-filled and its header initialized. An existing
    /// log is validated, scanned, and replayed from its last savepoint so
    /// the memory region matches the persisted intent.
    pub fn open(path: &Path, oid: u64, size: u64) -> Result<Self> {
        if size < WAL_HEADER_SIZE + RECORD_HEADER_SIZE {
            return Err(Error::invalid_argument(format!(
                "wal size {} below minimum",
                size
            )));
        }

        let exists = path.exists() && std::fs::metadata(path)?.len() > 0;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;

        let mut inner = if exists {
            let mut hdr_buf = vec![0u8; WAL_HEADER_SIZE as usize];
            file.read_exact_at(&mut hdr_buf, 0)?;
            let header = WalHeader::from_bytes(&hdr_buf)?;
            if header.oid != oid {
                return Err(Error::invalid_argument(format!(
                    "wal belongs to partition {}, not {}",
                    header.oid, oid
                )));
            }
            if header.size != size {
                return Err(Error::invalid_argument(format!(
                    "wal size mismatch: {} on disk, {} requested",
                    header.size, size
                )));
            }
            if header.lock != 0 {
                warn!(target: "ckpt::wal", oid, "log was not closed cleanly");
            }

            let mut inner = WalInner {
                file,
                path: path.to_path_buf(),
                oid,
                epoch: header.epoch + 1,
                size,
                cursor: WAL_HEADER_SIZE,
                savepoint: WAL_HEADER_SIZE,
                region: vec![0u8; size as usize],
            };
            inner.scan_and_replay()?;
            inner
        } else {
            file.set_len(size)?;
            WalInner {
                file,
                path: path.to_path_buf(),
                oid,
                epoch: 1,
                size,
                cursor: WAL_HEADER_SIZE,
                savepoint: WAL_HEADER_SIZE,
                region: vec![0u8; size as usize],
            }
        };

        inner.write_header(1)?;
        inner.file.sync_all()?;
        info!(target: "ckpt::wal", oid, size, epoch = inner.epoch, "wal opened");
        Ok(Wal {
            inner: Mutex::new(inner),
        })
    }

    /// Transactional copy: append the record, then update memory.
    ///
    /// `dest` is an offset within the WAL's memory region.
    pub fn memcpy(&self, dest: u64, src: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let end = dest
            .checked_add(src.len() as u64)
            .ok_or_else(|| Error::invalid_argument("wal memcpy range overflows"))?;
        if end > inner.size {
            return Err(Error::invalid_argument(format!(
                "wal memcpy [{:#x}, {:#x}) outside region of {} bytes",
                dest, end, inner.size
            )));
        }

        let record = WalRecord::Copy {
            dest,
            payload: src.to_vec(),
        };
        inner.append(&record)?;

        let dest = dest as usize;
        inner.region[dest..dest + src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Read from the memory region.
    pub fn read(&self, dest: u64, buf: &mut [u8]) -> Result<()> {
        let inner = self.inner.lock();
        let end = dest
            .checked_add(buf.len() as u64)
            .ok_or_else(|| Error::invalid_argument("wal read range overflows"))?;
        if end > inner.size {
            return Err(Error::invalid_argument(format!(
                "wal read [{:#x}, {:#x}) outside region",
                dest, end
            )));
        }
        buf.copy_from_slice(&inner.region[dest as usize..end as usize]);
        Ok(())
    }

    /// Durability barrier: every earlier `memcpy` record reaches the
    /// medium before this returns.
    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.file.sync_data()?;
        Ok(())
    }

    /// Durability barrier plus a "resume here" marker. Subsequent replays
    /// ignore records before the marker.
    pub fn savepoint(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.sync_data()?;
        inner.append(&WalRecord::Savepoint)?;
        inner.savepoint = inner.cursor;
        inner.file.sync_data()?;
        debug!(target: "ckpt::wal", oid = inner.oid, at = inner.cursor, "savepoint");
        Ok(())
    }

    /// Re-apply every record after the last savepoint to the memory
    /// region.
    pub fn replay(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let (from, to) = (inner.savepoint, inner.cursor);
        inner.apply_range(from, to)
    }

    /// Final sync, then release the log. A trailing savepoint marker makes
    /// replay after a clean close a no-op.
    pub fn close(self) -> Result<()> {
        let mut inner = self.inner.into_inner();
        inner.file.sync_data()?;
        inner.append(&WalRecord::Savepoint)?;
        inner.write_header(0)?;
        inner.file.sync_all()?;
        info!(target: "ckpt::wal", oid = inner.oid, "wal closed");
        Ok(())
    }

    /// The log's current epoch (incremented on each open).
    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    /// Path of the backing file.
    pub fn path(&self) -> PathBuf {
        self.inner.lock().path.clone()
    }
}

impl WalInner {
    fn write_header(&mut self, lock: u32) -> Result<()> {
        let header = WalHeader {
            oid: self.oid,
            epoch: self.epoch,
            size: self.size,
            lock,
        };
        self.file.write_all_at(&header.to_bytes(), 0)?;
        Ok(())
    }

    fn append(&mut self, record: &WalRecord) -> Result<()> {
        let bytes = record.to_bytes();
        let end = self.cursor + bytes.len() as u64;
        // Leave room for the end-of-log zero header.
        if end + RECORD_HEADER_SIZE > self.size {
            return Err(Error::BackendOverflow {
                used: self.cursor,
                capacity: self.size,
                requested: bytes.len() as u64,
            });
        }
        self.file.write_all_at(&bytes, self.cursor)?;
        self.cursor = end;
        Ok(())
    }

    /// Scan the log, find the last savepoint and the end, and replay the
    /// tail into the region.
    fn scan_and_replay(&mut self) -> Result<()> {
        let mut buf = vec![0u8; (self.size - WAL_HEADER_SIZE) as usize];
        self.file.read_exact_at(&mut buf, WAL_HEADER_SIZE)?;

        let mut at = 0u64;
        let mut savepoint = 0u64;
        while let Some((record, consumed)) = WalRecord::from_bytes(&buf[at as usize..]) {
            at += consumed;
            if matches!(record, WalRecord::Savepoint) {
                savepoint = at;
            }
        }
        self.cursor = WAL_HEADER_SIZE + at;
        self.savepoint = WAL_HEADER_SIZE + savepoint;

        let (from, to) = (self.savepoint, self.cursor);
        self.apply_range(from, to)?;
        debug!(
            target: "ckpt::wal",
            oid = self.oid,
            cursor = self.cursor,
            savepoint = self.savepoint,
            "log scanned"
        );
        Ok(())
    }

    fn apply_range(&mut self, from: u64, to: u64) -> Result<()> {
        if to <= from {
            return Ok(());
        }
        let mut buf = vec![0u8; (to - from) as usize];
        self.file.read_exact_at(&mut buf, from)?;

        let mut at = 0usize;
        while let Some((record, consumed)) = WalRecord::from_bytes(&buf[at..]) {
            at += consumed as usize;
            if let WalRecord::Copy { dest, payload } = record {
                let dest = dest as usize;
                if dest + payload.len() > self.region.len() {
                    return Err(Error::corruption(format!(
                        "wal record targets [{:#x}, {:#x}) outside region",
                        dest,
                        dest + payload.len()
                    )));
                }
                self.region[dest..dest + payload.len()].copy_from_slice(&payload);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memcpy_and_read() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(&dir.path().join("wal"), 1, 4096).unwrap();
        wal.memcpy(0x100, &42u32.to_le_bytes()).unwrap();

        let mut buf = [0u8; 4];
        wal.read(0x100, &mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf), 42);
    }

    #[test]
    fn test_replay_after_crash() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal");
        {
            let wal = Wal::open(&path, 1, 4096).unwrap();
            wal.memcpy(0, &24u32.to_le_bytes()).unwrap();
            wal.savepoint().unwrap();
            wal.memcpy(0, &42u32.to_le_bytes()).unwrap();
            // Dropped without close: a crash.
        }
        let wal = Wal::open(&path, 1, 4096).unwrap();
        let mut buf = [0u8; 4];
        wal.read(0, &mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf), 42);
    }

    #[test]
    fn test_replay_after_clean_close_is_noop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal");
        {
            let wal = Wal::open(&path, 1, 4096).unwrap();
            wal.memcpy(8, &[1, 2, 3, 4]).unwrap();
            wal.close().unwrap();
        }
        let wal = Wal::open(&path, 1, 4096).unwrap();
        // The close's trailing savepoint hides the record from replay.
        let mut buf = [0u8; 4];
        wal.read(8, &mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0, 0]);
        wal.replay().unwrap();
        wal.read(8, &mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0, 0]);
    }

    #[test]
    fn test_replay_without_savepoint_applies_all() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal");
        {
            let wal = Wal::open(&path, 1, 4096).unwrap();
            wal.memcpy(0, &[0xaa; 8]).unwrap();
            wal.memcpy(8, &[0xbb; 8]).unwrap();
        }
        let wal = Wal::open(&path, 1, 4096).unwrap();
        let mut buf = [0u8; 16];
        wal.read(0, &mut buf).unwrap();
        assert_eq!(&buf[..8], &[0xaa; 8]);
        assert_eq!(&buf[8..], &[0xbb; 8]);
    }

    #[test]
    fn test_epoch_increments_per_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal");
        let e1 = {
            let wal = Wal::open(&path, 1, 4096).unwrap();
            let e = wal.epoch();
            wal.close().unwrap();
            e
        };
        let wal = Wal::open(&path, 1, 4096).unwrap();
        assert_eq!(wal.epoch(), e1 + 1);
    }

    #[test]
    fn test_wrong_oid_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal");
        {
            let wal = Wal::open(&path, 1, 4096).unwrap();
            wal.close().unwrap();
        }
        assert!(matches!(
            Wal::open(&path, 2, 4096),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_out_of_range_rejected() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(&dir.path().join("wal"), 1, 4096).unwrap();
        assert!(wal.memcpy(4090, &[0u8; 16]).is_err());
        let mut buf = [0u8; 16];
        assert!(wal.read(4090, &mut buf).is_err());
    }

    #[test]
    fn test_log_overflow_surfaced() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(&dir.path().join("wal"), 1, 256).unwrap();
        let payload = [0u8; 64];
        let mut filled = false;
        for _ in 0..10 {
            if let Err(e) = wal.memcpy(0, &payload) {
                assert!(matches!(e, Error::BackendOverflow { .. }));
                filled = true;
                break;
            }
        }
        assert!(filled);
    }

    #[test]
    fn test_latest_write_wins_on_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal");
        {
            let wal = Wal::open(&path, 1, 4096).unwrap();
            for v in 0..10u64 {
                wal.memcpy(16, &v.to_le_bytes()).unwrap();
            }
        }
        let wal = Wal::open(&path, 1, 4096).unwrap();
        let mut buf = [0u8; 8];
        wal.read(16, &mut buf).unwrap();
        assert_eq!(u64::from_le_bytes(buf), 9);
    }
}
