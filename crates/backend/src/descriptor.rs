//! Backend descriptor
//!
//! A tagged handle over the three backing media a snapshot can stream to:
//! a plain file, a persistent-memory region, or an inode of the object
//! store. Sequential `write`/`read_exact` advance a tracked cursor.
//!
//! The variants differ in how bytes become durable:
//! - file: positioned writes, `flush` syncs;
//! - PM: offset writes into the shared region, bounded by its capacity;
//! - store: writes accumulate in a buffer and `flush` lands them as one
//!   record at offset 0 of the target inode (store offsets must be
//!   block-aligned, which a byte stream is not).

use crate::pm::PmRegion;
use cryo_core::{Error, Result};
use cryo_store::ObjectStore;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// The uniform backend handle.
pub enum Backend {
    /// A plain file with a byte cursor.
    File {
        /// Backing file.
        file: File,
        /// Read/write cursor.
        cursor: u64,
    },
    /// A shared persistent-memory region.
    Pm {
        /// Backing region.
        region: Arc<PmRegion>,
        /// Read/write cursor.
        cursor: u64,
    },
    /// An inode of an object store.
    Store {
        /// Backing store.
        store: Arc<ObjectStore>,
        /// Target inode.
        ino: u64,
        /// Read cursor (writes buffer until flush).
        cursor: u64,
        /// Pending write buffer.
        wbuf: Vec<u8>,
    },
}

impl Backend {
    /// Create (truncate) a file backend for writing.
    pub fn file_create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        Ok(Backend::File { file, cursor: 0 })
    }

    /// Open an existing file backend for reading.
    pub fn file_open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Backend::File { file, cursor: 0 })
    }

    /// A PM backend starting at `base`.
    pub fn pm(region: Arc<PmRegion>, base: u64) -> Self {
        Backend::Pm {
            region,
            cursor: base,
        }
    }

    /// A store backend over `ino`.
    pub fn store(store: Arc<ObjectStore>, ino: u64) -> Self {
        Backend::Store {
            store,
            ino,
            cursor: 0,
            wbuf: Vec::new(),
        }
    }

    /// Sequential write at the cursor.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Backend::File { file, cursor } => {
                file.write_all_at(data, *cursor)?;
                *cursor += data.len() as u64;
                Ok(())
            }
            Backend::Pm { region, cursor } => {
                region.write_at(*cursor, data)?;
                *cursor += data.len() as u64;
                Ok(())
            }
            Backend::Store { wbuf, .. } => {
                wbuf.extend_from_slice(data);
                Ok(())
            }
        }
    }

    /// Sequential exact read at the cursor.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self {
            Backend::File { file, cursor } => {
                file.read_exact_at(buf, *cursor)?;
                *cursor += buf.len() as u64;
                Ok(())
            }
            Backend::Pm { region, cursor } => {
                region.read_at(*cursor, buf)?;
                *cursor += buf.len() as u64;
                Ok(())
            }
            Backend::Store {
                store,
                ino,
                cursor,
                ..
            } => {
                let n = store.read_record(*ino, *cursor, buf)?;
                if n != buf.len() {
                    return Err(Error::corruption(format!(
                        "short read from store inode {}: wanted {}, got {}",
                        ino,
                        buf.len(),
                        n
                    )));
                }
                *cursor += buf.len() as u64;
                Ok(())
            }
        }
    }

    /// Current cursor position.
    pub fn position(&self) -> u64 {
        match self {
            Backend::File { cursor, .. } => *cursor,
            Backend::Pm { cursor, .. } => *cursor,
            Backend::Store { cursor, wbuf, .. } => {
                if wbuf.is_empty() {
                    *cursor
                } else {
                    wbuf.len() as u64
                }
            }
        }
    }

    /// Reposition the cursor (reads only).
    pub fn seek(&mut self, pos: u64) {
        match self {
            Backend::File { cursor, .. } => *cursor = pos,
            Backend::Pm { cursor, .. } => *cursor = pos,
            Backend::Store { cursor, .. } => *cursor = pos,
        }
    }

    /// Make buffered writes visible/durable.
    pub fn flush(&mut self) -> Result<()> {
        match self {
            Backend::File { file, .. } => {
                file.sync_data()?;
                Ok(())
            }
            Backend::Pm { .. } => Ok(()),
            Backend::Store {
                store, ino, wbuf, ..
            } => {
                if !wbuf.is_empty() {
                    store.write_record(*ino, 0, wbuf)?;
                    wbuf.clear();
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryo_store::{RecordType, StoreParams};
    use tempfile::tempdir;

    #[test]
    fn test_file_backend_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dump");
        let mut b = Backend::file_create(&path).unwrap();
        b.write(b"hello ").unwrap();
        b.write(b"world").unwrap();
        b.flush().unwrap();
        assert_eq!(b.position(), 11);

        let mut r = Backend::file_open(&path).unwrap();
        let mut buf = [0u8; 11];
        r.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn test_pm_backend_roundtrip() {
        let region = Arc::new(PmRegion::new(1024));
        let mut b = Backend::pm(Arc::clone(&region), 64);
        b.write(&[7u8; 32]).unwrap();
        assert_eq!(b.position(), 96);

        let mut r = Backend::pm(region, 64);
        let mut buf = [0u8; 32];
        r.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [7u8; 32]);
    }

    #[test]
    fn test_pm_backend_overflow() {
        let region = Arc::new(PmRegion::new(16));
        let mut b = Backend::pm(region, 0);
        assert!(matches!(
            b.write(&[0u8; 32]),
            Err(Error::BackendOverflow { .. })
        ));
    }

    #[test]
    fn test_store_backend_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        ObjectStore::format(&path, &StoreParams::for_testing()).unwrap();
        let store = Arc::new(ObjectStore::open(&path).unwrap());
        store.create_inode(2, RecordType::Manifest, 0).unwrap();

        let mut b = Backend::store(Arc::clone(&store), 2);
        b.write(b"descriptor ").unwrap();
        b.write(b"stream").unwrap();
        b.flush().unwrap();
        store.commit().unwrap();

        let mut r = Backend::store(store, 2);
        let mut buf = [0u8; 17];
        r.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"descriptor stream");
        // Reading past the end is a short read.
        let mut more = [0u8; 4];
        assert!(r.read_exact(&mut more).is_err());
    }
}
