//! WAL on-disk format
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ Header (64 B): magic, oid, epoch, size, lock                  │
//! ├───────────────────────────────────────────────────────────────┤
//! │ Record: dest(8) len(8) payload(len)                           │
//! ├───────────────────────────────────────────────────────────────┤
//! │ ... packed until a zero header (end) or the region limit      │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! A savepoint marker is a record with `dest == u64::MAX, len == 0`. The
//! file is zero-filled at creation, so the first `(0, 0)` header past the
//! last write marks the end of the log.

use cryo_core::{ByteReader, ByteWriter, Error, Result};

/// Magic tag of a WAL header.
pub const WAL_MAGIC: u32 = 0x57414c48;

/// Encoded header size; records start at this offset.
pub const WAL_HEADER_SIZE: u64 = 64;

/// `dest` value marking a savepoint record.
pub const SAVEPOINT_DEST: u64 = u64::MAX;

/// Size of a record header (`dest` + `len`).
pub const RECORD_HEADER_SIZE: u64 = 16;

/// The WAL file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalHeader {
    /// Owning partition.
    pub oid: u64,
    /// Incremented on every open.
    pub epoch: u64,
    /// Size of the mapping (log file and memory region).
    pub size: u64,
    /// 1 while the log is open, 0 after a clean close.
    pub lock: u32,
}

impl WalHeader {
    /// Encode into the fixed header area.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(WAL_HEADER_SIZE as usize);
        w.put_u32(WAL_MAGIC);
        w.put_u32(0); // reserved
        w.put_u64(self.oid);
        w.put_u64(self.epoch);
        w.put_u64(self.size);
        w.put_u32(self.lock);
        w.pad_to(WAL_HEADER_SIZE as usize);
        w.into_vec()
    }

    /// Decode and validate the header.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(buf);
        let magic = r.get_u32().map_err(|e| Error::corruption(e.to_string()))?;
        if magic != WAL_MAGIC {
            return Err(Error::BadMagic {
                what: "wal header",
                expected: WAL_MAGIC,
                found: magic,
            });
        }
        r.skip(4).map_err(|e| Error::corruption(e.to_string()))?;
        Ok(WalHeader {
            oid: r.get_u64().map_err(|e| Error::corruption(e.to_string()))?,
            epoch: r.get_u64().map_err(|e| Error::corruption(e.to_string()))?,
            size: r.get_u64().map_err(|e| Error::corruption(e.to_string()))?,
            lock: r.get_u32().map_err(|e| Error::corruption(e.to_string()))?,
        })
    }
}

/// One decoded log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// A logged memory copy.
    Copy {
        /// Destination offset within the memory region.
        dest: u64,
        /// The copied bytes.
        payload: Vec<u8>,
    },
    /// A savepoint marker.
    Savepoint,
}

impl WalRecord {
    /// Encoded size on disk.
    pub fn encoded_len(&self) -> u64 {
        match self {
            WalRecord::Copy { payload, .. } => RECORD_HEADER_SIZE + payload.len() as u64,
            WalRecord::Savepoint => RECORD_HEADER_SIZE,
        }
    }

    /// Encode the record.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        match self {
            WalRecord::Copy { dest, payload } => {
                w.put_u64(*dest);
                w.put_u64(payload.len() as u64);
                w.put_bytes(payload);
            }
            WalRecord::Savepoint => {
                w.put_u64(SAVEPOINT_DEST);
                w.put_u64(0);
            }
        }
        w.into_vec()
    }

    /// Decode the record at the start of `buf`.
    ///
    /// Returns `None` at the end of the log (a zero header or a record
    /// running past the buffer, i.e. a torn tail).
    pub fn from_bytes(buf: &[u8]) -> Option<(Self, u64)> {
        if (buf.len() as u64) < RECORD_HEADER_SIZE {
            return None;
        }
        let dest = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let len = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        if dest == 0 && len == 0 {
            return None;
        }
        if dest == SAVEPOINT_DEST && len == 0 {
            return Some((WalRecord::Savepoint, RECORD_HEADER_SIZE));
        }
        let end = RECORD_HEADER_SIZE.checked_add(len)?;
        if end > buf.len() as u64 {
            return None;
        }
        let payload = buf[RECORD_HEADER_SIZE as usize..end as usize].to_vec();
        Some((WalRecord::Copy { dest, payload }, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let h = WalHeader {
            oid: 42,
            epoch: 3,
            size: 4096,
            lock: 1,
        };
        let bytes = h.to_bytes();
        assert_eq!(bytes.len() as u64, WAL_HEADER_SIZE);
        assert_eq!(WalHeader::from_bytes(&bytes).unwrap(), h);
    }

    #[test]
    fn test_header_bad_magic() {
        let h = WalHeader {
            oid: 1,
            epoch: 1,
            size: 64,
            lock: 0,
        };
        let mut bytes = h.to_bytes();
        bytes[2] = 0;
        assert!(WalHeader::from_bytes(&bytes).unwrap_err().is_corruption());
    }

    #[test]
    fn test_record_roundtrip() {
        let rec = WalRecord::Copy {
            dest: 0x100,
            payload: vec![1, 2, 3, 4],
        };
        let bytes = rec.to_bytes();
        let (back, consumed) = WalRecord::from_bytes(&bytes).unwrap();
        assert_eq!(back, rec);
        assert_eq!(consumed, rec.encoded_len());
    }

    #[test]
    fn test_savepoint_marker() {
        let bytes = WalRecord::Savepoint.to_bytes();
        let (back, consumed) = WalRecord::from_bytes(&bytes).unwrap();
        assert_eq!(back, WalRecord::Savepoint);
        assert_eq!(consumed, RECORD_HEADER_SIZE);
    }

    #[test]
    fn test_end_of_log() {
        assert!(WalRecord::from_bytes(&[0u8; 32]).is_none());
        assert!(WalRecord::from_bytes(&[0u8; 3]).is_none());
    }

    #[test]
    fn test_torn_tail() {
        let rec = WalRecord::Copy {
            dest: 8,
            payload: vec![9; 100],
        };
        let bytes = rec.to_bytes();
        // A record cut short reads as end-of-log.
        assert!(WalRecord::from_bytes(&bytes[..40]).is_none());
    }
}
