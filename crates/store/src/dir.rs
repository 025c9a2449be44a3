//! Directory entry packing
//!
//! A DIR inode's data blocks hold a packed sequence of
//! `(name_len, type, ino, name)` tuples. The store's root directory lists
//! the partitions checkpointed onto the volume.

use crate::inode::RecordType;
use cryo_core::{ByteReader, ByteWriter, Error, Limits, Result};

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name.
    pub name: String,
    /// Record type of the target inode.
    pub etype: RecordType,
    /// Target inode number.
    pub ino: u64,
}

impl DirEntry {
    /// Construct an entry.
    pub fn new(name: impl Into<String>, etype: RecordType, ino: u64) -> Self {
        DirEntry {
            name: name.into(),
            etype,
            ino,
        }
    }
}

/// Pack a list of entries into directory data.
pub fn pack_entries(entries: &[DirEntry]) -> Vec<u8> {
    let mut w = ByteWriter::new();
    for e in entries {
        w.put_u16(e.name.len() as u16);
        w.put_u8(e.etype.as_u32() as u8);
        w.put_u8(0);
        w.put_u64(e.ino);
        w.put_bytes(e.name.as_bytes());
    }
    w.into_vec()
}

/// Unpack directory data.
pub fn unpack_entries(data: &[u8]) -> Result<Vec<DirEntry>> {
    let mut r = ByteReader::new(data);
    let mut out = Vec::new();
    while r.remaining() > 0 {
        let name_len = r.get_u16().map_err(|e| Error::corruption(e.to_string()))? as usize;
        if name_len > Limits::MAX_PATH {
            return Err(Error::corruption(format!(
                "directory entry name of {} bytes",
                name_len
            )));
        }
        let etype_raw = r.get_u8().map_err(|e| Error::corruption(e.to_string()))?;
        let etype = RecordType::from_u32(etype_raw as u32)
            .ok_or_else(|| Error::corruption("unknown directory entry type"))?;
        r.skip(1).map_err(|e| Error::corruption(e.to_string()))?;
        let ino = r.get_u64().map_err(|e| Error::corruption(e.to_string()))?;
        let name_raw = r
            .get_bytes(name_len)
            .map_err(|e| Error::corruption(e.to_string()))?;
        let name = String::from_utf8(name_raw.to_vec())
            .map_err(|_| Error::corruption("directory entry name is not UTF-8"))?;
        out.push(DirEntry { name, etype, ino });
    }
    Ok(out)
}
