//! Inode blocks
//!
//! Every object in the store (checkpoint manifest, page set, directory,
//! plain data) is an inode addressed by a 64-bit inode number through the
//! inode tree. The inode block carries identity, sizes, a record-stat
//! describing what the extent tree holds, four timestamps, and the root of
//! the per-inode extent tree.

use crate::superblock::DiskPtr;
use cryo_core::{ByteReader, ByteWriter, Error, Result};
use std::time::{SystemTime, UNIX_EPOCH};

/// Magic tag of an inode block.
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// Inode number of the store's root directory.
pub const ROOT_DIR_INODE: u64 = 100_000;

/// Bytes of the encoded inode (the rest of its block is zero).
pub const INODE_SIZE: usize = 160;

/// What an inode's extent tree holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// Unset.
    Invalid,
    /// Process descriptor record.
    Proc,
    /// Session record.
    Sess,
    /// Saved memory pages, keyed by virtual address.
    Mem,
    /// VM-object record.
    VmObj,
    /// File record.
    File,
    /// System V shared memory record.
    SysVShm,
    /// Socket buffer record.
    SockBuf,
    /// Directory: data blocks hold packed entries.
    Dir,
    /// Plain file data.
    Data,
    /// Checkpoint manifest: the serialized snapshot descriptor.
    Manifest,
}

impl RecordType {
    /// Wire encoding.
    pub fn as_u32(self) -> u32 {
        match self {
            RecordType::Invalid => 0,
            RecordType::Proc => 1,
            RecordType::Sess => 2,
            RecordType::Mem => 3,
            RecordType::VmObj => 4,
            RecordType::File => 5,
            RecordType::SysVShm => 6,
            RecordType::SockBuf => 7,
            RecordType::Dir => 8,
            RecordType::Data => 9,
            RecordType::Manifest => 10,
        }
    }

    /// Decode a wire value.
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => RecordType::Invalid,
            1 => RecordType::Proc,
            2 => RecordType::Sess,
            3 => RecordType::Mem,
            4 => RecordType::VmObj,
            5 => RecordType::File,
            6 => RecordType::SysVShm,
            7 => RecordType::SockBuf,
            8 => RecordType::Dir,
            9 => RecordType::Data,
            10 => RecordType::Manifest,
            _ => return None,
        })
    }
}

/// Seconds + nanoseconds timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timespec {
    /// Seconds since the Unix epoch.
    pub sec: u64,
    /// Nanoseconds part.
    pub nsec: u32,
}

impl Timespec {
    /// The current time.
    pub fn now() -> Self {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timespec {
            sec: d.as_secs(),
            nsec: d.subsec_nanos(),
        }
    }

    fn encode(&self, w: &mut ByteWriter) {
        w.put_u64(self.sec);
        w.put_u32(self.nsec);
        w.put_u32(0);
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        let sec = r.get_u64().map_err(|e| Error::corruption(e.to_string()))?;
        let nsec = r.get_u32().map_err(|e| Error::corruption(e.to_string()))?;
        r.skip(4).map_err(|e| Error::corruption(e.to_string()))?;
        Ok(Timespec { sec, nsec })
    }
}

/// One decoded inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    /// Inode number.
    pub ino: u64,
    /// Mode bits.
    pub mode: u32,
    /// Owning uid.
    pub uid: u32,
    /// Owning gid.
    pub gid: u32,
    /// Link count.
    pub nlink: u32,
    /// Flags.
    pub flags: u64,
    /// Logical size in bytes; reads clip extents against it.
    pub size: u64,
    /// Allocated size in bytes.
    pub asize: u64,
    /// Kind of record the extent tree holds.
    pub rec_type: RecordType,
    /// Record length hint.
    pub rec_len: u64,
    /// Creation time.
    pub ctime: Timespec,
    /// Modification time.
    pub mtime: Timespec,
    /// Access time.
    pub atime: Timespec,
    /// Birth time.
    pub birthtime: Timespec,
    /// Root of the per-inode extent tree.
    pub extent_root: DiskPtr,
}

impl Inode {
    /// A fresh inode with empty content.
    pub fn new(ino: u64, rec_type: RecordType, mode: u32) -> Self {
        let now = Timespec::now();
        Inode {
            ino,
            mode,
            uid: 0,
            gid: 0,
            nlink: 1,
            flags: 0,
            size: 0,
            asize: 0,
            rec_type,
            rec_len: 0,
            ctime: now,
            mtime: now,
            atime: now,
            birthtime: now,
            extent_root: DiskPtr::null(),
        }
    }

    /// Encode into a block-sized buffer.
    pub fn to_bytes(&self, block_size: usize) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(block_size);
        w.put_u32(INODE_MAGIC);
        w.put_u32(0); // reserved
        w.put_u64(self.ino);
        w.put_u32(self.mode);
        w.put_u32(self.uid);
        w.put_u32(self.gid);
        w.put_u32(self.nlink);
        w.put_u64(self.flags);
        w.put_u64(self.size);
        w.put_u64(self.asize);
        w.put_u32(self.rec_type.as_u32());
        w.put_u32(0); // reserved
        w.put_u64(self.rec_len);
        self.ctime.encode(&mut w);
        self.mtime.encode(&mut w);
        self.atime.encode(&mut w);
        self.birthtime.encode(&mut w);
        self.extent_root.encode(&mut w);
        debug_assert_eq!(w.len(), INODE_SIZE);
        w.pad_to(block_size);
        w.into_vec()
    }

    /// Decode from a block, validating the magic.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(buf);
        let magic = r.get_u32().map_err(|e| Error::corruption(e.to_string()))?;
        if magic != INODE_MAGIC {
            return Err(Error::BadMagic {
                what: "inode",
                expected: INODE_MAGIC,
                found: magic,
            });
        }
        r.skip(4).map_err(|e| Error::corruption(e.to_string()))?;
        let ino = r.get_u64().map_err(|e| Error::corruption(e.to_string()))?;
        let mode = r.get_u32().map_err(|e| Error::corruption(e.to_string()))?;
        let uid = r.get_u32().map_err(|e| Error::corruption(e.to_string()))?;
        let gid = r.get_u32().map_err(|e| Error::corruption(e.to_string()))?;
        let nlink = r.get_u32().map_err(|e| Error::corruption(e.to_string()))?;
        let flags = r.get_u64().map_err(|e| Error::corruption(e.to_string()))?;
        let size = r.get_u64().map_err(|e| Error::corruption(e.to_string()))?;
        let asize = r.get_u64().map_err(|e| Error::corruption(e.to_string()))?;
        let rec_type_raw = r.get_u32().map_err(|e| Error::corruption(e.to_string()))?;
        let rec_type = RecordType::from_u32(rec_type_raw)
            .ok_or_else(|| Error::corruption(format!("unknown record type {}", rec_type_raw)))?;
        r.skip(4).map_err(|e| Error::corruption(e.to_string()))?;
        let rec_len = r.get_u64().map_err(|e| Error::corruption(e.to_string()))?;
        let ctime = Timespec::decode(&mut r)?;
        let mtime = Timespec::decode(&mut r)?;
        let atime = Timespec::decode(&mut r)?;
        let birthtime = Timespec::decode(&mut r)?;
        let extent_root = DiskPtr::decode(&mut r)?;

        Ok(Inode {
            ino,
            mode,
            uid,
            gid,
            nlink,
            flags,
            size,
            asize,
            rec_type,
            rec_len,
            ctime,
            mtime,
            atime,
            birthtime,
            extent_root,
        })
    }
}
