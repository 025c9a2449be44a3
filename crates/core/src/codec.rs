//! Bounds-checked byte codec for on-disk structures
//!
//! Every persisted format in the system (superblock slots, inode blocks,
//! B-tree nodes, snapshot descriptor records, WAL records) is hand-encoded
//! little-endian. `ByteWriter` and `ByteReader` centralize the cursor and
//! bounds bookkeeping so the format modules stay declarative: a sequence of
//! `put_*`/`get_*` calls in field order.

use thiserror::Error;

/// Codec-level parse errors, converted into [`crate::Error::Corruption`]
/// at module boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The buffer ended before the field could be read.
    #[error("truncated input: needed {needed} bytes at offset {at}, had {remaining}")]
    Truncated {
        /// Bytes the field required.
        needed: usize,
        /// Read cursor position.
        at: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// A length or count field exceeded its limit.
    #[error("oversized field: {what} = {value} exceeds {limit}")]
    Oversized {
        /// Which field.
        what: &'static str,
        /// The decoded value.
        value: u64,
        /// Its limit.
        limit: u64,
    },
}

/// Sequential little-endian writer over a growable buffer.
#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        ByteWriter { buf: Vec::new() }
    }

    /// Create a writer with a capacity hint.
    pub fn with_capacity(cap: usize) -> Self {
        ByteWriter {
            buf: Vec::with_capacity(cap),
        }
    }

    /// Append a u8.
    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    /// Append a little-endian u16.
    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Append a little-endian u32.
    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Append a little-endian u64.
    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Append raw bytes.
    pub fn put_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// Append zero padding up to `len` total bytes written so far in the
    /// current fixed-size record; panics if already past it (a format bug,
    /// caught in tests).
    pub fn pad_to(&mut self, len: usize) {
        assert!(self.buf.len() <= len, "record overflowed its fixed size");
        self.buf.resize(len, 0);
    }

    /// Number of bytes written.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume the writer and return the buffer.
    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

/// Sequential little-endian reader over a byte slice.
#[derive(Debug)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> ByteReader<'a> {
    /// Create a reader at offset 0.
    pub fn new(buf: &'a [u8]) -> Self {
        ByteReader { buf, at: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let remaining = self.buf.len() - self.at;
        if remaining < n {
            return Err(CodecError::Truncated {
                needed: n,
                at: self.at,
                remaining,
            });
        }
        let out = &self.buf[self.at..self.at + n];
        self.at += n;
        Ok(out)
    }

    /// Read a u8.
    pub fn get_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    /// Read a little-endian u16.
    pub fn get_u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    /// Read a little-endian u32.
    pub fn get_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    /// Read a little-endian u64.
    pub fn get_u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    /// Read `n` raw bytes.
    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        self.take(n)
    }

    /// Skip `n` bytes of padding.
    pub fn skip(&mut self, n: usize) -> Result<(), CodecError> {
        self.take(n).map(|_| ())
    }

    /// Current read offset.
    pub fn position(&self) -> usize {
        self.at
    }

    /// Bytes remaining past the cursor.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.at
    }
}
