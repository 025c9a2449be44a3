//! Snapshot descriptor records
//!
//! The in-memory snapshot of one checkpoint and its byte-exact stream
//! form. Every structured record is prefixed with its own 32-bit magic; a
//! mismatch on reload is a fatal corruption error for the partition.
//!
//! # Stream Layout (per §external format)
//!
//! ```text
//! dump header
//! per process:
//!   process record (signal actions inline)
//!   fd-table record
//!   vmspace record
//!   thread records[]
//!   file records[]
//!   region records[]
//!   cdir bytes, rdir bytes
//!   per-file path bytes
//!   per-region path bytes
//!   per-region (vaddr, page bytes) pairs
//! ```

use crate::cpu::{FdEntry, FdKind, FdTable, FpRegs, GeneralRegs, SigAction, SigActionTable, ThreadState};
use cryo_core::{ByteReader, ByteWriter, CheckpointMode, Error, Limits, Result};

/// Magic of the dump header.
pub const DUMP_MAGIC: u32 = 0x434b_5054;
/// Magic of a process record.
pub const PROC_MAGIC: u32 = 0x5052_4f43;
/// Magic of a thread record.
pub const THREAD_MAGIC: u32 = 0x5448_5244;
/// Magic of an fd-table record.
pub const FDTABLE_MAGIC: u32 = 0x4644_5442;
/// Magic of a file record.
pub const FILE_MAGIC: u32 = 0x4649_4c45;
/// Magic of a vmspace record.
pub const VMSPACE_MAGIC: u32 = 0x564d_5350;
/// Magic of a region record.
pub const REGION_MAGIC: u32 = 0x5245_474e;
/// Magic of a PM dump-segment header.
pub const SEGMENT_MAGIC: u32 = 0x504d_5347;

/// Encoded dump header size.
pub const DUMP_HEADER_SIZE: usize = 32;
/// Encoded PM segment header size.
pub const SEGMENT_HEADER_SIZE: usize = 32;

fn cerr(e: cryo_core::CodecError) -> Error {
    Error::corruption(e.to_string())
}

fn check_magic(r: &mut ByteReader<'_>, expected: u32, what: &'static str) -> Result<()> {
    let found = r.get_u32().map_err(cerr)?;
    if found != expected {
        return Err(Error::BadMagic {
            what,
            expected,
            found,
        });
    }
    Ok(())
}

/// Address-space scalars captured with a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VmSpaceInfo {
    /// Swap-resident size.
    pub swap_size: u64,
    /// Text segment size.
    pub text_size: u64,
    /// Data segment size.
    pub data_size: u64,
    /// Stack size.
    pub stack_size: u64,
    /// Text segment base.
    pub text_addr: u64,
    /// Data segment base.
    pub data_addr: u64,
    /// Stack ceiling.
    pub max_stack_addr: u64,
}

/// One region's captured attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionInfo {
    /// First address.
    pub start: u64,
    /// One past the last address.
    pub end: u64,
    /// Offset of `start` into the backing object.
    pub offset: u64,
    /// Protection at capture.
    pub protection: u32,
    /// Maximum protection.
    pub max_protection: u32,
    /// Entry flags (submap etc.).
    pub eflags: u32,
    /// Backing object size in bytes.
    pub object_size: u64,
    /// Number of saved pages following in the stream for this region.
    pub resident: u32,
    /// Path of the backing file, if any.
    pub path: Option<String>,
}

impl RegionInfo {
    /// Virtual address of a page index within this region.
    pub fn vaddr_of_pindex(&self, pindex: u64) -> u64 {
        self.start + (pindex << 12) - self.offset
    }
}

/// Everything captured from one process.
#[derive(Debug, Clone)]
pub struct ProcSnapshot {
    /// Pid at capture time (informational; the restore host keeps its
    /// own).
    pub pid: u64,
    /// Signal disposition.
    pub sigacts: SigActionTable,
    /// Thread states.
    pub threads: Vec<ThreadState>,
    /// Descriptor table.
    pub fdtable: FdTable,
    /// Address-space scalars.
    pub vmspace: VmSpaceInfo,
    /// Region descriptors.
    pub regions: Vec<RegionInfo>,
}

/// One checkpoint's in-memory descriptor.
#[derive(Debug, Clone)]
pub struct SnapshotDescriptor {
    /// Owning partition.
    pub oid: u64,
    /// Epoch this snapshot commits as.
    pub epoch: u64,
    /// Capture mode.
    pub mode: CheckpointMode,
    /// Captured processes (more than one under recursive checkpoints).
    pub procs: Vec<ProcSnapshot>,
}

// ---------------------------------------------------------------------
// Record encoders/decoders
// ---------------------------------------------------------------------

/// Encode the dump header.
pub fn encode_dump_header(oid: u64, epoch: u64, mode: CheckpointMode, nprocs: u32) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(DUMP_HEADER_SIZE);
    w.put_u32(DUMP_MAGIC);
    w.put_u32(mode.as_u32());
    w.put_u64(oid);
    w.put_u64(epoch);
    w.put_u32(nprocs);
    w.pad_to(DUMP_HEADER_SIZE);
    w.into_vec()
}

/// Decode the dump header.
pub fn decode_dump_header(buf: &[u8]) -> Result<(u64, u64, CheckpointMode, u32)> {
    let mut r = ByteReader::new(buf);
    check_magic(&mut r, DUMP_MAGIC, "dump header")?;
    let mode_raw = r.get_u32().map_err(cerr)?;
    let mode = CheckpointMode::from_u32(mode_raw)
        .ok_or_else(|| Error::corruption(format!("unknown checkpoint mode {}", mode_raw)))?;
    let oid = r.get_u64().map_err(cerr)?;
    let epoch = r.get_u64().map_err(cerr)?;
    let nprocs = r.get_u32().map_err(cerr)?;
    if nprocs as usize > Limits::MAX_PROCS {
        return Err(Error::corruption(format!("{} processes in dump", nprocs)));
    }
    Ok((oid, epoch, mode, nprocs))
}

/// Encoded process record size.
pub const PROC_RECORD_SIZE: usize = 16 + Limits::NSIG * 24;

/// Encode a process record (pid, thread count, signal actions).
pub fn encode_proc(pid: u64, nthreads: u32, sigacts: &SigActionTable) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(PROC_RECORD_SIZE);
    w.put_u32(PROC_MAGIC);
    w.put_u32(nthreads);
    w.put_u64(pid);
    for a in &sigacts.actions {
        w.put_u64(a.handler);
        w.put_u32(a.flags);
        w.put_u32(0);
        w.put_u64(a.mask);
    }
    debug_assert_eq!(w.len(), PROC_RECORD_SIZE);
    w.into_vec()
}

/// Decode a process record.
pub fn decode_proc(buf: &[u8]) -> Result<(u64, u32, SigActionTable)> {
    let mut r = ByteReader::new(buf);
    check_magic(&mut r, PROC_MAGIC, "process record")?;
    let nthreads = r.get_u32().map_err(cerr)?;
    if nthreads as usize > Limits::MAX_THREADS {
        return Err(Error::corruption(format!("{} threads in record", nthreads)));
    }
    let pid = r.get_u64().map_err(cerr)?;
    let mut sigacts = SigActionTable::default();
    for a in sigacts.actions.iter_mut() {
        a.handler = r.get_u64().map_err(cerr)?;
        a.flags = r.get_u32().map_err(cerr)?;
        r.skip(4).map_err(cerr)?;
        a.mask = r.get_u64().map_err(cerr)?;
    }
    Ok((pid, nthreads, sigacts))
}

/// Encoded thread record size.
pub const THREAD_RECORD_SIZE: usize = 48 + 160 + 512;

/// Encode one thread record.
pub fn encode_thread(t: &ThreadState) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(THREAD_RECORD_SIZE);
    w.put_u32(THREAD_MAGIC);
    w.put_u32(0);
    w.put_u64(t.tid);
    w.put_u64(t.fsbase);
    w.put_u64(t.gsbase);
    w.put_u64(t.sigmask);
    w.put_u64(t.oldsigmask);

    let g = &t.regs;
    for v in [
        g.rax, g.rbx, g.rcx, g.rdx, g.rsi, g.rdi, g.rbp, g.rsp, g.r8, g.r9, g.r10, g.r11,
        g.r12, g.r13, g.r14, g.r15, g.rip, g.rflags,
    ] {
        w.put_u64(v);
    }
    for v in [g.cs, g.ss, g.ds, g.es, g.fs, g.gs] {
        w.put_u16(v);
    }
    w.put_u32(0);
    w.put_bytes(&t.fpregs.0);
    debug_assert_eq!(w.len(), THREAD_RECORD_SIZE);
    w.into_vec()
}

/// Decode one thread record.
pub fn decode_thread(buf: &[u8]) -> Result<ThreadState> {
    let mut r = ByteReader::new(buf);
    check_magic(&mut r, THREAD_MAGIC, "thread record")?;
    r.skip(4).map_err(cerr)?;
    let tid = r.get_u64().map_err(cerr)?;
    let fsbase = r.get_u64().map_err(cerr)?;
    let gsbase = r.get_u64().map_err(cerr)?;
    let sigmask = r.get_u64().map_err(cerr)?;
    let oldsigmask = r.get_u64().map_err(cerr)?;

    let mut regs = GeneralRegs::default();
    for slot in [
        &mut regs.rax,
        &mut regs.rbx,
        &mut regs.rcx,
        &mut regs.rdx,
        &mut regs.rsi,
        &mut regs.rdi,
        &mut regs.rbp,
        &mut regs.rsp,
        &mut regs.r8,
        &mut regs.r9,
        &mut regs.r10,
        &mut regs.r11,
        &mut regs.r12,
        &mut regs.r13,
        &mut regs.r14,
        &mut regs.r15,
        &mut regs.rip,
        &mut regs.rflags,
    ] {
        *slot = r.get_u64().map_err(cerr)?;
    }
    for slot in [
        &mut regs.cs,
        &mut regs.ss,
        &mut regs.ds,
        &mut regs.es,
        &mut regs.fs,
        &mut regs.gs,
    ] {
        *slot = r.get_u16().map_err(cerr)?;
    }
    r.skip(4).map_err(cerr)?;
    let mut fpregs = FpRegs::default();
    fpregs.0.copy_from_slice(r.get_bytes(512).map_err(cerr)?);

    Ok(ThreadState {
        tid,
        regs,
        fpregs,
        fsbase,
        gsbase,
        sigmask,
        oldsigmask,
        needs_full_restore: false,
    })
}

/// Encoded fd-table record size.
pub const FDTABLE_RECORD_SIZE: usize = 24;

/// Encode the fd-table record.
pub fn encode_fdtable(t: &FdTable) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(FDTABLE_RECORD_SIZE);
    w.put_u32(FDTABLE_MAGIC);
    w.put_u32(t.entries.len() as u32);
    w.put_u32(t.cdir.len() as u32);
    w.put_u32(t.rdir.len() as u32);
    w.put_u16(t.umask);
    w.pad_to(FDTABLE_RECORD_SIZE);
    w.into_vec()
}

/// Decode the fd-table record: `(num_files, cdir_len, rdir_len, umask)`.
pub fn decode_fdtable(buf: &[u8]) -> Result<(u32, u32, u32, u16)> {
    let mut r = ByteReader::new(buf);
    check_magic(&mut r, FDTABLE_MAGIC, "fd-table record")?;
    let num_files = r.get_u32().map_err(cerr)?;
    let cdir_len = r.get_u32().map_err(cerr)?;
    let rdir_len = r.get_u32().map_err(cerr)?;
    let umask = r.get_u16().map_err(cerr)?;
    if num_files as usize > Limits::MAX_FILES
        || cdir_len as usize > Limits::MAX_PATH
        || rdir_len as usize > Limits::MAX_PATH
    {
        return Err(Error::corruption("fd-table record out of bounds"));
    }
    Ok((num_files, cdir_len, rdir_len, umask))
}

/// Encoded file record size.
pub const FILE_RECORD_SIZE: usize = 32;

/// Encode one file record.
pub fn encode_file(e: &FdEntry) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(FILE_RECORD_SIZE);
    w.put_u32(FILE_MAGIC);
    w.put_u32(e.fd);
    w.put_u8(e.kind.as_u8());
    w.put_u8(0);
    w.put_u16(0);
    w.put_u32(e.flags);
    w.put_u64(e.offset);
    w.put_u32(e.path.as_ref().map_or(0, |p| p.len() as u32));
    w.pad_to(FILE_RECORD_SIZE);
    w.into_vec()
}

/// Decode one file record: `(entry-with-empty-path, path_len)`.
pub fn decode_file(buf: &[u8]) -> Result<(FdEntry, u32)> {
    let mut r = ByteReader::new(buf);
    check_magic(&mut r, FILE_MAGIC, "file record")?;
    let fd = r.get_u32().map_err(cerr)?;
    let kind_raw = r.get_u8().map_err(cerr)?;
    let kind = FdKind::from_u8(kind_raw)
        .ok_or_else(|| Error::corruption(format!("unknown fd kind {}", kind_raw)))?;
    r.skip(3).map_err(cerr)?;
    let flags = r.get_u32().map_err(cerr)?;
    let offset = r.get_u64().map_err(cerr)?;
    let path_len = r.get_u32().map_err(cerr)?;
    if path_len as usize > Limits::MAX_PATH {
        return Err(Error::corruption("file path too long"));
    }
    Ok((
        FdEntry {
            fd,
            kind,
            flags,
            offset,
            path: None,
        },
        path_len,
    ))
}

/// Encoded vmspace record size.
pub const VMSPACE_RECORD_SIZE: usize = 64;

/// Encode the vmspace record.
pub fn encode_vmspace(v: &VmSpaceInfo, nregions: u32) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(VMSPACE_RECORD_SIZE);
    w.put_u32(VMSPACE_MAGIC);
    w.put_u32(nregions);
    w.put_u64(v.swap_size);
    w.put_u64(v.text_size);
    w.put_u64(v.data_size);
    w.put_u64(v.stack_size);
    w.put_u64(v.text_addr);
    w.put_u64(v.data_addr);
    w.put_u64(v.max_stack_addr);
    debug_assert_eq!(w.len(), VMSPACE_RECORD_SIZE);
    w.into_vec()
}

/// Decode the vmspace record.
pub fn decode_vmspace(buf: &[u8]) -> Result<(VmSpaceInfo, u32)> {
    let mut r = ByteReader::new(buf);
    check_magic(&mut r, VMSPACE_MAGIC, "vmspace record")?;
    let nregions = r.get_u32().map_err(cerr)?;
    if nregions as usize > Limits::MAX_REGIONS {
        return Err(Error::corruption(format!("{} regions in record", nregions)));
    }
    let info = VmSpaceInfo {
        swap_size: r.get_u64().map_err(cerr)?,
        text_size: r.get_u64().map_err(cerr)?,
        data_size: r.get_u64().map_err(cerr)?,
        stack_size: r.get_u64().map_err(cerr)?,
        text_addr: r.get_u64().map_err(cerr)?,
        data_addr: r.get_u64().map_err(cerr)?,
        max_stack_addr: r.get_u64().map_err(cerr)?,
    };
    Ok((info, nregions))
}

/// Encoded region record size.
pub const REGION_RECORD_SIZE: usize = 56;

/// Encode one region record.
pub fn encode_region(info: &RegionInfo) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(REGION_RECORD_SIZE);
    w.put_u32(REGION_MAGIC);
    w.put_u32(info.protection);
    w.put_u32(info.max_protection);
    w.put_u32(info.eflags);
    w.put_u64(info.start);
    w.put_u64(info.end);
    w.put_u64(info.offset);
    w.put_u64(info.object_size);
    w.put_u32(info.path.as_ref().map_or(0, |p| p.len() as u32));
    w.put_u32(info.resident);
    debug_assert_eq!(w.len(), REGION_RECORD_SIZE);
    w.into_vec()
}

/// Decode one region record: `(info-with-empty-path, path_len)`.
pub fn decode_region(buf: &[u8]) -> Result<(RegionInfo, u32)> {
    let mut r = ByteReader::new(buf);
    check_magic(&mut r, REGION_MAGIC, "region record")?;
    let protection = r.get_u32().map_err(cerr)?;
    let max_protection = r.get_u32().map_err(cerr)?;
    let eflags = r.get_u32().map_err(cerr)?;
    let start = r.get_u64().map_err(cerr)?;
    let end = r.get_u64().map_err(cerr)?;
    let offset = r.get_u64().map_err(cerr)?;
    let object_size = r.get_u64().map_err(cerr)?;
    let path_len = r.get_u32().map_err(cerr)?;
    let resident = r.get_u32().map_err(cerr)?;
    if path_len as usize > Limits::MAX_PATH {
        return Err(Error::corruption("region path too long"));
    }
    if end < start {
        return Err(Error::corruption(format!(
            "region [{:#x}, {:#x}) inverted",
            start, end
        )));
    }
    Ok((
        RegionInfo {
            start,
            end,
            offset,
            protection,
            max_protection,
            eflags,
            object_size,
            resident,
            path: None,
        },
        path_len,
    ))
}

/// Encode a PM dump-segment header. `length` is the stream size that
/// follows the header.
pub fn encode_segment_header(oid: u64, epoch: u64, length: u64) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(SEGMENT_HEADER_SIZE);
    w.put_u32(SEGMENT_MAGIC);
    w.put_u32(0);
    w.put_u64(oid);
    w.put_u64(epoch);
    w.put_u64(length);
    w.pad_to(SEGMENT_HEADER_SIZE);
    w.into_vec()
}

/// Decode a PM dump-segment header: `(oid, epoch, length)`.
pub fn decode_segment_header(buf: &[u8]) -> Result<(u64, u64, u64)> {
    let mut r = ByteReader::new(buf);
    check_magic(&mut r, SEGMENT_MAGIC, "dump segment header")?;
    r.skip(4).map_err(cerr)?;
    let oid = r.get_u64().map_err(cerr)?;
    let epoch = r.get_u64().map_err(cerr)?;
    let length = r.get_u64().map_err(cerr)?;
    Ok((oid, epoch, length))
}
