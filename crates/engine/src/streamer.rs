//! Snapshot streaming: serialize to a backend, load and compose back
//!
//! Writing: the descriptor records go out sequentially through the
//! backend cursor; pages either follow inline as `(vaddr, page)` pairs
//! (file and PM dumps) or drain through the writer pool into per-process
//! page inodes of the store (store dumps).
//!
//! Loading: epochs are read newest-first down the delta chain; every page
//! enters the [`PageIndex`] through `insert_if_absent`, so the newest
//! copy of each address wins.

use crate::capture::CapturedRegion;
use crate::descriptor::{
    self, ProcSnapshot, SnapshotDescriptor, DUMP_HEADER_SIZE, FDTABLE_RECORD_SIZE,
    FILE_RECORD_SIZE, PROC_RECORD_SIZE, REGION_RECORD_SIZE, SEGMENT_HEADER_SIZE,
    THREAD_RECORD_SIZE, VMSPACE_RECORD_SIZE,
};
use crate::partition::{manifest_ino, mem_ino};
use cryo_backend::{Backend, PageIndex, PageUnit, PmRegion, WriterPool};
use cryo_core::{CheckpointMode, Error, Oid, Result, PAGE_SIZE};
use cryo_store::ObjectStore;
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Composed pages per captured process, keyed by the pid recorded in the
/// snapshot (stable across the epochs of a delta chain).
pub type PageIndexes = FxHashMap<u64, PageIndex>;

/// How pages leave the process during a dump.
pub enum PageWriter<'a> {
    /// Pages follow the descriptor stream inline as `(vaddr, page)`
    /// pairs (file and PM backends).
    Inline,
    /// Pages drain through the writer pool (store backend); the sink
    /// keys them by owning inode and vaddr. `amplification` repeats each
    /// unit.
    Pool {
        /// The partition's pool.
        pool: &'a WriterPool,
        /// Write-amplification factor (≥ 1).
        amplification: u64,
        /// Target page inode per process, parallel to the descriptor's
        /// process list.
        page_inos: Vec<u64>,
    },
}

/// Serialize a snapshot. `captured` holds one region vector per process,
/// parallel to `desc.procs`. Returns the number of pages written.
pub fn write_snapshot(
    desc: &SnapshotDescriptor,
    captured: &[Vec<CapturedRegion>],
    backend: &mut Backend,
    pages: PageWriter<'_>,
) -> Result<u64> {
    debug_assert_eq!(desc.procs.len(), captured.len());

    backend.write(&descriptor::encode_dump_header(
        desc.oid,
        desc.epoch,
        desc.mode,
        desc.procs.len() as u32,
    ))?;

    let mut total_pages = 0u64;
    for (proc_idx, (proc, regions)) in desc.procs.iter().zip(captured.iter()).enumerate() {
        backend.write(&descriptor::encode_proc(
            proc.pid,
            proc.threads.len() as u32,
            &proc.sigacts,
        ))?;
        backend.write(&descriptor::encode_fdtable(&proc.fdtable))?;
        backend.write(&descriptor::encode_vmspace(
            &proc.vmspace,
            proc.regions.len() as u32,
        ))?;
        for t in &proc.threads {
            backend.write(&descriptor::encode_thread(t))?;
        }
        for f in &proc.fdtable.entries {
            backend.write(&descriptor::encode_file(f))?;
        }
        for r in &proc.regions {
            backend.write(&descriptor::encode_region(r))?;
        }
        backend.write(proc.fdtable.cdir.as_bytes())?;
        backend.write(proc.fdtable.rdir.as_bytes())?;
        for f in &proc.fdtable.entries {
            if let Some(p) = &f.path {
                backend.write(p.as_bytes())?;
            }
        }
        for r in &proc.regions {
            if let Some(p) = &r.path {
                backend.write(p.as_bytes())?;
            }
        }

        for (ri, cregion) in regions.iter().enumerate() {
            let pagelist = cregion.pages(desc.mode);
            debug_assert_eq!(pagelist.len() as u32, cregion.info.resident);
            for (pindex, page) in pagelist {
                let vaddr = cregion.info.vaddr_of_pindex(pindex);
                match &pages {
                    PageWriter::Inline => {
                        backend.write(&vaddr.to_le_bytes())?;
                        backend.write(&page)?;
                    }
                    PageWriter::Pool {
                        pool,
                        amplification,
                        page_inos,
                    } => {
                        // Region-to-worker affinity keeps intra-region
                        // order on one queue; readers still key by vaddr.
                        let worker = ri % pool.worker_count();
                        for _ in 0..(*amplification).max(1) {
                            pool.enqueue(
                                worker,
                                PageUnit {
                                    vaddr,
                                    page: page.clone(),
                                    ino: page_inos[proc_idx],
                                },
                            )?;
                        }
                    }
                }
                total_pages += 1;
            }
        }
    }

    if let PageWriter::Pool { pool, .. } = &pages {
        pool.drain();
    }
    backend.flush()?;
    debug!(
        target: "ckpt::orch",
        oid = desc.oid,
        epoch = desc.epoch,
        pages = total_pages,
        "snapshot streamed"
    );
    Ok(total_pages)
}

fn read_string(backend: &mut Backend, len: usize, what: &str) -> Result<String> {
    let mut buf = vec![0u8; len];
    backend.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| Error::corruption(format!("{} is not UTF-8", what)))
}

/// Deserialize one snapshot stream. When `pages_inline`, the per-region
/// page pairs are read and folded into the process's index (newest-first
/// callers see older duplicates dropped).
pub fn read_snapshot(
    backend: &mut Backend,
    pages_inline: bool,
    indexes: &mut PageIndexes,
) -> Result<SnapshotDescriptor> {
    let mut hdr = [0u8; DUMP_HEADER_SIZE];
    backend.read_exact(&mut hdr)?;
    let (oid, epoch, mode, nprocs) = descriptor::decode_dump_header(&hdr)?;

    let mut procs = Vec::with_capacity(nprocs as usize);
    for _ in 0..nprocs {
        let mut buf = vec![0u8; PROC_RECORD_SIZE];
        backend.read_exact(&mut buf)?;
        let (pid, nthreads, sigacts) = descriptor::decode_proc(&buf)?;

        let mut buf = [0u8; FDTABLE_RECORD_SIZE];
        backend.read_exact(&mut buf)?;
        let (num_files, cdir_len, rdir_len, umask) = descriptor::decode_fdtable(&buf)?;

        let mut buf = [0u8; VMSPACE_RECORD_SIZE];
        backend.read_exact(&mut buf)?;
        let (vmspace, nregions) = descriptor::decode_vmspace(&buf)?;

        let mut threads = Vec::with_capacity(nthreads as usize);
        for _ in 0..nthreads {
            let mut buf = vec![0u8; THREAD_RECORD_SIZE];
            backend.read_exact(&mut buf)?;
            threads.push(descriptor::decode_thread(&buf)?);
        }

        let mut files = Vec::with_capacity(num_files as usize);
        let mut file_path_lens = Vec::with_capacity(num_files as usize);
        for _ in 0..num_files {
            let mut buf = [0u8; FILE_RECORD_SIZE];
            backend.read_exact(&mut buf)?;
            let (entry, path_len) = descriptor::decode_file(&buf)?;
            files.push(entry);
            file_path_lens.push(path_len);
        }

        let mut regions = Vec::with_capacity(nregions as usize);
        let mut region_path_lens = Vec::with_capacity(nregions as usize);
        for _ in 0..nregions {
            let mut buf = [0u8; REGION_RECORD_SIZE];
            backend.read_exact(&mut buf)?;
            let (info, path_len) = descriptor::decode_region(&buf)?;
            regions.push(info);
            region_path_lens.push(path_len);
        }

        let cdir = read_string(backend, cdir_len as usize, "cdir")?;
        let rdir = read_string(backend, rdir_len as usize, "rdir")?;
        for (entry, len) in files.iter_mut().zip(file_path_lens) {
            if len > 0 {
                entry.path = Some(read_string(backend, len as usize, "file path")?);
            }
        }
        for (info, len) in regions.iter_mut().zip(region_path_lens) {
            if len > 0 {
                info.path = Some(read_string(backend, len as usize, "region path")?);
            }
        }

        if pages_inline {
            let index = indexes.entry(pid).or_default();
            for info in &regions {
                for _ in 0..info.resident {
                    let mut tag = [0u8; 8];
                    backend.read_exact(&mut tag)?;
                    let vaddr = u64::from_le_bytes(tag);
                    let mut page = vec![0u8; PAGE_SIZE].into_boxed_slice();
                    backend.read_exact(&mut page)?;
                    index.insert_if_absent(vaddr, page);
                }
            }
        }

        let mut fdtable = crate::cpu::FdTable {
            cdir,
            rdir,
            umask,
            entries: files,
        };
        // Keep descriptor order stable for restore.
        fdtable.entries.sort_by_key(|e| e.fd);

        procs.push(ProcSnapshot {
            pid,
            sigacts,
            threads,
            fdtable,
            vmspace,
            regions,
        });
    }

    Ok(SnapshotDescriptor {
        oid,
        epoch,
        mode,
        procs,
    })
}

// ---------------------------------------------------------------------
// Per-backend composition
// ---------------------------------------------------------------------

/// Dump file name for one epoch of a partition.
pub fn dump_file_name(oid: u64, epoch: u64) -> String {
    format!("{}-{:06}.ckpt", oid, epoch)
}

/// Path of one epoch's dump file.
pub fn dump_file_path(dir: &Path, oid: u64, epoch: u64) -> PathBuf {
    dir.join(dump_file_name(oid, epoch))
}

/// Epochs present in a partition's dump directory, ascending.
pub fn list_dump_epochs(dir: &Path, oid: u64) -> Result<Vec<u64>> {
    let prefix = format!("{}-", oid);
    let mut epochs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if let Some(rest) = name.strip_prefix(&prefix) {
            if let Some(num) = rest.strip_suffix(".ckpt") {
                if let Ok(e) = num.parse::<u64>() {
                    epochs.push(e);
                }
            }
        }
    }
    epochs.sort_unstable();
    Ok(epochs)
}

/// Compose the newest restorable state from a file-backed partition:
/// walk epochs newest-first down the delta chain until (and including)
/// the most recent FULL snapshot.
pub fn compose_from_files(dir: &Path, oid: u64) -> Result<(SnapshotDescriptor, PageIndexes)> {
    let epochs = list_dump_epochs(dir, oid)?;
    if epochs.is_empty() {
        return Err(Error::invalid_argument(format!(
            "no checkpoints for partition {} in {}",
            oid,
            dir.display()
        )));
    }

    let mut indexes = PageIndexes::default();
    let mut newest: Option<SnapshotDescriptor> = None;
    for &epoch in epochs.iter().rev() {
        let mut backend = Backend::file_open(&dump_file_path(dir, oid, epoch))?;
        let desc = read_snapshot(&mut backend, true, &mut indexes)?;
        let is_full = desc.mode == CheckpointMode::Full;
        if newest.is_none() {
            newest = Some(desc);
        }
        if is_full {
            break;
        }
    }
    Ok((newest.unwrap(), indexes))
}

/// Compose from a PM region holding appended dump segments.
pub fn compose_from_pm(region: &Arc<PmRegion>) -> Result<(SnapshotDescriptor, PageIndexes)> {
    // Collect segment extents front to back.
    let mut segments = Vec::new();
    let mut at = 0u64;
    while at + SEGMENT_HEADER_SIZE as u64 <= region.capacity() {
        let mut hdr = [0u8; SEGMENT_HEADER_SIZE];
        region.read_at(at, &mut hdr)?;
        let Ok((_, epoch, length)) = descriptor::decode_segment_header(&hdr) else {
            break;
        };
        let data = at + SEGMENT_HEADER_SIZE as u64;
        segments.push((epoch, data));
        at = data + length;
    }
    if segments.is_empty() {
        return Err(Error::invalid_argument("no dump segments in pm region"));
    }

    let mut indexes = PageIndexes::default();
    let mut newest: Option<SnapshotDescriptor> = None;
    for &(_, data) in segments.iter().rev() {
        let mut backend = Backend::pm(Arc::clone(region), data);
        let desc = read_snapshot(&mut backend, true, &mut indexes)?;
        let is_full = desc.mode == CheckpointMode::Full;
        if newest.is_none() {
            newest = Some(desc);
        }
        if is_full {
            break;
        }
    }
    Ok((newest.unwrap(), indexes))
}

/// Compose from a store-backed partition: the manifest inode holds the
/// newest descriptor and each page inode's extent tree already merges the
/// delta chain (newest extent per address).
pub fn compose_from_store(
    store: &Arc<ObjectStore>,
    oid: Oid,
) -> Result<(SnapshotDescriptor, PageIndexes)> {
    let mut backend = Backend::store(Arc::clone(store), manifest_ino(oid));
    let mut indexes = PageIndexes::default();
    let desc = read_snapshot(&mut backend, false, &mut indexes)?;

    for (proc_idx, proc) in desc.procs.iter().enumerate() {
        let ino = mem_ino(oid, proc_idx as u32);
        if !store.inode_exists(ino)? {
            continue;
        }
        let index = indexes.entry(proc.pid).or_default();
        for (vaddr, _ptr) in store.extents(ino)? {
            let mut page = vec![0u8; PAGE_SIZE].into_boxed_slice();
            let n = store.read_record(ino, vaddr, &mut page)?;
            if n != PAGE_SIZE {
                return Err(Error::corruption(format!(
                    "saved page {:#x} truncated to {} bytes",
                    vaddr, n
                )));
            }
            index.insert_if_absent(vaddr, page);
        }
    }
    Ok((desc, indexes))
}
