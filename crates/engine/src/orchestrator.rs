//! Checkpoint orchestration
//!
//! The top-level state machine per partition:
//!
//! ```text
//! IDLE ─attach──► ATTACHED ─checkpoint──► CAPTURING ─release──► PERSISTING ─commit──► IDLE'
//!                      │                                                │
//!                      └──── setattr(period ≠ 0) ──► PERIODIC ─────────┘
//! ```
//!
//! One-shot protocol: hold and stop the target, capture process state and
//! address space (interposing the snapshot view), resume the target, then
//! stream the snapshot to the backend and advance the epoch on commit.
//! Any capture or persist failure discards the in-memory descriptor and
//! leaves the epoch unchanged; any restore failure kills the host.

use crate::capture::{capture_vmspace, release_captured, CapturedRegion};
use crate::descriptor::{ProcSnapshot, SnapshotDescriptor};
use crate::host::HostProcess;
use crate::partition::{manifest_ino, mem_ino, BackendTarget, Partition, PeriodicHandle};
use crate::restore::restore_vmspace;
use crate::streamer::{self, PageWriter};
use cryo_backend::{Backend, PageIndex};
use cryo_core::{CheckpointMode, Epoch, Error, Result};
use cryo_store::RecordType;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// One-shot checkpoint of every attached process (and, with `recurse`,
/// their descendants). Returns the committed epoch.
///
/// Rejected while periodic mode is armed: the two modes would race.
pub fn checkpoint(part: &Partition, recurse: bool) -> Result<Epoch> {
    if part.periodic_armed() {
        return Err(Error::InvalidOperation {
            oid: part.oid(),
            reason: "explicit checkpoint while periodic mode is armed".into(),
        });
    }
    checkpoint_internal(part, recurse)
}

/// The checkpoint body, also driven by the periodic scheduler.
pub fn checkpoint_internal(part: &Partition, recurse: bool) -> Result<Epoch> {
    let _serial = part.ckpt_lock.lock();
    part.attempted.fetch_add(1, Ordering::Relaxed);

    let attr = part.attr();
    let procs = part.processes(recurse);
    if procs.is_empty() {
        return Err(Error::InvalidOperation {
            oid: part.oid(),
            reason: "no attached processes".into(),
        });
    }

    // Quiesce each target, capture, and release it as soon as its own
    // capture finishes; persistence happens with everyone running.
    let mut proc_snaps = Vec::with_capacity(procs.len());
    let mut captured_all = Vec::with_capacity(procs.len());
    for proc in &procs {
        proc.stop();
        let sigacts = proc.sigacts();
        let threads = proc.thread_states();
        let fdtable = proc.fd_table();
        let capture_result = {
            let mut vm = proc.vm().lock();
            capture_vmspace(&mut vm, attr.mode)
        };
        proc.resume();

        let (vmspace, captured) = match capture_result {
            Ok(v) => v,
            Err(e) => {
                // Discard partial captures; the epoch is untouched.
                release_all(&procs, captured_all);
                return Err(e);
            }
        };
        proc_snaps.push(ProcSnapshot {
            pid: proc.pid(),
            sigacts,
            threads,
            fdtable,
            vmspace,
            regions: captured.iter().map(|c| c.info.clone()).collect(),
        });
        captured_all.push(captured);
    }

    let outcome = persist(part, &attr.mode, proc_snaps, &captured_all, &attr);
    release_all(&procs, captured_all);

    match outcome {
        Ok((epoch, pages)) => {
            part.inline_pages.fetch_add(pages, Ordering::Relaxed);
            part.done.fetch_add(1, Ordering::Relaxed);
            part.gate.advance_to(epoch);
            info!(target: "ckpt::orch", oid = %part.oid(), epoch, pages, "checkpoint committed");
            Ok(epoch)
        }
        Err(e) => {
            error!(target: "ckpt::orch", oid = %part.oid(), error = %e, "checkpoint aborted");
            Err(e)
        }
    }
}

fn release_all(procs: &[Arc<dyn HostProcess>], captured_all: Vec<Vec<CapturedRegion>>) {
    for (proc, captured) in procs.iter().zip(captured_all.into_iter()) {
        let vm = proc.vm().lock();
        release_captured(&vm, captured);
    }
}

/// Stream a snapshot to the partition's backend. Returns
/// `(epoch, inline pages written)`.
fn persist(
    part: &Partition,
    mode: &CheckpointMode,
    proc_snaps: Vec<ProcSnapshot>,
    captured_all: &[Vec<CapturedRegion>],
    attr: &crate::partition::PartitionAttr,
) -> Result<(Epoch, u64)> {
    match &attr.target {
        BackendTarget::File { dir } => {
            let epoch = part.gate.current() + 1;
            let desc = SnapshotDescriptor {
                oid: part.oid().as_u64(),
                epoch,
                mode: *mode,
                procs: proc_snaps,
            };
            let path = streamer::dump_file_path(dir, desc.oid, epoch);
            let mut backend = Backend::file_create(&path)?;
            let pages =
                streamer::write_snapshot(&desc, captured_all, &mut backend, PageWriter::Inline)?;
            backend.flush()?;
            Ok((epoch, pages))
        }
        BackendTarget::Pm { .. } => {
            let epoch = part.gate.current() + 1;
            let desc = SnapshotDescriptor {
                oid: part.oid().as_u64(),
                epoch,
                mode: *mode,
                procs: proc_snaps,
            };
            let region = part.pm.as_ref().expect("pm target carries a region");
            let mut cursor = part.pm_cursor.lock();

            // Zeroed placeholder first: a failed dump leaves a segment
            // that never decodes, so composition stops before it.
            let header_at = *cursor;
            let data_at = header_at + crate::descriptor::SEGMENT_HEADER_SIZE as u64;
            region.write_at(header_at, &[0u8; crate::descriptor::SEGMENT_HEADER_SIZE])?;

            let mut backend = Backend::pm(Arc::clone(region), data_at);
            let pages =
                streamer::write_snapshot(&desc, captured_all, &mut backend, PageWriter::Inline)?;
            let length = backend.position() - data_at;
            region.write_at(
                header_at,
                &crate::descriptor::encode_segment_header(desc.oid, epoch, length),
            )?;
            *cursor = data_at + length;
            Ok((epoch, pages))
        }
        BackendTarget::Store { .. } => {
            let store = part.store.as_ref().expect("store target carries a store");
            let pool = part.pool.as_ref().expect("store target carries a pool");

            // Serialize against other checkpoints of this store so the
            // predicted epoch is the one the commit assigns.
            let _serial = store.begin_checkpoint();
            let epoch = store.epoch() + 1;
            let desc = SnapshotDescriptor {
                oid: part.oid().as_u64(),
                epoch,
                mode: *mode,
                procs: proc_snaps,
            };

            // One page inode per captured process; create the ones this
            // snapshot needs before the pool starts writing into them.
            let mut page_inos = Vec::with_capacity(desc.procs.len());
            for idx in 0..desc.procs.len() {
                let ino = mem_ino(part.oid(), idx as u32);
                store.ensure_inode(ino, RecordType::Mem, 0o600)?;
                page_inos.push(ino);
            }

            let mut backend = Backend::store(Arc::clone(store), manifest_ino(part.oid()));
            streamer::write_snapshot(
                &desc,
                captured_all,
                &mut backend,
                PageWriter::Pool {
                    pool,
                    amplification: attr.amplification,
                    page_inos,
                },
            )?;
            if pool.units_dropped() > 0 {
                warn!(
                    target: "ckpt::orch",
                    oid = %part.oid(),
                    dropped = pool.units_dropped(),
                    "writer pool dropped units this lifetime"
                );
            }

            let committed = store.commit()?;
            debug_assert_eq!(committed, epoch);
            Ok((committed, 0))
        }
    }
}

/// Snapshot a single region: the one containing `addr` in the first
/// attached process. Returns the epoch assigned to the snapshot.
pub fn memsnap(part: &Partition, addr: u64) -> Result<Epoch> {
    if part.periodic_armed() {
        return Err(Error::InvalidOperation {
            oid: part.oid(),
            reason: "memsnap while periodic mode is armed".into(),
        });
    }
    let _serial = part.ckpt_lock.lock();
    part.attempted.fetch_add(1, Ordering::Relaxed);

    let attr = part.attr();
    let procs = part.processes(false);
    let proc = procs.first().ok_or_else(|| Error::InvalidOperation {
        oid: part.oid(),
        reason: "no attached processes".into(),
    })?;

    proc.stop();
    let sigacts = proc.sigacts();
    let threads = proc.thread_states();
    let fdtable = proc.fd_table();
    let capture_result = {
        let mut vm = proc.vm().lock();
        match vm.regions.iter().position(|r| r.contains(addr)) {
            None => Err(Error::invalid_argument(format!(
                "no region contains {:#x}",
                addr
            ))),
            Some(idx) => {
                // Capture just that region by splitting it out of the list.
                let mut others = std::mem::take(&mut vm.regions);
                let kept = others.swap_remove(idx);
                vm.regions.push(kept);
                let result = capture_vmspace(&mut vm, attr.mode);
                // Re-insert the untouched regions around the captured one.
                vm.regions.append(&mut others);
                vm.regions.sort_by_key(|r| r.start);
                result
            }
        }
    };
    proc.resume();

    let (vmspace, captured) = capture_result?;
    let snaps = vec![ProcSnapshot {
        pid: proc.pid(),
        sigacts,
        threads,
        fdtable,
        vmspace,
        regions: captured.iter().map(|c| c.info.clone()).collect(),
    }];
    let captured_all = vec![captured];
    let outcome = persist(part, &attr.mode, snaps, &captured_all, &attr);
    release_all(&procs[..1], captured_all);

    let (epoch, pages) = outcome?;
    part.inline_pages.fetch_add(pages, Ordering::Relaxed);
    part.done.fetch_add(1, Ordering::Relaxed);
    part.gate.advance_to(epoch);
    Ok(epoch)
}

/// Restore the partition's newest snapshot onto fresh host processes,
/// one per stored process. Leaves the hosts stopped when `rest_stopped`.
pub fn restore(
    part: &Partition,
    hosts: &[Arc<dyn HostProcess>],
    rest_stopped: bool,
) -> Result<()> {
    let attr = part.attr();
    let (desc, indexes) = match &attr.target {
        BackendTarget::File { dir } => streamer::compose_from_files(dir, part.oid().as_u64())?,
        BackendTarget::Pm { .. } => {
            let region = part.pm.as_ref().expect("pm target carries a region");
            streamer::compose_from_pm(region)?
        }
        BackendTarget::Store { .. } => {
            let store = part.store.as_ref().expect("store target carries a store");
            streamer::compose_from_store(store, part.oid())?
        }
    };

    if hosts.len() != desc.procs.len() {
        return Err(Error::invalid_argument(format!(
            "snapshot holds {} processes, {} hosts supplied",
            desc.procs.len(),
            hosts.len()
        )));
    }

    let empty = PageIndex::new();
    for (host, snap) in hosts.iter().zip(desc.procs.iter()) {
        host.stop();
        let index = indexes.get(&snap.pid).unwrap_or(&empty);
        let result = (|| -> Result<()> {
            // Fresh signal table swapped in, refcount never copied.
            host.set_sigacts(snap.sigacts.clone());
            host.set_thread_states(snap.threads.clone())?;
            host.set_fd_table(snap.fdtable.clone());
            let mut vm = host.vm().lock();
            restore_vmspace(&mut vm, &snap.vmspace, &snap.regions, index)
        })();

        if let Err(e) = result {
            // The host is undefined now; kill it.
            error!(target: "ckpt::orch", pid = host.pid(), error = %e, "restore failed");
            host.kill();
            return Err(e);
        }
        if !rest_stopped {
            host.resume();
        }
    }
    info!(
        target: "ckpt::orch",
        oid = %part.oid(),
        epoch = desc.epoch,
        procs = hosts.len(),
        "restore complete"
    );
    Ok(())
}

/// Arm the periodic scheduler: a timer thread issuing internal
/// checkpoints every `period`. Explicit `checkpoint()` calls are
/// rejected while armed.
pub fn arm_periodic(part: &Arc<Partition>, period: Duration) {
    let mut slot = part.periodic.lock();
    if slot.is_some() {
        return;
    }
    let stop = Arc::new((Mutex::new(false), Condvar::new()));
    let thread = {
        let part = Arc::clone(part);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            let (lock, cv) = &*stop;
            loop {
                {
                    let mut stopped = lock.lock();
                    if !*stopped {
                        cv.wait_for(&mut stopped, period);
                    }
                    if *stopped {
                        break;
                    }
                }
                if let Err(e) = checkpoint_internal(&part, false) {
                    warn!(target: "ckpt::orch", oid = %part.oid(), error = %e, "periodic tick failed");
                }
            }
        })
    };
    *slot = Some(PeriodicHandle {
        stop,
        thread: Some(thread),
    });
    info!(target: "ckpt::orch", oid = %part.oid(), ?period, "periodic mode armed");
}

/// Disarm the periodic scheduler; an already-running tick completes.
pub fn disarm_periodic(part: &Partition) {
    if let Some(handle) = part.periodic.lock().take() {
        handle.disarm();
        info!(target: "ckpt::orch", oid = %part.oid(), "periodic mode disarmed");
    }
}
