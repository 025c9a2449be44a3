//! The host-process seam
//!
//! The capture and restore core is written against [`HostProcess`]: the
//! minimal set of operations a host must supply: stop/continue, access
//! to the address space, thread register files, signal disposition, and
//! the descriptor table. A kernel-resident host would implement this over
//! real processes; [`SimProcess`] is the in-repo user-space emulation the
//! tests (and any embedding) run against.

use crate::cpu::{FdTable, SigActionTable, ThreadState};
use crate::vm::VmSpace;
use cryo_core::Result;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Abstract process interface the engine operates on.
pub trait HostProcess: Send + Sync {
    /// Process id on the host.
    fn pid(&self) -> u64;

    /// Quiesce the process (STOP). Idempotent.
    fn stop(&self);

    /// Let the process run again (CONT). Idempotent.
    fn resume(&self);

    /// Whether the process is currently quiesced.
    fn is_stopped(&self) -> bool;

    /// The process address space.
    fn vm(&self) -> &Mutex<VmSpace>;

    /// Copy of the signal-action table (refcount excluded).
    fn sigacts(&self) -> SigActionTable;

    /// Swap in a fresh signal-action table.
    fn set_sigacts(&self, table: SigActionTable);

    /// Per-thread state, in thread order.
    fn thread_states(&self) -> Vec<ThreadState>;

    /// Install thread state, spawning additional threads if the process
    /// has fewer than `threads.len()`.
    fn set_thread_states(&self, threads: Vec<ThreadState>) -> Result<()>;

    /// Copy of the descriptor table.
    fn fd_table(&self) -> FdTable;

    /// Replace the descriptor table.
    fn set_fd_table(&self, table: FdTable);

    /// Child processes, for recursive checkpoints.
    fn children(&self) -> Vec<Arc<dyn HostProcess>>;

    /// Terminate the process. Restore failures leave the host undefined
    /// and the orchestrator kills it.
    fn kill(&self);
}

/// User-space emulated process.
///
/// Carries a real [`VmSpace`] (shadow chains included), thread states,
/// signal disposition, and an fd table. Tests drive it directly:
/// `write_memory` dirties pages through the copy-on-write machinery
/// exactly as a faulting process would.
pub struct SimProcess {
    pid: u64,
    stopped: AtomicBool,
    killed: AtomicBool,
    vm: Mutex<VmSpace>,
    threads: Mutex<Vec<ThreadState>>,
    sigacts: Mutex<SigActionTable>,
    fds: Mutex<FdTable>,
    children: Mutex<Vec<Arc<SimProcess>>>,
}

impl SimProcess {
    /// A fresh process with one default thread and an empty address
    /// space.
    pub fn new(pid: u64) -> Arc<Self> {
        Arc::new(SimProcess {
            pid,
            stopped: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            vm: Mutex::new(VmSpace::new()),
            threads: Mutex::new(vec![ThreadState {
                tid: pid * 100,
                ..ThreadState::default()
            }]),
            sigacts: Mutex::new(SigActionTable::default()),
            fds: Mutex::new(FdTable::default()),
            children: Mutex::new(Vec::new()),
        })
    }

    /// Map an anonymous region.
    pub fn map(&self, start: u64, size: u64, protection: u32) -> Result<()> {
        self.vm.lock().map(start, size, protection)
    }

    /// Write process memory (as the running process would).
    pub fn write_memory(&self, vaddr: u64, bytes: &[u8]) -> Result<()> {
        self.vm.lock().write(vaddr, bytes)
    }

    /// Read process memory.
    pub fn read_memory(&self, vaddr: u64, buf: &mut [u8]) -> Result<()> {
        self.vm.lock().read(vaddr, buf)
    }

    /// Replace the emulated thread set.
    pub fn set_threads(&self, threads: Vec<ThreadState>) {
        *self.threads.lock() = threads;
    }

    /// Mutate one thread's state in place.
    pub fn with_thread<R>(&self, index: usize, f: impl FnOnce(&mut ThreadState) -> R) -> R {
        f(&mut self.threads.lock()[index])
    }

    /// Replace the signal table (as sigaction(2) would).
    pub fn set_signal_table(&self, table: SigActionTable) {
        *self.sigacts.lock() = table;
    }

    /// Mutate the fd table in place.
    pub fn with_fd_table<R>(&self, f: impl FnOnce(&mut FdTable) -> R) -> R {
        f(&mut self.fds.lock())
    }

    /// Register a child process.
    pub fn add_child(&self, child: Arc<SimProcess>) {
        self.children.lock().push(child);
    }

    /// Whether the process was killed.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

impl HostProcess for SimProcess {
    fn pid(&self) -> u64 {
        self.pid
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        debug!(target: "ckpt::orch", pid = self.pid, "process stopped");
    }

    fn resume(&self) {
        self.stopped.store(false, Ordering::SeqCst);
        debug!(target: "ckpt::orch", pid = self.pid, "process resumed");
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn vm(&self) -> &Mutex<VmSpace> {
        &self.vm
    }

    fn sigacts(&self) -> SigActionTable {
        self.sigacts.lock().clone()
    }

    fn set_sigacts(&self, table: SigActionTable) {
        // A fresh table is swapped in whole; the old one is dropped,
        // mirroring sigacts_alloc/sigacts_free on the original host.
        *self.sigacts.lock() = table;
    }

    fn thread_states(&self) -> Vec<ThreadState> {
        self.threads.lock().clone()
    }

    fn set_thread_states(&self, threads: Vec<ThreadState>) -> Result<()> {
        let mut cur = self.threads.lock();
        // Fan out: keep kernel-assigned ids for spawned threads.
        let base_tid = self.pid * 100;
        while cur.len() < threads.len() {
            let tid = base_tid + cur.len() as u64;
            cur.push(ThreadState {
                tid,
                ..ThreadState::default()
            });
        }
        cur.truncate(threads.len());
        for (slot, incoming) in cur.iter_mut().zip(threads.into_iter()) {
            let tid = slot.tid;
            *slot = incoming;
            slot.tid = tid;
            slot.needs_full_restore = true;
        }
        Ok(())
    }

    fn fd_table(&self) -> FdTable {
        self.fds.lock().clone()
    }

    fn set_fd_table(&self, table: FdTable) {
        *self.fds.lock() = table;
    }

    fn children(&self) -> Vec<Arc<dyn HostProcess>> {
        self.children
            .lock()
            .iter()
            .map(|c| Arc::clone(c) as Arc<dyn HostProcess>)
            .collect()
    }

    fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
        debug!(target: "ckpt::orch", pid = self.pid, "process killed");
    }
}
