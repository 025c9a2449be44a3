//! Partitions: checkpoint containers and their epoch gates
//!
//! A partition binds an oid to a backend target, a snapshot mode, an
//! optional period, and the set of attached processes. It owns the
//! partition-side epoch counter; `untilepoch`/`barrier` block on its
//! [`EpochGate`]. Store-backed partitions additionally own their writer
//! pool, started at creation and alive across commits.

use crate::host::HostProcess;
use crate::streamer;
use cryo_backend::{PmRegion, PoolConfig, StorePageSink, WriterPool};
use cryo_core::{CheckpointMode, Epoch, Error, Oid, Result};
use cryo_store::{ObjectStore, RecordType};
use parking_lot::{Condvar, Mutex};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Top bit marking partition-owned inode numbers, keeping them clear of
/// the store's fixed inodes (root directory).
const PARTITION_INO_FLAG: u64 = 1 << 63;

/// Largest usable partition id (a 32-bit inode sub-space is derived per
/// oid: the manifest plus one page inode per captured process).
pub const MAX_OID: u64 = (1 << 31) - 1;

/// Inode holding a partition's snapshot descriptor.
pub fn manifest_ino(oid: Oid) -> u64 {
    PARTITION_INO_FLAG | (oid.as_u64() << 32)
}

/// Inode holding the saved pages of the partition's `proc`-th captured
/// process, keyed by virtual address.
pub fn mem_ino(oid: Oid, proc: u32) -> u64 {
    PARTITION_INO_FLAG | (oid.as_u64() << 32) | (proc as u64 + 1)
}

/// Where a partition's checkpoints land.
#[derive(Debug, Clone)]
pub enum BackendTarget {
    /// One dump file per epoch under `dir`.
    File {
        /// Dump directory.
        dir: PathBuf,
    },
    /// Appended dump segments in a persistent-memory region.
    Pm {
        /// Region capacity in bytes.
        size: u64,
    },
    /// Manifest + page inodes on an object store.
    Store {
        /// Path of the formatted store volume.
        path: PathBuf,
    },
}

/// Partition attributes, set at `partadd` and adjusted via `setattr`.
#[derive(Debug, Clone)]
pub struct PartitionAttr {
    /// Backend target.
    pub target: BackendTarget,
    /// Snapshot mode.
    pub mode: CheckpointMode,
    /// Checkpoint period in milliseconds; 0 means on-demand only.
    pub period_ms: u64,
    /// Free-form flags.
    pub flags: u64,
    /// Write-amplification factor for stress runs (≥ 1).
    pub amplification: u64,
}

impl PartitionAttr {
    /// On-demand attributes for a target and mode.
    pub fn new(target: BackendTarget, mode: CheckpointMode) -> Self {
        PartitionAttr {
            target,
            mode,
            period_ms: 0,
            flags: 0,
            amplification: 1,
        }
    }

    /// Arm periodic checkpointing.
    pub fn with_period_ms(mut self, period_ms: u64) -> Self {
        self.period_ms = period_ms;
        self
    }

    /// Set the amplification factor.
    pub fn with_amplification(mut self, amplification: u64) -> Self {
        self.amplification = amplification;
        self
    }

    /// Validate at the API boundary.
    pub fn validate(&self) -> Result<()> {
        if self.amplification == 0 {
            return Err(Error::invalid_argument("amplification must be at least 1"));
        }
        if let BackendTarget::Pm { size } = self.target {
            if size == 0 {
                return Err(Error::invalid_argument("pm region size must be non-zero"));
            }
        }
        Ok(())
    }
}

/// Runtime statistics surfaced by `stat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionStats {
    /// Partition id.
    pub oid: u64,
    /// Last committed epoch.
    pub epoch: Epoch,
    /// Attached processes.
    pub attached: usize,
    /// Checkpoints attempted.
    pub attempted: u64,
    /// Checkpoints committed.
    pub done: u64,
    /// Pages persisted over the partition's lifetime.
    pub pages_written: u64,
    /// Units dropped by the writer pool.
    pub pages_dropped: u64,
    /// Whether periodic mode is armed.
    pub periodic_armed: bool,
}

/// The per-partition committed-epoch gate.
pub struct EpochGate {
    epoch: Mutex<Epoch>,
    cv: Condvar,
}

impl EpochGate {
    /// A gate starting at `epoch`.
    pub fn new(epoch: Epoch) -> Self {
        EpochGate {
            epoch: Mutex::new(epoch),
            cv: Condvar::new(),
        }
    }

    /// Last committed epoch.
    pub fn current(&self) -> Epoch {
        *self.epoch.lock()
    }

    /// Whether `epoch` (and all earlier epochs) committed.
    pub fn done(&self, epoch: Epoch) -> bool {
        *self.epoch.lock() >= epoch
    }

    /// Publish a committed epoch and wake waiters.
    pub fn advance_to(&self, epoch: Epoch) {
        let mut g = self.epoch.lock();
        debug_assert!(epoch >= *g, "epochs are monotone");
        *g = epoch;
        self.cv.notify_all();
    }

    /// Block until the committed epoch reaches `epoch`.
    pub fn wait(&self, epoch: Epoch) {
        let mut g = self.epoch.lock();
        while *g < epoch {
            self.cv.wait(&mut g);
        }
    }
}

/// Periodic-checkpoint scheduler handle.
pub struct PeriodicHandle {
    pub(crate) stop: Arc<(Mutex<bool>, Condvar)>,
    pub(crate) thread: Option<std::thread::JoinHandle<()>>,
}

impl PeriodicHandle {
    /// Stop further ticks; an already-running tick completes first.
    pub fn disarm(mut self) {
        {
            let (lock, cv) = &*self.stop;
            *lock.lock() = true;
            cv.notify_all();
        }
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

/// One checkpoint partition.
pub struct Partition {
    pub(crate) oid: Oid,
    pub(crate) attr: Mutex<PartitionAttr>,
    pub(crate) procs: Mutex<Vec<Arc<dyn HostProcess>>>,
    pub(crate) gate: EpochGate,
    /// The backing store for store targets.
    pub(crate) store: Option<Arc<ObjectStore>>,
    /// The region for PM targets.
    pub(crate) pm: Option<Arc<PmRegion>>,
    /// Append offset of the next PM dump segment.
    pub(crate) pm_cursor: Mutex<u64>,
    /// Long-lived writer pool (store targets).
    pub(crate) pool: Option<WriterPool>,
    /// Serializes checkpoints; `partdel` waits on it for the in-flight
    /// commit.
    pub(crate) ckpt_lock: Mutex<()>,
    pub(crate) periodic: Mutex<Option<PeriodicHandle>>,
    pub(crate) attempted: AtomicU64,
    pub(crate) done: AtomicU64,
    pub(crate) inline_pages: AtomicU64,
}

impl Partition {
    /// Create a partition. For store targets the caller supplies the
    /// opened store; the partition creates its inodes, registers itself
    /// in the store's root directory, and starts its writer pool.
    pub fn create(
        oid: Oid,
        attr: PartitionAttr,
        store: Option<Arc<ObjectStore>>,
        pool_config: &PoolConfig,
    ) -> Result<Arc<Self>> {
        attr.validate()?;
        if oid.as_u64() > MAX_OID {
            return Err(Error::invalid_argument(format!(
                "oid {} out of range",
                oid
            )));
        }

        let mut pm = None;
        let mut pool = None;
        let mut initial_epoch = 0;

        match &attr.target {
            BackendTarget::File { dir } => {
                std::fs::create_dir_all(dir)?;
                // Resume the epoch sequence if dumps already exist.
                initial_epoch = streamer::list_dump_epochs(dir, oid.as_u64())?
                    .last()
                    .copied()
                    .unwrap_or(0);
            }
            BackendTarget::Pm { size } => {
                pm = Some(Arc::new(PmRegion::new(*size)));
            }
            BackendTarget::Store { .. } => {
                let store = store
                    .as_ref()
                    .ok_or_else(|| Error::invalid_argument("store target without a store"))?;
                // Saved pages become one-block extents keyed by vaddr;
                // that addressing only works when blocks are page-sized.
                if store.block_size() as usize != cryo_core::PAGE_SIZE {
                    return Err(Error::invalid_argument(format!(
                        "store block size {} does not match the page size",
                        store.block_size()
                    )));
                }
                if !store.inode_exists(manifest_ino(oid))? {
                    store.create_inode(manifest_ino(oid), RecordType::Manifest, 0o600)?;
                    store.dir_add(&format!("p{}", oid), RecordType::Manifest, manifest_ino(oid))?;
                }
                initial_epoch = store.epoch();
                pool = Some(WriterPool::start(
                    pool_config,
                    Arc::new(StorePageSink {
                        store: Arc::clone(store),
                    }),
                    vec![0; pool_config.workers],
                ));
            }
        }

        info!(target: "ckpt::orch", oid = %oid, mode = ?attr.mode, "partition created");
        Ok(Arc::new(Partition {
            oid,
            attr: Mutex::new(attr),
            procs: Mutex::new(Vec::new()),
            gate: EpochGate::new(initial_epoch),
            store,
            pm,
            pm_cursor: Mutex::new(0),
            pool,
            ckpt_lock: Mutex::new(()),
            periodic: Mutex::new(None),
            attempted: AtomicU64::new(0),
            done: AtomicU64::new(0),
            inline_pages: AtomicU64::new(0),
        }))
    }

    /// Partition id.
    pub fn oid(&self) -> Oid {
        self.oid
    }

    /// Copy of the current attributes.
    pub fn attr(&self) -> PartitionAttr {
        self.attr.lock().clone()
    }

    /// Replace the attributes (the caller re-arms periodic mode as
    /// needed).
    pub fn set_attr(&self, attr: PartitionAttr) {
        *self.attr.lock() = attr;
    }

    /// The epoch gate.
    pub fn gate(&self) -> &EpochGate {
        &self.gate
    }

    /// Register a process with the partition.
    pub fn attach(&self, proc: Arc<dyn HostProcess>) -> Result<()> {
        let mut procs = self.procs.lock();
        if procs.iter().any(|p| p.pid() == proc.pid()) {
            return Err(Error::invalid_argument(format!(
                "pid {} already attached",
                proc.pid()
            )));
        }
        procs.push(proc);
        Ok(())
    }

    /// Deregister a process.
    pub fn detach(&self, pid: u64) -> Result<()> {
        let mut procs = self.procs.lock();
        let before = procs.len();
        procs.retain(|p| p.pid() != pid);
        if procs.len() == before {
            return Err(Error::invalid_argument(format!("pid {} not attached", pid)));
        }
        Ok(())
    }

    /// Attached processes, optionally including their descendants.
    pub fn processes(&self, recurse: bool) -> Vec<Arc<dyn HostProcess>> {
        let mut out: Vec<Arc<dyn HostProcess>> = self.procs.lock().clone();
        if recurse {
            let mut i = 0;
            while i < out.len() {
                let children = out[i].children();
                for c in children {
                    if !out.iter().any(|p| p.pid() == c.pid()) {
                        out.push(c);
                    }
                }
                i += 1;
            }
        }
        out
    }

    /// Whether periodic mode is armed.
    pub fn periodic_armed(&self) -> bool {
        self.periodic.lock().is_some()
    }

    /// Runtime statistics.
    pub fn stats(&self) -> PartitionStats {
        let pool_written = self.pool.as_ref().map_or(0, |p| p.pages_written());
        let pool_dropped = self.pool.as_ref().map_or(0, |p| p.units_dropped());
        PartitionStats {
            oid: self.oid.as_u64(),
            epoch: self.gate.current(),
            attached: self.procs.lock().len(),
            attempted: self.attempted.load(Ordering::Relaxed),
            done: self.done.load(Ordering::Relaxed),
            pages_written: self.inline_pages.load(Ordering::Relaxed) + pool_written,
            pages_dropped: pool_dropped,
            periodic_armed: self.periodic_armed(),
        }
    }

    /// Tear down backend-side state (store inodes, directory entry).
    /// Called by `partdel` after periodic mode is disarmed and the
    /// in-flight checkpoint finished.
    pub fn destroy(&self) -> Result<()> {
        let _g = self.ckpt_lock.lock();
        if let Some(store) = &self.store {
            let _serial = store.begin_checkpoint();
            if store.inode_exists(manifest_ino(self.oid))? {
                store.remove_inode(manifest_ino(self.oid))?;
                let mut proc = 0u32;
                while store.inode_exists(mem_ino(self.oid, proc))? {
                    store.remove_inode(mem_ino(self.oid, proc))?;
                    proc += 1;
                }
                store.dir_remove(&format!("p{}", self.oid))?;
                store.commit()?;
            }
        }
        info!(target: "ckpt::orch", oid = %self.oid, "partition destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::SimProcess;

    #[test]
    fn test_ino_derivation() {
        assert_ne!(manifest_ino(Oid(1)), mem_ino(Oid(1), 0));
        assert_ne!(mem_ino(Oid(1), 0), mem_ino(Oid(1), 1));
        assert_ne!(mem_ino(Oid(1), 0), mem_ino(Oid(2), 0));
        assert_ne!(manifest_ino(Oid(1)), manifest_ino(Oid(2)));
        assert!(manifest_ino(Oid(0)) & PARTITION_INO_FLAG != 0);
        assert_ne!(manifest_ino(Oid(50_000)), cryo_store::ROOT_DIR_INODE);
    }

    #[test]
    fn test_attr_validation() {
        let attr = PartitionAttr::new(
            BackendTarget::Pm { size: 0 },
            CheckpointMode::Full,
        );
        assert!(attr.validate().is_err());

        let attr = PartitionAttr::new(
            BackendTarget::Pm { size: 1 << 20 },
            CheckpointMode::Full,
        )
        .with_amplification(0);
        assert!(attr.validate().is_err());
    }

    #[test]
    fn test_epoch_gate() {
        let gate = EpochGate::new(0);
        assert!(gate.done(0));
        assert!(!gate.done(1));
        gate.advance_to(3);
        assert!(gate.done(1));
        assert!(gate.done(3));
        assert_eq!(gate.current(), 3);
        gate.wait(2); // returns immediately
    }

    #[test]
    fn test_attach_detach() {
        let dir = tempfile::tempdir().unwrap();
        let part = Partition::create(
            Oid(1),
            PartitionAttr::new(
                BackendTarget::File {
                    dir: dir.path().to_path_buf(),
                },
                CheckpointMode::Full,
            ),
            None,
            &PoolConfig::for_testing(),
        )
        .unwrap();

        let p = SimProcess::new(10);
        part.attach(p.clone()).unwrap();
        assert!(part.attach(p).is_err());
        assert_eq!(part.stats().attached, 1);
        part.detach(10).unwrap();
        assert!(part.detach(10).is_err());
    }

    #[test]
    fn test_recurse_includes_children() {
        let dir = tempfile::tempdir().unwrap();
        let part = Partition::create(
            Oid(2),
            PartitionAttr::new(
                BackendTarget::File {
                    dir: dir.path().to_path_buf(),
                },
                CheckpointMode::Full,
            ),
            None,
            &PoolConfig::for_testing(),
        )
        .unwrap();

        let parent = SimProcess::new(1);
        parent.add_child(SimProcess::new(2));
        part.attach(parent).unwrap();

        assert_eq!(part.processes(false).len(), 1);
        let pids: Vec<u64> = part.processes(true).iter().map(|p| p.pid()).collect();
        assert_eq!(pids, vec![1, 2]);
    }
}
