//! Concurrent page-writer pool
//!
//! A fixed set of worker threads, each owning a queue of `(vaddr, page)`
//! units, a condition variable, a cursor into the backend's address space,
//! and a running counter. Producers enqueue under the queue mutex and
//! signal; workers block until a unit arrives, write the vaddr tag
//! followed by the page bytes at their cursor, and advance.
//!
//! Ordering: units within a single worker are written FIFO; across
//! workers no order is guaranteed, which is why every unit is tagged with
//! its virtual address: readers reconstruct by vaddr, never by position.
//!
//! Failure policy: a write or page-map failure is logged and the unit
//! dropped; the worker keeps draining so the pool stays alive for
//! subsequent commits.

use crate::pm::PmRegion;
use cryo_core::{Error, Limits, Result, PAGE_SIZE};
use cryo_store::ObjectStore;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Bytes one unit occupies on a striped backend: the vaddr tag plus the
/// page itself.
pub const PAGE_UNIT_SIZE: u64 = 8 + PAGE_SIZE as u64;

/// One queued page.
pub struct PageUnit {
    /// Virtual address of the page in the captured process.
    pub vaddr: u64,
    /// The page payload.
    pub page: Box<[u8]>,
    /// Owning container of the saved page: the page inode on store
    /// sinks. Cursor-addressed sinks ignore it.
    pub ino: u64,
}

/// Destination of the pool's writes.
pub trait PageSink: Send + Sync {
    /// Write one unit at the worker's cursor. Returns how far the cursor
    /// advances (0 for sinks that address by vaddr instead of cursor).
    fn write_unit(&self, cursor: u64, unit: &PageUnit) -> Result<u64>;
}

/// Sink striping units across a persistent-memory region.
pub struct PmPageSink {
    /// The target region.
    pub region: Arc<PmRegion>,
}

impl PageSink for PmPageSink {
    fn write_unit(&self, cursor: u64, unit: &PageUnit) -> Result<u64> {
        self.region.write_at(cursor, &unit.vaddr.to_le_bytes())?;
        self.region.write_at(cursor + 8, &unit.page)?;
        Ok(8 + unit.page.len() as u64)
    }
}

/// Sink writing pages into store page inodes, keyed by virtual address
/// within each unit's owning inode.
pub struct StorePageSink {
    /// The target store.
    pub store: Arc<ObjectStore>,
}

impl PageSink for StorePageSink {
    fn write_unit(&self, _cursor: u64, unit: &PageUnit) -> Result<u64> {
        self.store.write_record(unit.ino, unit.vaddr, &unit.page)?;
        Ok(0)
    }
}

/// Pool sizing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Per-worker queue capacity.
    pub queue_cap: usize,
}

impl PoolConfig {
    /// The production default: 8 workers.
    pub fn new() -> Self {
        PoolConfig {
            workers: 8,
            queue_cap: Limits::WORKER_QUEUE_CAP,
        }
    }

    /// A small pool for tests.
    pub fn for_testing() -> Self {
        PoolConfig {
            workers: 2,
            queue_cap: 1024,
        }
    }

    /// Override the worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig::new()
    }
}

struct WorkerState {
    queue: VecDeque<PageUnit>,
    busy: bool,
}

struct WorkerShared {
    state: Mutex<WorkerState>,
    cv: Condvar,
    written: AtomicU64,
    dropped: AtomicU64,
}

/// The running pool.
pub struct WriterPool {
    shared: Vec<Arc<WorkerShared>>,
    handles: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    queue_cap: usize,
}

impl WriterPool {
    /// Start the pool. `cursors` gives each worker its initial write
    /// cursor (one per worker); striped backends space workers equally
    /// across their address space.
    pub fn start(config: &PoolConfig, sink: Arc<dyn PageSink>, cursors: Vec<u64>) -> Self {
        assert_eq!(cursors.len(), config.workers);
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut shared = Vec::with_capacity(config.workers);
        let mut handles = Vec::with_capacity(config.workers);

        for (id, start_cursor) in cursors.into_iter().enumerate() {
            let ws = Arc::new(WorkerShared {
                state: Mutex::new(WorkerState {
                    queue: VecDeque::new(),
                    busy: false,
                }),
                cv: Condvar::new(),
                written: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            });
            shared.push(Arc::clone(&ws));

            let sink = Arc::clone(&sink);
            let shutdown = Arc::clone(&shutdown);
            handles.push(std::thread::spawn(move || {
                worker_loop(id, ws, sink, shutdown, start_cursor);
            }));
        }

        WriterPool {
            shared,
            handles,
            shutdown,
            queue_cap: config.queue_cap,
        }
    }

    /// Number of workers.
    pub fn worker_count(&self) -> usize {
        self.shared.len()
    }

    /// Enqueue a unit on a specific worker's queue.
    pub fn enqueue(&self, worker: usize, unit: PageUnit) -> Result<()> {
        let ws = &self.shared[worker % self.shared.len()];
        let mut st = ws.state.lock();
        if st.queue.len() >= self.queue_cap {
            return Err(Error::exhausted(format!(
                "worker {} queue full ({} units)",
                worker, self.queue_cap
            )));
        }
        st.queue.push_back(unit);
        ws.cv.notify_all();
        Ok(())
    }

    /// Block until every queue is empty and every worker idle.
    pub fn drain(&self) {
        for ws in &self.shared {
            let mut st = ws.state.lock();
            while !st.queue.is_empty() || st.busy {
                ws.cv.wait(&mut st);
            }
        }
    }

    /// Total units written since start.
    pub fn pages_written(&self) -> u64 {
        self.shared
            .iter()
            .map(|w| w.written.load(Ordering::Relaxed))
            .sum()
    }

    /// Total units dropped on write failure.
    pub fn units_dropped(&self) -> u64 {
        self.shared
            .iter()
            .map(|w| w.dropped.load(Ordering::Relaxed))
            .sum()
    }

    /// Stop the workers: set the flag, wake everyone, join after the
    /// queues drain.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for ws in &self.shared {
            ws.cv.notify_all();
        }
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
    }
}

impl Drop for WriterPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    id: usize,
    ws: Arc<WorkerShared>,
    sink: Arc<dyn PageSink>,
    shutdown: Arc<AtomicBool>,
    mut cursor: u64,
) {
    debug!(target: "ckpt::pool", worker = id, cursor, "worker started");
    loop {
        let unit = {
            let mut st = ws.state.lock();
            loop {
                if let Some(u) = st.queue.pop_front() {
                    st.busy = true;
                    break Some(u);
                }
                if shutdown.load(Ordering::SeqCst) {
                    break None;
                }
                ws.cv.wait(&mut st);
            }
        };

        let Some(unit) = unit else { break };

        match sink.write_unit(cursor, &unit) {
            Ok(advance) => {
                cursor += advance;
                ws.written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                // Dropped, not propagated: the pool stays alive for the
                // next commit.
                warn!(
                    target: "ckpt::pool",
                    worker = id,
                    vaddr = format_args!("{:#x}", unit.vaddr),
                    error = %e,
                    "unit dropped"
                );
                ws.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }

        let mut st = ws.state.lock();
        st.busy = false;
        ws.cv.notify_all();
    }
    debug!(target: "ckpt::pool", worker = id, "worker exiting");
}

/// Evenly spaced stripe cursors for `workers` workers over a region of
/// `capacity` bytes starting at `base`.
pub fn striped_cursors(base: u64, capacity: u64, workers: usize) -> Vec<u64> {
    let stripe = capacity / workers as u64;
    (0..workers as u64).map(|i| base + i * stripe).collect()
}
