//! The `Cryo` facade

use cryo_backend::PoolConfig;
use cryo_core::{Epoch, Error, Oid, Result};
use cryo_engine::{
    orchestrator, BackendTarget, HostProcess, Partition, PartitionAttr, PartitionStats,
};
use cryo_store::{ObjectStore, StoreParams};
use cryo_wal::Wal;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct CryoConfig {
    /// Writer-pool sizing for store-backed partitions.
    pub pool: PoolConfig,
}

impl CryoConfig {
    /// Production defaults.
    pub fn new() -> Self {
        CryoConfig {
            pool: PoolConfig::new(),
        }
    }

    /// Small sizes for tests.
    pub fn for_testing() -> Self {
        CryoConfig {
            pool: PoolConfig::for_testing(),
        }
    }
}

impl Default for CryoConfig {
    fn default() -> Self {
        CryoConfig::new()
    }
}

/// The checkpoint engine's public handle.
///
/// Owns the partition table and the opened stores. All operations are
/// addressed by partition id (`oid`).
pub struct Cryo {
    parts: DashMap<u64, Arc<Partition>>,
    stores: Mutex<HashMap<PathBuf, Arc<ObjectStore>>>,
    config: CryoConfig,
}

impl Cryo {
    /// An engine with default configuration.
    pub fn new() -> Self {
        Cryo::with_config(CryoConfig::new())
    }

    /// An engine with explicit configuration.
    pub fn with_config(config: CryoConfig) -> Self {
        Cryo {
            parts: DashMap::new(),
            stores: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Format an object-store volume for use as a partition target.
    pub fn format_store(&self, path: &Path, params: &StoreParams) -> Result<()> {
        ObjectStore::format(path, params)
    }

    fn store_for(&self, path: &Path) -> Result<Arc<ObjectStore>> {
        let mut stores = self.stores.lock();
        if let Some(s) = stores.get(path) {
            return Ok(Arc::clone(s));
        }
        if !path.exists() {
            return Err(Error::invalid_argument(format!(
                "no store volume at {} (format it first)",
                path.display()
            )));
        }
        let store = Arc::new(ObjectStore::open(path)?);
        stores.insert(path.to_path_buf(), Arc::clone(&store));
        Ok(store)
    }

    fn part(&self, oid: u64) -> Result<Arc<Partition>> {
        self.parts
            .get(&oid)
            .map(|p| Arc::clone(&p))
            .ok_or(Error::NoSuchPartition(Oid(oid)))
    }

    /// Create a partition.
    pub fn partadd(&self, oid: u64, attr: PartitionAttr) -> Result<()> {
        if self.parts.contains_key(&oid) {
            return Err(Error::invalid_argument(format!(
                "partition {} already exists",
                oid
            )));
        }
        let store = match &attr.target {
            BackendTarget::Store { path } => Some(self.store_for(path)?),
            _ => None,
        };
        let period_ms = attr.period_ms;
        let part = Partition::create(Oid(oid), attr, store, &self.config.pool)?;
        if period_ms != 0 {
            orchestrator::arm_periodic(&part, Duration::from_millis(period_ms));
        }
        self.parts.insert(oid, part);
        Ok(())
    }

    /// Destroy a partition. Periodic mode is stopped first; an in-flight
    /// checkpoint finishes (or fails) before teardown.
    pub fn partdel(&self, oid: u64) -> Result<()> {
        let (_, part) = self
            .parts
            .remove(&oid)
            .ok_or(Error::NoSuchPartition(Oid(oid)))?;
        orchestrator::disarm_periodic(&part);
        part.destroy()?;
        info!(target: "ckpt::orch", oid, "partition deleted");
        Ok(())
    }

    /// Register a process with a partition.
    pub fn attach(&self, oid: u64, proc: Arc<dyn HostProcess>) -> Result<()> {
        self.part(oid)?.attach(proc)
    }

    /// Deregister a process.
    pub fn detach(&self, oid: u64, pid: u64) -> Result<()> {
        self.part(oid)?.detach(pid)
    }

    /// One-shot checkpoint; returns the committed epoch. Rejected while
    /// periodic mode is armed.
    pub fn checkpoint(&self, oid: u64, recurse: bool) -> Result<Epoch> {
        orchestrator::checkpoint(&*self.part(oid)?, recurse)
    }

    /// Snapshot the single region containing `addr`; returns the epoch
    /// assigned to the snapshot.
    pub fn memsnap(&self, oid: u64, addr: u64) -> Result<Epoch> {
        orchestrator::memsnap(&*self.part(oid)?, addr)
    }

    /// Re-instantiate the stored process set onto `hosts`, one per
    /// stored process. Hosts are left stopped when `rest_stopped`.
    pub fn restore<H: HostProcess + 'static>(
        &self,
        oid: u64,
        hosts: &[Arc<H>],
        rest_stopped: bool,
    ) -> Result<()> {
        let hosts: Vec<Arc<dyn HostProcess>> = hosts
            .iter()
            .map(|h| Arc::clone(h) as Arc<dyn HostProcess>)
            .collect();
        orchestrator::restore(&*self.part(oid)?, &hosts, rest_stopped)
    }

    /// Whether `epoch` (and all earlier epochs) committed.
    pub fn epochdone(&self, oid: u64, epoch: Epoch) -> Result<bool> {
        Ok(self.part(oid)?.gate().done(epoch))
    }

    /// Block until `epoch` commits.
    pub fn untilepoch(&self, oid: u64, epoch: Epoch) -> Result<()> {
        let part = self.part(oid)?;
        part.gate().wait(epoch);
        Ok(())
    }

    /// Current attributes.
    pub fn getattr(&self, oid: u64) -> Result<PartitionAttr> {
        Ok(self.part(oid)?.attr())
    }

    /// Reconfigure a partition. Changing the period arms or disarms the
    /// periodic scheduler; the target cannot change.
    pub fn setattr(&self, oid: u64, attr: PartitionAttr) -> Result<()> {
        attr.validate()?;
        let part = self.part(oid)?;
        {
            let cur = part.attr();
            let same_target = matches!(
                (&cur.target, &attr.target),
                (BackendTarget::File { .. }, BackendTarget::File { .. })
                    | (BackendTarget::Pm { .. }, BackendTarget::Pm { .. })
                    | (BackendTarget::Store { .. }, BackendTarget::Store { .. })
            );
            if !same_target {
                return Err(Error::invalid_argument(
                    "partition target cannot be changed",
                ));
            }
        }
        let period_ms = attr.period_ms;
        part.set_attr(attr);

        orchestrator::disarm_periodic(&part);
        if period_ms != 0 {
            orchestrator::arm_periodic(&part, Duration::from_millis(period_ms));
        }
        Ok(())
    }

    /// Duplicate an open descriptor of an attached process into a
    /// checkpoint-capable replica; returns the new descriptor number.
    pub fn ffork(&self, oid: u64, pid: u64, fd: u32) -> Result<u32> {
        let part = self.part(oid)?;
        let procs = part.processes(false);
        let proc = procs
            .iter()
            .find(|p| p.pid() == pid)
            .ok_or_else(|| Error::invalid_argument(format!("pid {} not attached", pid)))?;
        let mut table = proc.fd_table();
        let new_fd = table
            .dup(fd)
            .ok_or_else(|| Error::invalid_argument(format!("fd {} not open", fd)))?;
        proc.set_fd_table(table);
        Ok(new_fd)
    }

    /// Runtime statistics.
    pub fn stat(&self, oid: u64) -> Result<PartitionStats> {
        Ok(self.part(oid)?.stats())
    }

    /// Block until the next epoch boundary; returns the new epoch.
    pub fn barrier(&self, oid: u64) -> Result<Epoch> {
        let part = self.part(oid)?;
        let next = part.gate().current() + 1;
        part.gate().wait(next);
        Ok(next)
    }

    /// Open (or recover) a write-ahead log bound to a partition id.
    pub fn wal_open(&self, path: &Path, oid: u64, size: u64) -> Result<Wal> {
        Wal::open(path, oid, size)
    }
}

impl Default for Cryo {
    fn default() -> Self {
        Cryo::new()
    }
}

impl Drop for Cryo {
    fn drop(&mut self) {
        for entry in self.parts.iter() {
            orchestrator::disarm_periodic(&entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryo_core::CheckpointMode;
    use cryo_engine::SimProcess;
    use cryo_engine::prot;
    use cryo_core::PAGE_SIZE;
    use tempfile::tempdir;

    fn file_attr(dir: &Path) -> PartitionAttr {
        PartitionAttr::new(
            BackendTarget::File {
                dir: dir.to_path_buf(),
            },
            CheckpointMode::Full,
        )
    }

    #[test]
    fn test_partadd_dup_rejected() {
        let dir = tempdir().unwrap();
        let cryo = Cryo::with_config(CryoConfig::for_testing());
        cryo.partadd(1, file_attr(dir.path())).unwrap();
        assert!(cryo.partadd(1, file_attr(dir.path())).is_err());
    }

    #[test]
    fn test_unknown_oid() {
        let cryo = Cryo::with_config(CryoConfig::for_testing());
        assert!(matches!(
            cryo.checkpoint(42, false),
            Err(Error::NoSuchPartition(_))
        ));
        assert!(cryo.stat(42).is_err());
        assert!(cryo.partdel(42).is_err());
    }

    #[test]
    fn test_checkpoint_and_stats() {
        let dir = tempdir().unwrap();
        let cryo = Cryo::with_config(CryoConfig::for_testing());
        cryo.partadd(1, file_attr(dir.path())).unwrap();

        let p = SimProcess::new(7);
        p.map(0x10000, PAGE_SIZE as u64, prot::RW).unwrap();
        p.write_memory(0x10000, &[9u8; 16]).unwrap();
        cryo.attach(1, p).unwrap();

        let e = cryo.checkpoint(1, false).unwrap();
        assert_eq!(e, 1);
        assert!(cryo.epochdone(1, 1).unwrap());
        assert!(!cryo.epochdone(1, 2).unwrap());
        cryo.untilepoch(1, 1).unwrap();

        let stats = cryo.stat(1).unwrap();
        assert_eq!(stats.done, 1);
        assert_eq!(stats.pages_written, 1);
        assert_eq!(stats.attached, 1);
    }

    #[test]
    fn test_setattr_period_arms_and_disarms() {
        let dir = tempdir().unwrap();
        let cryo = Cryo::with_config(CryoConfig::for_testing());
        cryo.partadd(1, file_attr(dir.path())).unwrap();
        let p = SimProcess::new(7);
        p.map(0x10000, PAGE_SIZE as u64, prot::RW).unwrap();
        cryo.attach(1, p).unwrap();

        cryo.setattr(1, file_attr(dir.path()).with_period_ms(15)).unwrap();
        assert!(cryo.checkpoint(1, false).is_err());
        std::thread::sleep(std::time::Duration::from_millis(100));

        cryo.setattr(1, file_attr(dir.path())).unwrap();
        assert!(cryo.stat(1).unwrap().done >= 1);
        cryo.checkpoint(1, false).unwrap();
    }

    #[test]
    fn test_setattr_target_change_rejected() {
        let dir = tempdir().unwrap();
        let cryo = Cryo::with_config(CryoConfig::for_testing());
        cryo.partadd(1, file_attr(dir.path())).unwrap();
        let pm_attr = PartitionAttr::new(
            BackendTarget::Pm { size: 1 << 20 },
            CheckpointMode::Full,
        );
        assert!(cryo.setattr(1, pm_attr).is_err());
    }

    #[test]
    fn test_ffork() {
        let dir = tempdir().unwrap();
        let cryo = Cryo::with_config(CryoConfig::for_testing());
        cryo.partadd(1, file_attr(dir.path())).unwrap();
        let p = SimProcess::new(7);
        p.with_fd_table(|t| {
            t.entries.push(cryo_engine::FdEntry {
                fd: 3,
                kind: cryo_engine::FdKind::File,
                flags: 0,
                offset: 128,
                path: Some("/tmp/log".into()),
            })
        });
        cryo.attach(1, p.clone()).unwrap();

        let new_fd = cryo.ffork(1, 7, 3).unwrap();
        assert_eq!(new_fd, 0);
        assert!(cryo.ffork(1, 7, 99).is_err());
        assert!(cryo.ffork(1, 8, 3).is_err());
        assert_eq!(p.fd_table().entries.len(), 2);
    }

    #[test]
    fn test_store_target_requires_formatted_volume() {
        let dir = tempdir().unwrap();
        let cryo = Cryo::with_config(CryoConfig::for_testing());
        let attr = PartitionAttr::new(
            BackendTarget::Store {
                path: dir.path().join("missing"),
            },
            CheckpointMode::Full,
        );
        assert!(cryo.partadd(1, attr).is_err());
    }
}
