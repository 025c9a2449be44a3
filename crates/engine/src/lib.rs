//! Checkpoint/restore engine
//!
//! The capture/restore core: the VM object model with copy-on-write
//! shadow chains, the host-process seam and its user-space emulation,
//! process-state capture/restore, the magic-tagged snapshot descriptor
//! stream, partitions with epoch gates, and the checkpoint orchestrator.

#![warn(clippy::all)]

pub mod capture;
pub mod cpu;
pub mod descriptor;
pub mod host;
pub mod orchestrator;
pub mod partition;
pub mod restore;
pub mod streamer;
pub mod vm;

pub use capture::{capture_vmspace, release_captured, CapturedRegion};
pub use cpu::{
    FdEntry, FdKind, FdTable, FpRegs, GeneralRegs, SigAction, SigActionTable, ThreadState,
};
pub use descriptor::{ProcSnapshot, RegionInfo, SnapshotDescriptor, VmSpaceInfo};
pub use host::{HostProcess, SimProcess};
pub use orchestrator::{
    arm_periodic, checkpoint, checkpoint_internal, disarm_periodic, memsnap, restore,
};
pub use partition::{
    manifest_ino, mem_ino, BackendTarget, EpochGate, Partition, PartitionAttr, PartitionStats,
};
pub use restore::restore_vmspace;
pub use vm::{eflag, prot, VmObject, VmRegion, VmSpace};
