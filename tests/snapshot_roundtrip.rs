//! Whole-process snapshot round trips: a process's memory, registers,
//! signal disposition, and fd table survive checkpoint + restore.

mod common;

use common::{filled_page, init_logging};
use cryo::{
    BackendTarget, CheckpointMode, Cryo, CryoConfig, FdEntry, FdKind, HostProcess, PartitionAttr,
    SimProcess, PAGE_SIZE,
};
use std::path::Path;

fn file_attr(dir: &Path, mode: CheckpointMode) -> PartitionAttr {
    PartitionAttr::new(
        BackendTarget::File {
            dir: dir.to_path_buf(),
        },
        mode,
    )
}

/// A process maps a single page, fills it with 0xAA, is checkpointed
/// (FULL, file backend) and killed; the restored process reads the fill
/// back.
#[test]
fn one_page_snapshot_roundtrip() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let cryo = Cryo::with_config(CryoConfig::for_testing());
    cryo.partadd(1, file_attr(dir.path(), CheckpointMode::Full))
        .unwrap();

    let proc = SimProcess::new(100);
    proc.map(0x10000, PAGE_SIZE as u64, cryo::prot::RW).unwrap();
    proc.write_memory(0x10000, &filled_page(0xaa)).unwrap();
    cryo.attach(1, proc.clone()).unwrap();

    let epoch = cryo.checkpoint(1, false).unwrap();
    assert_eq!(epoch, 1);

    // Kill the original; restore onto a fresh shell.
    proc.kill();
    let host = SimProcess::new(200);
    cryo.restore(1, &[host.clone()], false).unwrap();

    let mut buf = vec![0u8; PAGE_SIZE];
    host.read_memory(0x10000, &mut buf).unwrap();
    assert_eq!(buf, filled_page(0xaa));
}

/// Register files, FP state, fs base, signal disposition, and fd-table
/// entries all round-trip; thread fan-out recreates the thread count.
#[test]
fn multithread_state_roundtrip() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let cryo = Cryo::with_config(CryoConfig::for_testing());
    cryo.partadd(1, file_attr(dir.path(), CheckpointMode::Full))
        .unwrap();

    let proc = SimProcess::new(100);
    proc.map(0x10000, 8 * PAGE_SIZE as u64, cryo::prot::RW).unwrap();

    // Five threads, each with a distinct counter in rax, a memory
    // counter, and a distinct fs base and FP state.
    let threads: Vec<cryo::ThreadState> = (0..5u64)
        .map(|i| {
            let mut t = cryo::ThreadState {
                tid: 100 * 100 + i,
                fsbase: 0x7f00_0000 + i * 0x1000,
                sigmask: 1 << i,
                ..cryo::ThreadState::default()
            };
            t.regs.rax = 1000 + i;
            t.regs.rip = 0x40_0000 + i * 16;
            t.fpregs.0[0] = i as u8;
            t
        })
        .collect();
    proc.set_threads(threads.clone());
    for i in 0..5u64 {
        proc.write_memory(0x10000 + i * PAGE_SIZE as u64, &(7000 + i).to_le_bytes())
            .unwrap();
    }
    proc.with_fd_table(|t| {
        t.cdir = "/work".into();
        t.umask = 0o077;
        t.entries.push(FdEntry {
            fd: 5,
            kind: FdKind::File,
            flags: 0x441,
            offset: 8192,
            path: Some("/var/log/run.log".into()),
        });
    });
    let mut sigacts = proc.sigacts();
    sigacts.actions[10].handler = 0x40_2000;
    sigacts.actions[10].mask = 0xffff;
    proc.set_signal_table(sigacts.clone());

    cryo.attach(1, proc).unwrap();
    cryo.checkpoint(1, false).unwrap();

    let host = SimProcess::new(200);
    cryo.restore(1, &[host.clone()], false).unwrap();

    let restored = host.thread_states();
    assert_eq!(restored.len(), 5);
    for (i, t) in restored.iter().enumerate() {
        assert_eq!(t.regs.rax, 1000 + i as u64);
        assert_eq!(t.regs.rip, 0x40_0000 + i as u64 * 16);
        assert_eq!(t.fsbase, 0x7f00_0000 + i as u64 * 0x1000);
        assert_eq!(t.sigmask, 1 << i);
        assert_eq!(t.fpregs.0[0], i as u8);
        assert!(t.needs_full_restore);
    }
    for i in 0..5u64 {
        let mut buf = [0u8; 8];
        host.read_memory(0x10000 + i * PAGE_SIZE as u64, &mut buf).unwrap();
        assert_eq!(u64::from_le_bytes(buf), 7000 + i);
    }

    let fdt = host.fd_table();
    assert_eq!(fdt.cdir, "/work");
    assert_eq!(fdt.umask, 0o077);
    let e = fdt.entries.iter().find(|e| e.fd == 5).unwrap();
    assert_eq!(e.offset, 8192);
    assert_eq!(e.path.as_deref(), Some("/var/log/run.log"));

    assert_eq!(host.sigacts().actions[10].handler, 0x40_2000);
    assert_eq!(host.sigacts().actions[10].mask, 0xffff);
}

/// Checkpointing a process tree with `recurse` captures children, and
/// restore fans back out onto one host per process.
#[test]
fn recurse_checkpoints_process_tree() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let cryo = Cryo::with_config(CryoConfig::for_testing());
    cryo.partadd(1, file_attr(dir.path(), CheckpointMode::Full))
        .unwrap();

    let parent = SimProcess::new(100);
    parent.map(0x10000, PAGE_SIZE as u64, cryo::prot::RW).unwrap();
    parent.write_memory(0x10000, b"parent").unwrap();
    let child = SimProcess::new(101);
    child.map(0x20000, PAGE_SIZE as u64, cryo::prot::RW).unwrap();
    child.write_memory(0x20000, b"child!").unwrap();
    parent.add_child(child);

    cryo.attach(1, parent).unwrap();
    cryo.checkpoint(1, true).unwrap();

    let h1 = SimProcess::new(200);
    let h2 = SimProcess::new(201);
    cryo.restore(1, &[h1.clone(), h2.clone()], false).unwrap();

    let mut buf = [0u8; 6];
    h1.read_memory(0x10000, &mut buf).unwrap();
    assert_eq!(&buf, b"parent");
    h2.read_memory(0x20000, &mut buf).unwrap();
    assert_eq!(&buf, b"child!");
}

/// Two checkpoints at the same quiescent moment produce streams whose
/// bytes past the epoch-bearing dump header are identical, in both
/// modes' composition.
#[test]
fn idempotent_checkpoints_bitwise_equal() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let cryo = Cryo::with_config(CryoConfig::for_testing());
    cryo.partadd(1, file_attr(dir.path(), CheckpointMode::Full))
        .unwrap();

    let proc = SimProcess::new(100);
    proc.map(0x10000, 4 * PAGE_SIZE as u64, cryo::prot::RW).unwrap();
    proc.write_memory(0x10000, &filled_page(0x31)).unwrap();
    proc.write_memory(0x12000, &filled_page(0x32)).unwrap();
    cryo.attach(1, proc).unwrap();

    let e1 = cryo.checkpoint(1, false).unwrap();
    let e2 = cryo.checkpoint(1, false).unwrap();
    assert_eq!(e2, e1 + 1);

    let read = |epoch: u64| {
        std::fs::read(dir.path().join(format!("1-{:06}.ckpt", epoch))).unwrap()
    };
    let d1 = read(e1);
    let d2 = read(e2);
    // The dump header carries the epoch; everything after it is
    // bitwise identical.
    assert_eq!(d1[32..], d2[32..]);
}
