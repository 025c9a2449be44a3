//! Process and thread state: register files, signal disposition, fd table
//!
//! Capture copies these out of a stopped process; restore bit-copies them
//! into a fresh host. The signal-action table deliberately excludes the
//! kernel's reference count: restore allocates a fresh table and swaps it
//! in. Thread ids are recorded but never forced on restore; the new
//! threads keep their kernel-assigned ids.

use cryo_core::Limits;

/// General-purpose register file (amd64 layout).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GeneralRegs {
    /// rax
    pub rax: u64,
    /// rbx
    pub rbx: u64,
    /// rcx
    pub rcx: u64,
    /// rdx
    pub rdx: u64,
    /// rsi
    pub rsi: u64,
    /// rdi
    pub rdi: u64,
    /// rbp
    pub rbp: u64,
    /// rsp
    pub rsp: u64,
    /// r8
    pub r8: u64,
    /// r9
    pub r9: u64,
    /// r10
    pub r10: u64,
    /// r11
    pub r11: u64,
    /// r12
    pub r12: u64,
    /// r13
    pub r13: u64,
    /// r14
    pub r14: u64,
    /// r15
    pub r15: u64,
    /// Instruction pointer.
    pub rip: u64,
    /// Flags register.
    pub rflags: u64,
    /// Code segment selector.
    pub cs: u16,
    /// Stack segment selector.
    pub ss: u16,
    /// Data segment selector.
    pub ds: u16,
    /// Extra segment selector.
    pub es: u16,
    /// fs selector.
    pub fs: u16,
    /// gs selector.
    pub gs: u16,
}

/// Floating-point/SIMD register save area (FXSAVE layout, opaque).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FpRegs(pub [u8; 512]);

impl Default for FpRegs {
    fn default() -> Self {
        FpRegs([0u8; 512])
    }
}

/// Per-thread captured state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ThreadState {
    /// Thread id at capture time (informational; not restored).
    pub tid: u64,
    /// Integer registers.
    pub regs: GeneralRegs,
    /// FP/SIMD registers.
    pub fpregs: FpRegs,
    /// fs segment base.
    pub fsbase: u64,
    /// gs segment base.
    pub gsbase: u64,
    /// Blocked-signal mask.
    pub sigmask: u64,
    /// Previous signal mask.
    pub oldsigmask: u64,
    /// Set on restore: the next return to user mode must reload the full
    /// context.
    pub needs_full_restore: bool,
}

/// One signal's disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SigAction {
    /// Handler address (or SIG_DFL/SIG_IGN sentinels).
    pub handler: u64,
    /// SA_* flags.
    pub flags: u32,
    /// Signals blocked while the handler runs.
    pub mask: u64,
}

/// The process signal-action table, reference count excluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigActionTable {
    /// One action per signal.
    pub actions: [SigAction; Limits::NSIG],
}

impl Default for SigActionTable {
    fn default() -> Self {
        SigActionTable {
            actions: [SigAction::default(); Limits::NSIG],
        }
    }
}

/// Kind of an open descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdKind {
    /// Regular file.
    File,
    /// Directory.
    Dir,
    /// Pipe or FIFO.
    Pipe,
    /// Socket.
    Socket,
    /// Shared-memory object.
    Shm,
    /// Anything else.
    Other,
}

impl FdKind {
    /// Wire encoding.
    pub fn as_u8(self) -> u8 {
        match self {
            FdKind::File => 0,
            FdKind::Dir => 1,
            FdKind::Pipe => 2,
            FdKind::Socket => 3,
            FdKind::Shm => 4,
            FdKind::Other => 5,
        }
    }

    /// Decode a wire value.
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => FdKind::File,
            1 => FdKind::Dir,
            2 => FdKind::Pipe,
            3 => FdKind::Socket,
            4 => FdKind::Shm,
            5 => FdKind::Other,
            _ => return None,
        })
    }
}

/// One open descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdEntry {
    /// Descriptor number.
    pub fd: u32,
    /// Kind.
    pub kind: FdKind,
    /// Open flags.
    pub flags: u32,
    /// Current file offset.
    pub offset: u64,
    /// Path of the underlying object, if it has one.
    pub path: Option<String>,
}

/// The process descriptor table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdTable {
    /// Current working directory.
    pub cdir: String,
    /// Root directory.
    pub rdir: String,
    /// File-creation mask.
    pub umask: u16,
    /// Open descriptors.
    pub entries: Vec<FdEntry>,
}

impl Default for FdTable {
    fn default() -> Self {
        FdTable {
            cdir: "/".to_string(),
            rdir: "/".to_string(),
            umask: 0o022,
            entries: Vec::new(),
        }
    }
}

impl FdTable {
    /// Duplicate `fd` onto the lowest free descriptor number, returning
    /// the new number. This is the checkpoint-capable replica behind
    /// `ffork`.
    pub fn dup(&mut self, fd: u32) -> Option<u32> {
        let entry = self.entries.iter().find(|e| e.fd == fd)?.clone();
        let new_fd = (0..)
            .find(|n| self.entries.iter().all(|e| e.fd != *n))
            .unwrap();
        self.entries.push(FdEntry {
            fd: new_fd,
            ..entry
        });
        Some(new_fd)
    }
}
