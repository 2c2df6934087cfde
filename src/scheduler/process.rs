use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bit_field::BitField;
use spin::Mutex;

use super::context::SwitchContext;
use super::wait::WaitQueueId;
use crate::fs::node::NodeHandle;
use crate::memory::paging::AddressSpace;

/// Process identifier. Small, positive, unique while the process is live,
/// recycled only after the process is reaped. The idle task uses -1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub i32);

pub const MAX_PID: i32 = 32768;
pub const NUMSIGNALS: usize = 37;

pub const USER_ROOT_UID: u32 = 0;

/// Tracks which pids are in use so ids can be recycled after reaping.
pub struct PidSet {
    words: Vec<u32>,
}

impl PidSet {
    pub fn new() -> Self {
        let mut set = PidSet {
            words: alloc::vec![0; (MAX_PID as usize + 31) / 32],
        };
        // Pids 0 and 1 are never handed out by the allocator.
        set.set(0);
        set.set(1);
        set
    }

    pub fn set(&mut self, pid: i32) {
        if (0..MAX_PID).contains(&pid) {
            self.words[pid as usize / 32].set_bit(pid as usize % 32, true);
        }
    }

    pub fn clear(&mut self, pid: i32) {
        if (0..MAX_PID).contains(&pid) {
            self.words[pid as usize / 32].set_bit(pid as usize % 32, false);
        }
    }

    pub fn test(&self, pid: i32) -> bool {
        (0..MAX_PID).contains(&pid) && self.words[pid as usize / 32].get_bit(pid as usize % 32)
    }

    /// First unused bit; used once the sequential range is exhausted.
    pub fn first_unset(&self) -> Option<i32> {
        for (i, word) in self.words.iter().enumerate() {
            if *word != u32::MAX {
                for j in 0..32 {
                    if !word.get_bit(j) {
                        let pid = (i * 32 + j) as i32;
                        if pid < MAX_PID {
                            return Some(pid);
                        }
                    }
                }
            }
        }
        None
    }
}

// ──────────────────────────────────────────────────────────────
//  File descriptor table
// ──────────────────────────────────────────────────────────────

/// Access bits stored per descriptor (01 read, 02 write).
pub const FD_MODE_READ: u16 = 0o1;
pub const FD_MODE_WRITE: u16 = 0o2;

pub struct FdEntry {
    pub node: NodeHandle,
    pub offset: u64,
    pub mode: u16,
}

/// A resizable descriptor table. Threads share the whole table; fork copies
/// it entry by entry, the entries sharing the underlying nodes.
pub struct FdTable {
    entries: Vec<Option<FdEntry>>,
}

pub type SharedFdTable = Arc<Mutex<FdTable>>;

impl FdTable {
    pub fn new() -> Self {
        FdTable {
            entries: Vec::new(),
        }
    }

    /// Install a node in the first free slot, growing the table if none.
    pub fn append(&mut self, node: NodeHandle, mode: u16) -> usize {
        for (i, slot) in self.entries.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(FdEntry {
                    node,
                    offset: 0,
                    mode,
                });
                return i;
            }
        }
        self.entries.push(Some(FdEntry {
            node,
            offset: 0,
            mode,
        }));
        self.entries.len() - 1
    }

    pub fn get(&self, fd: usize) -> Option<&FdEntry> {
        self.entries.get(fd).and_then(|e| e.as_ref())
    }

    pub fn get_mut(&mut self, fd: usize) -> Option<&mut FdEntry> {
        self.entries.get_mut(fd).and_then(|e| e.as_mut())
    }

    pub fn take(&mut self, fd: usize) -> Option<FdEntry> {
        self.entries.get_mut(fd).and_then(|e| e.take())
    }

    /// Duplicate `src` onto `dst`. The entry `dst` previously held is
    /// handed back so the caller can close it outside any scheduler lock.
    pub fn dup2(&mut self, src: usize, dst: usize) -> Option<Option<FdEntry>> {
        let (node, mode, offset) = {
            let entry = self.get(src)?;
            (entry.node.clone(), entry.mode, entry.offset)
        };
        while self.entries.len() <= dst {
            self.entries.push(None);
        }
        let displaced = self.entries[dst].replace(FdEntry { node, offset, mode });
        Some(displaced)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry-by-entry duplicate for fork: fresh table, shared nodes.
    pub fn duplicate(&self) -> FdTable {
        FdTable {
            entries: self
                .entries
                .iter()
                .map(|slot| {
                    slot.as_ref().map(|e| FdEntry {
                        node: e.node.clone(),
                        offset: e.offset,
                        mode: e.mode,
                    })
                })
                .collect(),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ──────────────────────────────────────────────────────────────
//  Process entity
// ──────────────────────────────────────────────────────────────

/// Where a process is linked right now. A process is in at most one place;
/// the variant, not convention, enforces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcLocation {
    /// On the CPU.
    Running,
    /// Queued on the FIFO ready list.
    Ready,
    /// Linked into one wait list.
    WaitingOn(WaitQueueId),
    /// Linked into the timed-sleep list.
    Sleeping,
    /// Blocked on a multi-node wait.
    FsWait,
    /// Linked nowhere (stopped, finished, or freshly created).
    Nowhere,
}

/// Saved user-level execution context (data model of the register file).
#[derive(Clone)]
pub struct ThreadContext {
    pub sp: u64,
    pub bp: u64,
    pub ip: u64,
    pub fpu_enabled: bool,
    pub fp_regs: [u8; 512],
}

impl Default for ThreadContext {
    fn default() -> Self {
        ThreadContext {
            sp: 0,
            bp: 0,
            ip: 0,
            fpu_enabled: false,
            fp_regs: [0; 512],
        }
    }
}

/// The virtual-address-space description of a loaded image.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessImage {
    pub size: u64,
    pub entry: u64,
    pub heap: u64,
    pub heap_actual: u64,
    pub stack: u64,
    pub user_stack: u64,
    pub start: u64,
    pub shm_heap: u64,
}

/// What a signal number is set to do for this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerSlot {
    Default,
    Ignore,
    Custom(fn(i32)),
}

/// A queued (handler, signal-number) record awaiting delivery.
#[derive(Debug, Clone, Copy)]
pub struct PendingSignal {
    pub handler: HandlerSlot,
    pub signum: usize,
}

/// Delivery machinery allocated lazily the first time a queued signal is
/// processed: the snapshot taken at handler entry plus a dedicated stack.
pub struct SignalDelivery {
    pub saved: ThreadContext,
    pub kstack: Box<[u8]>,
}

/// Result of a multi-node wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FswaitOutcome {
    /// Index of the first node that became ready.
    Ready(usize),
    /// The timeout deadline fired first.
    Timeout,
    /// The wait was abandoned (signal delivery).
    Interrupted,
}

pub struct Process {
    pub id: Pid,
    /// Thread-group leader (self for ordinary processes).
    pub group: Pid,
    /// Job-control group.
    pub job: Pid,
    pub session: Pid,
    pub name: String,
    pub description: Option<String>,
    pub user: u32,
    pub real_user: u32,
    pub mask: u16,
    pub status: i32,

    pub started: bool,
    pub running: bool,
    pub finished: bool,
    pub suspended: bool,
    pub is_daemon: bool,

    pub fds: SharedFdTable,
    pub wd_node: Option<NodeHandle>,
    pub wd_path: String,
    pub space: Option<AddressSpace>,
    pub image: ProcessImage,
    pub thread: ThreadContext,

    pub handlers: [HandlerSlot; NUMSIGNALS],
    pub signal_queue: VecDeque<PendingSignal>,
    pub signal_delivery: Option<Box<SignalDelivery>>,

    pub location: ProcLocation,
    pub sleep_interrupted: bool,
    /// Wait keys registered by selectwait hooks, in fswait array order.
    pub node_waits: Option<Vec<u64>>,
    pub fswait_result: Option<FswaitOutcome>,
    /// A timeout sleeper for this fswait sits in the sleep list.
    pub timeout_pending: bool,

    pub parent: Option<Pid>,
    pub children: Vec<Pid>,
    pub wait_queue: WaitQueueId,

    /// Kernel-side switch context; boxed so its address stays stable.
    pub kctx: Box<SwitchContext>,
    pub kstack: Box<[u8]>,
    /// Stack bounds for the dispatch sanity check (None for the adopted
    /// boot thread, whose stack the kernel does not own).
    pub stack_bounds: Option<(u64, u64)>,
}

impl Process {
    /// A blank entity; callers fill in identity and context.
    pub fn blank(id: Pid, name: &str, wait_queue: WaitQueueId) -> Process {
        Process {
            id,
            group: id,
            job: id,
            session: id,
            name: String::from(name),
            description: None,
            user: 0,
            real_user: 0,
            mask: 0o22,
            status: 0,
            started: false,
            running: false,
            finished: false,
            suspended: false,
            is_daemon: false,
            fds: Arc::new(Mutex::new(FdTable::new())),
            wd_node: None,
            wd_path: String::from("/"),
            space: None,
            image: ProcessImage::default(),
            thread: ThreadContext::default(),
            handlers: [HandlerSlot::Default; NUMSIGNALS],
            signal_queue: VecDeque::new(),
            signal_delivery: None,
            location: ProcLocation::Nowhere,
            sleep_interrupted: false,
            node_waits: None,
            fswait_result: None,
            timeout_pending: false,
            parent: None,
            children: Vec::new(),
            wait_queue,
            kctx: Box::new(SwitchContext::empty()),
            kstack: Box::new([]),
            stack_bounds: None,
        }
    }
}

// ──────────────────────────────────────────────────────────────
//  Process table
// ──────────────────────────────────────────────────────────────

/// The process table: entities by pid plus the recycling pid set. Tree
/// structure lives in the per-process parent/children links; the root is
/// always init (pid 1).
pub struct ProcessTable {
    procs: BTreeMap<i32, Process>,
    pids: PidSet,
    next_pid: i32,
}

impl ProcessTable {
    pub fn new() -> Self {
        ProcessTable {
            procs: BTreeMap::new(),
            pids: PidSet::new(),
            next_pid: 2,
        }
    }

    pub fn allocate_pid(&mut self) -> Pid {
        let pid = if self.next_pid > MAX_PID {
            // Sequential range exhausted; recycle the lowest free id.
            self.pids.first_unset().unwrap_or(MAX_PID)
        } else {
            let pid = self.next_pid;
            self.next_pid += 1;
            pid
        };
        self.pids.set(pid);
        Pid(pid)
    }

    pub fn release_pid(&mut self, pid: Pid) {
        self.pids.clear(pid.0);
    }

    pub fn insert(&mut self, proc: Process) {
        self.procs.insert(proc.id.0, proc);
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Process> {
        self.procs.remove(&pid.0)
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.procs.get(&pid.0)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.procs.get_mut(&pid.0)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.procs.contains_key(&pid.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.procs.values()
    }
}
