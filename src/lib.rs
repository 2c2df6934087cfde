#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod errno;
pub mod fs;
pub mod klog;
pub mod memory;
pub mod scheduler;
pub mod syscalls;

use alloc::sync::Arc;
use spin::Mutex;

use errno::Result;
use fs::Vfs;
use memory::paging::{classify_fault, FaultKind};
use memory::MemoryManager;
use scheduler::context::TaskEntry;
use scheduler::process::Pid;
use scheduler::signal::SIGSEGV;
use scheduler::Scheduler;

/// Boot-time knobs for a kernel instance.
pub struct KernelConfig {
    /// Physical memory handed to the frame allocator, in KiB.
    pub memory_kib: usize,
    /// Mount a fresh tmpfs at `/` during boot.
    pub mount_root: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            memory_kib: 16 * 1024,
            mount_root: true,
        }
    }
}

/// The user-program seam: what a forked child "resumes into". The external
/// loader installs the real thing; tests install stand-ins.
pub type UserResume = fn(&Kernel) -> i32;

/// How a page fault was disposed of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// A signal-handler return trampoline; the interrupted context was
    /// restored.
    Restored,
    /// A genuine fault in process context; SIGSEGV is on its way.
    SignalSent,
}

/// One kernel instance: the owned subsystem contexts, wired together. All
/// shared mutable state lives behind these, not in free-standing statics.
pub struct Kernel {
    mem: MemoryManager,
    vfs: Vfs,
    sched: Arc<Scheduler>,
    user_resume: Mutex<Option<UserResume>>,
}

impl Kernel {
    /// Bring up a kernel: memory manager, VFS (with the tmpfs type
    /// registered and optionally mounted at `/`), scheduler with the
    /// calling thread adopted as init and the idle task spawned.
    pub fn boot(config: KernelConfig) -> Arc<Kernel> {
        let kernel = Arc::new(Kernel {
            mem: MemoryManager::new(config.memory_kib),
            vfs: Vfs::new(),
            sched: Arc::new(Scheduler::new()),
            user_resume: Mutex::new(None),
        });

        let _ = kernel
            .vfs
            .register_type("tmpfs", Arc::new(fs::tmpfs::mount_tmpfs));
        if config.mount_root {
            if let Err(e) = kernel.vfs.mount_type("tmpfs", "root", "/") {
                log_error!("boot: mounting root tmpfs failed: {}", e);
            }
        }

        kernel.sched.adopt_init();
        kernel.sched.spawn_idle(&kernel);
        log_info!("kernel: boot complete, {} KiB physical", config.memory_kib);
        kernel
    }

    pub fn mem(&self) -> &MemoryManager {
        &self.mem
    }

    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    pub fn sched(&self) -> &Scheduler {
        &self.sched
    }

    pub fn sched_handle(&self) -> Arc<Scheduler> {
        self.sched.clone()
    }

    pub fn set_user_resume(&self, resume: UserResume) {
        *self.user_resume.lock() = Some(resume);
    }

    pub fn user_resume(&self) -> Option<UserResume> {
        *self.user_resume.lock()
    }

    // ── convenience wrappers over the lifecycle operations ───

    pub fn fork(&self) -> Result<Pid> {
        scheduler::lifecycle::fork(self)
    }

    pub fn clone_task(&self, entry: TaskEntry, arg: u64) -> Result<Pid> {
        scheduler::lifecycle::clone_task(self, entry, arg)
    }

    pub fn spawn(&self, entry: TaskEntry, name: &str, arg: u64) -> Result<Pid> {
        scheduler::lifecycle::spawn_kernel_task(self, entry, name, arg)
    }

    pub fn waitpid(&self, pid: i32, options: u32) -> Result<(Pid, i32)> {
        scheduler::lifecycle::waitpid(self, pid, options)
    }

    pub fn yield_now(&self) {
        self.sched.yield_now();
    }

    /// The page-fault entry point. Trampoline "faults" are control flow;
    /// a genuine fault in process context delivers SIGSEGV to the faulting
    /// process; a genuine fault outside any process is fatal to the whole
    /// system.
    pub fn page_fault(&self, ip: u64, address: u64) -> FaultOutcome {
        match classify_fault(ip) {
            FaultKind::SignalReturn => {
                self.sched.with_current(|proc| {
                    if let Some(delivery) = proc.signal_delivery.take() {
                        proc.thread = delivery.saved;
                    }
                });
                FaultOutcome::Restored
            }
            FaultKind::ThreadExit => self.sched.exit_current(0),
            FaultKind::Genuine => {
                let me = self.sched.current_pid();
                let live_process = me.0 > 0
                    && self
                        .sched
                        .with_process(me, |p| !p.finished)
                        .unwrap_or(false);
                if !live_process {
                    panic!("kernel page fault at {:#x} (ip {:#x})", address, ip);
                }
                log_error!(
                    "segmentation fault at {:#x}, ip {:#x}, pid {}",
                    address,
                    ip,
                    me.0
                );
                let _ = self.sched.send_signal(me, SIGSEGV, true);
                FaultOutcome::SignalSent
            }
        }
    }
}
