pub mod context;
pub mod lifecycle;
pub mod process;
pub mod signal;
pub mod wait;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::Kernel;
use context::{switch_context, SwitchContext, TaskEntry, KERNEL_STACK_SIZE};
use process::{Pid, ProcLocation, Process, ProcessTable};
use signal::SIGSEGV;
use wait::{Sleeper, WaitRegistry};

pub use process::FswaitOutcome;
pub use wait::WaitQueueId;

pub const SUBTICKS_PER_TICK: u64 = 1000;

/// The process/scheduler subsystem context: process table, FIFO ready
/// queue, wait-list registry, timed-sleep list, and the timer.
pub struct Scheduler {
    pub(crate) inner: Mutex<SchedInner>,
}

pub(crate) struct SchedInner {
    pub table: ProcessTable,
    pub ready: VecDeque<Pid>,
    pub current: Option<Pid>,
    pub idle: Option<Pid>,
    pub queues: WaitRegistry,
    pub sleepers: Vec<Sleeper>,
    pub ticks: u64,
    pub subticks: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            inner: Mutex::new(SchedInner {
                table: ProcessTable::new(),
                ready: VecDeque::new(),
                current: None,
                idle: None,
                queues: WaitRegistry::new(),
                sleepers: Vec::new(),
                ticks: 0,
                subticks: 0,
            }),
        }
    }

    /// Turn the calling thread into the init process (pid 1). Its switch
    /// context is empty and gets filled on the first switch away.
    pub fn adopt_init(&self) -> Pid {
        let mut inner = self.inner.lock();
        let wq = inner.queues.create();
        let mut init = Process::blank(Pid(1), "init", wq);
        init.description = Some(String::from("init process"));
        init.started = true;
        init.running = true;
        init.location = ProcLocation::Running;
        inner.table.insert(init);
        inner.current = Some(Pid(1));
        Pid(1)
    }

    /// The dedicated idle process: runs only when the ready queue is empty,
    /// driving the timer forward while it does.
    pub fn spawn_idle(&self, kernel: &Kernel) -> Pid {
        extern "C" fn kidle(kernel: &Kernel, _arg: u64) {
            loop {
                kernel.sched().timer_interrupt();
            }
        }
        let mut inner = self.inner.lock();
        let mut idle = Self::build_task_locked(&mut inner, Pid(-1), "[kidle]", kernel, kidle, 0);
        idle.is_daemon = true;
        inner.table.insert(idle);
        inner.idle = Some(Pid(-1));
        Pid(-1)
    }

    /// Assemble a process entity with a fresh kernel stack and a context
    /// parked at the entry trampoline.
    pub(crate) fn build_task_locked(
        inner: &mut SchedInner,
        id: Pid,
        name: &str,
        kernel: &Kernel,
        entry: TaskEntry,
        arg: u64,
    ) -> Process {
        let wq = inner.queues.create();
        let mut proc = Process::blank(id, name, wq);
        let stack = vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
        let base = stack.as_ptr() as u64;
        let top = base + KERNEL_STACK_SIZE as u64;
        proc.kctx = Box::new(SwitchContext::fresh(top, kernel as *const Kernel, entry, arg));
        proc.stack_bounds = Some((base, top));
        proc.kstack = stack;
        proc
    }

    pub fn current_pid(&self) -> Pid {
        self.inner.lock().current.unwrap_or(Pid(0))
    }

    /// Run a closure against a process entry.
    pub fn with_process<R>(&self, pid: Pid, f: impl FnOnce(&mut Process) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        inner.table.get_mut(pid).map(f)
    }

    pub fn with_current<R>(&self, f: impl FnOnce(&mut Process) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        let cur = inner.current?;
        inner.table.get_mut(cur).map(f)
    }

    /// Unlink a process from wherever it sits and append it to the ready
    /// queue. Out-of-band removal from a wait list marks the wake as
    /// interrupted; `interrupted` forces the mark regardless.
    pub(crate) fn make_ready_locked(inner: &mut SchedInner, pid: Pid, interrupted: bool) {
        let location = match inner.table.get(pid) {
            Some(proc) if !proc.finished => proc.location,
            _ => return,
        };
        match location {
            ProcLocation::Running | ProcLocation::Ready => return,
            ProcLocation::WaitingOn(queue) => {
                inner.queues.remove(queue, pid);
                if let Some(proc) = inner.table.get_mut(pid) {
                    proc.sleep_interrupted = true;
                }
            }
            ProcLocation::Sleeping => {
                inner.sleepers.retain(|s| s.fswait || s.pid != pid);
            }
            ProcLocation::FsWait | ProcLocation::Nowhere => {}
        }
        if let Some(proc) = inner.table.get_mut(pid) {
            if interrupted {
                proc.sleep_interrupted = true;
            }
            proc.location = ProcLocation::Ready;
        }
        inner.ready.push_back(pid);
    }

    pub fn make_ready(&self, pid: Pid) {
        let mut inner = self.inner.lock();
        Self::make_ready_locked(&mut inner, pid, false);
    }

    /// A dispatch-selected process whose saved context is corrupt is fatal
    /// to that process only.
    fn context_sane(proc: &Process) -> bool {
        match proc.stack_bounds {
            None => true, // adopted boot thread; the kernel does not own its stack
            Some((base, top)) => {
                proc.kctx.rip != 0 && proc.kctx.rsp > base && proc.kctx.rsp <= top
            }
        }
    }

    /// Dequeue the next runnable process; falls back to the idle task.
    /// Corrupt entries are killed and skipped, never brought down with the
    /// whole system.
    pub(crate) fn next_ready_locked(inner: &mut SchedInner) -> Option<Pid> {
        loop {
            let pid = match inner.ready.pop_front() {
                Some(pid) => pid,
                None => return inner.idle,
            };
            let sane = match inner.table.get(pid) {
                Some(proc) if !proc.finished => Self::context_sane(proc),
                _ => continue, // stale queue entry
            };
            if !sane {
                crate::log_error!(
                    "scheduler: corrupt saved context for pid {}, killing it",
                    pid.0
                );
                Self::kill_corrupt_locked(inner, pid);
                continue;
            }
            return Some(pid);
        }
    }

    fn kill_corrupt_locked(inner: &mut SchedInner, pid: Pid) {
        let parent = match inner.table.get_mut(pid) {
            Some(proc) => {
                proc.finished = true;
                proc.running = false;
                proc.status = (((128 + SIGSEGV) << 8) | SIGSEGV) as i32;
                proc.location = ProcLocation::Nowhere;
                proc.parent
            }
            None => return,
        };
        if let Some(parent) = parent {
            if let Some(queue) = inner.table.get(parent).map(|p| p.wait_queue) {
                Self::wakeup_queue_locked(inner, queue, false);
            }
        }
    }

    /// The heart of scheduling: park the current process, dispatch the next
    /// one, and switch stacks. With `reschedule` the current process goes to
    /// the tail of the ready queue; otherwise the caller has already linked
    /// it wherever it is waiting.
    pub fn switch_task(&self, reschedule: bool) {
        let (old_ptr, new_ptr) = {
            let mut inner = self.inner.lock();
            let cur = match inner.current.take() {
                Some(pid) => pid,
                None => return,
            };
            let is_idle = Some(cur) == inner.idle;
            let cur_finished = inner
                .table
                .get_mut(cur)
                .map(|proc| {
                    proc.running = false;
                    proc.finished
                })
                .unwrap_or(true);
            if reschedule && !cur_finished {
                if is_idle {
                    // The idle task never sits in the ready queue.
                    if let Some(proc) = inner.table.get_mut(cur) {
                        proc.location = ProcLocation::Nowhere;
                    }
                } else {
                    if let Some(proc) = inner.table.get_mut(cur) {
                        proc.location = ProcLocation::Ready;
                    }
                    inner.ready.push_back(cur);
                }
            }

            let next = Self::next_ready_locked(&mut inner).unwrap_or(cur);
            if next == cur {
                if let Some(proc) = inner.table.get_mut(cur) {
                    proc.location = ProcLocation::Running;
                    proc.running = true;
                }
                inner.current = Some(cur);
                drop(inner);
                self.after_resume();
                return;
            }

            if let Some(proc) = inner.table.get_mut(next) {
                proc.location = ProcLocation::Running;
                proc.running = true;
                proc.started = true;
            }
            inner.current = Some(next);

            let old_ptr = match inner.table.get_mut(cur) {
                Some(proc) => &mut *proc.kctx as *mut SwitchContext,
                None => return,
            };
            let new_ptr = match inner.table.get(next) {
                Some(proc) => &*proc.kctx as *const SwitchContext,
                None => return,
            };
            (old_ptr, new_ptr)
        };

        // The lock is dropped before the switch; the boxed contexts do not
        // move even if the table reshuffles.
        unsafe { switch_context(old_ptr, new_ptr) };

        // Somebody switched back to us: deliver anything that queued up.
        self.after_resume();
    }

    /// Cooperatively hand the CPU to the next ready process.
    pub fn yield_now(&self) {
        self.switch_task(true);
    }

    /// Terminate the current process: release its resources, notify the
    /// parent, and dispatch the next runnable process. The entry stays in
    /// the table as finished until the parent collects it.
    pub fn exit_current(&self, status: i32) -> ! {
        use alloc::sync::Arc;
        use spin::Mutex as SpinMutex;

        // Phase 1: mark finished and strip resources under the lock.
        let (resources, parent) = {
            let mut inner = self.inner.lock();
            let cur = match inner.current {
                Some(pid) => pid,
                None => panic!("exit_current called outside a process"),
            };
            let proc = match inner.table.get_mut(cur) {
                Some(p) => p,
                None => panic!("exit_current: current process vanished"),
            };
            proc.status = status;
            proc.finished = true;
            proc.running = false;
            proc.location = ProcLocation::Nowhere;
            let fds = core::mem::replace(
                &mut proc.fds,
                Arc::new(SpinMutex::new(process::FdTable::new())),
            );
            let wd = proc.wd_node.take();
            let space = proc.space.take();
            let delivery = proc.signal_delivery.take();
            proc.node_waits = None;
            (
                (fds, wd, space, delivery),
                proc.parent,
            )
        };

        // Phase 2: drop resources unlocked. Close hooks (pipes) may call
        // back into the scheduler to wake peers.
        let (fds, wd, space, delivery) = resources;
        if Arc::strong_count(&fds) == 1 {
            fds.lock().clear();
        }
        drop(fds);
        drop(wd);
        drop(space);
        drop(delivery);

        // Phase 3: notify the parent and dispatch whatever runs next.
        if let Some(parent) = parent {
            let queue = {
                let inner = self.inner.lock();
                inner.table.get(parent).map(|p| p.wait_queue)
            };
            if let Some(queue) = queue {
                self.wakeup_queue(queue);
            }
            let _ = self.send_signal(parent, signal::SIGCHLD, true);
        }

        let new_ptr = {
            let mut inner = self.inner.lock();
            inner.current = None;
            let next = match Self::next_ready_locked(&mut inner) {
                Some(pid) => pid,
                None => panic!("exit_current: nothing left to run"),
            };
            if let Some(proc) = inner.table.get_mut(next) {
                proc.location = ProcLocation::Running;
                proc.running = true;
                proc.started = true;
            }
            inner.current = Some(next);
            match inner.table.get(next) {
                Some(proc) => &*proc.kctx as *const SwitchContext,
                None => panic!("exit_current: next process vanished"),
            }
        };

        unsafe { context::restore_context(new_ptr) }
    }

    // ── timer ────────────────────────────────────────────────

    /// One timer-interrupt's worth of work: advance the clock, wake due
    /// sleepers, reschedule.
    pub fn timer_interrupt(&self) {
        {
            let mut inner = self.inner.lock();
            inner.subticks += 1;
            if inner.subticks == SUBTICKS_PER_TICK {
                inner.ticks += 1;
                inner.subticks = 0;
            }
        }
        self.wakeup_sleepers();
        self.switch_task(true);
    }

    pub fn now(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.ticks, inner.subticks)
    }

    /// Convert a relative delay to an absolute tick deadline, so repeated
    /// re-arming cannot drift.
    pub fn relative_time(&self, seconds: u64, subseconds: u64) -> (u64, u64) {
        let inner = self.inner.lock();
        if subseconds + inner.subticks >= SUBTICKS_PER_TICK {
            (
                inner.ticks + seconds + 1,
                (subseconds + inner.subticks) - SUBTICKS_PER_TICK,
            )
        } else {
            (inner.ticks + seconds, inner.subticks + subseconds)
        }
    }

    /// Snapshot of every process for diagnostics (`ps`-style listings).
    pub fn tasks(&self) -> Vec<(i32, String, String)> {
        let inner = self.inner.lock();
        inner
            .table
            .iter()
            .map(|proc| {
                let state = if proc.finished {
                    String::from("finished")
                } else if proc.suspended {
                    String::from("stopped")
                } else {
                    alloc::format!("{:?}", proc.location)
                };
                (proc.id.0, proc.name.clone(), state)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adopt_init_installs_pid_one_as_current() {
        let sched = Scheduler::new();
        let pid = sched.adopt_init();
        assert_eq!(pid, Pid(1));
        assert_eq!(sched.current_pid(), Pid(1));
        let state = sched.tasks();
        assert!(state.iter().any(|(id, name, st)| {
            *id == 1 && name == "init" && st == "Running"
        }));
    }

    #[test]
    fn relative_time_carries_into_the_next_tick() {
        let sched = Scheduler::new();
        {
            let mut inner = sched.inner.lock();
            inner.ticks = 10;
            inner.subticks = 800;
        }
        assert_eq!(sched.relative_time(0, 100), (10, 900));
        assert_eq!(sched.relative_time(0, 300), (11, 100));
        assert_eq!(sched.relative_time(2, 200), (13, 0));
    }

    #[test]
    fn make_ready_pulls_a_sleeper_off_the_timed_list() {
        let sched = Scheduler::new();
        sched.adopt_init();
        {
            let mut inner = sched.inner.lock();
            let wq = inner.queues.create();
            let mut proc = Process::blank(Pid(7), "sleeper", wq);
            proc.location = ProcLocation::Sleeping;
            inner.table.insert(proc);
            Scheduler::insert_sleeper_locked(
                &mut inner,
                Sleeper {
                    pid: Pid(7),
                    end_tick: 100,
                    end_subtick: 0,
                    fswait: false,
                },
            );
        }
        sched.make_ready(Pid(7));
        let inner = sched.inner.lock();
        assert!(inner.sleepers.is_empty());
        assert_eq!(inner.table.get(Pid(7)).unwrap().location, ProcLocation::Ready);
        assert_eq!(inner.ready.back(), Some(&Pid(7)));
    }

    #[test]
    fn sleepers_stay_ordered_by_deadline() {
        let sched = Scheduler::new();
        let mut inner = sched.inner.lock();
        for (tick, sub) in [(5, 0), (2, 500), (2, 100), (9, 0)] {
            Scheduler::insert_sleeper_locked(
                &mut inner,
                Sleeper {
                    pid: Pid(2),
                    end_tick: tick,
                    end_subtick: sub,
                    fswait: false,
                },
            );
        }
        let deadlines: Vec<(u64, u64)> = inner
            .sleepers
            .iter()
            .map(|s| (s.end_tick, s.end_subtick))
            .collect();
        assert_eq!(deadlines, [(2, 100), (2, 500), (5, 0), (9, 0)]);
    }

    #[test]
    fn corrupt_context_kills_only_that_process() {
        let sched = Scheduler::new();
        sched.adopt_init();
        let mut inner = sched.inner.lock();
        // A fake process whose saved instruction pointer is garbage.
        let wq = inner.queues.create();
        let mut bad = Process::blank(Pid(9), "bad", wq);
        bad.stack_bounds = Some((0x1000, 0x2000));
        bad.kctx.rip = 0;
        bad.kctx.rsp = 0x1800;
        inner.table.insert(bad);
        let wq2 = inner.queues.create();
        let mut good = Process::blank(Pid(10), "good", wq2);
        good.stack_bounds = None; // treated as sane for this test
        inner.table.insert(good);

        inner.ready.push_back(Pid(9));
        inner.ready.push_back(Pid(10));
        let next = Scheduler::next_ready_locked(&mut inner);
        assert_eq!(next, Some(Pid(10)));
        let bad = inner.table.get(Pid(9)).unwrap();
        assert!(bad.finished);
        assert_ne!(bad.status, 0);
    }
}
