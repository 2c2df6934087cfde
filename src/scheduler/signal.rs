use alloc::boxed::Box;
use alloc::vec;

use super::process::{
    HandlerSlot, PendingSignal, Pid, ProcLocation, SignalDelivery, NUMSIGNALS, USER_ROOT_UID,
};
use super::Scheduler;
use crate::errno::{Error, Result};

pub const SIGHUP: usize = 1;
pub const SIGINT: usize = 2;
pub const SIGQUIT: usize = 3;
pub const SIGILL: usize = 4;
pub const SIGTRAP: usize = 5;
pub const SIGABRT: usize = 6;
pub const SIGEMT: usize = 7;
pub const SIGFPE: usize = 8;
pub const SIGKILL: usize = 9;
pub const SIGBUS: usize = 10;
pub const SIGSEGV: usize = 11;
pub const SIGSYS: usize = 12;
pub const SIGPIPE: usize = 13;
pub const SIGALRM: usize = 14;
pub const SIGTERM: usize = 15;
pub const SIGUSR1: usize = 16;
pub const SIGUSR2: usize = 17;
pub const SIGCHLD: usize = 18;
pub const SIGPWR: usize = 19;
pub const SIGWINCH: usize = 20;
pub const SIGURG: usize = 21;
pub const SIGPOLL: usize = 22;
pub const SIGSTOP: usize = 23;
pub const SIGTSTP: usize = 24;
pub const SIGCONT: usize = 25;
pub const SIGTTIN: usize = 26;
pub const SIGTTOUT: usize = 27;
pub const SIGVTALRM: usize = 28;
pub const SIGPROF: usize = 29;
pub const SIGXCPU: usize = 30;
pub const SIGXFSZ: usize = 31;
pub const SIGWAITING: usize = 32;
pub const SIGDIAF: usize = 33;
pub const SIGHATE: usize = 34;
pub const SIGWINEVENT: usize = 35;
pub const SIGCAT: usize = 36;

/// Size of the dedicated stack reserved for signal delivery.
const SIGNAL_STACK_SIZE: usize = 16 * 1024;

/// Status word reported for a stopped process.
pub const STATUS_STOPPED: i32 = 0x7F;

/// What an unhandled signal does by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ignore,
    Terminate,
    TerminateCore,
    Stop,
    Continue,
}

use Disposition::{Continue, Ignore, Stop, Terminate, TerminateCore};

/// Fixed per-signal default dispositions.
pub const DEFAULT_DISPOSITION: [Disposition; NUMSIGNALS] = [
    Ignore,        // 0
    Terminate,     // SIGHUP
    Terminate,     // SIGINT
    TerminateCore, // SIGQUIT
    TerminateCore, // SIGILL
    TerminateCore, // SIGTRAP
    TerminateCore, // SIGABRT
    TerminateCore, // SIGEMT
    TerminateCore, // SIGFPE
    Terminate,     // SIGKILL
    TerminateCore, // SIGBUS
    TerminateCore, // SIGSEGV
    TerminateCore, // SIGSYS
    Terminate,     // SIGPIPE
    Terminate,     // SIGALRM
    Terminate,     // SIGTERM
    Terminate,     // SIGUSR1
    Terminate,     // SIGUSR2
    Ignore,        // SIGCHLD
    Ignore,        // SIGPWR
    Ignore,        // SIGWINCH
    Ignore,        // SIGURG
    Ignore,        // SIGPOLL
    Stop,          // SIGSTOP
    Stop,          // SIGTSTP
    Continue,      // SIGCONT
    Stop,          // SIGTTIN
    Stop,          // SIGTTOUT
    Terminate,     // SIGVTALRM
    Terminate,     // SIGPROF
    TerminateCore, // SIGXCPU
    TerminateCore, // SIGXFSZ
    Ignore,        // SIGWAITING
    Terminate,     // SIGDIAF
    Ignore,        // SIGHATE
    Ignore,        // SIGWINEVENT
    Ignore,        // SIGCAT
];

/// Status word encoding a death-by-signal.
pub fn signal_exit_status(signum: usize) -> i32 {
    (((128 + signum) << 8) | signum) as i32
}

impl Scheduler {
    /// Install a handler slot for a signal on the current process, returning
    /// the previous slot.
    pub fn set_handler(&self, signum: usize, slot: HandlerSlot) -> Result<HandlerSlot> {
        if signum == 0 || signum >= NUMSIGNALS {
            return Err(Error::Invalid);
        }
        // SIGKILL and SIGSTOP cannot be caught.
        if signum == SIGKILL || signum == SIGSTOP {
            return Err(Error::Invalid);
        }
        self.with_current(|proc| core::mem::replace(&mut proc.handlers[signum], slot))
            .ok_or(Error::NoProcess)
    }

    /// Queue a signal for a process. A blocked target is forced back onto
    /// the ready queue with an interrupted wake so it observes the signal
    /// promptly.
    pub fn send_signal(&self, target: Pid, signum: usize, force_root: bool) -> Result<()> {
        let signal_self = {
            let mut inner = self.inner.lock();
            let (sender_user, sender_session, current) = match inner.current {
                Some(cur) => match inner.table.get(cur) {
                    Some(proc) => (proc.user, proc.session, Some(cur)),
                    None => (USER_ROOT_UID, Pid(0), None),
                },
                None => (USER_ROOT_UID, Pid(0), None),
            };

            let receiver = inner.table.get(target).ok_or(Error::NoProcess)?;
            if !force_root && receiver.user != sender_user && sender_user != USER_ROOT_UID {
                // SIGCONT may cross users inside one session (job control).
                if !(signum == SIGCONT && receiver.session == sender_session) {
                    return Err(Error::Access);
                }
            }
            if signum >= NUMSIGNALS {
                return Err(Error::Invalid);
            }
            if receiver.finished {
                return Err(Error::Invalid);
            }

            let slot = receiver.handlers[signum];
            // Unhandled and ignored-by-default: not even queued.
            if slot == HandlerSlot::Default && DEFAULT_DISPOSITION[signum] == Ignore {
                return Ok(());
            }

            if DEFAULT_DISPOSITION[signum] == Continue {
                let receiver = inner.table.get_mut(target).ok_or(Error::NoProcess)?;
                if !receiver.suspended {
                    return Err(Error::Invalid);
                }
                receiver.suspended = false;
                receiver.status = 0;
            }

            let waiting_on_nodes = match inner.table.get_mut(target) {
                Some(receiver) => {
                    receiver.signal_queue.push_back(PendingSignal {
                        handler: slot,
                        signum,
                    });
                    receiver.node_waits.is_some()
                }
                None => false,
            };
            if waiting_on_nodes {
                Self::awaken_from_fswait_locked(
                    &mut inner,
                    target,
                    super::process::FswaitOutcome::Interrupted,
                );
            }
            Self::make_ready_locked(&mut inner, target, true);
            current == Some(target)
        };

        if signal_self {
            // Get back in line; delivery happens when we are resumed.
            self.switch_task(true);
        }
        Ok(())
    }

    /// Send a signal to every process-group leader in a job (terminal job
    /// control), delivering to the caller's own group last.
    pub fn group_send_signal(&self, job: Pid, signum: usize, force_root: bool) -> Result<bool> {
        let (targets, own_group) = {
            let inner = self.inner.lock();
            let own_group = inner
                .current
                .and_then(|cur| inner.table.get(cur))
                .map(|p| p.group);
            let targets: alloc::vec::Vec<Pid> = inner
                .table
                .iter()
                .filter(|p| p.group == p.id && p.job == job)
                .map(|p| p.group)
                .collect();
            (targets, own_group)
        };

        let mut killed_something = false;
        let mut kill_self = false;
        for group in targets {
            if Some(group) == own_group {
                kill_self = true;
                continue;
            }
            if self.send_signal(group, signum, force_root).is_ok() {
                killed_something = true;
            }
        }
        if kill_self {
            if let Some(own) = own_group {
                if self.send_signal(own, signum, force_root).is_ok() {
                    killed_something = true;
                }
            }
        }
        Ok(killed_something)
    }

    /// Runs every time a process is resumed: drain and act on its queued
    /// signals in their own context.
    pub(crate) fn after_resume(&self) {
        loop {
            let pending = {
                let mut inner = self.inner.lock();
                let cur = match inner.current {
                    Some(pid) => pid,
                    None => return,
                };
                match inner.table.get_mut(cur) {
                    Some(proc) if !proc.finished => proc.signal_queue.pop_front(),
                    _ => return,
                }
            };
            match pending {
                Some(sig) => self.deliver_signal(sig),
                None => return,
            }
        }
    }

    fn deliver_signal(&self, sig: PendingSignal) {
        if sig.signum == 0 || sig.signum >= NUMSIGNALS {
            return;
        }
        match sig.handler {
            HandlerSlot::Ignore => {}
            HandlerSlot::Custom(handler) => self.run_handler(handler, sig.signum),
            HandlerSlot::Default => match DEFAULT_DISPOSITION[sig.signum] {
                Ignore => {}
                Terminate | TerminateCore => {
                    self.exit_current(signal_exit_status(sig.signum));
                }
                Stop => {
                    let parent = self
                        .with_current(|proc| {
                            proc.suspended = true;
                            proc.status = STATUS_STOPPED;
                            proc.location = ProcLocation::Nowhere;
                            proc.parent
                        })
                        .flatten();
                    if let Some(parent) = parent {
                        let queue = self.with_process(parent, |p| (p.finished, p.wait_queue));
                        if let Some((false, queue)) = queue {
                            self.wakeup_queue(queue);
                        }
                    }
                    // Stopped: off every queue until SIGCONT makes us ready.
                    self.switch_task(false);
                }
                Continue => {}
            },
        }
    }

    /// Invoke a custom handler in this process's context. The interrupted
    /// execution context is snapshotted into lazily-allocated delivery
    /// machinery and restored when the handler returns.
    fn run_handler(&self, handler: fn(i32), signum: usize) {
        self.with_current(|proc| {
            if proc.signal_delivery.is_none() {
                proc.signal_delivery = Some(Box::new(SignalDelivery {
                    saved: proc.thread.clone(),
                    kstack: vec![0u8; SIGNAL_STACK_SIZE].into_boxed_slice(),
                }));
            } else if let Some(delivery) = proc.signal_delivery.as_mut() {
                delivery.saved = proc.thread.clone();
            }
        });

        handler(signum as i32);

        // Handler returned through the trampoline: restore the snapshot.
        self.with_current(|proc| {
            if let Some(delivery) = proc.signal_delivery.take() {
                proc.thread = delivery.saved;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposition_table_matches_the_classic_defaults() {
        assert_eq!(DEFAULT_DISPOSITION[SIGKILL], Terminate);
        assert_eq!(DEFAULT_DISPOSITION[SIGSEGV], TerminateCore);
        assert_eq!(DEFAULT_DISPOSITION[SIGCHLD], Ignore);
        assert_eq!(DEFAULT_DISPOSITION[SIGSTOP], Stop);
        assert_eq!(DEFAULT_DISPOSITION[SIGCONT], Continue);
        assert_eq!(DEFAULT_DISPOSITION.len(), NUMSIGNALS);
    }

    #[test]
    fn exit_status_encodes_the_signal_number() {
        let status = signal_exit_status(SIGTERM);
        assert_eq!(status & 0xFF, SIGTERM as i32);
        assert_eq!((status >> 8) & 0xFF, 128 + SIGTERM as i32);
    }

    #[test]
    fn signal_to_a_missing_process_is_an_error() {
        let sched = Scheduler::new();
        sched.adopt_init();
        assert_eq!(
            sched.send_signal(Pid(999), SIGTERM, false),
            Err(Error::NoProcess)
        );
    }

    #[test]
    fn ignored_by_default_signals_are_not_queued() {
        let sched = Scheduler::new();
        sched.adopt_init();
        sched.send_signal(Pid(1), SIGCHLD, true).unwrap();
        let queued = sched
            .with_process(Pid(1), |p| p.signal_queue.len())
            .unwrap();
        assert_eq!(queued, 0);
    }

    #[test]
    fn continue_to_a_running_process_is_invalid() {
        let sched = Scheduler::new();
        sched.adopt_init();
        assert_eq!(
            sched.send_signal(Pid(1), SIGCONT, true),
            Err(Error::Invalid)
        );
    }

    #[test]
    fn sigkill_cannot_be_caught() {
        let sched = Scheduler::new();
        sched.adopt_init();
        assert_eq!(
            sched.set_handler(SIGKILL, HandlerSlot::Ignore),
            Err(Error::Invalid)
        );
        assert_eq!(
            sched.set_handler(SIGSTOP, HandlerSlot::Ignore),
            Err(Error::Invalid)
        );
        assert!(sched.set_handler(SIGUSR1, HandlerSlot::Ignore).is_ok());
    }
}
