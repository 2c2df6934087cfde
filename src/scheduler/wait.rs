use alloc::collections::VecDeque;
use alloc::vec::Vec;

use super::process::{FswaitOutcome, Pid, ProcLocation};
use super::{SchedInner, Scheduler};
use crate::errno::Result;
use crate::fs::node::NodeHandle;

/// Handle to one wait list in the registry. Processes and device backends
/// (pipes, ttys) each own their queues by id, never by pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitQueueId(usize);

/// Arena of wait lists. Queue storage is owned here; everyone else deals in
/// `WaitQueueId` handles, so a stale holder cannot dangle.
pub struct WaitRegistry {
    queues: Vec<Option<VecDeque<Pid>>>,
    free: Vec<usize>,
}

impl WaitRegistry {
    pub fn new() -> Self {
        WaitRegistry {
            queues: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn create(&mut self) -> WaitQueueId {
        match self.free.pop() {
            Some(idx) => {
                self.queues[idx] = Some(VecDeque::new());
                WaitQueueId(idx)
            }
            None => {
                self.queues.push(Some(VecDeque::new()));
                WaitQueueId(self.queues.len() - 1)
            }
        }
    }

    pub fn destroy(&mut self, id: WaitQueueId) {
        if let Some(slot) = self.queues.get_mut(id.0) {
            *slot = None;
            self.free.push(id.0);
        }
    }

    pub fn push(&mut self, id: WaitQueueId, pid: Pid) {
        if let Some(Some(queue)) = self.queues.get_mut(id.0) {
            queue.push_back(pid);
        }
    }

    pub fn pop_front(&mut self, id: WaitQueueId) -> Option<Pid> {
        self.queues.get_mut(id.0)?.as_mut()?.pop_front()
    }

    pub fn remove(&mut self, id: WaitQueueId, pid: Pid) {
        if let Some(Some(queue)) = self.queues.get_mut(id.0) {
            queue.retain(|p| *p != pid);
        }
    }

    pub fn len(&self, id: WaitQueueId) -> usize {
        self.queues
            .get(id.0)
            .and_then(|q| q.as_ref())
            .map_or(0, |q| q.len())
    }
}

/// One entry in the timed-sleep list, ordered by absolute deadline.
pub struct Sleeper {
    pub pid: Pid,
    pub end_tick: u64,
    pub end_subtick: u64,
    /// A multi-node wait timeout rather than a plain sleep.
    pub fswait: bool,
}

impl Sleeper {
    fn due(&self, ticks: u64, subticks: u64) -> bool {
        self.end_tick < ticks || (self.end_tick == ticks && self.end_subtick <= subticks)
    }
}

// ──────────────────────────────────────────────────────────────
//  Scheduler wait operations
// ──────────────────────────────────────────────────────────────

impl Scheduler {
    pub fn create_wait_queue(&self) -> WaitQueueId {
        self.inner.lock().queues.create()
    }

    pub fn destroy_wait_queue(&self, id: WaitQueueId) {
        self.inner.lock().queues.destroy(id);
    }

    /// Block the current process on a wait list. Returns true when the wake
    /// was an interrupted one (cancellation rather than data-ready).
    pub fn sleep_on(&self, queue: WaitQueueId) -> bool {
        let me = {
            let mut inner = self.inner.lock();
            let me = match inner.current {
                Some(pid) => pid,
                None => return false,
            };
            if let Some(proc) = inner.table.get_mut(me) {
                proc.sleep_interrupted = false;
                proc.location = ProcLocation::WaitingOn(queue);
            }
            inner.queues.push(queue, me);
            me
        };
        self.switch_task(false);
        let inner = self.inner.lock();
        inner
            .table
            .get(me)
            .map(|p| p.sleep_interrupted)
            .unwrap_or(false)
    }

    /// Drain every process off a wait list back onto the ready queue, in
    /// list order. Returns how many woke.
    pub fn wakeup_queue(&self, queue: WaitQueueId) -> usize {
        let mut inner = self.inner.lock();
        Self::wakeup_queue_locked(&mut inner, queue, false)
    }

    /// Like `wakeup_queue` but marks each wake as interrupted, so blocked
    /// callers can tell cancellation from data-ready.
    pub fn wakeup_queue_interrupted(&self, queue: WaitQueueId) -> usize {
        let mut inner = self.inner.lock();
        Self::wakeup_queue_locked(&mut inner, queue, true)
    }

    pub(crate) fn wakeup_queue_locked(
        inner: &mut SchedInner,
        queue: WaitQueueId,
        interrupted: bool,
    ) -> usize {
        let mut awoken = 0;
        while let Some(pid) = inner.queues.pop_front(queue) {
            let eligible = match inner.table.get_mut(pid) {
                Some(proc) if !proc.finished => {
                    proc.location = ProcLocation::Nowhere;
                    if interrupted {
                        proc.sleep_interrupted = true;
                    }
                    true
                }
                _ => false,
            };
            if eligible {
                Self::make_ready_locked(inner, pid, false);
            }
            awoken += 1;
        }
        awoken
    }

    /// Link a process into the timed-sleep list at its deadline-ordered
    /// position. The caller blocks it with `switch_task(false)` afterwards.
    pub fn sleep_until(&self, seconds: u64, subseconds: u64) {
        let mut inner = self.inner.lock();
        let me = match inner.current {
            Some(pid) => pid,
            None => return,
        };
        match inner.table.get_mut(me) {
            Some(proc) if proc.location == ProcLocation::Running => {
                proc.location = ProcLocation::Sleeping;
            }
            _ => return,
        }
        Self::insert_sleeper_locked(
            &mut inner,
            Sleeper {
                pid: me,
                end_tick: seconds,
                end_subtick: subseconds,
                fswait: false,
            },
        );
    }

    pub(crate) fn insert_sleeper_locked(inner: &mut SchedInner, sleeper: Sleeper) {
        let at = inner
            .sleepers
            .iter()
            .position(|s| {
                s.end_tick > sleeper.end_tick
                    || (s.end_tick == sleeper.end_tick && s.end_subtick > sleeper.end_subtick)
            })
            .unwrap_or(inner.sleepers.len());
        inner.sleepers.insert(at, sleeper);
    }

    /// Consulted once per timer tick: unlink every sleeper whose deadline
    /// has passed and wake its process (or its waiting descriptor).
    pub fn wakeup_sleepers(&self) {
        let mut inner = self.inner.lock();
        let (ticks, subticks) = (inner.ticks, inner.subticks);
        while let Some(first) = inner.sleepers.first() {
            if !first.due(ticks, subticks) {
                break;
            }
            let sleeper = inner.sleepers.remove(0);
            if sleeper.fswait {
                Self::awaken_from_fswait_locked(&mut inner, sleeper.pid, FswaitOutcome::Timeout);
            } else {
                let was_sleeping = match inner.table.get_mut(sleeper.pid) {
                    Some(proc) if proc.location == ProcLocation::Sleeping => {
                        proc.location = ProcLocation::Nowhere;
                        true
                    }
                    _ => false,
                };
                if was_sleeping {
                    Self::make_ready_locked(&mut inner, sleeper.pid, false);
                }
            }
        }
    }

    // ── multi-node wait (fswait) ─────────────────────────────

    /// Called by backend selectwait hooks: record a wait key on the current
    /// wait set, preserving registration order as the result index.
    pub fn push_node_wait(&self, pid: Pid, key: u64) {
        let mut inner = self.inner.lock();
        if let Some(proc) = inner.table.get_mut(pid) {
            if let Some(waits) = proc.node_waits.as_mut() {
                waits.push(key);
            }
        }
    }

    /// Called by a backend when its node becomes ready: wake the waiter with
    /// the index it registered under. Returns false for stale alerts.
    pub fn alert_node(&self, pid: Pid, key: u64) -> bool {
        let mut inner = self.inner.lock();
        if !inner.table.contains(pid) {
            return false;
        }
        let index = match inner
            .table
            .get(pid)
            .and_then(|p| p.node_waits.as_ref())
            .and_then(|waits| waits.iter().position(|k| *k == key))
        {
            Some(i) => i,
            None => return false,
        };
        Self::awaken_from_fswait_locked(&mut inner, pid, FswaitOutcome::Ready(index));
        true
    }

    pub(crate) fn awaken_from_fswait_locked(
        inner: &mut SchedInner,
        pid: Pid,
        outcome: FswaitOutcome,
    ) {
        let timeout_pending = match inner.table.get_mut(pid) {
            Some(proc) => {
                if proc.node_waits.is_none() {
                    return;
                }
                proc.fswait_result = Some(outcome);
                proc.node_waits = None;
                let pending = proc.timeout_pending;
                proc.timeout_pending = false;
                proc.location = ProcLocation::Nowhere;
                pending
            }
            None => return,
        };
        if timeout_pending && outcome != FswaitOutcome::Timeout {
            inner.sleepers.retain(|s| !(s.fswait && s.pid == pid));
        }
        Self::make_ready_locked(inner, pid, false);
    }

    /// Block on the first-ready of a set of nodes, with an optional relative
    /// timeout in subticks. Nodes that cannot select fail the whole call.
    pub fn wait_nodes(&self, nodes: &[NodeHandle], timeout: Option<u64>) -> Result<FswaitOutcome> {
        // Fast path: anything already readable?
        for (i, node) in nodes.iter().enumerate() {
            if node.selectcheck()? {
                return Ok(FswaitOutcome::Ready(i));
            }
        }
        if timeout == Some(0) {
            return Ok(FswaitOutcome::Timeout);
        }

        let me = {
            let mut inner = self.inner.lock();
            let me = match inner.current {
                Some(pid) => pid,
                None => return Ok(FswaitOutcome::Interrupted),
            };
            if let Some(proc) = inner.table.get_mut(me) {
                proc.node_waits = Some(Vec::new());
                proc.fswait_result = None;
            }
            me
        };

        // Each node registers us through its select-wait hook.
        for node in nodes {
            if node.selectwait(me).is_err() {
                crate::log_warn!("fswait: node '{}' has no selectwait hook", node.name);
            }
        }

        if let Some(relative) = timeout {
            let (s, ss) = self.relative_time(0, relative);
            let mut inner = self.inner.lock();
            if let Some(proc) = inner.table.get_mut(me) {
                proc.timeout_pending = true;
            }
            Self::insert_sleeper_locked(
                &mut inner,
                Sleeper {
                    pid: me,
                    end_tick: s,
                    end_subtick: ss,
                    fswait: true,
                },
            );
        }

        {
            let mut inner = self.inner.lock();
            if let Some(proc) = inner.table.get_mut(me) {
                proc.location = ProcLocation::FsWait;
            }
        }
        self.switch_task(false);

        let mut inner = self.inner.lock();
        let outcome = inner
            .table
            .get_mut(me)
            .and_then(|p| p.fswait_result.take())
            .unwrap_or(FswaitOutcome::Interrupted);
        Ok(outcome)
    }
}
