use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use super::node::{FsNode, Metadata, NodeHandle, NodeKind, NodeOps};
use crate::errno::Result;
use crate::scheduler::process::Pid;
use crate::scheduler::signal::SIGPIPE;
use crate::scheduler::{Scheduler, WaitQueueId};

pub const PIPE_BUFFER_SIZE: usize = 4096;

/// Ring buffer state shared by both endpoints.
struct PipeBuffer {
    data: Vec<u8>,
    read_ptr: usize,
    write_ptr: usize,
    read_closed: bool,
    write_closed: bool,
    /// Set when an endpoint closes so a cancelled sleeper can tell the
    /// difference from a data-ready wake.
    internal_stop: bool,
    /// Processes registered through selectwait, drained on every alert.
    alert_waiters: Vec<Pid>,
}

impl PipeBuffer {
    fn unread(&self) -> usize {
        if self.read_ptr <= self.write_ptr {
            self.write_ptr - self.read_ptr
        } else {
            (self.data.len() - self.read_ptr) + self.write_ptr
        }
    }

    fn available(&self) -> usize {
        self.data.len() - 1 - self.unread()
    }

    fn pop(&mut self) -> Option<u8> {
        if self.unread() == 0 {
            return None;
        }
        let byte = self.data[self.read_ptr];
        self.read_ptr = (self.read_ptr + 1) % self.data.len();
        Some(byte)
    }

    fn push(&mut self, byte: u8) -> bool {
        if self.available() == 0 {
            return false;
        }
        self.data[self.write_ptr] = byte;
        self.write_ptr = (self.write_ptr + 1) % self.data.len();
        true
    }
}

/// The shared half of a unix pipe: buffer plus the two wait lists blocked
/// readers and writers sleep on.
pub struct PipeState {
    sched: Arc<Scheduler>,
    buffer: Mutex<PipeBuffer>,
    readers: WaitQueueId,
    writers: WaitQueueId,
}

/// Wait key handed to fswait registrations; both endpoints share it.
fn wait_key(state: &Arc<PipeState>) -> u64 {
    Arc::as_ptr(state) as u64
}

/// Wake every process fswait-ing on this pipe.
fn alert_waiters(state: &Arc<PipeState>) {
    let waiting: Vec<Pid> = core::mem::take(&mut state.buffer.lock().alert_waiters);
    for pid in waiting {
        state.sched.alert_node(pid, wait_key(state));
    }
}

impl Drop for PipeState {
    fn drop(&mut self) {
        self.sched.destroy_wait_queue(self.readers);
        self.sched.destroy_wait_queue(self.writers);
    }
}

struct PipeReadOps {
    state: Arc<PipeState>,
}

struct PipeWriteOps {
    state: Arc<PipeState>,
}

impl NodeOps for PipeReadOps {
    /// Blocking, newline-aware read: returns on a full buffer, a newline,
    /// or end-of-stream (writer gone and drained).
    fn read(&self, _node: &FsNode, _offset: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let state = &self.state;
        let mut collected = 0;
        loop {
            let (byte, write_closed) = {
                let mut inner = state.buffer.lock();
                (inner.pop(), inner.write_closed)
            };
            match byte {
                Some(b) => {
                    buf[collected] = b;
                    collected += 1;
                    if b == b'\n' || collected == buf.len() {
                        break;
                    }
                }
                None => {
                    if collected > 0 || write_closed {
                        break;
                    }
                    state.sched.wakeup_queue(state.writers);
                    let interrupted = state.sched.sleep_on(state.readers);
                    if interrupted {
                        let mut inner = state.buffer.lock();
                        if inner.internal_stop {
                            inner.internal_stop = false;
                            break;
                        }
                    }
                }
            }
        }
        state.sched.wakeup_queue(state.writers);
        Ok(collected)
    }

    fn close(&self, _node: &FsNode) {
        let state = &self.state;
        let write_closed = {
            let mut inner = state.buffer.lock();
            inner.read_closed = true;
            if !inner.write_closed {
                inner.internal_stop = true;
            }
            inner.write_closed
        };
        if !write_closed {
            state.sched.wakeup_queue_interrupted(state.readers);
            state.sched.wakeup_queue_interrupted(state.writers);
        }
        alert_waiters(state);
    }

    fn selectcheck(&self, _node: &FsNode) -> Result<bool> {
        let inner = self.state.buffer.lock();
        Ok(inner.unread() > 0 || inner.write_closed)
    }

    fn selectwait(&self, _node: &FsNode, waiter: Pid) -> Result<()> {
        let state = &self.state;
        {
            let mut inner = state.buffer.lock();
            if !inner.alert_waiters.contains(&waiter) {
                inner.alert_waiters.push(waiter);
            }
        }
        state.sched.push_node_wait(waiter, wait_key(state));
        Ok(())
    }
}

impl NodeOps for PipeWriteOps {
    /// Blocking write: sleeps when the ring is full, signals SIGPIPE once
    /// the read end is gone.
    fn write(&self, _node: &FsNode, _offset: u64, data: &[u8]) -> Result<usize> {
        let state = &self.state;
        let mut written = 0;
        while written < data.len() {
            let read_closed = {
                let mut inner = state.buffer.lock();
                while written < data.len() && inner.push(data[written]) {
                    written += 1;
                }
                inner.read_closed
            };
            if read_closed {
                let me = state.sched.current_pid();
                let _ = state.sched.send_signal(me, SIGPIPE, true);
                return Ok(written);
            }
            state.sched.wakeup_queue(state.readers);
            alert_waiters(state);
            if written < data.len() {
                let interrupted = state.sched.sleep_on(state.writers);
                if interrupted {
                    let mut inner = state.buffer.lock();
                    if inner.internal_stop {
                        inner.internal_stop = false;
                        break;
                    }
                }
            }
        }
        state.sched.wakeup_queue(state.readers);
        alert_waiters(state);
        Ok(written)
    }

    fn close(&self, _node: &FsNode) {
        let state = &self.state;
        let read_closed = {
            let mut inner = state.buffer.lock();
            inner.write_closed = true;
            if !inner.read_closed {
                inner.internal_stop = true;
            }
            inner.read_closed
        };
        if !read_closed {
            // Blocked readers must wake to observe end-of-stream.
            state.sched.wakeup_queue_interrupted(state.readers);
            state.sched.wakeup_queue_interrupted(state.writers);
            alert_waiters(state);
        }
    }
}

/// Build a connected pipe, returning (read end, write end).
pub fn make_pipe(sched: Arc<Scheduler>, size: usize) -> (NodeHandle, NodeHandle) {
    let state = Arc::new(PipeState {
        readers: sched.create_wait_queue(),
        writers: sched.create_wait_queue(),
        sched,
        buffer: Mutex::new(PipeBuffer {
            data: vec![0; size.max(2)],
            read_ptr: 0,
            write_ptr: 0,
            read_closed: false,
            write_closed: false,
            internal_stop: false,
            alert_waiters: Vec::new(),
        }),
    });

    let mode = Metadata {
        mask: 0o666,
        ..Metadata::default()
    };
    let read_end = FsNode::new(
        "[pipe:read]",
        NodeKind::Pipe,
        0,
        mode.clone(),
        Arc::new(PipeReadOps {
            state: state.clone(),
        }),
    );
    let write_end = FsNode::new(
        "[pipe:write]",
        NodeKind::Pipe,
        0,
        mode,
        Arc::new(PipeWriteOps { state }),
    );
    (read_end, write_end)
}
