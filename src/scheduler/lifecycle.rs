use alloc::string::String;
use alloc::sync::Arc;
use spin::Mutex;

use super::context::TaskEntry;
use super::process::{Pid, Process};
use super::Scheduler;
use crate::errno::{Error, Result};
use crate::memory::frames::PAGE_SIZE;
use crate::Kernel;

/// waitpid options.
pub const WNOHANG: u32 = 0x01;
pub const WSTOPPED: u32 = 0x02;
pub const WNOKERN: u32 = 0x10;

/// Top of the default user stack mapping.
pub const USER_STACK_TOP: u64 = 0x7000_0000;
pub const USER_STACK_PAGES: u64 = 4;

/// Duplicate the caller into a child process, copying identity, credentials,
/// image description and saved register state. `reuse_fds` shares the whole
/// descriptor table (threads); otherwise the table is duplicated entry by
/// entry with the entries referencing the same nodes.
fn spawn_from_current(
    kernel: &Kernel,
    entry: TaskEntry,
    arg: u64,
    reuse_fds: bool,
) -> Result<Pid> {
    let sched = kernel.sched();
    let mut inner = sched.inner.lock();
    let parent_pid = inner.current.ok_or(Error::NoProcess)?;

    let pid = inner.table.allocate_pid();
    let mut child = Scheduler::build_task_locked(&mut inner, pid, "", kernel, entry, arg);

    {
        let parent = inner.table.get(parent_pid).ok_or(Error::NoProcess)?;
        child.name = parent.name.clone();
        child.user = parent.user;
        child.real_user = parent.real_user;
        child.mask = parent.mask;
        child.job = parent.job;
        child.session = parent.session;
        child.image = parent.image;
        child.thread = parent.thread.clone();
        child.is_daemon = parent.is_daemon;
        child.wd_path = parent.wd_path.clone();
        child.wd_node = parent.wd_node.as_ref().map(crate::fs::node::clone_fs);
        child.fds = if reuse_fds {
            parent.fds.clone()
        } else {
            Arc::new(Mutex::new(parent.fds.lock().duplicate()))
        };
        child.parent = Some(parent_pid);
    }

    if let Some(parent) = inner.table.get_mut(parent_pid) {
        parent.children.push(pid);
    }
    inner.table.insert(child);
    Scheduler::make_ready_locked(&mut inner, pid, false);
    Ok(pid)
}

/// The body every forked child starts in: hand control to the user-resume
/// seam (the external program image) and exit with whatever it returns.
extern "C" fn forked_child_main(kernel: &Kernel, _arg: u64) {
    let status = match kernel.user_resume() {
        Some(resume) => resume(kernel),
        None => 0,
    };
    kernel.sched().exit_current((status & 0xFF) << 8);
}

/// fork: duplicate the calling process. The address space is deep-copied,
/// the descriptor table duplicated by reference, the saved register state
/// copied. The child lands on the ready queue; the parent gets the child id
/// back, the child observes zero through the resume seam.
pub fn fork(kernel: &Kernel) -> Result<Pid> {
    let parent_space = kernel.sched().with_current(|p| p.space.clone()).flatten();
    let child_space = match parent_space {
        Some(space) => Some(kernel.mem().clone_address_space(&space)?),
        None => None,
    };

    let pid = spawn_from_current(kernel, forked_child_main, 0, false)?;
    kernel.sched().with_process(pid, |child| {
        child.space = child_space;
    });
    Ok(pid)
}

/// clone: like fork, but the address space and descriptor table are shared
/// and the child starts at a caller-supplied entry point with its own stack
/// rather than resuming the parent's program counter.
pub fn clone_task(kernel: &Kernel, entry: TaskEntry, arg: u64) -> Result<Pid> {
    let (space, group) = kernel
        .sched()
        .with_current(|p| (p.space.clone(), p.group))
        .ok_or(Error::NoProcess)?;

    let pid = spawn_from_current(kernel, entry, arg, true)?;
    kernel.sched().with_process(pid, |child| {
        child.space = space;
        child.group = group;
    });
    Ok(pid)
}

/// Spawn a detached kernel task (daemons, the shell). Parented to the
/// caller but with a fresh descriptor table.
pub fn spawn_kernel_task(kernel: &Kernel, entry: TaskEntry, name: &str, arg: u64) -> Result<Pid> {
    let pid = spawn_from_current(kernel, entry, arg, false)?;
    kernel.sched().with_process(pid, |child| {
        child.name = String::from(name);
        child.fds = Arc::new(Mutex::new(super::process::FdTable::new()));
    });
    Ok(pid)
}

// ──────────────────────────────────────────────────────────────
//  wait / reap
// ──────────────────────────────────────────────────────────────

fn wait_candidate(parent: &Process, pid: i32, options: u32, child: &Process) -> bool {
    if options & WNOKERN != 0 && child.is_daemon {
        return false;
    }
    if pid < -1 {
        child.job.0 == -pid || child.id.0 == -pid
    } else if pid == 0 {
        child.job == parent.id
    } else if pid > 0 {
        child.id.0 == pid
    } else {
        true
    }
}

/// Block until a child matching the selector is finished (or stopped, with
/// `WSTOPPED`). Finished children are reaped: their table entry is removed,
/// their children reparented to init, and their pid recycled.
pub fn waitpid(kernel: &Kernel, pid: i32, options: u32) -> Result<(Pid, i32)> {
    let sched = kernel.sched();
    loop {
        enum Found {
            None,
            Stopped(Pid, i32),
            Finished(Pid, i32),
        }

        let (found, has_children, own_queue) = {
            let inner = sched.inner.lock();
            let me = inner.current.ok_or(Error::NoProcess)?;
            // Threads wait on behalf of their group leader.
            let waiter = inner
                .table
                .get(me)
                .map(|p| p.group)
                .filter(|g| inner.table.contains(*g))
                .unwrap_or(me);
            let parent = inner.table.get(waiter).ok_or(Error::NoProcess)?;

            let mut found = Found::None;
            let mut has_children = false;
            for &child_pid in &parent.children {
                let child = match inner.table.get(child_pid) {
                    Some(c) => c,
                    None => continue,
                };
                if !wait_candidate(parent, pid, options, child) {
                    continue;
                }
                has_children = true;
                if child.finished {
                    found = Found::Finished(child.id, child.status);
                    break;
                }
                if options & WSTOPPED != 0 && child.suspended {
                    found = Found::Stopped(child.id, child.status);
                    break;
                }
            }
            (found, has_children, parent.wait_queue)
        };

        if !has_children {
            return Err(Error::NoChild);
        }
        match found {
            Found::Finished(cpid, status) => {
                reap(kernel, cpid);
                return Ok((cpid, status));
            }
            Found::Stopped(cpid, status) => {
                return Ok((cpid, status));
            }
            Found::None => {
                if options & WNOHANG != 0 {
                    return Ok((Pid(0), 0));
                }
                if sched.sleep_on(own_queue) {
                    return Err(Error::Interrupted);
                }
            }
        }
    }
}

/// Final removal of a finished process: unlink it from the tree (children
/// reparented to init, never left dangling) and recycle its id.
pub fn reap(kernel: &Kernel, pid: Pid) {
    let sched = kernel.sched();
    let (corpse, orphans_moved, init_queue) = {
        let mut inner = sched.inner.lock();
        let corpse = match inner.table.remove(pid) {
            Some(c) => c,
            None => return,
        };
        // Reparent children to the tree root.
        for &kid in &corpse.children {
            if let Some(child) = inner.table.get_mut(kid) {
                child.parent = Some(Pid(1));
            }
        }
        if let Some(init) = inner.table.get_mut(Pid(1)) {
            let mut kids = corpse.children.clone();
            init.children.append(&mut kids);
        }
        if let Some(parent) = corpse.parent {
            if let Some(parent) = inner.table.get_mut(parent) {
                parent.children.retain(|&c| c != pid);
            }
        }
        inner.queues.destroy(corpse.wait_queue);
        inner.table.release_pid(pid);
        let init_queue = inner.table.get(Pid(1)).map(|p| p.wait_queue);
        let orphans_moved = !corpse.children.is_empty();
        (corpse, orphans_moved, init_queue)
    };

    // Dropped outside the lock: close hooks may call back into the
    // scheduler.
    drop(corpse);

    if orphans_moved {
        if let Some(queue) = init_queue {
            sched.wakeup_queue(queue);
        }
    }
}

// ──────────────────────────────────────────────────────────────
//  Program image handoff (consumed by the external loader)
// ──────────────────────────────────────────────────────────────

/// One loader-chosen mapping request.
pub struct ImageSegment<'a> {
    pub vaddr: u64,
    pub data: &'a [u8],
    pub writable: bool,
}

/// Install a fresh address space for `pid`, map the supplied segments at
/// their chosen addresses, and place the argument/environment vectors and
/// auxiliary-vector block just below the computed heap start. Returns the
/// address of the vector block.
pub fn setup_image(
    kernel: &Kernel,
    pid: Pid,
    entry: u64,
    segments: &[ImageSegment],
    argv: &[&str],
    envp: &[&str],
    auxv: &[(u64, u64)],
) -> Result<u64> {
    let page = PAGE_SIZE as u64;
    let space = kernel.mem().new_address_space();

    let mut image_end = 0u64;
    {
        let mut dir = space.lock();
        for seg in segments {
            let first = seg.vaddr & !(page - 1);
            let last = seg.vaddr + seg.data.len() as u64;
            let mut at = first;
            while at < last {
                dir.alloc_frame_at(at, false, seg.writable)?;
                at += page;
            }
            dir.write(seg.vaddr, seg.data)?;
            image_end = image_end.max(last);
        }
    }

    // Vector block layout: argc, argv pointers, NULL, envp pointers, NULL,
    // auxv pairs, then the string data itself.
    let words = 1 + argv.len() + 1 + envp.len() + 1 + 2 * (auxv.len() + 1);
    let strings: usize = argv.iter().chain(envp.iter()).map(|s| s.len() + 1).sum();
    let block_size = (words * 8 + strings) as u64;

    let block_base = (image_end + page - 1) & !(page - 1);
    let heap_start = (block_base + block_size + page - 1) & !(page - 1);
    kernel.mem().map_region(&space, block_base, block_size)?;

    {
        let dir = space.lock();
        let mut ptr_at = block_base;
        let mut str_at = block_base + (words * 8) as u64;
        let write_word = |at: &mut u64, value: u64| -> Result<()> {
            dir.write(*at, &value.to_le_bytes())?;
            *at += 8;
            Ok(())
        };

        write_word(&mut ptr_at, argv.len() as u64)?;
        for list in [argv, envp] {
            for s in list {
                write_word(&mut ptr_at, str_at)?;
                dir.write(str_at, s.as_bytes())?;
                dir.write(str_at + s.len() as u64, &[0])?;
                str_at += s.len() as u64 + 1;
            }
            write_word(&mut ptr_at, 0)?;
        }
        for (key, value) in auxv {
            write_word(&mut ptr_at, *key)?;
            write_word(&mut ptr_at, *value)?;
        }
        write_word(&mut ptr_at, 0)?;
        write_word(&mut ptr_at, 0)?;
    }

    // A default user stack below USER_STACK_TOP.
    kernel
        .mem()
        .map_region(&space, USER_STACK_TOP - USER_STACK_PAGES * page, USER_STACK_PAGES * page)?;

    kernel
        .sched()
        .with_process(pid, |proc| {
            proc.space = Some(space.clone());
            proc.image.entry = entry;
            proc.image.start = entry;
            proc.image.heap = heap_start;
            proc.image.heap_actual = heap_start;
            proc.image.user_stack = USER_STACK_TOP;
            proc.image.size = image_end;
            proc.thread.ip = entry;
            proc.thread.sp = USER_STACK_TOP;
            proc.thread.bp = USER_STACK_TOP;
        })
        .ok_or(Error::NoProcess)?;

    Ok(block_base)
}

// Tests for this module drive real context switches; they live with the
// kernel-level scenario tests in `syscalls`.
