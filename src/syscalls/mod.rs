use alloc::string::String;
use alloc::vec::Vec;

use crate::errno::{Error, Result};
use crate::fs::node::{NodeHandle, NodeKind, OpenFlags};
use crate::fs::pipe::{make_pipe, PIPE_BUFFER_SIZE};
use crate::fs::Creds;
use crate::memory::frames::PAGE_SIZE;
use crate::memory::paging::TABLE_SPAN;
use crate::scheduler::context::TaskEntry;
use crate::scheduler::lifecycle;
use crate::scheduler::process::{HandlerSlot, Pid, FD_MODE_READ, FD_MODE_WRITE};
use crate::Kernel;

/// Syscall numbers (passed in the first register from userland).
pub const SYS_EXT: usize = 0;
pub const SYS_OPEN: usize = 1;
pub const SYS_READ: usize = 2;
pub const SYS_WRITE: usize = 3;
pub const SYS_CLOSE: usize = 4;
pub const SYS_GETPID: usize = 5;
pub const SYS_SBRK: usize = 6;
pub const SYS_FORK: usize = 7;
pub const SYS_CLONE: usize = 8;
pub const SYS_YIELD: usize = 9;
pub const SYS_SLEEPABS: usize = 10;
pub const SYS_SLEEP: usize = 11;
pub const SYS_WAITPID: usize = 12;
pub const SYS_KILL: usize = 13;
pub const SYS_SIGNAL: usize = 14;
pub const SYS_MOUNT: usize = 15;
pub const SYS_CHDIR: usize = 16;
pub const SYS_GETCWD: usize = 17;
pub const SYS_MKDIR: usize = 18;
pub const SYS_UNLINK: usize = 19;
pub const SYS_SYMLINK: usize = 20;
pub const SYS_READLINK: usize = 21;
pub const SYS_LSEEK: usize = 22;
pub const SYS_DUP2: usize = 23;
pub const SYS_PIPE: usize = 24;
pub const SYS_MMAP: usize = 25;
pub const SYS_FSWAIT: usize = 26;
pub const SYS_FSWAIT2: usize = 27;
pub const SYS_FSWAIT3: usize = 28;

pub const NUM_SYSCALLS: usize = 29;

const MAX_PATH: usize = 4096;

type SyscallFn = fn(&Kernel, [u64; 5]) -> Result<i64>;

/// The fixed dispatch table. A `None` slot is an unassigned number.
static SYSCALLS: [Option<SyscallFn>; NUM_SYSCALLS] = [
    Some(raw_exit),     // SYS_EXT
    Some(raw_open),     // SYS_OPEN
    Some(raw_read),     // SYS_READ
    Some(raw_write),    // SYS_WRITE
    Some(raw_close),    // SYS_CLOSE
    Some(raw_getpid),   // SYS_GETPID
    Some(raw_sbrk),     // SYS_SBRK
    Some(raw_fork),     // SYS_FORK
    Some(raw_clone),    // SYS_CLONE
    Some(raw_yield),    // SYS_YIELD
    Some(raw_sleepabs), // SYS_SLEEPABS
    Some(raw_sleep),    // SYS_SLEEP
    Some(raw_waitpid),  // SYS_WAITPID
    Some(raw_kill),     // SYS_KILL
    Some(raw_signal),   // SYS_SIGNAL
    Some(raw_mount),    // SYS_MOUNT
    Some(raw_chdir),    // SYS_CHDIR
    Some(raw_getcwd),   // SYS_GETCWD
    Some(raw_mkdir),    // SYS_MKDIR
    Some(raw_unlink),   // SYS_UNLINK
    Some(raw_symlink),  // SYS_SYMLINK
    Some(raw_readlink), // SYS_READLINK
    Some(raw_lseek),    // SYS_LSEEK
    Some(raw_dup2),     // SYS_DUP2
    Some(raw_pipe),     // SYS_PIPE
    Some(raw_mmap),     // SYS_MMAP
    Some(raw_fswait),   // SYS_FSWAIT
    Some(raw_fswait2),  // SYS_FSWAIT2
    Some(raw_fswait3),  // SYS_FSWAIT3
];

/// Central dispatcher: negative results are negated error codes, exactly as
/// the interrupt stub would hand them back to the calling process.
pub fn dispatch(kernel: &Kernel, number: usize, args: [u64; 5]) -> i64 {
    let handler = match SYSCALLS.get(number).copied().flatten() {
        Some(f) => f,
        None => {
            crate::log_warn!("syscall: unknown number {}", number);
            return -(Error::Invalid.errno() as i64);
        }
    };
    match handler(kernel, args) {
        Ok(value) => value,
        Err(e) => -(e.errno() as i64),
    }
}

// ──────────────────────────────────────────────────────────────
//  User-memory plumbing
// ──────────────────────────────────────────────────────────────

fn current_space(kernel: &Kernel) -> Result<crate::memory::paging::AddressSpace> {
    kernel
        .sched()
        .with_current(|p| p.space.clone())
        .flatten()
        .ok_or(Error::Fault)
}

/// Invalid pointer ranges from user space are rejected before dereference.
fn validate_ptr(kernel: &Kernel, ptr: u64) -> Result<()> {
    let entry = kernel
        .sched()
        .with_current(|p| p.image.entry)
        .ok_or(Error::NoProcess)?;
    if ptr == 0 || ptr <= entry {
        return Err(Error::Fault);
    }
    Ok(())
}

fn read_user_str(kernel: &Kernel, ptr: u64) -> Result<String> {
    validate_ptr(kernel, ptr)?;
    current_space(kernel)?.lock().read_cstr(ptr, MAX_PATH)
}

fn read_user_buf(kernel: &Kernel, ptr: u64, len: usize) -> Result<Vec<u8>> {
    validate_ptr(kernel, ptr)?;
    let mut buf = alloc::vec![0u8; len];
    current_space(kernel)?.lock().read(ptr, &mut buf)?;
    Ok(buf)
}

fn write_user_buf(kernel: &Kernel, ptr: u64, data: &[u8]) -> Result<()> {
    validate_ptr(kernel, ptr)?;
    current_space(kernel)?.lock().write(ptr, data)
}

fn current_creds(kernel: &Kernel) -> Result<(Creds, String)> {
    kernel
        .sched()
        .with_current(|p| (Creds { user: p.user }, p.wd_path.clone()))
        .ok_or(Error::NoProcess)
}

// ──────────────────────────────────────────────────────────────
//  Typed operations (kernel-side entry points)
// ──────────────────────────────────────────────────────────────

/// Creation modes are filtered through the caller's umask.
fn apply_umask(kernel: &Kernel, mode: u16) -> u16 {
    kernel
        .sched()
        .with_current(|p| mode & !p.mask)
        .unwrap_or(mode)
}

pub fn sys_open(kernel: &Kernel, path: &str, flags: OpenFlags, mode: u16) -> Result<i64> {
    let (creds, cwd) = current_creds(kernel)?;
    let mode = apply_umask(kernel, mode);
    let (node, access, offset) = kernel.vfs().open(creds, &cwd, path, flags, mode)?;
    let fd = kernel
        .sched()
        .with_current(|p| {
            let mut fds = p.fds.lock();
            let fd = fds.append(node, access);
            if let Some(entry) = fds.get_mut(fd) {
                entry.offset = offset;
            }
            fd
        })
        .ok_or(Error::NoProcess)?;
    Ok(fd as i64)
}

/// Pull the node and offset out of a descriptor without holding the table
/// lock across a potentially blocking backend call.
fn fd_node(kernel: &Kernel, fd: usize, wanted_mode: u16) -> Result<(NodeHandle, u64)> {
    kernel
        .sched()
        .with_current(|p| {
            let fds = p.fds.lock();
            match fds.get(fd) {
                Some(entry) => {
                    if entry.mode & wanted_mode != wanted_mode {
                        Err(Error::Access)
                    } else {
                        Ok((entry.node.clone(), entry.offset))
                    }
                }
                None => Err(Error::BadFd),
            }
        })
        .ok_or(Error::NoProcess)?
}

fn advance_fd(kernel: &Kernel, fd: usize, by: u64) {
    kernel.sched().with_current(|p| {
        if let Some(entry) = p.fds.lock().get_mut(fd) {
            entry.offset += by;
        }
    });
}

pub fn sys_read(kernel: &Kernel, fd: usize, buf: &mut [u8]) -> Result<i64> {
    let (node, offset) = fd_node(kernel, fd, FD_MODE_READ)?;
    let out = node.read(offset, buf)?;
    advance_fd(kernel, fd, out as u64);
    Ok(out as i64)
}

pub fn sys_write(kernel: &Kernel, fd: usize, data: &[u8]) -> Result<i64> {
    let (node, offset) = fd_node(kernel, fd, FD_MODE_WRITE)?;
    let out = node.write(offset, data)?;
    advance_fd(kernel, fd, out as u64);
    Ok(out as i64)
}

pub fn sys_close(kernel: &Kernel, fd: usize) -> Result<i64> {
    let entry = kernel
        .sched()
        .with_current(|p| p.fds.lock().take(fd))
        .ok_or(Error::NoProcess)?;
    match entry {
        // Dropped here, outside every lock: the close hook may block-wake.
        Some(entry) => {
            drop(entry);
            Ok(0)
        }
        None => Err(Error::BadFd),
    }
}

pub fn sys_lseek(kernel: &Kernel, fd: usize, offset: i64, whence: u32) -> Result<i64> {
    let length = {
        let (node, _) = fd_node(kernel, fd, 0)?;
        node.meta().length
    };
    kernel
        .sched()
        .with_current(|p| {
            let mut fds = p.fds.lock();
            let entry = fds.get_mut(fd).ok_or(Error::BadFd)?;
            let base = match whence {
                0 => 0,
                1 => entry.offset as i64,
                2 => length as i64,
                _ => return Err(Error::Invalid),
            };
            let target = base + offset;
            if target < 0 {
                return Err(Error::Invalid);
            }
            entry.offset = target as u64;
            Ok(target)
        })
        .ok_or(Error::NoProcess)?
}

pub fn sys_dup2(kernel: &Kernel, src: usize, dst: usize) -> Result<i64> {
    let displaced = kernel
        .sched()
        .with_current(|p| p.fds.lock().dup2(src, dst))
        .ok_or(Error::NoProcess)?
        .ok_or(Error::BadFd)?;
    // The entry dst used to hold closes here, outside the scheduler lock.
    drop(displaced);
    Ok(dst as i64)
}

pub fn sys_pipe(kernel: &Kernel) -> Result<(usize, usize)> {
    let (read_end, write_end) = make_pipe(kernel.sched_handle(), PIPE_BUFFER_SIZE);
    kernel
        .sched()
        .with_current(|p| {
            let mut fds = p.fds.lock();
            let rfd = fds.append(read_end, FD_MODE_READ);
            let wfd = fds.append(write_end, FD_MODE_WRITE);
            (rfd, wfd)
        })
        .ok_or(Error::NoProcess)
}

pub fn sys_getpid(kernel: &Kernel) -> i64 {
    kernel.sched().current_pid().0 as i64
}

pub fn sys_yield(kernel: &Kernel) -> i64 {
    kernel.sched().yield_now();
    1
}

pub fn sys_sleepabs(kernel: &Kernel, seconds: u64, subseconds: u64) -> Result<i64> {
    let sched = kernel.sched();
    sched.sleep_until(seconds, subseconds);
    sched.switch_task(false);
    let (ticks, subticks) = sched.now();
    // Zero when the wake happened at or before the deadline.
    if seconds > ticks || (seconds == ticks && subseconds >= subticks) {
        Ok(0)
    } else {
        Ok(1)
    }
}

pub fn sys_sleep(kernel: &Kernel, seconds: u64, subseconds: u64) -> Result<i64> {
    let (s, ss) = kernel.sched().relative_time(seconds, subseconds * 10);
    sys_sleepabs(kernel, s, ss)
}

pub fn sys_waitpid(kernel: &Kernel, pid: i32, options: u32) -> Result<(Pid, i32)> {
    lifecycle::waitpid(kernel, pid, options)
}

pub fn sys_kill(kernel: &Kernel, pid: i32, signum: usize) -> Result<i64> {
    let sched = kernel.sched();
    if pid > 0 {
        sched.send_signal(Pid(pid), signum, false)?;
        Ok(0)
    } else if pid == 0 {
        let job = sched.with_current(|p| p.job).ok_or(Error::NoProcess)?;
        sched.group_send_signal(job, signum, false)?;
        Ok(0)
    } else if pid < -1 {
        sched.group_send_signal(Pid(-pid), signum, false)?;
        Ok(0)
    } else {
        Err(Error::Invalid)
    }
}

pub fn sys_signal(kernel: &Kernel, signum: usize, slot: HandlerSlot) -> Result<HandlerSlot> {
    kernel.sched().set_handler(signum, slot)
}

pub fn sys_mount(kernel: &Kernel, fs_type: &str, arg: &str, mountpoint: &str) -> Result<i64> {
    let (creds, _) = current_creds(kernel)?;
    if creds.user != 0 {
        return Err(Error::Access);
    }
    kernel.vfs().mount_type(fs_type, arg, mountpoint)?;
    Ok(0)
}

pub fn sys_chdir(kernel: &Kernel, path: &str) -> Result<i64> {
    let (_, cwd) = current_creds(kernel)?;
    let node = kernel.vfs().resolve(&cwd, path, OpenFlags::empty())?;
    if node.kind != NodeKind::Directory {
        return Err(Error::NotDirectory);
    }
    let canonical = crate::fs::path::canonicalize(&cwd, path);
    let previous = kernel.sched().with_current(|p| {
        p.wd_path = canonical;
        p.wd_node.replace(node)
    });
    drop(previous);
    Ok(0)
}

pub fn sys_getcwd(kernel: &Kernel) -> Result<String> {
    Ok(current_creds(kernel)?.1)
}

pub fn sys_mkdir(kernel: &Kernel, path: &str, mode: u16) -> Result<i64> {
    let (creds, cwd) = current_creds(kernel)?;
    let mode = apply_umask(kernel, mode);
    kernel.vfs().mkdir(creds, &cwd, path, mode)?;
    Ok(0)
}

pub fn sys_unlink(kernel: &Kernel, path: &str) -> Result<i64> {
    let (creds, cwd) = current_creds(kernel)?;
    kernel.vfs().unlink(creds, &cwd, path)?;
    Ok(0)
}

pub fn sys_symlink(kernel: &Kernel, target: &str, path: &str) -> Result<i64> {
    let (creds, cwd) = current_creds(kernel)?;
    kernel.vfs().symlink(creds, &cwd, target, path)?;
    Ok(0)
}

pub fn sys_readlink(kernel: &Kernel, path: &str, buf: &mut [u8]) -> Result<i64> {
    let (_, cwd) = current_creds(kernel)?;
    let node = kernel
        .vfs()
        .resolve(&cwd, path, OpenFlags::NOFOLLOW | OpenFlags::PATH)?;
    let target = node.readlink()?;
    let take = buf.len().min(target.len());
    buf[..take].copy_from_slice(&target.as_bytes()[..take]);
    Ok(take as i64)
}

/// Extend the caller's address space at a fixed address with fresh frames.
pub fn sys_mmap(kernel: &Kernel, address: u64, size: u64) -> Result<i64> {
    if size == 0 {
        return Err(Error::Invalid);
    }
    let space = current_space(kernel)?;
    kernel.mem().map_region(&space, address, size)?;
    Ok(address as i64)
}

/// Grow the process heap: pages are faulted in only up to the requested
/// size, with table entries pre-reserved further out.
pub fn sys_sbrk(kernel: &Kernel, size: u64) -> Result<i64> {
    let sched = kernel.sched();
    // Threads operate on their group leader's image.
    let me = sched.current_pid();
    let leader = sched
        .with_current(|p| p.group)
        .filter(|g| sched.with_process(*g, |_| ()).is_some())
        .unwrap_or(me);

    let space = sched
        .with_process(leader, |p| p.space.clone())
        .flatten()
        .ok_or(Error::Fault)?;

    let page = PAGE_SIZE as u64;
    let (ret, new_heap, mut actual) = sched
        .with_process(leader, |p| {
            let ret = (p.image.heap + page - 1) & !(page - 1);
            p.image.heap = ret + size;
            (ret, p.image.heap, p.image.heap_actual)
        })
        .ok_or(Error::NoProcess)?;

    {
        let mut dir = space.lock();
        while actual < new_heap {
            dir.alloc_frame_at(actual, false, true)?;
            actual += page;
        }
        // Reserve the covering table one span out so later growth cannot
        // fail on table allocation.
        dir.reserve_table(new_heap + TABLE_SPAN);
    }
    sched.with_process(leader, |p| p.image.heap_actual = actual);
    Ok(ret as i64)
}

/// Multi-node wait over open descriptors; returns the index of the first
/// ready one, or the descriptor count on timeout.
pub fn sys_fswait(kernel: &Kernel, fds: &[usize], timeout: Option<u64>) -> Result<i64> {
    let mut nodes = Vec::with_capacity(fds.len());
    for &fd in fds {
        let (node, _) = fd_node(kernel, fd, 0)?;
        nodes.push(node);
    }
    match kernel.sched().wait_nodes(&nodes, timeout)? {
        crate::scheduler::FswaitOutcome::Ready(i) => Ok(i as i64),
        crate::scheduler::FswaitOutcome::Timeout => Ok(fds.len() as i64),
        crate::scheduler::FswaitOutcome::Interrupted => Err(Error::Interrupted),
    }
}

// ──────────────────────────────────────────────────────────────
//  Raw (register-level) entries for the dispatch table
// ──────────────────────────────────────────────────────────────

fn raw_exit(kernel: &Kernel, args: [u64; 5]) -> Result<i64> {
    kernel.sched().exit_current(((args[0] as i32) & 0xFF) << 8);
}

fn raw_open(kernel: &Kernel, args: [u64; 5]) -> Result<i64> {
    let path = read_user_str(kernel, args[0])?;
    let flags = OpenFlags::from_bits_truncate(args[1] as u32);
    sys_open(kernel, &path, flags, args[2] as u16)
}

fn raw_read(kernel: &Kernel, args: [u64; 5]) -> Result<i64> {
    validate_ptr(kernel, args[1])?;
    let mut buf = alloc::vec![0u8; args[2] as usize];
    let out = sys_read(kernel, args[0] as usize, &mut buf)?;
    write_user_buf(kernel, args[1], &buf[..out as usize])?;
    Ok(out)
}

fn raw_write(kernel: &Kernel, args: [u64; 5]) -> Result<i64> {
    let data = read_user_buf(kernel, args[1], args[2] as usize)?;
    sys_write(kernel, args[0] as usize, &data)
}

fn raw_close(kernel: &Kernel, args: [u64; 5]) -> Result<i64> {
    sys_close(kernel, args[0] as usize)
}

fn raw_getpid(kernel: &Kernel, _args: [u64; 5]) -> Result<i64> {
    Ok(sys_getpid(kernel))
}

fn raw_sbrk(kernel: &Kernel, args: [u64; 5]) -> Result<i64> {
    sys_sbrk(kernel, args[0])
}

fn raw_fork(kernel: &Kernel, _args: [u64; 5]) -> Result<i64> {
    lifecycle::fork(kernel).map(|pid| pid.0 as i64)
}

fn raw_clone(kernel: &Kernel, args: [u64; 5]) -> Result<i64> {
    if args[1] == 0 {
        return Err(Error::Fault);
    }
    // The entry address comes from the (trusted) loader.
    let entry: TaskEntry = unsafe { core::mem::transmute(args[1] as usize) };
    let pid = lifecycle::clone_task(kernel, entry, args[2])?;
    kernel.sched().with_process(pid, |p| {
        p.thread.sp = args[0];
        p.thread.bp = args[0];
        p.thread.ip = args[1];
    });
    Ok(pid.0 as i64)
}

fn raw_yield(kernel: &Kernel, _args: [u64; 5]) -> Result<i64> {
    Ok(sys_yield(kernel))
}

fn raw_sleepabs(kernel: &Kernel, args: [u64; 5]) -> Result<i64> {
    sys_sleepabs(kernel, args[0], args[1])
}

fn raw_sleep(kernel: &Kernel, args: [u64; 5]) -> Result<i64> {
    sys_sleep(kernel, args[0], args[1])
}

fn raw_waitpid(kernel: &Kernel, args: [u64; 5]) -> Result<i64> {
    let (pid, status) = sys_waitpid(kernel, args[0] as i32, args[2] as u32)?;
    if args[1] != 0 {
        write_user_buf(kernel, args[1], &status.to_le_bytes())?;
    }
    Ok(pid.0 as i64)
}

fn raw_kill(kernel: &Kernel, args: [u64; 5]) -> Result<i64> {
    sys_kill(kernel, args[0] as i32, args[1] as usize)
}

fn raw_signal(kernel: &Kernel, args: [u64; 5]) -> Result<i64> {
    // Only the default/ignore sentinels cross the numeric boundary; custom
    // handlers are installed through the kernel-side API.
    let slot = match args[1] {
        0 => HandlerSlot::Default,
        1 => HandlerSlot::Ignore,
        _ => return Err(Error::Invalid),
    };
    let old = sys_signal(kernel, args[0] as usize, slot)?;
    Ok(match old {
        HandlerSlot::Default => 0,
        HandlerSlot::Ignore => 1,
        HandlerSlot::Custom(f) => f as usize as i64,
    })
}

fn raw_mount(kernel: &Kernel, args: [u64; 5]) -> Result<i64> {
    let arg = read_user_str(kernel, args[0])?;
    let path = read_user_str(kernel, args[1])?;
    let fs_type = read_user_str(kernel, args[2])?;
    sys_mount(kernel, &fs_type, &arg, &path)
}

fn raw_chdir(kernel: &Kernel, args: [u64; 5]) -> Result<i64> {
    let path = read_user_str(kernel, args[0])?;
    sys_chdir(kernel, &path)
}

fn raw_getcwd(kernel: &Kernel, args: [u64; 5]) -> Result<i64> {
    let cwd = sys_getcwd(kernel)?;
    let len = (args[1] as usize).min(cwd.len());
    write_user_buf(kernel, args[0], &cwd.as_bytes()[..len])?;
    write_user_buf(kernel, args[0] + len as u64, &[0])?;
    Ok(len as i64)
}

fn raw_mkdir(kernel: &Kernel, args: [u64; 5]) -> Result<i64> {
    let path = read_user_str(kernel, args[0])?;
    sys_mkdir(kernel, &path, args[1] as u16)
}

fn raw_unlink(kernel: &Kernel, args: [u64; 5]) -> Result<i64> {
    let path = read_user_str(kernel, args[0])?;
    sys_unlink(kernel, &path)
}

fn raw_symlink(kernel: &Kernel, args: [u64; 5]) -> Result<i64> {
    let target = read_user_str(kernel, args[0])?;
    let path = read_user_str(kernel, args[1])?;
    sys_symlink(kernel, &target, &path)
}

fn raw_readlink(kernel: &Kernel, args: [u64; 5]) -> Result<i64> {
    let path = read_user_str(kernel, args[0])?;
    let mut buf = alloc::vec![0u8; args[2] as usize];
    let len = sys_readlink(kernel, &path, &mut buf)?;
    write_user_buf(kernel, args[1], &buf[..len as usize])?;
    Ok(len)
}

fn raw_lseek(kernel: &Kernel, args: [u64; 5]) -> Result<i64> {
    sys_lseek(kernel, args[0] as usize, args[1] as i64, args[2] as u32)
}

fn raw_dup2(kernel: &Kernel, args: [u64; 5]) -> Result<i64> {
    sys_dup2(kernel, args[0] as usize, args[1] as usize)
}

fn raw_pipe(kernel: &Kernel, args: [u64; 5]) -> Result<i64> {
    let (rfd, wfd) = sys_pipe(kernel)?;
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&(rfd as i32).to_le_bytes());
    out[4..].copy_from_slice(&(wfd as i32).to_le_bytes());
    write_user_buf(kernel, args[0], &out)?;
    Ok(0)
}

fn raw_mmap(kernel: &Kernel, args: [u64; 5]) -> Result<i64> {
    sys_mmap(kernel, args[0], args[1])
}

fn read_fd_array(kernel: &Kernel, ptr: u64, count: usize) -> Result<Vec<usize>> {
    let raw = read_user_buf(kernel, ptr, count * 4)?;
    Ok(raw
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as usize)
        .collect())
}

fn raw_fswait(kernel: &Kernel, args: [u64; 5]) -> Result<i64> {
    let fds = read_fd_array(kernel, args[1], args[0] as usize)?;
    sys_fswait(kernel, &fds, None)
}

fn raw_fswait2(kernel: &Kernel, args: [u64; 5]) -> Result<i64> {
    let fds = read_fd_array(kernel, args[1], args[0] as usize)?;
    sys_fswait(kernel, &fds, Some(args[2]))
}

fn raw_fswait3(kernel: &Kernel, args: [u64; 5]) -> Result<i64> {
    let fds = read_fd_array(kernel, args[1], args[0] as usize)?;
    let result = sys_fswait(kernel, &fds, Some(args[2]))?;
    write_user_buf(kernel, args[3], &(result as i32).to_le_bytes())?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use crate::memory::paging::USER_BASE;
    use crate::scheduler::lifecycle::{setup_image, ImageSegment};
    use crate::KernelConfig;

    fn booted() -> Arc<Kernel> {
        crate::Kernel::boot(KernelConfig::default())
    }

    /// Give the current process a minimal user image so pointer-validating
    /// syscalls have something to check against.
    fn with_user_image(kernel: &Kernel) -> u64 {
        let space = kernel.mem().new_address_space();
        kernel
            .mem()
            .map_region(&space, USER_BASE, 8 * PAGE_SIZE as u64)
            .unwrap();
        kernel.sched().with_current(|p| {
            p.space = Some(space);
            p.image.entry = USER_BASE;
            p.image.heap = USER_BASE + 8 * PAGE_SIZE as u64;
            p.image.heap_actual = p.image.heap;
        });
        USER_BASE
    }

    #[test]
    fn open_write_read_through_descriptors() {
        let kernel = booted();
        let flags = OpenFlags::CREAT | OpenFlags::RDWR;
        let fd = sys_open(&kernel, "/notes.txt", flags, 0o644).unwrap() as usize;
        assert_eq!(sys_write(&kernel, fd, b"hello fs").unwrap(), 8);
        // The offset advanced; rewind and read back.
        sys_lseek(&kernel, fd, 0, 0).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(sys_read(&kernel, fd, &mut buf).unwrap(), 8);
        assert_eq!(&buf[..8], b"hello fs");
        assert_eq!(sys_close(&kernel, fd).unwrap(), 0);
        assert_eq!(sys_close(&kernel, fd).unwrap_err(), Error::BadFd);
    }

    #[test]
    fn descriptor_modes_are_enforced() {
        let kernel = booted();
        let fd = sys_open(&kernel, "/ro", OpenFlags::CREAT | OpenFlags::RDWR, 0o644).unwrap()
            as usize;
        sys_write(&kernel, fd, b"data").unwrap();
        sys_close(&kernel, fd).unwrap();

        let fd = sys_open(&kernel, "/ro", OpenFlags::empty(), 0).unwrap() as usize;
        assert_eq!(sys_write(&kernel, fd, b"nope").unwrap_err(), Error::Access);
        sys_close(&kernel, fd).unwrap();
    }

    #[test]
    fn chdir_and_getcwd_follow_the_namespace() {
        let kernel = booted();
        sys_mkdir(&kernel, "/home", 0o755).unwrap();
        sys_mkdir(&kernel, "/home/user", 0o755).unwrap();
        sys_chdir(&kernel, "/home/user").unwrap();
        assert_eq!(sys_getcwd(&kernel).unwrap(), "/home/user");
        // Relative resolution now composes with the cwd.
        let fd = sys_open(&kernel, "notes", OpenFlags::CREAT, 0o644).unwrap() as usize;
        sys_close(&kernel, fd).unwrap();
        assert!(kernel
            .vfs()
            .resolve("/", "/home/user/notes", OpenFlags::empty())
            .is_ok());
        assert_eq!(
            sys_chdir(&kernel, "/home/user/notes").unwrap_err(),
            Error::NotDirectory
        );
    }

    #[test]
    fn symlink_readlink_and_unlink() {
        let kernel = booted();
        let fd = sys_open(&kernel, "/target", OpenFlags::CREAT, 0o644).unwrap() as usize;
        sys_close(&kernel, fd).unwrap();
        sys_symlink(&kernel, "/target", "/alias").unwrap();
        let mut buf = [0u8; 64];
        let len = sys_readlink(&kernel, "/alias", &mut buf).unwrap() as usize;
        assert_eq!(&buf[..len], b"/target");
        // Opening through the link lands on the target.
        let fd = sys_open(&kernel, "/alias", OpenFlags::empty(), 0).unwrap() as usize;
        sys_close(&kernel, fd).unwrap();
        sys_unlink(&kernel, "/alias").unwrap();
        assert_eq!(
            sys_open(&kernel, "/alias", OpenFlags::empty(), 0).unwrap_err(),
            Error::NoEntry
        );
    }

    #[test]
    fn creation_modes_pass_through_the_umask() {
        let kernel = booted();
        // The default umask (022) strips group/other write bits.
        let fd = sys_open(&kernel, "/wide", OpenFlags::CREAT, 0o666).unwrap() as usize;
        sys_close(&kernel, fd).unwrap();
        let node = kernel.vfs().resolve("/", "/wide", OpenFlags::empty()).unwrap();
        assert_eq!(node.meta().mask, 0o644);

        sys_mkdir(&kernel, "/shared", 0o777).unwrap();
        let dir = kernel.vfs().resolve("/", "/shared", OpenFlags::empty()).unwrap();
        assert_eq!(dir.meta().mask, 0o755);
    }

    #[test]
    fn mount_requires_root() {
        let kernel = booted();
        sys_mkdir(&kernel, "/mnt", 0o755).unwrap();
        kernel.sched().with_current(|p| p.user = 1000);
        assert_eq!(
            sys_mount(&kernel, "tmpfs", "disk", "/mnt").unwrap_err(),
            Error::Access
        );
        kernel.sched().with_current(|p| p.user = 0);
        sys_mount(&kernel, "tmpfs", "disk", "/mnt").unwrap();
    }

    #[test]
    fn sbrk_faults_in_pages_and_reserves_tables_ahead() {
        let kernel = booted();
        with_user_image(&kernel);
        let brk = sys_sbrk(&kernel, 2 * PAGE_SIZE as u64).unwrap() as u64;
        let space = current_space(&kernel).unwrap();
        let dir = space.lock();
        // Both requested pages are backed...
        assert!(dir.translate(brk).is_some());
        assert!(dir.translate(brk + PAGE_SIZE as u64).is_some());
        // ...the page past the break is not, but its covering table exists.
        let beyond = brk + 2 * PAGE_SIZE as u64;
        assert!(dir.translate(beyond + TABLE_SPAN).is_none());
        assert!(dir.entry(beyond + TABLE_SPAN).is_some());
    }

    #[test]
    fn mmap_backs_a_fixed_region() {
        let kernel = booted();
        with_user_image(&kernel);
        let addr = 0x2000_0000u64;
        assert_eq!(
            sys_mmap(&kernel, addr, 3 * PAGE_SIZE as u64).unwrap(),
            addr as i64
        );
        let space = current_space(&kernel).unwrap();
        space.lock().write(addr, b"mapped").unwrap();
        let mut buf = [0u8; 6];
        space.lock().read(addr, &mut buf).unwrap();
        assert_eq!(&buf, b"mapped");
    }

    #[test]
    fn dispatch_moves_arguments_through_user_memory() {
        let kernel = booted();
        let base = with_user_image(&kernel);
        let space = current_space(&kernel).unwrap();

        // Stage a path string in user memory and open it via the table.
        let path_ptr = base + 0x100;
        space.lock().write(path_ptr, b"/via-table\0").unwrap();
        let flags = (OpenFlags::CREAT | OpenFlags::RDWR).bits() as u64;
        let fd = dispatch(&kernel, SYS_OPEN, [path_ptr, flags, 0o644, 0, 0]);
        assert!(fd >= 0);

        // Write from a user buffer, read it back through another.
        let data_ptr = base + 0x200;
        space.lock().write(data_ptr, b"table io").unwrap();
        assert_eq!(
            dispatch(&kernel, SYS_WRITE, [fd as u64, data_ptr, 8, 0, 0]),
            8
        );
        dispatch(&kernel, SYS_LSEEK, [fd as u64, 0, 0, 0, 0]);
        let out_ptr = base + 0x300;
        assert_eq!(
            dispatch(&kernel, SYS_READ, [fd as u64, out_ptr, 8, 0, 0]),
            8
        );
        let mut buf = [0u8; 8];
        space.lock().read(out_ptr, &mut buf).unwrap();
        assert_eq!(&buf, b"table io");

        // Malformed pointers are rejected before dereference.
        let bad = dispatch(&kernel, SYS_WRITE, [fd as u64, 0x10, 4, 0, 0]);
        assert_eq!(bad, -(Error::Fault.errno() as i64));
        // Unknown numbers are value errors, not faults.
        assert_eq!(
            dispatch(&kernel, 999, [0; 5]),
            -(Error::Invalid.errno() as i64)
        );
    }

    #[test]
    fn image_setup_places_vectors_below_the_heap() {
        let kernel = booted();
        let me = kernel.sched().current_pid();
        let code = [0x90u8; 32];
        let block = setup_image(
            &kernel,
            me,
            USER_BASE,
            &[ImageSegment {
                vaddr: USER_BASE,
                data: &code,
                writable: false,
            }],
            &["/bin/init", "--solo"],
            &["TERM=vt100"],
            &[(6, PAGE_SIZE as u64)],
        )
        .unwrap();

        let space = current_space(&kernel).unwrap();
        let dir = space.lock();
        let mut word = [0u8; 8];
        // argc first.
        dir.read(block, &mut word).unwrap();
        assert_eq!(u64::from_le_bytes(word), 2);
        // argv[0] points at a NUL-terminated "/bin/init".
        dir.read(block + 8, &mut word).unwrap();
        let argv0 = u64::from_le_bytes(word);
        assert!(argv0 > block);
        assert_eq!(dir.read_cstr(argv0, 64).unwrap(), "/bin/init");

        let (heap, entry) = kernel
            .sched()
            .with_current(|p| (p.image.heap, p.image.entry))
            .unwrap();
        assert_eq!(entry, USER_BASE);
        // The vector block sits just below the computed heap start.
        assert!(block < heap);
        drop(dir);

        // The image is in place.
        let mut probe = [0u8; 4];
        space.lock().read(USER_BASE, &mut probe).unwrap();
        assert_eq!(probe, [0x90; 4]);
    }
}
