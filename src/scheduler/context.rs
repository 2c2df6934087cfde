use core::arch::naked_asm;

use crate::Kernel;

/// Size of each process's kernel stack.
pub const KERNEL_STACK_SIZE: usize = 64 * 1024;

/// Entry point of a spawned kernel task.
pub type TaskEntry = extern "C" fn(&Kernel, u64);

/// CPU register context saved/restored during context switches.
/// All callee-saved registers on x86_64 System V ABI, plus the resume point.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct SwitchContext {
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
}

impl SwitchContext {
    /// An empty context; filled in on the first switch away (the boot/init
    /// thread is adopted this way).
    pub fn empty() -> Self {
        SwitchContext::default()
    }

    /// Context for a fresh task. Execution starts in the entry trampoline
    /// with the kernel pointer, entry function and argument staged in the
    /// callee-saved registers the trampoline expects.
    pub fn fresh(stack_top: u64, kernel: *const Kernel, entry: TaskEntry, arg: u64) -> Self {
        SwitchContext {
            // 16-byte aligned; the trampoline's `call` supplies the ABI's
            // entry-time misalignment.
            rsp: stack_top & !0xF,
            rbp: 0,
            rbx: 0,
            r12: kernel as u64,
            r13: entry as usize as u64,
            r14: arg,
            r15: 0,
            rip: task_entry_trampoline as usize as u64,
        }
    }
}

/// First code a fresh task runs: unpack the kernel pointer (r12), entry
/// function (r13) and argument (r14) staged by `SwitchContext::fresh`, then
/// hand off to the Rust-side shim.
#[unsafe(naked)]
pub extern "C" fn task_entry_trampoline() {
    naked_asm!(
        "mov rdi, r12",
        "mov rsi, r13",
        "mov rdx, r14",
        "call {shim}",
        "ud2",
        shim = sym task_entry_shim,
    );
}

/// First-dispatch path of every spawned task: pending signals are examined
/// before the body runs, and a plain `return` from the body lands in a
/// clean exit instead of a reserved sentinel address.
extern "C" fn task_entry_shim(kernel: *const Kernel, entry: u64, arg: u64) -> ! {
    // The kernel outlives every task it scheduled.
    let kernel = unsafe { &*kernel };
    kernel.sched().after_resume();
    let entry: TaskEntry = unsafe { core::mem::transmute(entry as usize) };
    entry(kernel, arg);
    kernel.sched().exit_current(0);
}

/// Switch context from `old` to `new`: saves callee-saved registers and the
/// resume point into `old`, restores from `new`.
///
/// # Safety
/// Both pointers must reference valid contexts whose stacks stay alive until
/// the switch back.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(old: *mut SwitchContext, new: *const SwitchContext) {
    naked_asm!(
        // Save callee-saved registers into `old` (rdi).
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        // Resume point for when `old` is switched back in.
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x38], rax",
        // Restore from `new` (rsi) and jump.
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "jmp [rsi + 0x38]",
        "2:",
        "ret",
    );
}

/// Restore a context without saving the current one (the current task is
/// finished and never resumed).
///
/// # Safety
/// The context must be valid; the current stack is abandoned.
#[unsafe(naked)]
pub unsafe extern "C" fn restore_context(new: *const SwitchContext) -> ! {
    naked_asm!(
        "mov rsp, [rdi + 0x00]",
        "mov rbp, [rdi + 0x08]",
        "mov rbx, [rdi + 0x10]",
        "mov r12, [rdi + 0x18]",
        "mov r13, [rdi + 0x20]",
        "mov r14, [rdi + 0x28]",
        "mov r15, [rdi + 0x30]",
        "jmp [rdi + 0x38]",
    );
}
