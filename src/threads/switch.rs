/// Low-level register/stack context switch between kernel threads.
///
/// `switch_threads` is the one piece of this scheduler that cannot be
/// written in safe Rust: it swaps the stack pointer out from under the
/// running function and resumes in a different thread's call frame.
/// Everything above this file only ever sees ordinary, synchronous
/// looking Rust function calls — a thread that calls into the
/// scheduler and blocks just "returns late" once it's rescheduled.
use super::thread::Tid;

/// Saved machine state of a suspended thread: the stack pointer at the
/// point `switch_threads` was called, or, for a thread that has never
/// run, the point it was synthesized to look like it was called from.
/// `owner` is never touched by the assembly below; it only exists so
/// `thread_trampoline` can recover which thread is being switched away
/// from when a brand-new thread runs for the first time.
#[repr(C)]
pub struct Context {
    pub rsp: u64,
    pub owner: Tid,
}

impl Context {
    pub const fn new(owner: Tid, rsp: u64) -> Context {
        Context { rsp, owner }
    }
}

extern "C" {
    /// Saves the callee-saved registers and stack pointer of the
    /// caller into `*cur`, loads `*next`'s, and returns.
    ///
    /// Always returns `cur`, recovered from RAX. Callers use this
    /// return value — not a local variable captured before the call —
    /// to identify the thread just switched away from: for a freshly
    /// resumed thread, any local captured before the switch belongs to
    /// a stale, unrelated call frame.
    pub fn switch_threads(cur: *mut Context, next: *const Context) -> *mut Context;
}

core::arch::global_asm!(
    ".global switch_threads",
    "switch_threads:",
    "mov rax, rdi",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, [rsi]",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
);

// A thread that has never run "resumes" here instead of back into
// some suspended schedule() call. RAX still holds the previous
// thread's context pointer (set by switch_threads above), which a real
// resume would normally hand to schedule_tail on its way back up the
// call stack; since there is no call stack to unwind here, we call it
// directly before dropping into the thread's actual entry point.
core::arch::global_asm!(
    ".global thread_trampoline",
    "thread_trampoline:",
    "mov rdi, rax",
    "call rust_schedule_tail_trampoline",
    "pop rdi",
    "pop rsi",
    "call rust_thread_entry",
);

pub fn thread_trampoline_addr() -> u64 {
    extern "C" {
        fn thread_trampoline();
    }
    thread_trampoline as *const () as u64
}

#[no_mangle]
extern "C" fn rust_schedule_tail_trampoline(prev_ctx: *mut Context) {
    let prev_tid = unsafe { (*prev_ctx).owner };
    super::thread::schedule_tail(prev_tid);
}

#[no_mangle]
extern "C" fn rust_thread_entry(entry: u64, arg: u64) -> ! {
    x86_64::instructions::interrupts::enable();
    let f: extern "C" fn(u64) = unsafe { core::mem::transmute(entry) };
    f(arg);
    super::thread::exit();
}

/// Frame written to the top of a brand-new thread's stack so that the
/// first switch into it "returns" into `thread_trampoline` instead of
/// into some suspended caller, carrying the real entry point and its
/// argument along for the trampoline to pick up.
#[repr(C)]
pub struct InitialFrame {
    r15: u64,
    r14: u64,
    r13: u64,
    r12: u64,
    rbx: u64,
    rbp: u64,
    trampoline: u64,
    entry: u64,
    arg: u64,
}

impl InitialFrame {
    pub fn new(entry: u64, arg: u64) -> InitialFrame {
        InitialFrame {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            rbx: 0,
            rbp: 0,
            trampoline: thread_trampoline_addr(),
            entry,
            arg,
        }
    }
}
