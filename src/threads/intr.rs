/// Interrupt gate: enable/disable/query, and the deferred-preemption
/// flag consulted at the tail of the timer interrupt handler.
///
/// There is no separate hand-written interrupt epilogue in this
/// kernel (see the scheduler's module documentation) — the timer
/// handler itself plays that role, calling back into here once its own
/// per-tick accounting is done.
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use x86_64::instructions::interrupts;

static YIELD_ON_RETURN: AtomicBool = AtomicBool::new(false);
static INTERRUPT_DEPTH: AtomicU32 = AtomicU32::new(0);

pub fn enabled() -> bool {
    interrupts::are_enabled()
}

pub fn in_interrupt_context() -> bool {
    INTERRUPT_DEPTH.load(Ordering::SeqCst) > 0
}

pub fn enter_interrupt_context() {
    INTERRUPT_DEPTH.fetch_add(1, Ordering::SeqCst);
}

pub fn exit_interrupt_context() {
    INTERRUPT_DEPTH.fetch_sub(1, Ordering::SeqCst);
}

pub fn request_yield() {
    YIELD_ON_RETURN.store(true, Ordering::SeqCst);
}

pub fn take_yield_request() -> bool {
    YIELD_ON_RETURN.swap(false, Ordering::SeqCst)
}
