/// Interrupt Descriptor Table (IDT) and interrupt handlers.
///
/// The IDT tells the CPU which function to call for each interrupt:
///   - 0-31: CPU exceptions (divide by zero, page fault, double fault, etc.)
///   - 32-47: Hardware interrupts (remapped from PIC: timer, keyboard, etc.)
///
/// The PIC 8259 manages hardware interrupts. We remap IRQs 0-7 from
/// IDT entries 8-15 to 32-47 to avoid colliding with CPU exceptions.
use crate::gdt;
use crate::hlt_loop;
use core::sync::atomic::{AtomicU64, Ordering};
use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::instructions::port::Port;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

pub static TICK_COUNT: AtomicU64 = AtomicU64::new(0);

// 8254 PIT constants
const PIT_OSCILLATOR_HZ: u32 = 1_193_182;
const PIT_COMMAND_PORT: u16 = 0x43;
const PIT_CHANNEL0_PORT: u16 = 0x40;
const PS2_DATA_PORT: u16 = 0x60;

/// Configure the 8254 PIT to fire at `threads::TIMER_FREQ` Hz.
pub fn init_pit() {
    let divisor: u16 = (PIT_OSCILLATOR_HZ / crate::threads::TIMER_FREQ as u32) as u16;
    unsafe {
        Port::new(PIT_COMMAND_PORT).write(0x36u8);
        Port::new(PIT_CHANNEL0_PORT).write((divisor & 0xFF) as u8);
        Port::new(PIT_CHANNEL0_PORT).write((divisor >> 8) as u8);
    }
}

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

pub static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum InterruptIndex {
    Timer = PIC_1_OFFSET,
    Keyboard,
}

static IDT: spin::Once<InterruptDescriptorTable> = spin::Once::new();

pub fn init_idt() {
    let idt = IDT.call_once(|| {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt[InterruptIndex::Timer as u8].set_handler_fn(timer_interrupt_handler);
        idt[InterruptIndex::Keyboard as u8].set_handler_fn(keyboard_interrupt_handler);
        idt
    });
    idt.load();
}

// --- CPU Exception Handlers ---

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    crate::println!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    crate::println!("EXCEPTION: PAGE FAULT");
    crate::println!("Accessed Address: {:?}", Cr2::read());
    crate::println!("Error Code: {:?}", error_code);
    crate::println!("{:#?}", stack_frame);
    hlt_loop();
}

// --- Hardware Interrupt Handlers ---

/// Fires at `threads::TIMER_FREQ` Hz. The EOI is sent before anything
/// else: `threads::tick()` may end up context-switching away from this
/// exact call frame for an arbitrarily long time (until this thread is
/// scheduled again), and the PIC would keep IRQ0 masked until then if
/// the EOI were deferred past that point.
extern "x86-interrupt" fn timer_interrupt_handler(_stack_frame: InterruptStackFrame) {
    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Timer as u8);
    }

    // `enter_interrupt_context` is retired by `tick()` itself, before it
    // considers yielding — not here after it returns. `tick()` can call
    // `yield_now()`, which performs the real stack-pointer swap and
    // suspends this exact call frame (exit_interrupt_context included)
    // until this thread is scheduled back in, which could be long after
    // other threads have run and checked `in_interrupt_context()`.
    crate::threads::intr::enter_interrupt_context();
    TICK_COUNT.fetch_add(1, Ordering::Relaxed);
    crate::threads::tick();
}

extern "x86-interrupt" fn keyboard_interrupt_handler(_stack_frame: InterruptStackFrame) {
    crate::threads::intr::enter_interrupt_context();
    let mut port = Port::new(PS2_DATA_PORT);
    let scancode: u8 = unsafe { port.read() };

    crate::keyboard::push_scancode(scancode);

    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Keyboard as u8);
    }
    crate::threads::intr::exit_interrupt_context();
}
