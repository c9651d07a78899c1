/// Integration test: thread creation, priority preemption, priority
/// donation, and sleep ordering under the priority scheduling policy.
#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(kernel::test_runner)]
#![reexport_test_harness_entry = "test_main"]

extern crate alloc;

use alloc::vec::Vec;
use bootloader_api::{entry_point, BootInfo, BootloaderConfig};
use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use kernel::threads::{self, Lock, Policy};
use spin::Mutex as SpinMutex;

pub static BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    config.mappings.physical_memory = Some(bootloader_api::config::Mapping::Dynamic);
    config.kernel_stack_size = 512 * 1024;
    config
};

entry_point!(main, config = &BOOTLOADER_CONFIG);

fn main(boot_info: &'static mut BootInfo) -> ! {
    kernel::init();

    let phys_mem_offset = x86_64::VirtAddr::new(
        boot_info
            .physical_memory_offset
            .into_option()
            .expect("physical_memory_offset not available"),
    );
    let mut mapper = unsafe { kernel::memory::init(phys_mem_offset) };
    let mut frame_allocator =
        unsafe { kernel::memory::BootInfoFrameAllocator::init(&boot_info.memory_regions) };
    kernel::allocator::init_heap(&mut mapper, &mut frame_allocator)
        .expect("heap initialization failed");

    kernel::interrupts::init_pit();
    threads::init(Policy::Priority);
    threads::start();

    test_main();
    kernel::hlt_loop();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    kernel::test_panic_handler(info)
}

fn spin_until(mut done: impl FnMut() -> bool) {
    let mut spins = 0;
    while !done() {
        threads::yield_now();
        spins += 1;
        assert!(spins < 10_000_000, "condition never became true");
    }
}

fn now_ticks() -> u64 {
    kernel::interrupts::TICK_COUNT.load(Ordering::Relaxed)
}

extern "C" fn set_flag(addr: u64) {
    let flag = unsafe { &*(addr as *const AtomicBool) };
    flag.store(true, Ordering::SeqCst);
}

#[test_case]
fn test_thread_runs_and_exits() {
    static DONE: AtomicBool = AtomicBool::new(false);
    let addr = &DONE as *const AtomicBool as u64;
    threads::create("runner", threads::PRI_DEFAULT, set_flag, addr).unwrap();
    spin_until(|| DONE.load(Ordering::SeqCst));
}

#[test_case]
fn test_higher_priority_preempts_on_creation() {
    static RAN: AtomicBool = AtomicBool::new(false);
    let addr = &RAN as *const AtomicBool as u64;
    threads::create("urgent", threads::PRI_MAX, set_flag, addr).unwrap();
    assert!(
        RAN.load(Ordering::SeqCst),
        "a strictly higher priority thread must run before create() returns control"
    );
}

static DONATION_LOCK: Lock = Lock::new();
static DONATION_HOLD_TICKS: u64 = 30;
static LOW_HOLDS_LOCK: AtomicBool = AtomicBool::new(false);

extern "C" fn donation_low_holder(_arg: u64) {
    DONATION_LOCK.acquire();
    LOW_HOLDS_LOCK.store(true, Ordering::SeqCst);
    let start = now_ticks();
    while now_ticks() - start < DONATION_HOLD_TICKS {
        threads::yield_now();
    }
    DONATION_LOCK.release();
}

extern "C" fn donation_high_waiter(_arg: u64) {
    DONATION_LOCK.acquire();
    DONATION_LOCK.release();
}

#[test_case]
fn test_priority_donation_raises_holder() {
    let low = threads::create("low", 1, donation_low_holder, 0).unwrap();
    spin_until(|| LOW_HOLDS_LOCK.load(Ordering::SeqCst));

    threads::create("high", threads::PRI_MAX, donation_high_waiter, 0).unwrap();
    spin_until(|| threads::effective_priority(low) == threads::PRI_MAX);

    spin_until(|| threads::effective_priority(low) == 1);
}

#[test_case]
fn test_sleep_wakes_in_tick_order() {
    static ORDER: SpinMutex<Vec<u64>> = SpinMutex::new(Vec::new());

    extern "C" fn sleeper(ms: u64) {
        let ticks = ms * threads::TIMER_FREQ / 1000;
        let now = kernel::interrupts::TICK_COUNT.load(Ordering::Relaxed);
        threads::sleep_until(now + ticks);
        ORDER.lock().push(ms);
    }

    threads::create("sleep-30", threads::PRI_DEFAULT, sleeper, 30).unwrap();
    threads::create("sleep-10", threads::PRI_DEFAULT, sleeper, 10).unwrap();
    threads::create("sleep-20", threads::PRI_DEFAULT, sleeper, 20).unwrap();

    spin_until(|| ORDER.lock().len() == 3);
    assert_eq!(*ORDER.lock(), alloc::vec![10, 20, 30]);
}

#[test_case]
fn test_time_slice_preemption_among_equal_priority() {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    extern "C" fn ticker(_arg: u64) {
        for _ in 0..3 {
            COUNTER.fetch_add(1, Ordering::SeqCst);
            let start = kernel::interrupts::TICK_COUNT.load(Ordering::Relaxed);
            while kernel::interrupts::TICK_COUNT.load(Ordering::Relaxed) - start < 6 {
                core::hint::spin_loop();
            }
        }
    }

    let before = COUNTER.load(Ordering::SeqCst);
    threads::create("ticker-a", threads::PRI_DEFAULT, ticker, 0).unwrap();
    threads::create("ticker-b", threads::PRI_DEFAULT, ticker, 0).unwrap();

    spin_until(|| COUNTER.load(Ordering::SeqCst) >= before + 6);
}
