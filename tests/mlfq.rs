/// Integration test: BSD-style MLFQ recent-CPU decay and niceness under
/// the MLFQ scheduling policy (a separate boot from `tests/scheduler.rs`
/// since the policy is fixed for the lifetime of one kernel image).
#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(kernel::test_runner)]
#![reexport_test_harness_entry = "test_main"]

extern crate alloc;

use bootloader_api::{entry_point, BootInfo, BootloaderConfig};
use core::panic::PanicInfo;
use core::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use kernel::threads::{self, Policy};

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
    threads::init(Policy::Mlfq);
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

#[test_case]
fn test_recent_cpu_rises_for_cpu_bound_thread() {
    static CPU_AT_ONE_SEC: AtomicI32 = AtomicI32::new(-1);

    extern "C" fn hog(_arg: u64) {
        let start = kernel::interrupts::TICK_COUNT.load(Ordering::Relaxed);
        loop {
            let now = kernel::interrupts::TICK_COUNT.load(Ordering::Relaxed);
            if now - start >= threads::TIMER_FREQ + 2 {
                break;
            }
            core::hint::spin_loop();
        }
        CPU_AT_ONE_SEC.store(threads::get_recent_cpu(), Ordering::SeqCst);
    }

    threads::create("hog", threads::PRI_DEFAULT, hog, 0).unwrap();
    spin_until(|| CPU_AT_ONE_SEC.load(Ordering::SeqCst) >= 0);

    // A thread that ran flat-out for roughly one second should have
    // accumulated a recent_cpu well above zero by the time the
    // per-second MLFQ recompute has run at least once.
    assert!(
        CPU_AT_ONE_SEC.load(Ordering::SeqCst) > 0,
        "recent_cpu did not rise for a CPU-bound thread"
    );
}

#[test_case]
fn test_nice_lowers_priority() {
    static LOW_NICE_PRIORITY: AtomicI32 = AtomicI32::new(-1);
    static HIGH_NICE_PRIORITY: AtomicI32 = AtomicI32::new(-1);

    extern "C" fn report(nice: u64) {
        threads::set_nice(nice as i32);
        let start = now_ticks();
        while now_ticks() - start < 2 {
            threads::yield_now();
        }
        let pri = threads::get_priority() as i32;
        if nice == 0 {
            LOW_NICE_PRIORITY.store(pri, Ordering::SeqCst);
        } else {
            HIGH_NICE_PRIORITY.store(pri, Ordering::SeqCst);
        }
    }

    threads::create("nice-0", threads::PRI_DEFAULT, report, 0).unwrap();
    threads::create("nice-10", threads::PRI_DEFAULT, report, 10).unwrap();

    spin_until(|| {
        LOW_NICE_PRIORITY.load(Ordering::SeqCst) >= 0 && HIGH_NICE_PRIORITY.load(Ordering::SeqCst) >= 0
    });

    assert!(
        HIGH_NICE_PRIORITY.load(Ordering::SeqCst) <= LOW_NICE_PRIORITY.load(Ordering::SeqCst),
        "a higher nice value must not result in a higher MLFQ priority"
    );
}

#[test_case]
fn test_set_priority_rejected_under_mlfq() {
    let before = threads::get_priority();
    threads::set_priority(threads::PRI_MAX);
    assert_eq!(
        threads::get_priority(),
        before,
        "set_priority must be a no-op under the MLFQ policy"
    );
}
