#![no_std]
#![no_main]
#![feature(abi_x86_interrupt)]

extern crate alloc;

use bootloader_api::{entry_point, BootInfo, BootloaderConfig};
use core::panic::PanicInfo;

#[allow(deprecated)]
pub static BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    config.mappings.physical_memory = Some(bootloader_api::config::Mapping::Dynamic);
    config.kernel_stack_size = 512 * 1024; // 512 KiB (default 80 KiB is too small)
    config
};

entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    kernel::serial::init();
    kernel::serial_println!("Serial initialized");

    kernel::println!("Booting RustKernel...");

    // Init GDT, IDT, PICs
    kernel::init();
    kernel::serial_println!("GDT, IDT, PICs initialized");

    // Set up paging and heap
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
    kernel::serial_println!("Heap initialized");

    kernel::interrupts::init_pit();
    kernel::serial_println!("PIT configured at {} Hz", kernel::threads::TIMER_FREQ);

    kernel::threads::init(kernel::threads::Policy::Mlfq);
    kernel::threads::create("shell", kernel::threads::PRI_DEFAULT, shell_thread, 0)
        .expect("failed to spawn shell thread");
    kernel::serial_println!("Scheduler initialized, shell thread spawned");

    kernel::println!("All subsystems initialized.");

    // Boot's own stack becomes the idle thread's home; threads::start
    // creates the real idle thread and turns interrupts on, at which
    // point the scheduler takes over and this call never returns.
    kernel::threads::start();
    kernel::hlt_loop()
}

extern "C" fn shell_thread(_arg: u64) {
    kernel::shell::run();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    kernel::println!("{}", info);
    kernel::serial_println!("{}", info);
    kernel::hlt_loop()
}
