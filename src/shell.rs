/// Interactive shell — a read-eval-print loop on bare hardware.
///
/// Runs as an ordinary kernel thread, blocking on the keyboard
/// semaphore between keystrokes the way any other thread would block
/// waiting on an event.
extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;
use pc_keyboard::{layouts, DecodedKey, HandleControl, Keyboard, ScancodeSet1};

use crate::threads::{self, Status};
use crate::vga_buffer::{Color, WRITER};

const MAX_CMD_LEN: usize = 256;

pub fn run() {
    let mut keyboard = Keyboard::new(
        ScancodeSet1::new(),
        layouts::Us104Key,
        HandleControl::Ignore,
    );
    let mut input = String::with_capacity(MAX_CMD_LEN);

    crate::println!();
    set_fg_color("cyan");
    crate::println!("========================================");
    crate::println!("         Welcome to RustKernel v0.1     ");
    crate::println!("========================================");
    set_fg_color("white");
    crate::println!("Type 'help' for available commands.");
    crate::println!();
    print_prompt();

    loop {
        let scancode = crate::keyboard::read_scancode();

        if let Ok(Some(key_event)) = keyboard.add_byte(scancode) {
            if let Some(key) = keyboard.process_keyevent(key_event) {
                match key {
                    DecodedKey::Unicode(character) => match character {
                        '\n' => {
                            crate::println!();
                            execute_command(&input);
                            input.clear();
                            print_prompt();
                        }
                        '\u{0008}' => {
                            if !input.is_empty() {
                                input.pop();
                                x86_64::instructions::interrupts::without_interrupts(|| {
                                    WRITER.lock().write_byte(0x08);
                                });
                            }
                        }
                        c if c.is_ascii() && !c.is_control() => {
                            if input.len() < MAX_CMD_LEN {
                                input.push(c);
                                crate::print!("{}", c);
                            }
                        }
                        _ => {}
                    },
                    DecodedKey::RawKey(_) => {}
                }
            }
        }
    }
}

fn print_prompt() {
    crate::print!("> ");
}

fn execute_command(cmd: &str) {
    let cmd = cmd.trim();
    if cmd.is_empty() {
        return;
    }

    let (command, args) = match cmd.split_once(' ') {
        Some((c, a)) => (c, a.trim()),
        None => (cmd, ""),
    };

    match command {
        "help" => {
            crate::println!("Available commands:");
            crate::println!("  help               - Show this help message");
            crate::println!("  echo <text>        - Print text to screen");
            crate::println!("  clear              - Clear the screen");
            crate::println!("  info               - Show system information");
            crate::println!("  halt               - Halt the CPU");
            crate::println!("  panic              - Trigger a kernel panic");
            crate::println!("  color <name>       - Set text color");
            crate::println!("  ps                 - List all threads");
            crate::println!("  priority [n]       - Get/set current thread's base priority");
            crate::println!("  nice [n]           - Get/set current thread's niceness (MLFQ)");
            crate::println!("  loadavg            - Show the system load average");
            crate::println!("  recent-cpu         - Show current thread's recent CPU usage");
            crate::println!("  spawn <name> <n>   - Spawn a thread that busy-loops for n ticks");
            crate::println!("  sleep <ms>         - Sleep the shell thread for <ms> milliseconds");
            crate::println!("  donate-demo        - Run the priority donation demo");
        }
        "echo" => {
            crate::println!("{}", args);
        }
        "clear" => {
            x86_64::instructions::interrupts::without_interrupts(|| {
                WRITER.lock().clear_screen();
            });
        }
        "info" => {
            crate::println!("RustKernel v0.1");
            crate::println!("Architecture: x86_64");
            crate::println!(
                "Heap: {} KiB at {:#x}",
                crate::allocator::HEAP_SIZE / 1024,
                crate::allocator::HEAP_START
            );
            crate::println!("Timer frequency: {} Hz", threads::TIMER_FREQ);
        }
        "halt" => {
            crate::println!("Halting CPU...");
            crate::hlt_loop();
        }
        "panic" => {
            panic!("User-triggered panic");
        }
        "color" => {
            if args.is_empty() {
                crate::println!("Usage: color <name>");
                crate::println!("Colors: white, red, green, blue, cyan, yellow, magenta");
                return;
            }
            if set_fg_color(args) {
                crate::println!("Color set to {}", args);
            } else {
                crate::println!("Unknown color: {}", args);
            }
        }
        "ps" => cmd_ps(),
        "priority" => cmd_priority(args),
        "nice" => cmd_nice(args),
        "loadavg" => {
            let v = threads::get_load_avg();
            crate::println!("load average: {}.{:02}", v / 100, (v % 100).abs());
        }
        "recent-cpu" => {
            let v = threads::get_recent_cpu();
            crate::println!("recent cpu: {}.{:02}", v / 100, (v % 100).abs());
        }
        "spawn" => cmd_spawn(args),
        "sleep" => cmd_sleep(args),
        "donate-demo" => cmd_donate_demo(),
        _ => {
            crate::println!("Unknown command: {}", command);
            crate::println!("Type 'help' for available commands.");
        }
    }
}

fn cmd_ps() {
    crate::println!("{:>4} {:<12} {:<8} {:>4} {:>4} {:>5} {:>8}", "TID", "NAME", "STATUS", "PRI", "EFF", "NICE", "CPU%");
    for info in threads::foreach_snapshot() {
        let status = match info.status {
            Status::Running => "running",
            Status::Ready => "ready",
            Status::Blocked => "blocked",
            Status::Dying => "dying",
        };
        crate::println!(
            "{:>4} {:<12} {:<8} {:>4} {:>4} {:>5} {:>5}.{:02}",
            info.tid,
            info.name,
            status,
            info.base_priority,
            info.effective_priority,
            info.nice,
            info.recent_cpu / 100,
            (info.recent_cpu % 100).abs(),
        );
    }
}

fn cmd_priority(args: &str) {
    if args.is_empty() {
        crate::println!("priority: {}", threads::get_priority());
        return;
    }
    match args.parse::<u8>() {
        Ok(n) => threads::set_priority(n),
        Err(_) => crate::println!("Usage: priority [0-{}]", threads::PRI_MAX),
    }
}

fn cmd_nice(args: &str) {
    if args.is_empty() {
        crate::println!("nice: {}", threads::get_nice());
        return;
    }
    match args.parse::<i32>() {
        Ok(n) => threads::set_nice(n),
        Err(_) => crate::println!(
            "Usage: nice [{}..{}]",
            threads::NICE_MIN,
            threads::NICE_MAX
        ),
    }
}

extern "C" fn busy_thread(ticks: u64) {
    let start = crate::interrupts::TICK_COUNT.load(core::sync::atomic::Ordering::Relaxed);
    while crate::interrupts::TICK_COUNT.load(core::sync::atomic::Ordering::Relaxed) - start < ticks
    {
        core::hint::spin_loop();
    }
    crate::println!("[{}] done", threads::name());
}

fn cmd_spawn(args: &str) {
    let parts: Vec<&str> = args.split_whitespace().collect();
    if parts.len() != 2 {
        crate::println!("Usage: spawn <name> <ticks>");
        return;
    }
    let ticks: u64 = match parts[1].parse() {
        Ok(n) => n,
        Err(_) => {
            crate::println!("spawn: <ticks> must be a number");
            return;
        }
    };
    match threads::create(parts[0], threads::PRI_DEFAULT, busy_thread, ticks) {
        Ok(tid) => crate::println!("spawned {} as tid {}", parts[0], tid),
        Err(()) => crate::println!("spawn: failed to allocate a stack"),
    }
}

fn cmd_sleep(args: &str) {
    let ms: u64 = match args.parse() {
        Ok(n) => n,
        Err(_) => {
            crate::println!("Usage: sleep <ms>");
            return;
        }
    };
    let ticks = ms * threads::TIMER_FREQ / 1000;
    let now = crate::interrupts::TICK_COUNT.load(core::sync::atomic::Ordering::Relaxed);
    threads::sleep_until(now + ticks);
}

/// A low thread takes a lock, a high thread blocks on it and donates
/// its priority, a medium thread never gets to run in between.
fn cmd_donate_demo() {
    use crate::threads::Lock;

    static LOCK: Lock = Lock::new();

    let lock_ref: &'static Lock = &LOCK;
    extern "C" fn low_entry(lock_addr: u64) {
        let lock = unsafe { &*(lock_addr as *const Lock) };
        threads::set_priority(1);
        lock.acquire();
        crate::println!("[low] acquired the lock at priority {}", threads::get_priority());
        let start = crate::interrupts::TICK_COUNT.load(core::sync::atomic::Ordering::Relaxed);
        while crate::interrupts::TICK_COUNT.load(core::sync::atomic::Ordering::Relaxed) - start
            < threads::TIMER_FREQ
        {
            core::hint::spin_loop();
        }
        crate::println!("[low] releasing the lock at priority {}", threads::get_priority());
        lock.release();
    }
    extern "C" fn medium_entry(_arg: u64) {
        threads::set_priority(31);
        for _ in 0..3 {
            crate::println!("[medium] running at priority {}", threads::get_priority());
            threads::yield_now();
        }
    }
    extern "C" fn high_entry(lock_addr: u64) {
        let lock = unsafe { &*(lock_addr as *const Lock) };
        threads::set_priority(63);
        crate::println!("[high] waiting on the lock");
        lock.acquire();
        crate::println!("[high] acquired the lock");
        lock.release();
    }

    let addr = lock_ref as *const Lock as u64;
    let _low = threads::create("low", 1, low_entry, addr);
    let _medium = threads::create("medium", 31, medium_entry, 0);
    let _high = threads::create("high", 63, high_entry, addr);
}

fn parse_color(name: &str) -> Option<Color> {
    match name {
        "white" => Some(Color::White),
        "red" => Some(Color::Red),
        "green" => Some(Color::Green),
        "blue" => Some(Color::Blue),
        "cyan" => Some(Color::Cyan),
        "yellow" => Some(Color::Yellow),
        "magenta" => Some(Color::Pink),
        "black" => Some(Color::Black),
        "gray" | "grey" => Some(Color::LightGray),
        _ => None,
    }
}

fn set_fg_color(name: &str) -> bool {
    if let Some(c) = parse_color(name) {
        x86_64::instructions::interrupts::without_interrupts(|| {
            WRITER.lock().set_color(c, Color::Black);
        });
        true
    } else {
        false
    }
}
