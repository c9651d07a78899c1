/// Scancode delivery from the keyboard ISR to whichever kernel thread
/// is reading input.
///
/// The async Waker-based stream this replaces doesn't fit a kernel
/// with real preemptible threads: a thread wanting a keystroke can
/// just block on a semaphore like it would for any other event.
use spin::Mutex;

use crate::threads::Semaphore;

struct ScancodeQueue {
    buf: [u8; 128],
    read: usize,
    write: usize,
    count: usize,
}

impl ScancodeQueue {
    const fn new() -> Self {
        ScancodeQueue {
            buf: [0; 128],
            read: 0,
            write: 0,
            count: 0,
        }
    }

    fn push(&mut self, scancode: u8) {
        if self.count < self.buf.len() {
            self.buf[self.write] = scancode;
            self.write = (self.write + 1) % self.buf.len();
            self.count += 1;
        }
    }

    fn pop(&mut self) -> Option<u8> {
        if self.count == 0 {
            return None;
        }
        let val = self.buf[self.read];
        self.read = (self.read + 1) % self.buf.len();
        self.count -= 1;
        Some(val)
    }
}

static QUEUE: Mutex<ScancodeQueue> = Mutex::new(ScancodeQueue::new());
static AVAILABLE: Semaphore = Semaphore::new(0);

/// Called from the keyboard interrupt handler.
pub fn push_scancode(scancode: u8) {
    QUEUE.lock().push(scancode);
    AVAILABLE.up();
}

/// Blocks the calling thread until the next raw scancode byte arrives.
/// Callers that want decoded characters keep their own `pc_keyboard`
/// decoder across calls, the way `shell::run` does, since a scancode
/// set can span several bytes per keypress.
pub fn read_scancode() -> u8 {
    loop {
        AVAILABLE.down();
        if let Some(sc) = QUEUE.lock().pop() {
            return sc;
        }
    }
}
