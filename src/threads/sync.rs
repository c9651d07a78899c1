/// Synchronization built directly on the thread-blocking primitives in
/// `thread`: a counting semaphore, a semaphore-backed mutual-exclusion
/// lock with priority donation, and a lock-backed condition variable.
extern crate alloc;

use alloc::collections::VecDeque;
use spin::Mutex as SpinMutex;
use x86_64::instructions::interrupts::without_interrupts;

use super::thread::{self, BlockedReason, Tid};

/// A classic counting semaphore. Waiters queue in FIFO order; `up`
/// always wakes the longest-waiting thread rather than picking by
/// priority, matching the teaching-kernel semaphore this is modeled
/// on — priority-aware wakeup is `Lock`'s job, layered on top.
pub struct Semaphore {
    inner: SpinMutex<SemaphoreState>,
}

struct SemaphoreState {
    count: u32,
    waiters: VecDeque<Tid>,
}

impl Semaphore {
    pub const fn new(value: u32) -> Semaphore {
        Semaphore {
            inner: SpinMutex::new(SemaphoreState {
                count: value,
                waiters: VecDeque::new(),
            }),
        }
    }

    pub fn down(&self) {
        self.down_as(BlockedReason::Unknown);
    }

    /// Like `down`, but parks the calling thread with a caller-chosen
    /// `BlockedReason` instead of `Unknown` — `Lock` uses this to tag
    /// its waiters as `WaitingOnLock(holder)` so priority donation can
    /// walk the chain.
    pub(crate) fn down_as(&self, reason: BlockedReason) {
        loop {
            let parked = without_interrupts(|| {
                let mut state = self.inner.lock();
                if state.count > 0 {
                    state.count -= 1;
                    false
                } else {
                    state.waiters.push_back(thread::current());
                    true
                }
            });
            if !parked {
                return;
            }
            thread::block(reason);
        }
    }

    /// Non-blocking `down`: succeeds only if the semaphore was
    /// immediately available.
    pub fn try_down(&self) -> bool {
        without_interrupts(|| {
            let mut state = self.inner.lock();
            if state.count > 0 {
                state.count -= 1;
                true
            } else {
                false
            }
        })
    }

    pub fn up(&self) {
        let woken = without_interrupts(|| {
            let mut state = self.inner.lock();
            state.count += 1;
            state.waiters.pop_front()
        });
        if let Some(tid) = woken {
            thread::unblock(tid);
        }
    }
}

/// A mutual-exclusion lock implemented as a binary semaphore plus an
/// owner field, so a blocked acquirer can be identified and have its
/// priority donated to whoever is holding the lock.
pub struct Lock {
    sema: Semaphore,
    owner: SpinMutex<Option<Tid>>,
}

impl Lock {
    pub const fn new() -> Lock {
        Lock {
            sema: Semaphore::new(1),
            owner: SpinMutex::new(None),
        }
    }

    pub fn acquire(&self) {
        if self.sema.try_down() {
            *self.owner.lock() = Some(thread::current());
            return;
        }

        let holder = *self.owner.lock();
        let me = thread::current();
        let reason = match holder {
            Some(holder) => {
                thread::donate_priority(holder, thread::effective_priority(me), 0);
                BlockedReason::WaitingOnLock(holder)
            }
            None => BlockedReason::Unknown,
        };

        self.sema.down_as(reason);
        *self.owner.lock() = Some(me);
    }

    pub fn try_acquire(&self) -> bool {
        if self.sema.try_down() {
            *self.owner.lock() = Some(thread::current());
            true
        } else {
            false
        }
    }

    pub fn release(&self) {
        let tid = thread::current();
        *self.owner.lock() = None;
        // Wake the next waiter before recomputing: recompute scans for
        // threads still Blocked on this lock, so it must run after
        // `up` has already moved the one we're handing off to out of
        // that state, or it would see its own outgoing donation as
        // still live.
        self.sema.up();
        thread::recompute_donated_priority(tid);
    }

    pub fn is_held_by_current(&self) -> bool {
        *self.owner.lock() == Some(thread::current())
    }
}

/// A condition variable, always used together with a `Lock` the
/// caller already holds. `wait` releases the lock and blocks in one
/// atomic step so a `signal` arriving between the two can never be
/// missed — see `register_and_release`.
pub struct Condvar {
    waiters: SpinMutex<VecDeque<Tid>>,
}

impl Condvar {
    pub const fn new() -> Condvar {
        Condvar {
            waiters: SpinMutex::new(VecDeque::new()),
        }
    }

    pub fn wait(&self, lock: &Lock) {
        debug_assert!(lock.is_held_by_current());
        without_interrupts(|| {
            self.waiters.lock().push_back(thread::current());
            lock.release();
            thread::block(BlockedReason::Unknown);
        });
        lock.acquire();
    }

    pub fn signal(&self) {
        let woken = without_interrupts(|| self.waiters.lock().pop_front());
        if let Some(tid) = woken {
            thread::unblock(tid);
        }
    }

    pub fn broadcast(&self) {
        let all: alloc::vec::Vec<Tid> =
            without_interrupts(|| self.waiters.lock().drain(..).collect());
        for tid in all {
            thread::unblock(tid);
        }
    }
}
