/// Thread records and the scheduler core: lifecycle, the priority and
/// MLFQ policies, sleep/wake, and the per-tick entry point.
///
/// All mutable scheduler state lives behind one `spin::Mutex`, exactly
/// like the rest of this kernel's globals, but it is only ever locked
/// with interrupts already disabled and is always unlocked again
/// before the low-level stack switch runs — holding it across a switch
/// would deadlock the thread switched to if it ever touched scheduler
/// state itself.
extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::sync::atomic::Ordering;
use spin::Mutex;
use x86_64::instructions::interrupts::without_interrupts;

use super::fixed_point::Fixed;
use super::intr;
use super::list::TidList;
use super::switch::{self, Context, InitialFrame};

pub type Tid = u64;
pub const TID_ERROR: Tid = 0;

pub const PRI_MIN: u8 = 0;
pub const PRI_DEFAULT: u8 = 31;
pub const PRI_MAX: u8 = 63;
pub const NICE_MIN: i32 = -20;
pub const NICE_MAX: i32 = 20;
pub const TIMER_FREQ: u64 = 100;

const TIME_SLICE: u64 = 4;
const THREAD_STACK_SIZE: usize = 16 * 1024;
const MAX_DONATION_DEPTH: u32 = 8;
const MLFQ_LEVELS: usize = 64;
const STACK_MAGIC: u64 = 0xcd6a_bf4b_4b17_fa8c;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    Ready,
    Blocked,
    Dying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockedReason {
    Unknown,
    Sleeping(u64),
    WaitingOnLock(Tid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Priority,
    Mlfq,
}

pub struct Thread {
    pub tid: Tid,
    pub name: String,
    pub status: Status,
    base_priority: u8,
    donated_priority: u8,
    nice: i32,
    recent_cpu: Fixed,
    blocked_reason: BlockedReason,
    context: Context,
    stack_bottom: *mut u8,
    stack_layout: Layout,
}

// Thread carries a raw pointer to its own stack allocation, only ever
// touched with the scheduler lock held (and, for the backing bytes,
// only by the allocator at creation/destruction time).
unsafe impl Send for Thread {}

impl Thread {
    pub fn effective_priority(&self) -> u8 {
        core::cmp::max(self.base_priority, self.donated_priority)
    }
}

#[derive(Clone)]
pub struct ThreadInfo {
    pub tid: Tid,
    pub name: String,
    pub status: Status,
    pub base_priority: u8,
    pub effective_priority: u8,
    pub nice: i32,
    pub recent_cpu: i32,
}

enum Ready {
    Priority(TidList),
    Mlfq {
        buckets: [TidList; MLFQ_LEVELS],
        size: usize,
    },
}

struct SchedulerState {
    policy: Policy,
    threads: BTreeMap<Tid, Box<Thread>>,
    ready: Ready,
    sleeping: TidList,
    current: Tid,
    idle_tid: Tid,
    initial_tid: Tid,
    next_tid: Tid,
    time_slice: u64,
    load_avg: Fixed,
}

unsafe impl Send for SchedulerState {}

static STATE: Mutex<Option<SchedulerState>> = Mutex::new(None);

/// Sets up the all-threads table with the currently executing context
/// (whatever called this, i.e. the boot thread) as tid 0. Must run
/// with interrupts off, before any other `threads::` call.
pub fn init(policy: Policy) {
    let mut threads = BTreeMap::new();
    threads.insert(
        0,
        Box::new(Thread {
            tid: 0,
            name: String::from("main"),
            status: Status::Running,
            base_priority: PRI_DEFAULT,
            donated_priority: 0,
            nice: 0,
            recent_cpu: Fixed::ZERO,
            blocked_reason: BlockedReason::Unknown,
            context: Context::new(0, 0),
            stack_bottom: core::ptr::null_mut(),
            stack_layout: Layout::new::<u8>(),
        }),
    );

    let ready = match policy {
        Policy::Priority => Ready::Priority(TidList::new()),
        Policy::Mlfq => Ready::Mlfq {
            buckets: core::array::from_fn(|_| TidList::new()),
            size: 0,
        },
    };

    *STATE.lock() = Some(SchedulerState {
        policy,
        threads,
        ready,
        sleeping: TidList::new(),
        current: 0,
        idle_tid: 0,
        initial_tid: 0,
        next_tid: 1,
        time_slice: 0,
        load_avg: Fixed::ZERO,
    });

    crate::serial_println!(
        "threads: scheduler initialized ({} policy)",
        match policy {
            Policy::Priority => "priority",
            Policy::Mlfq => "mlfq",
        }
    );
}

/// Creates the idle thread and enables interrupts. Call once, after
/// `init`, from the boot thread.
pub fn start() {
    let idle_tid = create("idle", PRI_MIN, idle_entry, 0).expect("failed to create idle thread");

    without_interrupts(|| {
        let mut guard = STATE.lock();
        let state = guard.as_mut().unwrap();
        match &mut state.ready {
            Ready::Priority(list) => {
                list.remove(idle_tid);
            }
            Ready::Mlfq { buckets, size } => {
                for bucket in buckets.iter_mut() {
                    if bucket.remove(idle_tid) {
                        *size = size.saturating_sub(1);
                    }
                }
            }
        }
        let idle = state.threads.get_mut(&idle_tid).unwrap();
        idle.status = Status::Blocked;
        idle.blocked_reason = BlockedReason::Unknown;
        state.idle_tid = idle_tid;
    });

    x86_64::instructions::interrupts::enable();
    crate::serial_println!("threads: idle thread ready (tid {})", idle_tid);
}

extern "C" fn idle_entry(_arg: u64) {
    loop {
        x86_64::instructions::hlt();
    }
}

fn mlfq_priority_value(recent_cpu: Fixed, nice: i32) -> u8 {
    let value = PRI_MAX as i32 - recent_cpu.div_int(4).to_int_round() - 2 * nice;
    value.clamp(PRI_MIN as i32, PRI_MAX as i32) as u8
}

fn push_ready(state: &mut SchedulerState, tid: Tid) {
    match &mut state.ready {
        Ready::Priority(list) => {
            let threads = &state.threads;
            list.insert_by_key_desc(tid, |t| {
                threads.get(&t).map(|th| th.effective_priority()).unwrap_or(0)
            });
        }
        Ready::Mlfq { buckets, size } => {
            let idx = state.threads.get(&tid).unwrap().base_priority as usize;
            buckets[idx].push_back(tid);
            *size += 1;
        }
    }
    state.threads.get_mut(&tid).unwrap().status = Status::Ready;
}

fn reposition_ready(state: &mut SchedulerState, tid: Tid) {
    if let Ready::Priority(list) = &mut state.ready {
        if list.remove(tid) {
            push_ready(state, tid);
        }
    }
}

fn pop_next_ready(state: &mut SchedulerState) -> Tid {
    let popped = match &mut state.ready {
        Ready::Priority(list) => list.pop_front(),
        Ready::Mlfq { buckets, size } => {
            let mut found = None;
            for idx in (0..MLFQ_LEVELS).rev() {
                if let Some(tid) = buckets[idx].pop_front() {
                    found = Some(tid);
                    break;
                }
            }
            if found.is_some() {
                *size -= 1;
            }
            found
        }
    };
    popped.unwrap_or(state.idle_tid)
}

fn begin_switch(state: &mut SchedulerState) -> (*mut Context, *const Context) {
    let next = pop_next_ready(state);
    let cur = state.current;
    state.current = next;
    state.time_slice = 0;
    state.threads.get_mut(&next).unwrap().status = Status::Running;
    let cur_ptr: *mut Context = &mut state.threads.get_mut(&cur).unwrap().context;
    let next_ptr: *const Context = &state.threads.get(&next).unwrap().context;
    (cur_ptr, next_ptr)
}

fn finish_switch(cur_ptr: *mut Context, next_ptr: *const Context) {
    if core::ptr::eq(cur_ptr as *const Context, next_ptr) {
        return;
    }
    let prev_ctx = unsafe { switch::switch_threads(cur_ptr, next_ptr) };
    let prev_tid = unsafe { (*prev_ctx).owner };
    schedule_tail(prev_tid);
}

/// Runs once a switch has landed in the new current thread: promotes
/// it fully to Running in the bookkeeping sense and, if the thread
/// just switched away from is dying, releases its stack now that
/// nothing is executing on it.
pub(crate) fn schedule_tail(prev_tid: Tid) {
    without_interrupts(|| {
        let mut guard = STATE.lock();
        let state = guard.as_mut().unwrap();
        check_stack_magic(state, state.current);
        if let Some(prev) = state.threads.get(&prev_tid) {
            if prev.status == Status::Dying && prev_tid != state.initial_tid {
                let ptr = prev.stack_bottom;
                let layout = prev.stack_layout;
                state.threads.remove(&prev_tid);
                unsafe {
                    alloc::alloc::dealloc(ptr, layout);
                }
            }
        }
    });
}

fn check_stack_magic(state: &SchedulerState, tid: Tid) {
    if let Some(th) = state.threads.get(&tid) {
        if th.stack_bottom.is_null() {
            return;
        }
        let val = unsafe { (th.stack_bottom as *const u64).read() };
        assert_eq!(
            val, STACK_MAGIC,
            "thread {} ({}) overflowed its stack",
            th.tid, th.name
        );
    }
}

/// Spawns a new kernel thread running `entry(arg)`. Fails only if the
/// page allocator cannot supply a stack.
pub fn create(name: &str, priority: u8, entry: extern "C" fn(u64), arg: u64) -> Result<Tid, ()> {
    assert!(
        priority <= PRI_MAX,
        "thread priority {} out of range [{}, {}]",
        priority,
        PRI_MIN,
        PRI_MAX
    );
    let layout = Layout::from_size_align(THREAD_STACK_SIZE, 16).unwrap();
    let stack_bottom = unsafe { alloc::alloc::alloc_zeroed(layout) };
    if stack_bottom.is_null() {
        return Err(());
    }
    unsafe {
        (stack_bottom as *mut u64).write(STACK_MAGIC);
    }
    let stack_top = unsafe { stack_bottom.add(THREAD_STACK_SIZE) } as u64;
    let frame = InitialFrame::new(entry as u64, arg);
    let frame_addr = unsafe {
        let ptr = (stack_top as *mut InitialFrame).sub(1);
        ptr.write(frame);
        ptr as u64
    };

    let (tid, yield_needed) = without_interrupts(|| {
        let mut guard = STATE.lock();
        let state = guard.as_mut().unwrap();
        let tid = state.next_tid;
        state.next_tid += 1;

        let (nice, recent_cpu) = {
            let cur = state.threads.get(&state.current).unwrap();
            (cur.nice, cur.recent_cpu)
        };

        let base_priority = if state.policy == Policy::Mlfq {
            mlfq_priority_value(recent_cpu, nice)
        } else {
            priority
        };

        let thread = Box::new(Thread {
            tid,
            name: String::from(name),
            status: Status::Ready,
            base_priority,
            donated_priority: 0,
            nice,
            recent_cpu,
            blocked_reason: BlockedReason::Unknown,
            context: Context::new(tid, frame_addr),
            stack_bottom,
            stack_layout: layout,
        });
        state.threads.insert(tid, thread);
        push_ready(state, tid);

        let cur_effective = state.threads.get(&state.current).unwrap().effective_priority();
        let new_effective = state.threads.get(&tid).unwrap().effective_priority();
        let yield_needed = state.policy == Policy::Priority
            && state.current != state.idle_tid
            && new_effective > cur_effective;
        (tid, yield_needed)
    });

    if yield_needed {
        yield_now();
    }

    Ok(tid)
}

pub fn current() -> Tid {
    without_interrupts(|| STATE.lock().as_ref().unwrap().current)
}

pub fn name() -> String {
    without_interrupts(|| {
        let guard = STATE.lock();
        let state = guard.as_ref().unwrap();
        state.threads.get(&state.current).unwrap().name.clone()
    })
}

pub fn foreach_snapshot() -> Vec<ThreadInfo> {
    without_interrupts(|| {
        let guard = STATE.lock();
        let state = guard.as_ref().unwrap();
        state
            .threads
            .values()
            .map(|t| ThreadInfo {
                tid: t.tid,
                name: t.name.clone(),
                status: t.status,
                base_priority: t.base_priority,
                effective_priority: t.effective_priority(),
                nice: t.nice,
                recent_cpu: t.recent_cpu.mul_int(100).to_int_round(),
            })
            .collect()
    })
}

/// Marks the current thread Blocked with `reason` and schedules away
/// from it. The caller is responsible for having already placed the
/// thread on whatever wait list corresponds to `reason`.
pub(crate) fn block(reason: BlockedReason) {
    debug_assert!(
        !intr::in_interrupt_context(),
        "block() called from interrupt context"
    );
    without_interrupts(|| {
        let (cur_ptr, next_ptr) = {
            let mut guard = STATE.lock();
            let state = guard.as_mut().unwrap();
            let cur = state.current;
            {
                let th = state.threads.get_mut(&cur).unwrap();
                th.status = Status::Blocked;
                th.blocked_reason = reason;
            }
            begin_switch(state)
        };
        finish_switch(cur_ptr, next_ptr);
    });
}

/// Moves a Blocked thread to Ready. Does not itself preempt — the
/// caller keeps running until its next suspension point or the next
/// timer tick.
pub fn unblock(tid: Tid) {
    without_interrupts(|| {
        let mut guard = STATE.lock();
        let state = guard.as_mut().unwrap();
        {
            let th = state.threads.get_mut(&tid).unwrap();
            assert_eq!(th.status, Status::Blocked, "unblock of a non-blocked thread");
            th.blocked_reason = BlockedReason::Unknown;
        }
        push_ready(state, tid);
    });
}

pub fn yield_now() {
    without_interrupts(|| {
        let (cur_ptr, next_ptr) = {
            let mut guard = STATE.lock();
            let state = guard.as_mut().unwrap();
            let cur = state.current;
            if cur == state.idle_tid {
                state.threads.get_mut(&cur).unwrap().status = Status::Blocked;
            } else {
                push_ready(state, cur);
            }
            begin_switch(state)
        };
        finish_switch(cur_ptr, next_ptr);
    });
}

pub fn exit() -> ! {
    without_interrupts(|| {
        let (cur_ptr, next_ptr) = {
            let mut guard = STATE.lock();
            let state = guard.as_mut().unwrap();
            let cur = state.current;
            state.threads.get_mut(&cur).unwrap().status = Status::Dying;
            begin_switch(state)
        };
        finish_switch(cur_ptr, next_ptr);
    });
    unreachable!("a dying thread was scheduled again");
}

pub fn sleep_until(wake_tick: u64) {
    without_interrupts(|| {
        let (cur_ptr, next_ptr) = {
            let mut guard = STATE.lock();
            let state = guard.as_mut().unwrap();
            let cur = state.current;
            {
                let th = state.threads.get_mut(&cur).unwrap();
                th.status = Status::Blocked;
                th.blocked_reason = BlockedReason::Sleeping(wake_tick);
            }
            let threads_ref = &state.threads;
            state.sleeping.insert_by_key_asc(cur, |t| {
                match threads_ref.get(&t).unwrap().blocked_reason {
                    BlockedReason::Sleeping(w) => w,
                    _ => u64::MAX,
                }
            });
            begin_switch(state)
        };
        finish_switch(cur_ptr, next_ptr);
    });
}

fn wake_sleepers(state: &mut SchedulerState, now: u64) {
    loop {
        let due = match state.sleeping.front() {
            Some(tid) => match state.threads.get(&tid).unwrap().blocked_reason {
                BlockedReason::Sleeping(w) => w <= now,
                _ => false,
            },
            None => false,
        };
        if !due {
            break;
        }
        let tid = state.sleeping.pop_front().unwrap();
        state.threads.get_mut(&tid).unwrap().blocked_reason = BlockedReason::Unknown;
        push_ready(state, tid);
    }
}

fn mlfq_recompute_all(state: &mut SchedulerState) {
    let ready_n = {
        let size = match &state.ready {
            Ready::Mlfq { size, .. } => *size,
            Ready::Priority(_) => 0,
        };
        size + usize::from(state.current != state.idle_tid)
    };
    let f59_60 = Fixed::fraction(59, 60);
    let f1_60 = Fixed::fraction(1, 60);
    state.load_avg = f59_60 * state.load_avg + f1_60.mul_int(ready_n as i32);

    let two_load_avg = state.load_avg.mul_int(2);
    let coeff = two_load_avg / two_load_avg.add_int(1);

    let tids: Vec<Tid> = state.threads.keys().copied().collect();
    for tid in &tids {
        if *tid == state.idle_tid {
            continue;
        }
        let th = state.threads.get_mut(tid).unwrap();
        th.recent_cpu = coeff * th.recent_cpu + Fixed::from_int(th.nice);
    }

    for tid in tids {
        if tid == state.idle_tid {
            continue;
        }
        let (new_priority, old_priority, is_ready) = {
            let th = state.threads.get(&tid).unwrap();
            (
                mlfq_priority_value(th.recent_cpu, th.nice),
                th.base_priority,
                th.status == Status::Ready,
            )
        };
        state.threads.get_mut(&tid).unwrap().base_priority = new_priority;
        if new_priority != old_priority && is_ready {
            if let Ready::Mlfq { buckets, .. } = &mut state.ready {
                if buckets[old_priority as usize].remove(tid) {
                    buckets[new_priority as usize].push_back(tid);
                }
            }
        }
    }
}

/// Runs at every hardware timer tick, in interrupt context.
pub fn tick() {
    let now = crate::interrupts::TICK_COUNT.load(Ordering::Relaxed);
    let mut guard = STATE.lock();
    let state = guard.as_mut().unwrap();

    if state.current != state.idle_tid {
        let th = state.threads.get_mut(&state.current).unwrap();
        th.recent_cpu = th.recent_cpu.add_int(1);
    }

    if state.policy == Policy::Mlfq && now % TIMER_FREQ == 0 {
        mlfq_recompute_all(state);
    }

    wake_sleepers(state, now);

    state.time_slice += 1;
    if state.time_slice >= TIME_SLICE {
        intr::request_yield();
    }
    drop(guard);

    // Retire this tick's interrupt-context bookkeeping before possibly
    // yielding: `yield_now` below may perform the real context switch,
    // suspending this exact call frame until this thread is resumed,
    // which could be long after other threads have run in the interim.
    // Those threads must see `in_interrupt_context() == false`, so the
    // depth counter has to be back at zero before the switch, not after
    // this function returns.
    intr::exit_interrupt_context();

    if intr::take_yield_request() {
        yield_now();
    }
}

pub fn set_priority(new_priority: u8) {
    let new_priority = new_priority.min(PRI_MAX);
    let should_yield = without_interrupts(|| {
        let mut guard = STATE.lock();
        let state = guard.as_mut().unwrap();
        if state.policy == Policy::Mlfq {
            return false;
        }
        let cur = state.current;
        state.threads.get_mut(&cur).unwrap().base_priority = new_priority;
        true
    });
    if should_yield {
        yield_now();
    }
}

pub fn get_priority() -> u8 {
    without_interrupts(|| {
        let guard = STATE.lock();
        let state = guard.as_ref().unwrap();
        state.threads.get(&state.current).unwrap().effective_priority()
    })
}

pub fn effective_priority(tid: Tid) -> u8 {
    without_interrupts(|| {
        let guard = STATE.lock();
        guard
            .as_ref()
            .unwrap()
            .threads
            .get(&tid)
            .map(|t| t.effective_priority())
            .unwrap_or(0)
    })
}

pub fn set_nice(n: i32) {
    let n = n.clamp(NICE_MIN, NICE_MAX);
    without_interrupts(|| {
        let mut guard = STATE.lock();
        let state = guard.as_mut().unwrap();
        let cur = state.current;
        state.threads.get_mut(&cur).unwrap().nice = n;
    });
}

pub fn get_nice() -> i32 {
    without_interrupts(|| {
        let guard = STATE.lock();
        let state = guard.as_ref().unwrap();
        state.threads.get(&state.current).unwrap().nice
    })
}

pub fn get_load_avg() -> i32 {
    without_interrupts(|| {
        let guard = STATE.lock();
        guard.as_ref().unwrap().load_avg.mul_int(100).to_int_round()
    })
}

pub fn get_recent_cpu() -> i32 {
    without_interrupts(|| {
        let guard = STATE.lock();
        let state = guard.as_ref().unwrap();
        state
            .threads
            .get(&state.current)
            .unwrap()
            .recent_cpu
            .mul_int(100)
            .to_int_round()
    })
}

/// Walks the donation chain: raises `holder`'s donated priority to at
/// least `gift`, then continues to whoever `holder` is itself waiting
/// on, if anyone. Monotonic — never lowers a donated priority.
pub(crate) fn donate_priority(holder: Tid, gift: u8, depth: u32) {
    if depth > MAX_DONATION_DEPTH {
        return;
    }
    let next = without_interrupts(|| {
        let mut guard = STATE.lock();
        let state = guard.as_mut().unwrap();
        if state.policy != Policy::Priority {
            return None;
        }
        let raised = {
            let th = state.threads.get_mut(&holder).unwrap();
            if gift > th.donated_priority {
                th.donated_priority = gift;
                true
            } else {
                false
            }
        };
        if raised {
            reposition_ready(state, holder);
        }
        let th = state.threads.get(&holder).unwrap();
        if th.status == Status::Blocked {
            if let BlockedReason::WaitingOnLock(next_holder) = th.blocked_reason {
                Some(next_holder)
            } else {
                None
            }
        } else {
            None
        }
    });
    if let Some(next_holder) = next {
        donate_priority(next_holder, gift, depth + 1);
    }
}

/// Recomputes `tid`'s donated priority from scratch as the maximum
/// effective priority among threads currently waiting on a lock it
/// holds. Called when a lock is released — unlike `donate_priority`,
/// this can lower the value.
pub(crate) fn recompute_donated_priority(tid: Tid) {
    without_interrupts(|| {
        let mut guard = STATE.lock();
        let state = guard.as_mut().unwrap();
        if state.policy != Policy::Priority {
            return;
        }
        let max_gift = state
            .threads
            .values()
            .filter(|t| {
                t.status == Status::Blocked
                    && matches!(t.blocked_reason, BlockedReason::WaitingOnLock(h) if h == tid)
            })
            .map(|t| t.effective_priority())
            .max()
            .unwrap_or(0);
        state.threads.get_mut(&tid).unwrap().donated_priority = max_gift;
        reposition_ready(state, tid);
    });
}
