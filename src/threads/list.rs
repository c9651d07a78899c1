/// Key-indexed ordered lists of thread ids.
///
/// Every scheduling queue in this module — the ready list, the sleep
/// list, MLFQ buckets, semaphore wait lists — is one of these. They
/// hold `Tid`s, never thread memory: the all-threads table in
/// `thread` is the sole owner of a `Thread`, so no two lists can ever
/// alias the same storage. This replaces the raw intrusive-pointer
/// lists a from-scratch C implementation would reach for.
extern crate alloc;

use alloc::collections::VecDeque;

use super::thread::Tid;

#[derive(Default)]
pub struct TidList {
    items: VecDeque<Tid>,
}

impl TidList {
    pub const fn new() -> Self {
        TidList {
            items: VecDeque::new(),
        }
    }

    pub fn push_back(&mut self, tid: Tid) {
        self.items.push_back(tid);
    }

    pub fn pop_front(&mut self) -> Option<Tid> {
        self.items.pop_front()
    }

    pub fn front(&self) -> Option<Tid> {
        self.items.front().copied()
    }

    pub fn remove(&mut self, tid: Tid) -> bool {
        if let Some(pos) = self.items.iter().position(|&t| t == tid) {
            self.items.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Tid> + '_ {
        self.items.iter().copied()
    }

    /// Insert keeping the list ordered descending by `key`; entries
    /// with an equal key go after existing ones (FIFO among ties).
    pub fn insert_by_key_desc(&mut self, tid: Tid, key: impl Fn(Tid) -> u8) {
        let k = key(tid);
        let pos = self
            .items
            .iter()
            .position(|&other| key(other) < k)
            .unwrap_or(self.items.len());
        self.items.insert(pos, tid);
    }

    /// Insert keeping the list ordered ascending by `key` (the sleep
    /// list, keyed by wakeup tick).
    pub fn insert_by_key_asc(&mut self, tid: Tid, key: impl Fn(Tid) -> u64) {
        let k = key(tid);
        let pos = self
            .items
            .iter()
            .position(|&other| key(other) > k)
            .unwrap_or(self.items.len());
        self.items.insert(pos, tid);
    }
}
