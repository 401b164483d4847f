//! Idle table - per-worker deadline tracking
//!
//! Put a keyed item in the table with a time-to-live; if the deadline
//! expires the item is removed and its callback runs on the owning
//! worker. Keep calling [`IdleTable::keep_alive`] to push the deadline
//! out. Adapters use this to bound idle lines: on expiry they synthesize
//! a `finish`.
//!
//! Re-arming never walks the heap; stale heap entries are skipped at
//! pop time by comparing against the authoritative deadline in the map.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use super::WorkerCtx;

/// Key chosen by the caller; line ids in practice.
pub type IdleKey = u64;

/// Runs on the owning worker when the item expires.
pub type IdleCallback = Box<dyn FnOnce(&WorkerCtx, IdleKey)>;

struct IdleEntry {
    deadline: Instant,
    callback: IdleCallback,
}

/// Deadline table owned by one worker.
#[derive(Default)]
pub struct IdleTable {
    heap: BinaryHeap<Reverse<(Instant, IdleKey)>>,
    entries: HashMap<IdleKey, IdleEntry>,
}

impl IdleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `key` with the given time-to-live. Replaces any existing
    /// entry for the key.
    pub fn insert(&mut self, key: IdleKey, ttl: Duration, callback: IdleCallback) {
        let deadline = Instant::now() + ttl;
        self.heap.push(Reverse((deadline, key)));
        self.entries.insert(key, IdleEntry { deadline, callback });
    }

    /// Push the deadline of `key` out by `ttl` from now. Returns false
    /// when the key is not tracked (already expired or removed).
    pub fn keep_alive(&mut self, key: IdleKey, ttl: Duration) -> bool {
        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.deadline = Instant::now() + ttl;
                self.heap.push(Reverse((entry.deadline, key)));
                true
            }
            None => false,
        }
    }

    /// Stop tracking `key` without running its callback.
    pub fn remove(&mut self, key: IdleKey) -> bool {
        self.entries.remove(&key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest live deadline, for the worker's poll timeout.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, key))) = self.heap.peek().copied() {
            match self.entries.get(&key) {
                Some(entry) if entry.deadline == deadline => return Some(deadline),
                // stale heap entry: removed or re-armed
                _ => {
                    self.heap.pop();
                }
            }
        }
        None
    }

    /// Detach every item whose deadline passed. The worker runs the
    /// callbacks after this borrow ends.
    pub fn pop_due(&mut self, now: Instant) -> Vec<(IdleKey, IdleCallback)> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, key))) = self.heap.peek().copied() {
            if deadline > now {
                match self.entries.get(&key) {
                    Some(entry) if entry.deadline == deadline => break,
                    _ => {
                        self.heap.pop();
                        continue;
                    }
                }
            }
            self.heap.pop();
            match self.entries.get(&key) {
                Some(entry) if entry.deadline == deadline => {
                    let entry = self.entries.remove(&key).expect("entry present");
                    due.push((key, entry.callback));
                }
                // stale heap entry
                _ => {}
            }
        }
        due
    }
}
