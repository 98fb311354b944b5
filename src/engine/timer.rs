//! Deferred dispatch timers
//!
//! Every service queue owns one logical one-shot timer.  They are all
//! backed by a single min-heap of (deadline, stage) entries; re-arming a
//! stage bumps its generation so entries from earlier arms fall through
//! harmlessly when popped.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::clock::Ticks;
use crate::engine::service_queue::SqRef;

/// One armed timer shot
#[derive(Debug, Clone, Copy)]
pub struct TimerEntry {
    pub deadline: Ticks,
    pub sq: SqRef,
    /// Stage generation at arm time; stale shots are ignored
    pub gen: u64,
    /// Global sequence for a total heap order
    seq: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline wins.
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

/// Shared timer heap for every stage of the engine
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: Mutex<BinaryHeap<TimerEntry>>,
    notify: Notify,
    next_seq: AtomicU64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) the timer of `sq` for `deadline`
    pub fn arm(&self, deadline: Ticks, sq: SqRef, gen: u64) {
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.heap.lock().push(TimerEntry {
            deadline,
            sq,
            gen,
            seq,
        });
        self.notify.notify_one();
    }

    /// Pop the earliest shot whose deadline has passed
    pub fn pop_due(&self, now: Ticks) -> Option<TimerEntry> {
        let mut heap = self.heap.lock();
        if heap.peek().is_some_and(|e| e.deadline <= now) {
            heap.pop()
        } else {
            None
        }
    }

    /// Earliest armed deadline, if any
    pub fn next_deadline(&self) -> Option<Ticks> {
        self.heap.lock().peek().map(|e| e.deadline)
    }

    /// Wait until a new shot is armed
    pub async fn armed(&self) {
        self.notify.notified().await;
    }

    /// Number of armed shots, stale ones included
    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}
