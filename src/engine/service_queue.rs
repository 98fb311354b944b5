//! Service queues and the pending set
//!
//! A service queue is one stage of the dispatch pipeline.  Child groups
//! with queued bios sit in the stage's pending set ordered by their next
//! eligible dispatch tick; the leftmost entry decides when the stage's
//! deferred timer fires.

use std::collections::{BTreeMap, VecDeque};

use crate::block::{DeviceId, IoDir};
use crate::clock::Ticks;
use crate::engine::group::TgId;
use crate::engine::qnode::QnodeRef;

/// Identifies a service queue: either a device root or a group's sub-queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqRef {
    /// The top-level queue of a device
    Root(DeviceId),
    /// The sub-queue embedded in a throttle group
    Tg(TgId),
}

/// Key into a pending set: dispatch tick with an insertion-order tie-break
pub type PendingKey = (Ticks, u64);

/// One rate-limited dispatcher stage
#[derive(Debug)]
pub struct ServiceQueue {
    /// Round-robin lists of source qnodes with bios to dispatch
    pub queued: [VecDeque<QnodeRef>; IoDir::COUNT],
    /// Bios queued per direction, across all qnodes in `queued`
    pub nr_queued: [u64; IoDir::COUNT],
    /// Children ordered by next dispatch tick
    pending: BTreeMap<PendingKey, TgId>,
    /// Tie-break serial for equal dispatch ticks
    next_serial: u64,
    /// Upstream stage, none for a device root
    pub parent_sq: Option<SqRef>,
    /// Deadline the one-shot timer is currently armed for
    pub timer_deadline: Option<Ticks>,
    /// Bumped on every arm so stale timer entries can be ignored
    pub timer_gen: u64,
}

impl ServiceQueue {
    /// Create a stage feeding into `parent_sq`
    pub fn new(parent_sq: Option<SqRef>) -> Self {
        Self {
            queued: [VecDeque::new(), VecDeque::new()],
            nr_queued: [0, 0],
            pending: BTreeMap::new(),
            next_serial: 0,
            parent_sq,
            timer_deadline: None,
            timer_gen: 0,
        }
    }

    /// Number of pending children
    pub fn nr_pending(&self) -> usize {
        self.pending.len()
    }

    /// Leftmost pending child and its key
    pub fn first_pending(&self) -> Option<(PendingKey, TgId)> {
        self.pending.iter().next().map(|(k, tg)| (*k, *tg))
    }

    /// Dispatch tick of the leftmost pending child
    pub fn first_pending_disptime(&self) -> Option<Ticks> {
        self.first_pending().map(|((t, _), _)| t)
    }

    /// Insert a child keyed by its dispatch tick, returning the key
    pub fn insert_pending(&mut self, disptime: Ticks, tg: TgId) -> PendingKey {
        let key = (disptime, self.next_serial);
        self.next_serial += 1;
        self.pending.insert(key, tg);
        key
    }

    /// Remove a child by the key returned from `insert_pending`
    pub fn remove_pending(&mut self, key: PendingKey) {
        self.pending.remove(&key);
    }

    /// Whether any direction has queued bios
    pub fn has_queued(&self) -> bool {
        self.nr_queued.iter().any(|&n| n > 0)
    }
}
