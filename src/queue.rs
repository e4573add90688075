use std::collections::VecDeque;

use crate::types::RunRequest;

/// Default cap on concurrently executing run requests.
pub const MAX_ACTIVE_APIS: usize = 5;

/// Point-in-time view of the queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub active: usize,
    pub queued: usize,
    pub max_active: usize,
}

/// FIFO of pending run requests plus the count of requests currently executing.
///
/// `active` stays within `[0, max_active]`: `drain` never hands out more than
/// the free capacity, and `release` refuses to underflow.
#[derive(Debug, Clone)]
pub struct RunQueue {
    pending: VecDeque<RunRequest>,
    active: usize,
    max_active: usize,
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new(MAX_ACTIVE_APIS)
    }
}

impl RunQueue {
    /// A `max_active` of zero is raised to one so the queue can always drain.
    pub fn new(max_active: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            active: 0,
            max_active: max_active.max(1),
        }
    }

    /// Append requests to the tail, preserving their order.
    pub fn enqueue(&mut self, requests: impl IntoIterator<Item = RunRequest>) {
        self.pending.extend(requests);
    }

    /// Free slots: `max_active - active`.
    pub fn available(&self) -> usize {
        self.max_active.saturating_sub(self.active)
    }

    /// Remove up to `capacity` requests from the head.
    ///
    /// Does not touch `active`; the caller admits what it drained via [`RunQueue::admit`].
    pub fn drain(&mut self, capacity: usize) -> Vec<RunRequest> {
        let count = capacity.min(self.pending.len());
        self.pending.drain(..count).collect()
    }

    /// Count `n` drained requests as executing. Clamped at `max_active`.
    pub fn admit(&mut self, n: usize) {
        self.active = (self.active + n).min(self.max_active);
    }

    /// Decrement `active` by `n`.
    ///
    /// If that would go below zero nothing changes and false is returned.
    pub fn release(&mut self, n: usize) -> bool {
        match self.active.checked_sub(n) {
            Some(remaining) => {
                self.active = remaining;
                true
            }
            None => false,
        }
    }

    pub fn active(&self) -> usize {
        self.active
    }

    pub fn max_active(&self) -> usize {
        self.max_active
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = &RunRequest> {
        self.pending.iter()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            active: self.active,
            queued: self.pending.len(),
            max_active: self.max_active,
        }
    }

    /// Drop every pending request and zero the active count.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.active = 0;
    }
}
