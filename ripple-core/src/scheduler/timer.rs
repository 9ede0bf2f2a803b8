//! Deadline-ordered timer queue.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use super::{Task, TaskHandle};

pub(crate) struct Timer {
    deadline: Instant,
    seq: u64,
    pub(crate) task: Task,
    pub(crate) handle: TaskHandle,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    // Reversed so the BinaryHeap pops the earliest deadline first, ties
    // broken by insertion order.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Timer>,
    next_seq: u64,
}

impl TimerQueue {
    pub(crate) fn push(&mut self, deadline: Instant, task: Task, handle: TaskHandle) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Timer {
            deadline,
            seq,
            task,
            handle,
        });
    }

    /// Sequence number the next pushed timer will get.
    pub(crate) fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Pop the earliest timer if it is due at `now` and was pushed before
    /// `cutoff`.
    pub(crate) fn pop_due(&mut self, now: Instant, cutoff: u64) -> Option<Timer> {
        // A timer pushed after `cutoff` holds the queue until the next call.
        let top = self.heap.peek()?;
        if top.deadline > now || top.seq >= cutoff {
            return None;
        }
        self.heap.pop()
    }

    pub(crate) fn has_due(&self, now: Instant) -> bool {
        self.heap
            .peek()
            .map(|timer| timer.deadline <= now)
            .unwrap_or(false)
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|timer| timer.deadline)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}
