// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The stalling multi-priority FIFO: the queue type each worker-pool band is built from.
//!
//! Internally this holds one [`Queue`] per task-priority sub-band (high, then normal — scanned in
//! that order by [`StallingQueue::pop`]) plus a single "master state" [`TaggedPtr`] whose *index*
//! field is repurposed as a bitmask of which worker slots in this band have declared themselves
//! stalled, rather than as a link index. The worker-pool bands themselves (normal/high/background
//! thread priority) each get their own `StallingQueue` instance — see
//! [`crate::scheduler::worker`].

use crate::containers::{Linked, Queue};
use crate::loom::sync::atomic::Ordering;
use crate::tagged_ptr::{AtomicTaggedPtr, TaggedPtr};
use crate::util::Backoff;
use std::fmt;

/// Task priority within a band: scanned high-first by [`StallingQueue::pop`].
pub const HIGH_PRIORITY: usize = 0;
pub const NORMAL_PRIORITY: usize = 1;
const NUM_TASK_PRIORITIES: usize = 2;

/// Mask width is bounded by the tagged pointer's index field, same as any other link index.
const MAX_STALL_WORKERS: u32 = crate::tagged_ptr::MAX_LINKS;

const MASK_ABA_INCREMENT: u64 = 1;

pub struct StallingQueue<T: Linked> {
    fifos: [Queue<T>; NUM_TASK_PRIORITIES],
    master: AtomicTaggedPtr,
}

impl<T: Linked> fmt::Debug for StallingQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let master = self.master.load(Ordering::Relaxed);
        f.debug_struct("StallingQueue")
            .field("stalled_mask", &master.index())
            .finish_non_exhaustive()
    }
}

impl<T: Linked> Default for StallingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Linked> StallingQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            fifos: std::array::from_fn(|_| Queue::new()),
            master: AtomicTaggedPtr::new(TaggedPtr::new(0, 0)),
        }
    }

    /// Push `item` into the `priority` sub-band ([`HIGH_PRIORITY`] or [`NORMAL_PRIORITY`]).
    ///
    /// If a worker in this band is currently stalled, clears the lowest-numbered stalled worker's
    /// bit and returns its index so the caller can wake it. Returns `None` if no worker was
    /// stalled, or if every queue was already drained again by the time this push would have
    /// picked a victim (the wake is abandoned rather than waking a worker for no reason).
    #[must_use]
    pub fn push(&self, item: T::Handle, priority: usize) -> Option<u32> {
        debug_assert!(priority < NUM_TASK_PRIORITIES);
        self.fifos[priority].push(item);

        let mut backoff = Backoff::new();
        loop {
            let current = self.master.load(Ordering::Acquire);
            let mask = current.index();
            if mask == 0 {
                return None;
            }
            if self.all_empty() {
                return None;
            }
            let worker = mask.trailing_zeros();
            let new_mask = mask & !(1 << worker);
            let new = current.advance_counter_and_state(new_mask, MASK_ABA_INCREMENT);
            match self
                .master
                .compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(worker),
                Err(_) => backoff.spin(),
            }
        }
    }

    /// Scan sub-bands high-priority first. If every sub-band is empty and `may_stall`, atomically
    /// mark `worker_index` stalled in the master state before returning `None`; the caller is
    /// then expected to block on its own event until woken by a future `push`.
    ///
    /// # Panics
    ///
    /// Panics (via debug assertion) if `worker_index` is not less than the band's configured
    /// worker count, or exceeds the representable mask width.
    pub fn pop(&self, worker_index: u32, may_stall: bool) -> Option<T::Handle> {
        debug_assert!(worker_index < MAX_STALL_WORKERS);
        for fifo in &self.fifos {
            if let Some(item) = fifo.pop() {
                return Some(item);
            }
        }

        if !may_stall {
            return None;
        }

        let mut backoff = Backoff::new();
        loop {
            let current = self.master.load(Ordering::Acquire);
            let mask = current.index() | (1 << worker_index);
            let new = current.advance_counter_and_state(mask, MASK_ABA_INCREMENT);
            match self
                .master
                .compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return None,
                Err(_) => backoff.spin(),
            }
        }
    }

    #[must_use]
    pub fn stalled_mask(&self) -> u32 {
        self.master.load(Ordering::Acquire).index()
    }

    fn all_empty(&self) -> bool {
        self.fifos.iter().all(Queue::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_with_no_stalled_workers_returns_none() {
        let queue: StallingQueue<Box<u32>> = StallingQueue::new();
        assert_eq!(queue.push(Box::new(1), NORMAL_PRIORITY), None);
        assert_eq!(*queue.pop(0, false).unwrap(), 1);
    }

    #[test]
    fn stalled_worker_is_woken_and_bit_cleared() {
        let queue: StallingQueue<Box<u32>> = StallingQueue::new();
        assert!(queue.pop(3, true).is_none());
        assert_eq!(queue.stalled_mask(), 0b1000);

        let woken = queue.push(Box::new(42), NORMAL_PRIORITY);
        assert_eq!(woken, Some(3));
        assert_eq!(queue.stalled_mask(), 0);
    }

    #[test]
    fn lowest_numbered_stalled_worker_wins() {
        let queue: StallingQueue<Box<u32>> = StallingQueue::new();
        assert!(queue.pop(5, true).is_none());
        assert!(queue.pop(1, true).is_none());
        assert!(queue.pop(2, true).is_none());
        assert_eq!(queue.push(Box::new(1), NORMAL_PRIORITY), Some(1));
    }

    #[test]
    fn high_priority_sub_band_is_scanned_first() {
        let queue: StallingQueue<Box<u32>> = StallingQueue::new();
        queue.push(Box::new(1), NORMAL_PRIORITY);
        queue.push(Box::new(2), HIGH_PRIORITY);
        assert_eq!(*queue.pop(0, false).unwrap(), 2);
        assert_eq!(*queue.pop(0, false).unwrap(), 1);
    }
}
