// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The destination descriptor: a packed value naming where a task should run. Packing this into
//! a single `u32` (rather than a plain struct of fields) keeps `Task` small and lets routing
//! compare/rewrite a destination with cheap bit operations, matching the reference spec's
//! "packed value" framing for this field.

use crate::containers::stalling::{HIGH_PRIORITY, NORMAL_PRIORITY};
use std::fmt;

/// Sentinel thread index meaning "route to any worker in the requested band" rather than a named
/// thread.
const ANY_THREAD: u16 = u16::MAX;

const THREAD_BITS: u32 = 16;
const BAND_BITS: u32 = 2;
const QUEUE_BITS: u32 = 1;
const PRIORITY_BITS: u32 = 1;

const THREAD_SHIFT: u32 = 0;
const BAND_SHIFT: u32 = THREAD_SHIFT + THREAD_BITS;
const QUEUE_SHIFT: u32 = BAND_SHIFT + BAND_BITS;
const PRIORITY_SHIFT: u32 = QUEUE_SHIFT + QUEUE_BITS;

static_assertions::const_assert!(PRIORITY_SHIFT + PRIORITY_BITS <= 32);

/// Thread-priority band of the worker pool a task runs in. Irrelevant for tasks routed to a
/// named thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadBand {
    Normal = 0,
    High = 1,
    Background = 2,
}

impl ThreadBand {
    fn from_bits(bits: u32) -> Self {
        match bits {
            0 => Self::Normal,
            1 => Self::High,
            2 => Self::Background,
            other => unreachable!("band field only ever stores 2 bits, got {other}"),
        }
    }
}

/// Task priority within a band's stalling FIFO. Maps directly onto
/// [`crate::containers::stalling::HIGH_PRIORITY`] / `NORMAL_PRIORITY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPriority {
    Normal,
    High,
}

impl TaskPriority {
    #[must_use]
    pub fn stalling_queue_index(self) -> usize {
        match self {
            Self::Normal => NORMAL_PRIORITY,
            Self::High => HIGH_PRIORITY,
        }
    }
}

/// Which of a named thread's two queues a task targets. Local queues are only ever pushed by
/// their owning thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamedQueue {
    Main,
    Local,
}

/// A packed routing target: either a named thread (by index, with a queue choice) or "any
/// worker" in a given thread-priority band — plus, in both cases, a task priority.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Destination(u32);

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Destination");
        match self.thread_index() {
            Some(idx) => s.field("thread", &idx).field("queue", &self.queue()),
            None => s.field("band", &self.band()),
        };
        s.field("task_priority", &self.task_priority()).finish()
    }
}

impl Destination {
    #[must_use]
    pub fn any_worker(band: ThreadBand, task_priority: TaskPriority) -> Self {
        Self::pack(ANY_THREAD, band as u32, NamedQueue::Main, task_priority)
    }

    #[must_use]
    pub fn named(thread_index: u16, queue: NamedQueue, task_priority: TaskPriority) -> Self {
        debug_assert_ne!(thread_index, ANY_THREAD, "thread index collides with any-worker sentinel");
        Self::pack(thread_index, ThreadBand::Normal as u32, queue, task_priority)
    }

    fn pack(thread_index: u16, band: u32, queue: NamedQueue, task_priority: TaskPriority) -> Self {
        let queue_bit = match queue {
            NamedQueue::Main => 0,
            NamedQueue::Local => 1,
        };
        let priority_bit = match task_priority {
            TaskPriority::Normal => 0,
            TaskPriority::High => 1,
        };
        Self(
            (u32::from(thread_index) << THREAD_SHIFT)
                | (band << BAND_SHIFT)
                | (queue_bit << QUEUE_SHIFT)
                | (priority_bit << PRIORITY_SHIFT),
        )
    }

    #[must_use]
    pub fn thread_index(self) -> Option<u16> {
        let idx = ((self.0 >> THREAD_SHIFT) & ((1 << THREAD_BITS) - 1)) as u16;
        (idx != ANY_THREAD).then_some(idx)
    }

    #[must_use]
    pub fn queue(self) -> NamedQueue {
        if (self.0 >> QUEUE_SHIFT) & 1 == 1 {
            NamedQueue::Local
        } else {
            NamedQueue::Main
        }
    }

    #[must_use]
    pub fn band(self) -> ThreadBand {
        ThreadBand::from_bits((self.0 >> BAND_SHIFT) & ((1 << BAND_BITS) - 1))
    }

    #[must_use]
    pub fn task_priority(self) -> TaskPriority {
        if (self.0 >> PRIORITY_SHIFT) & 1 == 1 {
            TaskPriority::High
        } else {
            TaskPriority::Normal
        }
    }

    /// Return a copy of this destination routed to `band` instead, keeping the task priority.
    /// Used to implement the background→normal / high→normal demotion fallback when a band has
    /// no workers.
    #[must_use]
    pub fn with_band(self, band: ThreadBand) -> Self {
        Self::any_worker(band, self.task_priority())
    }

    /// Return a copy of this destination with a different task priority, keeping everything
    /// else.
    #[must_use]
    pub fn with_task_priority(self, task_priority: TaskPriority) -> Self {
        Self(
            (self.0 & !(1 << PRIORITY_SHIFT))
                | (match task_priority {
                    TaskPriority::Normal => 0,
                    TaskPriority::High => 1,
                } << PRIORITY_SHIFT),
        )
    }

    #[must_use]
    pub fn is_any_worker(self) -> bool {
        self.thread_index().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_worker_round_trips_band_and_priority() {
        let d = Destination::any_worker(ThreadBand::High, TaskPriority::High);
        assert!(d.is_any_worker());
        assert_eq!(d.band(), ThreadBand::High);
        assert_eq!(d.task_priority(), TaskPriority::High);
    }

    #[test]
    fn named_round_trips_thread_and_queue() {
        let d = Destination::named(3, NamedQueue::Local, TaskPriority::Normal);
        assert_eq!(d.thread_index(), Some(3));
        assert_eq!(d.queue(), NamedQueue::Local);
        assert_eq!(d.task_priority(), TaskPriority::Normal);
    }

    #[test]
    fn with_band_preserves_priority_and_clears_thread() {
        let d = Destination::any_worker(ThreadBand::Background, TaskPriority::High);
        let demoted = d.with_band(ThreadBand::Normal);
        assert_eq!(demoted.band(), ThreadBand::Normal);
        assert_eq!(demoted.task_priority(), TaskPriority::High);
        assert!(demoted.is_any_worker());
    }

    #[test]
    fn with_task_priority_preserves_band() {
        let d = Destination::any_worker(ThreadBand::High, TaskPriority::Normal);
        let bumped = d.with_task_priority(TaskPriority::High);
        assert_eq!(bumped.band(), ThreadBand::High);
        assert_eq!(bumped.task_priority(), TaskPriority::High);
    }
}
