// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The blocking primitive workers and named threads suspend on, and the pool that backs
//! producer-side waits. [`Event`] itself is adapted from the reference executor's
//! `Parker`/`ParkingLot` state machine, simplified from its lock-free park/unpark dance (which
//! exists there to support parking from inside a `Future::poll`) down to a condvar-backed event:
//! every suspension point in this runtime is a plain blocking call from a dedicated OS thread, so
//! there is no polling context to avoid blocking from. [`EventPool`] itself stays lock-free,
//! reusing the crate's own [`Stack`](crate::containers::Stack).

use crate::containers::Stack;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A single-shot-per-generation wakeable event. `trigger` is idempotent within a generation;
/// `reset` starts a new generation so the event can be reused (the wait API returns events to a
/// pool rather than allocating a fresh one per wait).
#[derive(Debug, Default)]
pub struct Event {
    state: Mutex<bool>,
    condvar: Condvar,
}

impl Event {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let mut triggered = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *triggered = true;
        self.condvar.notify_all();
    }

    pub fn wait(&self) {
        let mut triggered = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        while !*triggered {
            triggered = self
                .condvar
                .wait(triggered)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Wait up to `timeout`. Returns `true` if triggered, `false` if the timeout elapsed first.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut triggered = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let deadline = std::time::Instant::now() + timeout;
        while !*triggered {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return *triggered;
            }
            let (guard, result) = self
                .condvar
                .wait_timeout(triggered, remaining)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            triggered = guard;
            if result.timed_out() && !*triggered {
                return false;
            }
        }
        true
    }

    pub fn reset(&self) {
        *self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = false;
    }
}

/// A lock-free multi-producer multi-consumer pool of reusable [`Event`]s, backed by the same
/// Treiber stack the rest of the crate's lock-free containers use: events are returned after a
/// wait rather than dropped.
#[derive(Debug, Default)]
pub struct EventPool {
    free: Stack<Arc<Event>>,
}

impl EventPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> Arc<Event> {
        if let Some(event) = self.free.pop() {
            event.reset();
            event
        } else {
            Arc::new(Event::new())
        }
    }

    pub fn release(&self, event: Arc<Event>) {
        self.free.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_before_wait_does_not_block() {
        let event = Event::new();
        event.trigger();
        event.wait();
    }

    #[test]
    fn wait_timeout_returns_false_when_never_triggered() {
        let event = Event::new();
        assert!(!event.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn pool_recycles_released_events() {
        let pool = EventPool::new();
        let a = pool.acquire();
        let a_ptr = Arc::as_ptr(&a);
        pool.release(a);
        let b = pool.acquire();
        assert_eq!(Arc::as_ptr(&b), a_ptr);
    }
}
