// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Component (D): the graph event — the handle through which dependents wait for a task (or an
//! aggregate of tasks) to complete.

use crate::containers::ClosableList;
use crate::error::Closed;
use crate::scheduler::ThreadId;
use crate::task::Task;
use std::sync::Arc;
use std::sync::Mutex;

/// The handle through which dependents wait for a task to complete. Subsequents may only be
/// added while the event is open; the owning task closes it exactly once, from inside
/// [`Task::execute`], when it dispatches.
pub struct GraphEvent {
    subsequents: ClosableList<Arc<Task>>,
    /// Other events this one must wait for before dispatching, mutated only from inside the
    /// owning task's body via `dont_complete_until`.
    wait_for: Mutex<Vec<Arc<GraphEvent>>>,
}

impl std::fmt::Debug for GraphEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphEvent")
            .field("is_complete", &self.is_complete())
            .finish_non_exhaustive()
    }
}

impl Drop for GraphEvent {
    fn drop(&mut self) {
        debug_assert!(
            self.is_complete(),
            "graph event destructed while its subsequents list was still open"
        );
    }
}

impl GraphEvent {
    #[must_use]
    pub fn create() -> Arc<Self> {
        Arc::new(Self {
            subsequents: ClosableList::new(),
            wait_for: Mutex::new(Vec::new()),
        })
    }

    /// Register `task` as a dependent of this event. Fails with [`Closed`] if this event has
    /// already begun dispatching; the caller must then queue `task` directly instead.
    pub fn add_subsequent(&self, task: Arc<Task>) -> Result<(), Closed> {
        self.subsequents
            .push_if_not_closed(task)
            .map_err(|_task| Closed)
    }

    /// Append `other` to this event's wait-for list. Legal **only** while the owning task is
    /// executing (i.e. from inside the task's body, before it returns).
    pub fn dont_complete_until(&self, other: Arc<GraphEvent>) {
        self.wait_for
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(other);
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.subsequents.is_closed()
    }

    /// Dispatch every registered subsequent, or — if `dont_complete_until` registered events to
    /// wait for first — defer dispatch behind a gather task over those events instead.
    pub fn dispatch_subsequents(event: &Arc<GraphEvent>, current_thread: ThreadId) {
        let waits = {
            let mut guard = event
                .wait_for
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };

        if !waits.is_empty() {
            tracing::trace!(count = waits.len(), "deferring dispatch behind gather task");
            let num_prereqs = waits.len();
            // `event` is deliberately *not* passed as the gather task's own tracked completion
            // event: `Task::execute` would then call `dispatch_subsequents` on it a second time
            // once the closure below returns, double-closing an already-closed subsequents list.
            // The explicit call inside the closure is the only dispatch this gather task may
            // cause.
            let reentrant_event = Arc::clone(event);
            let gather = Task::new(
                move |thread, _event| {
                    GraphEvent::dispatch_subsequents(&reentrant_event, thread);
                },
                None,
                num_prereqs,
            );
            Task::set_destination(
                &gather,
                crate::scheduler::Destination::any_worker(
                    crate::scheduler::ThreadBand::Normal,
                    crate::scheduler::TaskPriority::Normal,
                ),
            );
            for other in waits {
                if other.add_subsequent(Arc::clone(&gather)).is_err() {
                    Task::conditional_queue_task(&gather);
                }
            }
            Task::prerequisites_complete(&gather, 0, true);
            return;
        }

        let popped = event.subsequents.pop_all_and_close();
        tracing::trace!(count = popped.len(), "dispatching subsequents");
        for task in popped.into_iter().rev() {
            Task::conditional_queue_task(&task);
        }
        let _ = current_thread;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{Destination, TaskPriority, ThreadBand};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn zero_subsequents_dispatch_is_close_only_no_op() {
        let event = GraphEvent::create();
        assert!(!event.is_complete());
        GraphEvent::dispatch_subsequents(&event, ThreadId::Named(0));
        assert!(event.is_complete());
    }

    #[test]
    fn add_subsequent_after_close_reports_closed() {
        let event = GraphEvent::create();
        GraphEvent::dispatch_subsequents(&event, ThreadId::Named(0));

        let executed = Arc::new(AtomicUsize::new(0));
        let executed2 = Arc::clone(&executed);
        let task = Task::new(
            move |_t, _e| {
                executed2.fetch_add(1, Ordering::SeqCst);
            },
            None,
            0,
        );
        Task::set_destination(
            &task,
            Destination::any_worker(ThreadBand::Normal, TaskPriority::Normal),
        );

        assert_eq!(event.add_subsequent(Arc::clone(&task)), Err(Closed));
    }
}
