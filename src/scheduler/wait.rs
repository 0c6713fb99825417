// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Producer-facing wait APIs: block the calling thread (or, for a named thread, keep it
//! processing its own queue) until a set of graph events has dispatched.
//!
//! Both entry points build a single gather task with the waited-on events as prerequisites
//! rather than polling; the gather task's body is the only place either API's "wake" action
//! happens.

use crate::error::TimedOut;
use crate::event::GraphEvent;
use crate::scheduler::park::Event;
use crate::scheduler::{current, current_thread, Destination, TaskPriority, ThreadBand, ThreadId};
use crate::task::Task;
use std::sync::Arc;
use std::time::Duration;

/// Returns `true` if every event in `events` is already closed, per the configured
/// short-circuit threshold: scanning is only worth doing above
/// [`crate::scheduler::Scheduler::wait_short_circuit_threshold`] events, since below it the scan
/// itself costs about as much as just building the gather task.
fn already_complete(events: &[Arc<GraphEvent>]) -> bool {
    if events.len() <= current().wait_short_circuit_threshold() {
        return false;
    }
    events.iter().all(|event| event.is_complete())
}

/// Register `task` against every event in `events`, queuing it directly for any event that has
/// already closed by the time `add_subsequent` is attempted. Returns the number of prerequisites
/// that were satisfied this way, so the caller can fold them into the initial
/// `prerequisites_complete` call instead of a separate `conditional_queue_task` round-trip.
fn attach_to_all(task: &Arc<Task>, events: &[Arc<GraphEvent>]) -> usize {
    let mut already_done = 0;
    for event in events {
        if event.add_subsequent(Arc::clone(task)).is_err() {
            already_done += 1;
        }
    }
    already_done
}

/// Trigger `os_event` once every event in `events` has dispatched its subsequents. The triggering
/// task runs on a high-priority worker, per the reference design's choice to keep wait-wakeup
/// latency off the normal band.
pub fn trigger_event_when_tasks_complete(
    os_event: &Arc<Event>,
    events: &[Arc<GraphEvent>],
    current_thread_if_known: Option<ThreadId>,
) {
    let _ = current_thread_if_known;
    if already_complete(events) {
        os_event.trigger();
        return;
    }

    let os_event = Arc::clone(os_event);
    let task = Task::new(move |_thread, _event| os_event.trigger(), None, events.len());
    Task::set_destination(
        &task,
        Destination::any_worker(ThreadBand::High, TaskPriority::Normal),
    );
    let already_done = attach_to_all(&task, events);
    Task::prerequisites_complete(&task, already_done, true);
}

/// Block the calling thread until every event in `events` has dispatched.
///
/// If the caller is a named thread that has `attach_to_thread`ed (per `current_thread_if_known`,
/// or the thread-local identity if `None`), this enqueues a return-task bound to that thread and
/// drives its own processing loop until the return-task fires — so the thread keeps servicing
/// its own queue while it waits rather than blocking blind. Any other caller blocks on a pooled
/// OS event instead.
pub fn wait_until_tasks_complete(events: &[Arc<GraphEvent>], current_thread_if_known: Option<ThreadId>) {
    if already_complete(events) {
        return;
    }

    let thread = current_thread_if_known.or_else(current_thread);
    if let Some(ThreadId::Named(index)) = thread {
        wait_on_named_thread(index, events);
        return;
    }

    let event = current().event_pool().acquire();
    trigger_event_when_tasks_complete(&event, events, thread);
    event.wait();
    current().event_pool().release(event);
}

/// As [`wait_until_tasks_complete`], but returns [`TimedOut`] instead of blocking forever if
/// `timeout` elapses first. The underlying tasks are unaffected and continue running.
pub fn wait_until_tasks_complete_timeout(
    events: &[Arc<GraphEvent>],
    current_thread_if_known: Option<ThreadId>,
    timeout: Duration,
) -> Result<(), TimedOut> {
    if already_complete(events) {
        return Ok(());
    }

    // Named threads cannot time out mid-`process_tasks_until_request_return` without a second
    // cooperating task, which the reference design does not call for; only the OS-event path
    // supports an expiring wait.
    let event = current().event_pool().acquire();
    trigger_event_when_tasks_complete(&event, events, current_thread_if_known.or_else(current_thread));
    let completed = event.wait_timeout(timeout);
    current().event_pool().release(event);
    if completed {
        Ok(())
    } else {
        tracing::warn!(count = events.len(), "wait_until_tasks_complete timed out");
        Err(TimedOut)
    }
}

fn wait_on_named_thread(index: u16, events: &[Arc<GraphEvent>]) {
    let named = current().named_thread(index);
    let task = Task::new(move |_thread, _event| current().request_return(index), None, events.len());
    Task::set_destination(&task, crate::scheduler::Destination::named(index, crate::scheduler::NamedQueue::Main, TaskPriority::High));
    let already_done = attach_to_all(&task, events);
    Task::prerequisites_complete(&task, already_done, true);
    named.process_tasks_until_request_return();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_on_empty_set_returns_immediately() {
        let _scheduler = crate::test_support::scheduler();
        wait_until_tasks_complete(&[], None);
    }

    #[test]
    fn wait_unblocks_once_event_dispatches() {
        let scheduler = crate::test_support::scheduler();
        let event = GraphEvent::create();
        let body_event = Arc::clone(&event);
        let task = Task::new(move |_t, _e| { let _ = &body_event; }, Some(Arc::clone(&event)), 0);
        Task::set_destination(
            &task,
            Destination::any_worker(ThreadBand::Normal, TaskPriority::Normal),
        );
        Task::prerequisites_complete(&task, 0, true);

        wait_until_tasks_complete(&[Arc::clone(&event)], None);
        assert!(event.is_complete());
        let _ = scheduler;
    }
}
