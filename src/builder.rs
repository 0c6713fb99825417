// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Generic task construction: a strongly-typed alternative to calling [`Task::new`] directly,
//! modeled on the reference engine's templated graph-task factory. A caller implements
//! [`GraphTask`] once for a unit-of-work type and gets prerequisite wiring, optional subsequent
//! tracking, and either immediate or held dispatch for free.

use crate::event::GraphEvent;
use crate::scheduler::{Destination, ThreadId};
use crate::task::Task;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether a task's completion should be observable through a [`GraphEvent`]. Fire-and-forget
/// tasks skip allocating one entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubsequentsMode {
    TrackSubsequents,
    FireAndForget,
}

/// A unit of work constructible through [`TaskBuilder`]. `do_task` consumes `self`, matching the
/// payload contract in [`crate::task`]: a task body runs at most once.
pub trait GraphTask: Send + 'static {
    fn desired_thread(&self) -> Destination;

    fn subsequents_mode(&self) -> SubsequentsMode;

    fn do_task(self, current_thread: ThreadId, completion_event: Option<&GraphEvent>);
}

/// Registers `task` against every prerequisite, treating one that has already closed as
/// immediately satisfied instead of failing construction.
fn attach_prerequisites(task: &Arc<Task>, prerequisites: &[Arc<GraphEvent>]) -> usize {
    let mut already_done = 0;
    for prereq in prerequisites {
        if prereq.add_subsequent(Arc::clone(task)).is_err() {
            already_done += 1;
        }
    }
    already_done
}

/// Factory for constructing a single task from a [`GraphTask`] body plus a prerequisite list.
/// Consumed by exactly one of [`TaskBuilder::construct_and_dispatch_when_ready`] or
/// [`TaskBuilder::construct_and_hold`].
pub struct TaskBuilder<T: GraphTask> {
    body: T,
    prerequisites: Vec<Arc<GraphEvent>>,
    current_thread_hint: Option<ThreadId>,
}

impl<T: GraphTask> TaskBuilder<T> {
    #[must_use]
    pub fn new(body: T) -> Self {
        Self { body, prerequisites: Vec::new(), current_thread_hint: None }
    }

    #[must_use]
    pub fn with_prerequisites(mut self, prerequisites: Vec<Arc<GraphEvent>>) -> Self {
        self.prerequisites = prerequisites;
        self
    }

    /// Record the calling thread's identity, if already known, so construction does not need to
    /// consult thread-local storage itself. Purely an optimization hint; omitting it is always
    /// correct.
    #[must_use]
    pub fn with_current_thread_hint(mut self, hint: ThreadId) -> Self {
        self.current_thread_hint = Some(hint);
        self
    }

    fn build(self) -> (Arc<Task>, usize) {
        let Self { body, prerequisites, current_thread_hint } = self;
        let destination = body.desired_thread();
        let event = match body.subsequents_mode() {
            SubsequentsMode::TrackSubsequents => Some(GraphEvent::create()),
            SubsequentsMode::FireAndForget => None,
        };
        let _ = current_thread_hint;

        let task = Task::new(
            move |thread, completion_event| body.do_task(thread, completion_event),
            event,
            prerequisites.len(),
        );
        Task::set_destination(&task, destination);
        let already_done = attach_prerequisites(&task, &prerequisites);
        (task, already_done)
    }

    /// Construct the task and insert it into the graph immediately: once every prerequisite
    /// (already-satisfied ones included) is accounted for, the task becomes queueable right away.
    /// Returns the task's completion event, if it tracks subsequents.
    pub fn construct_and_dispatch_when_ready(self) -> Option<Arc<GraphEvent>> {
        let (task, already_done) = self.build();
        let event = task.event().cloned();
        Task::prerequisites_complete(&task, already_done, true);
        event
    }

    /// Construct the task without releasing the constructing thread's setup lock. The task will
    /// not become queueable until the returned [`TaskHandle`] is [`TaskHandle::unlock`]ed, even
    /// if every prerequisite dispatches in the meantime.
    #[must_use]
    pub fn construct_and_hold(self) -> TaskHandle {
        let (task, already_done) = self.build();
        TaskHandle { task, already_done, unlocked: AtomicBool::new(false) }
    }
}

/// A task constructed via [`TaskBuilder::construct_and_hold`], not yet eligible for dispatch.
pub struct TaskHandle {
    task: Arc<Task>,
    already_done: usize,
    unlocked: AtomicBool,
}

impl TaskHandle {
    #[must_use]
    pub fn event(&self) -> Option<&Arc<GraphEvent>> {
        self.task.event()
    }

    /// Release the constructing thread's setup lock, permitting dispatch once every prerequisite
    /// has resolved.
    ///
    /// # Panics
    ///
    /// Panics (via debug assertion) if called more than once for the same handle.
    pub fn unlock(self) {
        let was_unlocked = self.unlocked.swap(true, Ordering::AcqRel);
        debug_assert!(!was_unlocked, "TaskHandle::unlock called twice");
        Task::prerequisites_complete(&self.task, self.already_done, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{TaskPriority, ThreadBand};
    use std::sync::atomic::{AtomicUsize, Ordering as StdOrdering};

    struct Increment(Arc<AtomicUsize>);

    impl GraphTask for Increment {
        fn desired_thread(&self) -> Destination {
            Destination::any_worker(ThreadBand::Normal, TaskPriority::Normal)
        }

        fn subsequents_mode(&self) -> SubsequentsMode {
            SubsequentsMode::TrackSubsequents
        }

        fn do_task(self, _current_thread: ThreadId, _completion_event: Option<&GraphEvent>) {
            self.0.fetch_add(1, StdOrdering::SeqCst);
        }
    }

    #[test]
    fn construct_and_hold_defers_dispatch_until_unlock() {
        let _scheduler = crate::test_support::scheduler();
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = TaskBuilder::new(Increment(Arc::clone(&counter))).construct_and_hold();
        let event = handle.event().cloned().expect("tracked subsequents");

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(counter.load(StdOrdering::SeqCst), 0);

        handle.unlock();
        crate::scheduler::wait::wait_until_tasks_complete(&[event], None);
        assert_eq!(counter.load(StdOrdering::SeqCst), 1);
    }

    #[test]
    fn fire_and_forget_has_no_event() {
        struct Silent;
        impl GraphTask for Silent {
            fn desired_thread(&self) -> Destination {
                Destination::any_worker(ThreadBand::Normal, TaskPriority::Normal)
            }
            fn subsequents_mode(&self) -> SubsequentsMode {
                SubsequentsMode::FireAndForget
            }
            fn do_task(self, _thread: ThreadId, _event: Option<&GraphEvent>) {}
        }
        let _scheduler = crate::test_support::scheduler();
        let event = TaskBuilder::new(Silent).construct_and_dispatch_when_ready();
        assert!(event.is_none());
    }
}
