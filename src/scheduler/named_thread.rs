// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A named thread's queues and processing loop. Named threads (the game thread, the render
//! thread, and whatever else the embedder defines) are not spawned by the scheduler — they
//! attach themselves by calling [`crate::scheduler::Scheduler::attach_to_thread`] and then drive
//! their own loop by calling [`NamedThread::process_tasks_until_idle`] or
//! [`NamedThread::process_tasks_until_request_return`].

use crate::containers::Queue;
use crate::containers::stalling::{HIGH_PRIORITY, NORMAL_PRIORITY};
use crate::scheduler::park::Event;
use crate::scheduler::{NamedQueue, TaskPriority, ThreadId};
use crate::task::Task;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Declares a named thread the embedder will attach to (e.g. "game", "render").
#[derive(Debug, Clone, Copy)]
pub struct NamedThreadDescriptor {
    pub name: &'static str,
}

pub struct NamedThread {
    pub index: u16,
    pub name: &'static str,
    main: [Queue<Arc<Task>>; 2],
    local: [Queue<Arc<Task>>; 2],
    stalled: AtomicBool,
    event: Event,
    quit: AtomicBool,
    return_requested: AtomicBool,
}

impl NamedThread {
    #[must_use]
    pub fn new(index: u16, name: &'static str) -> Self {
        Self {
            index,
            name,
            main: std::array::from_fn(|_| Queue::new()),
            local: std::array::from_fn(|_| Queue::new()),
            stalled: AtomicBool::new(false),
            event: Event::new(),
            quit: AtomicBool::new(false),
            return_requested: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn thread_id(&self) -> ThreadId {
        ThreadId::Named(self.index)
    }

    /// Push a task onto this thread's `queue` at `priority`. If another thread observes this
    /// thread stalled, the wake event is triggered.
    pub fn push(&self, task: Arc<Task>, queue: NamedQueue, priority: TaskPriority) {
        let idx = priority.stalling_queue_index();
        match queue {
            NamedQueue::Main => self.main[idx].push(task),
            NamedQueue::Local => self.local[idx].push(task),
        }
        if self.stalled.swap(false, Ordering::AcqRel) {
            self.event.trigger();
        }
    }

    fn pop_one(&self) -> Option<Arc<Task>> {
        debug_assert_eq!(HIGH_PRIORITY, 0);
        debug_assert_eq!(NORMAL_PRIORITY, 1);
        self.main[HIGH_PRIORITY]
            .pop()
            .or_else(|| self.local[HIGH_PRIORITY].pop())
            .or_else(|| self.main[NORMAL_PRIORITY].pop())
            .or_else(|| self.local[NORMAL_PRIORITY].pop())
    }

    /// Drain the queue without ever blocking, used for pumping a named thread's work inside a
    /// wait on another thread.
    pub fn process_tasks_until_idle(&self) {
        let thread = self.thread_id();
        while let Some(task) = self.pop_one() {
            Task::execute(task, thread);
        }
    }

    /// Process tasks, blocking on the empty queue, until [`NamedThread::request_return`] is
    /// called (by anyone, including a task running on this very thread).
    pub fn process_tasks_until_request_return(&self) {
        let thread = self.thread_id();
        self.return_requested.store(false, Ordering::SeqCst);
        let _span = tracing::info_span!("named_thread.run", name = self.name).entered();
        loop {
            if let Some(task) = self.pop_one() {
                let _task_span = tracing::trace_span!("named_thread.task").entered();
                Task::execute(task, thread);
                continue;
            }
            if self.quit.load(Ordering::SeqCst) || self.return_requested.load(Ordering::SeqCst) {
                return;
            }
            self.event.reset();
            self.stalled.store(true, Ordering::SeqCst);
            if let Some(task) = self.pop_one() {
                self.stalled.store(false, Ordering::SeqCst);
                Task::execute(task, thread);
                continue;
            }
            self.event.wait();
            self.stalled.store(false, Ordering::SeqCst);
        }
    }

    pub fn request_return(&self) {
        self.return_requested.store(true, Ordering::SeqCst);
        if self.stalled.swap(false, Ordering::AcqRel) {
            self.event.trigger();
        }
    }

    #[must_use]
    pub fn is_processing(&self) -> bool {
        !self.stalled.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_quit_requested(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    /// Permanently mark this thread for shutdown and wake it if blocked; used by
    /// [`crate::scheduler::Scheduler::shutdown`].
    pub(crate) fn post_quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
        self.request_return();
    }
}
