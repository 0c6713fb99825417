// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! One priority band's worker pool: a [`StallingQueue`] shared by every worker in the band, plus
//! the OS threads that consume it.
//!
//! A worker never steals from another band, and never steals from another worker's inbox within
//! the same band — sharing within a band happens naturally because the stalling FIFO is already
//! multi-consumer.

use crate::containers::StallingQueue;
use crate::scheduler::park::Event;
use crate::scheduler::{TaskPriority, ThreadBand, ThreadId};
use crate::task::Task;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

pub struct WorkerPool {
    band: ThreadBand,
    queue: Arc<StallingQueue<Arc<Task>>>,
    events: Vec<Arc<Event>>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawn `count` workers for `band`. Each gets a kernel thread whose OS priority hint would
    /// follow the band (below-normal / slightly-below-normal / lowest) on a platform where the
    /// standard library exposed one; `std::thread` does not, so only the thread name encodes the
    /// band for diagnostics.
    pub fn spawn(band: ThreadBand, count: u32) -> Self {
        let queue: Arc<StallingQueue<Arc<Task>>> = Arc::new(StallingQueue::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let events: Vec<Arc<Event>> = (0..count).map(|_| Arc::new(Event::new())).collect();

        let handles = (0..count)
            .map(|slot| {
                let queue = Arc::clone(&queue);
                let event = Arc::clone(&events[slot as usize]);
                let shutdown = Arc::clone(&shutdown);
                std::thread::Builder::new()
                    .name(format!("task-graph-worker-{band:?}-{slot}"))
                    .spawn(move || run_loop(band, slot, &queue, &event, &shutdown))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        tracing::info!(?band, count, "worker pool started");
        Self { band, queue, events, handles: std::sync::Mutex::new(handles), shutdown }
    }

    #[must_use]
    pub fn band(&self) -> ThreadBand {
        self.band
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.events.len()
    }

    /// Push `task` onto this band's stalling FIFO at `priority`, waking a stalled worker if one
    /// picked up the wake selection.
    pub fn push(&self, task: Arc<Task>, priority: TaskPriority) {
        if let Some(worker) = self.queue.push(task, priority.stalling_queue_index()) {
            if let Some(event) = self.events.get(worker as usize) {
                event.trigger();
            }
        }
    }

    /// Post a shutdown request and wake every worker so it observes the flag and exits; then
    /// join all worker threads. Safe to call on a shared reference: the handles live behind a
    /// mutex that is only ever contended at shutdown.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for event in &self.events {
            event.trigger();
        }
        let mut handles = self.handles.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
        tracing::info!(band = ?self.band, "worker pool stopped");
    }

    /// Run `callback` once per worker slot, tagged with that worker's [`ThreadId`]. Runs
    /// synchronously on the calling thread rather than hopping onto each worker's own OS thread —
    /// the stalling FIFO has no way to address a specific worker, only a band, so a callback that
    /// depends on actually executing with that worker's thread-local state would not see it.
    /// Adequate for the teardown-style bookkeeping this is used for.
    pub fn broadcast(&self, callback: &(dyn Fn(ThreadId) + Sync)) {
        for slot in 0..self.worker_count() as u32 {
            callback(ThreadId::Worker { band: self.band, slot });
        }
    }
}

fn run_loop(
    band: ThreadBand,
    slot: u32,
    queue: &StallingQueue<Arc<Task>>,
    event: &Event,
    shutdown: &AtomicBool,
) {
    let thread = ThreadId::Worker { band, slot };
    crate::scheduler::set_current_thread(thread);
    let _span = tracing::info_span!("worker.run", ?band, slot).entered();
    loop {
        if let Some(task) = queue.pop(slot, false) {
            let _task_span = tracing::trace_span!("worker.task").entered();
            Task::execute(task, thread);
            continue;
        }

        if shutdown.load(Ordering::SeqCst) {
            return;
        }

        event.reset();
        match queue.pop(slot, true) {
            Some(task) => {
                let _task_span = tracing::trace_span!("worker.task").entered();
                Task::execute(task, thread);
            }
            None => {
                event.wait();
                if shutdown.load(Ordering::SeqCst) {
                    return;
                }
            }
        }
    }
}
