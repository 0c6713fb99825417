// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Component (F): the parallel-for driver, built on the task graph.
//!
//! A range of `count` indices is split into blocks; one helper task fans out into up to
//! `W - 1` more helpers (a tail-recursive halving spawn, so the fan-out tree is `O(log W)`
//! deep rather than a single producer spawning `W` tasks serially), and the master thread joins
//! the work directly. Whichever participant finishes the last block signals completion; if that
//! participant is the master, it never touches the wake event at all.

use crate::scheduler::park::Event;
use crate::scheduler::{current, Destination, TaskPriority, ThreadBand, ThreadId};
use crate::task::Task;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

struct SharedState<F> {
    body: F,
    count: usize,
    block_size: usize,
    num_blocks: usize,
    reserve_last_for_master: bool,
    ticket: AtomicUsize,
    completed: AtomicUsize,
    triggered: AtomicBool,
    event: Event,
}

impl<F: Fn(Range<usize>) + Sync> SharedState<F> {
    /// Claim and run blocks until none remain (or, for a non-master caller when a block is
    /// reserved for the master, until only that block remains). Returns `true` if this call
    /// completed the last outstanding block and is therefore responsible for signalling.
    fn work_loop(&self, is_master: bool) -> bool {
        loop {
            let t = self.ticket.fetch_add(1, Ordering::Relaxed);
            if self.reserve_last_for_master && !is_master && t >= self.num_blocks - 1 {
                return false;
            }
            if t >= self.num_blocks {
                return false;
            }
            let start = t * self.block_size;
            let this_block_size = if t == self.num_blocks - 1 {
                self.count - start
            } else {
                self.block_size
            };
            (self.body)(start..start + this_block_size);
            if self.completed.fetch_add(1, Ordering::AcqRel) + 1 == self.num_blocks {
                return true;
            }
        }
    }

    fn signal_once(&self) {
        if !self.triggered.swap(true, Ordering::AcqRel) {
            self.event.trigger();
        }
    }
}

/// Pick the largest block size, among the `{1/3, 1/2, 1/1}`-of-`worker_count` candidates, for
/// which the resulting number of blocks still meets `required_blocks`. Tried coarsest first so
/// the common case (few workers needed) doesn't scan every candidate.
fn choose_block_size(count: usize, worker_count: usize, required_blocks: usize) -> usize {
    let mut candidate = count;
    for divisor in [3usize, 2, 1] {
        let target_workers = (worker_count / divisor).max(1);
        let block_size = count.div_ceil(target_workers).max(1);
        let num_blocks = count.div_ceil(block_size);
        candidate = block_size;
        if num_blocks >= required_blocks {
            break;
        }
    }
    candidate
}

fn spawn_helper<F>(state: Arc<SharedState<F>>, remaining: usize)
where
    F: Fn(Range<usize>) + Sync + Send + 'static,
{
    let task = Task::new(
        move |thread, _event| run_helper(&state, remaining, thread),
        None,
        0,
    );
    Task::set_destination(
        &task,
        Destination::any_worker(ThreadBand::Normal, TaskPriority::Normal),
    );
    Task::prerequisites_complete(&task, 0, true);
}

fn run_helper<F>(state: &Arc<SharedState<F>>, remaining: usize, _thread: ThreadId)
where
    F: Fn(Range<usize>) + Sync + Send + 'static,
{
    if remaining > 0 {
        let half = remaining / 2;
        spawn_helper(Arc::clone(state), half);
        spawn_helper(Arc::clone(state), remaining - 1 - half);
    }
    if state.work_loop(false) {
        state.signal_once();
    }
}

fn run(count: usize, body: impl Fn(Range<usize>) + Sync, force_single_threaded: bool) {
    if count == 0 {
        return;
    }
    let scheduler = current();
    if count == 1 || force_single_threaded || !scheduler.multithreading_enabled() {
        body(0..count);
        return;
    }

    let worker_count = scheduler.get_num_worker_threads();
    let w = worker_count.min(count - 1);
    if w == 0 {
        body(0..count);
        return;
    }

    let reserve_last_for_master = count > w + 1;
    let required_blocks = w + usize::from(reserve_last_for_master);
    let block_size = choose_block_size(count, worker_count, required_blocks);
    let num_blocks = count.div_ceil(block_size);

    run_partitioned(count, body, block_size, num_blocks, reserve_last_for_master, w);
}

fn run_partitioned<F>(
    count: usize,
    body: F,
    block_size: usize,
    num_blocks: usize,
    reserve_last_for_master: bool,
    w: usize,
) where
    F: Fn(Range<usize>) + Sync + Send + 'static,
{
    let state = Arc::new(SharedState {
        body,
        count,
        block_size,
        num_blocks,
        reserve_last_for_master,
        ticket: AtomicUsize::new(0),
        completed: AtomicUsize::new(0),
        triggered: AtomicBool::new(false),
        event: Event::new(),
    });

    if w > 1 {
        spawn_helper(Arc::clone(&state), w - 1);
    }

    let master_done = state.work_loop(true);
    if master_done {
        state.signal_once();
    } else {
        state.event.wait();
    }
    tracing::debug!(count, num_blocks, w, "parallel_for complete");
}

/// Run `body(range)` over `[0, count)`, split into blocks distributed across the master thread
/// and up to `get_num_worker_threads()` helpers. Falls back to running `body(0..count)` on the
/// caller when `count <= 1`, `force_single_threaded` is set, or multithreading is disabled.
pub fn parallel_for<F>(count: usize, body: F, force_single_threaded: bool)
where
    F: Fn(Range<usize>) + Sync + Send + 'static,
{
    run(count, body, force_single_threaded);
}

/// As [`parallel_for`], but runs `prework` on the master before entering the work loop. Never
/// reserves a block for the master (the prework already guarantees the master participates).
pub fn parallel_for_with_prework<F, P>(count: usize, body: F, prework: P, force_single_threaded: bool)
where
    F: Fn(Range<usize>) + Sync + Send + 'static,
    P: FnOnce(),
{
    if count == 0 {
        return;
    }
    let scheduler = current();
    if count == 1 || force_single_threaded || !scheduler.multithreading_enabled() {
        prework();
        body(0..count);
        return;
    }

    let worker_count = scheduler.get_num_worker_threads();
    let w = worker_count.min(count - 1);
    if w == 0 {
        prework();
        body(0..count);
        return;
    }

    prework();
    let required_blocks = w;
    let block_size = choose_block_size(count, worker_count, required_blocks);
    let num_blocks = count.div_ceil(block_size);
    run_partitioned(count, body, block_size, num_blocks, false, w);
}
