// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Component (D): the task object.
//!
//! A task is created with an outstanding-prerequisite counter of `#prereqs + 1` — the extra one
//! is a setup lock the constructing thread releases once it has finished wiring prerequisites
//! (see [`Task::prerequisites_complete`]). Each prerequisite event independently calls
//! [`Task::conditional_queue_task`] when it dispatches; whichever caller's decrement takes the
//! counter to zero wins the race to route the task through the scheduler, exactly once.

use crate::event::GraphEvent;
use crate::scheduler::{Destination, ThreadBand, ThreadId, TaskPriority};
use std::alloc::{self, Layout};
use std::cell::UnsafeCell;
use std::fmt;
use std::mem::{self, MaybeUninit};
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Validated only in non-shipping (debug) builds: life stage must advance monotonically.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifeStage {
    BaseConstructed,
    Constructed,
    ThreadSet,
    PrereqsSetup,
    Queued,
    Executing,
    Destructed,
}

const INLINE_SIZE: usize = 3 * mem::size_of::<usize>();

type ExecuteFn = unsafe fn(*mut (), ThreadId, Option<&GraphEvent>);
type DropFn = unsafe fn(*mut ());
type DeallocFn = unsafe fn(*mut ());

enum Storage {
    Inline([MaybeUninit<u8>; INLINE_SIZE]),
    Heap(NonNull<u8>),
}

/// The task body, type-erased behind a function-pointer pair rather than a `dyn` trait object,
/// stored inline when it fits (the common case for small capturing closures) and falls back to a
/// single heap allocation otherwise. This keeps task construction allocation-free on the common
/// path, matching the payload strategy in the design notes.
struct Payload {
    storage: Storage,
    execute: ExecuteFn,
    drop_value: DropFn,
    dealloc: DeallocFn,
}

// Safety: `Payload` only ever stores an `F: Send`, and ownership of that `F` is never shared
// across threads without synchronization external to this type (see `Task`'s own safety notes).
unsafe impl Send for Payload {}

impl Payload {
    fn new<F>(body: F) -> Self
    where
        F: FnOnce(ThreadId, Option<&GraphEvent>) + Send + 'static,
    {
        unsafe fn execute_impl<F: FnOnce(ThreadId, Option<&GraphEvent>)>(
            ptr: *mut (),
            thread: ThreadId,
            event: Option<&GraphEvent>,
        ) {
            // Safety: `ptr` points at a live, initialized `F` that has not yet been read out.
            let value = unsafe { ptr.cast::<F>().read() };
            value(thread, event);
        }

        unsafe fn drop_value_impl<F>(ptr: *mut ()) {
            // Safety: caller guarantees `ptr` points at a live, initialized `F`.
            unsafe { ptr::drop_in_place(ptr.cast::<F>()) };
        }

        fn dealloc_noop(_ptr: *mut ()) {}

        unsafe fn dealloc_heap<F>(ptr: *mut ()) {
            let layout = Layout::new::<F>();
            if layout.size() != 0 {
                // Safety: `ptr` was allocated with this exact layout in `Payload::new` below.
                unsafe { alloc::dealloc(ptr.cast(), layout) };
            }
        }

        if mem::size_of::<F>() <= INLINE_SIZE && mem::align_of::<F>() <= mem::align_of::<usize>() {
            let mut storage = [const { MaybeUninit::uninit() }; INLINE_SIZE];
            // Safety: the size/align check above guarantees `F` fits in `storage`.
            unsafe { storage.as_mut_ptr().cast::<F>().write(body) };
            Self {
                storage: Storage::Inline(storage),
                execute: execute_impl::<F>,
                drop_value: drop_value_impl::<F>,
                dealloc: dealloc_noop,
            }
        } else {
            let layout = Layout::new::<F>();
            // Safety: layout is well-formed for a concrete sized type `F`.
            let raw = unsafe { alloc::alloc(layout) };
            assert!(!raw.is_null(), "allocation failure while boxing a task payload");
            // Safety: `raw` is a fresh allocation sized/aligned for `F`.
            unsafe { raw.cast::<F>().write(body) };
            Self {
                storage: Storage::Heap(NonNull::new(raw).expect("checked non-null above")),
                execute: execute_impl::<F>,
                drop_value: drop_value_impl::<F>,
                dealloc: dealloc_heap::<F>,
            }
        }
    }

    fn as_ptr(&mut self) -> *mut () {
        match &mut self.storage {
            Storage::Inline(buf) => buf.as_mut_ptr().cast(),
            Storage::Heap(ptr) => ptr.as_ptr().cast(),
        }
    }

    /// Invoke the payload exactly once, consuming it.
    fn execute(mut self, thread: ThreadId, event: Option<&GraphEvent>) {
        let ptr = self.as_ptr();
        // Safety: `ptr` refers to the live `F` this `Payload` was built from; `execute_impl`
        // reads it out by value and runs it, so the storage behind `ptr` is logically
        // uninitialized (but still a valid allocation) afterward.
        unsafe { (self.execute)(ptr, thread, event) };
        // Safety: deallocates the backing allocation only, matching `dealloc`'s layout; the
        // value itself was already consumed above, so no double-drop occurs.
        unsafe { (self.dealloc)(ptr) };
        mem::forget(self);
    }
}

impl Drop for Payload {
    fn drop(&mut self) {
        let ptr = self.as_ptr();
        // Safety: reached only when `execute` was never called, so the value is still live.
        unsafe { (self.drop_value)(ptr) };
        // Safety: see `dealloc`'s contract.
        unsafe { (self.dealloc)(ptr) };
    }
}

/// The atomic unit of work. See the module documentation for the prerequisite-counter protocol.
pub struct Task {
    // Safety: written once by `set_destination` before the task becomes reachable by any other
    // thread, and read only after the happens-before edge established by `outstanding_prereqs`
    // reaching zero (an `AcqRel` fetch_sub synchronizes with every earlier write to the task).
    destination: UnsafeCell<Destination>,
    outstanding_prereqs: AtomicUsize,
    life_stage: AtomicU8,
    // Safety: same happens-before argument as `destination`; additionally, `execute` is the only
    // reader and is documented (and enforced by the life-stage assertion) to run at most once.
    payload: UnsafeCell<Option<Payload>>,
    event: Option<Arc<GraphEvent>>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("outstanding_prereqs", &self.outstanding_prereqs.load(Ordering::Relaxed))
            .field("life_stage", &self.life_stage.load(Ordering::Relaxed))
            .field("has_event", &self.event.is_some())
            .finish_non_exhaustive()
    }
}

// Safety: `destination` and `payload` are only ever accessed per the happens-before argument
// documented on their fields, which is sufficient to rule out data races under this type's
// single-construct / single-execute usage protocol.
unsafe impl Sync for Task {}

impl Task {
    pub fn new<F>(body: F, event: Option<Arc<GraphEvent>>, num_prereqs: usize) -> Arc<Self>
    where
        F: FnOnce(ThreadId, Option<&GraphEvent>) + Send + 'static,
    {
        let task = Self {
            destination: UnsafeCell::new(Destination::any_worker(
                ThreadBand::Normal,
                TaskPriority::Normal,
            )),
            outstanding_prereqs: AtomicUsize::new(num_prereqs + 1),
            life_stage: AtomicU8::new(LifeStage::BaseConstructed as u8),
            payload: UnsafeCell::new(Some(Payload::new(body))),
            event,
        };
        task.advance_life_stage(LifeStage::Constructed);
        tracing::trace!(num_prereqs, "task constructed");
        Arc::new(task)
    }

    #[must_use]
    pub fn destination(&self) -> Destination {
        // Safety: see the field's documented happens-before contract.
        unsafe { *self.destination.get() }
    }

    #[must_use]
    pub fn event(&self) -> Option<&Arc<GraphEvent>> {
        self.event.as_ref()
    }

    pub fn set_destination(task: &Arc<Task>, destination: Destination) {
        // Safety: called by the constructing thread before `task` is shared with any
        // prerequisite event, per this method's caller contract.
        unsafe { *task.destination.get() = destination };
        task.advance_life_stage(LifeStage::ThreadSet);
        tracing::trace!(?destination, "task destination set");
    }

    /// Release the constructing thread's setup lock (and, if known in advance, `already_done_count`
    /// additional prerequisites that were satisfied before this call). If this drives the counter
    /// to zero, the task is routed through the scheduler immediately.
    pub fn prerequisites_complete(task: &Arc<Task>, already_done_count: usize, unlock: bool) {
        task.advance_life_stage(LifeStage::PrereqsSetup);
        let delta = already_done_count + usize::from(unlock);
        Self::release_prereqs(task, delta);
    }

    /// Called by a prerequisite event's dispatch when it completes; decrements the counter by
    /// one and, if it reaches zero, routes the task.
    pub(crate) fn conditional_queue_task(task: &Arc<Task>) {
        Self::release_prereqs(task, 1);
    }

    fn release_prereqs(task: &Arc<Task>, delta: usize) {
        if delta == 0 {
            return;
        }
        let prev = task.outstanding_prereqs.fetch_sub(delta, Ordering::AcqRel);
        debug_assert!(
            prev >= delta,
            "outstanding prerequisite counter underflowed: had {prev}, released {delta}"
        );
        if prev == delta {
            task.advance_life_stage(LifeStage::Queued);
            crate::scheduler::current().route(Arc::clone(task));
        }
    }

    /// Run the payload, then dispatch the completion event's subsequents (if any). Must be
    /// called exactly once, by whichever thread popped this task off a queue.
    pub fn execute(task: Arc<Task>, thread: ThreadId) {
        task.advance_life_stage(LifeStage::Executing);
        let _span = tracing::trace_span!("task.execute", ?thread).entered();
        // Safety: see the field's documented happens-before contract; `execute` running more
        // than once for the same task is a usage bug caught by the `expect` below.
        let payload = unsafe { (*task.payload.get()).take() }.expect("task executed more than once");
        let event = task.event.clone();
        payload.execute(thread, event.as_deref());
        if let Some(event) = event {
            GraphEvent::dispatch_subsequents(&event, thread);
        }
        task.advance_life_stage(LifeStage::Destructed);
    }

    fn advance_life_stage(&self, stage: LifeStage) {
        let prev = self.life_stage.swap(stage as u8, Ordering::AcqRel);
        debug_assert!(
            prev < stage as u8,
            "task life stage regressed: {prev} -> {stage:?}"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn inline_payload_runs_exactly_once() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        let payload = Payload::new(move |_thread: ThreadId, _event: Option<&GraphEvent>| {
            ran2.store(true, Ordering::SeqCst);
        });
        payload.execute(ThreadId::Worker { band: ThreadBand::Normal, slot: 0 }, None);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn heap_payload_runs_exactly_once() {
        // Force the heap path with an oversized capture.
        let big = [0u8; INLINE_SIZE * 4];
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        let payload = Payload::new(move |_thread: ThreadId, _event: Option<&GraphEvent>| {
            let _keep_alive = big.len();
            ran2.store(true, Ordering::SeqCst);
        });
        payload.execute(ThreadId::Worker { band: ThreadBand::Normal, slot: 0 }, None);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn dropping_an_unexecuted_payload_runs_its_destructor() {
        struct DropFlag(Arc<AtomicBool>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }
        let dropped = Arc::new(AtomicBool::new(false));
        let guard = DropFlag(Arc::clone(&dropped));
        let payload = Payload::new(move |_thread: ThreadId, _event: Option<&GraphEvent>| {
            let _moved_in = &guard;
        });
        drop(payload);
        assert!(dropped.load(Ordering::SeqCst));
    }
}
