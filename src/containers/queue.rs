// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A Michael–Scott FIFO queue over link indices, used for each priority band's stalling queue
//! (see [`crate::containers::stalling`]) and for named-thread sub-queues.

use crate::containers::Linked;
use crate::link::LinkPool;
use crate::loom::sync::atomic::Ordering;
use crate::tagged_ptr::{AtomicTaggedPtr, TaggedPtr};
use crate::util::Backoff;
use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::ptr::NonNull;

const INCREMENT: u64 = 1;

/// A multi-producer, multi-consumer FIFO queue. Construction allocates one sentinel link that
/// never carries a payload; the node immediately after the sentinel (if any) holds the oldest
/// queued element.
pub struct Queue<T: Linked> {
    pool: LinkPool,
    head: AtomicTaggedPtr,
    tail: AtomicTaggedPtr,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Linked> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("head", &self.head.load(Ordering::Relaxed))
            .field("tail", &self.tail.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T: Linked> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Linked> Queue<T> {
    #[must_use]
    pub fn new() -> Self {
        let pool = LinkPool::new();
        let sentinel = pool.acquire();
        pool.get(sentinel).double_next.store(TaggedPtr::NULL, Ordering::Relaxed);
        let start = TaggedPtr::new(sentinel, 0);
        Self {
            pool,
            head: AtomicTaggedPtr::new(start),
            tail: AtomicTaggedPtr::new(start),
            _marker: PhantomData,
        }
    }

    pub fn push(&self, handle: T::Handle) {
        let payload = T::into_raw(handle);
        let idx = self.pool.acquire();
        let link = self.pool.get(idx);
        link.payload.store(payload.as_ptr(), Ordering::Release);
        link.double_next.store(TaggedPtr::NULL, Ordering::Release);

        let mut backoff = Backoff::new();
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let tail_link = self.pool.get(tail.index());
            let next = tail_link.double_next.load(Ordering::Acquire);

            if next.is_null() {
                let new_next = next.advance_counter_and_state(idx, INCREMENT);
                match tail_link.double_next.compare_exchange_weak(
                    next,
                    new_next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        // best-effort tail swing; if this fails, the next pusher or popper
                        // helps it along before doing its own work.
                        let new_tail = tail.advance_counter_and_state(idx, INCREMENT);
                        let _ = self.tail.compare_exchange_weak(
                            tail,
                            new_tail,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                        return;
                    }
                    Err(_) => backoff.spin(),
                }
            } else {
                // tail is lagging behind the real end of the list; help it catch up.
                let new_tail = tail.advance_counter_and_state(next.index(), INCREMENT);
                let _ =
                    self.tail
                        .compare_exchange_weak(tail, new_tail, Ordering::AcqRel, Ordering::Acquire);
                backoff.spin();
            }
        }
    }

    pub fn pop(&self) -> Option<T::Handle> {
        let mut backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            let head_link = self.pool.get(head.index());
            let next = head_link.double_next.load(Ordering::Acquire);

            if head.index() == tail.index() {
                if next.is_null() {
                    return None;
                }
                // tail is lagging; help it along and retry.
                let new_tail = tail.advance_counter_and_state(next.index(), INCREMENT);
                let _ =
                    self.tail
                        .compare_exchange_weak(tail, new_tail, Ordering::AcqRel, Ordering::Acquire);
                backoff.spin();
                continue;
            }

            let new_head = head.advance_counter_and_state(next.index(), INCREMENT);
            match self
                .head
                .compare_exchange_weak(head, new_head, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let next_link = self.pool.get(next.index());
                    let payload = next_link.payload.swap(ptr::null_mut(), Ordering::Acquire);
                    self.pool.release(head.index());
                    let payload = NonNull::new(payload).expect("link payload set by push");
                    // Safety: payload was produced by `T::into_raw` in `push` and has not been
                    // handed back via `from_raw` yet.
                    return Some(unsafe { T::from_raw(payload) });
                }
                Err(_) => backoff.spin(),
            }
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.index() == tail.index()
            && self
                .pool
                .get(head.index())
                .double_next
                .load(Ordering::Acquire)
                .is_null()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering as StdOrdering};

    #[test]
    fn push_pop_is_fifo() {
        let queue: Queue<Box<u32>> = Queue::new();
        assert!(queue.is_empty());
        queue.push(Box::new(1));
        queue.push(Box::new(2));
        queue.push(Box::new(3));
        assert!(!queue.is_empty());
        assert_eq!(*queue.pop().unwrap(), 1);
        assert_eq!(*queue.pop().unwrap(), 2);
        assert_eq!(*queue.pop().unwrap(), 3);
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn concurrent_producers_preserve_total_count() {
        let queue: Arc<Queue<Box<u32>>> = Arc::new(Queue::new());
        let produced = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|scope| {
            for t in 0..4u32 {
                let queue = Arc::clone(&queue);
                let produced = Arc::clone(&produced);
                scope.spawn(move || {
                    for i in 0..1000u32 {
                        queue.push(Box::new(t * 1000 + i));
                        produced.fetch_add(1, StdOrdering::Relaxed);
                    }
                });
            }
        });

        let mut popped = 0;
        while queue.pop().is_some() {
            popped += 1;
        }
        assert_eq!(popped, produced.load(StdOrdering::Relaxed));
    }
}
