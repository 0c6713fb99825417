// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A lock-free LIFO stack (Treiber stack) over link indices, generic over a small state
//! bitfield packed into the tagged pointer's counter. With `STATE_MASK = 0` this is a plain
//! stack; [`crate::containers::ClosableList`] instantiates it with a one-bit mask to get a
//! closable single-consumer list for free.

use crate::containers::Linked;
use crate::link::LinkPool;
use crate::loom::sync::atomic::Ordering;
use crate::tagged_ptr::{AtomicTaggedPtr, TaggedPtr};
use crate::util::Backoff;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

/// A lock-free LIFO stack whose head swings a [`TaggedPtr`] carrying a `STATE_MASK`-wide state
/// bitfield alongside the usual ABA counter. The increment used for ordinary push/pop is
/// `STATE_MASK + 1`, which by construction never touches the low `STATE_MASK` bits — only
/// [`Stack::pop_all_and_change_state`] may change them.
pub struct Stack<T: Linked, const STATE_MASK: u64 = 0> {
    pool: LinkPool,
    head: AtomicTaggedPtr,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Linked, const STATE_MASK: u64> fmt::Debug for Stack<T, STATE_MASK> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("head", &self.head.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T: Linked, const STATE_MASK: u64> Default for Stack<T, STATE_MASK> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Linked, const STATE_MASK: u64> Stack<T, STATE_MASK> {
    const INCREMENT: u64 = STATE_MASK + 1;
    const STATE_BITS: u32 = STATE_MASK.count_ones();

    #[must_use]
    pub fn new() -> Self {
        debug_assert!(
            (STATE_MASK + 1).is_power_of_two(),
            "STATE_MASK must be a contiguous low-bit mask (2^k - 1)"
        );
        Self {
            pool: LinkPool::new(),
            head: AtomicTaggedPtr::new(TaggedPtr::new(0, 0)),
            _marker: PhantomData,
        }
    }

    /// Construct with an explicit initial state (used by `ClosableList::new` — the list starts
    /// open, which for a one-bit mask is state `0`, so this is mostly useful for tests).
    #[must_use]
    pub fn with_initial_state(state: u64) -> Self {
        debug_assert!(state <= STATE_MASK);
        let stack = Self::new();
        stack.head.store(TaggedPtr::new(0, state), Ordering::Relaxed);
        stack
    }

    /// Unconditionally push `handle` onto the stack.
    pub fn push(&self, handle: T::Handle) {
        self.push_if(handle, |_state| true)
            .unwrap_or_else(|_| unreachable!("predicate always returns true"));
    }

    /// Push `handle` only if `pred(state)` returns `true` when evaluated against the stack's
    /// current state bits, checked atomically against the swing of the head pointer. Returns
    /// the handle back to the caller if the predicate rejected the push.
    pub fn push_if(
        &self,
        handle: T::Handle,
        pred: impl Fn(u64) -> bool,
    ) -> Result<(), T::Handle> {
        let payload = T::into_raw(handle);
        let idx = self.pool.acquire();
        let link = self.pool.get(idx);
        link.payload.store(payload.as_ptr(), Ordering::Release);

        let mut backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            if !pred(head.state::<STATE_MASK>()) {
                self.pool.release(idx);
                // Safety: this payload pointer was produced by `T::into_raw` above and never
                // published (the CAS that would publish it hasn't happened), so we still
                // exclusively own it.
                return Err(unsafe { T::from_raw(payload) });
            }
            link.single_next.store(head.index(), Ordering::Relaxed);
            let new = head.advance_counter_and_state(idx, Self::INCREMENT);
            match self
                .head
                .compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(_) => backoff.spin(),
            }
        }
    }

    /// Pop the most recently pushed handle, or `None` if the stack is empty.
    pub fn pop(&self) -> Option<T::Handle> {
        let mut backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head.is_null() {
                return None;
            }
            let link = self.pool.get(head.index());
            let next = link.single_next.load(Ordering::Relaxed);
            let new = head.advance_counter_and_state(next, Self::INCREMENT);
            match self
                .head
                .compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let payload = link.payload.swap(std::ptr::null_mut(), Ordering::Acquire);
                    link.single_next.store(0, Ordering::Relaxed);
                    let index = head.index();
                    self.pool.release(index);
                    let payload = NonNull::new(payload).expect("link payload set by push");
                    // Safety: payload was produced by `T::into_raw` in `push`/`push_if` and has
                    // not been handed back via `from_raw` yet.
                    return Some(unsafe { T::from_raw(payload) });
                }
                Err(_) => backoff.spin(),
            }
        }
    }

    /// Atomically take the entire chain and rewrite the state bits via `f(old_state)`. Returns
    /// the previous state and the popped handles in pop order (i.e. LIFO with respect to push
    /// order — the most recently pushed handle comes first).
    pub fn pop_all_and_change_state(&self, f: impl FnOnce(u64) -> u64) -> (u64, Vec<T::Handle>) {
        let mut backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            let old_state = head.state::<STATE_MASK>();
            let new_state = f(old_state);
            debug_assert!(new_state <= STATE_MASK);
            let new_counter = ((head.counter_and_state() >> Self::STATE_BITS) + 1)
                << Self::STATE_BITS
                | new_state;
            let new = TaggedPtr::new(0, new_counter);
            match self
                .head
                .compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let mut handles = Vec::new();
                    let mut idx = head.index();
                    while idx != 0 {
                        let link = self.pool.get(idx);
                        let next = link.single_next.load(Ordering::Relaxed);
                        let payload = link.payload.swap(std::ptr::null_mut(), Ordering::Acquire);
                        link.single_next.store(0, Ordering::Relaxed);
                        let nn = NonNull::new(payload).expect("link payload set by push");
                        // Safety: see `pop`.
                        handles.push(unsafe { T::from_raw(nn) });
                        self.pool.release(idx);
                        idx = next;
                    }
                    return (old_state, handles);
                }
                Err(_) => backoff.spin(),
            }
        }
    }

    #[must_use]
    pub fn state(&self) -> u64 {
        self.head.load(Ordering::Acquire).state::<STATE_MASK>()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_is_lifo() {
        let stack: Stack<Box<u32>> = Stack::new();
        stack.push(Box::new(1));
        stack.push(Box::new(2));
        stack.push(Box::new(3));
        assert_eq!(*stack.pop().unwrap(), 3);
        assert_eq!(*stack.pop().unwrap(), 2);
        assert_eq!(*stack.pop().unwrap(), 1);
        assert!(stack.pop().is_none());
    }

    #[test]
    fn push_if_rejects_and_returns_handle() {
        let stack: Stack<Box<u32>, 0b1> = Stack::new();
        stack.pop_all_and_change_state(|_| 1); // close it
        let result = stack.push_if(Box::new(5), |state| state & 1 == 0);
        assert_eq!(*result.unwrap_err(), 5);
    }

    #[test]
    fn pop_all_and_change_state_collects_all_in_pop_order() {
        let stack: Stack<Box<u32>> = Stack::new();
        stack.push(Box::new(1));
        stack.push(Box::new(2));
        stack.push(Box::new(3));
        let (old_state, handles) = stack.pop_all_and_change_state(|s| s);
        assert_eq!(old_state, 0);
        let values: Vec<u32> = handles.into_iter().map(|b| *b).collect();
        assert_eq!(values, vec![3, 2, 1]);
        assert!(stack.is_empty());
    }
}
