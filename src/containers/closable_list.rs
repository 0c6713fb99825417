// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The closable single-consumer list: a [`Stack`] whose low state bit records whether the list
//! has been closed. This backs [`crate::event::GraphEvent`]'s subsequents list — pushing a
//! dependent task is only legal while the list is open, and the owning task closes it exactly
//! once when it dispatches.

use crate::containers::{Linked, Stack};

const CLOSED: u64 = 0b1;

/// A LIFO list that can be irreversibly closed. Once closed, further pushes fail instead of
/// being queued.
#[derive(Debug, Default)]
pub struct ClosableList<T: Linked>(Stack<T, CLOSED>);

impl<T: Linked> ClosableList<T> {
    #[must_use]
    pub fn new() -> Self {
        Self(Stack::new())
    }

    /// Push `handle` unless the list has already been closed. Returns `false` (and hands the
    /// handle back) if it was closed.
    #[must_use]
    pub fn push_if_not_closed(&self, handle: T::Handle) -> Result<(), T::Handle> {
        self.0.push_if(handle, |state| state & CLOSED == 0)
    }

    /// Atomically take every pushed handle and close the list. Closing is irreversible: calling
    /// this twice is a fatal usage error, enforced by the debug assertion below.
    ///
    /// Returns the handles in the reverse of push order (LIFO pop order); callers that want to
    /// approximate FIFO dispatch order should iterate the returned vector in reverse.
    pub fn pop_all_and_close(&self) -> Vec<T::Handle> {
        let (old_state, handles) = self.0.pop_all_and_change_state(|state| {
            debug_assert_eq!(state & CLOSED, 0, "closable list closed twice");
            state | CLOSED
        });
        debug_assert_eq!(old_state & CLOSED, 0, "closable list closed twice");
        handles
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.0.state() & CLOSED != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_close_returns_pushed_items() {
        let list: ClosableList<Box<u32>> = ClosableList::new();
        assert!(list.push_if_not_closed(Box::new(1)).is_ok());
        assert!(list.push_if_not_closed(Box::new(2)).is_ok());
        assert!(!list.is_closed());

        let popped = list.pop_all_and_close();
        assert!(list.is_closed());
        let values: Vec<u32> = popped.into_iter().map(|b| *b).collect();
        assert_eq!(values, vec![2, 1]);
    }

    #[test]
    fn push_after_close_fails() {
        let list: ClosableList<Box<u32>> = ClosableList::new();
        list.pop_all_and_close();
        let result = list.push_if_not_closed(Box::new(7));
        assert_eq!(*result.unwrap_err(), 7);
    }

    #[test]
    fn empty_close_is_a_no_op_besides_closing() {
        let list: ClosableList<Box<u32>> = ClosableList::new();
        let popped = list.pop_all_and_close();
        assert!(popped.is_empty());
        assert!(list.is_closed());
    }
}
