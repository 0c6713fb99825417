// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A 64-bit atomic word combining a [`LinkIndex`] with an ABA-safe counter (and, for the
//! closable list, a state bitfield packed into the counter's low bits).
//!
//! This is component (B) of the task graph runtime: every lock-free container in
//! [`crate::containers`] swings one of these atomically instead of a raw pointer, so that a
//! thread which re-reads the same link index can still tell that another thread swapped the
//! slot's contents in the meantime.

use crate::loom::sync::atomic::{AtomicU64, Ordering};
use std::fmt;

/// Number of low bits dedicated to the link index. `2^26` simultaneously-live links ought to be
/// enough for any engine frame; the remaining 38 bits go to the ABA counter.
pub const INDEX_BITS: u32 = 26;

/// One past the largest representable link index.
pub const MAX_LINKS: u32 = 1 << INDEX_BITS;

const INDEX_MASK: u64 = (MAX_LINKS as u64) - 1;

static_assertions::const_assert!(INDEX_BITS < 64);
// Design Notes §9: the counter must have room for at least 2^23 distinct values between wraps.
static_assertions::const_assert!(64 - INDEX_BITS >= 23);

/// The link-index portion of a [`TaggedPtr`]. Index `0` is the reserved null sentinel.
pub type LinkIndex = u32;

/// An immutable snapshot of a [`AtomicTaggedPtr`]'s value: a link index paired with a
/// counter-and-state word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TaggedPtr(u64);

impl fmt::Debug for TaggedPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaggedPtr")
            .field("index", &self.index())
            .field("counter_and_state", &self.counter_and_state())
            .finish()
    }
}

impl TaggedPtr {
    /// The null tagged pointer: index 0, counter 0. Valid as an initial value; never produced by
    /// `advance_counter_and_state`.
    pub const NULL: Self = Self(0);

    #[must_use]
    pub const fn new(index: LinkIndex, counter_and_state: u64) -> Self {
        debug_assert!((index as u64) <= INDEX_MASK);
        Self((index as u64) | (counter_and_state << INDEX_BITS))
    }

    #[must_use]
    pub const fn index(self) -> LinkIndex {
        (self.0 & INDEX_MASK) as LinkIndex
    }

    #[must_use]
    pub const fn counter_and_state(self) -> u64 {
        self.0 >> INDEX_BITS
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.index() == 0
    }

    #[must_use]
    pub const fn with_index(self, index: LinkIndex) -> Self {
        Self::new(index, self.counter_and_state())
    }

    /// Extract the low `state_bits` of the counter-and-state word, used by the closable list to
    /// steal a couple of bits from the ABA counter for open/closed state.
    #[must_use]
    pub const fn state<const STATE_MASK: u64>(self) -> u64 {
        self.counter_and_state() & STATE_MASK
    }

    #[must_use]
    pub const fn with_state<const STATE_MASK: u64>(self, value: u64) -> Self {
        debug_assert!(value <= STATE_MASK);
        Self::new(
            self.index(),
            (self.counter_and_state() & !STATE_MASK) | value,
        )
    }

    /// Build a new tagged pointer that points at `index`, advancing `self`'s counter by
    /// `increment`. On wrap-around (new counter numerically less than the old one) this performs
    /// a brief defensive sleep: the ABA window is dimensioned so this is never expected to
    /// matter operationally, but a wrapped counter can no longer distinguish two writers, so we
    /// slow down the racer rather than pretend nothing happened.
    #[must_use]
    pub fn advance_counter_and_state(self, index: LinkIndex, increment: u64) -> Self {
        let old = self.counter_and_state();
        let new = old.wrapping_add(increment);
        if new < old {
            tracing::warn!("tagged pointer ABA counter wrapped, stalling briefly");
            std::thread::sleep(std::time::Duration::from_micros(1));
        }
        Self::new(index, new)
    }
}

/// The atomic slot itself: an `AtomicU64` storing the bit pattern of a [`TaggedPtr`].
#[repr(align(8))]
pub struct AtomicTaggedPtr(AtomicU64);

impl fmt::Debug for AtomicTaggedPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicTaggedPtr")
            .field(&self.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for AtomicTaggedPtr {
    fn default() -> Self {
        Self::new(TaggedPtr::NULL)
    }
}

impl AtomicTaggedPtr {
    #[must_use]
    pub fn new(value: TaggedPtr) -> Self {
        Self(AtomicU64::new(value.0))
    }

    #[must_use]
    pub fn load(&self, order: Ordering) -> TaggedPtr {
        TaggedPtr(self.0.load(order))
    }

    pub fn store(&self, value: TaggedPtr, order: Ordering) {
        self.0.store(value.0, order);
    }

    /// Attempt to swing the slot from `current` to `new`. Returns the observed value either way,
    /// matching `AtomicU64::compare_exchange_weak`'s shape but specialized to tagged pointers.
    pub fn compare_exchange_weak(
        &self,
        current: TaggedPtr,
        new: TaggedPtr,
        success: Ordering,
        failure: Ordering,
    ) -> Result<TaggedPtr, TaggedPtr> {
        match self
            .0
            .compare_exchange_weak(current.0, new.0, success, failure)
        {
            Ok(v) => Ok(TaggedPtr(v)),
            Err(v) => Err(TaggedPtr(v)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_index_and_counter() {
        let p = TaggedPtr::new(42, 7);
        assert_eq!(p.index(), 42);
        assert_eq!(p.counter_and_state(), 7);
    }

    #[test]
    fn null_is_index_zero() {
        assert!(TaggedPtr::NULL.is_null());
        assert!(!TaggedPtr::new(1, 0).is_null());
    }

    #[test]
    fn advance_counter_increments_and_rewrites_index() {
        let p = TaggedPtr::new(3, 10);
        let next = p.advance_counter_and_state(9, 2);
        assert_eq!(next.index(), 9);
        assert_eq!(next.counter_and_state(), 12);
    }

    #[test]
    fn state_bits_are_independent_of_index() {
        let p = TaggedPtr::new(5, 0b100).with_state::<0b1>(1);
        assert_eq!(p.state::<0b1>(), 1);
        assert_eq!(p.index(), 5);
        assert_eq!(p.counter_and_state(), 0b101);
    }
}
