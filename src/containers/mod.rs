// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Component (C): lock-free containers built over the link allocator and tagged pointer.
//!
//! Every container here stores elements through the [`Linked`] trait rather than directly, so
//! the underlying algorithm only ever swings a [`crate::tagged_ptr::TaggedPtr`] over a
//! [`crate::link::Link`] index — never a raw pointer to the element itself. This is the same
//! shape as the reference executor's `mpsc_queue::Linked` trait, adapted so the node storage is
//! an index-addressed link (for ABA safety) instead of an intrusively-embedded pointer pair.

pub mod closable_list;
pub mod queue;
pub mod stack;
pub mod stalling;

pub use closable_list::ClosableList;
pub use queue::Queue;
pub use stack::Stack;
pub use stalling::StallingQueue;

use std::ptr::NonNull;

/// Trait implemented by types that can be stored as the payload of a link-indexed container.
///
/// # Safety
///
/// Implementations must ensure `into_raw`/`from_raw` form a bijection between `Handle` and the
/// raw pointer stored in a [`crate::link::Link`]'s payload slot: every pointer produced by
/// `into_raw` is eventually passed to `from_raw` at most once.
pub unsafe trait Linked {
    /// The owning handle type, e.g. `Box<Self>` or a reference-counted pointer.
    type Handle;

    fn into_raw(handle: Self::Handle) -> NonNull<()>;

    /// # Safety
    ///
    /// `ptr` must have been produced by a prior call to `into_raw` and not yet passed to
    /// `from_raw`.
    unsafe fn from_raw(ptr: NonNull<()>) -> Self::Handle;
}

// Convenience blanket impl: plain boxed values can always be linked containers' payloads.
unsafe impl<T> Linked for Box<T> {
    type Handle = Box<T>;

    fn into_raw(handle: Self::Handle) -> NonNull<()> {
        NonNull::new(Box::into_raw(handle)).unwrap().cast()
    }

    unsafe fn from_raw(ptr: NonNull<()>) -> Self::Handle {
        // Safety: ensured by caller.
        unsafe { Box::from_raw(ptr.cast().as_ptr()) }
    }
}

// Convenience blanket impl: reference-counted values, e.g. the tasks a `GraphEvent` holds as
// subsequents. `into_raw`/`from_raw` round-trip through `Arc::into_raw`/`Arc::from_raw`, which
// already form the bijection `Linked` requires.
unsafe impl<T> Linked for std::sync::Arc<T> {
    type Handle = std::sync::Arc<T>;

    fn into_raw(handle: Self::Handle) -> NonNull<()> {
        NonNull::new(std::sync::Arc::into_raw(handle).cast_mut())
            .unwrap()
            .cast()
    }

    unsafe fn from_raw(ptr: NonNull<()>) -> Self::Handle {
        // Safety: ensured by caller.
        unsafe { std::sync::Arc::from_raw(ptr.cast::<T>().as_ptr()) }
    }
}
