// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Component (A): the link allocator.
//!
//! A [`Link`] is the small fixed-size record every lock-free container in [`crate::containers`]
//! is built from. Links are addressed by a compact `u32` index rather than by raw pointer, so
//! that the [`crate::tagged_ptr`] ABA counter can protect against value reuse without retaining
//! freed memory the way hazard pointers or epoch reclamation would.
//!
//! [`LinkAllocator`] only ever hands out *fresh* indices (never reused); recycling of indices
//! that a container is done with is the job of [`LinkPool`], which layers a lock-free freelist
//! on top so a container's steady-state push/pop traffic does not need to keep growing the
//! allocator.

use crate::loom::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use crate::tagged_ptr::{AtomicTaggedPtr, LinkIndex, TaggedPtr};
use std::ptr;

/// Links per backing page. Chosen, as in the reference implementation, to keep the top-level
/// page table small while amortizing the page allocation over many links.
pub const PAGE_SIZE: usize = 16384;

/// A single link record: a tagged-pointer slot for intrusive FIFO double-linking, a raw payload
/// reference, and a plain single-next index for intrusive LIFO chains.
#[derive(Debug, Default)]
pub struct Link {
    pub double_next: AtomicTaggedPtr,
    pub payload: AtomicPtr<()>,
    pub single_next: AtomicU32,
}

type Page = [Link; PAGE_SIZE];

/// Hands out link indices from a monotonic counter, lazily allocating backing pages.
///
/// Indices are never reused by this type — see [`LinkPool`] for a recycling layer. Index `0` is
/// reserved as the null sentinel and is skipped by construction.
pub struct LinkAllocator {
    next_index: AtomicU32,
    pages: Box<[AtomicPtr<Page>]>,
}

impl std::fmt::Debug for LinkAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkAllocator")
            .field("next_index", &self.next_index.load(Ordering::Relaxed))
            .field("num_pages", &self.pages.len())
            .finish()
    }
}

impl Default for LinkAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkAllocator {
    #[must_use]
    pub fn new() -> Self {
        let num_pages = (crate::tagged_ptr::MAX_LINKS as usize).div_ceil(PAGE_SIZE);
        let pages = (0..num_pages)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        Self {
            // index 0 is the null sentinel; start handing out indices at 1.
            next_index: AtomicU32::new(1),
            pages,
        }
    }

    /// Allocate `n` contiguous, fresh link indices and return the first one. The caller may
    /// treat `[start, start + n)` as belonging to it.
    ///
    /// # Panics
    ///
    /// Panics if the link space (`2^26` indices by default) is exhausted. This is a fatal,
    /// unrecoverable condition per the capacity-exhaustion error class: the engine is expected
    /// to be dimensioned so this never triggers under supported workloads.
    pub fn alloc(&self, n: u32) -> LinkIndex {
        let first = self.next_index.fetch_add(n, Ordering::Relaxed);
        assert!(
            u64::from(first) + u64::from(n) <= u64::from(crate::tagged_ptr::MAX_LINKS),
            "link allocator exhausted: requested index {first}..{} exceeds {} links",
            first + n,
            crate::tagged_ptr::MAX_LINKS
        );
        first
    }

    /// Returns a reference to the link record for `index`, installing its backing page on first
    /// touch.
    ///
    /// # Panics
    ///
    /// Panics if `index` is the null sentinel (`0`).
    #[must_use]
    pub fn get(&self, index: LinkIndex) -> &Link {
        debug_assert_ne!(index, 0, "index 0 is the null sentinel, not a valid link");
        let index = index as usize;
        let page_idx = index / PAGE_SIZE;
        let slot = index % PAGE_SIZE;
        &self.ensure_page(page_idx)[slot]
    }

    fn ensure_page(&self, page_idx: usize) -> &Page {
        let slot = &self.pages[page_idx];
        let mut page = slot.load(Ordering::Acquire);
        if page.is_null() {
            let fresh: Box<Page> = Box::new(std::array::from_fn(|_| Link::default()));
            let fresh = Box::into_raw(fresh);
            match slot.compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => page = fresh,
                Err(installed) => {
                    // lost the race: drop our page, use the winner's.
                    // Safety: `fresh` was never published, so we still own it.
                    drop(unsafe { Box::from_raw(fresh) });
                    page = installed;
                }
            }
        }
        // Safety: `page` was installed by a successful CAS above (or observed from one) and
        // pages are never freed for the lifetime of the allocator.
        unsafe { &*page }
    }
}

impl Drop for LinkAllocator {
    fn drop(&mut self) {
        for page in &self.pages {
            let ptr = *page.get_mut();
            if !ptr.is_null() {
                // Safety: installed by `ensure_page`, never freed elsewhere.
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}

/// Layers a lock-free freelist (a Treiber stack over `single_next`) on top of a
/// [`LinkAllocator`] so containers can recycle links they are done with instead of growing the
/// allocator forever.
pub struct LinkPool {
    allocator: LinkAllocator,
    free_head: AtomicTaggedPtr,
}

const FREE_LIST_ABA_INCREMENT: u64 = 1;

impl std::fmt::Debug for LinkPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkPool").field("allocator", &self.allocator).finish()
    }
}

impl Default for LinkPool {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkPool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            allocator: LinkAllocator::new(),
            free_head: AtomicTaggedPtr::new(TaggedPtr::NULL),
        }
    }

    #[must_use]
    pub fn get(&self, index: LinkIndex) -> &Link {
        self.allocator.get(index)
    }

    /// Obtain a link index, preferring a recycled one from the freelist before falling back to
    /// the underlying allocator.
    pub fn acquire(&self) -> LinkIndex {
        let mut backoff = crate::util::Backoff::new();
        loop {
            let head = self.free_head.load(Ordering::Acquire);
            if head.is_null() {
                return self.allocator.alloc(1);
            }
            let next = self.allocator.get(head.index()).single_next.load(Ordering::Relaxed);
            let new_head = head.advance_counter_and_state(next, FREE_LIST_ABA_INCREMENT);
            match self
                .free_head
                .compare_exchange_weak(head, new_head, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return head.index(),
                Err(_) => backoff.spin(),
            }
        }
    }

    /// Return `index` to the freelist for future `acquire` calls.
    pub fn release(&self, index: LinkIndex) {
        debug_assert_ne!(index, 0);
        let link = self.allocator.get(index);
        let mut backoff = crate::util::Backoff::new();
        loop {
            let head = self.free_head.load(Ordering::Acquire);
            link.single_next.store(head.index(), Ordering::Relaxed);
            let new_head = head.advance_counter_and_state(index, FREE_LIST_ABA_INCREMENT);
            match self
                .free_head
                .compare_exchange_weak(head, new_head, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(_) => backoff.spin(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_never_reuses_indices() {
        let alloc = LinkAllocator::new();
        let a = alloc.alloc(1);
        let b = alloc.alloc(1);
        let c = alloc.alloc(3);
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert!(b > a);
        assert!(c > b);
    }

    #[test]
    fn get_spans_page_boundary() {
        let alloc = LinkAllocator::new();
        let first = alloc.alloc(PAGE_SIZE as u32 + 4);
        let last = first + PAGE_SIZE as u32 + 3;
        // touches two backing pages; should not panic.
        let _ = alloc.get(first);
        let _ = alloc.get(last);
    }

    #[test]
    fn pool_recycles_released_links() {
        let pool = LinkPool::new();
        let a = pool.acquire();
        pool.release(a);
        let b = pool.acquire();
        assert_eq!(a, b, "released link should be recycled before growing the allocator");
    }
}
