//! `#[global_allocator]` wrapper that feeds the process-wide tracker.

use std::alloc::{GlobalAlloc, Layout, System};
use std::fmt;

use crate::api::tracker::global;

/// Forwards to an inner allocator and reports every block to the tracker
/// installed with [`install_global`](crate::install_global).
///
/// Before a tracker is installed (and after it is shut down) this is a plain
/// pass-through.
///
/// ```rust,no_run
/// use tagtrack::{install_global, TrackerBuilder, TrackerConfig, TrackingAllocator};
///
/// #[global_allocator]
/// static ALLOCATOR: TrackingAllocator = TrackingAllocator::system();
///
/// fn main() {
///     let tracker = TrackerBuilder::new(TrackerConfig::default())
///         .with_default_tags()
///         .build()
///         .unwrap();
///     let tracker = install_global(tracker).unwrap();
///
///     let _scope = tracker.scope_enum(tagtrack::default_tags::AUDIO);
///     let buffer = vec![0u8; 4096];
///     drop(buffer);
/// }
/// ```
pub struct TrackingAllocator<A: GlobalAlloc = System> {
    inner: A,
}

impl TrackingAllocator<System> {
    /// Wrap the system allocator.
    #[must_use]
    #[inline]
    pub const fn system() -> Self {
        Self::new(System)
    }
}

impl<A: GlobalAlloc> TrackingAllocator<A> {
    /// Wrap `inner`.
    #[must_use]
    #[inline]
    pub const fn new(inner: A) -> Self {
        Self { inner }
    }
}

// SAFETY: every call is forwarded to `inner` with the caller's arguments, and
// the tracker hooks never touch the memory they are told about.
unsafe impl<A: GlobalAlloc> GlobalAlloc for TrackingAllocator<A> {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // SAFETY: the caller upholds GlobalAlloc::alloc's contract.
        let ptr = unsafe { self.inner.alloc(layout) };
        if let Some(tracker) = global() {
            tracker.on_alloc(ptr, layout.size());
        }
        ptr
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // SAFETY: the caller upholds GlobalAlloc::alloc_zeroed's contract.
        let ptr = unsafe { self.inner.alloc_zeroed(layout) };
        if let Some(tracker) = global() {
            tracker.on_alloc(ptr, layout.size());
        }
        ptr
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // Untrack first: once the block is released its address can be
        // handed to another thread.
        if let Some(tracker) = global() {
            tracker.on_free(ptr, layout.size());
        }
        // SAFETY: the caller upholds GlobalAlloc::dealloc's contract.
        unsafe { self.inner.dealloc(ptr, layout) }
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let tracker = global();
        let detached = tracker.and_then(|tracker| tracker.detach_allocation(ptr));

        // SAFETY: the caller upholds GlobalAlloc::realloc's contract.
        let new_ptr = unsafe { self.inner.realloc(ptr, layout, new_size) };

        if let Some(tracker) = tracker {
            tracker.finish_realloc(detached, ptr, layout.size(), new_ptr, new_size);
        }
        new_ptr
    }
}

impl<A: GlobalAlloc> fmt::Debug for TrackingAllocator<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingAllocator")
            .field("installed", &global().is_some())
            .finish_non_exhaustive()
    }
}
