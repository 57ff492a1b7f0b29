//! Private arena for the tracker's own bookkeeping.
//!
//! Every container the tracker uses draws memory from here, never from the
//! global allocator being instrumented. Pages come straight from the OS
//! (`mmap` on Unix, the `System` allocator elsewhere), so feeding the tracker
//! can never re-enter an allocation hook.
//!
//! Small requests are rounded to a power-of-two bin and served from the bin's
//! free list or carved from the current page. Requests too large for a page
//! get a dedicated OS block which goes back to the OS as soon as it is freed.

use std::ptr::{self, NonNull};

use crate::sync::atomics::{AtomicCounter, AtomicGauge};
use crate::sync::mutex::Mutex;
use crate::util::layout::{align_up, size_class, OS_PAGE_SIZE};
use crate::util::size::kb;

/// Default page granularity.
pub const DEFAULT_PAGE_SIZE: usize = kb(16);

/// Smallest bin size.
const MIN_CLASS: usize = 16;

/// Bins only guarantee this alignment; larger alignments use dedicated blocks.
const MAX_BIN_ALIGN: usize = 64;

/// Space reserved at the start of each page for the page list link.
const PAGE_HEADER: usize = 64;

/// Upper bound on the number of bins (16 B up to 2 GiB pages).
const MAX_BINS: usize = 28;

/// Link stored in the first bytes of every page the arena owns.
struct PageHeader {
    next: *mut PageHeader,
}

/// Link stored in the first bytes of every freed bin block.
struct FreeBlock {
    next: *mut FreeBlock,
}

struct ArenaState {
    /// Free lists, indexed by `log2(class) - log2(MIN_CLASS)`
    bins: [*mut FreeBlock; MAX_BINS],

    /// Next free byte in the current page
    cursor: *mut u8,

    /// End of the current page
    page_end: *mut u8,

    /// All pages, for release on drop
    pages: *mut PageHeader,
}

/// Usage numbers for the arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Bytes currently obtained from the OS
    pub reserved_bytes: usize,
    /// Bytes currently handed out to containers
    pub used_bytes: usize,
    /// High-water mark of `used_bytes`
    pub peak_used_bytes: usize,
    /// Number of OS allocations performed
    pub os_allocations: u64,
}

/// Page-granular allocator backing every tracker container.
pub struct LlmArena {
    page_size: usize,

    /// Maximum bytes to reserve from the OS (0 = unlimited)
    limit: usize,

    state: Mutex<ArenaState>,

    reserved: AtomicGauge,
    used: AtomicGauge,
    peak_used: AtomicGauge,
    os_allocations: AtomicCounter,
}

// SAFETY: the raw pointers in `ArenaState` are only touched under `state`'s lock
// and point into memory owned by the arena itself.
unsafe impl Send for LlmArena {}
unsafe impl Sync for LlmArena {}

impl LlmArena {
    /// Create an arena with the given page granularity.
    ///
    /// The page size is rounded up to a power of two of at least one OS page.
    pub fn new(page_size: usize) -> Self {
        Self::with_limit(page_size, 0)
    }

    /// Create an arena that refuses to reserve more than `limit` bytes
    /// from the OS (0 = unlimited).
    pub fn with_limit(page_size: usize, limit: usize) -> Self {
        let page_size = page_size.max(OS_PAGE_SIZE).next_power_of_two();
        Self {
            page_size,
            limit,
            state: Mutex::new(ArenaState {
                bins: [ptr::null_mut(); MAX_BINS],
                cursor: ptr::null_mut(),
                page_end: ptr::null_mut(),
                pages: ptr::null_mut(),
            }),
            reserved: AtomicGauge::new(0),
            used: AtomicGauge::new(0),
            peak_used: AtomicGauge::new(0),
            os_allocations: AtomicCounter::new(0),
        }
    }

    /// Page granularity in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Largest request served from bins instead of a dedicated block.
    pub fn max_bin_size(&self) -> usize {
        self.page_size / 2
    }

    /// Allocate `size` bytes aligned to `align`.
    ///
    /// Returns `None` if the OS refuses memory or the limit is reached.
    /// The memory is uninitialized.
    pub fn alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        debug_assert!(align.is_power_of_two());
        let size = size.max(1);

        let ptr = if self.is_binned(size, align) {
            self.alloc_binned(size_class(size, align, MIN_CLASS))?
        } else {
            self.alloc_dedicated(size, align)?
        };

        self.peak_used.update_max(self.used.add(self.accounted_size(size, align)));
        Some(ptr)
    }

    /// Allocate zero-initialized memory.
    pub fn alloc_zeroed(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let ptr = self.alloc(size, align)?;
        // SAFETY: `alloc` returned at least `size` writable bytes.
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Some(ptr)
    }

    /// Return memory to the arena.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc` on this arena with the same `size` and
    /// `align`, and must not be used afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        let size = size.max(1);
        self.used.sub(self.accounted_size(size, align));

        if self.is_binned(size, align) {
            let class = size_class(size, align, MIN_CLASS);
            let block = ptr.as_ptr() as *mut FreeBlock;
            let mut state = self.state.lock();
            let bin = bin_index(class);
            (*block).next = state.bins[bin];
            state.bins[bin] = block;
        } else {
            let os_size = align_up(size, OS_PAGE_SIZE);
            os::release(ptr.as_ptr(), os_size);
            self.reserved.sub(os_size);
        }
    }

    /// Copy a string into arena memory.
    ///
    /// The copy lives until the arena is dropped.
    pub(crate) fn alloc_str(&self, value: &str) -> Option<ArenaStr> {
        if value.is_empty() {
            return Some(ArenaStr::EMPTY);
        }
        let ptr = self.alloc(value.len(), 1)?;
        // SAFETY: fresh allocation of exactly `value.len()` bytes.
        unsafe { ptr::copy_nonoverlapping(value.as_ptr(), ptr.as_ptr(), value.len()) };
        Some(ArenaStr { ptr, len: value.len() })
    }

    /// Current usage numbers.
    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            reserved_bytes: self.reserved.get(),
            used_bytes: self.used.get(),
            peak_used_bytes: self.peak_used.get(),
            os_allocations: self.os_allocations.get(),
        }
    }

    fn is_binned(&self, size: usize, align: usize) -> bool {
        align <= MAX_BIN_ALIGN && size_class(size, align, MIN_CLASS) <= self.max_bin_size()
    }

    fn accounted_size(&self, size: usize, align: usize) -> usize {
        if self.is_binned(size, align) {
            size_class(size, align, MIN_CLASS)
        } else {
            align_up(size, OS_PAGE_SIZE)
        }
    }

    fn alloc_binned(&self, class: usize) -> Option<NonNull<u8>> {
        let mut state = self.state.lock();
        let bin = bin_index(class);

        let head = state.bins[bin];
        if !head.is_null() {
            // SAFETY: bin entries are blocks we handed out and got back via `free`.
            state.bins[bin] = unsafe { (*head).next };
            return NonNull::new(head as *mut u8);
        }

        // Every block of a class is aligned to min(class, MAX_BIN_ALIGN), so a
        // recycled block satisfies any alignment the class was chosen for.
        let block_align = class.min(MAX_BIN_ALIGN);
        let mut start = align_up(state.cursor as usize, block_align);
        if state.cursor.is_null() || start + class > state.page_end as usize {
            self.new_page(&mut state)?;
            start = align_up(state.cursor as usize, block_align);
        }

        state.cursor = (start + class) as *mut u8;
        NonNull::new(start as *mut u8)
    }

    fn new_page(&self, state: &mut ArenaState) -> Option<()> {
        let base = self.reserve(self.page_size)?;
        let header = base as *mut PageHeader;
        // SAFETY: the page is at least PAGE_HEADER bytes and page-aligned.
        unsafe { (*header).next = state.pages };
        state.pages = header;
        // SAFETY: both offsets stay within the freshly reserved page.
        state.cursor = unsafe { base.add(PAGE_HEADER) };
        state.page_end = unsafe { base.add(self.page_size) };
        Some(())
    }

    fn alloc_dedicated(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        if align > OS_PAGE_SIZE {
            return None;
        }
        NonNull::new(self.reserve(align_up(size, OS_PAGE_SIZE))?)
    }

    fn reserve(&self, os_size: usize) -> Option<*mut u8> {
        if self.limit > 0 && self.reserved.get() + os_size > self.limit {
            return None;
        }
        let ptr = os::reserve(os_size);
        if ptr.is_null() {
            return None;
        }
        self.reserved.add(os_size);
        self.os_allocations.increment();
        Some(ptr)
    }
}

impl Default for LlmArena {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}

impl Drop for LlmArena {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let mut page = state.pages;
        while !page.is_null() {
            // SAFETY: every page in the list was reserved by `new_page` with
            // `page_size` bytes and is released exactly once here.
            unsafe {
                let next = (*page).next;
                os::release(page as *mut u8, self.page_size);
                page = next;
            }
        }
        state.pages = ptr::null_mut();
    }
}

fn bin_index(class: usize) -> usize {
    (class.trailing_zeros() - MIN_CLASS.trailing_zeros()) as usize
}

/// A string stored in arena memory.
///
/// Valid for as long as the arena that produced it is alive. The crate only
/// hands these out behind types that keep their arena alive.
#[derive(Clone, Copy)]
pub(crate) struct ArenaStr {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the bytes are immutable once written.
unsafe impl Send for ArenaStr {}
unsafe impl Sync for ArenaStr {}

impl ArenaStr {
    /// The empty string; needs no arena memory.
    pub const EMPTY: ArenaStr = ArenaStr {
        ptr: NonNull::dangling(),
        len: 0,
    };

    /// View as `&str`.
    pub fn as_str(&self) -> &str {
        // SAFETY: the bytes were copied from a `&str` and never modified.
        unsafe { std::str::from_utf8_unchecked(std::slice::from_raw_parts(self.ptr.as_ptr(), self.len)) }
    }
}

impl std::ops::Deref for ArenaStr {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl std::borrow::Borrow<str> for ArenaStr {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

impl PartialEq for ArenaStr {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for ArenaStr {}

impl std::fmt::Debug for ArenaStr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self.as_str(), f)
    }
}

impl std::fmt::Display for ArenaStr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(unix)]
mod os {
    use std::ptr;

    pub fn reserve(size: usize) -> *mut u8 {
        // SAFETY: anonymous private mapping, no file descriptor involved.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            ptr::null_mut()
        } else {
            ptr as *mut u8
        }
    }

    /// # Safety
    ///
    /// `ptr` must come from `reserve(size)`.
    pub unsafe fn release(ptr: *mut u8, size: usize) {
        libc::munmap(ptr as *mut libc::c_void, size);
    }
}

#[cfg(not(unix))]
mod os {
    use std::alloc::{GlobalAlloc, Layout, System};

    use crate::util::layout::OS_PAGE_SIZE;

    pub fn reserve(size: usize) -> *mut u8 {
        match Layout::from_size_align(size, OS_PAGE_SIZE) {
            // SAFETY: non-zero size, valid layout. `System` bypasses any
            // instrumented `#[global_allocator]`.
            Ok(layout) => unsafe { System.alloc(layout) },
            Err(_) => std::ptr::null_mut(),
        }
    }

    /// # Safety
    ///
    /// `ptr` must come from `reserve(size)`.
    pub unsafe fn release(ptr: *mut u8, size: usize) {
        if let Ok(layout) = Layout::from_size_align(size, OS_PAGE_SIZE) {
            System.dealloc(ptr, layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_alloc_and_reuse() {
        let arena = LlmArena::default();

        let a = arena.alloc(24, 8).unwrap();
        let b = arena.alloc(24, 8).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_ptr() as usize % 8, 0);

        unsafe { arena.free(a, 24, 8) };
        let c = arena.alloc(20, 4).unwrap();
        assert_eq!(a, c, "freed block of the same class is reused");

        unsafe {
            arena.free(b, 24, 8);
            arena.free(c, 20, 4);
        }
        assert_eq!(arena.stats().used_bytes, 0);
    }

    #[test]
    fn test_pages_come_in_page_size_units() {
        let arena = LlmArena::new(kb(16));
        let _ = arena.alloc(16, 8).unwrap();
        let stats = arena.stats();
        assert_eq!(stats.reserved_bytes, kb(16));
        assert_eq!(stats.os_allocations, 1);
    }

    #[test]
    fn test_oversized_block_is_returned_to_os() {
        let arena = LlmArena::new(kb(16));
        let size = kb(64) + 3;
        let ptr = arena.alloc(size, 16).unwrap();
        assert_eq!(arena.stats().reserved_bytes, align_up(size, OS_PAGE_SIZE));

        unsafe {
            ptr::write_bytes(ptr.as_ptr(), 0xAB, size);
            arena.free(ptr, size, 16);
        }
        assert_eq!(arena.stats().reserved_bytes, 0);
    }

    #[test]
    fn test_alignment_is_respected() {
        let arena = LlmArena::default();
        for align in [1, 2, 4, 8, 16, 32, 64, 128, 4096] {
            let ptr = arena.alloc(8, align).unwrap();
            assert_eq!(ptr.as_ptr() as usize % align, 0, "align {}", align);
        }
    }

    #[test]
    fn test_limit_reports_exhaustion() {
        let arena = LlmArena::with_limit(kb(16), kb(16));
        assert!(arena.alloc(1024, 8).is_some());
        assert!(arena.alloc(kb(32), 8).is_none());
    }

    #[test]
    fn test_zeroed() {
        let arena = LlmArena::default();
        let ptr = arena.alloc_zeroed(256, 8).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 256) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_arena_str() {
        let arena = LlmArena::default();
        let name = arena.alloc_str("Rendering/Textures").unwrap();
        assert_eq!(name.as_str(), "Rendering/Textures");
        assert_eq!(arena.alloc_str("").unwrap().as_str(), "");
    }
}
