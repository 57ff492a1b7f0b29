//! Hooks must never reach the process allocator, not even on a thread's
//! first call. Runs in its own binary because it installs a counting
//! `#[global_allocator]`.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use tagtrack::{TagDeclaration, TrackerBuilder, TrackerConfig};

struct CountingAllocator;

static CALLS: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static ARMED: Cell<bool> = const { Cell::new(false) };
}

fn count() {
    if ARMED.try_with(Cell::get).unwrap_or(false) {
        CALLS.fetch_add(1, Ordering::Relaxed);
    }
}

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        count();
        System.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        count();
        System.dealloc(ptr, layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        count();
        System.realloc(ptr, layout, new_size)
    }
}

#[global_allocator]
static ALLOCATOR: CountingAllocator = CountingAllocator;

/// Heap calls made by `f` on the current thread.
fn heap_calls(f: impl FnOnce()) -> usize {
    let before = CALLS.load(Ordering::Relaxed);
    ARMED.with(|armed| armed.set(true));
    f();
    ARMED.with(|armed| armed.set(false));
    CALLS.load(Ordering::Relaxed) - before
}

#[test]
fn test_hooks_on_fresh_threads_use_no_heap() {
    let tracker = TrackerBuilder::new(TrackerConfig::default())
        .declare_tag(TagDeclaration::new("Streaming"))
        .build()
        .unwrap();
    let streaming = tracker.find_tag("Streaming").unwrap();

    thread::scope(|s| {
        s.spawn(|| {
            let calls = heap_calls(|| {
                tracker.on_alloc_tagged(0x1000 as *const u8, 64, streaming);
                tracker.on_alloc(0x2000 as *const u8, 32);
                tracker.on_realloc(0x2000 as *const u8, 32, 0x3000 as *const u8, 96);
                tracker.on_free(0x1000 as *const u8, 64);
            });
            assert_eq!(calls, 0);
        });

        s.spawn(|| {
            let calls = heap_calls(|| {
                let _scope = tracker.scope(streaming);
                tracker.on_alloc(0x4000 as *const u8, 128);
            });
            assert_eq!(calls, 0);
        });
    });

    tracker.update();
    assert_eq!(tracker.tag_size(streaming).size, 128);
    assert_eq!(tracker.tag_size(tracker.untagged()).size, 96);
    assert_eq!(tracker.report().unwrap().live_allocations, Some(2));
}
