//! Per-thread accounting state.
//!
//! Every thread that touches a tracker gets a [`ThreadState`]: a table of
//! size deltas per tag and the stack of active tag scopes. The state sits
//! behind its own mutex, which only the owning thread and the merge step
//! ever take, so allocation hooks never wait on a global lock.
//!
//! States live in the tracker's arena and are counted by hand through
//! [`ThreadRef`]. The thread's slot holds one handle and the tracker's merge
//! list the other. Creating and registering a state on a thread's first hook
//! never reaches the general-purpose allocator.

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::mem;
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::sync::atomic::{self, AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::allocators::arena::LlmArena;
use crate::api::error::{TrackerError, TrackerResult};
use crate::api::tag::TagHandle;
use crate::collections::LlmArray;
use crate::sync::mutex::Mutex;

/// Trackers a single thread can hold state for at once.
pub(crate) const MAX_TRACKERS_PER_THREAD: usize = 16;

/// Bytes charged to one tag on one thread since the last merge.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ThreadTagSizeData {
    pub(crate) tag: TagHandle,
    pub(crate) size: i64,
}

/// Size deltas for one thread, kept in ascending tag index order.
pub(crate) struct ThreadTable {
    entries: LlmArray<ThreadTagSizeData>,
}

impl ThreadTable {
    pub(crate) fn new(arena: Arc<LlmArena>) -> Self {
        Self {
            entries: LlmArray::new(arena),
        }
    }

    fn position(&self, tag: TagHandle) -> Result<usize, usize> {
        let index = tag.index();
        self.entries
            .as_slice()
            .binary_search_by_key(&index, |entry| entry.tag.index())
    }

    /// Add `delta` to the entry for `tag`, creating it in order if needed.
    pub(crate) fn track(&mut self, tag: TagHandle, delta: i64) -> TrackerResult<()> {
        match self.position(tag) {
            Ok(pos) => self.entries[pos].size += delta,
            Err(pos) => self.entries.insert(pos, ThreadTagSizeData { tag, size: delta })?,
        }
        Ok(())
    }

    /// Unmerged size for `tag` on this thread.
    pub(crate) fn size_of(&self, tag: TagHandle) -> i64 {
        match self.position(tag) {
            Ok(pos) => self.entries[pos].size,
            Err(_) => 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn entries(&self) -> &[ThreadTagSizeData] {
        self.entries.as_slice()
    }

    pub(crate) fn entries_mut(&mut self) -> &mut [ThreadTagSizeData] {
        self.entries.as_mut_slice()
    }
}

/// Mutable part of a thread's state.
pub(crate) struct ThreadInner {
    pub(crate) table: ThreadTable,
    pub(crate) scopes: LlmArray<TagHandle>,
}

/// A thread's accounting table and scope stack.
pub(crate) struct ThreadState {
    inner: Mutex<ThreadInner>,
    /// Set when the owning tracker shuts down; the slot can be discarded.
    orphaned: AtomicBool,
    /// Live [`ThreadRef`] handles.
    refs: AtomicUsize,
    /// Link in [`PendingStates`].
    next: AtomicPtr<ThreadState>,
    arena: Arc<LlmArena>,
}

impl ThreadState {
    pub(crate) fn lock(&self) -> crate::sync::mutex::MutexGuard<'_, ThreadInner> {
        self.inner.lock()
    }

    pub(crate) fn mark_orphaned(&self) {
        self.orphaned.store(true, Ordering::Release);
    }

    pub(crate) fn is_orphaned(&self) -> bool {
        self.orphaned.load(Ordering::Acquire)
    }
}

/// Counted handle to a [`ThreadState`] stored in arena memory.
pub(crate) struct ThreadRef {
    ptr: NonNull<ThreadState>,
}

// SAFETY: the state is only reached through its mutex and atomics, and the
// count keeps it alive while any handle exists.
unsafe impl Send for ThreadRef {}
unsafe impl Sync for ThreadRef {}

impl ThreadRef {
    /// Place a fresh state in `arena`.
    pub(crate) fn new(arena: Arc<LlmArena>) -> TrackerResult<Self> {
        let ptr = arena
            .alloc(mem::size_of::<ThreadState>(), mem::align_of::<ThreadState>())
            .ok_or(TrackerError::OutOfMemory)?
            .cast::<ThreadState>();
        let state = ThreadState {
            inner: Mutex::new(ThreadInner {
                table: ThreadTable::new(arena.clone()),
                scopes: LlmArray::new(arena.clone()),
            }),
            orphaned: AtomicBool::new(false),
            refs: AtomicUsize::new(1),
            next: AtomicPtr::new(ptr::null_mut()),
            arena,
        };
        // SAFETY: freshly allocated with the size and alignment of `ThreadState`.
        unsafe { ptr.as_ptr().write(state) };
        Ok(Self { ptr })
    }

    /// Whether some other handle still refers to the state.
    ///
    /// Held by the merge list, `false` means the owning thread has exited.
    pub(crate) fn is_shared(&self) -> bool {
        self.refs.load(Ordering::Acquire) > 1
    }

    fn into_raw(self) -> *mut ThreadState {
        let ptr = self.ptr.as_ptr();
        mem::forget(self);
        ptr
    }

    /// # Safety
    ///
    /// `ptr` must come from [`into_raw`](Self::into_raw) and be taken back once.
    unsafe fn from_raw(ptr: NonNull<ThreadState>) -> Self {
        Self { ptr }
    }
}

impl Clone for ThreadRef {
    fn clone(&self) -> Self {
        self.refs.fetch_add(1, Ordering::Relaxed);
        Self { ptr: self.ptr }
    }
}

impl Deref for ThreadRef {
    type Target = ThreadState;

    fn deref(&self) -> &ThreadState {
        // SAFETY: the state lives until the last handle is dropped.
        unsafe { self.ptr.as_ref() }
    }
}

impl Drop for ThreadRef {
    fn drop(&mut self) {
        if self.refs.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        atomic::fence(Ordering::Acquire);
        let arena = self.arena.clone();
        // SAFETY: this was the last handle; the block came from `arena` with
        // the layout of `ThreadState`.
        unsafe {
            ptr::drop_in_place(self.ptr.as_ptr());
            arena.free(
                self.ptr.cast::<u8>(),
                mem::size_of::<ThreadState>(),
                mem::align_of::<ThreadState>(),
            );
        }
    }
}

/// States created since the last merge.
///
/// A push-only lock-free stack linked through [`ThreadState::next`]; the
/// merge step detaches the whole list at once, so nodes never need to be
/// popped one by one.
pub(crate) struct PendingStates {
    head: AtomicPtr<ThreadState>,
}

impl PendingStates {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(crate) fn push(&self, state: ThreadRef) {
        let node = state.into_raw();
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: `node` is not reachable by anyone else until published.
            unsafe { (*node).next.store(head, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Detach every pending state.
    pub(crate) fn take_all(&self) -> PendingIter {
        PendingIter {
            next: self.head.swap(ptr::null_mut(), Ordering::Acquire),
        }
    }
}

impl Drop for PendingStates {
    fn drop(&mut self) {
        self.take_all().for_each(drop);
    }
}

/// Handles taken out of [`PendingStates`].
pub(crate) struct PendingIter {
    next: *mut ThreadState,
}

impl Iterator for PendingIter {
    type Item = ThreadRef;

    fn next(&mut self) -> Option<ThreadRef> {
        let node = NonNull::new(self.next)?;
        // SAFETY: every node in a detached list carries the handle given to `push`.
        unsafe {
            self.next = node.as_ref().next.load(Ordering::Relaxed);
            Some(ThreadRef::from_raw(node))
        }
    }
}

impl Drop for PendingIter {
    fn drop(&mut self) {
        self.for_each(drop);
    }
}

struct ThreadSlot {
    tracker_id: u64,
    state: ThreadRef,
}

/// Fixed-capacity slot table, so a thread's first hook needs no heap.
struct ThreadSlots {
    slots: [Option<ThreadSlot>; MAX_TRACKERS_PER_THREAD],
}

const EMPTY_SLOT: Option<ThreadSlot> = None;

impl ThreadSlots {
    fn find(&self, tracker_id: u64) -> Option<&ThreadRef> {
        self.slots
            .iter()
            .flatten()
            .find(|slot| slot.tracker_id == tracker_id)
            .map(|slot| &slot.state)
    }

    /// Move every slot matching `release` into `out`.
    fn take_matching(&mut self, out: &mut ThreadSlots, release: impl Fn(&ThreadSlot) -> bool) {
        for (slot, released) in self.slots.iter_mut().zip(out.slots.iter_mut()) {
            if slot.as_ref().map_or(false, &release) {
                *released = slot.take();
            }
        }
    }
}

thread_local! {
    /// One slot per tracker this thread has touched. Dropping a slot at thread
    /// exit is what tells the tracker that the thread is gone.
    static THREAD_SLOTS: RefCell<ThreadSlots> =
        const { RefCell::new(ThreadSlots { slots: [EMPTY_SLOT; MAX_TRACKERS_PER_THREAD] }) };

    /// Set while the thread runs tracker code; hooks do nothing while set.
    static IN_TRACKER: Cell<bool> = const { Cell::new(false) };
}

/// Run `f` with this thread's state for `tracker_id`, creating it with
/// `create` on first use.
///
/// Returns `None` when thread-local storage is already torn down (the thread
/// is exiting), every slot is taken, or the state could not be created.
pub(crate) fn with_thread_state<R>(
    tracker_id: u64,
    create: impl FnOnce() -> TrackerResult<ThreadRef>,
    f: impl FnOnce(&ThreadState) -> R,
) -> Option<R> {
    THREAD_SLOTS
        .try_with(|slots| {
            let existing = slots.borrow().find(tracker_id).cloned();

            let state = match existing {
                Some(state) => state,
                None => {
                    let mut slots = slots.borrow_mut();
                    let vacant = slots.slots.iter_mut().find(|slot| slot.is_none())?;
                    let state = create().ok()?;
                    *vacant = Some(ThreadSlot {
                        tracker_id,
                        state: state.clone(),
                    });
                    state
                }
            };
            Some(f(&*state))
        })
        .ok()
        .flatten()
}

/// Like [`with_thread_state`], but never creates a state.
pub(crate) fn with_existing_thread_state<R>(tracker_id: u64, f: impl FnOnce(&ThreadState) -> R) -> Option<R> {
    THREAD_SLOTS
        .try_with(|slots| {
            let state = slots.borrow().find(tracker_id).cloned()?;
            Some(f(&*state))
        })
        .ok()
        .flatten()
}

/// Free this thread's slots for trackers that shut down or were dropped.
///
/// Never called from a hook: dropping the last handle of a dropped tracker's
/// state can release that tracker's arena.
pub(crate) fn release_orphaned_slots() {
    let mut released = ThreadSlots {
        slots: [EMPTY_SLOT; MAX_TRACKERS_PER_THREAD],
    };
    let _ = THREAD_SLOTS.try_with(|slots| {
        slots
            .borrow_mut()
            .take_matching(&mut released, |slot| slot.state.is_orphaned());
    });
    // Handles are dropped here, outside the borrow.
    drop(released);
}

/// Marks the current thread as running tracker code.
///
/// Tracker code allocates through the arena, but host callbacks such as a
/// diagnostic sink may reach the instrumented allocator; the guard turns
/// those nested hook calls into no-ops.
pub(crate) struct ReentrancyGuard {
    _not_send: PhantomData<*const ()>,
}

impl ReentrancyGuard {
    /// Enter tracker code, or `None` if the thread is already inside it (or
    /// is tearing down its thread-locals).
    #[inline]
    pub(crate) fn enter() -> Option<Self> {
        IN_TRACKER
            .try_with(|flag| {
                if flag.replace(true) {
                    None
                } else {
                    Some(Self { _not_send: PhantomData })
                }
            })
            .ok()
            .flatten()
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        let _ = IN_TRACKER.try_with(|flag| flag.set(false));
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tag::{ReferenceSource, TagDeclaration};
    use crate::core::registry::{TagRegistry, TagRegistryBuilder};
    use crate::diagnostics::Reporter;

    fn registry(arena: &Arc<LlmArena>, names: &[&str]) -> TagRegistry {
        let mut builder = TagRegistryBuilder::new();
        for name in names {
            builder.register(&TagDeclaration::new(*name), ReferenceSource::Declared);
        }
        builder.finish_construction(arena.clone(), &Reporter::default()).unwrap()
    }

    #[test]
    fn test_track_keeps_index_order() {
        let arena = Arc::new(LlmArena::default());
        let registry = registry(&arena, &["A", "B", "C", "D"]);
        let tag = |name| registry.find_by_name(name).unwrap();

        let mut table = ThreadTable::new(arena.clone());
        table.track(tag("D"), 40).unwrap();
        table.track(tag("B"), 20).unwrap();
        table.track(tag("C"), 30).unwrap();
        table.track(tag("B"), -5).unwrap();

        let indices: Vec<usize> = table.entries().iter().map(|e| e.tag.index()).collect();
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        assert_eq!(indices, sorted);
        assert_eq!(table.size_of(tag("B")), 15);
        assert_eq!(table.size_of(tag("A")), 0);
    }

    #[test]
    fn test_reentrancy_guard() {
        let guard = ReentrancyGuard::enter().unwrap();
        assert!(ReentrancyGuard::enter().is_none());
        drop(guard);
        assert!(ReentrancyGuard::enter().is_some());
    }

    #[test]
    fn test_thread_state_is_created_once() {
        let arena = Arc::new(LlmArena::default());
        let mut created = 0;
        for _ in 0..3 {
            with_thread_state(
                u64::MAX - 1,
                || {
                    created += 1;
                    ThreadRef::new(arena.clone())
                },
                |_| (),
            )
            .unwrap();
        }
        assert_eq!(created, 1);
        assert!(with_existing_thread_state(u64::MAX - 2, |_| ()).is_none());
    }

    #[test]
    fn test_state_memory_returns_to_arena() {
        let arena = Arc::new(LlmArena::default());
        let state = ThreadRef::new(arena.clone()).unwrap();
        let used = arena.stats().used_bytes;
        assert!(used >= mem::size_of::<ThreadState>());

        let other = state.clone();
        assert!(state.is_shared());
        drop(other);
        assert!(!state.is_shared());

        drop(state);
        assert_eq!(arena.stats().used_bytes, 0);
    }

    #[test]
    fn test_pending_states_detach_all() {
        let arena = Arc::new(LlmArena::default());
        let pending = PendingStates::new();
        let kept = ThreadRef::new(arena.clone()).unwrap();
        pending.push(kept.clone());
        pending.push(ThreadRef::new(arena.clone()).unwrap());

        let taken: Vec<ThreadRef> = pending.take_all().collect();
        assert_eq!(taken.len(), 2);
        assert!(pending.take_all().next().is_none());
        assert!(kept.is_shared());
        drop(taken);
        assert!(!kept.is_shared());
    }

    #[test]
    fn test_orphaned_slots_are_released() {
        std::thread::spawn(|| {
            let arena = Arc::new(LlmArena::default());
            for id in 0..MAX_TRACKERS_PER_THREAD as u64 {
                let entered = with_thread_state(id, || ThreadRef::new(arena.clone()), |state| {
                    state.mark_orphaned();
                });
                assert!(entered.is_some());
            }
            assert!(with_thread_state(99, || ThreadRef::new(arena.clone()), |_| ()).is_none());

            release_orphaned_slots();
            assert!(with_thread_state(99, || ThreadRef::new(arena.clone()), |_| ()).is_some());
            assert!(with_existing_thread_state(0, |_| ()).is_none());
        })
        .join()
        .unwrap();
    }
}
