//! The tracker facade.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::allocators::arena::LlmArena;
use crate::api::config::{TagStorage, TrackerConfig};
use crate::api::error::{TrackerError, TrackerResult};
use crate::api::report::{TrackerReport, TrackerTagSizeData};
use crate::api::scope::TagScope;
use crate::api::tag::{ReferenceSource, TagData, TagDeclaration, TagHandle};
use crate::collections::{Address, LlmArray};
use crate::core::alloc_map::AllocationMap;
use crate::core::global::GlobalTracker;
use crate::core::registry::{TagRegistry, TagRegistryBuilder, ENUM_TAG_COUNT};
use crate::core::thread::{
    release_orphaned_slots, with_existing_thread_state, with_thread_state, PendingStates, ReentrancyGuard,
    ThreadRef, ThreadState,
};
use crate::diagnostics::{DiagnosticSink, Reporter, LT201, LT202, LT901};
use crate::sync::mutex::Mutex;

static NEXT_TRACKER_ID: AtomicU64 = AtomicU64::new(1);

/// Name of the tag that reports the tracker's own memory, if declared.
pub const OVERHEAD_TAG_NAME: &str = "Tracker";

struct MergeState {
    global: GlobalTracker,
    threads: LlmArray<ThreadRef>,
}

/// Attributes allocations to a hierarchy of tags.
///
/// The host's allocator calls the hooks ([`on_alloc`](Self::on_alloc),
/// [`on_free`](Self::on_free), ...), instrumented code marks what it is doing
/// with [`scope`](Self::scope), and a reporting tick calls
/// [`update`](Self::update) to fold per-thread numbers into global totals.
///
/// Hooks only touch the calling thread's state (and an allocation map shard),
/// never a global lock. All of the tracker's own bookkeeping lives in a
/// private arena that gets its memory straight from the OS.
///
/// Build one with [`TrackerBuilder`](crate::TrackerBuilder) or
/// [`LowLevelTracker::initialize`].
pub struct LowLevelTracker {
    id: u64,
    config: TrackerConfig,
    enabled: AtomicBool,
    arena: Arc<LlmArena>,
    registry: Mutex<TagRegistry>,
    enum_table: [Option<TagHandle>; ENUM_TAG_COUNT],
    untagged: TagHandle,
    overhead_tag: Option<TagHandle>,
    merge: Mutex<MergeState>,
    /// Threads that touched the tracker since the last merge.
    pending_threads: PendingStates,
    allocation_map: Option<AllocationMap>,
    reporter: Reporter,
    exhausted: AtomicBool,
    unknown_enum_reported: [AtomicBool; ENUM_TAG_COUNT],
}

impl LowLevelTracker {
    pub(crate) fn from_parts(
        config: TrackerConfig,
        tags: TagRegistryBuilder,
        sink: Option<Arc<dyn DiagnosticSink>>,
    ) -> TrackerResult<Self> {
        release_orphaned_slots();
        let reporter = Reporter::new(sink);
        let arena = Arc::new(LlmArena::with_limit(config.arena_page_size, config.arena_limit));

        let registry = match tags.finish_construction(arena.clone(), &reporter) {
            Ok(registry) => registry,
            Err(err) => {
                if err == TrackerError::OutOfMemory {
                    reporter.report_quiet(&LT901, None);
                }
                return Err(err);
            }
        };

        let allocation_map = config
            .allocation_map
            .then(|| AllocationMap::new(arena.clone(), config.allocation_map_shards));

        Ok(Self {
            id: NEXT_TRACKER_ID.fetch_add(1, Ordering::Relaxed),
            enabled: AtomicBool::new(config.enabled),
            enum_table: registry.enum_table(),
            untagged: registry.untagged(),
            overhead_tag: registry.find_by_name(OVERHEAD_TAG_NAME),
            merge: Mutex::new(MergeState {
                global: GlobalTracker::new(arena.clone(), config.track_peaks),
                threads: LlmArray::new(arena.clone()),
            }),
            registry: Mutex::new(registry),
            pending_threads: PendingStates::new(),
            allocation_map,
            reporter,
            exhausted: AtomicBool::new(false),
            unknown_enum_reported: std::array::from_fn(|_| AtomicBool::new(false)),
            arena,
            config,
        })
    }

    /// Build a tracker from declarations in one call.
    pub fn initialize(config: TrackerConfig, tags: impl IntoIterator<Item = TagDeclaration>) -> TrackerResult<Self> {
        crate::api::builder::TrackerBuilder::new(config).declare_tags(tags).build()
    }

    /// The configuration the tracker was built with.
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Whether hooks currently record anything.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Switch tracking on or off. A tracker whose arena ran out of memory
    /// stays off.
    pub fn set_enabled(&self, enabled: bool) {
        let enabled = enabled && !self.exhausted.load(Ordering::Relaxed);
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Merge every thread one last time and stop tracking.
    ///
    /// Afterwards hooks are no-ops and [`report`](Self::report) returns `None`.
    pub fn shutdown(&self) {
        self.update();
        self.enabled.store(false, Ordering::Relaxed);

        let _guard = ReentrancyGuard::enter();
        let mut merge = self.merge.lock();
        for state in self.pending_threads.take_all() {
            state.mark_orphaned();
        }
        while let Some(state) = merge.threads.pop() {
            state.mark_orphaned();
        }
        drop(merge);
        release_orphaned_slots();
    }

    // ------------------------------------------------------------------
    // Allocation hooks
    // ------------------------------------------------------------------

    /// Record an allocation charged to the thread's active tag.
    #[inline]
    pub fn on_alloc(&self, ptr: *const u8, size: usize) {
        if !self.is_enabled() || ptr.is_null() {
            return;
        }
        let Some(_guard) = ReentrancyGuard::enter() else { return };
        self.track_alloc(ptr, size, None);
    }

    /// Record an allocation charged to `tag`, whatever scope is active.
    ///
    /// `tag` must belong to this tracker.
    #[inline]
    pub fn on_alloc_tagged(&self, ptr: *const u8, size: usize, tag: &TagData) {
        if !self.is_enabled() || ptr.is_null() {
            return;
        }
        let Some(_guard) = ReentrancyGuard::enter() else { return };
        self.track_alloc(ptr, size, Some(TagHandle::from_ref(tag)));
    }

    /// Record a free.
    ///
    /// With the allocation map, the recorded tag and size are used and `size`
    /// is ignored; unknown pointers are ignored. Without it, `size` is
    /// charged back to the thread's active tag.
    #[inline]
    pub fn on_free(&self, ptr: *const u8, size: usize) {
        if !self.is_enabled() || ptr.is_null() {
            return;
        }
        let Some(_guard) = ReentrancyGuard::enter() else { return };

        let explicit = match &self.allocation_map {
            Some(map) => match map.remove(Address::of(ptr)) {
                Some((tag, recorded)) => Some((tag, recorded as i64)),
                None => return,
            },
            None => None,
        };

        let result = self.with_local(|state| {
            let mut inner = state.lock();
            let (tag, size) = match explicit {
                Some(found) => found,
                None => {
                    let active = inner.scopes.last().copied().unwrap_or(self.untagged);
                    (self.storage_tag(active), size as i64)
                }
            };
            inner.table.track(tag, -size)
        });
        self.check(result);
    }

    /// Record a reallocation from `old_ptr` to `new_ptr`.
    ///
    /// The memory stays charged to the tag that owned it, when known.
    #[inline]
    pub fn on_realloc(&self, old_ptr: *const u8, old_size: usize, new_ptr: *const u8, new_size: usize) {
        let detached = self.detach_allocation(old_ptr);
        self.finish_realloc(detached, old_ptr, old_size, new_ptr, new_size);
    }

    /// Take `ptr`'s allocation map entry before the block is handed back to
    /// the inner allocator, so a concurrent allocation reusing the address
    /// cannot have its entry removed by us.
    pub(crate) fn detach_allocation(&self, ptr: *const u8) -> Option<(TagHandle, u64)> {
        if !self.is_enabled() || ptr.is_null() {
            return None;
        }
        let map = self.allocation_map.as_ref()?;
        let _guard = ReentrancyGuard::enter()?;
        map.remove(Address::of(ptr))
    }

    /// Second half of [`on_realloc`](Self::on_realloc), given the entry
    /// taken by [`detach_allocation`](Self::detach_allocation).
    pub(crate) fn finish_realloc(
        &self,
        detached: Option<(TagHandle, u64)>,
        old_ptr: *const u8,
        old_size: usize,
        new_ptr: *const u8,
        new_size: usize,
    ) {
        if !self.is_enabled() {
            return;
        }
        if old_ptr.is_null() {
            self.on_alloc(new_ptr, new_size);
            return;
        }
        let Some(_guard) = ReentrancyGuard::enter() else { return };

        if new_ptr.is_null() {
            // Failed realloc: the old block is untouched.
            if let (Some(map), Some((tag, size))) = (&self.allocation_map, detached) {
                let result = map.insert(Address::of(old_ptr), tag, size);
                self.check(Some(result));
            }
            return;
        }

        let result = self.with_local(|state| {
            let mut inner = state.lock();
            let (tag, delta) = match detached {
                Some((tag, recorded)) => (tag, new_size as i64 - recorded as i64),
                None if self.allocation_map.is_some() => {
                    // Old block was never recorded: treat as a fresh allocation.
                    let active = inner.scopes.last().copied().unwrap_or(self.untagged);
                    (self.storage_tag(active), new_size as i64)
                }
                None => {
                    let active = inner.scopes.last().copied().unwrap_or(self.untagged);
                    (self.storage_tag(active), new_size as i64 - old_size as i64)
                }
            };
            inner.table.track(tag, delta)?;
            drop(inner);
            if let Some(map) = &self.allocation_map {
                map.insert(Address::of(new_ptr), tag, new_size as u64)?;
            }
            Ok(())
        });
        self.check(result);
    }

    fn track_alloc(&self, ptr: *const u8, size: usize, explicit: Option<TagHandle>) {
        let result = self.with_local(|state| {
            let mut inner = state.lock();
            let active = explicit.unwrap_or_else(|| inner.scopes.last().copied().unwrap_or(self.untagged));
            let tag = self.storage_tag(active);
            inner.table.track(tag, size as i64)?;
            drop(inner);
            if let Some(map) = &self.allocation_map {
                map.insert(Address::of(ptr), tag, size as u64)?;
            }
            Ok(())
        });
        self.check(result);
    }

    /// The tag an allocation under `active` is charged to.
    #[inline]
    fn storage_tag(&self, active: TagHandle) -> TagHandle {
        match self.config.tag_storage {
            TagStorage::Full => active,
            TagStorage::EnumOnly => active
                .get()
                .ancestors()
                .find(|tag| tag.has_enum_tag())
                .map(TagHandle::from_ref)
                .unwrap_or(self.untagged),
        }
    }

    fn new_thread_state(&self) -> TrackerResult<ThreadRef> {
        match ThreadRef::new(self.arena.clone()) {
            Ok(state) => {
                self.pending_threads.push(state.clone());
                Ok(state)
            }
            Err(err) => {
                self.fail(err.clone());
                Err(err)
            }
        }
    }

    /// Run `f` on this thread's state. Callers outside hooks get the
    /// reentrancy guard here.
    fn with_local<R>(&self, f: impl FnOnce(&ThreadState) -> TrackerResult<R>) -> Option<TrackerResult<R>> {
        let _guard = ReentrancyGuard::enter();
        with_thread_state(self.id, || self.new_thread_state(), f)
    }

    fn check<R>(&self, result: Option<TrackerResult<R>>) -> Option<R> {
        match result? {
            Ok(value) => Some(value),
            Err(err) => {
                self.fail(err);
                None
            }
        }
    }

    fn fail(&self, err: TrackerError) {
        if err == TrackerError::OutOfMemory {
            self.enabled.store(false, Ordering::Relaxed);
            if !self.exhausted.swap(true, Ordering::Relaxed) {
                self.reporter.report_quiet(&LT901, None);
            }
        }
    }

    // ------------------------------------------------------------------
    // Scopes
    // ------------------------------------------------------------------

    /// Make `tag` the active tag until the returned guard is dropped.
    ///
    /// `tag` must belong to this tracker.
    pub fn scope(&self, tag: &TagData) -> TagScope<'_> {
        TagScope::enter(self, TagHandle::from_ref(tag))
    }

    /// Scope by enum value. Unknown values fall back to `Untagged` after
    /// reporting `LT201` (and asserting in debug builds).
    pub fn scope_enum(&self, enum_tag: u8) -> TagScope<'_> {
        match self.try_scope_enum(enum_tag) {
            Ok(scope) => scope,
            Err(_) => {
                if !self.unknown_enum_reported[enum_tag as usize].swap(true, Ordering::Relaxed) {
                    self.reporter.report(&LT201, Some(&enum_tag.to_string()));
                }
                debug_assert!(false, "tag scope entered with unregistered enum tag {}", enum_tag);
                TagScope::enter(self, self.untagged)
            }
        }
    }

    /// Scope by enum value, failing for unknown values.
    pub fn try_scope_enum(&self, enum_tag: u8) -> TrackerResult<TagScope<'_>> {
        let tag = self.enum_table[enum_tag as usize].ok_or(TrackerError::UnknownEnumTag(enum_tag))?;
        Ok(TagScope::enter(self, tag))
    }

    /// Scope by name, registering the tag on first use.
    ///
    /// A new tag's parent is the tag named by everything before the last `/`
    /// of `name`, if that tag exists; otherwise the new tag is a root.
    pub fn scope_by_name(&self, name: &str) -> TagScope<'_> {
        let tag = match self.find_or_register_by_name(name) {
            Ok(tag) => tag,
            Err(err) => {
                self.fail(err);
                self.untagged
            }
        };
        TagScope::enter(self, tag)
    }

    fn find_or_register_by_name(&self, name: &str) -> TrackerResult<TagHandle> {
        let _guard = ReentrancyGuard::enter();
        let mut registry = self.registry.lock();
        if let Some(tag) = registry.find_by_name(name) {
            return Ok(tag);
        }
        let mut decl = TagDeclaration::new(name);
        if let Some(pos) = name.rfind('/') {
            let parent = &name[..pos];
            if registry.find_by_name(parent).is_some() {
                decl = decl.with_parent(parent);
            }
        }
        registry.register(&decl, ReferenceSource::ScopeByName, &self.reporter)
    }

    /// Run `f` with `tag` active.
    pub fn with_scope<R>(&self, tag: &TagData, f: impl FnOnce() -> R) -> R {
        let _scope = self.scope(tag);
        f()
    }

    /// The current thread's active tag (`Untagged` outside any scope).
    pub fn active_tag(&self) -> &TagData {
        let _guard = ReentrancyGuard::enter();
        with_existing_thread_state(self.id, |state| state.lock().scopes.last().copied())
            .flatten()
            .unwrap_or(self.untagged)
            .get()
    }

    pub(crate) fn push_scope(&self, tag: TagHandle) -> bool {
        let result = self.with_local(|state| state.lock().scopes.push(tag));
        self.check(result).is_some()
    }

    pub(crate) fn pop_scope(&self, tag: TagHandle) {
        let popped_in_order = self.with_local(|state| {
            let mut inner = state.lock();
            if inner.scopes.last() == Some(&tag) {
                inner.scopes.pop();
                return Ok(true);
            }
            if let Some(pos) = inner.scopes.iter().rposition(|&scope| scope == tag) {
                inner.scopes.remove(pos);
            }
            Ok(false)
        });

        if let Some(Ok(false)) = popped_in_order {
            self.reporter.report(&LT202, Some(tag.get().name()));
            debug_assert!(false, "tag scopes released out of order ({})", tag.get().name());
        }
    }

    // ------------------------------------------------------------------
    // Tags
    // ------------------------------------------------------------------

    /// The bucket for allocations made outside any scope.
    pub fn untagged(&self) -> &TagData {
        self.untagged.get()
    }

    /// Look up a tag by name.
    pub fn find_tag(&self, name: &str) -> Option<&TagData> {
        self.registry.lock().find_by_name(name).map(TagHandle::get)
    }

    /// Look up a tag by enum value.
    pub fn find_enum_tag(&self, enum_tag: u8) -> Option<&TagData> {
        self.enum_table[enum_tag as usize].map(TagHandle::get)
    }

    /// Look up a tag by index.
    pub fn tag_by_index(&self, index: usize) -> Option<&TagData> {
        self.registry.lock().tag(index).map(TagHandle::get)
    }

    /// Number of registered tags.
    pub fn tag_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Every tag, in index order.
    pub fn tags(&self) -> Vec<&TagData> {
        let registry = self.registry.lock();
        registry.iter().map(TagHandle::get).collect()
    }

    /// Register a tag after construction.
    ///
    /// Returns the existing tag when the name is known (reporting `LT101`
    /// once if the properties differ). New tags cannot claim an enum value.
    pub fn register_tag(&self, decl: TagDeclaration) -> TrackerResult<&TagData> {
        let _guard = ReentrancyGuard::enter();
        let mut registry = self.registry.lock();
        match registry.register(&decl, ReferenceSource::Declared, &self.reporter) {
            Ok(tag) => Ok(tag.get()),
            Err(err) => {
                drop(registry);
                self.fail(err.clone());
                Err(err)
            }
        }
    }

    // ------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------

    /// Fold every thread's deltas into the global totals and update peaks.
    ///
    /// Threads that have exited are dropped after their final merge.
    pub fn update(&self) {
        if !self.is_enabled() {
            return;
        }
        let _guard = ReentrancyGuard::enter();
        let mut merge = self.merge.lock();
        let MergeState { global, threads } = &mut *merge;

        let mut result = Ok(());
        for state in self.pending_threads.take_all() {
            let kept = threads
                .reserve(threads.len() + 1)
                .and_then(|()| threads.push(state.clone()));
            if let Err(err) = kept {
                self.pending_threads.push(state);
                result = Err(err);
            }
        }

        let mut index = 0;
        while index < threads.len() {
            // Only this list still references the state of an exited thread,
            // and an exited thread cannot add deltas after this check.
            let alive = threads[index].is_shared();
            let merged = global.merge_thread(&mut threads[index].lock().table);
            if let Err(err) = merged {
                result = Err(err);
                index += 1;
            } else if alive {
                index += 1;
            } else {
                threads.swap_remove(index);
            }
        }

        if result.is_ok() {
            if let Some(overhead) = self.overhead_tag {
                let reserved = self.arena.stats().reserved_bytes as i64;
                result = global.set_external_amount(overhead, reserved, true);
            }
        }

        global.update_peaks();
        drop(merge);

        if let Err(err) = result {
            self.fail(err);
        }
    }

    /// Snapshot of every tag as of the last [`update`](Self::update).
    ///
    /// `None` while the tracker is disabled.
    pub fn report(&self) -> Option<TrackerReport> {
        if !self.is_enabled() {
            return None;
        }
        let merge = self.merge.lock();
        let registry = self.registry.lock();
        let live = self.allocation_map.as_ref().map(AllocationMap::len);
        Some(TrackerReport::build(
            &registry,
            &merge.global,
            self.overhead_tag.map(TagHandle::index),
            self.arena.stats(),
            live,
        ))
    }

    /// Hierarchical text listing of the last report.
    pub fn dump(&self) -> Option<String> {
        self.report().map(|report| report.dump())
    }

    /// Global numbers for `tag` as of the last update.
    pub fn tag_size(&self, tag: &TagData) -> TrackerTagSizeData {
        self.merge.lock().global.size_data(TagHandle::from_ref(tag))
    }

    /// Bytes charged to `tag` on the current thread since the last merge.
    pub fn thread_tag_size(&self, tag: &TagData) -> i64 {
        let handle = TagHandle::from_ref(tag);
        let _guard = ReentrancyGuard::enter();
        with_existing_thread_state(self.id, |state| state.lock().table.size_of(handle)).unwrap_or(0)
    }

    /// Report memory for `tag` that a subsystem manages itself.
    ///
    /// With `add_to_total` the amount replaces the tag's instrumented size in
    /// totals and peaks; otherwise it is only shown alongside it.
    pub fn set_external_amount(&self, tag: &TagData, amount: i64, add_to_total: bool) -> TrackerResult<()> {
        if !self.is_enabled() {
            return Err(TrackerError::Disabled);
        }
        let _guard = ReentrancyGuard::enter();
        let result = self
            .merge
            .lock()
            .global
            .set_external_amount(TagHandle::from_ref(tag), amount, add_to_total);
        if let Err(err) = &result {
            self.fail(err.clone());
        }
        result
    }

    /// Remove an external amount set with [`set_external_amount`](Self::set_external_amount).
    pub fn clear_external_amount(&self, tag: &TagData) {
        self.merge
            .lock()
            .global
            .clear_external_amount(TagHandle::from_ref(tag));
    }

    /// Give unused bookkeeping memory back to the arena.
    pub fn trim(&self) {
        let _guard = ReentrancyGuard::enter();
        if let Some(map) = &self.allocation_map {
            if let Err(err) = map.trim() {
                self.fail(err);
            }
        }
    }
}

impl Drop for LowLevelTracker {
    fn drop(&mut self) {
        let _guard = ReentrancyGuard::enter();
        for state in self.pending_threads.take_all() {
            state.mark_orphaned();
        }
        for state in self.merge.get_mut().threads.iter() {
            state.mark_orphaned();
        }
        release_orphaned_slots();
    }
}

impl std::fmt::Debug for LowLevelTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LowLevelTracker")
            .field("id", &self.id)
            .field("enabled", &self.is_enabled())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

static GLOBAL_TRACKER: OnceLock<LowLevelTracker> = OnceLock::new();

/// Install the process-wide tracker used by
/// [`TrackingAllocator`](crate::TrackingAllocator).
///
/// Can only happen once; a second call hands the tracker back.
pub fn install_global(tracker: LowLevelTracker) -> Result<&'static LowLevelTracker, LowLevelTracker> {
    let mut candidate = Some(tracker);
    let installed = GLOBAL_TRACKER.get_or_init(|| match candidate.take() {
        Some(tracker) => tracker,
        None => unreachable!("initializer runs at most once"),
    });
    match candidate {
        Some(rejected) => Err(rejected),
        None => Ok(installed),
    }
}

/// The process-wide tracker, if installed.
#[inline]
pub fn global() -> Option<&'static LowLevelTracker> {
    GLOBAL_TRACKER.get()
}
