//! Tag registry: owns every [`TagData`] and resolves the hierarchy.
//!
//! Registration happens in two phases. Before the tracker is built,
//! declarations and enum seeds are collected in a [`TagRegistryBuilder`],
//! where parents are still names and enum tags may be patched. Consuming the
//! builder with [`TagRegistryBuilder::finish_construction`] resolves parents,
//! orders tags parent-before-child and writes the final, immutable records
//! into the arena. After that only new tags can be appended.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::allocators::arena::{ArenaStr, LlmArena};
use crate::api::error::{TrackerError, TrackerResult};
use crate::api::tag::{default_display_name, enum_tag_name, ReferenceSource, TagData, TagDeclaration, TagHandle};
use crate::collections::{LlmArray, LlmMap};
use crate::diagnostics::{Diagnostic, Reporter, LT101, LT102, LT103, LT104};
use crate::util::topo::{topological_order, SortDirection};

/// Name of the bucket for allocations made outside any scope.
pub const UNTAGGED_NAME: &str = "Untagged";

/// Number of possible enum tag values.
pub const ENUM_TAG_COUNT: usize = 256;

/// Parent of a tag during bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TagParent {
    Root,
    Unresolved(String),
    Resolved(TagHandle),
}

impl TagParent {
    fn from_name(name: Option<&str>) -> Self {
        match name {
            Some(name) => TagParent::Unresolved(name.to_owned()),
            None => TagParent::Root,
        }
    }

    fn name(&self) -> Option<&str> {
        match self {
            TagParent::Root => None,
            TagParent::Unresolved(name) => Some(name),
            TagParent::Resolved(handle) => Some(handle.get().name()),
        }
    }
}

/// Mutable form of a tag, only used until construction finishes.
#[derive(Debug, Clone)]
pub(crate) struct TagDataBuilder {
    /// `None` for an enum seed that has not been patched.
    name: Option<String>,
    display_name: String,
    parent: TagParent,
    stat_name: String,
    summary_stat_name: String,
    enum_tag: Option<u8>,
    reference_source: ReferenceSource,
}

impl TagDataBuilder {
    pub(crate) fn from_declaration(decl: &TagDeclaration, reference_source: ReferenceSource) -> Self {
        Self {
            name: Some(decl.name.clone()),
            display_name: decl.resolved_display_name().to_owned(),
            parent: TagParent::from_name(decl.parent.as_deref()),
            stat_name: decl.stat_name.clone().unwrap_or_default(),
            summary_stat_name: decl.summary_stat_name.clone().unwrap_or_default(),
            enum_tag: decl.enum_tag,
            reference_source,
        }
    }

    fn enum_seed(enum_tag: u8) -> Self {
        Self {
            name: None,
            display_name: String::new(),
            parent: TagParent::Root,
            stat_name: String::new(),
            summary_stat_name: String::new(),
            enum_tag: Some(enum_tag),
            reference_source: ReferenceSource::EnumSeed,
        }
    }

    fn matches(&self, decl: &TagDeclaration) -> bool {
        self.display_name == decl.resolved_display_name()
            && self.parent.name() == decl.parent.as_deref()
            && self.stat_name == decl.stat_name.as_deref().unwrap_or("")
            && self.summary_stat_name == decl.summary_stat_name.as_deref().unwrap_or("")
            && self.enum_tag == decl.enum_tag
    }

    /// Write the final record into the arena.
    fn allocate(&self, arena: &LlmArena, index: u32) -> TrackerResult<TagHandle> {
        let parent = match &self.parent {
            TagParent::Resolved(handle) => Some(*handle),
            TagParent::Root => None,
            TagParent::Unresolved(_) => {
                debug_assert!(false, "parent must be resolved before allocation");
                None
            }
        };

        let name = self.name.as_deref().unwrap_or_default();
        let data = TagData {
            name: arena_str(arena, name)?,
            display_name: arena_str(arena, &self.display_name)?,
            stat_name: arena_str(arena, &self.stat_name)?,
            summary_stat_name: arena_str(arena, &self.summary_stat_name)?,
            parent,
            index,
            enum_tag: self.enum_tag,
            reference_source: self.reference_source,
            is_finish_constructed: true,
            conflict_reported: AtomicBool::new(false),
        };

        let ptr = arena
            .alloc(mem::size_of::<TagData>(), mem::align_of::<TagData>())
            .ok_or(TrackerError::OutOfMemory)?
            .cast::<TagData>();
        // SAFETY: fresh, suitably aligned allocation for one `TagData`.
        unsafe { ptr.as_ptr().write(data) };
        Ok(TagHandle::new(ptr))
    }
}

fn arena_str(arena: &LlmArena, value: &str) -> TrackerResult<ArenaStr> {
    arena.alloc_str(value).ok_or(TrackerError::OutOfMemory)
}

/// Collects tag registrations until the tracker is built.
#[derive(Debug, Default)]
pub(crate) struct TagRegistryBuilder {
    entries: Vec<TagDataBuilder>,
    by_name: HashMap<String, usize>,
    by_enum: HashMap<u8, usize>,
    conflicts_reported: HashSet<String>,
    /// Diagnostics raised before a sink is known; flushed on construction.
    pending: Vec<(Diagnostic, String)>,
}

impl TagRegistryBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a fully formed tag.
    ///
    /// Registering the same name again with identical properties is a no-op.
    /// Conflicting properties are reported once and the first definition is
    /// kept.
    pub(crate) fn register(&mut self, decl: &TagDeclaration, source: ReferenceSource) {
        if let Some(&slot) = self.by_name.get(&decl.name) {
            if !self.entries[slot].matches(decl) {
                self.report_conflict(&decl.name);
            }
            return;
        }

        let mut entry = TagDataBuilder::from_declaration(decl, source);
        if let Some(enum_tag) = decl.enum_tag {
            match self.by_enum.get(&enum_tag) {
                Some(&slot) if self.entries[slot].name.is_none() => {
                    // Declaring a seeded enum tag fills in the seed.
                    self.entries[slot] = entry;
                    self.by_name.insert(decl.name.clone(), slot);
                    return;
                }
                Some(_) => {
                    self.pending.push((LT104, decl.name.clone()));
                    entry.enum_tag = None;
                }
                None => {
                    self.by_enum.insert(enum_tag, self.entries.len());
                }
            }
        }

        self.by_name.insert(decl.name.clone(), self.entries.len());
        self.entries.push(entry);
    }

    /// Create an enum tag known only by its value. Seeding twice is a no-op.
    pub(crate) fn seed_enum_tag(&mut self, enum_tag: u8) {
        if !self.by_enum.contains_key(&enum_tag) {
            self.by_enum.insert(enum_tag, self.entries.len());
            self.entries.push(TagDataBuilder::enum_seed(enum_tag));
        }
    }

    /// Give a seeded enum tag its name, display name and parent.
    ///
    /// Seeds the enum value first if needed. Patching again replaces the
    /// previous patch.
    pub(crate) fn patch_enum_tag(&mut self, enum_tag: u8, name: &str, display_name: Option<&str>, parent: Option<&str>) {
        self.seed_enum_tag(enum_tag);
        let slot = self.by_enum[&enum_tag];

        if let Some(&owner) = self.by_name.get(name) {
            if owner != slot {
                self.report_conflict(name);
                return;
            }
        }

        let entry = &mut self.entries[slot];
        if let Some(previous) = entry.name.replace(name.to_owned()) {
            self.by_name.remove(&previous);
        }
        entry.display_name = display_name.unwrap_or_else(|| default_display_name(name)).to_owned();
        entry.parent = TagParent::from_name(parent);
        self.by_name.insert(name.to_owned(), slot);
    }

    /// Number of registrations so far.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn report_conflict(&mut self, name: &str) {
        if self.conflicts_reported.insert(name.to_owned()) {
            self.pending.push((LT101, name.to_owned()));
        }
    }

    /// Resolve parents, sort parent-before-child and write the immutable
    /// records into `arena`.
    ///
    /// Unknown parent names make the tag a root (`LT102`). A parent link that
    /// closes a cycle is dropped (`LT103`). An `Untagged` root is added if no
    /// tag of that name was registered.
    pub(crate) fn finish_construction(mut self, arena: Arc<LlmArena>, reporter: &Reporter) -> TrackerResult<TagRegistry> {
        for (diag, context) in self.pending.drain(..) {
            reporter.report(&diag, Some(&context));
        }

        self.name_enum_seeds(reporter);

        if !self.by_name.contains_key(UNTAGGED_NAME) {
            let untagged = TagDataBuilder::from_declaration(&TagDeclaration::new(UNTAGGED_NAME), ReferenceSource::Implicit);
            self.entries.insert(0, untagged);
            for slot in self.by_name.values_mut().chain(self.by_enum.values_mut()) {
                *slot += 1;
            }
            self.by_name.insert(UNTAGGED_NAME.to_owned(), 0);
        }

        let parent_slots = self.resolve_parent_slots(reporter);
        let sorted = topological_order(self.entries.len(), SortDirection::RootToLeaf, |vertex, edges| {
            if let Some(parent) = parent_slots[vertex] {
                edges.push(parent);
            }
        });

        let mut position = vec![0usize; self.entries.len()];
        for (rank, &slot) in sorted.order.iter().enumerate() {
            position[slot] = rank;
        }

        let mut registry = TagRegistry::new(arena.clone());
        let mut handles: Vec<Option<TagHandle>> = vec![None; self.entries.len()];
        for (rank, &slot) in sorted.order.iter().enumerate() {
            let entry = &mut self.entries[slot];
            entry.parent = match parent_slots[slot] {
                Some(parent) if position[parent] < rank => match handles[parent] {
                    Some(handle) => TagParent::Resolved(handle),
                    None => TagParent::Root,
                },
                Some(_) => {
                    reporter.report(&LT103, entry.name.as_deref());
                    TagParent::Root
                }
                None => TagParent::Root,
            };

            let handle = entry.allocate(&arena, rank as u32)?;
            handles[slot] = Some(handle);
            registry.insert(handle)?;
        }

        registry.untagged = registry.find_by_name(UNTAGGED_NAME);
        Ok(registry)
    }

    /// Unpatched seeds are named `EnumTag<N>`. A seed whose generated name
    /// is taken is dropped.
    fn name_enum_seeds(&mut self, reporter: &Reporter) {
        let mut dropped = Vec::new();
        for slot in 0..self.entries.len() {
            let Some(enum_tag) = self.entries[slot].enum_tag else { continue };
            if self.entries[slot].name.is_some() {
                continue;
            }
            let name = enum_tag_name(enum_tag);
            if self.by_name.contains_key(&name) {
                reporter.report(&LT101, Some(&name));
                dropped.push(slot);
                continue;
            }
            self.entries[slot].display_name = name.clone();
            self.entries[slot].name = Some(name.clone());
            self.by_name.insert(name, slot);
        }

        if dropped.is_empty() {
            return;
        }
        for &slot in dropped.iter().rev() {
            self.entries.remove(slot);
        }
        self.reindex();
    }

    fn reindex(&mut self) {
        self.by_name.clear();
        self.by_enum.clear();
        for (slot, entry) in self.entries.iter().enumerate() {
            if let Some(name) = &entry.name {
                self.by_name.insert(name.clone(), slot);
            }
            if let Some(enum_tag) = entry.enum_tag {
                self.by_enum.insert(enum_tag, slot);
            }
        }
    }

    fn resolve_parent_slots(&self, reporter: &Reporter) -> Vec<Option<usize>> {
        let mut missing_reported = HashSet::new();
        self.entries
            .iter()
            .map(|entry| match &entry.parent {
                TagParent::Root | TagParent::Resolved(_) => None,
                TagParent::Unresolved(parent) => {
                    let slot = self.by_name.get(parent).copied();
                    if slot.is_none() && missing_reported.insert(parent.as_str()) {
                        reporter.report(&LT102, Some(parent));
                    }
                    slot
                }
            })
            .collect()
    }
}

/// The constructed registry.
///
/// Tags are stored in index order. Records are never moved or freed while
/// the arena is alive.
pub(crate) struct TagRegistry {
    arena: Arc<LlmArena>,
    tags: LlmArray<TagHandle>,
    by_name: LlmMap<ArenaStr, TagHandle, ()>,
    by_enum: [Option<TagHandle>; ENUM_TAG_COUNT],
    untagged: Option<TagHandle>,
}

impl TagRegistry {
    fn new(arena: Arc<LlmArena>) -> Self {
        Self {
            tags: LlmArray::new(arena.clone()),
            by_name: LlmMap::new(arena.clone()),
            by_enum: [None; ENUM_TAG_COUNT],
            untagged: None,
            arena,
        }
    }

    fn insert(&mut self, handle: TagHandle) -> TrackerResult<()> {
        debug_assert_eq!(handle.index(), self.tags.len());
        let data = handle.get();
        self.tags.push(handle)?;
        self.by_name.add(data.name, handle, ())?;
        if let Some(enum_tag) = data.enum_tag {
            self.by_enum[enum_tag as usize] = Some(handle);
        }
        Ok(())
    }

    /// Register a tag after construction.
    ///
    /// Returns the existing tag if the name is known. New tags may not claim
    /// an enum value and get the next free index, after their parent.
    pub(crate) fn register(&mut self, decl: &TagDeclaration, source: ReferenceSource, reporter: &Reporter) -> TrackerResult<TagHandle> {
        if let Some(existing) = self.find_by_name(&decl.name) {
            let data = existing.get();
            if source == ReferenceSource::Declared
                && !data.matches(decl)
                && !data.conflict_reported.swap(true, Ordering::Relaxed)
            {
                reporter.report(&LT101, Some(&decl.name));
            }
            return Ok(existing);
        }

        if decl.enum_tag.is_some() {
            return Err(TrackerError::AlreadyConstructed);
        }

        let mut entry = TagDataBuilder::from_declaration(decl, source);
        entry.parent = match decl.parent.as_deref() {
            None => TagParent::Root,
            Some(parent) => match self.find_by_name(parent) {
                Some(handle) => TagParent::Resolved(handle),
                None => {
                    reporter.report(&LT102, Some(parent));
                    TagParent::Root
                }
            },
        };

        let handle = entry.allocate(&self.arena, self.tags.len() as u32)?;
        self.insert(handle)?;
        Ok(handle)
    }

    pub(crate) fn find_by_name(&self, name: &str) -> Option<TagHandle> {
        self.by_name.find(name).map(|(handle, _)| *handle)
    }

    #[cfg(test)]
    pub(crate) fn find_by_enum(&self, enum_tag: u8) -> Option<TagHandle> {
        self.by_enum[enum_tag as usize]
    }

    /// Snapshot of the enum table. Enum tags are fixed at construction.
    pub(crate) fn enum_table(&self) -> [Option<TagHandle>; ENUM_TAG_COUNT] {
        self.by_enum
    }

    pub(crate) fn tag(&self, index: usize) -> Option<TagHandle> {
        self.tags.get(index).copied()
    }

    pub(crate) fn untagged(&self) -> TagHandle {
        match self.untagged {
            Some(handle) => handle,
            None => self.tags[0],
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.tags.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = TagHandle> + '_ {
        self.tags.iter().copied()
    }
}
