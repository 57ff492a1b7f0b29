//! Tag records and declarations.
//!
//! A tag is a named bucket that allocations are charged to. Tags form a
//! hierarchy ("Rendering" > "Rendering/Textures") that reporting rolls up.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::AtomicBool;

use crate::allocators::arena::ArenaStr;
use crate::collections::hash::LlmHash;

/// Where a tag's registration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceSource {
    /// Declared up front with a [`TagDeclaration`].
    Declared,
    /// Created on first use of a scope by name.
    ScopeByName,
    /// Created by the tracker itself (the untagged bucket).
    Implicit,
    /// A built-in enum tag seeded on the builder.
    EnumSeed,
}

/// One node of the tag hierarchy.
///
/// `TagData` lives in the tracker's arena and is immutable once the tracker
/// is built. References to it are valid for as long as the tracker is.
pub struct TagData {
    pub(crate) name: ArenaStr,
    pub(crate) display_name: ArenaStr,
    pub(crate) stat_name: ArenaStr,
    pub(crate) summary_stat_name: ArenaStr,
    pub(crate) parent: Option<TagHandle>,
    pub(crate) index: u32,
    pub(crate) enum_tag: Option<u8>,
    pub(crate) reference_source: ReferenceSource,
    pub(crate) is_finish_constructed: bool,
    /// Set once a conflicting re-registration has been reported.
    pub(crate) conflict_reported: AtomicBool,
}

impl TagData {
    /// Unique tag name.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Human-readable name.
    pub fn display_name(&self) -> &str {
        self.display_name.as_str()
    }

    /// Label for external stat reporting.
    pub fn stat_name(&self) -> &str {
        self.stat_name.as_str()
    }

    /// Label of the summary stat this tag contributes to.
    pub fn summary_stat_name(&self) -> &str {
        self.summary_stat_name.as_str()
    }

    /// Dense position in parent-before-child order.
    pub fn index(&self) -> usize {
        self.index as usize
    }

    /// The parent tag, if any.
    pub fn parent(&self) -> Option<&TagData> {
        self.parent.map(|parent| parent.get())
    }

    /// Built-in enum value, if this is an enum tag.
    pub fn enum_tag(&self) -> Option<u8> {
        self.enum_tag
    }

    /// Whether this is an enum tag.
    pub fn has_enum_tag(&self) -> bool {
        self.enum_tag.is_some()
    }

    /// How the tag came to be registered.
    pub fn reference_source(&self) -> ReferenceSource {
        self.reference_source
    }

    /// Whether the tag went through construction (always true once visible).
    pub fn is_finish_constructed(&self) -> bool {
        self.is_finish_constructed
    }

    /// Iterate over the tag and its ancestors, starting with the tag itself.
    pub fn ancestors(&self) -> Ancestors<'_> {
        Ancestors { next: Some(self) }
    }

    /// Number of ancestors.
    pub fn depth(&self) -> usize {
        self.ancestors().count() - 1
    }

    /// Display names from the root down to this tag, joined with `/`.
    pub fn display_path(&self) -> String {
        let mut names: Vec<&str> = self.ancestors().map(TagData::display_name).collect();
        names.reverse();
        names.join("/")
    }

    /// Enum value of the nearest ancestor-or-self that has one.
    pub fn containing_enum(&self) -> Option<u8> {
        self.ancestors().find_map(TagData::enum_tag)
    }

    /// Whether a declaration describes this tag exactly.
    pub(crate) fn matches(&self, decl: &TagDeclaration) -> bool {
        let parent = self.parent().map(TagData::name);
        self.display_name() == decl.resolved_display_name()
            && parent == decl.parent.as_deref()
            && self.stat_name() == decl.stat_name.as_deref().unwrap_or("")
            && self.summary_stat_name() == decl.summary_stat_name.as_deref().unwrap_or("")
            && self.enum_tag == decl.enum_tag
    }
}

impl fmt::Debug for TagData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagData")
            .field("name", &self.name())
            .field("display_name", &self.display_name())
            .field("parent", &self.parent().map(TagData::name))
            .field("index", &self.index)
            .field("enum_tag", &self.enum_tag)
            .field("reference_source", &self.reference_source)
            .finish()
    }
}

impl PartialEq for TagData {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Eq for TagData {}

/// Iterator over a tag and its ancestors.
pub struct Ancestors<'a> {
    next: Option<&'a TagData>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a TagData;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.parent();
        Some(current)
    }
}

/// Non-owning pointer to a [`TagData`] in the tracker arena.
///
/// Every holder of a handle also holds the arena (directly or through the
/// tracker), and tag records are never freed before the arena, so
/// dereferencing is always valid.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct TagHandle(NonNull<TagData>);

// SAFETY: `TagData` is immutable after construction apart from an atomic flag.
unsafe impl Send for TagHandle {}
unsafe impl Sync for TagHandle {}

impl TagHandle {
    pub(crate) fn new(data: NonNull<TagData>) -> Self {
        Self(data)
    }

    pub(crate) fn from_ref(data: &TagData) -> Self {
        Self(NonNull::from(data))
    }

    #[inline]
    pub(crate) fn get<'a>(self) -> &'a TagData {
        // SAFETY: see the type documentation.
        unsafe { &*self.0.as_ptr() }
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.get().index()
    }
}

impl LlmHash for TagHandle {
    #[inline]
    fn llm_hash(&self) -> u32 {
        self.get().index
    }
}

impl fmt::Debug for TagHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TagHandle({})", self.get().name())
    }
}

/// Description of a tag, as passed to the tracker builder or registered
/// at runtime.
///
/// ```
/// use tagtrack::TagDeclaration;
///
/// let decl = TagDeclaration::new("Rendering/Textures")
///     .with_parent("Rendering")
///     .with_stat_name("STAT_TexturesLLM");
/// assert_eq!(decl.resolved_display_name(), "Textures");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagDeclaration {
    pub(crate) name: String,
    pub(crate) display_name: Option<String>,
    pub(crate) parent: Option<String>,
    pub(crate) stat_name: Option<String>,
    pub(crate) summary_stat_name: Option<String>,
    pub(crate) enum_tag: Option<u8>,
}

impl TagDeclaration {
    /// Declare a root tag called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            parent: None,
            stat_name: None,
            summary_stat_name: None,
            enum_tag: None,
        }
    }

    /// Builder pattern: set the display name.
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    /// Builder pattern: set the parent tag by name.
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Builder pattern: set the stat name.
    pub fn with_stat_name(mut self, stat_name: impl Into<String>) -> Self {
        self.stat_name = Some(stat_name.into());
        self
    }

    /// Builder pattern: set the summary stat name.
    pub fn with_summary_stat_name(mut self, summary_stat_name: impl Into<String>) -> Self {
        self.summary_stat_name = Some(summary_stat_name.into());
        self
    }

    /// Builder pattern: give the tag a built-in enum value.
    pub fn with_enum_tag(mut self, enum_tag: u8) -> Self {
        self.enum_tag = Some(enum_tag);
        self
    }

    /// Tag name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parent name, if any.
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// Display name, defaulting to the text after the last `/` of the name.
    pub fn resolved_display_name(&self) -> &str {
        match &self.display_name {
            Some(display_name) => display_name,
            None => default_display_name(&self.name),
        }
    }
}

/// Text after the last `/`.
pub(crate) fn default_display_name(name: &str) -> &str {
    match name.rfind('/') {
        Some(pos) => &name[pos + 1..],
        None => name,
    }
}

/// Name of an enum tag that was seeded but never given a name.
pub(crate) fn enum_tag_name(enum_tag: u8) -> String {
    format!("EnumTag{}", enum_tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_display_name() {
        assert_eq!(default_display_name("Root/Child1/Grandchild"), "Grandchild");
        assert_eq!(default_display_name("Audio"), "Audio");
        assert_eq!(default_display_name("Trailing/"), "");
    }

    #[test]
    fn test_declaration_builder() {
        let decl = TagDeclaration::new("Audio/Voices")
            .with_display_name("Voice Data")
            .with_parent("Audio")
            .with_summary_stat_name("STATGROUP_Audio")
            .with_enum_tag(7);
        assert_eq!(decl.name(), "Audio/Voices");
        assert_eq!(decl.parent(), Some("Audio"));
        assert_eq!(decl.resolved_display_name(), "Voice Data");
        assert_eq!(decl.enum_tag, Some(7));
    }

    #[test]
    fn test_enum_tag_name() {
        assert_eq!(enum_tag_name(12), "EnumTag12");
    }
}
