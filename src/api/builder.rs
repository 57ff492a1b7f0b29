//! Tracker construction.

use std::sync::Arc;

use crate::api::config::TrackerConfig;
use crate::api::error::TrackerResult;
use crate::api::tag::{ReferenceSource, TagDeclaration};
use crate::api::tracker::{LowLevelTracker, OVERHEAD_TAG_NAME};
use crate::core::registry::{TagRegistryBuilder, UNTAGGED_NAME};
use crate::diagnostics::DiagnosticSink;

/// Enum values of the built-in tags added by
/// [`TrackerBuilder::with_default_tags`].
pub mod default_tags {
    /// Allocations outside any scope.
    pub const UNTAGGED: u8 = 0;
    /// The tracker's own bookkeeping memory.
    pub const TRACKER: u8 = 1;
    /// Engine code with no better home.
    pub const ENGINE_MISC: u8 = 2;
    /// Rendering.
    pub const RENDERING: u8 = 3;
    /// Texture data, under rendering.
    pub const TEXTURES: u8 = 4;
    /// Meshes, under rendering.
    pub const MESHES: u8 = 5;
    /// Audio.
    pub const AUDIO: u8 = 6;
    /// Physics.
    pub const PHYSICS: u8 = 7;
    /// Networking.
    pub const NETWORKING: u8 = 8;
    /// User interface.
    pub const UI: u8 = 9;
    /// Loaded assets.
    pub const ASSETS: u8 = 10;
}

/// (enum value, name, display name, parent)
const DEFAULT_TAGS: &[(u8, &str, &str, Option<&str>)] = &[
    (default_tags::UNTAGGED, UNTAGGED_NAME, "Untagged", None),
    (default_tags::TRACKER, OVERHEAD_TAG_NAME, "Tracker Overhead", None),
    (default_tags::ENGINE_MISC, "EngineMisc", "Engine Misc", None),
    (default_tags::RENDERING, "Rendering", "Rendering", None),
    (default_tags::TEXTURES, "Rendering/Textures", "Textures", Some("Rendering")),
    (default_tags::MESHES, "Rendering/Meshes", "Meshes", Some("Rendering")),
    (default_tags::AUDIO, "Audio", "Audio", None),
    (default_tags::PHYSICS, "Physics", "Physics", None),
    (default_tags::NETWORKING, "Networking", "Networking", None),
    (default_tags::UI, "UI", "UI", None),
    (default_tags::ASSETS, "Assets", "Assets", None),
];

/// Collects tags and settings, then builds a [`LowLevelTracker`].
///
/// This is the only place tags can be changed after being created: enum
/// tags can be seeded by value and patched with a name and parent later.
/// `build` consumes the builder, so construction happens exactly once.
///
/// ```
/// use tagtrack::{TagDeclaration, TrackerBuilder, TrackerConfig};
///
/// let tracker = TrackerBuilder::new(TrackerConfig::default())
///     .seed_enum_tag(1)
///     .declare_tag(TagDeclaration::new("Physics/Bodies").with_parent("Physics"))
///     .patch_enum_tag(1, "Physics", None, None)
///     .build()
///     .unwrap();
///
/// let bodies = tracker.find_tag("Physics/Bodies").unwrap();
/// assert_eq!(bodies.containing_enum(), Some(1));
/// ```
pub struct TrackerBuilder {
    config: TrackerConfig,
    tags: TagRegistryBuilder,
    sink: Option<Arc<dyn DiagnosticSink>>,
}

impl TrackerBuilder {
    /// Start a builder with `config`.
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tags: TagRegistryBuilder::new(),
            sink: None,
        }
    }

    /// Declare a tag. Parents may be declared later.
    pub fn declare_tag(mut self, decl: TagDeclaration) -> Self {
        self.tags.register(&decl, ReferenceSource::Declared);
        self
    }

    /// Declare several tags.
    pub fn declare_tags(mut self, decls: impl IntoIterator<Item = TagDeclaration>) -> Self {
        for decl in decls {
            self.tags.register(&decl, ReferenceSource::Declared);
        }
        self
    }

    /// Create an enum tag known only by its value. If it is never patched or
    /// declared it is named `EnumTag<N>`.
    pub fn seed_enum_tag(mut self, enum_tag: u8) -> Self {
        self.tags.seed_enum_tag(enum_tag);
        self
    }

    /// Name a seeded enum tag and give it a parent.
    pub fn patch_enum_tag(mut self, enum_tag: u8, name: &str, display_name: Option<&str>, parent: Option<&str>) -> Self {
        self.tags.patch_enum_tag(enum_tag, name, display_name, parent);
        self
    }

    /// Seed and patch the built-in tag set in [`default_tags`].
    pub fn with_default_tags(mut self) -> Self {
        for &(enum_tag, _, _, _) in DEFAULT_TAGS {
            self.tags.seed_enum_tag(enum_tag);
        }
        for &(enum_tag, name, display_name, parent) in DEFAULT_TAGS {
            self.tags.patch_enum_tag(enum_tag, name, Some(display_name), parent);
        }
        self
    }

    /// Send this tracker's diagnostics to `sink` as well.
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Number of tags registered so far (not counting implicit ones).
    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }

    /// Resolve and order the tags and build the tracker.
    pub fn build(self) -> TrackerResult<LowLevelTracker> {
        LowLevelTracker::from_parts(self.config, self.tags, self.sink)
    }
}
