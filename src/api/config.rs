//! Tracker configuration.

use crate::allocators::arena::DEFAULT_PAGE_SIZE;
use crate::core::alloc_map::DEFAULT_SHARDS;

/// How much tag detail is kept per allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TagStorage {
    /// Charge allocations to the exact active tag.
    #[default]
    Full,
    /// Charge allocations to the nearest enclosing enum tag, or to
    /// `Untagged` if there is none.
    EnumOnly,
}

/// Configuration for a tracker.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Track at all. A disabled tracker turns every hook into a no-op.
    pub enabled: bool,

    /// Keep per-tag peak sizes (off by default with the `minimal` feature).
    pub track_peaks: bool,

    /// Record pointer -> (tag, size) so frees are charged to the allocating
    /// tag. Without it, frees are charged to the freeing thread's active tag.
    pub allocation_map: bool,

    /// Number of allocation map shards (rounded up to a power of two).
    pub allocation_map_shards: usize,

    /// Page granularity of the tracker's private arena (default: 16 KB).
    pub arena_page_size: usize,

    /// Cap on the arena's OS memory (0 = unlimited).
    pub arena_limit: usize,

    /// Tag detail kept per allocation.
    pub tag_storage: TagStorage,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            track_peaks: cfg!(not(feature = "minimal")),
            allocation_map: true,
            allocation_map_shards: DEFAULT_SHARDS,
            arena_page_size: DEFAULT_PAGE_SIZE,
            arena_limit: 0,
            tag_storage: TagStorage::Full,
        }
    }
}

impl TrackerConfig {
    /// Lowest overhead: no allocation map, no peaks, enum-level tags only.
    pub fn minimal() -> Self {
        Self {
            track_peaks: false,
            allocation_map: false,
            allocation_map_shards: 1,
            tag_storage: TagStorage::EnumOnly,
            ..Self::default()
        }
    }

    /// A configuration with tracking switched off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Default configuration with `TAGTRACK_ENABLED` and
    /// `TAGTRACK_TAG_STORAGE` applied.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `TAGTRACK_*` overrides read through `lookup`.
    ///
    /// - `TAGTRACK_ENABLED`: "0", "false", "off" disable; "1", "true", "on" enable
    /// - `TAGTRACK_TAG_STORAGE`: "full" or "enum"
    ///
    /// Unrecognized values are ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(value) = lookup("TAGTRACK_ENABLED") {
            match value.trim().to_ascii_lowercase().as_str() {
                "0" | "false" | "off" => self.enabled = false,
                "1" | "true" | "on" => self.enabled = true,
                _ => {}
            }
        }
        if let Some(value) = lookup("TAGTRACK_TAG_STORAGE") {
            match value.trim().to_ascii_lowercase().as_str() {
                "full" => self.tag_storage = TagStorage::Full,
                "enum" | "enum_only" => self.tag_storage = TagStorage::EnumOnly,
                _ => {}
            }
        }
        self
    }

    /// Builder pattern: enable or disable tracking.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Builder pattern: enable peak tracking.
    pub fn with_peaks(mut self, enable: bool) -> Self {
        self.track_peaks = enable;
        self
    }

    /// Builder pattern: enable the allocation map.
    pub fn with_allocation_map(mut self, enable: bool) -> Self {
        self.allocation_map = enable;
        self
    }

    /// Builder pattern: set the allocation map shard count.
    pub fn with_allocation_map_shards(mut self, shards: usize) -> Self {
        self.allocation_map_shards = shards;
        self
    }

    /// Builder pattern: set the arena page size.
    pub fn with_arena_page_size(mut self, size: usize) -> Self {
        self.arena_page_size = size;
        self
    }

    /// Builder pattern: cap the arena's OS memory.
    pub fn with_arena_limit(mut self, limit: usize) -> Self {
        self.arena_limit = limit;
        self
    }

    /// Builder pattern: set tag storage.
    pub fn with_tag_storage(mut self, tag_storage: TagStorage) -> Self {
        self.tag_storage = tag_storage;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn test_defaults() {
        let config = TrackerConfig::default();
        assert!(config.enabled);
        assert!(config.allocation_map);
        assert_eq!(config.arena_page_size, 16 * 1024);
        assert_eq!(config.tag_storage, TagStorage::Full);
    }

    #[test]
    fn test_overrides() {
        let config = TrackerConfig::default().with_overrides(env(&[
            ("TAGTRACK_ENABLED", "off"),
            ("TAGTRACK_TAG_STORAGE", "Enum"),
        ]));
        assert!(!config.enabled);
        assert_eq!(config.tag_storage, TagStorage::EnumOnly);

        let config = TrackerConfig::disabled().with_overrides(env(&[("TAGTRACK_ENABLED", "maybe")]));
        assert!(!config.enabled);
    }

    #[test]
    fn test_minimal_preset() {
        let config = TrackerConfig::minimal().with_peaks(true);
        assert!(!config.allocation_map);
        assert!(config.track_peaks);
        assert_eq!(config.tag_storage, TagStorage::EnumOnly);
    }
}
