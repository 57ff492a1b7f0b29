//! Tracker reports.

use std::collections::BTreeMap;
use std::fmt;

use crate::allocators::arena::ArenaStats;
use crate::core::global::GlobalTracker;
use crate::core::registry::TagRegistry;
use crate::util::size::format_bytes;

/// Global numbers for one tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerTagSizeData {
    /// Bytes from instrumented allocations, as of the last merge.
    pub size: i64,
    /// Highest size or reported size seen so far (0 when peaks are off).
    pub peak_size: i64,
    /// Amount set by an external subsystem.
    pub external_amount: i64,
    /// Whether `external_amount` is set.
    pub external_valid: bool,
    /// Whether `external_amount` replaces `size` in totals.
    pub external_add_to_total: bool,
}

impl TrackerTagSizeData {
    /// The size that counts for this tag.
    ///
    /// An external amount marked add-to-total replaces the instrumented size;
    /// otherwise it is only informational.
    pub fn reported_size(&self) -> i64 {
        if self.external_valid && self.external_add_to_total {
            self.external_amount
        } else {
            self.size
        }
    }
}

/// One row of a [`TrackerReport`].
#[derive(Debug, Clone)]
pub struct TagReport {
    /// Tag name.
    pub name: String,
    /// Display name.
    pub display_name: String,
    /// Display names from the root, joined with `/`.
    pub display_path: String,
    /// Tag index.
    pub index: usize,
    /// Parent's index.
    pub parent_index: Option<usize>,
    /// Number of ancestors.
    pub depth: usize,
    /// Enum value, if any.
    pub enum_tag: Option<u8>,
    /// Stat label.
    pub stat_name: String,
    /// Summary stat label.
    pub summary_stat_name: String,
    /// This tag's own numbers.
    pub size: TrackerTagSizeData,
    /// Reported size of the tag plus all its descendants.
    pub rollup_size: i64,
}

impl TagReport {
    /// Reported size of this tag alone.
    pub fn own_size(&self) -> i64 {
        self.size.reported_size()
    }
}

/// Snapshot of every tag's numbers as of the last merge.
#[derive(Debug, Clone)]
pub struct TrackerReport {
    /// Rows in index order (parents before children).
    pub tags: Vec<TagReport>,
    /// Sum of every tag's reported size, leaving out the tracker's own
    /// overhead tag.
    pub total: i64,
    /// The tracker's own memory use.
    pub arena: ArenaStats,
    /// Live allocations in the allocation map, if enabled.
    pub live_allocations: Option<usize>,
}

impl TrackerReport {
    pub(crate) fn build(
        registry: &TagRegistry,
        global: &GlobalTracker,
        overhead_index: Option<usize>,
        arena: ArenaStats,
        live_allocations: Option<usize>,
    ) -> Self {
        let mut tags: Vec<TagReport> = registry
            .iter()
            .map(|handle| {
                let tag = handle.get();
                let size = global.size_data(handle);
                TagReport {
                    name: tag.name().to_owned(),
                    display_name: tag.display_name().to_owned(),
                    display_path: tag.display_path(),
                    index: tag.index(),
                    parent_index: tag.parent().map(|parent| parent.index()),
                    depth: tag.depth(),
                    enum_tag: tag.enum_tag(),
                    stat_name: tag.stat_name().to_owned(),
                    summary_stat_name: tag.summary_stat_name().to_owned(),
                    size,
                    rollup_size: size.reported_size(),
                }
            })
            .collect();

        // Children have higher indices than their parents.
        for index in (0..tags.len()).rev() {
            if let Some(parent) = tags[index].parent_index {
                let rollup = tags[index].rollup_size;
                tags[parent].rollup_size += rollup;
            }
        }

        let total = tags
            .iter()
            .filter(|tag| Some(tag.index) != overhead_index)
            .map(TagReport::own_size)
            .sum();
        Self {
            tags,
            total,
            arena,
            live_allocations,
        }
    }

    /// Row for the tag called `name`.
    pub fn tag(&self, name: &str) -> Option<&TagReport> {
        self.tags.iter().find(|tag| tag.name == name)
    }

    /// Direct children of the tag at `index`.
    pub fn children(&self, index: usize) -> impl Iterator<Item = &TagReport> + '_ {
        self.tags
            .iter()
            .filter(move |tag| tag.parent_index == Some(index))
    }

    /// Own reported sizes grouped by summary stat name, skipping tags without one.
    pub fn summary_stats(&self) -> BTreeMap<String, i64> {
        let mut stats = BTreeMap::new();
        for tag in &self.tags {
            if !tag.summary_stat_name.is_empty() {
                *stats.entry(tag.summary_stat_name.clone()).or_insert(0) += tag.own_size();
            }
        }
        stats
    }

    /// Hierarchical text listing.
    pub fn dump(&self) -> String {
        self.to_string()
    }

    fn write_tree(&self, f: &mut fmt::Formatter<'_>, tag: &TagReport) -> fmt::Result {
        let label = format!("{:indent$}{}", "", tag.display_name, indent = tag.depth * 2);
        write!(
            f,
            "  {:<40} {:>12} {:>12} {:>12}",
            label,
            format_bytes(tag.own_size()),
            format_bytes(tag.rollup_size),
            format_bytes(tag.size.peak_size)
        )?;
        if tag.size.external_valid && !tag.size.external_add_to_total {
            write!(f, "  (external {})", format_bytes(tag.size.external_amount))?;
        }
        writeln!(f)?;

        for child in self.children(tag.index) {
            self.write_tree(f, child)?;
        }
        Ok(())
    }
}

impl fmt::Display for TrackerReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Memory by tag:")?;
        writeln!(f, "  {:<40} {:>12} {:>12} {:>12}", "Tag", "Own", "Total", "Peak")?;
        for root in self.tags.iter().filter(|tag| tag.parent_index.is_none()) {
            self.write_tree(f, root)?;
        }
        writeln!(f, "  Total tracked:   {}", format_bytes(self.total))?;
        writeln!(
            f,
            "  Tracker overhead: {} used, {} reserved",
            format_bytes(self.arena.used_bytes as i64),
            format_bytes(self.arena.reserved_bytes as i64)
        )?;
        if let Some(live) = self.live_allocations {
            writeln!(f, "  Live allocations: {}", live)?;
        }
        Ok(())
    }
}
