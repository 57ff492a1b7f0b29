//! Global per-tag totals.
//!
//! Only the merge step changes these numbers. Allocation hooks write to
//! their thread's table and never touch this state directly.

use std::sync::Arc;

use crate::allocators::arena::LlmArena;
use crate::api::error::TrackerResult;
use crate::api::report::TrackerTagSizeData;
use crate::api::tag::TagHandle;
use crate::collections::LlmMap;
use crate::core::thread::ThreadTable;

/// Aggregated sizes across all threads.
pub(crate) struct GlobalTracker {
    /// tag -> (size, peak size)
    sizes: LlmMap<TagHandle, i64, i64>,
    /// tag -> (external amount, add to total)
    externals: LlmMap<TagHandle, i64, bool>,
    track_peaks: bool,
}

impl GlobalTracker {
    pub(crate) fn new(arena: Arc<LlmArena>, track_peaks: bool) -> Self {
        Self {
            sizes: LlmMap::new(arena.clone()),
            externals: LlmMap::new(arena),
            track_peaks,
        }
    }

    /// Fold a thread's deltas into the totals and zero them.
    ///
    /// Peaks are not touched here; call [`update_peaks`](Self::update_peaks)
    /// once every thread of the cycle has been merged.
    pub(crate) fn merge_thread(&mut self, table: &mut ThreadTable) -> TrackerResult<()> {
        for entry in table.entries_mut() {
            if entry.size == 0 {
                continue;
            }
            match self.sizes.find_mut(&entry.tag) {
                Some((size, _)) => *size += entry.size,
                None => self.sizes.add(entry.tag, entry.size, 0)?,
            }
            entry.size = 0;
        }
        Ok(())
    }

    /// Raise every peak to the tag's current size and reported size.
    pub(crate) fn update_peaks(&mut self) {
        if !self.track_peaks {
            return;
        }
        let externals = &self.externals;
        for (tag, size, peak) in self.sizes.iter_mut() {
            raise_peak(peak, *size, externals.find(tag).map(|(&amount, &add)| (amount, add)));
        }
    }

    /// Record an externally managed amount for `tag`.
    ///
    /// The peak follows the new amount right away rather than at the next
    /// merge.
    pub(crate) fn set_external_amount(&mut self, tag: TagHandle, amount: i64, add_to_total: bool) -> TrackerResult<()> {
        if !self.sizes.has_key(&tag) {
            self.sizes.add(tag, 0, 0)?;
        }
        self.externals.add(tag, amount, add_to_total)?;
        if self.track_peaks {
            if let Some((size, peak)) = self.sizes.find_mut(&tag) {
                raise_peak(peak, *size, Some((amount, add_to_total)));
            }
        }
        Ok(())
    }

    /// Forget the external amount for `tag`.
    pub(crate) fn clear_external_amount(&mut self, tag: TagHandle) {
        self.externals.remove(&tag);
    }

    /// Current numbers for `tag`; zero for tags never touched.
    pub(crate) fn size_data(&self, tag: TagHandle) -> TrackerTagSizeData {
        let (size, peak_size) = self
            .sizes
            .find(&tag)
            .map(|(&size, &peak)| (size, peak))
            .unwrap_or((0, 0));
        let external = self.externals.find(&tag);
        TrackerTagSizeData {
            size,
            peak_size,
            external_amount: external.map(|(&amount, _)| amount).unwrap_or(0),
            external_valid: external.is_some(),
            external_add_to_total: external.map(|(_, &add)| add).unwrap_or(false),
        }
    }
}

/// `PeakSize >= max(Size, ReportedSize)`.
#[inline]
fn raise_peak(peak: &mut i64, size: i64, external: Option<(i64, bool)>) {
    let reported = match external {
        Some((amount, true)) => amount,
        _ => size,
    };
    *peak = (*peak).max(size).max(reported);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tag::{ReferenceSource, TagDeclaration};
    use crate::core::registry::{TagRegistry, TagRegistryBuilder};
    use crate::diagnostics::Reporter;

    fn setup() -> (Arc<LlmArena>, TagRegistry) {
        let arena = Arc::new(LlmArena::default());
        let mut builder = TagRegistryBuilder::new();
        builder.register(&TagDeclaration::new("Gpu"), ReferenceSource::Declared);
        builder.register(&TagDeclaration::new("Cpu"), ReferenceSource::Declared);
        let registry = builder.finish_construction(arena.clone(), &Reporter::default()).unwrap();
        (arena, registry)
    }

    #[test]
    fn test_merge_zeroes_thread_entries() {
        let (arena, registry) = setup();
        let cpu = registry.find_by_name("Cpu").unwrap();
        let mut global = GlobalTracker::new(arena.clone(), true);

        let mut first = ThreadTable::new(arena.clone());
        let mut second = ThreadTable::new(arena.clone());
        first.track(cpu, 64).unwrap();
        second.track(cpu, 32).unwrap();

        global.merge_thread(&mut first).unwrap();
        global.merge_thread(&mut second).unwrap();
        global.update_peaks();

        assert_eq!(global.size_data(cpu).size, 96);
        assert_eq!(first.size_of(cpu), 0);
        assert_eq!(second.size_of(cpu), 0);
    }

    #[test]
    fn test_peaks_follow_cycles_not_partial_merges() {
        let (arena, registry) = setup();
        let cpu = registry.find_by_name("Cpu").unwrap();
        let mut global = GlobalTracker::new(arena.clone(), true);

        let mut first = ThreadTable::new(arena.clone());
        let mut second = ThreadTable::new(arena.clone());
        first.track(cpu, 100).unwrap();
        second.track(cpu, -60).unwrap();
        global.merge_thread(&mut first).unwrap();
        global.merge_thread(&mut second).unwrap();
        global.update_peaks();

        let data = global.size_data(cpu);
        assert_eq!(data.size, 40);
        assert_eq!(data.peak_size, 40);

        first.track(cpu, -40).unwrap();
        global.merge_thread(&mut first).unwrap();
        global.update_peaks();
        assert_eq!(global.size_data(cpu).peak_size, 40);
        assert_eq!(global.size_data(cpu).size, 0);
    }

    #[test]
    fn test_external_amount_replaces_instrumented_size() {
        let (arena, registry) = setup();
        let gpu = registry.find_by_name("Gpu").unwrap();
        let mut global = GlobalTracker::new(arena.clone(), true);

        let mut table = ThreadTable::new(arena.clone());
        table.track(gpu, 200).unwrap();
        global.merge_thread(&mut table).unwrap();
        global.set_external_amount(gpu, 500, true).unwrap();
        global.update_peaks();

        let data = global.size_data(gpu);
        assert_eq!(data.reported_size(), 500);
        assert_eq!(data.peak_size, 500);

        global.set_external_amount(gpu, 500, false).unwrap();
        assert_eq!(global.size_data(gpu).reported_size(), 200);

        global.clear_external_amount(gpu);
        assert!(!global.size_data(gpu).external_valid);
    }

    #[test]
    fn test_peak_never_below_size_or_reported() {
        let (arena, registry) = setup();
        let gpu = registry.find_by_name("Gpu").unwrap();
        let mut global = GlobalTracker::new(arena.clone(), true);

        let mut table = ThreadTable::new(arena.clone());
        table.track(gpu, 200).unwrap();
        global.merge_thread(&mut table).unwrap();

        // A smaller add-to-total amount must not pull the peak under the size.
        global.set_external_amount(gpu, 50, true).unwrap();
        global.update_peaks();
        let data = global.size_data(gpu);
        assert_eq!(data.reported_size(), 50);
        assert_eq!(data.peak_size, 200);

        // A larger one raises the peak before the next merge.
        global.set_external_amount(gpu, 900, true).unwrap();
        let data = global.size_data(gpu);
        assert_eq!(data.reported_size(), 900);
        assert_eq!(data.peak_size, 900);
        assert!(data.peak_size >= data.size);
    }

    #[test]
    fn test_peaks_disabled() {
        let (arena, registry) = setup();
        let cpu = registry.find_by_name("Cpu").unwrap();
        let mut global = GlobalTracker::new(arena.clone(), false);
        let mut table = ThreadTable::new(arena);
        table.track(cpu, 10).unwrap();
        global.merge_thread(&mut table).unwrap();
        global.update_peaks();
        assert_eq!(global.size_data(cpu).peak_size, 0);
    }
}
