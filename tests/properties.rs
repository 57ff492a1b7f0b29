//! Property tests for tag ordering, accounting and the arena-backed map.

use std::collections::HashSet;
use std::sync::Arc;

use proptest::prelude::*;
use proptest::sample::Index;

use tagtrack::allocators::arena::{LlmArena, DEFAULT_PAGE_SIZE};
use tagtrack::collections::LlmMap;
use tagtrack::{LowLevelTracker, TagDeclaration, TrackerBuilder, TrackerConfig};

fn build(decls: impl IntoIterator<Item = TagDeclaration>) -> LowLevelTracker {
    TrackerBuilder::new(TrackerConfig::default())
        .declare_tags(decls)
        .build()
        .unwrap()
}

fn name(i: usize) -> String {
    format!("T{}", i)
}

/// A forest over `len` tags where tag `i` may only have a parent `< i`,
/// plus a sort key per tag used to shuffle the registration order.
fn forest() -> impl Strategy<Value = Vec<(Option<usize>, u32)>> {
    prop::collection::vec((prop::option::of(any::<Index>()), any::<u32>()), 1..40).prop_map(|nodes| {
        nodes
            .into_iter()
            .enumerate()
            .map(|(i, (parent, key))| (parent.filter(|_| i > 0).map(|p| p.index(i)), key))
            .collect()
    })
}

fn declaration(i: usize, parent: Option<usize>) -> TagDeclaration {
    let decl = TagDeclaration::new(name(i));
    match parent {
        Some(p) => decl.with_parent(name(p)),
        None => decl,
    }
}

proptest! {
    #[test]
    fn prop_parents_come_before_children(nodes in forest()) {
        let mut order: Vec<usize> = (0..nodes.len()).collect();
        order.sort_by_key(|&i| nodes[i].1);

        let tracker = build(order.iter().map(|&i| declaration(i, nodes[i].0)));
        for (i, &(parent, _)) in nodes.iter().enumerate() {
            let tag = tracker.find_tag(&name(i)).unwrap();
            match parent {
                Some(p) => {
                    let parent = tag.parent().unwrap();
                    prop_assert_eq!(parent.name(), name(p));
                    prop_assert!(parent.index() < tag.index());
                }
                None => prop_assert!(tag.parent().is_none()),
            }
        }
    }

    #[test]
    fn prop_sorted_input_is_unchanged(nodes in forest()) {
        let tracker = build(nodes.iter().enumerate().map(|(i, &(parent, _))| declaration(i, parent)));
        // Index 0 is the implicit Untagged tag.
        for i in 0..nodes.len() {
            prop_assert_eq!(tracker.find_tag(&name(i)).unwrap().index(), i + 1);
        }
    }

    #[test]
    fn prop_cycles_still_get_distinct_indices(
        parents in prop::collection::vec(prop::option::of(any::<Index>()), 1..30)
    ) {
        let len = parents.len();
        let decls: Vec<TagDeclaration> = parents
            .iter()
            .enumerate()
            .map(|(i, parent)| declaration(i, parent.as_ref().map(|p| p.index(len))))
            .collect();

        let tracker = build(decls);
        prop_assert_eq!(tracker.tag_count(), len + 1);

        let mut seen = HashSet::new();
        for i in 0..len {
            let tag = tracker.find_tag(&name(i)).unwrap();
            prop_assert!(tag.index() < tracker.tag_count());
            prop_assert!(seen.insert(tag.index()));
            if let Some(parent) = tag.parent() {
                prop_assert!(parent.index() < tag.index());
            }
        }
    }

    #[test]
    fn prop_thread_size_matches_live_allocations(
        sizes in prop::collection::vec(1usize..1 << 20, 1..64),
        freed in prop::collection::vec(any::<bool>(), 64)
    ) {
        let tracker = build([TagDeclaration::new("Fixed")]);
        let tag = tracker.find_tag("Fixed").unwrap();

        let _scope = tracker.scope(tag);
        let mut live: i64 = 0;
        for (i, &size) in sizes.iter().enumerate() {
            tracker.on_alloc((0x1000 + i * 0x100) as *const u8, size);
            live += size as i64;
        }
        for (i, &size) in sizes.iter().enumerate() {
            if freed[i] {
                tracker.on_free((0x1000 + i * 0x100) as *const u8, size);
                live -= size as i64;
            }
            prop_assert!(tracker.thread_tag_size(tag) >= 0);
        }
        prop_assert_eq!(tracker.thread_tag_size(tag), live);
    }

    #[test]
    fn prop_map_round_trip_across_growth(
        keys in prop::collection::hash_set(any::<u64>(), 64..400),
        removed in prop::collection::vec(any::<bool>(), 400)
    ) {
        let mut map: LlmMap<u64, u32, u64> = LlmMap::new(Arc::new(LlmArena::new(DEFAULT_PAGE_SIZE)));
        let keys: Vec<u64> = keys.into_iter().collect();

        let mut initial_capacity = None;
        for (i, &key) in keys.iter().enumerate() {
            map.add(key, i as u32, key ^ 0xFFFF).unwrap();
            initial_capacity.get_or_insert(map.table_capacity());
        }
        prop_assert!(map.table_capacity() > initial_capacity.unwrap_or(0));

        for (i, &key) in keys.iter().enumerate() {
            prop_assert_eq!(map.find(&key), Some((&(i as u32), &(key ^ 0xFFFF))));
        }

        for (i, &key) in keys.iter().enumerate() {
            if removed[i] {
                prop_assert_eq!(map.remove(&key), Some((i as u32, key ^ 0xFFFF)));
            }
        }
        for (i, &key) in keys.iter().enumerate() {
            if removed[i] {
                prop_assert!(map.find(&key).is_none());
            } else {
                prop_assert_eq!(map.find(&key), Some((&(i as u32), &(key ^ 0xFFFF))));
            }
        }
        prop_assert_eq!(map.len(), removed.iter().take(keys.len()).filter(|&&r| !r).count());
    }
}
