//! Pointer to (tag, size) map for attributing frees.
//!
//! Frees often arrive without a tag, and on a different thread than the
//! allocation. Recording every live allocation lets the free be charged to
//! the tag that paid for it. The map is split into shards so concurrent
//! hooks rarely meet on the same lock.

use std::sync::Arc;

use crate::allocators::arena::LlmArena;
use crate::api::error::TrackerResult;
use crate::api::tag::TagHandle;
use crate::collections::{Address, LlmMap};
use crate::sync::mutex::Mutex;

/// Default number of shards.
pub const DEFAULT_SHARDS: usize = 16;

/// Sharded map of live allocations.
pub(crate) struct AllocationMap {
    shards: Box<[Mutex<LlmMap<Address, TagHandle, u64>>]>,
    shift: u32,
}

impl AllocationMap {
    /// `shards` is rounded up to a power of two.
    pub(crate) fn new(arena: Arc<LlmArena>, shards: usize) -> Self {
        let count = shards.max(1).next_power_of_two();
        let shards = (0..count)
            .map(|_| Mutex::new(LlmMap::new(arena.clone())))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            shift: usize::BITS - count.trailing_zeros(),
        }
    }

    /// Shard selection uses the high bits of a multiplicative hash; the
    /// in-shard hash uses the low address bits, so the two stay independent.
    #[inline]
    fn shard(&self, address: Address) -> &Mutex<LlmMap<Address, TagHandle, u64>> {
        if self.shards.len() == 1 {
            return &self.shards[0];
        }
        let hash = (address.0 >> 4).wrapping_mul(0x9E37_79B9_7F4A_7C15_u64 as usize);
        &self.shards[hash >> self.shift]
    }

    /// Record a live allocation. An existing entry for the address is replaced.
    pub(crate) fn insert(&self, address: Address, tag: TagHandle, size: u64) -> TrackerResult<()> {
        self.shard(address).lock().add(address, tag, size)
    }

    /// Forget an allocation, returning what it was charged to.
    pub(crate) fn remove(&self, address: Address) -> Option<(TagHandle, u64)> {
        self.shard(address).lock().remove(&address)
    }

    #[cfg(test)]
    pub(crate) fn get(&self, address: Address) -> Option<(TagHandle, u64)> {
        self.shard(address)
            .lock()
            .find(&address)
            .map(|(&tag, &size)| (tag, size))
    }

    /// Number of live allocations.
    pub(crate) fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    /// Give unused memory back to the arena.
    pub(crate) fn trim(&self) -> TrackerResult<()> {
        for shard in self.shards.iter() {
            shard.lock().trim()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tag::{ReferenceSource, TagDeclaration};
    use crate::core::registry::TagRegistryBuilder;
    use crate::diagnostics::Reporter;

    #[test]
    fn test_insert_remove_across_shards() {
        let arena = Arc::new(LlmArena::default());
        let mut builder = TagRegistryBuilder::new();
        builder.register(&TagDeclaration::new("Textures"), ReferenceSource::Declared);
        let registry = builder.finish_construction(arena.clone(), &Reporter::default()).unwrap();
        let textures = registry.find_by_name("Textures").unwrap();

        let map = AllocationMap::new(arena, 6);
        assert_eq!(map.shards.len(), 8);

        for i in 0..1000usize {
            map.insert(Address(0x10_0000 + i * 48), textures, i as u64).unwrap();
        }
        assert_eq!(map.len(), 1000);
        assert_eq!(map.get(Address(0x10_0000 + 48 * 7)), Some((textures, 7)));
        assert_eq!(map.remove(Address(0x10_0000 + 48 * 7)), Some((textures, 7)));
        assert_eq!(map.remove(Address(0x10_0000 + 48 * 7)), None);
        assert_eq!(map.len(), 999);

        let used: std::collections::HashSet<usize> = (0..1000usize)
            .map(|i| (map.shard(Address(0x10_0000 + i * 48)) as *const _) as usize)
            .collect();
        assert!(used.len() > 4);
    }

    #[test]
    fn test_single_shard() {
        let map = AllocationMap::new(Arc::new(LlmArena::default()), 1);
        assert_eq!(map.shards.len(), 1);
        assert!(map.remove(Address(0x40)).is_none());
    }
}
