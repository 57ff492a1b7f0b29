//! Open-addressing hash map backed by the tracker arena.

use std::borrow::Borrow;
use std::mem;
use std::ptr::NonNull;
use std::sync::Arc;

use super::array::LlmArray;
use super::hash::LlmHash;
use crate::allocators::arena::LlmArena;
use crate::api::error::{TrackerError, TrackerResult};

/// Grow once more than 30/256 of the index table is occupied.
const LOAD_NUMERATOR: usize = 30;
const LOAD_DENOMINATOR: usize = 256;

/// Smallest index table allocated.
const MIN_TABLE_CAPACITY: usize = 64;

struct MapEntry<K, V1, V2> {
    key: K,
    value1: V1,
    value2: V2,
}

/// A hash map from `K` to a pair of values `(V1, V2)`.
///
/// Entries are stored densely in an [`LlmArray`], so iteration is cheap and
/// deterministic. A separate power-of-two index table maps hashes to entry
/// positions using linear probing. The table is kept sparse on purpose: the
/// map sits on the allocation path, where short probe chains matter more than
/// a few bytes of index memory.
///
/// Removal swaps the last entry into the freed position and shifts later
/// members of the probe chain back, so lookups never need tombstones.
pub struct LlmMap<K, V1, V2> {
    arena: Arc<LlmArena>,
    entries: LlmArray<MapEntry<K, V1, V2>>,
    table: Option<NonNull<u32>>,
    table_capacity: usize,
}

// SAFETY: the index table is uniquely owned and only holds integers.
unsafe impl<K: Send, V1: Send, V2: Send> Send for LlmMap<K, V1, V2> {}
unsafe impl<K: Sync, V1: Sync, V2: Sync> Sync for LlmMap<K, V1, V2> {}

#[inline]
fn fits(len: usize, table_capacity: usize) -> bool {
    len * LOAD_DENOMINATOR <= table_capacity * LOAD_NUMERATOR
}

fn table_capacity_for(len: usize) -> usize {
    let mut capacity = MIN_TABLE_CAPACITY;
    while !fits(len, capacity) {
        capacity *= 2;
    }
    capacity
}

impl<K, V1, V2> LlmMap<K, V1, V2>
where
    K: LlmHash + Eq,
{
    /// Create an empty map. No memory is taken until the first insertion.
    pub fn new(arena: Arc<LlmArena>) -> Self {
        Self {
            entries: LlmArray::new(arena.clone()),
            arena,
            table: None,
            table_capacity: 0,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of index slots (for tests and statistics).
    pub fn table_capacity(&self) -> usize {
        self.table_capacity
    }

    /// Insert or overwrite the values for `key`.
    pub fn add(&mut self, key: K, value1: V1, value2: V2) -> TrackerResult<()> {
        if let Some((_, index)) = self.find_slot(&key) {
            let entry = &mut self.entries[index];
            entry.value1 = value1;
            entry.value2 = value2;
            return Ok(());
        }

        self.ensure_table(self.entries.len() + 1)?;
        let hash = key.llm_hash();
        self.entries.push(MapEntry { key, value1, value2 })?;
        let index = self.entries.len() - 1;
        // SAFETY: `ensure_table` guarantees a table with free slots.
        unsafe { self.insert_index(hash, index) };
        Ok(())
    }

    /// Look up the values for `key`.
    pub fn find<Q>(&self, key: &Q) -> Option<(&V1, &V2)>
    where
        K: Borrow<Q>,
        Q: LlmHash + Eq + ?Sized,
    {
        let (_, index) = self.find_slot(key)?;
        let entry = &self.entries[index];
        Some((&entry.value1, &entry.value2))
    }

    /// Look up the values for `key` mutably.
    pub fn find_mut<Q>(&mut self, key: &Q) -> Option<(&mut V1, &mut V2)>
    where
        K: Borrow<Q>,
        Q: LlmHash + Eq + ?Sized,
    {
        let (_, index) = self.find_slot(key)?;
        let entry = &mut self.entries[index];
        Some((&mut entry.value1, &mut entry.value2))
    }

    /// Look up the stored key and values for `key`.
    pub fn find_entry<Q>(&self, key: &Q) -> Option<(&K, &V1, &V2)>
    where
        K: Borrow<Q>,
        Q: LlmHash + Eq + ?Sized,
    {
        let (_, index) = self.find_slot(key)?;
        let entry = &self.entries[index];
        Some((&entry.key, &entry.value1, &entry.value2))
    }

    /// Whether `key` is present.
    pub fn has_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: LlmHash + Eq + ?Sized,
    {
        self.find_slot(key).is_some()
    }

    /// Remove `key`, returning its values.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<(V1, V2)>
    where
        K: Borrow<Q>,
        Q: LlmHash + Eq + ?Sized,
    {
        let (slot, index) = self.find_slot(key)?;
        // SAFETY: `find_slot` succeeded, so the table exists and `slot` is occupied.
        unsafe { self.delete_slot(slot) };

        let last = self.entries.len() - 1;
        if index != last {
            // The last entry is about to move into `index`; repoint its slot.
            let moved_hash = self.entries[last].key.llm_hash();
            // SAFETY: the last entry is indexed in the table.
            unsafe {
                let moved_slot = self.slot_of_entry(moved_hash, last);
                self.set_slot(moved_slot, index as u32 + 1);
            }
        }

        let entry = self.entries.swap_remove(index);
        Some((entry.value1, entry.value2))
    }

    /// Remove every entry, keeping allocated memory.
    pub fn clear(&mut self) {
        self.entries.clear();
        if let Some(table) = self.table {
            // SAFETY: the table holds `table_capacity` u32 slots.
            unsafe { std::ptr::write_bytes(table.as_ptr(), 0, self.table_capacity) };
        }
    }

    /// Release memory that is no longer needed.
    pub fn trim(&mut self) -> TrackerResult<()> {
        self.entries.trim()?;
        if self.table.is_some() {
            let desired = table_capacity_for(self.entries.len());
            if desired < self.table_capacity {
                self.rehash(desired)?;
            }
        }
        Ok(())
    }

    /// Iterate over `(key, value1, value2)`.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V1, &V2)> + '_ {
        self.entries.iter().map(|e| (&e.key, &e.value1, &e.value2))
    }

    /// Iterate with mutable access to the values.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V1, &mut V2)> + '_ {
        self.entries
            .iter_mut()
            .map(|e| (&e.key, &mut e.value1, &mut e.value2))
    }

    /// Iterate over the keys.
    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.entries.iter().map(|e| &e.key)
    }

    fn find_slot<Q>(&self, key: &Q) -> Option<(usize, usize)>
    where
        K: Borrow<Q>,
        Q: LlmHash + Eq + ?Sized,
    {
        let table = self.table?;
        let mask = self.table_capacity - 1;
        let mut slot = key.llm_hash() as usize & mask;
        loop {
            // SAFETY: slot <= mask < table_capacity.
            let value = unsafe { *table.as_ptr().add(slot) };
            if value == 0 {
                return None;
            }
            let index = value as usize - 1;
            if <K as Borrow<Q>>::borrow(&self.entries[index].key) == key {
                return Some((slot, index));
            }
            slot = (slot + 1) & mask;
        }
    }

    fn ensure_table(&mut self, len: usize) -> TrackerResult<()> {
        if self.table.is_some() && fits(len, self.table_capacity) {
            return Ok(());
        }
        let mut capacity = self.table_capacity.max(MIN_TABLE_CAPACITY);
        while !fits(len, capacity) {
            capacity *= 2;
        }
        self.rehash(capacity)
    }

    fn rehash(&mut self, capacity: usize) -> TrackerResult<()> {
        debug_assert!(capacity.is_power_of_two());
        let bytes = capacity * mem::size_of::<u32>();
        let table = self
            .arena
            .alloc_zeroed(bytes, mem::align_of::<u32>())
            .ok_or(TrackerError::OutOfMemory)?
            .cast::<u32>();

        let old = self.table.replace(table);
        let old_capacity = mem::replace(&mut self.table_capacity, capacity);
        if let Some(old) = old {
            // SAFETY: allocated by a previous `rehash` with `old_capacity` slots.
            unsafe {
                self.arena
                    .free(old.cast::<u8>(), old_capacity * mem::size_of::<u32>(), mem::align_of::<u32>())
            };
        }

        for index in 0..self.entries.len() {
            let hash = self.entries[index].key.llm_hash();
            // SAFETY: the fresh table is sparse enough to hold every entry.
            unsafe { self.insert_index(hash, index) };
        }
        Ok(())
    }

    /// # Safety
    ///
    /// The table must exist and have at least one free slot.
    unsafe fn insert_index(&mut self, hash: u32, index: usize) {
        let mask = self.table_capacity - 1;
        let mut slot = hash as usize & mask;
        while self.slot(slot) != 0 {
            slot = (slot + 1) & mask;
        }
        self.set_slot(slot, index as u32 + 1);
    }

    /// # Safety
    ///
    /// The table must exist and contain `index`.
    unsafe fn slot_of_entry(&self, hash: u32, index: usize) -> usize {
        let mask = self.table_capacity - 1;
        let wanted = index as u32 + 1;
        let mut slot = hash as usize & mask;
        while self.slot(slot) != wanted {
            slot = (slot + 1) & mask;
        }
        slot
    }

    /// Empty `hole` and pull later chain members back so that every
    /// remaining entry stays reachable from its home slot.
    ///
    /// # Safety
    ///
    /// The table must exist and `hole` must be occupied.
    unsafe fn delete_slot(&mut self, mut hole: usize) {
        let mask = self.table_capacity - 1;
        let mut probe = (hole + 1) & mask;
        loop {
            let value = self.slot(probe);
            if value == 0 {
                break;
            }
            let home = self.entries[value as usize - 1].key.llm_hash() as usize & mask;
            // Move the entry if its home is not cyclically inside (hole, probe].
            if (probe.wrapping_sub(home) & mask) >= (probe.wrapping_sub(hole) & mask) {
                self.set_slot(hole, value);
                hole = probe;
            }
            probe = (probe + 1) & mask;
        }
        self.set_slot(hole, 0);
    }

    #[inline]
    unsafe fn slot(&self, slot: usize) -> u32 {
        match self.table {
            Some(table) => *table.as_ptr().add(slot),
            None => 0,
        }
    }

    #[inline]
    unsafe fn set_slot(&mut self, slot: usize, value: u32) {
        if let Some(table) = self.table {
            *table.as_ptr().add(slot) = value;
        }
    }
}

impl<K, V1, V2> Drop for LlmMap<K, V1, V2> {
    fn drop(&mut self) {
        if let Some(table) = self.table.take() {
            // SAFETY: allocated by `rehash` with `table_capacity` slots.
            unsafe {
                self.arena.free(
                    table.cast::<u8>(),
                    self.table_capacity * mem::size_of::<u32>(),
                    mem::align_of::<u32>(),
                )
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::hash::Address;

    fn arena() -> Arc<LlmArena> {
        Arc::new(LlmArena::default())
    }

    #[test]
    fn test_add_find_overwrite() {
        let mut map: LlmMap<u32, u64, bool> = LlmMap::new(arena());
        assert!(map.find(&1).is_none());

        map.add(1, 100, true).unwrap();
        map.add(2, 200, false).unwrap();
        assert_eq!(map.find(&1), Some((&100, &true)));

        map.add(1, 150, false).unwrap();
        assert_eq!(map.find(&1), Some((&150, &false)));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_growth_keeps_load_low() {
        let mut map: LlmMap<u32, u32, u32> = LlmMap::new(arena());
        for key in 0..1000 {
            map.add(key, key * 2, key * 3).unwrap();
            assert!(map.len() * LOAD_DENOMINATOR <= map.table_capacity() * LOAD_NUMERATOR);
        }
        for key in 0..1000 {
            assert_eq!(map.find(&key), Some((&(key * 2), &(key * 3))));
        }
    }

    #[test]
    fn test_remove_with_colliding_chain() {
        // Addresses 16 bytes apart within the same 16-byte bucket share a hash.
        let mut map: LlmMap<Address, u32, ()> = LlmMap::new(arena());
        let keys = [0x1000, 0x1004, 0x1008, 0x100C, 0x1010];
        for (i, &k) in keys.iter().enumerate() {
            map.add(Address(k), i as u32, ()).unwrap();
        }

        assert_eq!(map.remove(&Address(0x1004)), Some((1, ())));
        assert!(!map.has_key(&Address(0x1004)));
        for (i, &k) in keys.iter().enumerate() {
            if k != 0x1004 {
                assert_eq!(map.find(&Address(k)), Some((&(i as u32), &())), "key {:#x}", k);
            }
        }

        assert_eq!(map.remove(&Address(0x1000)), Some((0, ())));
        assert_eq!(map.remove(&Address(0x100C)), Some((3, ())));
        assert_eq!(map.find(&Address(0x1008)), Some((&2, &())));
        assert_eq!(map.find(&Address(0x1010)), Some((&4, &())));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_remove_missing() {
        let mut map: LlmMap<u32, u32, u32> = LlmMap::new(arena());
        assert_eq!(map.remove(&7), None);
        map.add(7, 1, 2).unwrap();
        assert_eq!(map.remove(&7), Some((1, 2)));
        assert_eq!(map.remove(&7), None);
        assert!(map.is_empty());
    }

    #[test]
    fn test_borrowed_str_lookup() {
        let arena = arena();
        let mut map: LlmMap<crate::allocators::arena::ArenaStr, u32, ()> = LlmMap::new(arena.clone());
        map.add(arena.alloc_str("Rendering").unwrap(), 1, ()).unwrap();
        map.add(arena.alloc_str("Audio").unwrap(), 2, ()).unwrap();
        assert_eq!(map.find("Audio"), Some((&2, &())));
        assert!(map.find("Physics").is_none());
    }

    #[test]
    fn test_iteration_follows_insertion() {
        let mut map: LlmMap<u32, u32, ()> = LlmMap::new(arena());
        for key in [5, 3, 9] {
            map.add(key, key, ()).unwrap();
        }
        let keys: Vec<u32> = map.keys().copied().collect();
        assert_eq!(keys, vec![5, 3, 9]);
    }

    #[test]
    fn test_trim_shrinks_table() {
        let mut map: LlmMap<u64, u64, u64> = LlmMap::new(arena());
        for key in 0..5000 {
            map.add(key, key, key).unwrap();
        }
        let large = map.table_capacity();
        for key in 10..5000 {
            map.remove(&key);
        }
        map.trim().unwrap();
        assert!(map.table_capacity() < large);
        for key in 0..10 {
            assert_eq!(map.find(&key), Some((&key, &key)));
        }
    }

    #[test]
    fn test_clear() {
        let mut map: LlmMap<u32, u32, u32> = LlmMap::new(arena());
        map.add(1, 1, 1).unwrap();
        map.clear();
        assert!(map.is_empty());
        assert!(map.find(&1).is_none());
        map.add(1, 2, 2).unwrap();
        assert_eq!(map.find(&1), Some((&2, &2)));
    }
}
