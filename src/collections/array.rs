//! Growable array backed by the tracker arena.

use std::mem::{self, MaybeUninit};
use std::ops::{Index, IndexMut};
use std::ptr::{self, NonNull};
use std::sync::Arc;

use crate::allocators::arena::LlmArena;
use crate::api::error::{TrackerError, TrackerResult};
use crate::util::layout::round_up_to_multiple;

/// Elements stored inline before the arena is touched.
pub const INLINE_CAPACITY: usize = 64;

/// A dynamic array whose storage comes from an [`LlmArena`].
///
/// The first [`INLINE_CAPACITY`] elements live inside the struct itself.
/// Past that, capacity grows by 1.5x, rounded up to a whole arena page worth
/// of items. [`LlmArray::trim`] hands memory back once utilization drops
/// under 75%.
pub struct LlmArray<T> {
    arena: Arc<LlmArena>,
    inline: [MaybeUninit<T>; INLINE_CAPACITY],
    heap: Option<NonNull<T>>,
    len: usize,
    capacity: usize,
}

// SAFETY: the array owns its elements; the heap pointer is uniquely owned.
unsafe impl<T: Send> Send for LlmArray<T> {}
unsafe impl<T: Sync> Sync for LlmArray<T> {}

impl<T> LlmArray<T> {
    /// Create an empty array.
    pub fn new(arena: Arc<LlmArena>) -> Self {
        assert!(mem::size_of::<T>() != 0, "zero-sized elements are not supported");
        Self {
            arena,
            // SAFETY: an array of `MaybeUninit` needs no initialization.
            inline: unsafe { MaybeUninit::<[MaybeUninit<T>; INLINE_CAPACITY]>::uninit().assume_init() },
            heap: None,
            len: 0,
            capacity: INLINE_CAPACITY,
        }
    }

    /// Number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the array is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current capacity in elements.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the elements currently live in arena memory.
    pub fn is_spilled(&self) -> bool {
        self.heap.is_some()
    }

    #[inline]
    fn data(&self) -> *const T {
        match self.heap {
            Some(ptr) => ptr.as_ptr(),
            None => self.inline.as_ptr() as *const T,
        }
    }

    #[inline]
    fn data_mut(&mut self) -> *mut T {
        match self.heap {
            Some(ptr) => ptr.as_ptr(),
            None => self.inline.as_mut_ptr() as *mut T,
        }
    }

    /// View the elements as a slice.
    #[inline]
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: the first `len` elements are initialized.
        unsafe { std::slice::from_raw_parts(self.data(), self.len) }
    }

    /// View the elements as a mutable slice.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        let len = self.len;
        // SAFETY: the first `len` elements are initialized.
        unsafe { std::slice::from_raw_parts_mut(self.data_mut(), len) }
    }

    /// Iterate over the elements.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    /// Iterate mutably over the elements.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.as_mut_slice().iter_mut()
    }

    /// Get an element.
    pub fn get(&self, index: usize) -> Option<&T> {
        self.as_slice().get(index)
    }

    /// Get an element mutably.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.as_mut_slice().get_mut(index)
    }

    /// Last element.
    pub fn last(&self) -> Option<&T> {
        self.as_slice().last()
    }

    /// Append an element.
    pub fn push(&mut self, value: T) -> TrackerResult<()> {
        if self.len == self.capacity {
            self.reserve(self.len + 1)?;
        }
        // SAFETY: len < capacity after reserve.
        unsafe { ptr::write(self.data_mut().add(self.len), value) };
        self.len += 1;
        Ok(())
    }

    /// Remove the last element.
    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        // SAFETY: the element at the old `len - 1` is initialized and now outside the live range.
        Some(unsafe { ptr::read(self.data().add(self.len)) })
    }

    /// Insert an element at `index`, shifting later elements up.
    pub fn insert(&mut self, index: usize, value: T) -> TrackerResult<()> {
        assert!(index <= self.len, "insert index {} out of bounds (len {})", index, self.len);
        if self.len == self.capacity {
            self.reserve(self.len + 1)?;
        }
        // SAFETY: capacity > len, so shifting [index, len) up by one stays in bounds.
        unsafe {
            let base = self.data_mut().add(index);
            ptr::copy(base, base.add(1), self.len - index);
            ptr::write(base, value);
        }
        self.len += 1;
        Ok(())
    }

    /// Remove the element at `index`, shifting later elements down.
    pub fn remove(&mut self, index: usize) -> T {
        assert!(index < self.len, "remove index {} out of bounds (len {})", index, self.len);
        // SAFETY: index < len; the tail is shifted over the read slot.
        unsafe {
            let base = self.data_mut().add(index);
            let value = ptr::read(base);
            ptr::copy(base.add(1), base, self.len - index - 1);
            self.len -= 1;
            value
        }
    }

    /// Remove the element at `index`, moving the last element into its place.
    pub fn swap_remove(&mut self, index: usize) -> T {
        assert!(index < self.len, "swap_remove index {} out of bounds (len {})", index, self.len);
        let last = self.len - 1;
        self.as_mut_slice().swap(index, last);
        // `pop` cannot fail: len > 0.
        match self.pop() {
            Some(value) => value,
            None => unreachable!(),
        }
    }

    /// Drop all elements, keeping capacity.
    pub fn clear(&mut self) {
        let len = self.len;
        self.len = 0;
        // SAFETY: the first `len` elements were initialized; `len` is reset first
        // so a panicking destructor cannot cause a double drop.
        unsafe { ptr::drop_in_place(std::slice::from_raw_parts_mut(self.data_mut(), len)) };
    }

    fn items_per_page(&self) -> usize {
        (self.arena.page_size() / mem::size_of::<T>()).max(1)
    }

    /// Make room for at least `min_capacity` elements.
    pub fn reserve(&mut self, min_capacity: usize) -> TrackerResult<()> {
        if min_capacity <= self.capacity {
            return Ok(());
        }
        let grown = self.capacity + self.capacity / 2;
        let target = round_up_to_multiple(min_capacity.max(grown), self.items_per_page());
        self.reallocate(target)
    }

    /// Shrink capacity once less than 75% of it is in use.
    pub fn trim(&mut self) -> TrackerResult<()> {
        if self.heap.is_none() || self.len * 4 >= self.capacity * 3 {
            return Ok(());
        }
        let target = if self.len <= INLINE_CAPACITY {
            INLINE_CAPACITY
        } else {
            round_up_to_multiple(self.len, self.items_per_page())
        };
        if target < self.capacity {
            self.reallocate(target)?;
        }
        Ok(())
    }

    fn reallocate(&mut self, new_capacity: usize) -> TrackerResult<()> {
        debug_assert!(new_capacity >= self.len);

        let new_heap = if new_capacity <= INLINE_CAPACITY {
            None
        } else {
            let bytes = new_capacity
                .checked_mul(mem::size_of::<T>())
                .ok_or(TrackerError::OutOfMemory)?;
            let ptr = self
                .arena
                .alloc(bytes, mem::align_of::<T>())
                .ok_or(TrackerError::OutOfMemory)?;
            Some(ptr.cast::<T>())
        };

        let old_data = self.data_mut();
        let old_heap = self.heap;
        let old_capacity = self.capacity;

        let new_data = match new_heap {
            Some(ptr) => ptr.as_ptr(),
            None => self.inline.as_mut_ptr() as *mut T,
        };
        if new_data != old_data {
            // SAFETY: distinct buffers, both hold at least `len` elements.
            unsafe { ptr::copy_nonoverlapping(old_data, new_data, self.len) };
        }

        if let Some(old) = old_heap {
            // SAFETY: allocated by `reallocate` with exactly this size and alignment.
            unsafe {
                self.arena.free(
                    old.cast::<u8>(),
                    old_capacity * mem::size_of::<T>(),
                    mem::align_of::<T>(),
                )
            };
        }

        self.heap = new_heap;
        self.capacity = new_capacity.max(INLINE_CAPACITY);
        Ok(())
    }
}

impl<T> Drop for LlmArray<T> {
    fn drop(&mut self) {
        self.clear();
        if let Some(heap) = self.heap.take() {
            // SAFETY: allocated by `reallocate` with this capacity.
            unsafe {
                self.arena.free(
                    heap.cast::<u8>(),
                    self.capacity * mem::size_of::<T>(),
                    mem::align_of::<T>(),
                )
            };
        }
    }
}

impl<T> Index<usize> for LlmArray<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.as_slice()[index]
    }
}

impl<T> IndexMut<usize> for LlmArray<T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        &mut self.as_mut_slice()[index]
    }
}

impl<'a, T> IntoIterator for &'a LlmArray<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for LlmArray<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> Arc<LlmArena> {
        Arc::new(LlmArena::default())
    }

    #[test]
    fn test_inline_then_spill() {
        let arena = arena();
        let mut array = LlmArray::new(arena.clone());

        for i in 0..INLINE_CAPACITY as u64 {
            array.push(i).unwrap();
        }
        assert!(!array.is_spilled());
        assert_eq!(arena.stats().used_bytes, 0);

        array.push(64).unwrap();
        assert!(array.is_spilled());
        // 16 KiB page / 8-byte items
        assert_eq!(array.capacity(), 2048);

        for (i, value) in array.iter().enumerate() {
            assert_eq!(*value, i as u64);
        }
    }

    #[test]
    fn test_pop_and_remove() {
        let mut array = LlmArray::new(arena());
        assert_eq!(array.pop(), None);

        for i in 0..5u32 {
            array.push(i).unwrap();
        }
        assert_eq!(array.pop(), Some(4));
        assert_eq!(array.remove(1), 1);
        assert_eq!(array.as_slice(), &[0, 2, 3]);
        assert_eq!(array.swap_remove(0), 0);
        assert_eq!(array.as_slice(), &[3, 2]);
    }

    #[test]
    fn test_insert_keeps_order() {
        let mut array = LlmArray::new(arena());
        for value in [10u32, 30, 50] {
            array.push(value).unwrap();
        }
        array.insert(1, 20).unwrap();
        array.insert(4, 60).unwrap();
        array.insert(0, 0).unwrap();
        assert_eq!(array.as_slice(), &[0, 10, 20, 30, 50, 60]);
    }

    #[test]
    fn test_trim_returns_to_inline() {
        let arena = arena();
        let mut array = LlmArray::new(arena.clone());
        for i in 0..1000u64 {
            array.push(i).unwrap();
        }
        while array.len() > 10 {
            array.pop();
        }
        array.trim().unwrap();
        assert!(!array.is_spilled());
        assert_eq!(array.capacity(), INLINE_CAPACITY);
        assert_eq!(array.as_slice(), &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(arena.stats().used_bytes, 0);
    }

    #[test]
    fn test_trim_keeps_well_used_storage() {
        let mut array = LlmArray::new(arena());
        for i in 0..2048u64 {
            array.push(i).unwrap();
        }
        let capacity = array.capacity();
        array.trim().unwrap();
        assert_eq!(array.capacity(), capacity);
    }

    #[test]
    fn test_drop_runs_destructors() {
        use std::rc::Rc;

        let counter = Rc::new(());
        {
            let mut array = LlmArray::new(arena());
            for _ in 0..100 {
                array.push(counter.clone()).unwrap();
            }
            assert_eq!(Rc::strong_count(&counter), 101);
        }
        assert_eq!(Rc::strong_count(&counter), 1);
    }

    #[test]
    fn test_growth_failure_is_reported() {
        let arena = Arc::new(LlmArena::with_limit(4096, 4096));
        let mut array = LlmArray::new(arena);
        let mut result = Ok(());
        for i in 0..10_000u64 {
            result = array.push(i);
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result, Err(TrackerError::OutOfMemory));
    }

    #[test]
    #[should_panic]
    fn test_index_out_of_bounds() {
        let array: LlmArray<u32> = LlmArray::new(arena());
        let _value: u32 = array[0];
    }
}
