//! Layout utilities.

/// Page size assumed for OS mappings.
pub const OS_PAGE_SIZE: usize = 4096;

/// Align a size up to the given alignment.
///
/// `align` must be a power of two.
#[inline]
pub const fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// Round `count` up to a whole multiple of `granule`.
///
/// Unlike [`align_up`] the granule does not have to be a power of two.
#[inline]
pub const fn round_up_to_multiple(count: usize, granule: usize) -> usize {
    if granule == 0 {
        return count;
    }
    (count + granule - 1) / granule * granule
}

/// Smallest power-of-two size class that holds `size` bytes at `align`.
#[inline]
pub fn size_class(size: usize, align: usize, min_class: usize) -> usize {
    size.max(align).max(min_class).next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(4097, OS_PAGE_SIZE), 8192);
    }

    #[test]
    fn test_round_up_to_multiple() {
        assert_eq!(round_up_to_multiple(0, 682), 0);
        assert_eq!(round_up_to_multiple(1, 682), 682);
        assert_eq!(round_up_to_multiple(683, 682), 1364);
        assert_eq!(round_up_to_multiple(5, 0), 5);
    }

    #[test]
    fn test_size_class() {
        assert_eq!(size_class(1, 1, 16), 16);
        assert_eq!(size_class(17, 8, 16), 32);
        assert_eq!(size_class(24, 64, 16), 64);
        assert_eq!(size_class(4096, 8, 16), 4096);
    }
}
