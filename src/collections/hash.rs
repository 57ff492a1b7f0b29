//! Hashing for tracker maps.

/// Hash used by [`LlmMap`](super::map::LlmMap).
///
/// Deliberately cheap: tracker maps sit on the allocation path and their
/// keys are not adversarial.
pub trait LlmHash {
    /// 32-bit hash of the value.
    fn llm_hash(&self) -> u32;
}

/// An address used as a map key.
///
/// Allocation addresses are spread out well enough that dropping the low
/// alignment bits is all the mixing they need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(pub usize);

impl Address {
    /// Key for a raw pointer.
    pub fn of<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }
}

impl LlmHash for Address {
    #[inline]
    fn llm_hash(&self) -> u32 {
        (self.0 >> 4) as u32
    }
}

/// Murmur3 finalizer; integer keys are often dense, so they need real mixing.
#[inline]
fn mix64(mut value: u64) -> u32 {
    value ^= value >> 33;
    value = value.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
    value ^= value >> 33;
    value = value.wrapping_mul(0xC4CE_B9FE_1A85_EC53);
    value ^= value >> 33;
    value as u32
}

macro_rules! impl_int_hash {
    ($($ty:ty),*) => {
        $(
            impl LlmHash for $ty {
                #[inline]
                fn llm_hash(&self) -> u32 {
                    mix64(*self as u64)
                }
            }
        )*
    };
}

impl_int_hash!(u8, u16, u32, u64, usize, i32, i64);

impl LlmHash for str {
    /// FNV-1a.
    fn llm_hash(&self) -> u32 {
        let mut hash: u32 = 0x811C_9DC5;
        for byte in self.bytes() {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        hash
    }
}

impl LlmHash for crate::allocators::arena::ArenaStr {
    fn llm_hash(&self) -> u32 {
        self.as_str().llm_hash()
    }
}

impl<T: LlmHash + ?Sized> LlmHash for &T {
    #[inline]
    fn llm_hash(&self) -> u32 {
        (**self).llm_hash()
    }
}
