//! Containers for tracker bookkeeping.
//!
//! Both containers draw their memory from an [`LlmArena`](crate::allocators::arena::LlmArena)
//! instead of the global allocator, so growing a table inside an allocation
//! hook never recurses into the hook.

pub mod array;
pub mod hash;
pub mod map;

pub use array::LlmArray;
pub use hash::{Address, LlmHash};
pub use map::LlmMap;
