//! Tracker internals: tag registry, per-thread tables, global totals and the
//! allocation map.

pub(crate) mod alloc_map;
pub(crate) mod global;
pub(crate) mod registry;
pub(crate) mod thread;
