//! Synchronization primitives.
//!
//! Thin wrappers over std or parking_lot mutexes plus relaxed atomic gauges.

pub(crate) mod atomics;
pub(crate) mod mutex;
