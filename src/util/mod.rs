//! Small helpers shared across the crate.

pub(crate) mod layout;
pub(crate) mod size;
pub mod topo;
