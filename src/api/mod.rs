//! Public API for tagtrack.
//!
//! This module contains all user-facing types and functions.
//! Most users only need the re-exports at the crate root.

pub mod builder;
pub mod config;
pub mod error;
pub mod global_alloc;
pub mod report;
pub mod scope;
pub mod tag;
pub mod tracker;
