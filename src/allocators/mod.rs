//! Memory backends for the tracker's own data.
//!
//! **This is where the OS-facing `unsafe` code lives.**

pub mod arena;
