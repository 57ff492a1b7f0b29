//! # tagtrack
//!
//! Low-level hierarchical memory tag tracking for large native applications.
//!
//! ## Features
//!
//! - Named tags arranged in a parent/child hierarchy
//! - Up to 256 enum tags with O(1) lookup by value
//! - RAII tag scopes, nested per thread
//! - Thread-local counting on the allocation path (no global lock)
//! - Optional allocation map so frees are charged to the allocating tag
//! - Periodic merge into global totals with per-tag peaks
//! - External amounts for memory managed outside the instrumented allocator
//! - All bookkeeping lives in a private OS-backed arena
//!
//! ## Quick Start
//!
//! ```rust
//! use tagtrack::{TagDeclaration, TrackerBuilder, TrackerConfig};
//!
//! let tracker = TrackerBuilder::new(TrackerConfig::default())
//!     .declare_tag(TagDeclaration::new("Textures").with_parent("Rendering"))
//!     .declare_tag(TagDeclaration::new("Rendering"))
//!     .build()
//!     .unwrap();
//!
//! let textures = tracker.find_tag("Textures").unwrap();
//! {
//!     let _scope = tracker.scope(textures);
//!     // The host allocator calls these hooks.
//!     tracker.on_alloc(0x1000 as *const u8, 4096);
//! }
//!
//! tracker.update();
//! let report = tracker.report().unwrap();
//! assert_eq!(report.tag("Rendering").unwrap().rollup_size, 4096);
//! ```
//!
//! To track every heap allocation in a process, install the tracker with
//! [`install_global`] and register [`TrackingAllocator`] as the
//! `#[global_allocator]`.

pub mod allocators;
pub mod api;
pub mod collections;
pub mod diagnostics;
pub mod util;

mod core;
mod sync;

// Re-export public API at crate root for convenience
pub use api::builder::{default_tags, TrackerBuilder};
pub use api::config::{TagStorage, TrackerConfig};
pub use api::error::{TrackerError, TrackerResult};
pub use api::global_alloc::TrackingAllocator;
pub use api::report::{TagReport, TrackerReport, TrackerTagSizeData};
pub use api::scope::TagScope;
pub use api::tag::{Ancestors, ReferenceSource, TagData, TagDeclaration};
pub use api::tracker::{global, install_global, LowLevelTracker, OVERHEAD_TAG_NAME};

pub use allocators::arena::ArenaStats;

// Diagnostics - core types and predefined codes
pub use diagnostics::{CollectingSink, Diagnostic, DiagnosticKind, DiagnosticSink};
pub use diagnostics::{set_strict_mode, StrictMode, StrictModeGuard};
pub use diagnostics::{LT101, LT102, LT103, LT104, LT201, LT202, LT901};
