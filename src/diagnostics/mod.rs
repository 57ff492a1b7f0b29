//! Tracker diagnostics.
//!
//! Configuration mistakes and misuse never stop the host application. They
//! are reported once through coded diagnostics and tracking carries on in a
//! best-effort state.
//!
//! ## Diagnostic Codes
//!
//! | Code  | Meaning                        |
//! |-------|--------------------------------|
//! | LT1xx | Tag registry configuration     |
//! | LT2xx | Scope API misuse               |
//! | LT9xx | Internal errors                |
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use tagtrack::diagnostics::CollectingSink;
//! use tagtrack::{TagDeclaration, TrackerBuilder, TrackerConfig};
//!
//! let sink = Arc::new(CollectingSink::new());
//! let tracker = TrackerBuilder::new(TrackerConfig::default())
//!     .with_sink(sink.clone())
//!     .declare_tag(TagDeclaration::new("Audio/Voices").with_parent("Audio"))
//!     .build()
//!     .unwrap();
//!
//! // "Audio" was never declared.
//! assert_eq!(sink.count("LT102"), 1);
//! # drop(tracker);
//! ```

pub mod emit;
pub mod kind;
pub mod strict;

pub use emit::{emit, emit_with_context, suppress_diagnostics, CollectedDiagnostic, CollectingSink, DiagnosticSink};
pub use kind::{Diagnostic, DiagnosticKind};
pub use strict::{init_from_env, parse_strict_mode, set_strict_mode, strict_mode, StrictMode, StrictModeGuard};

pub use kind::{LT101, LT102, LT103, LT104, LT201, LT202, LT901};

pub(crate) use emit::Reporter;
