//! Diagnostic kinds and the predefined tracker diagnostics.
//!
//! Mirrors rustc's diagnostic levels for familiar UX.

/// The severity level of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// A hard error - something is definitely wrong.
    Error,
    /// A warning - something is probably wrong but tracking continues.
    Warning,
    /// Additional context about another diagnostic.
    Note,
}

impl DiagnosticKind {
    /// Get the display prefix for this kind.
    pub fn prefix(&self) -> &'static str {
        match self {
            DiagnosticKind::Error => "error",
            DiagnosticKind::Warning => "warning",
            DiagnosticKind::Note => "note",
        }
    }
}

/// A diagnostic message with code, message, and optional context.
///
/// Diagnostic codes follow the pattern:
/// - `LT1xx` - Tag registry configuration issues
/// - `LT2xx` - Scope API misuse
/// - `LT9xx` - Internal errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Severity level.
    pub kind: DiagnosticKind,
    /// Diagnostic code (e.g., "LT101").
    pub code: &'static str,
    /// Primary message.
    pub message: &'static str,
    /// Optional additional context.
    pub note: Option<&'static str>,
    /// Optional fix suggestion.
    pub help: Option<&'static str>,
}

impl Diagnostic {
    /// Create a new error diagnostic.
    pub const fn error(code: &'static str, message: &'static str) -> Self {
        Self {
            kind: DiagnosticKind::Error,
            code,
            message,
            note: None,
            help: None,
        }
    }

    /// Create a new warning diagnostic.
    pub const fn warning(code: &'static str, message: &'static str) -> Self {
        Self {
            kind: DiagnosticKind::Warning,
            code,
            message,
            note: None,
            help: None,
        }
    }

    /// Add a note to this diagnostic.
    pub const fn with_note(mut self, note: &'static str) -> Self {
        self.note = Some(note);
        self
    }

    /// Add a help message to this diagnostic.
    pub const fn with_help(mut self, help: &'static str) -> Self {
        self.help = Some(help);
        self
    }
}

// =============================================================================
// Predefined diagnostics (LT1xx - Tag registry)
// =============================================================================

/// LT101: Tag registered twice with different properties.
pub const LT101: Diagnostic = Diagnostic::error(
    "LT101",
    "tag registered twice with conflicting properties"
).with_note("the first definition of the tag is kept")
 .with_help("make every declaration of this tag agree on display name, parent and stat names");

/// LT102: Parent name does not match any tag.
pub const LT102: Diagnostic = Diagnostic::warning(
    "LT102",
    "parent tag name does not match any registered tag"
).with_note("the tag is treated as a root")
 .with_help("check the parent name for typos, or declare the parent tag");

/// LT103: Cycle in the parent graph.
pub const LT103: Diagnostic = Diagnostic::warning(
    "LT103",
    "cycle detected in tag parent graph"
).with_note("the parent link closing the cycle was dropped; the tag becomes a root")
 .with_help("fix the parent names so that the hierarchy is a tree");

/// LT104: Enum tag value claimed by two tags.
pub const LT104: Diagnostic = Diagnostic::error(
    "LT104",
    "enum tag value is already used by another tag"
).with_note("the first tag keeps the enum value")
 .with_help("give every enum tag a distinct value");

// =============================================================================
// Predefined diagnostics (LT2xx - Scope misuse)
// =============================================================================

/// LT201: Scope entered with an enum value that was never seeded.
pub const LT201: Diagnostic = Diagnostic::error(
    "LT201",
    "tag scope entered with an unregistered enum tag"
).with_note("allocations in this scope are charged to the untagged bucket")
 .with_help("seed the enum tag on the tracker builder before using it");

/// LT202: Scopes released out of order.
pub const LT202: Diagnostic = Diagnostic::error(
    "LT202",
    "tag scopes released out of order"
).with_note("the scope being released is not the innermost active scope")
 .with_help("drop tag scope guards in reverse order of creation");

// =============================================================================
// Predefined diagnostics (LT9xx - Internal)
// =============================================================================

/// LT901: Tracker arena could not get memory from the OS.
pub const LT901: Diagnostic = Diagnostic::error(
    "LT901",
    "tracker arena exhausted"
).with_note("memory tracking has been disabled for the rest of the run")
 .with_help("raise TrackerConfig::arena_limit or check system memory");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predefined_codes() {
        assert_eq!(LT101.code, "LT101");
        assert_eq!(LT101.kind, DiagnosticKind::Error);
        assert_eq!(LT103.kind, DiagnosticKind::Warning);
        assert!(LT901.note.is_some());
    }
}
