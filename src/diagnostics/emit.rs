//! Diagnostic emission backend.
//!
//! Handles outputting diagnostics to stderr, the `log` crate, or custom sinks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::kind::{Diagnostic, DiagnosticKind};
use super::strict::{should_panic, should_panic_on_warning};
use crate::sync::mutex::Mutex;

/// Global flag to suppress diagnostic output (for testing).
static DIAGNOSTICS_SUPPRESSED: AtomicBool = AtomicBool::new(false);

/// Suppress all diagnostic output. Sinks still receive diagnostics.
pub fn suppress_diagnostics(suppress: bool) {
    DIAGNOSTICS_SUPPRESSED.store(suppress, Ordering::Relaxed);
}

/// Check if diagnostics are suppressed.
pub fn is_suppressed() -> bool {
    DIAGNOSTICS_SUPPRESSED.load(Ordering::Relaxed)
}

/// Emit a diagnostic.
///
/// With the `log` feature the diagnostic goes through the `log` crate.
/// Otherwise it is written to stderr in debug builds, or in release builds
/// with the `diagnostics` feature. Strict mode may turn it into a panic.
pub fn emit(diag: &Diagnostic) {
    emit_inner(diag, None, true);
}

/// Emit a diagnostic with additional runtime context.
pub fn emit_with_context(diag: &Diagnostic, context: &str) {
    emit_inner(diag, Some(context), true);
}

fn emit_inner(diag: &Diagnostic, context: Option<&str>, allow_panic: bool) {
    if !is_suppressed() {
        write_out(diag, context);
    }

    if allow_panic && strict_panic(diag) {
        match context {
            Some(context) => panic!(
                "[tagtrack][{}] {}\nContext: {}\nStrict mode enabled - diagnostics are fatal.",
                diag.code, diag.message, context
            ),
            None => panic!(
                "[tagtrack][{}] {}\nStrict mode enabled - diagnostics are fatal.",
                diag.code, diag.message
            ),
        }
    }
}

fn strict_panic(diag: &Diagnostic) -> bool {
    match diag.kind {
        DiagnosticKind::Error => should_panic(),
        DiagnosticKind::Warning => should_panic_on_warning(),
        DiagnosticKind::Note => false,
    }
}

#[cfg(feature = "log")]
fn write_out(diag: &Diagnostic, context: Option<&str>) {
    match diag.kind {
        DiagnosticKind::Error => log::error!("[{}] {}", diag.code, diag.message),
        DiagnosticKind::Warning => log::warn!("[{}] {}", diag.code, diag.message),
        DiagnosticKind::Note => log::info!("[{}] {}", diag.code, diag.message),
    }

    if let Some(context) = context {
        log::info!("  context: {}", context);
    }
    if let Some(note) = diag.note {
        log::info!("  note: {}", note);
    }
    if let Some(help) = diag.help {
        log::info!("  help: {}", help);
    }
}

#[cfg(all(not(feature = "log"), any(debug_assertions, feature = "diagnostics")))]
fn write_out(diag: &Diagnostic, context: Option<&str>) {
    use std::io::Write;

    let mut stderr = std::io::stderr().lock();

    let _ = writeln!(
        stderr,
        "[tagtrack][{}] {}: {}",
        diag.code,
        diag.kind.prefix(),
        diag.message
    );
    if let Some(context) = context {
        let _ = writeln!(stderr, "  context: {}", context);
    }
    if let Some(note) = diag.note {
        let _ = writeln!(stderr, "  note: {}", note);
    }
    if let Some(help) = diag.help {
        let _ = writeln!(stderr, "  help: {}", help);
    }
    let _ = writeln!(stderr);
}

#[cfg(all(not(feature = "log"), not(any(debug_assertions, feature = "diagnostics"))))]
fn write_out(_diag: &Diagnostic, _context: Option<&str>) {}

/// A diagnostic sink trait for custom output.
pub trait DiagnosticSink: Send + Sync {
    /// Handle a diagnostic. `context` names the tag or value involved.
    fn emit(&self, diag: &Diagnostic, context: Option<&str>);
}

/// A diagnostic captured by [`CollectingSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedDiagnostic {
    /// The diagnostic.
    pub diagnostic: Diagnostic,
    /// Runtime context, if any.
    pub context: Option<String>,
}

/// A simple sink that collects diagnostics.
#[derive(Default)]
pub struct CollectingSink {
    diagnostics: Mutex<Vec<CollectedDiagnostic>>,
}

impl CollectingSink {
    /// Create a new collecting sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all collected diagnostics.
    pub fn diagnostics(&self) -> Vec<CollectedDiagnostic> {
        self.diagnostics.lock().clone()
    }

    /// Number of collected diagnostics with the given code.
    pub fn count(&self, code: &str) -> usize {
        self.diagnostics
            .lock()
            .iter()
            .filter(|d| d.diagnostic.code == code)
            .count()
    }

    /// Clear collected diagnostics.
    pub fn clear(&self) {
        self.diagnostics.lock().clear();
    }

    /// Check if any errors were collected.
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .lock()
            .iter()
            .any(|d| d.diagnostic.kind == DiagnosticKind::Error)
    }
}

impl DiagnosticSink for CollectingSink {
    fn emit(&self, diag: &Diagnostic, context: Option<&str>) {
        self.diagnostics.lock().push(CollectedDiagnostic {
            diagnostic: diag.clone(),
            context: context.map(str::to_owned),
        });
    }
}

/// Per-tracker diagnostic channel: forwards to the tracker's sink (if any)
/// and to the global output.
#[derive(Clone, Default)]
pub(crate) struct Reporter {
    sink: Option<Arc<dyn DiagnosticSink>>,
}

impl Reporter {
    pub(crate) fn new(sink: Option<Arc<dyn DiagnosticSink>>) -> Self {
        Self { sink }
    }

    /// Report from an API path. Strict mode may panic here.
    pub(crate) fn report(&self, diag: &Diagnostic, context: Option<&str>) {
        self.forward(diag, context);
        emit_inner(diag, context, true);
    }

    /// Report from an allocation hook. Never panics.
    pub(crate) fn report_quiet(&self, diag: &Diagnostic, context: Option<&str>) {
        self.forward(diag, context);
        emit_inner(diag, context, false);
    }

    fn forward(&self, diag: &Diagnostic, context: Option<&str>) {
        if let Some(sink) = &self.sink {
            sink.emit(diag, context);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::kind::{LT101, LT102};

    #[test]
    fn test_collecting_sink() {
        let sink = CollectingSink::new();
        sink.emit(&LT101, Some("Audio"));
        sink.emit(&LT102, None);

        assert_eq!(sink.diagnostics().len(), 2);
        assert_eq!(sink.count("LT101"), 1);
        assert_eq!(sink.diagnostics()[0].context.as_deref(), Some("Audio"));
        assert!(sink.has_errors());

        sink.clear();
        assert_eq!(sink.diagnostics().len(), 0);
        assert!(!sink.has_errors());
    }

    #[test]
    fn test_reporter_forwards_to_sink() {
        let sink = Arc::new(CollectingSink::new());
        let reporter = Reporter::new(Some(sink.clone()));
        reporter.report_quiet(&LT102, Some("Missing"));
        assert_eq!(sink.count("LT102"), 1);
    }

    #[test]
    fn test_suppression() {
        suppress_diagnostics(true);
        assert!(is_suppressed());
        suppress_diagnostics(false);
        assert!(!is_suppressed());
    }
}
