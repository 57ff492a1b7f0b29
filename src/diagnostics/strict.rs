//! Strict mode handling for diagnostics.
//!
//! Allows configuration of how diagnostics are treated:
//! - Warn: Just emit the diagnostic
//! - Panic: Emit and then panic (useful for CI)
//!
//! Allocation hooks never panic, whatever the mode.

use std::sync::atomic::{AtomicU8, Ordering};

/// Strict mode behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StrictMode {
    /// Just warn, don't panic.
    Warn = 0,
    /// Panic on errors.
    PanicOnError = 1,
    /// Panic on errors and warnings.
    PanicOnWarning = 2,
}

impl From<u8> for StrictMode {
    fn from(val: u8) -> Self {
        match val {
            1 => StrictMode::PanicOnError,
            2 => StrictMode::PanicOnWarning,
            _ => StrictMode::Warn,
        }
    }
}

/// Global strict mode setting.
static STRICT_MODE: AtomicU8 = AtomicU8::new(0);

/// Set the strict mode.
pub fn set_strict_mode(mode: StrictMode) {
    STRICT_MODE.store(mode as u8, Ordering::Relaxed);
}

/// Get the current strict mode.
pub fn strict_mode() -> StrictMode {
    StrictMode::from(STRICT_MODE.load(Ordering::Relaxed))
}

/// Check if errors should panic.
pub fn should_panic() -> bool {
    matches!(strict_mode(), StrictMode::PanicOnError | StrictMode::PanicOnWarning)
}

/// Check if warnings should panic.
pub fn should_panic_on_warning() -> bool {
    matches!(strict_mode(), StrictMode::PanicOnWarning)
}

/// RAII guard for temporarily setting strict mode.
pub struct StrictModeGuard {
    previous: StrictMode,
}

impl StrictModeGuard {
    /// Create a new guard that sets strict mode.
    pub fn new(mode: StrictMode) -> Self {
        let previous = strict_mode();
        set_strict_mode(mode);
        Self { previous }
    }
}

impl Drop for StrictModeGuard {
    fn drop(&mut self) {
        set_strict_mode(self.previous);
    }
}

/// Parse a `TAGTRACK_STRICT` value.
///
/// - "0", "warn", "false" -> Warn
/// - "1", "error", "true" -> PanicOnError
/// - "2", "warning", "all" -> PanicOnWarning
pub fn parse_strict_mode(value: &str) -> Option<StrictMode> {
    match value.trim().to_ascii_lowercase().as_str() {
        "0" | "warn" | "false" => Some(StrictMode::Warn),
        "1" | "error" | "true" => Some(StrictMode::PanicOnError),
        "2" | "warning" | "all" => Some(StrictMode::PanicOnWarning),
        _ => None,
    }
}

/// Initialize strict mode from the `TAGTRACK_STRICT` environment variable.
/// Unrecognized values leave the mode unchanged.
pub fn init_from_env() {
    if let Some(mode) = std::env::var("TAGTRACK_STRICT")
        .ok()
        .as_deref()
        .and_then(parse_strict_mode)
    {
        set_strict_mode(mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests here avoid changing the global mode: other tests emit errors
    // concurrently and would panic under a strict setting.

    #[test]
    fn test_parse_strict_mode() {
        assert_eq!(parse_strict_mode("0"), Some(StrictMode::Warn));
        assert_eq!(parse_strict_mode("Error"), Some(StrictMode::PanicOnError));
        assert_eq!(parse_strict_mode(" all "), Some(StrictMode::PanicOnWarning));
        assert_eq!(parse_strict_mode("sometimes"), None);
    }

    #[test]
    fn test_mode_from_u8() {
        assert_eq!(StrictMode::from(1), StrictMode::PanicOnError);
        assert_eq!(StrictMode::from(9), StrictMode::Warn);
    }

    #[test]
    fn test_default_is_warn() {
        assert_eq!(strict_mode(), StrictMode::Warn);
        assert!(!should_panic());
    }
}
