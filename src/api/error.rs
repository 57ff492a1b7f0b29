//! Tracker error type.

use std::fmt;

/// Errors reported by the tracker's fallible operations.
///
/// None of these ever cross the allocation hook boundary: hooks swallow
/// them and, for [`TrackerError::OutOfMemory`], disable tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    /// The tracker's private arena could not obtain memory from the OS.
    OutOfMemory,
    /// Tag construction was already finished.
    AlreadyConstructed,
    /// An enum tag value was used that was never seeded.
    UnknownEnumTag(u8),
    /// The tracker is disabled (by configuration, shutdown or exhaustion).
    Disabled,
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerError::OutOfMemory => write!(f, "tracker arena out of memory"),
            TrackerError::AlreadyConstructed => write!(f, "tag construction already finished"),
            TrackerError::UnknownEnumTag(tag) => write!(f, "enum tag {} was never seeded", tag),
            TrackerError::Disabled => write!(f, "memory tracking is disabled"),
        }
    }
}

impl std::error::Error for TrackerError {}

/// Result alias used throughout the crate.
pub type TrackerResult<T> = Result<T, TrackerError>;
