//! Size helper functions.

/// Convert kilobytes to bytes.
#[inline]
pub const fn kb(n: usize) -> usize {
    n * 1024
}

/// Format a signed byte count as a human-readable string.
///
/// Tracked sizes are deltas and can dip below zero when frees are
/// attributed to a thread that did not perform the matching allocation.
pub fn format_bytes(bytes: i64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let sign = if bytes < 0 { "-" } else { "" };
    let abs = bytes.unsigned_abs() as f64;

    if abs >= GB {
        format!("{}{:.2} GB", sign, abs / GB)
    } else if abs >= MB {
        format!("{}{:.2} MB", sign, abs / MB)
    } else if abs >= KB {
        format!("{}{:.2} KB", sign, abs / KB)
    } else {
        format!("{}{} B", sign, bytes.unsigned_abs())
    }
}
