//! Small shared helpers that don't warrant their own module.

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch, saturating on clock errors.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// First `len` characters of `s`, or the whole string if shorter.
pub fn short_prefix(s: &str, len: usize) -> &str {
    match s.char_indices().nth(len) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
