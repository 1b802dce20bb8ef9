//! Miscellaneous helper utilities.
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Render opaque engine bytes (session handles, keyset ids) for logs.
#[must_use]
pub fn to_hex(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "<empty>".to_string();
    }
    hex::encode(bytes)
}

/// Seconds since the Unix epoch, or 0 if the clock is before it.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Ensure a file path's parent directory exists.
pub fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
