//! Helpers that keep log lines single-line and bounded when they carry device text or raw
//! link bytes.

use std::fmt::Write;

/// Longest preview of user text written to a log line
const MAX_PREVIEW: usize = 200;

/// Escape a string for single-line logging: newlines, tabs and other control characters
/// become escapes, backslashes are doubled, and text past [`MAX_PREVIEW`] characters is cut
/// with an ellipsis. Channel names and text messages come straight off the mesh, so anything
/// user-controlled goes through here before it is logged.
pub fn escape_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Lowercase hex of the first `max` bytes, with a marker when the input was longer.
pub fn hex_snippet(data: &[u8], max: usize) -> String {
    let mut out = String::with_capacity(max.min(data.len()) * 2 + 4);
    for b in data.iter().take(max) {
        let _ = write!(&mut out, "{:02x}", b);
    }
    if data.len() > max {
        out.push_str("..");
    }
    out
}
