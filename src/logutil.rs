//! Logging helpers that keep message bodies and raw link bytes on a single, bounded log line.

use std::fmt::Write;

const MAX_PREVIEW_CHARS: usize = 120;
const MAX_HEX_BYTES: usize = 32;

/// Escape a message body for single-line logging.
///
/// Newlines, carriage returns, tabs and backslashes are written as their escape
/// sequences, other control characters as `\xNN`. Bodies longer than
/// `MAX_PREVIEW_CHARS` characters are cut and end with an ellipsis.
pub fn escape_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW_CHARS) + 4);
    for (count, ch) in s.chars().enumerate() {
        if count == MAX_PREVIEW_CHARS {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Render link bytes as space separated hex, e.g. `0x22` or `00 01 ff (+3 more)`.
pub fn hex_bytes(data: &[u8]) -> String {
    if let [single] = data {
        return format!("0x{:02x}", single);
    }
    let mut out = data
        .iter()
        .take(MAX_HEX_BYTES)
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ");
    if data.len() > MAX_HEX_BYTES {
        let _ = write!(out, " (+{} more)", data.len() - MAX_HEX_BYTES);
    }
    out
}
