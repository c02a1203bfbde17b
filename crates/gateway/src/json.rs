//! JSON framing for streamed response chunks.
//!
//! The dispatcher wraps every chunk as `{"chunk": "<escaped>", "is_last":
//! <bool>}` and errors as `{"error": "<reason>"}`. The escaper works on raw
//! bytes so that anything a model emits survives the trip: quotes,
//! backslashes, control bytes and NULs are escaped, printable ASCII passes
//! through, and non-ASCII bytes are carried as `\u00XX` of the byte value.

/// Escape a byte string for embedding in a JSON string literal.
pub fn escape(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() + 8);
    for &b in bytes {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            0x08 => out.push_str("\\b"),
            0x0C => out.push_str("\\f"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x00..=0x1F | 0x80..=0xFF => {
                out.push_str(&format!("\\u{:04x}", b));
            }
            _ => out.push(b as char),
        }
    }
    out
}

/// Inverse of [`escape`]; `\u00XX` sequences decode back to single bytes.
pub fn unescape(s: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next()? {
            '"' => out.push(b'"'),
            '\\' => out.push(b'\\'),
            'b' => out.push(0x08),
            'f' => out.push(0x0C),
            'n' => out.push(b'\n'),
            'r' => out.push(b'\r'),
            't' => out.push(b'\t'),
            'u' => {
                let hex: String = chars.by_ref().take(4).collect();
                if hex.len() != 4 {
                    return None;
                }
                let value = u16::from_str_radix(&hex, 16).ok()?;
                if value <= 0xFF {
                    out.push(value as u8);
                } else {
                    let c = char::from_u32(u32::from(value))?;
                    let mut buf = [0u8; 4];
                    out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                }
            }
            _ => return None,
        }
    }
    Some(out)
}

/// Build one streamed chunk object.
pub fn chunk_object(payload: &[u8], is_last: bool) -> String {
    format!(
        "{{\"chunk\": \"{}\", \"is_last\": {}}}",
        escape(payload),
        is_last
    )
}

/// Build an error object surfaced to the client.
pub fn error_object(reason: &str) -> String {
    format!("{{\"error\": \"{}\"}}", escape(reason.as_bytes()))
}
