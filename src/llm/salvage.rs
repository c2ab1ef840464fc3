//! JSON salvage for model output that is almost, but not quite, JSON.
//!
//! Salvage order:
//! 1. raw parse;
//! 2. strip a single fenced code block;
//! 3. largest balanced `{…}` or `[…]` substring that parses.

use serde_json::Value;

pub fn salvage_json(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Some(v);
    }

    if let Some(inner) = strip_fenced_block(trimmed) {
        if let Ok(v) = serde_json::from_str::<Value>(inner.trim()) {
            return Some(v);
        }
    }

    let mut spans = balanced_spans(trimmed);
    spans.sort_by_key(|s| std::cmp::Reverse(s.len()));
    for span in spans {
        if let Ok(v) = serde_json::from_str::<Value>(span) {
            return Some(v);
        }
    }

    None
}

/// Contents of the first ``` fence, tolerating a language tag on the opening
/// line (```json).
fn strip_fenced_block(s: &str) -> Option<&str> {
    let open = s.find("```")?;
    let after_open = &s[open + 3..];
    // Skip the language tag (everything up to the first newline).
    let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_open[body_start..];
    let close = body.find("```")?;
    Some(&body[..close])
}

/// Top-level balanced `{…}` / `[…]` spans, honoring JSON string and escape
/// rules so braces inside strings don't break the depth count.
fn balanced_spans(s: &str) -> Vec<&str> {
    let bytes = s.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let open = bytes[i];
        if open != b'{' && open != b'[' {
            i += 1;
            continue;
        }
        let close = if open == b'{' { b'}' } else { b']' };

        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        let mut end = None;

        for (j, &b) in bytes.iter().enumerate().skip(i) {
            if in_string {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    in_string = false;
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                _ if b == open => depth += 1,
                _ if b == close => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        end = Some(j);
                        break;
                    }
                }
                _ => {}
            }
        }

        match end {
            Some(j) => {
                spans.push(&s[i..=j]);
                i = j + 1;
            }
            None => i += 1,
        }
    }

    spans
}
