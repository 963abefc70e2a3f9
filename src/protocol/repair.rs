//! Bounded JSON repair for tool-call payloads.
//!
//! Models emit almost-JSON: single quotes, trailing commas, clipped braces,
//! markdown fences. Each repair is a single bounded pass; anything still
//! unparseable after all passes is rejected by the caller.

use serde_json::Value;

/// Try to parse `payload`, applying repairs only if a strict parse fails.
pub fn parse_with_repair(payload: &str) -> Option<Value> {
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    let mut repaired = strip_chrome(trimmed).to_string();
    repaired = coerce_single_quotes(&repaired);
    repaired = strip_trailing_commas(&repaired);
    repaired = balance_quotes(repaired);
    repaired = close_open_scopes(repaired);
    serde_json::from_str::<Value>(&repaired).ok()
}

/// Remove markdown fences and speaker tags wrapping the payload.
pub fn strip_chrome(payload: &str) -> &str {
    let mut s = payload.trim();
    for tag in ["Assistant:", "assistant:", "AI:"] {
        if let Some(rest) = s.strip_prefix(tag) {
            s = rest.trim_start();
        }
    }
    if s.starts_with("```") {
        s = s.trim_start_matches('`');
        for lang in ["json", "JSON"] {
            if let Some(rest) = s.strip_prefix(lang) {
                s = rest;
            }
        }
        s = s.trim_start();
    }
    s.trim_end_matches('`').trim()
}

/// Swap single-quote string delimiters for double quotes outside existing
/// double-quoted strings.
fn coerce_single_quotes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_double = false;
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            out.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => {
                out.push(c);
                escaped = true;
            }
            '"' => {
                out.push(c);
                in_double = !in_double;
            }
            '\'' if !in_double => out.push('"'),
            _ => out.push(c),
        }
    }
    out
}

fn strip_trailing_commas(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    let chars: Vec<char> = s.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        if escaped {
            out.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => {
                out.push(c);
                escaped = true;
            }
            '"' => {
                out.push(c);
                in_string = !in_string;
            }
            ',' if !in_string => {
                // Drop a comma whose next non-whitespace char closes a scope.
                let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Append a closing quote when an odd number of unescaped quotes is left.
fn balance_quotes(s: String) -> String {
    let mut in_string = false;
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            _ => {}
        }
    }
    if in_string {
        let mut s = s;
        s.push('"');
        s
    } else {
        s
    }
}

/// Close unbalanced braces and brackets in nesting order.
fn close_open_scopes(s: String) -> String {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => stack.push('}'),
            '[' if !in_string => stack.push(']'),
            '}' | ']' if !in_string => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }
    if stack.is_empty() {
        return s;
    }
    let mut s = s;
    while let Some(closer) = stack.pop() {
        s.push(closer);
    }
    s
}
