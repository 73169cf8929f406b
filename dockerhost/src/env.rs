//! `$var` interpolation for step environment and command arguments.
//!
//! Expansion is a pure function over a fully-merged map: callers build
//! the map first (run environment, step environment, per-instance
//! synthetic keys) and interpolate before any daemon call is made.

use std::collections::BTreeMap;

/// Expand `$name` and `${name}` references in `template` against
/// `vars`. Unknown references are left verbatim; `$$` yields a
/// literal `$`.
pub fn interpolate(template: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((_, ch)) = chars.next() {
        if ch != '$' {
            out.push(ch);
            continue;
        }
        match chars.peek() {
            Some((_, '$')) => {
                chars.next();
                out.push('$');
            }
            Some((_, '{')) => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                while let Some((_, c)) = chars.next() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                match vars.get(&name) {
                    Some(value) if closed => out.push_str(value),
                    _ => {
                        out.push_str("${");
                        out.push_str(&name);
                        if closed {
                            out.push('}');
                        }
                    }
                }
            }
            Some((_, c)) if is_name_char(*c) => {
                let mut name = String::new();
                while let Some((_, c)) = chars.peek() {
                    if !is_name_char(*c) {
                        break;
                    }
                    name.push(*c);
                    chars.next();
                }
                match vars.get(&name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('$');
                        out.push_str(&name);
                    }
                }
            }
            _ => out.push('$'),
        }
    }
    out
}

/// Expand every value of `map` against `vars`
pub fn interpolate_all(
    map: &BTreeMap<String, String>,
    vars: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    map.iter()
        .map(|(name, value)| (name.clone(), interpolate(value, vars)))
        .collect()
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
