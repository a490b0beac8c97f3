//! Bash-style brace expansion.
//!
//! Handles comma lists (`{a,b,c}`), numeric and alphabetic ranges
//! (`{1..5}`, `{a..e}`, `{1..9..2}`), and nesting. Backslash-escaped braces
//! stay literal, as does a braced word with neither a top-level comma nor a
//! valid range (`a{b}c` does not expand).

/// Expand every brace expression in `text`. A text with no expansion
/// returns a single-element vector containing the input.
pub fn expand(text: &str) -> Vec<String> {
    let Some((open, close)) = find_brace_span(text) else {
        return vec![text.to_string()];
    };

    let inner = &text[open + 1..close];
    let prefix = &text[..open];
    let suffix = &text[close + 1..];

    let items = if let Some(range) = expand_range(inner) {
        range
    } else {
        let parts = split_top_level_commas(inner);
        if parts.len() < 2 {
            // `{word}` without comma or range stays literal; keep scanning
            // the suffix for later expressions.
            return expand(suffix)
                .into_iter()
                .map(|rest| format!("{prefix}{{{inner}}}{rest}"))
                .collect();
        }
        parts
    };

    let mut results = Vec::new();
    for item in items {
        for rest in expand(&format!("{item}{suffix}")) {
            results.push(format!("{prefix}{rest}"));
        }
    }
    results
}

/// First balanced `{…}` span, skipping backslash-escaped braces.
fn find_brace_span(text: &str) -> Option<(usize, usize)> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 1,
            b'{' => {
                let mut depth = 1;
                let mut j = i + 1;
                while j < bytes.len() {
                    match bytes[j] {
                        b'\\' => j += 1,
                        b'{' => depth += 1,
                        b'}' => {
                            depth -= 1;
                            if depth == 0 {
                                return Some((i, j));
                            }
                        }
                        _ => {}
                    }
                    j += 1;
                }
                // Unbalanced: treat the rest as literal.
                return None;
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn split_top_level_commas(inner: &str) -> Vec<String> {
    let chars: Vec<char> = inner.chars().collect();
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                current.push(chars[i]);
                current.push(chars[i + 1]);
                i += 2;
                continue;
            }
            '{' => {
                depth += 1;
                current.push('{');
            }
            '}' => {
                depth = depth.saturating_sub(1);
                current.push('}');
            }
            ',' if depth == 0 => {
                parts.push(std::mem::take(&mut current));
                i += 1;
                continue;
            }
            ch => current.push(ch),
        }
        i += 1;
    }
    parts.push(current);
    parts
}

/// `N..M`, `N..M..S`, `c..d`, `c..d..S` range forms.
fn expand_range(inner: &str) -> Option<Vec<String>> {
    let mut pieces = inner.split("..");
    let start = pieces.next()?;
    let end = pieces.next()?;
    let step_raw = pieces.next();
    if pieces.next().is_some() {
        return None;
    }

    let step = match step_raw {
        Some(raw) => {
            let step: i64 = raw.parse().ok()?;
            if step == 0 { 1 } else { step.abs() }
        }
        None => 1,
    };

    if let (Ok(a), Ok(b)) = (start.parse::<i64>(), end.parse::<i64>()) {
        let width = if (start.len() > 1 && start.starts_with('0'))
            || (end.len() > 1 && end.starts_with('0'))
        {
            start.len().max(end.len())
        } else {
            0
        };
        let mut items = Vec::new();
        let mut n = a;
        if a <= b {
            while n <= b {
                items.push(format!("{n:0width$}"));
                n += step;
            }
        } else {
            while n >= b {
                items.push(format!("{n:0width$}"));
                n -= step;
            }
        }
        return Some(items);
    }

    let (a, b) = (single_alpha(start)?, single_alpha(end)?);
    let (a, b) = (a as i64, b as i64);
    let mut items = Vec::new();
    let mut n = a;
    if a <= b {
        while n <= b {
            items.push(char::from_u32(n as u32)?.to_string());
            n += step;
        }
    } else {
        while n >= b {
            items.push(char::from_u32(n as u32)?.to_string());
            n -= step;
        }
    }
    Some(items)
}

fn single_alpha(raw: &str) -> Option<char> {
    let mut chars = raw.chars();
    let c = chars.next()?;
    if chars.next().is_some() || !c.is_ascii_alphabetic() {
        return None;
    }
    Some(c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comma_list() {
        assert_eq!(expand("echo {a,b,c}"), vec!["echo a", "echo b", "echo c"]);
    }

    #[test]
    fn numeric_range() {
        assert_eq!(expand("{1..4}"), vec!["1", "2", "3", "4"]);
        assert_eq!(expand("{3..1}"), vec!["3", "2", "1"]);
    }

    #[test]
    fn numeric_range_with_step_and_padding() {
        assert_eq!(expand("{1..9..3}"), vec!["1", "4", "7"]);
        assert_eq!(expand("{01..03}"), vec!["01", "02", "03"]);
    }

    #[test]
    fn alpha_range() {
        assert_eq!(expand("{a..d}"), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn nested_expansion() {
        assert_eq!(
            expand("{a,b{1,2}}"),
            vec!["a", "b1", "b2"]
        );
    }

    #[test]
    fn multiple_groups_are_cartesian() {
        assert_eq!(
            expand("{a,b}{1,2}"),
            vec!["a1", "a2", "b1", "b2"]
        );
    }

    #[test]
    fn single_word_brace_stays_literal() {
        assert_eq!(expand("a{b}c"), vec!["a{b}c"]);
        assert_eq!(expand("a{b}c{1,2}"), vec!["a{b}c1", "a{b}c2"]);
    }

    #[test]
    fn escaped_braces_stay_literal() {
        assert_eq!(expand(r"\{a,b\}"), vec![r"\{a,b\}"]);
    }

    #[test]
    fn unbalanced_brace_stays_literal() {
        assert_eq!(expand("echo {a,b"), vec!["echo {a,b"]);
    }

    #[test]
    fn split_and_concatenate_payload() {
        assert_eq!(expand("{b,a}ash"), vec!["bash", "aash"]);
    }
}
