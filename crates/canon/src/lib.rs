//! Command canonicalization.
//!
//! Pure text transforms that normalise a shell command into the form bash
//! will actually execute, before any validation happens. Nothing here
//! touches a subprocess; the only I/O is read-only glob matching.
//!
//! Transforms, in bash expansion order:
//! 1. ANSI-C quote resolution (`$'\xHH'`, `$'\uHHHH'`, named escapes)
//! 2. Quote normalization (`ba""sh` → `bash`)
//! 3. Backtick → `$()` conversion
//! 4. Brace expansion (`{a,b}` → variants)
//! 5. Glob resolution (wildcards → matched paths)
//! 6. Here-string extraction (`<<<`)
//!
//! Transforms that cannot proceed annotate and pass through; a parse
//! failure inside a transform leaves that transform's input unchanged.

mod braces;

use std::sync::OnceLock;

use regex::{Captures, Regex};
use tracing::debug;

/// Brace expansions beyond this count are annotated (but all kept).
const BRACE_VARIANT_LIMIT: usize = 64;

/// Glob matches per token beyond this count are truncated and annotated.
const GLOB_MATCH_LIMIT: usize = 64;

/// Result of canonicalizing one command. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CanonicalCommand {
    /// The raw operator input.
    pub original: String,
    /// Canonical command text; what the shell will execute.
    pub text: String,
    /// Remaining brace-expansion variants (the first became `text`).
    pub variants: Vec<String>,
    /// Bodies extracted from `<<<` here-strings.
    pub here_strings: Vec<String>,
    /// Tags recording lossy or failed transforms.
    pub annotations: Vec<String>,
}

/// Canonicalize a shell command through the pure transform pipeline.
pub fn canonicalize(command: &str) -> CanonicalCommand {
    let mut result = CanonicalCommand {
        original: command.to_string(),
        text: command.to_string(),
        ..CanonicalCommand::default()
    };

    result.text = resolve_ansi_c_quotes(&result.text, &mut result.annotations);
    result.text = normalize_quotes(&result.text, &mut result.annotations);
    result.text = convert_backticks(&result.text);
    expand_braces(&mut result);
    result.text = resolve_globs(&result.text, &mut result.annotations);
    result.here_strings = extract_here_strings(&result.text);

    result
}

// ── Step 1: ANSI-C quote resolution ──────────────────────────────────────────

fn ansi_c_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$'([^'\\]*(?:\\.[^'\\]*)*)'").unwrap())
}

fn ansi_escape_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"\\(?:x([0-9a-fA-F]{1,2})|([0-7]{1,3})|u([0-9a-fA-F]{4})|U([0-9a-fA-F]{8})|([abeEfnrtv\\'"?]))"#,
        )
        .unwrap()
    })
}

fn decode_escape(caps: &Captures<'_>) -> Option<String> {
    if let Some(hex) = caps.get(1) {
        let code = u32::from_str_radix(hex.as_str(), 16).ok()?;
        return Some(char::from_u32(code)?.to_string());
    }
    if let Some(oct) = caps.get(2) {
        let code = u32::from_str_radix(oct.as_str(), 8).ok()?;
        return Some(char::from_u32(code)?.to_string());
    }
    if let Some(hex) = caps.get(3).or_else(|| caps.get(4)) {
        let code = u32::from_str_radix(hex.as_str(), 16).ok()?;
        return Some(char::from_u32(code)?.to_string());
    }
    let named = caps.get(5)?.as_str();
    Some(
        match named {
            "a" => "\x07",
            "b" => "\x08",
            "e" | "E" => "\x1b",
            "f" => "\x0c",
            "n" => "\n",
            "r" => "\r",
            "t" => "\t",
            "v" => "\x0b",
            "\\" => "\\",
            "'" => "'",
            "\"" => "\"",
            "?" => "?",
            _ => return None,
        }
        .to_string(),
    )
}

/// Resolve one `$'…'` string to its literal content.
///
/// If the decoded content contains `$` or a backtick it is re-wrapped in
/// single quotes (internal quotes escaped via `'\''`) so that a literal
/// `$'$(cmd)'` never becomes an executable `$(cmd)`.
fn resolve_single_ansi_c(caps: &Captures<'_>) -> String {
    let body = &caps[1];
    let mut failed = false;
    let resolved = ansi_escape_regex()
        .replace_all(body, |inner: &Captures<'_>| match decode_escape(inner) {
            Some(decoded) => decoded,
            None => {
                failed = true;
                inner[0].to_string()
            }
        })
        .into_owned();
    if failed {
        return caps[0].to_string();
    }
    if resolved.contains('$') || resolved.contains('`') {
        let escaped = resolved.replace('\'', "'\\''");
        return format!("'{escaped}'");
    }
    resolved
}

fn resolve_ansi_c_quotes(text: &str, annotations: &mut Vec<String>) -> String {
    if !text.contains("$'") {
        return text.to_string();
    }
    let resolved = ansi_c_regex()
        .replace_all(text, |caps: &Captures<'_>| resolve_single_ansi_c(caps))
        .into_owned();
    if resolved != text {
        debug!("resolved ANSI-C quoting");
    }
    // Unmatched $' remnants survive the regex; record the partial resolve.
    if resolved.contains("$'") {
        annotations.push("ANSI_C_PARTIAL".to_string());
    }
    resolved
}

// ── Step 2: Quote normalization ──────────────────────────────────────────────

const SHELL_METACHARS: &[char] = &['$', '`', '{', '|', ';', '&', '<', '>', '*', '?'];

/// Split and rejoin with minimal quoting so `ba""sh` becomes `bash`.
///
/// Any shell metacharacter disables this step; rejoining would quote the
/// metacharacter and change what the shell executes.
fn normalize_quotes(text: &str, annotations: &mut Vec<String>) -> String {
    if text.contains(SHELL_METACHARS) {
        return text.to_string();
    }
    match shell_words::split(text) {
        Ok(tokens) => shell_words::join(tokens.iter().map(String::as_str)),
        Err(_) => {
            annotations.push("QUOTE_NORM_FAILED".to_string());
            text.to_string()
        }
    }
}

// ── Step 3: Backtick → $() conversion ────────────────────────────────────────

fn backtick_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("`([^`]*)`").unwrap())
}

/// Rewrite non-nested backtick substitutions to `$()` form. Nested
/// backticks need escaped inner backticks and are rare; they pass through.
fn convert_backticks(text: &str) -> String {
    if !text.contains('`') {
        return text.to_string();
    }
    backtick_regex().replace_all(text, "$$($1)").into_owned()
}

// ── Step 4: Brace expansion ──────────────────────────────────────────────────

fn expand_braces(result: &mut CanonicalCommand) {
    if !result.text.contains('{') {
        return;
    }
    let variants = braces::expand(&result.text);
    if variants.len() <= 1 {
        return;
    }
    if variants.len() > BRACE_VARIANT_LIMIT {
        result.annotations.push("BRACE_LIMIT_EXCEEDED".to_string());
    }
    let mut iter = variants.into_iter();
    if let Some(primary) = iter.next() {
        result.text = primary;
    }
    result.variants = iter.collect();
}

// ── Step 5: Glob resolution ──────────────────────────────────────────────────

fn has_glob_meta(token: &str) -> bool {
    token.contains(['*', '?', '['])
}

/// Resolve glob tokens against the filesystem. Non-matching globs are left
/// verbatim (bash behaviour); oversized match sets are truncated and
/// annotated so downstream consumers know the full scope.
fn resolve_globs(text: &str, annotations: &mut Vec<String>) -> String {
    if !text.contains(['*', '?', '[']) {
        return text.to_string();
    }
    let Ok(tokens) = shell_words::split(text) else {
        return text.to_string();
    };

    let mut resolved = Vec::with_capacity(tokens.len());
    let mut changed = false;
    for token in tokens {
        if !has_glob_meta(&token) {
            resolved.push(token);
            continue;
        }
        let matches: Vec<String> = match glob::glob(&token) {
            Ok(paths) => {
                let mut found: Vec<String> = paths
                    .filter_map(Result::ok)
                    .map(|p| p.display().to_string())
                    .collect();
                found.sort();
                found
            }
            Err(_) => Vec::new(),
        };
        if matches.is_empty() {
            resolved.push(token);
            continue;
        }
        changed = true;
        if matches.len() > GLOB_MATCH_LIMIT {
            annotations.push(format!("GLOB_EXPANSION_CAPPED:{}", matches.len()));
            debug!(pattern = token.as_str(), total = matches.len(), "glob expansion truncated");
            resolved.extend(matches.into_iter().take(GLOB_MATCH_LIMIT));
        } else {
            resolved.extend(matches);
        }
    }

    if !changed {
        return text.to_string();
    }
    shell_words::join(resolved.iter().map(String::as_str))
}

// ── Step 6: Here-string extraction ───────────────────────────────────────────

fn here_string_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"<<<\s*(?:'([^']*)'|"([^"]*)"|(\S+))"#).unwrap())
}

/// Copy `<<<` bodies out of the command. The canonical text keeps the
/// `<<<` structure so bash still executes it correctly.
fn extract_here_strings(text: &str) -> Vec<String> {
    if !text.contains("<<<") {
        return Vec::new();
    }
    here_string_regex()
        .captures_iter(text)
        .filter_map(|caps| {
            caps.get(1)
                .or_else(|| caps.get(2))
                .or_else(|| caps.get(3))
                .map(|m| m.as_str().to_string())
        })
        .filter(|body| !body.is_empty())
        .collect()
}
