//! Response parsing for validator completions.
//!
//! Models return strict JSON, markdown-fenced JSON, double-braced JSON,
//! prose with embedded JSON, completions behind content-filter prefix tags,
//! and JSON hidden inside `<think>` blocks. The extraction order here is
//! load-bearing: prefix strip → fence → think-block (outside first, then
//! inside) → double-brace normalisation → balanced-brace scan → regex
//! fallback.

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use wardsh_core::{Action, Decision};

use crate::providers::Completion;

/// Why a completion produced no action. These are not actions themselves;
/// the chain folds them into a fail-mode decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseFailure {
    ContentFilter,
    TokenLimit,
    TimeoutError,
    FormatError,
}

impl ParseFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseFailure::ContentFilter => "CONTENT_FILTER",
            ParseFailure::TokenLimit => "TOKEN_LIMIT",
            ParseFailure::TimeoutError => "TIMEOUT_ERROR",
            ParseFailure::FormatError => "FORMAT_ERROR",
        }
    }
}

impl std::fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a completion into a decision, or classify why it failed.
pub fn parse_completion(completion: &Completion) -> Result<Decision, ParseFailure> {
    if completion.content.trim().is_empty() {
        return Err(classify_empty(completion.stop_reason.as_deref()));
    }
    parse_decision(&completion.content).ok_or(ParseFailure::FormatError)
}

/// Empty completions are classified by the provider's stop reason.
fn classify_empty(stop_reason: Option<&str>) -> ParseFailure {
    match stop_reason.map(str::to_ascii_lowercase).as_deref() {
        Some("content_filter") => ParseFailure::ContentFilter,
        Some("max_tokens") | Some("model_length") => ParseFailure::TokenLimit,
        _ => ParseFailure::TimeoutError,
    }
}

#[derive(Deserialize)]
struct RawDecision {
    #[serde(default)]
    action: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Full structured parse: action plus reason and confidence with defaults.
pub fn parse_decision(content: &str) -> Option<Decision> {
    if let Some(json_str) = extract_json_object(content.trim()) {
        if let Ok(raw) = serde_json::from_str::<RawDecision>(&json_str) {
            if let Some(action) = Action::parse(&raw.action) {
                return Some(Decision::new(
                    action,
                    raw.reason.unwrap_or_else(|| "No reason provided".to_string()),
                    raw.confidence.unwrap_or(0.5),
                ));
            }
        }
    }
    // Regex fallback for malformed JSON or prose responses.
    regex_fallback_action(content)
        .map(|action| Decision::new(action, "No reason provided".to_string(), 0.5))
}

/// Action-only extraction, used by callers that don't need the reason.
pub fn extract_action(content: &str) -> Option<Action> {
    parse_decision(content).map(|d| d.action)
}

// ── JSON object extraction ───────────────────────────────────────────────────

fn prefix_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^<\|[^>]+\|>\s*").unwrap())
}

fn fence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*\n?(.*?)\n?\s*```").unwrap())
}

fn think_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>(.*?)</think>").unwrap())
}

fn extract_json_object(text: &str) -> Option<String> {
    // Strip a recognised model prefix token such as <|python_tag|>.
    let text = prefix_regex().replace(text.trim(), "").into_owned();

    // Markdown fence takes precedence over everything around it.
    let text = match fence_regex().captures(&text) {
        Some(caps) => caps[1].trim().to_string(),
        None => text,
    };

    // JSON outside a <think> block wins over JSON inside it.
    if let Some(caps) = think_regex().captures(&text) {
        let outside = think_regex().replace_all(&text, "").into_owned();
        if let Some(found) = find_balanced_json(outside.trim()) {
            return Some(found);
        }
        let inside = caps[1].to_string();
        return find_balanced_json(inside.trim());
    }

    find_balanced_json(&text)
}

/// First balanced `{…}` object, tracking string and escape context.
/// Outermost `{{…}}` is normalised to `{…}` before depth tracking — safe
/// for the flat schema this parser expects.
fn find_balanced_json(text: &str) -> Option<String> {
    if text.trim().is_empty() {
        return None;
    }
    let normalized = text.replace("{{", "{").replace("}}", "}");
    let start = normalized.find('{')?;

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;
    for (i, ch) in normalized[start..].char_indices() {
        if escape {
            escape = false;
            continue;
        }
        match ch {
            '\\' => escape = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(normalized[start..start + i + ch.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

fn action_fallback_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)"action"\s*[}:\s]*\s*"(allow|warn|block)""#).unwrap())
}

fn regex_fallback_action(text: &str) -> Option<Action> {
    action_fallback_regex()
        .captures(text)
        .and_then(|caps| Action::parse(&caps[1]))
}
