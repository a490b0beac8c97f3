use serde::{Deserialize, Serialize};

// ── Decision model ───────────────────────────────────────────────────────────

/// Terminal action of a validation decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Warn,
    Block,
}

impl Action {
    /// Parse an action string case-insensitively.
    ///
    /// Returns `None` for anything outside the three-valued set so callers
    /// can fall back to their own policy (the decision loop treats unknown
    /// actions as WARN).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "allow" => Some(Action::Allow),
            "warn" => Some(Action::Warn),
            "block" => Some(Action::Block),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::Warn => "warn",
            Action::Block => "block",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validation decision: what to do with a command, why, and how sure.
///
/// Never mutated after construction. `confidence` is clamped to `[0, 1]`
/// by every constructor, so downstream consumers can rely on the range.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub action: Action,
    pub reason: String,
    pub confidence: f64,
}

impl Decision {
    pub fn new(action: Action, reason: impl Into<String>, confidence: f64) -> Self {
        Self {
            action,
            reason: reason.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    pub fn allow(reason: impl Into<String>, confidence: f64) -> Self {
        Self::new(Action::Allow, reason, confidence)
    }

    pub fn warn(reason: impl Into<String>, confidence: f64) -> Self {
        Self::new(Action::Warn, reason, confidence)
    }

    pub fn block(reason: impl Into<String>, confidence: f64) -> Self {
        Self::new(Action::Block, reason, confidence)
    }
}

/// Where a decision came from, for the audit trail.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Validation,
    StaticBlocklist,
    UserOverride,
}

impl DecisionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionSource::Validation => "validation",
            DecisionSource::StaticBlocklist => "static_blocklist",
            DecisionSource::UserOverride => "user_override",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_parse_case_insensitive() {
        assert_eq!(Action::parse("ALLOW"), Some(Action::Allow));
        assert_eq!(Action::parse("Warn"), Some(Action::Warn));
        assert_eq!(Action::parse("  block "), Some(Action::Block));
        assert_eq!(Action::parse("deny"), None);
        assert_eq!(Action::parse(""), None);
    }

    #[test]
    fn decision_clamps_confidence() {
        assert_eq!(Decision::allow("ok", 1.7).confidence, 1.0);
        assert_eq!(Decision::block("bad", -0.3).confidence, 0.0);
        assert_eq!(Decision::warn("hm", 0.5).confidence, 0.5);
    }

    #[test]
    fn decision_serde_roundtrip() {
        let d = Decision::block("Destructive command", 0.95);
        let json = serde_json::to_string(&d).unwrap();
        let back: Decision = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn action_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Action::Block).unwrap(), "\"block\"");
        let back: Action = serde_json::from_str("\"allow\"").unwrap();
        assert_eq!(back, Action::Allow);
    }

    #[test]
    fn source_strings_match_audit_contract() {
        assert_eq!(DecisionSource::Validation.as_str(), "validation");
        assert_eq!(DecisionSource::StaticBlocklist.as_str(), "static_blocklist");
        assert_eq!(DecisionSource::UserOverride.as_str(), "user_override");
    }
}
