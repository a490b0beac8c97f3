//! Append-only audit trail of validation decisions.
//!
//! One JSON object per line with a fixed field set: `timestamp`, `user`,
//! `command`, `action`, `reason`, `confidence`, `source`, `model`.
//! Production writes under `/var/log/wardsh` (root-owned directory);
//! development falls back to `~/.wardsh`, best-effort. Audit failures warn
//! once and never interrupt command processing.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use wardsh_config::{Config, Mode};
use wardsh_core::{Decision, DecisionSource};

pub const PRODUCTION_AUDIT_DIR: &str = "/var/log/wardsh";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub timestamp: String,
    pub user: String,
    pub command: String,
    pub action: String,
    pub reason: String,
    pub confidence: f64,
    pub source: String,
    pub model: String,
}

/// The audit log handle, opened once at startup. `writer` is `None` when
/// audit logging is unavailable; entries are then dropped silently after a
/// single startup warning.
pub struct AuditLog {
    writer: Option<File>,
    write_warned: bool,
}

impl AuditLog {
    /// Open the audit log for the configured mode. Never fails: an
    /// unavailable log produces a warning and a disabled handle.
    pub fn init(config: &Config) -> Self {
        let path = match config.mode() {
            Mode::Production => {
                let dir = Path::new(PRODUCTION_AUDIT_DIR);
                if !dir.is_dir() {
                    warn!(dir = PRODUCTION_AUDIT_DIR, "audit directory missing; audit logging unavailable");
                    return Self::disabled();
                }
                dir.join("audit.log")
            }
            Mode::Development => {
                let Some(home) = std::env::var_os("HOME") else {
                    warn!("HOME not set; audit logging unavailable");
                    return Self::disabled();
                };
                let dir = PathBuf::from(home).join(".wardsh");
                if let Err(err) = std::fs::create_dir_all(&dir) {
                    warn!(%err, "cannot create audit directory; audit logging unavailable");
                    return Self::disabled();
                }
                dir.join("audit.log")
            }
        };
        Self::open_at(&path)
    }

    /// Open (or create) the audit file at an explicit path.
    pub fn open_at(path: &Path) -> Self {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Self {
                writer: Some(file),
                write_warned: false,
            },
            Err(err) => {
                warn!(path = %path.display(), %err, "cannot open audit log; audit logging unavailable");
                Self::disabled()
            }
        }
    }

    pub fn disabled() -> Self {
        Self {
            writer: None,
            write_warned: false,
        }
    }

    pub fn is_available(&self) -> bool {
        self.writer.is_some()
    }

    /// Record a validation decision.
    pub fn log_validation(
        &mut self,
        command: &str,
        decision: &Decision,
        source: DecisionSource,
        model: &str,
    ) {
        let entry = AuditEntry {
            timestamp: Utc::now().to_rfc3339(),
            user: current_user(),
            command: command.to_string(),
            action: decision.action.as_str().to_string(),
            reason: decision.reason.clone(),
            confidence: decision.confidence,
            source: source.as_str().to_string(),
            model: model.to_string(),
        };
        self.append(&entry);
    }

    /// Record an operator overriding a WARN decision.
    pub fn log_warn_override(&mut self, command: &str, original_reason: &str) {
        let entry = AuditEntry {
            timestamp: Utc::now().to_rfc3339(),
            user: current_user(),
            command: command.to_string(),
            action: "warn_overridden".to_string(),
            reason: original_reason.to_string(),
            confidence: 0.0,
            source: DecisionSource::UserOverride.as_str().to_string(),
            model: String::new(),
        };
        self.append(&entry);
    }

    fn append(&mut self, entry: &AuditEntry) {
        let Some(file) = self.writer.as_mut() else {
            return;
        };
        let Ok(line) = serde_json::to_string(entry) else {
            return;
        };
        let result = writeln!(file, "{line}").and_then(|_| file.flush());
        if result.is_err() && !self.write_warned {
            self.write_warned = true;
            warn!("failed to write audit log entry; further failures are silent");
        }
    }
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wardsh_core::Action;

    fn read_entries(path: &Path) -> Vec<AuditEntry> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn validation_entry_has_exact_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let mut log = AuditLog::open_at(&path);
        log.log_validation(
            "rm -rf /",
            &Decision::block("Destructive filesystem command", 0.98),
            DecisionSource::Validation,
            "openai/gpt-4o-mini",
        );

        let raw = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        let object = value.as_object().unwrap();
        let mut keys: Vec<&str> = object.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            vec!["action", "command", "confidence", "model", "reason", "source", "timestamp", "user"]
        );
        assert_eq!(object["action"], "block");
        assert_eq!(object["source"], "validation");
        assert_eq!(object["model"], "openai/gpt-4o-mini");
        // RFC 3339 timestamps parse back.
        assert!(chrono::DateTime::parse_from_rfc3339(object["timestamp"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn entries_append_one_per_line_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let mut log = AuditLog::open_at(&path);
        log.log_validation("echo one", &Decision::allow("Safe", 0.9), DecisionSource::Validation, "m");
        log.log_validation(
            "a=ba; b=sh; $a$b",
            &Decision::block("Variable expansion in command position", 1.0),
            DecisionSource::StaticBlocklist,
            "",
        );

        let entries = read_entries(&path);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].command, "echo one");
        assert_eq!(entries[1].source, "static_blocklist");
        assert_eq!(entries[1].model, "");
    }

    #[test]
    fn warn_override_entry_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let mut log = AuditLog::open_at(&path);
        log.log_warn_override("chmod 777 /srv", "Excessive permissions");

        let entries = read_entries(&path);
        assert_eq!(entries[0].action, "warn_overridden");
        assert_eq!(entries[0].source, "user_override");
        assert_eq!(entries[0].confidence, 0.0);
        assert_eq!(entries[0].reason, "Excessive permissions");
    }

    #[test]
    fn disabled_log_drops_entries_quietly() {
        let mut log = AuditLog::disabled();
        assert!(!log.is_available());
        log.log_validation("echo hi", &Decision::allow("Safe", 1.0), DecisionSource::Validation, "");
    }

    #[test]
    fn unopenable_path_disables_logging() {
        let log = AuditLog::open_at(Path::new("/nonexistent-dir/audit.log"));
        assert!(!log.is_available());
    }

    #[test]
    fn entry_roundtrips_through_serde() {
        let entry = AuditEntry {
            timestamp: Utc::now().to_rfc3339(),
            user: "op".into(),
            command: "ls".into(),
            action: Action::Allow.as_str().into(),
            reason: "Safe".into(),
            confidence: 0.9,
            source: "validation".into(),
            model: "m".into(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        let back: AuditEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
