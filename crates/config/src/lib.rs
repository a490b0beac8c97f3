//! Two-tier configuration with a startup integrity gate.
//!
//! Security-critical settings (fail-mode, provider allow-list, model chain,
//! binary hashes, …) are read from a root-owned `KEY=VALUE` file in
//! production mode and from the environment in development mode. Operational
//! settings (timeouts, rate limits) come from the environment in either
//! mode. The whole thing is loaded once into an immutable [`Config`] value
//! that is threaded through the rest of the process — no global state.

pub mod integrity;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use wardsh_core::Action;

/// Production config file. Must be owned by uid 0 and not world-writable.
pub const CONFIG_FILE_PATH: &str = "/etc/wardsh/config";

/// The shell wardsh delegates execution to.
pub const SHELL_PATH: &str = "/bin/bash";

/// Installed location of the preload sandbox library. Hardcoded in
/// production mode so the path itself cannot be steered via config.
pub const DEFAULT_SANDBOXER_PATH: &str = "/opt/wardsh/lib/landlock_sandboxer.so";

pub const DEFAULT_PRIMARY_MODEL: &str = "openai/gpt-4o-mini";

pub const DEFAULT_FALLBACK_MODELS: &[&str] = &[
    "anthropic/claude-3-5-haiku-20241022",
    "gemini/gemini-2.0-flash",
    "featherless_ai/meta-llama/Llama-Guard-3-8B",
    "ollama/llama3.1:8b",
];

pub const DEFAULT_ALLOWED_PROVIDERS: &[&str] = &[
    "openai",
    "anthropic",
    "gemini",
    "groq",
    "together_ai",
    "featherless_ai",
    "ollama",
];

const DEFAULT_LLM_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_QUERIES_PER_MINUTE: u32 = 30;
const DEFAULT_RESOLVE_TIMEOUT_SECS: u64 = 3;
const DEFAULT_MAX_RESOLVE_DEPTH: usize = 2;

/// Keys that must come from the config file in production mode. Environment
/// variables are never consulted for these once production mode is active
/// (`WARDSH_MODE` itself is the bootstrap exception, see [`Config::load`]).
pub const SECURITY_CRITICAL_KEYS: &[&str] = &[
    "WARDSH_MODE",
    "WARDSH_FAIL_MODE",
    "WARDSH_ROLE",
    "WARDSH_VAR_CMD_ACTION",
    "WARDSH_ALLOWED_PROVIDERS",
    "WARDSH_PRIMARY_MODEL",
    "WARDSH_FALLBACK_MODELS",
    "WARDSH_SHELL_HASH",
    "WARDSH_SKIP_SHELL_HASH",
    "WARDSH_SANDBOXER_HASH",
    "WARDSH_SANDBOXER_PATH",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid WARDSH_MODE '{0}'. Valid modes: development, production")]
    InvalidMode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Production,
    Development,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Production => "production",
            Mode::Development => "development",
        }
    }
}

/// What to do when every provider fails: block (`Safe`) or warn (`Open`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    Safe,
    Open,
}

impl FailMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailMode::Safe => "safe",
            FailMode::Open => "open",
        }
    }
}

/// Trust level of the operator; appended to the validator system prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Default,
    Sysadmin,
    Restricted,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Default => "default",
            Role::Sysadmin => "sysadmin",
            Role::Restricted => "restricted",
        }
    }
}

/// Immutable configuration snapshot, built once at process start.
///
/// `file` holds the parsed config-file contents (empty when the file is
/// absent or failed its permission check); `env` is a snapshot of the
/// process environment taken at load time.
#[derive(Debug, Clone)]
pub struct Config {
    mode: Mode,
    file: HashMap<String, String>,
    env: HashMap<String, String>,
}

impl Config {
    /// Load configuration from the default production path and the process
    /// environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Path::new(CONFIG_FILE_PATH), std::env::vars().collect())
    }

    /// Load from an explicit file path with an explicit environment
    /// snapshot. The file may be missing; a present file must pass the
    /// ownership/mode check or its contents are ignored with a warning.
    pub fn load_from(path: &Path, env: HashMap<String, String>) -> Result<Self, ConfigError> {
        let file = load_config_file(path);

        // Bootstrap: the file decides the mode first so the integrity gate
        // can protect every other key; the environment is the fallback so
        // production mode is reachable without a config file.
        let raw_mode = file
            .get("WARDSH_MODE")
            .cloned()
            .or_else(|| env.get("WARDSH_MODE").cloned())
            .unwrap_or_default();
        let mode = match raw_mode.trim().to_ascii_lowercase().as_str() {
            "production" => Mode::Production,
            "development" | "" => Mode::Development,
            _ => return Err(ConfigError::InvalidMode(raw_mode)),
        };

        Ok(Self { mode, file, env })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Resolve a security-critical key through the two-tier model.
    ///
    /// Production: config file only; a missing key resolves to `None` (the
    /// caller's hardcoded secure default) with a warning. Development:
    /// environment.
    pub fn get(&self, key: &str) -> Option<String> {
        if self.mode == Mode::Production && SECURITY_CRITICAL_KEYS.contains(&key) {
            if let Some(value) = self.file.get(key) {
                return Some(value.clone());
            }
            warn!(key, "security setting not found in config file; using secure default");
            return None;
        }
        self.env.get(key).cloned()
    }

    /// Resolve an operational (non-security) key. Environment in either mode.
    pub fn operational(&self, key: &str) -> Option<String> {
        self.env.get(key).cloned()
    }

    pub fn fail_mode(&self) -> FailMode {
        let raw = self.get("WARDSH_FAIL_MODE").unwrap_or_default();
        match raw.trim().to_ascii_lowercase().as_str() {
            "safe" => FailMode::Safe,
            "open" => FailMode::Open,
            "" => FailMode::Safe,
            other => {
                debug!(value = other, "invalid WARDSH_FAIL_MODE, falling back to safe");
                FailMode::Safe
            }
        }
    }

    pub fn role(&self) -> Role {
        let raw = self.get("WARDSH_ROLE").unwrap_or_default();
        match raw.trim().to_ascii_lowercase().as_str() {
            "sysadmin" => Role::Sysadmin,
            "restricted" => Role::Restricted,
            "default" | "" => Role::Default,
            other => {
                warn!(value = other, "invalid WARDSH_ROLE, falling back to default");
                Role::Default
            }
        }
    }

    /// Action emitted by the static pre-filter on detection. Block unless
    /// explicitly configured to warn.
    pub fn var_cmd_action(&self) -> Action {
        let raw = self.get("WARDSH_VAR_CMD_ACTION").unwrap_or_default();
        match raw.trim().to_ascii_lowercase().as_str() {
            "warn" => Action::Warn,
            "block" | "" => Action::Block,
            other => {
                debug!(value = other, "invalid WARDSH_VAR_CMD_ACTION, falling back to block");
                Action::Block
            }
        }
    }

    pub fn primary_model(&self) -> String {
        match self.get("WARDSH_PRIMARY_MODEL") {
            Some(model) if !model.trim().is_empty() => model.trim().to_string(),
            _ => DEFAULT_PRIMARY_MODEL.to_string(),
        }
    }

    /// Fallback models, comma-separated. A key that is present but empty
    /// selects single-provider mode (no fallbacks); an absent key selects
    /// the defaults.
    pub fn fallback_models(&self) -> Vec<String> {
        let raw = if self.mode == Mode::Production {
            self.file.get("WARDSH_FALLBACK_MODELS")
        } else {
            self.env.get("WARDSH_FALLBACK_MODELS")
        };
        match raw {
            None => DEFAULT_FALLBACK_MODELS.iter().map(|m| (*m).to_string()).collect(),
            Some(value) if value.trim().is_empty() => Vec::new(),
            Some(value) => value
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(ToString::to_string)
                .collect(),
        }
    }

    /// Primary model followed by fallbacks, duplicates removed, order kept.
    pub fn model_chain(&self) -> Vec<String> {
        let mut chain = vec![self.primary_model()];
        for model in self.fallback_models() {
            if !chain.contains(&model) {
                chain.push(model);
            }
        }
        chain
    }

    pub fn allowed_providers(&self) -> HashSet<String> {
        let raw = self.get("WARDSH_ALLOWED_PROVIDERS").unwrap_or_default();
        if raw.trim().is_empty() {
            return DEFAULT_ALLOWED_PROVIDERS.iter().map(|p| (*p).to_string()).collect();
        }
        let providers: HashSet<String> = raw
            .split(',')
            .map(|p| p.trim().to_ascii_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        if providers.is_empty() {
            DEFAULT_ALLOWED_PROVIDERS.iter().map(|p| (*p).to_string()).collect()
        } else {
            providers
        }
    }

    /// Path of the preload sandbox library. Hardcoded in production mode so
    /// a poisoned setting cannot redirect the preload.
    pub fn sandboxer_path(&self) -> PathBuf {
        if self.mode == Mode::Production {
            return PathBuf::from(DEFAULT_SANDBOXER_PATH);
        }
        match self.get("WARDSH_SANDBOXER_PATH") {
            Some(path) if !path.trim().is_empty() => PathBuf::from(path.trim()),
            _ => PathBuf::from(DEFAULT_SANDBOXER_PATH),
        }
    }

    /// Escape hatch for hosts with automated bash package updates. Affects
    /// the shell hash check only; the sandbox library check has no bypass.
    pub fn skip_shell_hash(&self) -> bool {
        self.get("WARDSH_SKIP_SHELL_HASH")
            .map(|raw| raw.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.positive_operational("WARDSH_LLM_TIMEOUT", DEFAULT_LLM_TIMEOUT_SECS))
    }

    pub fn max_queries_per_minute(&self) -> u32 {
        self.positive_operational("WARDSH_MAX_QUERIES_PER_MINUTE", u64::from(DEFAULT_MAX_QUERIES_PER_MINUTE))
            as u32
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(
            self.positive_operational("WARDSH_RESOLVE_TIMEOUT", DEFAULT_RESOLVE_TIMEOUT_SECS),
        )
    }

    pub fn max_resolve_depth(&self) -> usize {
        self.positive_operational("WARDSH_MAX_RESOLVE_DEPTH", DEFAULT_MAX_RESOLVE_DEPTH as u64) as usize
    }

    /// Whether sensitive-variable redaction applies to the environment
    /// projection used for prompt expansion notes.
    pub fn filter_sensitive_vars(&self) -> bool {
        self.operational("WARDSH_FILTER_SENSITIVE_VARS")
            .map(|raw| matches!(raw.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(false)
    }

    fn positive_operational(&self, key: &str, default: u64) -> u64 {
        match self.operational(key) {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(value) if value > 0 => value,
                _ => {
                    debug!(key, value = raw.as_str(), "invalid operational setting, using default");
                    default
                }
            },
            None => default,
        }
    }
}

// ── Config file loading ──────────────────────────────────────────────────────

/// Parse `KEY=VALUE` lines. `#` comments and blank lines are skipped,
/// malformed lines are ignored, matching surrounding quotes are stripped.
fn parse_config_str(raw: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (line_num, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            debug!(line = line_num + 1, "skipping malformed config line");
            continue;
        };
        let key = key.trim().to_string();
        let mut value = value.trim();
        if value.len() >= 2 {
            let bytes = value.as_bytes();
            if (bytes[0] == b'"' || bytes[0] == b'\'') && bytes[0] == bytes[value.len() - 1] {
                value = &value[1..value.len() - 1];
            }
        }
        map.insert(key, value.to_string());
    }
    map
}

/// Ownership/mode policy for the config file: root-owned, not world-writable.
fn permissions_ok(uid: u32, mode_bits: u32) -> Result<(), String> {
    if uid != 0 {
        return Err(format!(
            "not owned by root (owned by uid {uid}). Fix with: sudo chown root:root <file>"
        ));
    }
    if mode_bits & 0o002 != 0 {
        return Err("world-writable. Fix with: sudo chmod o-w <file>".to_string());
    }
    Ok(())
}

fn load_config_file(path: &Path) -> HashMap<String, String> {
    use std::os::unix::fs::MetadataExt;

    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(_) => return HashMap::new(),
    };

    if let Err(err) = permissions_ok(metadata.uid(), metadata.mode()) {
        warn!(path = %path.display(), %err, "config file permission check failed; ignoring file");
        return HashMap::new();
    }

    match fs::read_to_string(path) {
        Ok(raw) => parse_config_str(&raw),
        Err(err) => {
            warn!(path = %path.display(), %err, "failed to read config file");
            HashMap::new()
        }
    }
}
